use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::memory::heap::HeapAllocator;
use crate::memory::liveness::Lifetime;
use crate::memory::policy::{BestFit, FirstFit};

/// A request for address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    /// Bytes of payload
    pub size: u64,
    /// Alignment of the allocation base
    pub alignment: u64,
    /// Bytes reserved in front of the returned address
    pub offset: u64,
    /// Failure is an expected outcome (logged quietly)
    pub allow_failure: bool,
    /// Exact address the caller wants, bypassing the placement policy
    pub requested_address: Option<u64>,
}

impl AllocRequest {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            alignment: 1,
            offset: 0,
            allow_failure: false,
            requested_address: None,
        }
    }

    pub fn aligned(mut self, alignment: u64) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    pub fn at(mut self, address: u64) -> Self {
        self.requested_address = Some(address);
        self
    }
}

/// A granted allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Address handed to the caller (base + padding + offset)
    pub address: u64,
    /// Bytes actually taken from the address space, padding included
    pub size: u64,
}

/// Allocator of byte ranges out of one address space.
///
/// Running out of space is reported as `None`. Freeing an address that is
/// not currently allocated is a caller bug and panics.
pub trait RangeAllocator: Send {
    /// Allocator name (diagnostics only)
    fn name(&self) -> &str;

    /// (Re)initialize the allocator over `[base, base + size)`
    fn init(&mut self, size: u64, base: u64);

    /// Allocate a range.
    ///
    /// A request of zero bytes with no offset takes no memory: it is granted
    /// at the base (or the requested address) with size 0 and is not freed.
    fn allocate(&mut self, request: &AllocRequest) -> Option<Allocation>;

    /// Allocate a range for a tensor that lives during `lifetime`
    fn allocate_with_lifetime(&mut self, request: &AllocRequest, _lifetime: Lifetime) -> Option<Allocation> {
        self.allocate(request)
    }

    /// Release the allocation made at `address`, returning its size
    fn free(&mut self, address: u64) -> u64;

    /// Whether `address` is the address of a live allocation
    fn is_allocated(&self, address: u64) -> bool;

    /// Size of the largest contiguous free range
    fn max_free_contiguous(&self) -> u64;

    /// Bytes currently allocated
    fn currently_used(&self) -> u64;

    /// Size of the managed address space
    fn size(&self) -> u64;

    /// First address of the managed address space
    fn base(&self) -> u64;

    /// Deep copy for dry runs
    fn box_clone(&self) -> Box<dyn RangeAllocator>;
}

impl fmt::Debug for dyn RangeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeAllocator")
            .field("name", &self.name())
            .field("base", &self.base())
            .field("size", &self.size())
            .field("used", &self.currently_used())
            .finish()
    }
}

impl Clone for Box<dyn RangeAllocator> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

impl RangeAllocator for Box<dyn RangeAllocator> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn init(&mut self, size: u64, base: u64) {
        (**self).init(size, base)
    }

    fn allocate(&mut self, request: &AllocRequest) -> Option<Allocation> {
        (**self).allocate(request)
    }

    fn allocate_with_lifetime(&mut self, request: &AllocRequest, lifetime: Lifetime) -> Option<Allocation> {
        (**self).allocate_with_lifetime(request, lifetime)
    }

    fn free(&mut self, address: u64) -> u64 {
        (**self).free(address)
    }

    fn is_allocated(&self, address: u64) -> bool {
        (**self).is_allocated(address)
    }

    fn max_free_contiguous(&self) -> u64 {
        (**self).max_free_contiguous()
    }

    fn currently_used(&self) -> u64 {
        (**self).currently_used()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn base(&self) -> u64 {
        (**self).base()
    }

    fn box_clone(&self) -> Box<dyn RangeAllocator> {
        (**self).box_clone()
    }
}

/// Placement policy selection for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    /// First fit, restarting at the lowest address
    FirstFit,
    /// First fit with a rotating cursor
    Cyclic,
    /// Best fit over a size index
    BestFit,
}

/// Create a heap allocator with the requested placement policy
pub fn create_allocator(kind: PlacementKind, name: &str) -> Box<dyn RangeAllocator> {
    match kind {
        PlacementKind::FirstFit => Box::new(HeapAllocator::with_policy(name, FirstFit::new(false))),
        PlacementKind::Cyclic => Box::new(HeapAllocator::with_policy(name, FirstFit::cyclic())),
        PlacementKind::BestFit => Box::new(HeapAllocator::with_policy(name, BestFit::new())),
    }
}

/// Allocator shared between call sites, locked for the duration of each
/// public call.
///
/// Dry runs must not go through the shared instance: take a `snapshot`
/// and mutate that instead.
pub struct SharedAllocator<A: RangeAllocator> {
    name: String,
    inner: Arc<Mutex<A>>,
}

impl<A: RangeAllocator> Clone for SharedAllocator<A> {
    /// Another handle to the same allocator
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: RangeAllocator + Clone + 'static> SharedAllocator<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            name: allocator.name().to_string(),
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, A> {
        // A panic while holding the lock already aborted compilation
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Unshared deep copy of the current allocator state
    pub fn snapshot(&self) -> A {
        self.lock().clone()
    }

    /// Run `f` with exclusive access to the allocator
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<A: RangeAllocator + Clone + 'static> RangeAllocator for SharedAllocator<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, size: u64, base: u64) {
        self.lock().init(size, base)
    }

    fn allocate(&mut self, request: &AllocRequest) -> Option<Allocation> {
        self.lock().allocate(request)
    }

    fn allocate_with_lifetime(&mut self, request: &AllocRequest, lifetime: Lifetime) -> Option<Allocation> {
        self.lock().allocate_with_lifetime(request, lifetime)
    }

    fn free(&mut self, address: u64) -> u64 {
        self.lock().free(address)
    }

    fn is_allocated(&self, address: u64) -> bool {
        self.lock().is_allocated(address)
    }

    fn max_free_contiguous(&self) -> u64 {
        self.lock().max_free_contiguous()
    }

    fn currently_used(&self) -> u64 {
        self.lock().currently_used()
    }

    fn size(&self) -> u64 {
        self.lock().size()
    }

    fn base(&self) -> u64 {
        self.lock().base()
    }

    fn box_clone(&self) -> Box<dyn RangeAllocator> {
        Box::new(self.snapshot())
    }
}
