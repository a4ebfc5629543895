use std::collections::BTreeMap;

use crate::memory::allocator::{AllocRequest, Allocation, RangeAllocator};
use crate::memory::heap::HeapAllocator;
use crate::memory::liveness::Lifetime;
use crate::memory::range::Range;
use crate::model::{round_up, TensorId};

/// Memory of a persistent output tensor lent out while the tensor is dead
#[derive(Debug, Clone)]
struct OutputBuffer {
    owner: TensorId,
    lifetime: Lifetime,
    heap: HeapAllocator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Buffer(usize),
    Workspace,
}

/// Reuses the buffers of persistent output tensors for temporaries.
///
/// An output tensor's buffer holds no data before the tensor is produced,
/// so a temporary whose lifetime does not intersect the owner's can live
/// inside it. Requests without a lifetime, or that no buffer can take, go
/// to the workspace allocator.
#[derive(Debug, Clone)]
pub struct OutputBufferAllocator<A: RangeAllocator + Clone> {
    name: String,
    workspace: A,
    buffers: Vec<OutputBuffer>,
    holders: BTreeMap<u64, Holder>,
}

impl<A: RangeAllocator + Clone + 'static> OutputBufferAllocator<A> {
    /// Wrap `workspace`; no buffer is lent until `add_output_buffer`
    pub fn new(workspace: A) -> Self {
        Self {
            name: format!("{}/outputs", workspace.name()),
            workspace,
            buffers: Vec::new(),
            holders: BTreeMap::new(),
        }
    }

    /// Allocator serving requests no buffer can take
    pub fn workspace(&self) -> &A {
        &self.workspace
    }

    /// Mutable access to the fallback allocator
    pub fn workspace_mut(&mut self) -> &mut A {
        &mut self.workspace
    }

    /// Lend the memory `range` of output tensor `owner`, live during `lifetime`
    pub fn add_output_buffer(&mut self, owner: TensorId, range: Range, lifetime: Lifetime) {
        if range.is_empty() {
            return;
        }
        let mut heap = HeapAllocator::first_fit(&format!("output{}", owner), false);
        heap.init(range.size, range.base);
        log::debug!("{}: output tensor {} lends {} during steps outside {}", self.name, owner, range, lifetime);
        self.buffers.push(OutputBuffer { owner, lifetime, heap });
    }

    /// Number of output buffers registered
    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer that would serve a request of `size` bytes during `lifetime`:
    /// the smallest buffer with enough contiguous space whose owner is dead
    fn select_buffer(&self, size: u64, lifetime: &Lifetime) -> Option<usize> {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.lifetime.intersects(lifetime) && b.heap.max_free_contiguous() >= size)
            .min_by_key(|(i, b)| (b.heap.size(), *i))
            .map(|(i, _)| i)
    }
}

impl<A: RangeAllocator + Clone + 'static> RangeAllocator for OutputBufferAllocator<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, size: u64, base: u64) {
        self.buffers.clear();
        self.holders.clear();
        self.workspace.init(size, base);
    }

    fn allocate(&mut self, request: &AllocRequest) -> Option<Allocation> {
        let granted = self.workspace.allocate(request)?;
        if granted.size > 0 {
            self.holders.insert(granted.address, Holder::Workspace);
        }
        Some(granted)
    }

    fn allocate_with_lifetime(&mut self, request: &AllocRequest, lifetime: Lifetime) -> Option<Allocation> {
        let needed = round_up(request.size + request.offset, request.alignment);
        if request.requested_address.is_none() && needed > 0 {
            if let Some(index) = self.select_buffer(needed, &lifetime) {
                let quiet = request.allow_failure(true);
                if let Some(granted) = self.buffers[index].heap.allocate(&quiet) {
                    log::debug!(
                        "{}: 0x{:x} bytes at 0x{:x} borrowed from output tensor {}",
                        self.name,
                        granted.size,
                        granted.address,
                        self.buffers[index].owner
                    );
                    self.holders.insert(granted.address, Holder::Buffer(index));
                    return Some(granted);
                }
            }
        }
        self.allocate(request)
    }

    fn free(&mut self, address: u64) -> u64 {
        let holder = self.holders.remove(&address).unwrap_or_else(|| {
            panic!("{}: attempt to free non-existent allocation at address 0x{:x}", self.name, address)
        });
        match holder {
            Holder::Buffer(index) => self.buffers[index].heap.free(address),
            Holder::Workspace => self.workspace.free(address),
        }
    }

    fn is_allocated(&self, address: u64) -> bool {
        self.holders.contains_key(&address)
    }

    fn max_free_contiguous(&self) -> u64 {
        self.workspace.max_free_contiguous()
    }

    fn currently_used(&self) -> u64 {
        self.workspace.currently_used()
    }

    fn size(&self) -> u64 {
        self.workspace.size()
    }

    fn base(&self) -> u64 {
        self.workspace.base()
    }

    fn box_clone(&self) -> Box<dyn RangeAllocator> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> OutputBufferAllocator<HeapAllocator> {
        let mut workspace = HeapAllocator::first_fit("slow", false);
        workspace.init(1 << 16, 0);
        let mut alloc = OutputBufferAllocator::new(workspace);
        // Two outputs produced late in the schedule
        let big = alloc.workspace_mut().allocate(&AllocRequest::new(4096)).unwrap();
        let small = alloc.workspace_mut().allocate(&AllocRequest::new(1024)).unwrap();
        alloc.add_output_buffer(10, Range::new(big.address, big.size), Lifetime::new(8, 9));
        alloc.add_output_buffer(11, Range::new(small.address, small.size), Lifetime::new(6, 9));
        alloc
    }

    #[test]
    fn test_dead_output_buffer_is_reused() {
        let mut alloc = allocator();
        let used = alloc.currently_used();

        // Fits both buffers: the smaller one wins
        let a = alloc
            .allocate_with_lifetime(&AllocRequest::new(512), Lifetime::new(0, 3))
            .unwrap();
        assert_eq!(a.address, 4096);
        // Only the big buffer is dead at step 7
        let b = alloc
            .allocate_with_lifetime(&AllocRequest::new(512), Lifetime::new(5, 7))
            .unwrap();
        assert_eq!(b.address, 0);
        assert_eq!(alloc.currently_used(), used);

        assert_eq!(alloc.free(a.address), 512);
        assert_eq!(alloc.free(b.address), 512);
    }

    #[test]
    fn test_live_owner_falls_back_to_workspace() {
        let mut alloc = allocator();
        let a = alloc
            .allocate_with_lifetime(&AllocRequest::new(512), Lifetime::new(2, 8))
            .unwrap();
        assert_eq!(a.address, 5120);
        assert!(alloc.is_allocated(a.address));
        alloc.free(a.address);
        assert!(!alloc.is_allocated(a.address));

        // Too large for any buffer
        let b = alloc
            .allocate_with_lifetime(&AllocRequest::new(8192), Lifetime::new(0, 1))
            .unwrap();
        assert_eq!(b.address, 5120);
    }
}
