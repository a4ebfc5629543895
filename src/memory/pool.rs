use std::collections::BTreeMap;

use crate::memory::allocator::{AllocRequest, Allocation, RangeAllocator};

/// A block carved from the backing allocator and owned by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolBlock {
    /// Block size of the owning pool
    block_size: u64,
    /// Bytes the backing allocator granted for the block
    granted: u64,
    in_use: bool,
}

/// Idle blocks of one block size, most recently returned last
#[derive(Debug, Clone, Default)]
struct IdleList {
    blocks: Vec<u64>,
}

impl IdleList {
    fn take(&mut self, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(1);
        let pos = self.blocks.iter().rposition(|addr| addr % alignment == 0)?;
        Some(self.blocks.swap_remove(pos))
    }

    fn put(&mut self, address: u64) {
        self.blocks.push(address);
    }

    fn drain(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.blocks)
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Whether a request may be served from a pool block at all
fn poolable(request: &AllocRequest) -> bool {
    request.offset == 0 && request.requested_address.is_none() && request.size > 0
}

/// Fixed-size block pool in front of a backing allocator.
///
/// Freed blocks stay in the pool until `release_idle` hands them back.
/// Requests larger than the block size go straight to the backing
/// allocator.
#[derive(Debug, Clone)]
pub struct BucketAllocator<A: RangeAllocator + Clone> {
    name: String,
    block_size: u64,
    backing: A,
    idle: IdleList,
    blocks: BTreeMap<u64, PoolBlock>,
}

impl<A: RangeAllocator + Clone + 'static> BucketAllocator<A> {
    pub fn new(block_size: u64, backing: A) -> Self {
        assert!(block_size > 0, "bucket block size must be positive");
        Self {
            name: format!("{}/bucket{}", backing.name(), block_size),
            block_size,
            backing,
            idle: IdleList::default(),
            blocks: BTreeMap::new(),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn backing(&self) -> &A {
        &self.backing
    }

    /// Number of blocks waiting in the pool
    pub fn idle_blocks(&self) -> usize {
        self.idle.len()
    }

    /// Return every idle block to the backing allocator
    pub fn release_idle(&mut self) -> u64 {
        let mut released = 0;
        for address in self.idle.drain() {
            self.blocks.remove(&address);
            released += self.backing.free(address);
        }
        if released > 0 {
            log::debug!("{}: released 0x{:x} idle bytes", self.name, released);
        }
        released
    }

    fn idle_bytes(&self) -> u64 {
        self.blocks.values().filter(|b| !b.in_use).map(|b| b.granted).sum()
    }
}

impl<A: RangeAllocator + Clone + 'static> RangeAllocator for BucketAllocator<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, size: u64, base: u64) {
        self.idle.drain();
        self.blocks.clear();
        self.backing.init(size, base);
    }

    fn allocate(&mut self, request: &AllocRequest) -> Option<Allocation> {
        if !poolable(request) || request.size > self.block_size {
            return self.backing.allocate(request);
        }

        if let Some(address) = self.idle.take(request.alignment) {
            let block = self
                .blocks
                .get_mut(&address)
                .unwrap_or_else(|| panic!("idle block 0x{:x} is not owned by the pool", address));
            block.in_use = true;
            log::trace!("{}: reuse block at 0x{:x}", self.name, address);
            return Some(Allocation {
                address,
                size: block.granted,
            });
        }

        let block_request = AllocRequest::new(self.block_size)
            .aligned(request.alignment)
            .allow_failure(request.allow_failure);
        let granted = self.backing.allocate(&block_request)?;
        self.blocks.insert(
            granted.address,
            PoolBlock {
                block_size: self.block_size,
                granted: granted.size,
                in_use: true,
            },
        );
        Some(granted)
    }

    fn free(&mut self, address: u64) -> u64 {
        match self.blocks.get_mut(&address) {
            Some(block) => {
                assert!(block.in_use, "{}: block 0x{:x} is freed twice", self.name, address);
                block.in_use = false;
                self.idle.put(address);
                block.granted
            }
            None => self.backing.free(address),
        }
    }

    fn is_allocated(&self, address: u64) -> bool {
        match self.blocks.get(&address) {
            Some(block) => block.in_use,
            None => self.backing.is_allocated(address),
        }
    }

    fn max_free_contiguous(&self) -> u64 {
        let pooled = if self.idle.is_empty() { 0 } else { self.block_size };
        self.backing.max_free_contiguous().max(pooled)
    }

    fn currently_used(&self) -> u64 {
        self.backing.currently_used() - self.idle_bytes()
    }

    fn size(&self) -> u64 {
        self.backing.size()
    }

    fn base(&self) -> u64 {
        self.backing.base()
    }

    fn box_clone(&self) -> Box<dyn RangeAllocator> {
        Box::new(self.clone())
    }
}

/// Several block pools over one backing allocator.
///
/// A request goes to the pool with the smallest block size that fits it
/// and is granted a whole block. Requests bigger than every block size go
/// to the backing allocator. When the backing allocator runs out of space
/// all idle blocks are released and the request is retried once.
#[derive(Debug, Clone)]
pub struct MultiBucketAllocator<A: RangeAllocator + Clone> {
    name: String,
    backing: A,
    pools: BTreeMap<u64, IdleList>,
    blocks: BTreeMap<u64, PoolBlock>,
    releases: u64,
}

impl<A: RangeAllocator + Clone + 'static> MultiBucketAllocator<A> {
    pub fn new(block_sizes: &[u64], backing: A) -> Self {
        let pools = block_sizes
            .iter()
            .filter(|&&size| size > 0)
            .map(|&size| (size, IdleList::default()))
            .collect();
        Self {
            name: format!("{}/buckets", backing.name()),
            backing,
            pools,
            blocks: BTreeMap::new(),
            releases: 0,
        }
    }

    pub fn block_sizes(&self) -> Vec<u64> {
        self.pools.keys().copied().collect()
    }

    pub fn backing(&self) -> &A {
        &self.backing
    }

    /// Number of idle blocks across all pools
    pub fn idle_blocks(&self) -> usize {
        self.pools.values().map(IdleList::len).sum()
    }

    /// How many times idle blocks were released to satisfy a request
    pub fn releases(&self) -> u64 {
        self.releases
    }

    /// Return every idle block of every pool to the backing allocator
    pub fn release_idle(&mut self) -> u64 {
        let mut released = 0;
        for idle in self.pools.values_mut() {
            for address in idle.drain() {
                self.blocks.remove(&address);
                released += self.backing.free(address);
            }
        }
        if released > 0 {
            log::debug!("{}: released 0x{:x} idle bytes", self.name, released);
        }
        released
    }

    fn idle_bytes(&self) -> u64 {
        self.blocks.values().filter(|b| !b.in_use).map(|b| b.granted).sum()
    }

    fn backing_allocate(&mut self, request: &AllocRequest) -> Option<Allocation> {
        let quiet = request.allow_failure(true);
        if let Some(granted) = self.backing.allocate(&quiet) {
            return Some(granted);
        }
        if self.idle_blocks() == 0 {
            return self.report_failure(request);
        }

        self.releases += 1;
        self.release_idle();
        match self.backing.allocate(&quiet) {
            Some(granted) => Some(granted),
            None => self.report_failure(request),
        }
    }

    fn report_failure(&self, request: &AllocRequest) -> Option<Allocation> {
        if request.allow_failure {
            log::trace!("{}: no space for 0x{:x} bytes", self.name, request.size);
        } else {
            log::error!(
                "{}: no space for 0x{:x} bytes after releasing idle blocks",
                self.name,
                request.size
            );
        }
        None
    }
}

impl<A: RangeAllocator + Clone + 'static> RangeAllocator for MultiBucketAllocator<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, size: u64, base: u64) {
        for idle in self.pools.values_mut() {
            idle.drain();
        }
        self.blocks.clear();
        self.backing.init(size, base);
    }

    fn allocate(&mut self, request: &AllocRequest) -> Option<Allocation> {
        let pool = if poolable(request) {
            self.pools.range(request.size..).next().map(|(&size, _)| size)
        } else {
            None
        };

        let Some(block_size) = pool else {
            return self.backing_allocate(request);
        };

        let reused = self
            .pools
            .get_mut(&block_size)
            .and_then(|idle| idle.take(request.alignment));
        if let Some(address) = reused {
            let block = self
                .blocks
                .get_mut(&address)
                .unwrap_or_else(|| panic!("idle block 0x{:x} is not owned by any pool", address));
            block.in_use = true;
            log::trace!("{}: reuse {}-byte block at 0x{:x}", self.name, block_size, address);
            return Some(Allocation {
                address,
                size: block.granted,
            });
        }

        let block_request = AllocRequest::new(block_size)
            .aligned(request.alignment)
            .allow_failure(request.allow_failure);
        let granted = self.backing_allocate(&block_request)?;
        self.blocks.insert(
            granted.address,
            PoolBlock {
                block_size,
                granted: granted.size,
                in_use: true,
            },
        );
        Some(granted)
    }

    fn free(&mut self, address: u64) -> u64 {
        let Some(block) = self.blocks.get_mut(&address) else {
            return self.backing.free(address);
        };
        assert!(block.in_use, "{}: block 0x{:x} is freed twice", self.name, address);
        block.in_use = false;
        let (block_size, granted) = (block.block_size, block.granted);
        if let Some(idle) = self.pools.get_mut(&block_size) {
            idle.put(address);
        }
        granted
    }

    fn is_allocated(&self, address: u64) -> bool {
        match self.blocks.get(&address) {
            Some(block) => block.in_use,
            None => self.backing.is_allocated(address),
        }
    }

    fn max_free_contiguous(&self) -> u64 {
        let pooled = self
            .pools
            .iter()
            .rev()
            .find(|(_, idle)| !idle.is_empty())
            .map_or(0, |(&size, _)| size);
        self.backing.max_free_contiguous().max(pooled)
    }

    fn currently_used(&self) -> u64 {
        self.backing.currently_used() - self.idle_bytes()
    }

    fn size(&self) -> u64 {
        self.backing.size()
    }

    fn base(&self) -> u64 {
        self.backing.base()
    }

    fn box_clone(&self) -> Box<dyn RangeAllocator> {
        Box::new(self.clone())
    }
}
