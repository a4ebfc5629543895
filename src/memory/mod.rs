pub mod allocator;
pub mod config;
pub mod epoch;
pub mod facade;
pub mod heap;
pub mod liveness;
pub mod output_buffer;
pub mod planner;
pub mod policy;
pub mod pool;
pub mod range;
pub mod section;

pub use allocator::{
    create_allocator,
    AllocRequest,
    Allocation,
    PlacementKind,
    RangeAllocator,
    SharedAllocator,
};

pub use config::AllocatorConfig;

pub use epoch::{size_workspace, EpochAllocator, EpochReport, WorkspaceSizing};

pub use facade::{allocate_tensor, free_tensor};

pub use heap::{BestFitAllocator, FirstFitAllocator, HeapAllocator, HeapStats};

pub use liveness::{LiveAndDie, Lifetime, LivenessAnalysis, PeakUsage};

pub use output_buffer::OutputBufferAllocator;

pub use planner::{placements_by_tier, ExportFormat, MemoryPlan, MemoryPlanner, PlannedTensor};

pub use policy::{BestFit, FirstFit, FreeList, PlacementPolicy};

pub use pool::{BucketAllocator, MultiBucketAllocator};

pub use range::{padding, Range};

pub use section::{MemberState, SectionAlloc, SectionTracker};
