pub mod error;
pub mod memory;
pub mod model;

// Re-export commonly used types
pub use error::{Error, Result};
pub use memory::{
    allocate_tensor, free_tensor, AllocRequest, Allocation, AllocatorConfig, ExportFormat, Lifetime,
    LivenessAnalysis, MemoryPlan, MemoryPlanner, PlacementKind, RangeAllocator, SectionTracker,
};
pub use model::{ExecutionSchedule, Node, NodeId, Placement, SectionInfo, TensorDesc, TensorId, TensorStore, TensorTable, Tier};
