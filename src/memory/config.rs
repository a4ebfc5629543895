use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::allocator::PlacementKind;

/// Knobs of the memory planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// First address of the fast tier
    pub fast_base: u64,
    /// Size of the fast tier in bytes
    pub fast_size: u64,
    /// First address of the slow tier
    pub slow_base: u64,
    /// Size of the slow tier in bytes
    pub slow_size: u64,
    /// Placement policy of the fast tier workspace
    pub fast_placement: PlacementKind,
    /// Placement policy of the slow tier
    pub slow_placement: PlacementKind,
    /// Alignment of the workspace region and pool blocks
    pub default_alignment: u64,
    /// Relative precision at which the workspace size search stops
    pub workspace_precision: f64,
    /// Smallest workspace the search may choose (0 = peak liveness only)
    pub min_workspace_size: u64,
    /// Largest workspace the fast tier may lend (None = whole free range)
    pub max_epoch_size: Option<u64>,
    /// Block sizes of the slow tier pools (empty = no pooling)
    pub bucket_sizes: Vec<u64>,
    /// Dead tensors kept allocated before their memory is reused
    pub keep_last_freed: usize,
    /// Let slow tier temporaries borrow dead output buffers
    pub reuse_output_buffers: bool,
    /// Place fast tier tensors that cannot fit there in the slow tier
    /// instead of failing the plan
    pub allow_slow_fallback: bool,
    /// Guard the slow tier allocator with a lock
    pub thread_safe: bool,
    /// Log the heap status map after every change (trace level)
    pub print_status: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            fast_base: 0,
            fast_size: 4 * 1024 * 1024, // 4MB
            slow_base: 0x1_0000_0000,
            slow_size: 1024 * 1024 * 1024, // 1GB
            fast_placement: PlacementKind::Cyclic,
            slow_placement: PlacementKind::BestFit,
            default_alignment: 128,
            workspace_precision: 0.05,
            min_workspace_size: 0,
            max_epoch_size: None,
            bucket_sizes: Vec::new(),
            keep_last_freed: 0,
            reuse_output_buffers: true,
            allow_slow_fallback: true,
            thread_safe: false,
            print_status: false,
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fast tier address range
    pub fn set_fast_tier(mut self, base: u64, size: u64) -> Self {
        self.fast_base = base;
        self.fast_size = size;
        self
    }

    /// Set the slow tier address range
    pub fn set_slow_tier(mut self, base: u64, size: u64) -> Self {
        self.slow_base = base;
        self.slow_size = size;
        self
    }

    pub fn set_fast_placement(mut self, kind: PlacementKind) -> Self {
        self.fast_placement = kind;
        self
    }

    pub fn set_slow_placement(mut self, kind: PlacementKind) -> Self {
        self.slow_placement = kind;
        self
    }

    pub fn set_default_alignment(mut self, alignment: u64) -> Self {
        self.default_alignment = alignment;
        self
    }

    pub fn set_workspace_precision(mut self, precision: f64) -> Self {
        self.workspace_precision = precision;
        self
    }

    pub fn set_min_workspace_size(mut self, size: u64) -> Self {
        self.min_workspace_size = size;
        self
    }

    pub fn set_max_epoch_size(mut self, size: u64) -> Self {
        self.max_epoch_size = Some(size);
        self
    }

    pub fn set_bucket_sizes(mut self, sizes: Vec<u64>) -> Self {
        self.bucket_sizes = sizes;
        self
    }

    pub fn set_keep_last_freed(mut self, count: usize) -> Self {
        self.keep_last_freed = count;
        self
    }

    pub fn reuse_output_buffers(mut self, enable: bool) -> Self {
        self.reuse_output_buffers = enable;
        self
    }

    pub fn allow_slow_fallback(mut self, enable: bool) -> Self {
        self.allow_slow_fallback = enable;
        self
    }

    pub fn thread_safe(mut self, enable: bool) -> Self {
        self.thread_safe = enable;
        self
    }

    pub fn print_status(mut self, enable: bool) -> Self {
        self.print_status = enable;
        self
    }

    /// Load a configuration from JSON; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the configuration for values the planner cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.fast_size == 0 || self.slow_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "tier sizes must be positive (fast {}, slow {})",
                self.fast_size, self.slow_size
            )));
        }
        if !self.default_alignment.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "default alignment {} is not a power of two",
                self.default_alignment
            )));
        }
        if !(self.workspace_precision > 0.0 && self.workspace_precision < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "workspace precision {} is outside (0, 1)",
                self.workspace_precision
            )));
        }
        if self.max_epoch_size == Some(0) {
            return Err(Error::InvalidConfig("maximum epoch size must be positive".to_string()));
        }
        if self.bucket_sizes.iter().any(|&s| s == 0) {
            return Err(Error::InvalidConfig("bucket sizes must be positive".to_string()));
        }
        if self.bucket_sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidConfig(format!(
                "bucket sizes {:?} must be strictly increasing",
                self.bucket_sizes
            )));
        }
        Ok(())
    }
}
