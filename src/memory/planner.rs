use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};
use crate::memory::allocator::{create_allocator, PlacementKind, RangeAllocator, SharedAllocator};
use crate::memory::config::AllocatorConfig;
use crate::memory::epoch::{size_workspace, EpochAllocator, EpochReport, WorkspaceSizing};
use crate::memory::facade::{allocate_tensor, free_tensor};
use crate::memory::heap::HeapAllocator;
use crate::memory::liveness::{LivenessAnalysis, PeakUsage};
use crate::memory::output_buffer::OutputBufferAllocator;
use crate::memory::policy::{BestFit, PlacementPolicy};
use crate::memory::pool::MultiBucketAllocator;
use crate::memory::range::Range;
use crate::memory::section::SectionTracker;
use crate::model::{ExecutionSchedule, TensorDesc, TensorId, TensorStore, Tier};

/// Output format of an exported plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Final placement of one real tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTensor {
    pub id: TensorId,
    pub name: String,
    pub tier: Tier,
    pub offset: u64,
    pub size: u64,
    pub persistent: bool,
    /// First step the tensor is live
    pub first_step: usize,
    /// Last step the tensor is live
    pub last_step: usize,
}

/// Result of planning one schedule
#[derive(Debug, Clone, Serialize)]
pub struct MemoryPlan {
    /// Placements in tensor ID order
    pub tensors: Vec<PlannedTensor>,
    /// Fast tier region lent to the epoch allocator
    pub workspace: Option<Range>,
    pub workspace_sizing: Option<WorkspaceSizing>,
    pub epochs: Vec<EpochReport>,
    /// Peak liveness of the non-persistent fast tier tensors
    pub fast_peak: PeakUsage,
    /// Bytes of fast memory held by persistent tensors
    pub fast_persistent_bytes: u64,
    /// Largest number of slow tier bytes in use at once
    pub slow_high_water_mark: u64,
    /// Tensors preferring the fast tier that were placed in the slow tier
    pub demoted: Vec<TensorId>,
}

impl MemoryPlan {
    pub fn tensor(&self, id: TensorId) -> Option<&PlannedTensor> {
        self.tensors
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|i| &self.tensors[i])
    }

    pub fn tensors_in(&self, tier: Tier) -> impl Iterator<Item = &PlannedTensor> {
        self.tensors.iter().filter(move |t| t.tier == tier)
    }

    /// Serialize the plan. CSV holds one row per tensor.
    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_vec_pretty(self)?),
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                for tensor in &self.tensors {
                    writer.serialize(tensor)?;
                }
                writer
                    .into_inner()
                    .map_err(|e| Error::IoError(e.into_error()))
            }
        }
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P, format: ExportFormat) -> Result<()> {
        let data = self.export(format)?;
        let mut file = File::create(path)?;
        file.write_all(&data)?;
        Ok(())
    }
}

/// Places every tensor of a schedule in the fast or slow tier.
///
/// Persistent tensors are allocated first and never freed. Other fast
/// tier tensors go through the epoch allocator inside a workspace sized by
/// binary search; other slow tier tensors are allocated step by step.
/// Tensors preferring an undefined tier go to the slow tier.
#[derive(Debug, Clone, Default)]
pub struct MemoryPlanner {
    config: AllocatorConfig,
}

impl MemoryPlanner {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Plan the schedule and commit every placement into `store`
    pub fn plan<S: TensorStore + ?Sized>(&self, schedule: &ExecutionSchedule, store: &mut S) -> Result<MemoryPlan> {
        self.config.validate()?;
        log::debug!(
            "planning {} nodes, fast tier 0x{:x} bytes ({}), slow tier 0x{:x} bytes",
            schedule.len(),
            self.config.fast_size,
            self.config.fast_placement,
            self.config.slow_size
        );

        match self.config.fast_placement {
            PlacementKind::FirstFit => self.plan_with(schedule, store, HeapAllocator::first_fit("fast", false)),
            PlacementKind::Cyclic => self.plan_with(schedule, store, HeapAllocator::first_fit("fast", true)),
            PlacementKind::BestFit => {
                self.plan_with(schedule, store, HeapAllocator::with_policy("fast", BestFit::new()))
            }
        }
    }

    fn plan_with<P: PlacementPolicy, S: TensorStore + ?Sized>(
        &self,
        schedule: &ExecutionSchedule,
        store: &mut S,
        mut fast_tier: HeapAllocator<P>,
    ) -> Result<MemoryPlan> {
        let all = LivenessAnalysis::analyze(schedule, &*store, |_| true);

        fast_tier.set_print_status(self.config.print_status);
        fast_tier.init(self.config.fast_size, self.config.fast_base);

        let persistent_fast: Vec<TensorId> = all
            .tensors()
            .filter(|&t| {
                let desc = store.desc(t);
                desc.persistent && desc.preferred_tier == Tier::Fast
            })
            .collect();
        let fallback = self.config.allow_slow_fallback;
        let mut demoted = BTreeSet::new();
        for &tensor in &persistent_fast {
            match allocate_tensor(store, tensor, Tier::Fast, &mut fast_tier, fallback, None, None) {
                Ok(()) => {}
                Err(Error::AllocationFailed { .. }) if fallback => {
                    log::warn!(
                        "persistent tensor {} does not fit in fast memory, using slow memory",
                        store.desc(tensor).name
                    );
                    demoted.insert(tensor);
                }
                Err(e) => return Err(e),
            }
        }
        let fast_persistent_bytes = fast_tier.currently_used();

        let mut plan = MemoryPlan {
            tensors: Vec::new(),
            workspace: None,
            workspace_sizing: None,
            epochs: Vec::new(),
            fast_peak: PeakUsage::default(),
            fast_persistent_bytes,
            slow_high_water_mark: 0,
            demoted: Vec::new(),
        };

        self.plan_fast_tier(schedule, store, &mut fast_tier, &mut demoted, &mut plan)?;
        plan.slow_high_water_mark = self.plan_slow_tier(schedule, store, &demoted)?;
        plan.demoted = demoted.into_iter().collect();

        plan.tensors = all
            .tensors()
            .filter_map(|t| {
                let desc = store.desc(t);
                let placement = store.placement(t)?;
                let lifetime = all.lifetime(t);
                Some(PlannedTensor {
                    id: t,
                    name: desc.name.clone(),
                    tier: placement.tier,
                    offset: placement.offset,
                    size: desc.size,
                    persistent: desc.persistent,
                    first_step: lifetime.start,
                    last_step: lifetime.end,
                })
            })
            .collect();

        log::debug!(
            "plan done: {} tensors placed ({} moved to slow memory), workspace {:?}, slow high water mark 0x{:x}",
            plan.tensors.len(),
            plan.demoted.len(),
            plan.workspace,
            plan.slow_high_water_mark
        );
        Ok(plan)
    }

    /// Epoch allocation of the fast tier temporaries. With the slow
    /// fallback enabled, tensors the workspace can never hold are added to
    /// `demoted` and the remaining ones are planned without them.
    fn plan_fast_tier<P: PlacementPolicy, S: TensorStore + ?Sized>(
        &self,
        schedule: &ExecutionSchedule,
        store: &mut S,
        fast_tier: &mut HeapAllocator<P>,
        demoted: &mut BTreeSet<TensorId>,
        plan: &mut MemoryPlan,
    ) -> Result<()> {
        let fallback = self.config.allow_slow_fallback;
        let max_size = self.config.max_epoch_size.unwrap_or(u64::MAX);
        let region = EpochAllocator::workspace_region(fast_tier, max_size, self.config.default_alignment);

        loop {
            let liveness = LivenessAnalysis::analyze(schedule, &*store, |d| {
                is_fast(d) && !d.persistent && !demoted.contains(&d.id)
            });
            if liveness.is_empty() {
                return Ok(());
            }
            let mut tracker = SectionTracker::from_store_where(&*store, |d| liveness.contains(d.id));

            let region = match region {
                Some(region) => region,
                None if fallback => {
                    log::warn!("no fast memory left for the workspace, {} tensors use slow memory", liveness.len());
                    demoted.extend(liveness.tensors());
                    continue;
                }
                None => {
                    return Err(Error::WorkspaceSearchFailed(
                        "no free fast memory left for the workspace".to_string(),
                    ))
                }
            };

            if fallback {
                let trial = EpochAllocator::with_region(region, &self.config);
                let spilled = trial.demotions(&liveness, &*store, &tracker);
                if !spilled.is_empty() {
                    for &tensor in &spilled {
                        log::warn!(
                            "tensor {} ({} bytes) does not fit in the fast memory workspace, using slow memory",
                            store.desc(tensor).name,
                            liveness.size(tensor)
                        );
                    }
                    demoted.extend(spilled);
                    continue;
                }
            }

            plan.fast_peak = liveness.max_capacity();
            let sizing = size_workspace(region.base, region.size, &liveness, &*store, &tracker, &self.config)?;
            let mut epochs = EpochAllocator::new(fast_tier, sizing.size, &self.config).ok_or_else(|| {
                Error::WorkspaceSearchFailed(format!("cannot reserve a workspace of 0x{:x} bytes", sizing.size))
            })?;
            epochs.allocate(&liveness, store, &mut tracker)?;

            plan.workspace = Some(epochs.region());
            plan.workspace_sizing = Some(sizing);
            plan.epochs = epochs.reports().to_vec();
            return Ok(());
        }
    }

    fn slow_allocator(&self) -> Box<dyn RangeAllocator> {
        let mut backing = create_allocator(self.config.slow_placement, "slow");
        backing.init(self.config.slow_size, self.config.slow_base);
        if !self.config.bucket_sizes.is_empty() {
            backing = Box::new(MultiBucketAllocator::new(&self.config.bucket_sizes, backing));
        }
        if self.config.thread_safe {
            backing = Box::new(SharedAllocator::new(backing));
        }
        backing
    }

    /// Allocate the slow tier tensors, including the `demoted` ones, step
    /// by step; returns the high water mark
    fn plan_slow_tier<S: TensorStore + ?Sized>(
        &self,
        schedule: &ExecutionSchedule,
        store: &mut S,
        demoted: &BTreeSet<TensorId>,
    ) -> Result<u64> {
        let liveness = LivenessAnalysis::analyze(schedule, &*store, |d| !is_fast(d) || demoted.contains(&d.id));
        if liveness.is_empty() {
            return Ok(0);
        }

        let mut backing = self.slow_allocator();
        let persistent: Vec<TensorId> = liveness.tensors().filter(|&t| store.desc(t).persistent).collect();
        for &tensor in &persistent {
            allocate_tensor(store, tensor, Tier::Slow, backing.as_mut(), false, None, None)?;
        }

        let mut slow = OutputBufferAllocator::new(backing);
        if self.config.reuse_output_buffers {
            for &tensor in &persistent {
                let desc = store.desc(tensor);
                if let Some(placement) = store.placement(tensor) {
                    let range = Range::new(placement.offset - desc.offset, desc.padded_size());
                    slow.add_output_buffer(tensor, range, liveness.lifetime(tensor));
                }
            }
        }

        let mut tracker = SectionTracker::from_store_where(&*store, |d| liveness.contains(d.id) && !d.persistent);
        let mut pending: VecDeque<TensorId> = VecDeque::new();
        let mut high_water_mark = slow.currently_used();
        let table = liveness.live_and_die();

        for step in 0..=liveness.num_steps() {
            pending.extend(table.dying(step).iter().filter(|&&t| !store.desc(t).persistent));
            while pending.len() > self.config.keep_last_freed {
                if let Some(tensor) = pending.pop_front() {
                    free_tensor(&*store, tensor, &mut slow, Some(&mut tracker));
                }
            }

            let born: Vec<TensorId> = table
                .born(step)
                .iter()
                .copied()
                .filter(|&t| !store.desc(t).persistent)
                .collect();
            for tensor in born {
                let lifetime = liveness.lifetime(tensor);
                allocate_tensor(store, tensor, Tier::Slow, &mut slow, false, Some(&mut tracker), Some(lifetime))?;
            }
            high_water_mark = high_water_mark.max(slow.currently_used());
        }

        for tensor in pending.drain(..) {
            free_tensor(&*store, tensor, &mut slow, Some(&mut tracker));
        }
        tracker.verify_all_done();
        Ok(high_water_mark)
    }
}

fn is_fast(desc: &TensorDesc) -> bool {
    desc.preferred_tier == Tier::Fast
}

/// Group a plan's placements by tier: tier -> (tensor, offset)
pub fn placements_by_tier(plan: &MemoryPlan) -> BTreeMap<String, Vec<(TensorId, u64)>> {
    let mut grouped: BTreeMap<String, Vec<(TensorId, u64)>> = BTreeMap::new();
    for tensor in &plan.tensors {
        grouped
            .entry(tensor.tier.to_string())
            .or_default()
            .push((tensor.id, tensor.offset));
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TensorTable;

    fn config() -> AllocatorConfig {
        AllocatorConfig::new()
            .set_fast_tier(0, 4096)
            .set_slow_tier(0x10000, 1 << 20)
            .set_default_alignment(64)
    }

    fn graph() -> (ExecutionSchedule, TensorTable) {
        let mut store = TensorTable::new();
        let input = store.add(TensorDesc::new("input", 256).persistent().prefer(Tier::Slow));
        let weight = store.add(TensorDesc::new("weight", 512).persistent());
        let h1 = store.add(TensorDesc::new("h1", 1024).with_alignment(64));
        let h2 = store.add(TensorDesc::new("h2", 1024).with_alignment(64));
        let spill = store.add(TensorDesc::new("spill", 2048).prefer(Tier::Slow));
        let output = store.add(TensorDesc::new("output", 256).persistent().prefer(Tier::Slow));

        let mut schedule = ExecutionSchedule::default();
        schedule.push("matmul", vec![input, weight], vec![h1]);
        schedule.push("relu", vec![h1], vec![h2, spill]);
        schedule.push("store", vec![h2, spill], vec![output]);
        (schedule, store)
    }

    #[test]
    fn test_plan_places_every_tensor() {
        let (schedule, mut store) = graph();
        let plan = MemoryPlanner::new(config()).plan(&schedule, &mut store).unwrap();

        assert_eq!(plan.tensors.len(), 6);
        assert_eq!(plan.tensors_in(Tier::Fast).count(), 3);
        assert_eq!(plan.fast_persistent_bytes, 512);
        assert_eq!(plan.fast_peak.bytes, 2048);
        let workspace = plan.workspace.unwrap();
        assert!(workspace.size >= 2048);
        assert_eq!(workspace.base % 64, 0);

        let h1 = plan.tensor(2).unwrap();
        let h2 = plan.tensor(3).unwrap();
        assert!(!Range::new(h1.offset, h1.size).intersects(&Range::new(h2.offset, h2.size)));
        assert!(workspace.contains_addr(h1.offset));
        assert_eq!(plan.tensor(4).unwrap().tier, Tier::Slow);
    }

    #[test]
    fn test_fast_tier_too_small() {
        let (schedule, mut store) = graph();
        let config = config().set_fast_tier(0, 1024).allow_slow_fallback(false);
        let err = MemoryPlanner::new(config).plan(&schedule, &mut store).unwrap_err();
        assert!(matches!(err, Error::WorkspaceSearchFailed(_)));
    }

    #[test]
    fn test_small_fast_tier_falls_back_to_slow() {
        let (schedule, mut store) = graph();
        let plan = MemoryPlanner::new(config().set_fast_tier(0, 1024))
            .plan(&schedule, &mut store)
            .unwrap();

        // Neither activation fits next to the weight
        assert_eq!(plan.demoted, vec![2, 3]);
        assert_eq!(plan.tensors_in(Tier::Fast).map(|t| t.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(plan.tensors.len(), 6);
        assert!(plan.workspace.is_none());
        assert_eq!(store.placement(2).unwrap().tier, Tier::Slow);
    }

    #[test]
    fn test_persistent_tensor_falls_back_to_slow() {
        let (schedule, mut store) = graph();
        let plan = MemoryPlanner::new(config().set_fast_tier(0, 256))
            .plan(&schedule, &mut store)
            .unwrap();
        assert_eq!(plan.fast_persistent_bytes, 0);
        assert_eq!(plan.demoted, vec![1, 2, 3]);
        assert_eq!(plan.tensors_in(Tier::Fast).count(), 0);
    }

    #[test]
    fn test_every_fast_placement_kind_plans() {
        for kind in [PlacementKind::FirstFit, PlacementKind::Cyclic, PlacementKind::BestFit] {
            let (schedule, mut store) = graph();
            let plan = MemoryPlanner::new(config().set_fast_placement(kind))
                .plan(&schedule, &mut store)
                .unwrap();
            assert_eq!(plan.tensors_in(Tier::Fast).count(), 3, "{}", kind);
            assert!(plan.demoted.is_empty());
            let h1 = plan.tensor(2).unwrap();
            let h2 = plan.tensor(3).unwrap();
            assert!(!Range::new(h1.offset, h1.size).intersects(&Range::new(h2.offset, h2.size)));
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (schedule, mut store) = graph();
        let config = config().set_workspace_precision(0.0);
        assert!(matches!(
            MemoryPlanner::new(config).plan(&schedule, &mut store),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_export_formats() {
        let (schedule, mut store) = graph();
        let plan = MemoryPlanner::new(config()).plan(&schedule, &mut store).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&plan.export(ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(json["tensors"].as_array().map(Vec::len), Some(6));

        let csv = String::from_utf8(plan.export(ExportFormat::Csv).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("id,name,tier,offset,size,persistent,first_step,last_step")
        );
        assert_eq!(lines.count(), 6);

        let grouped = placements_by_tier(&plan);
        assert_eq!(grouped["fast"].len(), 3);
        assert_eq!(grouped["slow"].len(), 3);
    }
}
