//! Epoch-based allocation of a bounded fast-memory workspace.
//!
//! Tensors are taken in birth order and grouped into epochs. Every tensor
//! of an epoch is allocated before any of them is freed, so an epoch only
//! holds as many tensors as the workspace can take at once. Between epochs
//! the tensors that died are released. The number of tensors per epoch is
//! found by binary search over dry runs on cloned allocator state, and
//! `size_workspace` wraps the whole pass in a second binary search over
//! the workspace size.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::memory::allocator::{PlacementKind, RangeAllocator};
use crate::memory::config::AllocatorConfig;
use crate::memory::facade::{place_tensor, release_tensor};
use crate::memory::heap::HeapAllocator;
use crate::memory::liveness::LivenessAnalysis;
use crate::memory::policy::PlacementPolicy;
use crate::memory::range::{padding, Range};
use crate::memory::section::SectionTracker;
use crate::model::{round_up, Placement, TensorId, TensorStore, Tier};

/// Summary of one committed epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EpochReport {
    pub index: usize,
    /// Birth step of the first tensor in the epoch
    pub first_step: usize,
    /// Birth step of the last tensor in the epoch
    pub last_step: usize,
    /// Number of tensors allocated
    pub tensors: usize,
    /// Workspace bytes taken by the epoch
    pub bytes: u64,
}

/// Outcome of the workspace size search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkspaceSizing {
    /// Smallest feasible workspace found
    pub size: u64,
    /// Number of full dry runs performed
    pub probes: u32,
    pub lower_bound: u64,
    pub upper_bound: u64,
}

/// State produced by one pass over the schedule
#[derive(Debug)]
struct Pass {
    workspace: HeapAllocator,
    tracker: SectionTracker,
    addresses: BTreeMap<TensorId, u64>,
    reports: Vec<EpochReport>,
    /// Tensors given up on, in the order they were met
    demoted: Vec<TensorId>,
}

/// Allocator of non-persistent fast-tier tensors inside one workspace region
#[derive(Debug, Clone)]
pub struct EpochAllocator {
    region: Range,
    workspace: HeapAllocator,
    keep_last_freed: usize,
    reports: Vec<EpochReport>,
}

impl EpochAllocator {
    /// Largest aligned region `tier` could lend, capped at `max_size`
    pub fn workspace_region<P: PlacementPolicy>(tier: &HeapAllocator<P>, max_size: u64, alignment: u64) -> Option<Range> {
        let largest = tier.max_free_range();
        let pad = padding(largest.base, alignment);
        if largest.size <= pad {
            return None;
        }
        let size = (largest.size - pad).min(max_size);
        (size > 0).then(|| Range::new(largest.base + pad, size))
    }

    /// Carve a workspace of at most `max_epoch_size` bytes out of the
    /// largest free range of `tier`
    pub fn new<P: PlacementPolicy>(
        tier: &mut HeapAllocator<P>,
        max_epoch_size: u64,
        config: &AllocatorConfig,
    ) -> Option<Self> {
        let region = Self::workspace_region(tier, max_epoch_size, config.default_alignment)?;
        let pad = padding(tier.max_free_range().base, config.default_alignment);
        if !tier.reserve_range(Range::new(region.base - pad, region.size + pad), pad) {
            return None;
        }
        log::debug!("epoch workspace reserved at {} in {}", region, tier.name());
        Some(Self::with_region(region, config))
    }

    /// Workspace over `region` without reserving it anywhere
    pub fn with_region(region: Range, config: &AllocatorConfig) -> Self {
        let cyclic = config.fast_placement != PlacementKind::FirstFit;
        let mut workspace = HeapAllocator::first_fit("workspace", cyclic);
        workspace.set_best_fit_allocation(config.fast_placement == PlacementKind::BestFit);
        workspace.set_print_status(config.print_status);
        workspace.init(region.size, region.base);
        Self {
            region,
            workspace,
            keep_last_freed: config.keep_last_freed,
            reports: Vec::new(),
        }
    }

    /// Give the workspace region back to the tier it was carved from
    pub fn release<P: PlacementPolicy>(self, tier: &mut HeapAllocator<P>) -> u64 {
        tier.free(self.region.base)
    }

    pub fn region(&self) -> Range {
        self.region
    }

    pub fn reports(&self) -> &[EpochReport] {
        &self.reports
    }

    /// Highest workspace offset used, relative to the region base
    pub fn high_water_mark(&self) -> u64 {
        self.workspace.stats().high_water_mark
    }

    /// Allocate every tensor of `liveness` and commit the placements.
    ///
    /// `tracker` must only hold section members classified by `liveness`.
    pub fn allocate<S: TensorStore + ?Sized>(
        &mut self,
        liveness: &LivenessAnalysis,
        store: &mut S,
        tracker: &mut SectionTracker,
    ) -> Result<()> {
        let pass = self.run(liveness, &*store, tracker.clone(), false).map_err(|tensor| {
            let desc = store.desc(tensor);
            log::error!(
                "tensor {} ({} bytes) does not fit in the {} byte workspace",
                desc.name,
                liveness.size(tensor),
                self.region.size
            );
            Error::AllocationFailed {
                tensor,
                name: desc.name.clone(),
                tier: Tier::Fast,
                size: liveness.size(tensor),
            }
        })?;

        for (&tensor, &offset) in &pass.addresses {
            store.commit(tensor, Placement { tier: Tier::Fast, offset });
        }
        log::debug!(
            "epoch allocation done: {} tensors in {} epochs, high water mark 0x{:x}",
            pass.addresses.len(),
            pass.reports.len(),
            pass.workspace.stats().high_water_mark
        );
        *tracker = pass.tracker;
        self.workspace = pass.workspace;
        self.reports = pass.reports;
        Ok(())
    }

    /// Run the whole pass on private copies; returns the workspace high
    /// water mark if every tensor fits
    pub fn dry_run<S: TensorStore + ?Sized>(
        &self,
        liveness: &LivenessAnalysis,
        store: &S,
        tracker: &SectionTracker,
    ) -> Option<u64> {
        self.run(liveness, store, tracker.clone(), false)
            .ok()
            .map(|pass| pass.workspace.stats().high_water_mark)
    }

    /// Tensors that cannot be placed in this workspace whatever else is
    /// allocated. A tensor no epoch can take is skipped together with the
    /// rest of its section and the pass goes on without them.
    pub fn demotions<S: TensorStore + ?Sized>(
        &self,
        liveness: &LivenessAnalysis,
        store: &S,
        tracker: &SectionTracker,
    ) -> Vec<TensorId> {
        match self.run(liveness, store, tracker.clone(), true) {
            Ok(pass) => pass.demoted,
            Err(tensor) => vec![tensor],
        }
    }

    fn run<S: TensorStore + ?Sized>(
        &self,
        liveness: &LivenessAnalysis,
        store: &S,
        mut tracker: SectionTracker,
        demote: bool,
    ) -> std::result::Result<Pass, TensorId> {
        let mut order = liveness.birth_order();
        let mut demoted = Vec::new();
        let mut workspace = self.workspace.clone();
        let default_best_fit = workspace.policy().is_best_fit();
        let mut addresses = BTreeMap::new();
        let mut live: Vec<TensorId> = Vec::new();
        let mut pending: VecDeque<TensorId> = VecDeque::new();
        let mut reports = Vec::new();
        let mut cursor = 0;

        while cursor < order.len() {
            let next_birth = liveness.lifetime(order[cursor]).start;

            let mut dead: Vec<TensorId> = Vec::new();
            live.retain(|&t| {
                let alive = liveness.lifetime(t).end >= next_birth;
                if !alive {
                    dead.push(t);
                }
                alive
            });
            dead.sort_by_key(|&t| (liveness.lifetime(t).end, t));
            pending.extend(dead);
            while pending.len() > self.keep_last_freed {
                if let Some(t) = pending.pop_front() {
                    release_tensor(store.desc(t), addresses[&t], &mut workspace, Some(&mut tracker), false);
                }
            }

            let mut plan = plan_epoch(&workspace, &mut tracker, liveness, store, &order[cursor..]);
            if plan.is_none() && !pending.is_empty() {
                log::trace!("epoch at step {}: flushing {} delayed frees", next_birth, pending.len());
                for t in pending.drain(..) {
                    release_tensor(store.desc(t), addresses[&t], &mut workspace, Some(&mut tracker), false);
                }
                plan = plan_epoch(&workspace, &mut tracker, liveness, store, &order[cursor..]);
            }
            let Some(EpochPlan { count, best_fit }) = plan else {
                log::trace!("no feasible epoch at step {}", next_birth);
                if !demote {
                    return Err(order[cursor]);
                }
                let skipped = skip_tensor(order[cursor], &order[cursor..], &mut tracker, &mut workspace);
                order.retain(|t| !skipped.contains(t));
                demoted.extend(skipped);
                continue;
            };

            let batch = allocation_order(liveness, &order[cursor..cursor + count]);
            let used_before = workspace.currently_used();
            workspace.set_best_fit_allocation(best_fit);
            for &tensor in &batch {
                let address = place_tensor(
                    store.desc(tensor),
                    &mut workspace,
                    true,
                    Some(&mut tracker),
                    Some(liveness.lifetime(tensor)),
                )
                .ok_or(tensor)?;
                addresses.insert(tensor, address);
                live.push(tensor);
            }
            workspace.set_best_fit_allocation(default_best_fit);

            let report = EpochReport {
                index: reports.len(),
                first_step: next_birth,
                last_step: liveness.lifetime(order[cursor + count - 1]).start,
                tensors: count,
                bytes: workspace.currently_used() - used_before,
            };
            log::trace!("epoch {:?}", report);
            reports.push(report);
            cursor += count;
        }

        live.sort_by_key(|&t| (liveness.lifetime(t).end, t));
        for t in pending.drain(..).chain(live) {
            release_tensor(store.desc(t), addresses[&t], &mut workspace, Some(&mut tracker), false);
        }
        tracker.verify_all_done();
        debug_assert_eq!(workspace.currently_used(), 0);

        Ok(Pass {
            workspace,
            tracker,
            addresses,
            reports,
            demoted,
        })
    }
}

/// Take `tensor` out of the pass, with every other unplaced member of its
/// section; returns the tensors taken out
fn skip_tensor(
    tensor: TensorId,
    remaining: &[TensorId],
    tracker: &mut SectionTracker,
    workspace: &mut HeapAllocator,
) -> Vec<TensorId> {
    let section = tracker.section_of(tensor);
    let skipped: Vec<TensorId> = remaining
        .iter()
        .copied()
        .filter(|&t| t == tensor || (section.is_some() && tracker.section_of(t) == section))
        .collect();
    for &t in &skipped {
        if let Some(base) = tracker.handle_unallocated_fallback(t) {
            workspace.free(base);
        }
    }
    log::debug!("tensors {:?} do not fit in the {} byte workspace", skipped, workspace.size());
    skipped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EpochPlan {
    count: usize,
    best_fit: bool,
}

/// Deterministic allocation order: longest living first, then largest
fn allocation_order(liveness: &LivenessAnalysis, tensors: &[TensorId]) -> Vec<TensorId> {
    let mut batch = tensors.to_vec();
    batch.sort_by_key(|&t| (Reverse(liveness.lifetime(t).end), Reverse(liveness.size(t)), t));
    batch
}

/// Workspace bytes a tensor adds to the current planning pass
fn planned_cost(tensor: TensorId, tracker: &mut SectionTracker, liveness: &LivenessAnalysis) -> u64 {
    match tracker.section_of(tensor) {
        Some(section) => {
            if tracker.track_planned(tensor) {
                0
            } else {
                tracker.section_size(section)
            }
        }
        None => liveness.size(tensor),
    }
}

/// Choose how many of `remaining` form the next epoch
fn plan_epoch<S: TensorStore + ?Sized>(
    workspace: &HeapAllocator,
    tracker: &mut SectionTracker,
    liveness: &LivenessAnalysis,
    store: &S,
    remaining: &[TensorId],
) -> Option<EpochPlan> {
    let tight = workspace.max_free_contiguous();
    let loose = workspace.size() - workspace.currently_used();

    let mut total = 0u64;
    let mut tight_count = None;
    let mut count = 0;
    for (i, &tensor) in remaining.iter().enumerate() {
        let cost = planned_cost(tensor, tracker, liveness);
        if total + cost > loose {
            break;
        }
        total += cost;
        if total > tight && tight_count.is_none() {
            tight_count = Some(i);
        }
        count = i + 1;
    }
    tracker.discard_planned();

    if count == 0 {
        return None;
    }

    let feasible = |k: usize, best_fit: bool| -> bool {
        let mut probe = workspace.clone();
        probe.set_best_fit_allocation(best_fit);
        let mut probe_tracker = tracker.clone();
        allocation_order(liveness, &remaining[..k]).into_iter().all(|t| {
            place_tensor(
                store.desc(t),
                &mut probe,
                true,
                Some(&mut probe_tracker),
                Some(liveness.lifetime(t)),
            )
            .is_some()
        })
    };

    let search = |best_fit: bool| -> Option<usize> {
        if !feasible(1, best_fit) {
            return None;
        }
        let (mut lo, mut hi) = (1, count);
        if let Some(hint) = tight_count.filter(|&c| c > 1) {
            if feasible(hint, best_fit) {
                lo = hint;
            } else {
                hi = hint - 1;
            }
        }
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if feasible(mid, best_fit) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Some(lo)
    };

    let default_best_fit = workspace.policy().is_best_fit();
    let plan = match search(default_best_fit) {
        Some(count) => Some(EpochPlan { count, best_fit: default_best_fit }),
        None if !default_best_fit => {
            log::trace!("epoch infeasible with first fit, retrying with best fit");
            search(true).map(|count| EpochPlan { count, best_fit: true })
        }
        None => None,
    };
    if let Some(plan) = plan {
        log::trace!(
            "epoch plan: {} of {} candidates (tight bound after {:?}), {} free, {} contiguous",
            plan.count,
            count,
            tight_count,
            loose,
            tight
        );
    }
    plan
}

fn probe_size<S: TensorStore + ?Sized>(
    region_base: u64,
    size: u64,
    liveness: &LivenessAnalysis,
    store: &S,
    tracker: &SectionTracker,
    config: &AllocatorConfig,
    probes: &mut u32,
) -> Option<u64> {
    *probes += 1;
    let epochs = EpochAllocator::with_region(Range::new(region_base, size), config);
    let result = epochs.dry_run(liveness, store, tracker);
    log::trace!("workspace probe 0x{:x}: {}", size, if result.is_some() { "feasible" } else { "infeasible" });
    result
}

/// Find the smallest workspace, within the configured precision, in which
/// every tensor of `liveness` can be allocated. The workspace starts at
/// `region_base` and can grow up to `max_size` bytes.
pub fn size_workspace<S: TensorStore + ?Sized>(
    region_base: u64,
    max_size: u64,
    liveness: &LivenessAnalysis,
    store: &S,
    tracker: &SectionTracker,
    config: &AllocatorConfig,
) -> Result<WorkspaceSizing> {
    let peak = liveness.max_capacity();
    let lower = round_up(peak.bytes.max(config.min_workspace_size), config.default_alignment).min(max_size);
    let mut probes = 0;

    let unconstrained = probe_size(region_base, max_size, liveness, store, tracker, config, &mut probes)
        .ok_or_else(|| {
            Error::WorkspaceSearchFailed(format!(
                "tensors need {} bytes at step {} but at most {} bytes of fast memory are available",
                peak.bytes, peak.step, max_size
            ))
        })?;

    // Smallest size known to be feasible
    let mut upper = max_size;
    let candidate = round_up(unconstrained.max(lower), config.default_alignment);
    if candidate < upper && probe_size(region_base, candidate, liveness, store, tracker, config, &mut probes).is_some() {
        upper = candidate;
    } else {
        let mut size = lower.saturating_mul(2).max(1);
        while size < upper {
            if probe_size(region_base, size, liveness, store, tracker, config, &mut probes).is_some() {
                upper = size;
                break;
            }
            size = size.saturating_mul(2);
        }
    }

    if lower < upper && probe_size(region_base, lower, liveness, store, tracker, config, &mut probes).is_some() {
        upper = lower;
    }

    // `hi` is always feasible, `lo` infeasible unless equal to `hi`
    let (mut lo, mut hi) = (lower, upper);
    while hi - lo > 1 && (hi - lo) as f64 > config.workspace_precision * hi as f64 {
        let mid = lo + (hi - lo) / 2;
        if probe_size(region_base, mid, liveness, store, tracker, config, &mut probes).is_some() {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    let sizing = WorkspaceSizing {
        size: hi,
        probes,
        lower_bound: lower,
        upper_bound: upper,
    };
    log::debug!("workspace sizing: {:?}", sizing);
    Ok(sizing)
}
