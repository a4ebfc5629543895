use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ExecutionSchedule, TensorDesc, TensorId, TensorStore};

/// Inclusive range of execution steps during which a tensor holds memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lifetime {
    /// First step the tensor is live
    pub start: usize,
    /// Last step the tensor is live
    pub end: usize,
}

impl Lifetime {
    pub fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "lifetime start {} is after its end {}", start, end);
        Self { start, end }
    }

    /// A lifetime covering exactly one step
    pub fn at(step: usize) -> Self {
        Self { start: step, end: step }
    }

    pub fn intersects(&self, other: &Lifetime) -> bool {
        self.start.max(other.start) <= self.end.min(other.end)
    }

    pub fn contains(&self, step: usize) -> bool {
        self.start <= step && step <= self.end
    }

    /// Number of steps covered
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    fn extend_to(&mut self, step: usize) {
        self.start = self.start.min(step);
        self.end = self.end.max(step);
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Step with the largest memory requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeakUsage {
    pub step: usize,
    pub bytes: u64,
}

/// Tensors born at and dying right after each step.
///
/// `born(s)` holds tensors whose lifetime starts at `s`; `dying(s)` holds
/// tensors whose lifetime ends at `s - 1`, so `dying(num_steps)` lists the
/// tensors alive through the last step. Both lists are sorted by ID.
#[derive(Debug, Clone, Default)]
pub struct LiveAndDie {
    born: Vec<Vec<TensorId>>,
    dying: Vec<Vec<TensorId>>,
}

impl LiveAndDie {
    pub fn born(&self, step: usize) -> &[TensorId] {
        self.born.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dying(&self, step: usize) -> &[TensorId] {
        self.dying.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of table entries (steps + 1)
    pub fn len(&self) -> usize {
        self.born.len()
    }

    pub fn is_empty(&self) -> bool {
        self.born.is_empty()
    }
}

/// Liveness intervals of the tensors selected by a predicate.
///
/// Built once per pass and immutable afterwards.
#[derive(Debug, Clone)]
pub struct LivenessAnalysis {
    num_steps: usize,
    lifetimes: BTreeMap<TensorId, Lifetime>,
    sizes: BTreeMap<TensorId, u64>,
    pressure: Vec<u64>,
    live_and_die: LiveAndDie,
}

impl LivenessAnalysis {
    /// Compute the lifetimes of every real tensor used by `schedule` whose
    /// descriptor satisfies `predicate`.
    ///
    /// Persistent tensors live until the last step, and from step 0 when
    /// no node produces them.
    pub fn analyze<S, F>(schedule: &ExecutionSchedule, store: &S, predicate: F) -> Self
    where
        S: TensorStore + ?Sized,
        F: Fn(&TensorDesc) -> bool,
    {
        let num_steps = schedule.len();
        let mut lifetimes: BTreeMap<TensorId, Lifetime> = BTreeMap::new();
        let mut produced = HashSet::new();

        for (step, node) in schedule.nodes().iter().enumerate() {
            for &output in &node.outputs {
                produced.insert(store.real_tensor(output));
            }
            for tensor in node.operands() {
                let real = store.real_tensor(tensor);
                if !predicate(store.desc(real)) {
                    continue;
                }
                lifetimes
                    .entry(real)
                    .and_modify(|lifetime| lifetime.extend_to(step))
                    .or_insert_with(|| Lifetime::at(step));
            }
        }

        let last_step = num_steps.saturating_sub(1);
        for (&id, lifetime) in lifetimes.iter_mut() {
            if store.desc(id).persistent {
                lifetime.end = last_step;
                if !produced.contains(&id) {
                    lifetime.start = 0;
                }
            }
        }

        let sizes: BTreeMap<TensorId, u64> = lifetimes
            .keys()
            .map(|&id| (id, store.desc(id).padded_size()))
            .collect();

        let pressure = Self::compute_pressure(num_steps, &lifetimes, &sizes);
        let live_and_die = Self::build_live_and_die(num_steps, &lifetimes);

        log::trace!(
            "liveness: {} tensors over {} steps",
            lifetimes.len(),
            num_steps
        );

        Self {
            num_steps,
            lifetimes,
            sizes,
            pressure,
            live_and_die,
        }
    }

    fn compute_pressure(
        num_steps: usize,
        lifetimes: &BTreeMap<TensorId, Lifetime>,
        sizes: &BTreeMap<TensorId, u64>,
    ) -> Vec<u64> {
        // Difference array: +size at start, -size after end
        let mut delta = vec![0i128; num_steps + 1];
        for (id, lifetime) in lifetimes {
            let size = i128::from(sizes[id]);
            delta[lifetime.start] += size;
            delta[lifetime.end + 1] -= size;
        }

        let mut running = 0i128;
        delta
            .iter()
            .take(num_steps)
            .map(|d| {
                running += d;
                running as u64
            })
            .collect()
    }

    fn build_live_and_die(num_steps: usize, lifetimes: &BTreeMap<TensorId, Lifetime>) -> LiveAndDie {
        let mut born = vec![Vec::new(); num_steps + 1];
        let mut dying = vec![Vec::new(); num_steps + 1];

        // BTreeMap iteration keeps every list sorted by ID
        for (&id, lifetime) in lifetimes {
            assert!(
                lifetime.end < num_steps,
                "tensor {} dies after step {} but the schedule has only {} steps",
                id,
                lifetime.end,
                num_steps
            );
            born[lifetime.start].push(id);
            dying[lifetime.end + 1].push(id);
        }

        LiveAndDie { born, dying }
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Classified tensors in ascending ID order
    pub fn tensors(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.lifetimes.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.lifetimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lifetimes.is_empty()
    }

    pub fn contains(&self, tensor: TensorId) -> bool {
        self.lifetimes.contains_key(&tensor)
    }

    /// Lifetime of a classified tensor
    pub fn lifetime(&self, tensor: TensorId) -> Lifetime {
        *self.lifetimes.get(&tensor).unwrap_or_else(|| {
            panic!("tensor {} was not classified by this liveness analysis", tensor)
        })
    }

    /// Padded size of a classified tensor
    pub fn size(&self, tensor: TensorId) -> u64 {
        *self.sizes.get(&tensor).unwrap_or_else(|| {
            panic!("tensor {} was not classified by this liveness analysis", tensor)
        })
    }

    /// Bytes required at each step
    pub fn memory_pressure(&self) -> &[u64] {
        &self.pressure
    }

    /// First step with the maximal memory requirement
    pub fn max_capacity(&self) -> PeakUsage {
        let mut peak = PeakUsage::default();
        for (step, &bytes) in self.pressure.iter().enumerate() {
            if bytes > peak.bytes {
                peak = PeakUsage { step, bytes };
            }
        }
        peak
    }

    pub fn live_and_die(&self) -> &LiveAndDie {
        &self.live_and_die
    }

    /// Classified tensors in order of birth step, then ID
    pub fn birth_order(&self) -> Vec<TensorId> {
        (0..self.num_steps)
            .flat_map(|step| self.live_and_die.born(step).iter().copied())
            .collect()
    }

    /// Whether `tensor` became live before `step`
    pub fn was_encountered_before(&self, step: usize, tensor: TensorId) -> bool {
        self.lifetime(tensor).start < step
    }

    /// Whether `tensor` is still live after `step`
    pub fn is_alive_after(&self, step: usize, tensor: TensorId) -> bool {
        self.lifetime(tensor).end > step
    }

    /// `is_alive_after` for the real tensor behind a possibly aliased ID
    pub fn is_real_tensor_alive_after<S: TensorStore + ?Sized>(&self, store: &S, step: usize, tensor: TensorId) -> bool {
        self.is_alive_after(step, store.real_tensor(tensor))
    }
}
