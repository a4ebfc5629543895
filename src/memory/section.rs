use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{TensorDesc, TensorId, TensorStore};

/// Allocation state of one section member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Unallocated,
    Allocated,
    Freed,
}

/// Outcome of `SectionTracker::mark_as_alloc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionAlloc {
    /// First member of the section: the caller must allocate the whole
    /// section and report its base with `set_section_base_addr`
    NeedsAllocation { section: u64, size: u64, alignment: u64 },
    /// The section already holds memory; this is the member's address
    Offset(u64),
}

#[derive(Debug, Clone)]
struct Member {
    section: u64,
    offset_from_base: u64,
    state: MemberState,
}

#[derive(Debug, Clone, Default)]
struct Section {
    count: usize,
    unallocated: usize,
    allocated: usize,
    freed: usize,
    addr: Option<u64>,
    size: u64,
    alignment: u64,
}

impl Section {
    fn counter(&mut self, state: MemberState) -> &mut usize {
        match state {
            MemberState::Unallocated => &mut self.unallocated,
            MemberState::Allocated => &mut self.allocated,
            MemberState::Freed => &mut self.freed,
        }
    }

    fn fully_resolved(&self) -> bool {
        self.allocated == 0 && ((self.freed == 0) != (self.unallocated == 0))
    }
}

/// Reference counting for tensors that share one physical allocation.
///
/// The first member of a section to be allocated triggers the real
/// allocation; later members only compute their address from the recorded
/// section base. The section memory is released once no member holds it.
#[derive(Debug, Clone, Default)]
pub struct SectionTracker {
    members: HashMap<TensorId, Member>,
    sections: BTreeMap<u64, Section>,
    planned: HashSet<u64>,
}

impl SectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every section member of `store`
    pub fn from_store<S: TensorStore + ?Sized>(store: &S) -> Self {
        Self::from_store_where(store, |_| true)
    }

    /// Register the section members of `store` accepted by `predicate`
    pub fn from_store_where<S, F>(store: &S, predicate: F) -> Self
    where
        S: TensorStore + ?Sized,
        F: Fn(&TensorDesc) -> bool,
    {
        let mut tracker = Self::new();
        for id in store.ids() {
            let desc = store.desc(id);
            if desc.alias_of.is_none() && desc.section.is_some() && predicate(desc) {
                tracker.register(desc);
            }
        }
        tracker
    }

    /// Register a section member
    pub fn register(&mut self, desc: &TensorDesc) {
        let Some(info) = desc.section else {
            return;
        };
        if self.members.contains_key(&desc.id) {
            return;
        }

        let section = self.sections.entry(info.section_id).or_default();
        section.count += 1;
        section.unallocated += 1;
        section.size = section.size.max(info.offset_from_base + desc.size);
        section.alignment = section.alignment.max(desc.alignment.max(1));

        self.members.insert(
            desc.id,
            Member {
                section: info.section_id,
                offset_from_base: info.offset_from_base,
                state: MemberState::Unallocated,
            },
        );
    }

    /// Whether `tensor` belongs to a tracked section
    pub fn is_member(&self, tensor: TensorId) -> bool {
        self.members.contains_key(&tensor)
    }

    /// Section ID of a member
    pub fn section_of(&self, tensor: TensorId) -> Option<u64> {
        self.members.get(&tensor).map(|m| m.section)
    }

    /// Current state of a member
    pub fn state(&self, tensor: TensorId) -> Option<MemberState> {
        self.members.get(&tensor).map(|m| m.state)
    }

    /// Base address currently recorded for a section
    pub fn section_addr(&self, section: u64) -> Option<u64> {
        self.sections.get(&section).and_then(|s| s.addr)
    }

    /// Bytes covered by a section
    pub fn section_size(&self, section: u64) -> u64 {
        self.sections.get(&section).map_or(0, |s| s.size)
    }

    /// (unallocated, allocated, freed) counters of a section
    pub fn counters(&self, section: u64) -> Option<(usize, usize, usize)> {
        self.sections
            .get(&section)
            .map(|s| (s.unallocated, s.allocated, s.freed))
    }

    fn member(&self, tensor: TensorId) -> &Member {
        self.members
            .get(&tensor)
            .unwrap_or_else(|| panic!("tensor {} is not a member of any tracked section", tensor))
    }

    fn transition(&mut self, tensor: TensorId, to: MemberState) -> &mut Section {
        let member = self
            .members
            .get_mut(&tensor)
            .unwrap_or_else(|| panic!("tensor {} is not a member of any tracked section", tensor));
        let from = member.state;
        member.state = to;

        let section = self
            .sections
            .get_mut(&member.section)
            .unwrap_or_else(|| panic!("section {} of tensor {} is not tracked", member.section, tensor));
        *section.counter(from) -= 1;
        *section.counter(to) += 1;
        section
    }

    /// Move a member to the allocated state.
    ///
    /// Repeating the call for an allocated member returns its address
    /// again. Allocating a freed member without a rollback panics.
    pub fn mark_as_alloc(&mut self, tensor: TensorId) -> SectionAlloc {
        let member = self.member(tensor);
        let (section_id, offset_from_base, state) = (member.section, member.offset_from_base, member.state);

        if state == MemberState::Freed {
            let (unallocated, allocated, freed) = self.counters(section_id).unwrap_or_default();
            panic!(
                "tensor {} of section {} is allocated again after being freed \
                 (unallocated {}, allocated {}, freed {})",
                tensor, section_id, unallocated, allocated, freed
            );
        }
        if state == MemberState::Unallocated {
            self.transition(tensor, MemberState::Allocated);
        }

        let section = &self.sections[&section_id];
        match section.addr {
            Some(addr) => SectionAlloc::Offset(addr + offset_from_base),
            None => {
                log::trace!("section {}: first member {} needs an allocation", section_id, tensor);
                SectionAlloc::NeedsAllocation {
                    section: section_id,
                    size: section.size,
                    alignment: section.alignment,
                }
            }
        }
    }

    /// Record where the section memory was allocated
    pub fn set_section_base_addr(&mut self, section: u64, addr: u64) {
        let state = self
            .sections
            .get_mut(&section)
            .unwrap_or_else(|| panic!("section {} is not tracked", section));
        assert!(
            state.allocated > 0,
            "section {} gets base address 0x{:x} without any allocated member",
            section,
            addr
        );
        state.addr = Some(addr);
    }

    /// Move a member to freed, or back to unallocated when `rollback` is set.
    ///
    /// Returns true when the section memory should be released. The
    /// recorded base address is cleared in that case, so read it with
    /// `section_addr` first.
    pub fn mark_as_free(&mut self, tensor: TensorId, rollback: bool) -> bool {
        let member = self.member(tensor);
        let (section_id, state) = (member.section, member.state);

        let section = if rollback {
            if state == MemberState::Unallocated {
                return false;
            }
            self.transition(tensor, MemberState::Unallocated)
        } else {
            assert!(
                state == MemberState::Allocated,
                "tensor {} of section {} is freed while {:?}",
                tensor,
                section_id,
                state
            );
            self.transition(tensor, MemberState::Freed)
        };

        if section.addr.is_some() && section.fully_resolved() {
            section.addr = None;
            log::trace!("section {}: all members resolved, releasing", section_id);
            return true;
        }
        false
    }

    /// A member got a standalone allocation instead of its section slot.
    ///
    /// Returns the section base address if the section became fully
    /// unallocated while still holding memory; the caller must free it.
    pub fn handle_unallocated_fallback(&mut self, tensor: TensorId) -> Option<u64> {
        if self.member(tensor).state == MemberState::Freed {
            let section = self.transition(tensor, MemberState::Unallocated);
            if section.unallocated == section.count {
                return section.addr.take();
            }
        }
        None
    }

    /// Whether the section of `tensor` is already paid for in the current
    /// planning pass. The first call per unallocated section returns false.
    pub fn track_planned(&mut self, tensor: TensorId) -> bool {
        let section = self.member(tensor).section;
        if self.section_addr(section).is_some() {
            return true;
        }
        !self.planned.insert(section)
    }

    pub fn discard_planned(&mut self) {
        self.planned.clear();
    }

    /// Recount member states and compare them against the section counters
    pub fn check_consistency(&self) {
        let mut recount: BTreeMap<u64, Section> = BTreeMap::new();
        for member in self.members.values() {
            let section = recount.entry(member.section).or_default();
            section.count += 1;
            *section.counter(member.state) += 1;
        }

        for (id, section) in &self.sections {
            let expected = recount.remove(id).unwrap_or_default();
            assert!(
                section.unallocated + section.allocated + section.freed == section.count,
                "section {}: counters (unallocated {}, allocated {}, freed {}) do not sum to {} members",
                id,
                section.unallocated,
                section.allocated,
                section.freed,
                section.count
            );
            assert!(
                (section.unallocated, section.allocated, section.freed, section.count)
                    == (expected.unallocated, expected.allocated, expected.freed, expected.count),
                "section {}: counters (unallocated {}, allocated {}, freed {}) disagree with member states \
                 (unallocated {}, allocated {}, freed {})",
                id,
                section.unallocated,
                section.allocated,
                section.freed,
                expected.unallocated,
                expected.allocated,
                expected.freed
            );
        }
        assert!(recount.is_empty(), "members refer to untracked sections {:?}", recount.keys());
    }

    /// Assert that no section still holds memory
    pub fn verify_all_done(&self) {
        self.check_consistency();
        for (id, section) in &self.sections {
            assert!(
                section.allocated == 0 && section.addr.is_none(),
                "section {} still holds memory at {:?} (unallocated {}, allocated {}, freed {})",
                id,
                section.addr,
                section.unallocated,
                section.allocated,
                section.freed
            );
        }
    }

    /// Return every member to the unallocated state
    pub fn reset(&mut self) {
        for member in self.members.values_mut() {
            member.state = MemberState::Unallocated;
        }
        for section in self.sections.values_mut() {
            section.unallocated = section.count;
            section.allocated = 0;
            section.freed = 0;
            section.addr = None;
        }
        self.planned.clear();
    }
}
