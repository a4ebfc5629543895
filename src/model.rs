use std::collections::HashMap;
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Unique identifier for a node in the execution schedule
pub type NodeId = usize;

/// Unique identifier for a tensor
pub type TensorId = usize;

/// Memory tier a tensor is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Small, fast, capacity-constrained memory
    Fast,
    /// Large, slow memory
    Slow,
    /// Not placed yet
    Undefined,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Undefined
    }
}

/// Membership of a tensor in a shared (non-persistent) section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionInfo {
    /// Section identifier shared by all members
    pub section_id: u64,
    /// Byte offset of this tensor from the section base
    pub offset_from_base: u64,
    /// Fixed buffering level of the section, if any
    pub buffering_level: Option<u32>,
}

impl SectionInfo {
    pub fn new(section_id: u64, offset_from_base: u64) -> Self {
        Self {
            section_id,
            offset_from_base,
            buffering_level: None,
        }
    }

    pub fn with_buffering_level(mut self, level: u32) -> Self {
        self.buffering_level = Some(level);
        self
    }
}

/// Memory requirements of a tensor, as produced by the graph builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    /// Tensor ID, assigned by the owning store
    pub id: TensorId,
    /// Tensor name (diagnostics only)
    pub name: String,
    /// Required size in bytes
    pub size: u64,
    /// Required alignment in bytes
    pub alignment: u64,
    /// Fixed byte offset of the data inside its allocation
    pub offset: u64,
    /// Persistent / graph boundary tensor
    pub persistent: bool,
    /// Real tensor this one aliases, if any
    pub alias_of: Option<TensorId>,
    /// Shared section membership, if any
    pub section: Option<SectionInfo>,
    /// Tier the compiler would like this tensor in
    pub preferred_tier: Tier,
}

impl TensorDesc {
    /// Create a tensor descriptor with byte alignment and no offset
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            size,
            alignment: 1,
            offset: 0,
            persistent: false,
            alias_of: None,
            section: None,
            preferred_tier: Tier::Fast,
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn aliasing(mut self, real: TensorId) -> Self {
        self.alias_of = Some(real);
        self
    }

    pub fn in_section(mut self, section: SectionInfo) -> Self {
        self.section = Some(section);
        self
    }

    pub fn prefer(mut self, tier: Tier) -> Self {
        self.preferred_tier = tier;
        self
    }

    /// Size including offset, rounded up to the alignment
    pub fn padded_size(&self) -> u64 {
        round_up(self.size + self.offset, self.alignment)
    }
}

/// Committed location of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub tier: Tier,
    pub offset: u64,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@0x{:x}", self.tier, self.offset)
    }
}

/// Read/write access to the tensors owned by the surrounding compiler.
///
/// The allocation engine never owns tensors. It only reads their
/// requirements and writes back their committed placement.
pub trait TensorStore {
    /// Descriptor of a tensor. Unknown IDs are a caller bug.
    fn desc(&self, id: TensorId) -> &TensorDesc;

    /// Number of tensors in the store
    fn len(&self) -> usize;

    /// Whether the store holds no tensors
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All tensor IDs in ascending order
    fn ids(&self) -> Vec<TensorId>;

    /// Committed placement of the real tensor behind `id`
    fn placement(&self, id: TensorId) -> Option<Placement>;

    /// Write the committed placement of `id`
    fn commit(&mut self, id: TensorId, placement: Placement);

    /// Forget the committed placement of `id`
    fn clear_placement(&mut self, id: TensorId);

    /// Follow the alias chain of `id` down to the tensor that owns memory
    fn real_tensor(&self, id: TensorId) -> TensorId {
        let mut current = id;
        let mut hops = 0;
        while let Some(next) = self.desc(current).alias_of {
            hops += 1;
            assert!(
                hops <= self.len(),
                "alias cycle detected while resolving tensor {}",
                id
            );
            current = next;
        }
        current
    }
}

/// In-memory tensor store indexed by tensor ID
#[derive(Debug, Clone, Default)]
pub struct TensorTable {
    tensors: Vec<TensorDesc>,
    placements: Vec<Option<Placement>>,
}

impl TensorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor and return its assigned ID
    pub fn add(&mut self, mut desc: TensorDesc) -> TensorId {
        let id = self.tensors.len();
        desc.id = id;
        self.tensors.push(desc);
        self.placements.push(None);
        id
    }

    /// Look up a tensor by name
    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.tensors.iter().position(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorDesc> {
        self.tensors.iter()
    }
}

impl TensorStore for TensorTable {
    fn desc(&self, id: TensorId) -> &TensorDesc {
        self.tensors
            .get(id)
            .unwrap_or_else(|| panic!("unknown tensor id {}", id))
    }

    fn len(&self) -> usize {
        self.tensors.len()
    }

    fn ids(&self) -> Vec<TensorId> {
        (0..self.tensors.len()).collect()
    }

    fn placement(&self, id: TensorId) -> Option<Placement> {
        let real = self.real_tensor(id);
        self.placements[real]
    }

    fn commit(&mut self, id: TensorId, placement: Placement) {
        let real = self.real_tensor(id);
        self.placements[real] = Some(placement);
    }

    fn clear_placement(&mut self, id: TensorId) {
        let real = self.real_tensor(id);
        self.placements[real] = None;
    }
}

/// A node in the execution schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Self {
        Self {
            id,
            name: name.into(),
            inputs,
            outputs,
        }
    }

    /// Inputs followed by outputs
    pub fn operands(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.inputs.iter().chain(self.outputs.iter()).copied()
    }
}

/// Nodes in execution order. A node's step is its position in the list.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSchedule {
    nodes: Vec<Node>,
    steps: HashMap<NodeId, usize>,
}

impl ExecutionSchedule {
    /// Create a schedule from nodes already in execution order
    pub fn new(nodes: Vec<Node>) -> Self {
        let steps = nodes.iter().enumerate().map(|(step, n)| (n.id, step)).collect();
        Self { nodes, steps }
    }

    /// Append a node and return its ID (equal to its step)
    pub fn push(&mut self, name: impl Into<String>, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> NodeId {
        let id = self.nodes.len();
        self.steps.insert(id, id);
        self.nodes.push(Node::new(id, name, inputs, outputs));
        id
    }

    /// Order an unordered node set so every producer runs before its consumers
    pub fn from_dependencies(nodes: Vec<Node>) -> Result<Self> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();

        let mut producers: HashMap<TensorId, usize> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for &out in &node.outputs {
                if let Some(prev) = producers.insert(out, i) {
                    return Err(Error::InvalidGraph(format!(
                        "Tensor {} is produced by both node {} and node {}",
                        out, nodes[prev].name, node.name
                    )));
                }
            }
        }

        for (i, node) in nodes.iter().enumerate() {
            for input in &node.inputs {
                if let Some(&producer) = producers.get(input) {
                    if producer != i {
                        graph.update_edge(indices[producer], indices[i], ());
                    }
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            Error::InvalidGraph(format!(
                "Cycle detected in graph at node {}",
                nodes[graph[cycle.node_id()]].name
            ))
        })?;

        let mut slots: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
        let ordered = order
            .into_iter()
            .filter_map(|idx| slots[graph[idx]].take())
            .collect();
        Ok(Self::new(ordered))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Execution step of a node
    pub fn step_of(&self, node: NodeId) -> usize {
        *self
            .steps
            .get(&node)
            .unwrap_or_else(|| panic!("node {} is not part of the schedule", node))
    }
}

/// Round `value` up to a multiple of `alignment` (alignment 0 and 1 are no-ops)
pub fn round_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}
