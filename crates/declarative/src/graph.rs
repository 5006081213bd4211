//! Dependency graph arena
//!
//! Nodes live in a petgraph [`DiGraph`] and are addressed by [`NodeIndex`].
//! Edges point from an upstream node to the node that depends on it, so a
//! topological walk visits providers and referenced resources first.

use crate::addrs::{AbsResourceInstance, DeposedKey, OutputAddr, ProviderConfigAddr};
use crate::error::{Error, Result};
use petgraph::Direction;
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Which object of a resource instance a node acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    Current,
    /// A deposed object recorded in prior state
    Deposed(DeposedKey),
    /// The original of a create-before-destroy replacement, deposed while
    /// the current operation runs
    Replaced,
}

/// What a resource node does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Refresh and diff against configuration
    Plan,
    /// Refresh and plan a delete
    PlanDestroy,
    /// Apply a create, update, in-place replace or no-op change
    Apply,
    /// Apply a delete
    ApplyDestroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceNode {
    pub addr: AbsResourceInstance,
    pub object: ObjectRef,
    pub phase: Phase,
    pub provider: ProviderConfigAddr,
}

impl ResourceNode {
    pub const fn is_destroy(&self) -> bool {
        matches!(self.phase, Phase::PlanDestroy | Phase::ApplyDestroy)
    }
}

/// One vertex of the graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Resource(ResourceNode),
    DataSource {
        addr: AbsResourceInstance,
        provider: ProviderConfigAddr,
    },
    ProviderConfig(ProviderConfigAddr),
    Output(OutputAddr),
}

impl NodeKind {
    /// Resource instance the node acts on, if any
    pub const fn resource_addr(&self) -> Option<&AbsResourceInstance> {
        match self {
            Self::Resource(r) => Some(&r.addr),
            Self::DataSource { addr, .. } => Some(addr),
            Self::ProviderConfig(_) | Self::Output(_) => None,
        }
    }

    /// Provider configuration the node calls, if any
    pub const fn provider(&self) -> Option<&ProviderConfigAddr> {
        match self {
            Self::Resource(r) => Some(&r.provider),
            Self::DataSource { provider, .. } => Some(provider),
            Self::ProviderConfig(_) | Self::Output(_) => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(r) => {
                write!(f, "{}", r.addr)?;
                match (&r.object, r.is_destroy()) {
                    (ObjectRef::Current, false) => Ok(()),
                    (ObjectRef::Current, true) => f.write_str(" (destroy)"),
                    (ObjectRef::Deposed(key), _) => write!(f, " (deposed {key})"),
                    (ObjectRef::Replaced, _) => f.write_str(" (destroy deposed)"),
                }
            }
            Self::DataSource { addr, .. } => write!(f, "{addr}"),
            Self::ProviderConfig(addr) => write!(f, "{addr}"),
            Self::Output(addr) => write!(f, "{addr}"),
        }
    }
}

/// Why an edge exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Expression reference or `depends_on`
    Reference,
    /// Node calls the provider
    Provider,
    /// Destroy ordering derived from recorded dependencies
    Destroy,
    /// Create-before-destroy sequencing
    Replace,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reference => "ref",
            Self::Provider => "provider",
            Self::Destroy => "destroy",
            Self::Replace => "replace",
        })
    }
}

/// A dependency graph of plan or apply nodes
#[derive(Debug, Clone, Default)]
pub struct Graph {
    inner: DiGraph<NodeKind, EdgeKind>,
    index: HashMap<NodeKind, NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, returning the existing index if it is already present
    pub fn add(&mut self, kind: NodeKind) -> NodeIndex {
        if let Some(idx) = self.index.get(&kind) {
            return *idx;
        }
        let idx = self.inner.add_node(kind.clone());
        self.index.insert(kind, idx);
        idx
    }

    pub fn find(&self, kind: &NodeKind) -> Option<NodeIndex> {
        self.index.get(kind).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> &NodeKind {
        &self.inner[idx]
    }

    /// Make `dependent` wait for `upstream`
    pub fn connect(&mut self, upstream: NodeIndex, dependent: NodeIndex, kind: EdgeKind) {
        if upstream == dependent || self.inner.find_edge(upstream, dependent).is_some() {
            return;
        }
        log::trace!(
            "edge {} -> {} ({kind})",
            self.inner[upstream],
            self.inner[dependent]
        );
        self.inner.add_edge(upstream, dependent, kind);
    }

    pub fn len(&self) -> usize {
        self.inner.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.inner.node_indices()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &NodeKind)> {
        self.inner.node_indices().map(|i| (i, &self.inner[i]))
    }

    pub fn upstream(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.inner.neighbors_directed(idx, Direction::Incoming)
    }

    pub fn downstream(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.inner.neighbors_directed(idx, Direction::Outgoing)
    }

    /// True if `dependent` (transitively) waits for `upstream`
    pub fn depends_on(&self, dependent: &NodeKind, upstream: &NodeKind) -> bool {
        match (self.find(dependent), self.find(upstream)) {
            (Some(d), Some(u)) => self.ancestors([d]).contains(&u),
            _ => false,
        }
    }

    /// The seeds plus everything they transitively wait for
    pub fn ancestors(&self, seeds: impl IntoIterator<Item = NodeIndex>) -> HashSet<NodeIndex> {
        self.closure(seeds, Direction::Incoming)
    }

    /// The seeds plus everything that transitively waits for them
    pub fn descendants(&self, seeds: impl IntoIterator<Item = NodeIndex>) -> HashSet<NodeIndex> {
        self.closure(seeds, Direction::Outgoing)
    }

    fn closure(
        &self,
        seeds: impl IntoIterator<Item = NodeIndex>,
        direction: Direction,
    ) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = seeds.into_iter().collect();
        while let Some(idx) = queue.pop_front() {
            if seen.insert(idx) {
                queue.extend(self.inner.neighbors_directed(idx, direction));
            }
        }
        seen
    }

    /// Drop every node not in `keep`. Indices are reassigned.
    pub fn retain(&mut self, keep: &HashSet<NodeIndex>) {
        let inner = self
            .inner
            .filter_map(|i, n| keep.contains(&i).then(|| n.clone()), |_, e| Some(*e));
        self.index = inner
            .node_indices()
            .map(|i| (inner[i].clone(), i))
            .collect();
        self.inner = inner;
    }

    /// Fail if the graph has a cycle, naming its nodes
    pub fn check_acyclic(&self) -> Result<()> {
        for scc in petgraph::algo::tarjan_scc(&self.inner) {
            let self_loop = scc.len() == 1 && self.inner.find_edge(scc[0], scc[0]).is_some();
            if scc.len() > 1 || self_loop {
                let mut cycle: Vec<String> =
                    scc.iter().map(|i| self.inner[*i].to_string()).collect();
                cycle.sort();
                return Err(Error::GraphCycle { cycle });
            }
        }
        Ok(())
    }

    /// Render as Graphviz DOT
    pub fn to_dot(&self) -> String {
        Dot::new(&self.inner).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(addr: &str, phase: Phase) -> NodeKind {
        NodeKind::Resource(ResourceNode {
            addr: addr.parse().unwrap(),
            object: ObjectRef::Current,
            phase,
            provider: ProviderConfigAddr::root("test"),
        })
    }

    #[test]
    fn test_add_deduplicates() {
        let mut g = Graph::new();
        let a = g.add(res("test_object.a", Phase::Apply));
        assert_eq!(g.add(res("test_object.a", Phase::Apply)), a);
        let d = g.add(res("test_object.a", Phase::ApplyDestroy));
        assert_ne!(a, d);
        g.connect(a, d, EdgeKind::Replace);
        g.connect(a, d, EdgeKind::Replace);
        g.connect(a, a, EdgeKind::Reference);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_closures_and_retain() {
        let mut g = Graph::new();
        let p = g.add(NodeKind::ProviderConfig(ProviderConfigAddr::root("test")));
        let a = g.add(res("test_object.a", Phase::Plan));
        let b = g.add(res("test_object.b", Phase::Plan));
        let c = g.add(res("test_object.c", Phase::Plan));
        g.connect(p, a, EdgeKind::Provider);
        g.connect(a, b, EdgeKind::Reference);

        let up = g.ancestors([b]);
        assert_eq!(up.len(), 3);
        assert!(!up.contains(&c));
        assert_eq!(g.descendants([a]).len(), 2);

        g.retain(&up);
        assert_eq!(g.len(), 3);
        assert!(g.find(&res("test_object.c", Phase::Plan)).is_none());
        let provider = NodeKind::ProviderConfig(ProviderConfigAddr::root("test"));
        assert!(g.depends_on(&res("test_object.b", Phase::Plan), &provider));
    }

    #[test]
    fn test_cycle_detection() {
        let mut g = Graph::new();
        let a = g.add(res("test_object.a", Phase::ApplyDestroy));
        let b = g.add(res("test_object.b", Phase::ApplyDestroy));
        g.connect(a, b, EdgeKind::Destroy);
        assert!(g.check_acyclic().is_ok());
        g.connect(b, a, EdgeKind::Destroy);

        let err = g.check_acyclic().unwrap_err();
        assert!(err.is_cycle());
        assert_eq!(
            err.to_string(),
            "Cycle: test_object.a (destroy), test_object.b (destroy)"
        );
    }

    #[test]
    fn test_display_and_dot() {
        let node = NodeKind::Resource(ResourceNode {
            addr: "test_object.a".parse().unwrap(),
            object: ObjectRef::Deposed("00000001".parse().unwrap()),
            phase: Phase::ApplyDestroy,
            provider: ProviderConfigAddr::root("test"),
        });
        assert_eq!(node.to_string(), "test_object.a (deposed 00000001)");

        let mut g = Graph::new();
        let p = g.add(NodeKind::ProviderConfig(ProviderConfigAddr::root("test")));
        let n = g.add(node);
        g.connect(p, n, EdgeKind::Provider);
        let dot = g.to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("provider"));
    }
}
