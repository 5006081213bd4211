//! Graph Builder
//!
//! Builds the plan graph from configuration plus prior state, and the apply
//! graph from a plan's changes. Both are checked for cycles and for
//! providers that cannot be instantiated before any node runs.

use crate::addrs::{
    AbsResourceInstance, ConfigResource, InstanceKey, OutputAddr, ProviderConfigAddr,
};
use crate::config::{Config, Reference, Referenceable};
use crate::error::{Error, Result};
use crate::graph::{EdgeKind, Graph, NodeKind, ObjectRef, Phase, ResourceNode};
use crate::provider::ProviderFactories;
use crate::schema::Schemas;
use crate::state::State;
use crate::types::{Action, Plan, PlanMode, PlanOpts, ReplaceOrder, Target};
use petgraph::graph::NodeIndex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Something a node's configuration waits for
enum Upstream {
    Instance(AbsResourceInstance),
    Resource(ConfigResource),
    Output(OutputAddr),
}

fn resource_node(
    addr: &AbsResourceInstance,
    object: ObjectRef,
    phase: Phase,
    provider: &ProviderConfigAddr,
) -> NodeKind {
    NodeKind::Resource(ResourceNode {
        addr: addr.clone(),
        object,
        phase,
        provider: provider.clone(),
    })
}

struct Builder<'a> {
    config: &'a Config,
    graph: Graph,
    /// Nodes acting on the current object of each instance
    by_addr: HashMap<AbsResourceInstance, Vec<NodeIndex>>,
    /// Nodes that never call their provider
    without_provider: HashSet<NodeIndex>,
    /// References to a destroyed object order the consumer first
    apply: bool,
}

impl<'a> Builder<'a> {
    fn new(config: &'a Config, apply: bool) -> Self {
        Self {
            config,
            graph: Graph::new(),
            by_addr: HashMap::new(),
            without_provider: HashSet::new(),
            apply,
        }
    }

    fn add_current(&mut self, kind: NodeKind) -> NodeIndex {
        let addr = kind.resource_addr().cloned();
        let idx = self.graph.add(kind);
        if let Some(addr) = addr {
            self.by_addr.entry(addr).or_default().push(idx);
        }
        idx
    }

    fn upstreams(&self, kind: &NodeKind) -> Vec<Upstream> {
        let mut out = Vec::new();
        let rc = match kind {
            NodeKind::Resource(r)
                if r.object == ObjectRef::Current
                    && matches!(r.phase, Phase::Plan | Phase::Apply) =>
            {
                self.config.resource(&r.addr)
            }
            NodeKind::DataSource { addr, .. } => self.config.resource(addr),
            NodeKind::Output(addr) => {
                if let Some(oc) = self.config.output(addr) {
                    let refs = oc.value.references();
                    out.extend(refs.into_iter().filter_map(|r| upstream_of(&r.subject)));
                }
                None
            }
            NodeKind::ProviderConfig(addr) => {
                if let Some(pc) = self.config.provider(addr) {
                    out.extend(pc.references().into_iter().filter_map(|r| upstream_of(&r.subject)));
                }
                None
            }
            NodeKind::Resource(_) => None,
        };
        if let Some(rc) = rc {
            out.extend(rc.references().into_iter().filter_map(|r| upstream_of(&r.subject)));
            out.extend(rc.depends_on.iter().cloned().map(Upstream::Resource));
        }
        out
    }

    fn lookup(&self, upstream: &Upstream) -> Vec<NodeIndex> {
        match upstream {
            Upstream::Instance(addr) => match self.by_addr.get(addr) {
                Some(found) => found.clone(),
                None => self
                    .by_addr
                    .iter()
                    .filter(|(a, _)| a.same_resource(addr))
                    .flat_map(|(_, idx)| idx.iter().copied())
                    .collect(),
            },
            Upstream::Resource(cr) => self
                .by_addr
                .iter()
                .filter(|(a, _)| cr.contains(a))
                .flat_map(|(_, idx)| idx.iter().copied())
                .collect(),
            Upstream::Output(addr) => {
                let output = NodeKind::Output(addr.clone());
                self.graph.find(&output).into_iter().collect()
            }
        }
    }

    fn connect_references(&mut self) {
        let nodes: Vec<(NodeIndex, NodeKind)> =
            self.graph.nodes().map(|(i, k)| (i, k.clone())).collect();
        for (idx, kind) in nodes {
            for upstream in self.upstreams(&kind) {
                for target in self.lookup(&upstream) {
                    let destroyed = matches!(
                        self.graph.node(target),
                        NodeKind::Resource(r) if r.is_destroy()
                    );
                    match (destroyed, self.apply) {
                        (false, _) => self.graph.connect(target, idx, EdgeKind::Reference),
                        // read the value before the object goes away
                        (true, true) => self.graph.connect(idx, target, EdgeKind::Reference),
                        (true, false) => {}
                    }
                }
            }
        }
    }

    fn connect_providers(&mut self) {
        let users: Vec<(NodeIndex, ProviderConfigAddr)> = self
            .graph
            .nodes()
            .filter(|(i, _)| !self.without_provider.contains(i))
            .filter_map(|(i, k)| k.provider().map(|p| (i, p.clone())))
            .collect();
        for (idx, provider) in users {
            let p = self.graph.add(NodeKind::ProviderConfig(provider));
            self.graph.connect(p, idx, EdgeKind::Provider);
        }
    }

    fn resource_nodes(&self, phase: Phase) -> Vec<(NodeIndex, ResourceNode)> {
        self.graph
            .nodes()
            .filter_map(|(i, k)| match k {
                NodeKind::Resource(r) if r.phase == phase => Some((i, r.clone())),
                _ => None,
            })
            .collect()
    }

    /// Destroys wait for the destroys of everything that depended on them,
    /// and run before updates of what they depended on
    fn connect_destroy_order(&mut self, state: &State) {
        let destroys = self.resource_nodes(Phase::ApplyDestroy);
        let applies = self.resource_nodes(Phase::Apply);
        for (idx, node) in &destroys {
            let object = match &node.object {
                ObjectRef::Current | ObjectRef::Replaced => state.current(&node.addr),
                ObjectRef::Deposed(key) => state.deposed(&node.addr, key),
            };
            let Some(object) = object else {
                continue;
            };
            for dep in &object.dependencies {
                for (other, other_node) in &destroys {
                    if other_node.addr != node.addr && dep.contains(&other_node.addr) {
                        self.graph.connect(*idx, *other, EdgeKind::Destroy);
                    }
                }
                if node.object == ObjectRef::Replaced {
                    continue;
                }
                for (other, other_node) in &applies {
                    if other_node.object == ObjectRef::Current && dep.contains(&other_node.addr) {
                        self.graph.connect(*idx, *other, EdgeKind::Destroy);
                    }
                }
            }
        }
    }

    /// The original of a create-before-destroy replacement goes only after
    /// everything depending on it has moved to the successor
    fn connect_replacements(&mut self) {
        let replaced: Vec<(NodeIndex, ResourceNode)> = self
            .resource_nodes(Phase::ApplyDestroy)
            .into_iter()
            .filter(|(_, r)| r.object == ObjectRef::Replaced)
            .collect();
        if replaced.is_empty() {
            return;
        }
        let dependents: Vec<(NodeIndex, AbsResourceInstance, BTreeSet<ConfigResource>)> = self
            .resource_nodes(Phase::Apply)
            .into_iter()
            .map(|(i, r)| {
                let deps = self.config.dependencies_of(&r.addr);
                (i, r.addr, deps)
            })
            .collect();
        for (repl, node) in &replaced {
            let resource = node.addr.config_resource();
            for (idx, addr, deps) in &dependents {
                if addr != &node.addr && deps.contains(&resource) {
                    self.graph.connect(*idx, *repl, EdgeKind::Replace);
                }
            }
        }
    }

    fn prune_to_ancestors(&mut self, seeds: Vec<NodeIndex>) {
        let keep = self.graph.ancestors(seeds);
        self.graph.retain(&keep);
    }

    /// Every reference must name something the configuration declares
    fn check_references(&self) -> Result<()> {
        let config = self.config;
        for rc in config.resources.values() {
            for expr in rc.body.values() {
                for r in expr.references() {
                    check_reference(config, &rc.addr, r, false)?;
                }
            }
            let mut in_conditions = Vec::new();
            for cond in rc.lifecycle.preconditions.iter().chain(&rc.lifecycle.postconditions) {
                cond.check.collect_references(&mut in_conditions);
            }
            for r in in_conditions {
                check_reference(config, &rc.addr, r, true)?;
            }
        }
        for pc in config.providers.values() {
            for r in pc.references() {
                check_reference(config, &pc.addr, r, false)?;
            }
        }
        for oc in config.outputs.values() {
            for r in oc.value.references() {
                check_reference(config, &oc.addr, r, false)?;
            }
        }
        Ok(())
    }

    fn finish(self, factories: &ProviderFactories, schemas: &Schemas) -> Result<Graph> {
        self.check_references()?;
        for (_, kind) in self.graph.nodes() {
            match kind {
                NodeKind::ProviderConfig(addr) if !factories.contains(&addr.provider) => {
                    return Err(Error::configuration(format!(
                        "{addr} is required, but no provider named {:?} is available",
                        addr.provider
                    )));
                }
                NodeKind::Resource(ResourceNode {
                    addr,
                    provider,
                    phase: Phase::Plan | Phase::Apply,
                    ..
                })
                | NodeKind::DataSource { addr, provider } => {
                    let supported = schemas.provider(&provider.provider).is_none()
                        || schemas.resource(&provider.provider, &addr.resource).is_some();
                    if !supported {
                        let what = if addr.is_data() { "data source" } else { "resource type" };
                        return Err(Error::configuration(format!(
                            "provider {:?} does not support {what} {:?}",
                            provider.provider, addr.resource.type_name
                        )));
                    }
                }
                _ => {}
            }
        }
        self.graph.check_acyclic()?;
        log::debug!(
            "built graph with {} nodes and {} edges",
            self.graph.len(),
            self.graph.edge_count()
        );
        Ok(self.graph)
    }
}

fn check_reference(
    config: &Config,
    owner: &dyn fmt::Display,
    reference: &Reference,
    in_condition: bool,
) -> Result<()> {
    let declared = match &reference.subject {
        Referenceable::Resource(addr) => {
            config.resources.contains_key(addr)
                || (addr.key == InstanceKey::NoKey
                    && config.resources.keys().any(|a| a.same_resource(addr)))
        }
        Referenceable::Variable(addr) => config.variables.contains_key(addr),
        Referenceable::Output(addr) => config.outputs.contains_key(addr),
        Referenceable::SelfObject => {
            if in_condition {
                return Ok(());
            }
            return Err(Error::configuration(format!(
                "{owner}: self can only be used in the conditions of a resource"
            )));
        }
    };
    if declared {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "{owner} refers to {reference}, which is not declared"
        )))
    }
}

fn upstream_of(subject: &Referenceable) -> Option<Upstream> {
    match subject {
        Referenceable::Resource(addr) => Some(Upstream::Instance(addr.clone())),
        Referenceable::Output(addr) => Some(Upstream::Output(addr.clone())),
        Referenceable::Variable(_) | Referenceable::SelfObject => None,
    }
}

/// Instances a targeted destroy removes: the targets plus everything whose
/// recorded dependencies lead to them
fn destroy_targets(state: &State, targets: &[Target]) -> HashSet<AbsResourceInstance> {
    let mut selected: HashSet<AbsResourceInstance> = state
        .instances()
        .filter(|e| !e.addr.is_data() && targets.iter().any(|t| t.matches(&e.addr)))
        .map(|e| e.addr)
        .collect();
    loop {
        let mut grew = false;
        for entry in state.instances() {
            if entry.addr.is_data() || selected.contains(&entry.addr) {
                continue;
            }
            let objects = entry.state.current.iter().chain(entry.state.deposed.values());
            let depends = objects
                .flat_map(|o| o.dependencies.iter())
                .any(|dep| selected.iter().any(|s| dep.contains(s)));
            if depends {
                selected.insert(entry.addr);
                grew = true;
            }
        }
        if !grew {
            return selected;
        }
    }
}

/// Build the graph walked by [`Context::plan`](crate::Context::plan)
pub fn plan_graph(
    config: &Config,
    state: &State,
    opts: &PlanOpts,
    factories: &ProviderFactories,
    schemas: &Schemas,
) -> Result<Graph> {
    let destroy = opts.mode == PlanMode::Destroy;
    let mut b = Builder::new(config, false);

    for rc in config.resources.values() {
        if rc.is_data() {
            b.add_current(NodeKind::DataSource {
                addr: rc.addr.clone(),
                provider: rc.provider.clone(),
            });
        } else if !destroy {
            b.add_current(resource_node(&rc.addr, ObjectRef::Current, Phase::Plan, &rc.provider));
        }
    }

    for entry in state.instances() {
        if entry.addr.is_data() {
            continue;
        }
        let configured = config.resource(&entry.addr);
        let provider = configured.map_or(entry.provider, |rc| &rc.provider);
        if entry.state.current.is_some() && (destroy || configured.is_none()) {
            b.add_current(resource_node(
                &entry.addr,
                ObjectRef::Current,
                Phase::PlanDestroy,
                provider,
            ));
        }
        for key in entry.state.deposed.keys() {
            b.graph.add(resource_node(
                &entry.addr,
                ObjectRef::Deposed(key.clone()),
                Phase::PlanDestroy,
                provider,
            ));
        }
    }

    for addr in config.outputs.keys() {
        b.graph.add(NodeKind::Output(addr.clone()));
    }

    b.connect_providers();
    b.connect_references();

    if destroy {
        let targeted = (!opts.targets.is_empty()).then(|| destroy_targets(state, &opts.targets));
        let seeds = b
            .graph
            .nodes()
            .filter(|(_, k)| match k {
                NodeKind::Resource(r) => {
                    r.phase == Phase::PlanDestroy
                        && targeted.as_ref().is_none_or(|t| t.contains(&r.addr))
                }
                _ => false,
            })
            .map(|(i, _)| i)
            .collect();
        b.prune_to_ancestors(seeds);
    } else if !opts.targets.is_empty() {
        let seeds = b
            .graph
            .nodes()
            .filter(|(_, k)| {
                k.resource_addr()
                    .is_some_and(|a| opts.targets.iter().any(|t| t.matches(a)))
            })
            .map(|(i, _)| i)
            .collect();
        b.prune_to_ancestors(seeds);
    }

    b.finish(factories, schemas)
}

/// Build the graph walked by [`Context::apply`](crate::Context::apply)
pub fn apply_graph(
    config: &Config,
    plan: &Plan,
    factories: &ProviderFactories,
    schemas: &Schemas,
) -> Result<Graph> {
    let destroy = plan.mode == PlanMode::Destroy;
    let mut b = Builder::new(config, true);

    for change in &plan.changes.resources {
        let addr = &change.addr;
        let provider = &change.provider;
        match (&change.deposed, change.action) {
            (Some(key), _) => {
                b.graph.add(resource_node(
                    addr,
                    ObjectRef::Deposed(key.clone()),
                    Phase::ApplyDestroy,
                    provider,
                ));
            }
            (None, Action::Read) => {
                b.add_current(NodeKind::DataSource {
                    addr: addr.clone(),
                    provider: provider.clone(),
                });
            }
            (None, Action::Delete) => {
                b.add_current(resource_node(
                    addr,
                    ObjectRef::Current,
                    Phase::ApplyDestroy,
                    provider,
                ));
            }
            (None, Action::Replace(ReplaceOrder::CreateThenDelete)) => {
                let create =
                    b.add_current(resource_node(addr, ObjectRef::Current, Phase::Apply, provider));
                let original = b.graph.add(resource_node(
                    addr,
                    ObjectRef::Replaced,
                    Phase::ApplyDestroy,
                    provider,
                ));
                b.graph.connect(create, original, EdgeKind::Replace);
            }
            (None, action) => {
                let idx =
                    b.add_current(resource_node(addr, ObjectRef::Current, Phase::Apply, provider));
                if action == Action::NoOp {
                    b.without_provider.insert(idx);
                }
            }
        }
    }

    for addr in config.outputs.keys() {
        if !destroy || !addr.module.is_root() {
            b.graph.add(NodeKind::Output(addr.clone()));
        }
    }

    b.connect_providers();
    b.connect_references();
    b.connect_destroy_order(&plan.prior_state);
    b.connect_replacements();

    if destroy {
        let seeds = b
            .graph
            .nodes()
            .filter(|(_, k)| k.resource_addr().is_some())
            .map(|(i, _)| i)
            .collect();
        b.prune_to_ancestors(seeds);
    }

    b.finish(factories, schemas)
}
