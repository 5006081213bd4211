//! Evaluated configuration
//!
//! The engine does not parse a configuration language. It consumes an
//! already-expanded set of resource instances, providers, outputs and
//! variables whose attribute values are expression trees: literal values
//! with references still to be resolved against the walk's current values.

use crate::addrs::{
    AbsResourceInstance, ConfigResource, ModuleInstance, OutputAddr, ProviderConfigAddr,
    ResourceMode, Steps, VariableAddr, tokenize,
};
use crate::conditions::{Check, Condition};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use valuekit::{Path, PathStep, Value};

// ============================================================================
// References and expressions
// ============================================================================

/// What a reference points at
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Referenceable {
    Resource(AbsResourceInstance),
    Variable(VariableAddr),
    Output(OutputAddr),
    /// The resource a condition is attached to
    SelfObject,
}

/// A subject plus a path into its value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    pub subject: Referenceable,
    pub path: Path,
}

impl Reference {
    /// Parse a traversal like `test_object.a.id`, `var.x`, `module.m.out`
    /// or `self.output`, relative to `module`
    pub fn parse(input: &str, module: &ModuleInstance) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut steps = Steps::new(input, &tokens);

        let subject = match steps.peek_name() {
            Some("var") => {
                steps.keyword("var");
                Referenceable::Variable(VariableAddr {
                    module: module.clone(),
                    name: steps.name("variable name")?,
                })
            }
            Some("self") => {
                steps.keyword("self");
                Referenceable::SelfObject
            }
            Some("module") => {
                steps.keyword("module");
                let call = steps.name("module call name")?;
                let key = steps.key();
                Referenceable::Output(OutputAddr {
                    module: module.child(call, key),
                    name: steps.name("module output name")?,
                })
            }
            _ => {
                let resource = steps.resource()?;
                let key = steps.key();
                Referenceable::Resource(AbsResourceInstance::new(module.clone(), resource, key))
            }
        };

        Ok(Self {
            subject,
            path: steps.rest_as_path(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Referenceable::Resource(addr) => write!(f, "{}", addr.resource)?,
            Referenceable::Variable(v) => write!(f, "var.{}", v.name)?,
            Referenceable::Output(o) => match o.module.steps().last() {
                Some(call) => write!(f, "module.{}{}.{}", call.name, call.key, o.name)?,
                None => write!(f, "output.{}", o.name)?,
            },
            Referenceable::SelfObject => write!(f, "self")?,
        }
        if let Referenceable::Resource(addr) = &self.subject {
            write!(f, "{}", addr.key)?;
        }
        match self.path.first() {
            None => Ok(()),
            Some(PathStep::Key(_)) => write!(f, ".{}", self.path),
            Some(PathStep::Index(_)) => write!(f, "{}", self.path),
        }
    }
}

/// An attribute expression: a value tree with unresolved references
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Object(BTreeMap<String, Expr>),
    List(Vec<Expr>),
    Reference(Reference),
    /// Marks the result sensitive as a whole
    Sensitive(Box<Expr>),
    /// String concatenation
    Template(Vec<Expr>),
}

impl Expr {
    pub fn reference(input: &str, module: &ModuleInstance) -> Result<Self> {
        Reference::parse(input, module).map(Self::Reference)
    }

    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn sensitive(inner: Self) -> Self {
        Self::Sensitive(Box::new(inner))
    }

    /// Every reference in the tree
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    pub(crate) fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Object(attrs) => attrs.values().for_each(|e| e.collect_references(out)),
            Self::List(items) | Self::Template(items) => {
                items.iter().for_each(|e| e.collect_references(out));
            }
            Self::Reference(r) => out.push(r),
            Self::Sensitive(inner) => inner.collect_references(out),
        }
    }

    /// Parse the JSON encoding.
    ///
    /// `{"$ref": "..."}`, `{"$sensitive": expr}`, `{"$template": [..]}` and
    /// `{"$unknown": true}` are special; every other object, array or
    /// scalar is taken literally (recursively).
    pub fn from_json(json: &serde_json::Value, module: &ModuleInstance) -> Result<Self> {
        use serde_json::Value as J;
        match json {
            J::Object(m) if m.len() == 1 => {
                let Some((key, inner)) = m.iter().next() else {
                    return Ok(Self::Object(BTreeMap::new()));
                };
                match (key.as_str(), inner) {
                    ("$ref", J::String(r)) => Self::reference(r, module),
                    ("$ref", _) => Err(Error::document("$ref must be a string")),
                    ("$sensitive", e) => Ok(Self::sensitive(Self::from_json(e, module)?)),
                    ("$template", J::Array(parts)) => parts
                        .iter()
                        .map(|p| Self::from_json(p, module))
                        .collect::<Result<Vec<_>>>()
                        .map(Self::Template),
                    ("$template", _) => Err(Error::document("$template must be an array")),
                    (valuekit::UNKNOWN_SENTINEL, _) => Ok(Self::Literal(Value::from_json(json))),
                    _ => Self::object_from_json(m, module),
                }
            }
            J::Object(m) => Self::object_from_json(m, module),
            J::Array(items) => items
                .iter()
                .map(|i| Self::from_json(i, module))
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            scalar => Ok(Self::Literal(Value::from_json(scalar))),
        }
    }

    fn object_from_json(
        m: &serde_json::Map<String, serde_json::Value>,
        module: &ModuleInstance,
    ) -> Result<Self> {
        m.iter()
            .map(|(k, v)| Ok((k.clone(), Self::from_json(v, module)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Self::Object)
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Self::Literal(Value::from(s))
    }
}

// ============================================================================
// Blocks
// ============================================================================

/// Which attribute changes to disregard when diffing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IgnoreChanges {
    #[default]
    Nothing,
    All,
    Paths(Vec<Path>),
}

/// Per-resource lifecycle policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lifecycle {
    pub create_before_destroy: bool,
    pub prevent_destroy: bool,
    pub ignore_changes: IgnoreChanges,
    pub preconditions: Vec<Condition>,
    pub postconditions: Vec<Condition>,
}

/// One expanded resource instance
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    pub addr: AbsResourceInstance,
    pub provider: ProviderConfigAddr,
    /// Top-level attribute expressions
    pub body: BTreeMap<String, Expr>,
    pub depends_on: Vec<ConfigResource>,
    pub lifecycle: Lifecycle,
}

impl ResourceConfig {
    /// A resource using the default configuration of its implied provider
    pub fn new(addr: AbsResourceInstance) -> Self {
        let provider = ProviderConfigAddr::root(addr.resource.implied_provider());
        Self {
            addr,
            provider,
            body: BTreeMap::new(),
            depends_on: Vec::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn with_provider(mut self, provider: ProviderConfigAddr) -> Self {
        self.provider = provider;
        self
    }

    pub fn attr(mut self, name: impl Into<String>, expr: impl Into<Expr>) -> Self {
        self.body.insert(name.into(), expr.into());
        self
    }

    pub fn depends_on(mut self, resource: ConfigResource) -> Self {
        self.depends_on.push(resource);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn is_data(&self) -> bool {
        self.addr.is_data()
    }

    /// References in the body and conditions, excluding `self`
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        for expr in self.body.values() {
            expr.collect_references(&mut out);
        }
        for cond in self
            .lifecycle
            .preconditions
            .iter()
            .chain(&self.lifecycle.postconditions)
        {
            cond.check.collect_references(&mut out);
        }
        out.retain(|r| r.subject != Referenceable::SelfObject);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub addr: ProviderConfigAddr,
    pub body: BTreeMap<String, Expr>,
}

impl ProviderConfig {
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        for expr in self.body.values() {
            expr.collect_references(&mut out);
        }
        out
    }

    /// Module instance in which the body's references resolve
    pub fn module(&self) -> ModuleInstance {
        self.addr.module.to_instance()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub addr: OutputAddr,
    pub value: Expr,
    pub sensitive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableConfig {
    pub addr: VariableAddr,
    pub value: Value,
    pub sensitive: bool,
}

// ============================================================================
// Config
// ============================================================================

/// The whole evaluated configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub variables: BTreeMap<VariableAddr, VariableConfig>,
    pub providers: BTreeMap<ProviderConfigAddr, ProviderConfig>,
    pub resources: BTreeMap<AbsResourceInstance, ResourceConfig>,
    pub outputs: BTreeMap<OutputAddr, OutputConfig>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, resource: ResourceConfig) -> Self {
        self.resources.insert(resource.addr.clone(), resource);
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.insert(provider.addr.clone(), provider);
        self
    }

    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.outputs.insert(output.addr.clone(), output);
        self
    }

    pub fn with_variable(mut self, variable: VariableConfig) -> Self {
        self.variables.insert(variable.addr.clone(), variable);
        self
    }

    pub fn resource(&self, addr: &AbsResourceInstance) -> Option<&ResourceConfig> {
        self.resources.get(addr)
    }

    pub fn provider(&self, addr: &ProviderConfigAddr) -> Option<&ProviderConfig> {
        self.providers.get(addr)
    }

    pub fn output(&self, addr: &OutputAddr) -> Option<&OutputConfig> {
        self.outputs.get(addr)
    }

    pub fn variable(&self, addr: &VariableAddr) -> Option<&VariableConfig> {
        self.variables.get(addr)
    }

    /// All instances of a static resource
    pub fn instances_of<'a>(
        &'a self,
        resource: &'a ConfigResource,
    ) -> impl Iterator<Item = &'a ResourceConfig> + 'a {
        self.resources
            .values()
            .filter(move |r| resource.contains(&r.addr))
    }

    /// Managed resources the instance's value depends on, following
    /// references through data sources and module outputs
    pub fn dependencies_of(&self, addr: &AbsResourceInstance) -> BTreeSet<ConfigResource> {
        let mut deps = BTreeSet::new();
        let Some(rc) = self.resource(addr) else {
            return deps;
        };

        let mut seen_resources: BTreeSet<AbsResourceInstance> = BTreeSet::new();
        let mut seen_outputs: BTreeSet<OutputAddr> = BTreeSet::new();
        let mut queue: Vec<Referenceable> =
            rc.references().into_iter().map(|r| r.subject.clone()).collect();
        let mut explicit: Vec<ConfigResource> = rc.depends_on.clone();

        loop {
            for cr in explicit.drain(..) {
                if cr.resource.mode == ResourceMode::Managed {
                    deps.insert(cr.clone());
                }
                for inst in self.instances_of(&cr) {
                    queue.push(Referenceable::Resource(inst.addr.clone()));
                }
            }
            let Some(subject) = queue.pop() else {
                break;
            };
            match subject {
                Referenceable::Resource(target) => {
                    if !seen_resources.insert(target.clone()) {
                        continue;
                    }
                    if target.is_data() {
                        if let Some(data) = self.resource(&target) {
                            queue.extend(data.references().into_iter().map(|r| r.subject.clone()));
                            explicit.extend(data.depends_on.iter().cloned());
                        }
                    } else {
                        deps.insert(target.config_resource());
                    }
                }
                Referenceable::Output(out) => {
                    if !seen_outputs.insert(out.clone()) {
                        continue;
                    }
                    if let Some(oc) = self.output(&out) {
                        queue.extend(oc.value.references().into_iter().map(|r| r.subject.clone()));
                    }
                }
                Referenceable::Variable(_) | Referenceable::SelfObject => {}
            }
        }

        deps.remove(&addr.config_resource());
        deps
    }

    /// Load the JSON document format
    pub fn from_json_str(input: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(input)?;
        raw.into_config()
    }
}

// ============================================================================
// JSON document
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    variables: Vec<RawVariable>,
    #[serde(default)]
    providers: Vec<RawProvider>,
    #[serde(default)]
    resources: Vec<RawResource>,
    #[serde(default)]
    outputs: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVariable {
    address: VariableAddr,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    sensitive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProvider {
    address: ProviderConfigAddr,
    #[serde(default)]
    config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    address: AbsResourceInstance,
    #[serde(default)]
    provider: Option<ProviderConfigAddr>,
    #[serde(default)]
    config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    depends_on: Vec<ConfigResource>,
    #[serde(default)]
    lifecycle: RawLifecycle,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLifecycle {
    #[serde(default)]
    create_before_destroy: bool,
    #[serde(default)]
    prevent_destroy: bool,
    #[serde(default)]
    ignore_changes: Option<RawIgnoreChanges>,
    #[serde(default)]
    preconditions: Vec<RawCondition>,
    #[serde(default)]
    postconditions: Vec<RawCondition>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawIgnoreChanges {
    Keyword(String),
    Paths(Vec<Path>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCondition {
    condition: serde_json::Value,
    error_message: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutput {
    address: OutputAddr,
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

fn body_from_json(
    map: &serde_json::Map<String, serde_json::Value>,
    module: &ModuleInstance,
) -> Result<BTreeMap<String, Expr>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), Expr::from_json(v, module)?)))
        .collect()
}

fn conditions_from_json(raw: Vec<RawCondition>, module: &ModuleInstance) -> Result<Vec<Condition>> {
    raw.into_iter()
        .map(|c| {
            Ok(Condition {
                check: Check::from_json(&c.condition, module)?,
                error_message: c.error_message,
            })
        })
        .collect()
}

impl RawConfig {
    fn into_config(self) -> Result<Config> {
        let mut config = Config::new();

        for v in self.variables {
            let addr = v.address.clone();
            let prev = config.variables.insert(
                addr.clone(),
                VariableConfig {
                    addr,
                    value: v.value,
                    sensitive: v.sensitive,
                },
            );
            if prev.is_some() {
                return Err(Error::document(format!("duplicate variable {}", v.address)));
            }
        }

        for p in self.providers {
            let module = p.address.module.to_instance();
            let body = body_from_json(&p.config, &module)?;
            if config.providers.contains_key(&p.address) {
                return Err(Error::document(format!("duplicate provider {}", p.address)));
            }
            config.providers.insert(
                p.address.clone(),
                ProviderConfig {
                    addr: p.address,
                    body,
                },
            );
        }

        for r in self.resources {
            if config.resources.contains_key(&r.address) {
                return Err(Error::document(format!("duplicate resource {}", r.address)));
            }
            let module = r.address.module.clone();
            let ignore_changes = match r.lifecycle.ignore_changes {
                None => IgnoreChanges::Nothing,
                Some(RawIgnoreChanges::Keyword(k)) if k == "all" => IgnoreChanges::All,
                Some(RawIgnoreChanges::Keyword(k)) => {
                    return Err(Error::document(format!(
                        "{}: ignore_changes must be \"all\" or a list of paths, got {k:?}",
                        r.address
                    )));
                }
                Some(RawIgnoreChanges::Paths(paths)) => IgnoreChanges::Paths(paths),
            };
            let mut rc = ResourceConfig::new(r.address.clone());
            if let Some(provider) = r.provider {
                rc.provider = provider;
            }
            rc.body = body_from_json(&r.config, &module)?;
            rc.depends_on = r.depends_on;
            rc.lifecycle = Lifecycle {
                create_before_destroy: r.lifecycle.create_before_destroy,
                prevent_destroy: r.lifecycle.prevent_destroy,
                ignore_changes,
                preconditions: conditions_from_json(r.lifecycle.preconditions, &module)?,
                postconditions: conditions_from_json(r.lifecycle.postconditions, &module)?,
            };
            config.resources.insert(r.address, rc);
        }

        for o in self.outputs {
            if config.outputs.contains_key(&o.address) {
                return Err(Error::document(format!("duplicate output {}", o.address)));
            }
            let value = Expr::from_json(&o.value, &o.address.module)?;
            config.outputs.insert(
                o.address.clone(),
                OutputConfig {
                    addr: o.address,
                    value,
                    sensitive: o.sensitive,
                },
            );
        }

        Ok(config)
    }
}
