//! Addresses
//!
//! Every object the engine tracks has a textual address:
//!
//! - `test_object.a`, `test_object.a[0]`, `data.test_data.b["k"]`
//! - `module.net["eu"].test_object.a` for instances inside module calls
//! - `provider["test"]`, `provider["test"].west`
//! - `output.id`, `module.net.output.id`
//! - `var.name`
//!
//! All address types parse from and print to that form, and serialize as
//! strings.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use valuekit::{Path, PathStep};

// ============================================================================
// Traversals
// ============================================================================

/// One token of an address traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Name(String),
    Key(InstanceKey),
}

/// Split `a.b["k"][0].c` into name and key tokens
pub(crate) fn tokenize(input: &str) -> Result<Vec<Step>> {
    let err = |msg: &str| Error::address(input, msg);
    let mut steps = Vec::new();
    let mut chars = input.trim().chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '.' => {
                if steps.is_empty() {
                    return Err(err("address cannot start with '.'"));
                }
                chars.next();
            }
            '[' => {
                chars.next();
                let key = if chars.peek() == Some(&'"') {
                    chars.next();
                    let mut s = String::new();
                    loop {
                        match chars.next() {
                            Some('"') => break,
                            Some('\\') => match chars.next() {
                                Some(e) => s.push(e),
                                None => return Err(err("unterminated escape")),
                            },
                            Some(other) => s.push(other),
                            None => return Err(err("unterminated string key")),
                        }
                    }
                    InstanceKey::Str(s)
                } else {
                    let mut digits = String::new();
                    while let Some(&d) = chars.peek() {
                        if d == ']' {
                            break;
                        }
                        digits.push(d);
                        chars.next();
                    }
                    let n = digits
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| err("expected integer or quoted string key"))?;
                    InstanceKey::Int(n)
                };
                if chars.next() != Some(']') {
                    return Err(err("expected ']'"));
                }
                steps.push(Step::Key(key));
                continue;
            }
            _ => {}
        }

        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' || n == '-' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(err("expected a name"));
        }
        steps.push(Step::Name(name));
    }

    Ok(steps)
}

/// Cursor over traversal tokens
pub(crate) struct Steps<'a> {
    input: &'a str,
    steps: &'a [Step],
    pos: usize,
}

impl<'a> Steps<'a> {
    pub(crate) const fn new(input: &'a str, steps: &'a [Step]) -> Self {
        Self {
            input,
            steps,
            pos: 0,
        }
    }

    pub(crate) fn peek_name(&self) -> Option<&'a str> {
        match self.steps.get(self.pos) {
            Some(Step::Name(n)) => Some(n),
            _ => None,
        }
    }

    fn peek_name_at(&self, offset: usize) -> Option<&'a str> {
        match self.steps.get(self.pos + offset) {
            Some(Step::Name(n)) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn name(&mut self, what: &str) -> Result<String> {
        match self.steps.get(self.pos) {
            Some(Step::Name(n)) => {
                self.pos += 1;
                Ok(n.clone())
            }
            _ => Err(Error::address(self.input, format!("expected {what}"))),
        }
    }

    pub(crate) fn keyword(&mut self, kw: &str) -> bool {
        if self.peek_name() == Some(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn key(&mut self) -> InstanceKey {
        match self.steps.get(self.pos) {
            Some(Step::Key(k)) => {
                self.pos += 1;
                k.clone()
            }
            _ => InstanceKey::NoKey,
        }
    }

    pub(crate) const fn is_done(&self) -> bool {
        self.pos >= self.steps.len()
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.is_done() {
            Ok(())
        } else {
            Err(Error::address(self.input, "unexpected trailing steps"))
        }
    }

    /// Module call steps: `module.a["k"].module.b`
    pub(crate) fn module_instance(&mut self) -> ModuleInstance {
        let mut module = ModuleInstance::root();
        while self.peek_name() == Some("module") && self.peek_name_at(1).is_some() {
            self.pos += 1;
            let name = self.peek_name().unwrap_or_default().to_string();
            self.pos += 1;
            let key = self.key();
            module = module.child(name, key);
        }
        module
    }

    /// Remaining tokens as a value path
    pub(crate) fn rest_as_path(&mut self) -> Path {
        let path = self.steps[self.pos..]
            .iter()
            .map(|step| match step {
                Step::Name(n) => PathStep::Key(n.clone()),
                Step::Key(InstanceKey::Str(s)) => PathStep::Key(s.clone()),
                Step::Key(InstanceKey::Int(i)) => PathStep::Index(usize::try_from(*i).unwrap_or(0)),
                Step::Key(InstanceKey::NoKey) => PathStep::Index(0),
            })
            .collect();
        self.pos = self.steps.len();
        path
    }

    /// `type.name` or `data.type.name`
    pub(crate) fn resource(&mut self) -> Result<Resource> {
        let mode = if self.peek_name() == Some("data") && self.peek_name_at(2).is_some() {
            self.pos += 1;
            ResourceMode::Data
        } else {
            ResourceMode::Managed
        };
        let type_name = self.name("resource type")?;
        let name = self.name("resource name")?;
        Ok(Resource {
            mode,
            type_name,
            name,
        })
    }
}

// ============================================================================
// Instance keys and modules
// ============================================================================

/// Key distinguishing instances of an expanded resource or module call
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum InstanceKey {
    /// Single instance, no count or for_each
    #[default]
    NoKey,
    /// `count` index
    Int(i64),
    /// `for_each` key
    Str(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoKey => Ok(()),
            Self::Int(i) => write!(f, "[{i}]"),
            Self::Str(s) => write!(f, "[{s:?}]"),
        }
    }
}

impl FromStr for InstanceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::NoKey);
        }
        match tokenize(s)?.as_slice() {
            [Step::Key(key)] => Ok(key.clone()),
            _ => Err(Error::address(s, "expected an instance key like [0] or [\"k\"]")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleInstanceStep {
    pub name: String,
    pub key: InstanceKey,
}

/// Path to an instance of a module call; empty for the root module
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ModuleInstance(Vec<ModuleInstanceStep>);

impl ModuleInstance {
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    pub const fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, name: impl Into<String>, key: InstanceKey) -> Self {
        let mut steps = self.0.clone();
        steps.push(ModuleInstanceStep {
            name: name.into(),
            key,
        });
        Self(steps)
    }

    pub fn steps(&self) -> &[ModuleInstanceStep] {
        &self.0
    }

    /// Drop instance keys, giving the static module path
    pub fn module_path(&self) -> ModulePath {
        ModulePath(self.0.iter().map(|s| s.name.clone()).collect())
    }
}

impl fmt::Display for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{}{}", step.name, step.key)?;
        }
        Ok(())
    }
}

impl FromStr for ModuleInstance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut steps = Steps::new(s, &tokens);
        let module = steps.module_instance();
        steps.finish()?;
        Ok(module)
    }
}

/// Static module path, without instance keys
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ModulePath(Vec<String>);

impl ModulePath {
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    pub const fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut names = self.0.clone();
        names.push(name.into());
        Self(names)
    }

    /// The module instance with this path and no instance keys
    pub fn to_instance(&self) -> ModuleInstance {
        self.0
            .iter()
            .fold(ModuleInstance::root(), |m, name| m.child(name.as_str(), InstanceKey::NoKey))
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{name}")?;
        }
        Ok(())
    }
}

fn write_in_module(
    f: &mut fmt::Formatter<'_>,
    module: &impl fmt::Display,
    is_root: bool,
) -> fmt::Result {
    if is_root {
        Ok(())
    } else {
        write!(f, "{module}.")
    }
}

// ============================================================================
// Resources
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMode {
    Managed,
    Data,
}

/// A resource block: mode, type and name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resource {
    pub mode: ResourceMode,
    pub type_name: String,
    pub name: String,
}

impl Resource {
    pub fn managed(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Managed,
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    pub fn data(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Data,
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// The provider type implied by the resource type prefix
    /// (`test_object` belongs to provider `test`)
    pub fn implied_provider(&self) -> &str {
        self.type_name
            .split_once('_')
            .map_or(self.type_name.as_str(), |(prefix, _)| prefix)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ResourceMode::Managed => write!(f, "{}.{}", self.type_name, self.name),
            ResourceMode::Data => write!(f, "data.{}.{}", self.type_name, self.name),
        }
    }
}

impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut steps = Steps::new(s, &tokens);
        let resource = steps.resource()?;
        steps.finish()?;
        Ok(resource)
    }
}

/// One instance of a resource, in a module instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsResourceInstance {
    pub module: ModuleInstance,
    pub resource: Resource,
    pub key: InstanceKey,
}

impl AbsResourceInstance {
    pub const fn new(module: ModuleInstance, resource: Resource, key: InstanceKey) -> Self {
        Self {
            module,
            resource,
            key,
        }
    }

    /// Root-module managed instance with no key
    pub fn managed(type_name: &str, name: &str) -> Self {
        Self::new(
            ModuleInstance::root(),
            Resource::managed(type_name, name),
            InstanceKey::NoKey,
        )
    }

    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = key;
        self
    }

    pub fn is_data(&self) -> bool {
        self.resource.mode == ResourceMode::Data
    }

    /// The static resource this instance belongs to
    pub fn config_resource(&self) -> ConfigResource {
        ConfigResource {
            module: self.module.module_path(),
            resource: self.resource.clone(),
        }
    }

    /// Same instance, ignoring the instance key
    pub fn same_resource(&self, other: &Self) -> bool {
        self.module == other.module && self.resource == other.resource
    }
}

impl fmt::Display for AbsResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_in_module(f, &self.module, self.module.is_root())?;
        write!(f, "{}{}", self.resource, self.key)
    }
}

impl FromStr for AbsResourceInstance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut steps = Steps::new(s, &tokens);
        let module = steps.module_instance();
        let resource = steps.resource()?;
        let key = steps.key();
        steps.finish()?;
        Ok(Self::new(module, resource, key))
    }
}

/// A resource in a static module path; used for recorded dependencies
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigResource {
    pub module: ModulePath,
    pub resource: Resource,
}

impl ConfigResource {
    pub fn contains(&self, instance: &AbsResourceInstance) -> bool {
        self.resource == instance.resource && self.module == instance.module.module_path()
    }
}

impl fmt::Display for ConfigResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_in_module(f, &self.module, self.module.is_root())?;
        write!(f, "{}", self.resource)
    }
}

impl FromStr for ConfigResource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut steps = Steps::new(s, &tokens);
        let module = steps.module_instance();
        if module.steps().iter().any(|m| m.key != InstanceKey::NoKey) {
            return Err(Error::address(s, "module path cannot have instance keys"));
        }
        let resource = steps.resource()?;
        steps.finish()?;
        Ok(Self {
            module: module.module_path(),
            resource,
        })
    }
}

// ============================================================================
// Providers, outputs, variables
// ============================================================================

/// A provider configuration
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderConfigAddr {
    pub module: ModulePath,
    /// Provider type name, e.g. `test`
    pub provider: String,
    pub alias: Option<String>,
}

impl ProviderConfigAddr {
    /// Default (unaliased) configuration of a provider in the root module
    pub fn root(provider: impl Into<String>) -> Self {
        Self {
            module: ModulePath::root(),
            provider: provider.into(),
            alias: None,
        }
    }
}

impl fmt::Display for ProviderConfigAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_in_module(f, &self.module, self.module.is_root())?;
        write!(f, "provider[{:?}]", self.provider)?;
        if let Some(alias) = &self.alias {
            write!(f, ".{alias}")?;
        }
        Ok(())
    }
}

impl FromStr for ProviderConfigAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut steps = Steps::new(s, &tokens);
        let module = steps.module_instance().module_path();
        if !steps.keyword("provider") {
            return Err(Error::address(s, "expected 'provider'"));
        }
        let provider = match steps.key() {
            InstanceKey::Str(name) => name,
            _ => steps.name("provider type")?,
        };
        let alias = if steps.is_done() {
            None
        } else {
            Some(steps.name("provider alias")?)
        };
        steps.finish()?;
        Ok(Self {
            module,
            provider,
            alias,
        })
    }
}

/// An output value of a module instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputAddr {
    pub module: ModuleInstance,
    pub name: String,
}

impl OutputAddr {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            module: ModuleInstance::root(),
            name: name.into(),
        }
    }
}

impl fmt::Display for OutputAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_in_module(f, &self.module, self.module.is_root())?;
        write!(f, "output.{}", self.name)
    }
}

impl FromStr for OutputAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut steps = Steps::new(s, &tokens);
        let module = steps.module_instance();
        if !steps.keyword("output") {
            return Err(Error::address(s, "expected 'output'"));
        }
        let name = steps.name("output name")?;
        steps.finish()?;
        Ok(Self { module, name })
    }
}

/// An input variable of a module instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableAddr {
    pub module: ModuleInstance,
    pub name: String,
}

impl VariableAddr {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            module: ModuleInstance::root(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VariableAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_in_module(f, &self.module, self.module.is_root())?;
        write!(f, "var.{}", self.name)
    }
}

impl FromStr for VariableAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut steps = Steps::new(s, &tokens);
        let module = steps.module_instance();
        if !steps.keyword("var") {
            return Err(Error::address(s, "expected 'var'"));
        }
        let name = steps.name("variable name")?;
        steps.finish()?;
        Ok(Self { module, name })
    }
}

// ============================================================================
// Deposed keys
// ============================================================================

static DEPOSED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generation token for an object set aside by a create-before-destroy
/// replacement
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeposedKey(String);

impl DeposedKey {
    /// A fresh key, unique within the process
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let count = DEPOSED_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut hasher = blake3::Hasher::new();
        hasher.update(&nanos.to_le_bytes());
        hasher.update(&count.to_le_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeposedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeposedKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() == 8 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::address(s, "deposed key must be 8 lowercase hex characters"))
        }
    }
}

// ============================================================================
// Serde as strings
// ============================================================================

macro_rules! string_serde {
    ($($ty:ty),* $(,)?) => {$(
        impl Serialize for $ty {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    )*};
}

string_serde!(
    InstanceKey,
    ModuleInstance,
    Resource,
    AbsResourceInstance,
    ConfigResource,
    ProviderConfigAddr,
    OutputAddr,
    VariableAddr,
    DeposedKey,
);
