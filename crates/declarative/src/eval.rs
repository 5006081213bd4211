//! Expression evaluation against the walk's current values

use crate::addrs::{AbsResourceInstance, OutputAddr, VariableAddr};
use crate::config::{Expr, Reference, Referenceable};
use std::collections::BTreeMap;
use thiserror::Error;
use valuekit::{MarkedValue, Path, PathSet, Value};

/// Source of values for references
pub trait Scope {
    /// Current (or planned) value of a resource instance, with marks
    fn resource_value(&self, addr: &AbsResourceInstance) -> Option<MarkedValue>;

    fn variable_value(&self, addr: &VariableAddr) -> Option<MarkedValue>;

    fn output_value(&self, addr: &OutputAddr) -> Option<MarkedValue>;
}

/// Why an expression could not be evaluated
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("Reference to undeclared or unavailable object {reference}")]
    Unavailable { reference: String },

    #[error("self can only be used in conditions of the resource itself")]
    SelfUnavailable,

    #[error("Invalid template value: {found} values cannot be interpolated into a string")]
    TemplateValue { found: &'static str },

    #[error("Incorrect condition type: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Evaluates expressions in a scope
pub struct Evaluator<'a> {
    scope: &'a dyn Scope,
    self_value: Option<&'a MarkedValue>,
}

impl<'a> Evaluator<'a> {
    pub fn new(scope: &'a dyn Scope) -> Self {
        Self {
            scope,
            self_value: None,
        }
    }

    /// Bind `self` for condition evaluation
    pub fn with_self(mut self, value: &'a MarkedValue) -> Self {
        self.self_value = Some(value);
        self
    }

    pub fn eval(&self, expr: &Expr) -> Result<MarkedValue, EvalError> {
        match expr {
            Expr::Literal(v) => Ok(MarkedValue::unmarked(v.clone())),
            Expr::Object(attrs) => self.eval_object(attrs),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut marks = PathSet::new();
                for (i, item) in items.iter().enumerate() {
                    let (value, item_marks) = self.eval(item)?.into_parts();
                    marks.extend_from(&item_marks.embed(&Path::root().index(i)));
                    values.push(value);
                }
                Ok(MarkedValue::new(Value::List(values), marks))
            }
            Expr::Reference(r) => self.resolve(r),
            Expr::Sensitive(inner) => Ok(self.eval(inner)?.with_marks(&PathSet::whole())),
            Expr::Template(parts) => self.eval_template(parts),
        }
    }

    /// Evaluate a resource or provider body
    pub fn eval_object(&self, attrs: &BTreeMap<String, Expr>) -> Result<MarkedValue, EvalError> {
        let mut values = BTreeMap::new();
        let mut marks = PathSet::new();
        for (name, expr) in attrs {
            let (value, attr_marks) = self.eval(expr)?.into_parts();
            marks.extend_from(&attr_marks.embed(&Path::root().key(name.as_str())));
            values.insert(name.clone(), value);
        }
        Ok(MarkedValue::new(Value::Object(values), marks))
    }

    fn eval_template(&self, parts: &[Expr]) -> Result<MarkedValue, EvalError> {
        let mut out = String::new();
        let mut unknown = false;
        let mut sensitive = false;
        for part in parts {
            let part = self.eval(part)?;
            sensitive |= !part.marks.is_empty();
            match &part.value {
                Value::String(s) => out.push_str(s),
                Value::Number(_) | Value::Bool(_) => out.push_str(&part.value.to_string()),
                Value::Unknown => unknown = true,
                other => {
                    return Err(EvalError::TemplateValue {
                        found: other.type_name(),
                    });
                }
            }
        }
        let value = if unknown { Value::Unknown } else { Value::String(out) };
        let marks = if sensitive { PathSet::whole() } else { PathSet::new() };
        Ok(MarkedValue::new(value, marks))
    }

    fn resolve(&self, reference: &Reference) -> Result<MarkedValue, EvalError> {
        let subject = match &reference.subject {
            Referenceable::Resource(addr) => self.scope.resource_value(addr),
            Referenceable::Variable(addr) => self.scope.variable_value(addr),
            Referenceable::Output(addr) => self.scope.output_value(addr),
            Referenceable::SelfObject => {
                Some(self.self_value.ok_or(EvalError::SelfUnavailable)?.clone())
            }
        };
        let subject = subject.ok_or_else(|| EvalError::Unavailable {
            reference: reference.to_string(),
        })?;
        Ok(subject.get(&reference.path))
    }
}
