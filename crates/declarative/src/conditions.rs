//! Condition Evaluator
//!
//! Preconditions run before a resource's provider operation, postconditions
//! after it, with `self` bound to the resource's value. A check can come
//! out true, false or not yet decidable (when it reads unknown values at
//! plan time).

use crate::addrs::ModuleInstance;
use crate::config::{Expr, Reference};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::{Error, Result};
use crate::eval::{EvalError, Evaluator};
use valuekit::Value;

/// A boolean check over expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Equal(Expr, Expr),
    NotEqual(Expr, Expr),
    IsNull(Expr),
    /// The expression must evaluate to `true`
    Truthy(Expr),
    Not(Box<Check>),
    All(Vec<Check>),
    Any(Vec<Check>),
}

/// A declared condition with the message shown when it fails
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub check: Check,
    pub error_message: String,
}

impl Condition {
    pub fn new(check: Check, error_message: impl Into<String>) -> Self {
        Self {
            check,
            error_message: error_message.into(),
        }
    }
}

/// Three-valued result of a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Pass,
    Fail,
    /// Depends on values not known yet
    Unknown,
}

impl CheckResult {
    const fn from_bool(b: bool) -> Self {
        if b { Self::Pass } else { Self::Fail }
    }

    const fn negate(self) -> Self {
        match self {
            Self::Pass => Self::Fail,
            Self::Fail => Self::Pass,
            Self::Unknown => Self::Unknown,
        }
    }
}

impl Check {
    pub(crate) fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Equal(a, b) | Self::NotEqual(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Self::IsNull(e) | Self::Truthy(e) => e.collect_references(out),
            Self::Not(inner) => inner.collect_references(out),
            Self::All(checks) | Self::Any(checks) => {
                checks.iter().for_each(|c| c.collect_references(out));
            }
        }
    }

    /// Evaluate against the given scope
    pub fn evaluate(&self, eval: &Evaluator<'_>) -> std::result::Result<CheckResult, EvalError> {
        Ok(match self {
            Self::Equal(a, b) => compare(eval, a, b)?,
            Self::NotEqual(a, b) => compare(eval, a, b)?.negate(),
            Self::IsNull(e) => {
                let v = eval.eval(e)?.value;
                if v.is_unknown() {
                    CheckResult::Unknown
                } else {
                    CheckResult::from_bool(v.is_null())
                }
            }
            Self::Truthy(e) => match eval.eval(e)?.value {
                Value::Bool(b) => CheckResult::from_bool(b),
                Value::Unknown => CheckResult::Unknown,
                other => {
                    return Err(EvalError::TypeMismatch {
                        expected: "bool",
                        found: other.type_name(),
                    });
                }
            },
            Self::Not(inner) => inner.evaluate(eval)?.negate(),
            Self::All(checks) => {
                let mut result = CheckResult::Pass;
                for c in checks {
                    match c.evaluate(eval)? {
                        CheckResult::Fail => return Ok(CheckResult::Fail),
                        CheckResult::Unknown => result = CheckResult::Unknown,
                        CheckResult::Pass => {}
                    }
                }
                result
            }
            Self::Any(checks) => {
                let mut result = CheckResult::Fail;
                for c in checks {
                    match c.evaluate(eval)? {
                        CheckResult::Pass => return Ok(CheckResult::Pass),
                        CheckResult::Unknown => result = CheckResult::Unknown,
                        CheckResult::Fail => {}
                    }
                }
                result
            }
        })
    }

    /// Parse the JSON form: `{"==": [a, b]}`, `{"!=": [a, b]}`,
    /// `{"null": a}`, `{"truthy": a}`, `{"not": c}`, `{"all": [..]}`,
    /// `{"any": [..]}`
    pub fn from_json(json: &serde_json::Value, module: &ModuleInstance) -> Result<Self> {
        let obj = json
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| Error::document("condition must be an object with one operator"))?;
        let Some((op, arg)) = obj.iter().next() else {
            return Err(Error::document("condition must have an operator"));
        };

        let pair = |arg: &serde_json::Value| -> Result<(Expr, Expr)> {
            match arg.as_array().map(Vec::as_slice) {
                Some([a, b]) => Ok((Expr::from_json(a, module)?, Expr::from_json(b, module)?)),
                _ => Err(Error::document(format!("{op} takes two operands"))),
            }
        };
        let list = |arg: &serde_json::Value| -> Result<Vec<Self>> {
            arg.as_array()
                .ok_or_else(|| Error::document(format!("{op} takes a list of conditions")))?
                .iter()
                .map(|c| Self::from_json(c, module))
                .collect()
        };

        match op.as_str() {
            "==" => pair(arg).map(|(a, b)| Self::Equal(a, b)),
            "!=" => pair(arg).map(|(a, b)| Self::NotEqual(a, b)),
            "null" => Ok(Self::IsNull(Expr::from_json(arg, module)?)),
            "truthy" => Ok(Self::Truthy(Expr::from_json(arg, module)?)),
            "not" => Ok(Self::Not(Box::new(Self::from_json(arg, module)?))),
            "all" => list(arg).map(Self::All),
            "any" => list(arg).map(Self::Any),
            other => Err(Error::document(format!("unknown condition operator {other:?}"))),
        }
    }
}

fn compare(
    eval: &Evaluator<'_>,
    a: &Expr,
    b: &Expr,
) -> std::result::Result<CheckResult, EvalError> {
    let a = eval.eval(a)?.value;
    let b = eval.eval(b)?.value;
    if a.is_wholly_known() && b.is_wholly_known() {
        Ok(CheckResult::from_bool(a == b))
    } else {
        Ok(CheckResult::Unknown)
    }
}

/// Which kind of conditions are being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Precondition,
    Postcondition,
}

impl ConditionKind {
    const fn summary(self) -> &'static str {
        match self {
            Self::Precondition => "Resource precondition failed",
            Self::Postcondition => "Resource postcondition failed",
        }
    }

    const fn diagnostic_kind(self) -> DiagnosticKind {
        match self {
            Self::Precondition => DiagnosticKind::PreconditionFailure,
            Self::Postcondition => DiagnosticKind::PostconditionFailure,
        }
    }
}

/// Outcome of checking a list of conditions
#[derive(Debug, Clone, Default)]
pub struct ConditionReport {
    /// False if any condition failed or could not be evaluated
    pub pass: bool,
    /// Error messages of the failed conditions
    pub messages: Vec<String>,
    /// At least one condition was undecidable and deferred
    pub deferred: bool,
    pub diagnostics: Diagnostics,
}

/// Check `conditions` for the resource `subject`.
///
/// With `allow_unknown`, undecidable checks are deferred (plan time);
/// without it they are errors (apply time, where everything must be known).
pub fn evaluate_conditions(
    kind: ConditionKind,
    conditions: &[Condition],
    eval: &Evaluator<'_>,
    subject: &str,
    allow_unknown: bool,
) -> ConditionReport {
    let mut report = ConditionReport {
        pass: true,
        ..ConditionReport::default()
    };

    for cond in conditions {
        match cond.check.evaluate(eval) {
            Ok(CheckResult::Pass) => {}
            Ok(CheckResult::Unknown) if allow_unknown => report.deferred = true,
            Ok(CheckResult::Unknown) => {
                report.pass = false;
                report.diagnostics.push(
                    Diagnostic::error(
                        kind.diagnostic_kind(),
                        "Invalid condition result",
                        "The condition depends on values that are still unknown",
                    )
                    .with_subject(subject),
                );
            }
            Ok(CheckResult::Fail) => {
                report.pass = false;
                report.messages.push(cond.error_message.clone());
                report.diagnostics.push(
                    Diagnostic::error(kind.diagnostic_kind(), kind.summary(), &cond.error_message)
                        .with_subject(subject),
                );
            }
            Err(err) => {
                report.pass = false;
                report.diagnostics.push(
                    Diagnostic::error(
                        DiagnosticKind::Evaluation,
                        "Invalid condition",
                        err.to_string(),
                    )
                    .with_subject(subject),
                );
            }
        }
    }

    if !report.pass {
        log::warn!("{} for {subject}", kind.summary());
    }
    report
}
