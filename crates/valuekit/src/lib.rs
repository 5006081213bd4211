//! Typed attribute values for infrastructure plans.
//!
//! This crate holds the value model shared by the planner and the CLI:
//!
//! - [`Value`]: JSON-like values with an [`Value::Unknown`] placeholder
//! - [`Path`]: addresses inside a value (`tags["Name"]`, `list[0]`)
//! - [`PathSet`] and [`MarkedValue`]: sensitivity marks carried with values
//!
//! Unknowns travel over JSON as `{"$unknown": true}`.

pub mod error;
pub mod marks;
pub mod path;
pub mod value;

pub use error::{Error, Result};
pub use marks::{MarkedValue, PathSet};
pub use path::{Path, PathStep};
pub use value::{UNKNOWN_SENTINEL, Value};
