//! Template/context binding layer.
//!
//! Every consumer that reads data out of a run (condition evaluation,
//! template rendering, item and field extraction) goes through this module,
//! so missing data behaves the same everywhere: an absent path segment is
//! `None`, never an error.

pub mod expression;
pub mod lookup;
pub mod scope;
pub mod template;

pub use expression::{ConditionEvaluator, ExpressionError, condition_holds};
pub use lookup::{coerce_bool, lookup_path, value_to_string};
pub use scope::{BoundContext, Scope, resolve_reference};
pub use template::{render_str, render_value};
