//! Directive parsing and execution
//!
//! [`DirectiveParser`] turns free text into a typed [`Directive`]; [`Dispatcher`]
//! checks it against the connection and registry and answers with exactly one
//! response string.

mod directive;
mod dispatcher;

pub use directive::{usage_of, Directive, DirectiveParser, UsageError, USAGE};
pub use dispatcher::Dispatcher;
