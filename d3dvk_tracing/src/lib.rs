//! Tracing helpers shared by the d3dvk crates.
//!
//! [`trace_span!`] marks hot paths of the renderer and [`logger`] provides the
//! terminal subscriber used by binaries and tests.

pub mod logger;
pub mod span;

pub use logger::Logger;
pub use span::{EnteredSpan, Span};
