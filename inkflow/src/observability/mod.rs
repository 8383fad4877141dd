//! Logging setup and the spans that scope run and stage work.

mod logging;
mod spans;

pub use logging::{default_filter, init_tracing};
pub use spans::{run_span, stage_span, SpanTimer};
