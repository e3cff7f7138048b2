/*!
 * Monitoring
 * Structured tracing setup and lifecycle counters
 */

mod stats;
mod tracer;

pub use stats::{LifecycleStats, StatsSnapshot};
pub use tracer::{init_tracing, SyscallSpan};
