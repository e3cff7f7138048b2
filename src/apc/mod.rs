/*!
 * Asynchronous Callbacks
 *
 * Cross-thread delivery of callbacks into a specific thread's context.
 *
 * # Architecture
 *
 * - **ApcEnvelope**: target, mode, routine, completion event and the pool
 *   memory and quota backing it
 * - **ApcState**: the target's kernel and user queues plus its wait state
 * - **deliver**: inline-on-self or queue-on-target, with rundown on rejection
 */

mod delivery;
mod envelope;
mod queue;

pub use delivery::{deliver, Delivery};
pub use envelope::{ApcEnvelope, ApcRoutine};
pub use queue::{ApcState, CriticalRegion, WakeReason};
