/*!
 * Synchronization Primitives
 *
 * Blocking objects the lifecycle core waits on:
 * - `Event`: manual-reset notification signaled when an object finishes teardown
 * - `RundownProtection`: drains in-flight accessors before destruction
 */

mod event;
mod rundown;

pub use event::Event;
pub use rundown::{RundownGuard, RundownProtection};
