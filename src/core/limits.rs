/*!
 * System Limits and Constants
 *
 * Centralized location for the lifecycle and quota constants.
 * Organized by domain; most of them seed the defaults in `KernelConfig`.
 */

use std::time::Duration;

// =============================================================================
// TERMINATION TIMING
// =============================================================================

/// Backoff between retries of a transient allocation or port send failure
pub const SHORT_DELAY: Duration = Duration::from_millis(100);

/// Slice used when a wait has to keep delivering kernel callbacks
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Per-pass wait for processes during system shutdown
pub const SHUTDOWN_WAIT_TIMEOUT: Duration = Duration::from_secs(100);

/// Consecutive timed-out shutdown passes before giving up
pub const SHUTDOWN_MAX_PASSES: u32 = 10;

/// Passes made by `wait_for_all_processes`, doubling the timeout each time
pub const WAIT_ALL_PASSES: u32 = 13;

/// First timeout used by `wait_for_all_processes`
pub const WAIT_ALL_INITIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Objects one wait-any call can observe
pub const MAX_WAIT_OBJECTS: usize = 64;

/// Allocation attempts `queue_user_apc` makes before reporting exhaustion
pub const USER_APC_ALLOC_RETRIES: u32 = 3;

// =============================================================================
// OBJECT SIZES (charged to pools and quota)
// =============================================================================

/// Pool bytes of one delivery envelope
pub const APC_ENVELOPE_SIZE: usize = 0x58;

/// Pool bytes of one termination port registration
pub const TERMINATION_PORT_SIZE: usize = 0x10;

/// Kernel stack size handed out per thread
pub const KERNEL_STACK_SIZE: usize = 24 * 1024;

/// Simulated pool capacity (64MB)
pub const DEFAULT_POOL_CAPACITY: usize = 64 * 1024 * 1024;

// =============================================================================
// CLIENT IDS
// =============================================================================

/// Client ids are handed out in steps of four
pub const CID_INCREMENT: u32 = 4;

/// First id after the System process
pub const FIRST_USER_CID: u32 = 8;

/// First handle value in a fresh handle table
pub const FIRST_HANDLE: u32 = 4;

// =============================================================================
// QUOTA
// =============================================================================

/// Limit value meaning "no cap"
pub const NO_CAP: usize = usize::MAX;

/// Slack above which a non-default block shrinks its limit
pub const GIVEBACK_THRESHOLD: usize = 64 * 1024;

/// Largest single limit shrink on return
pub const GIVEBACK_INCREMENT: usize = 64 * 1024;

/// Minimum grant requested from the backing store on expansion
pub const EXPANSION_INCREMENT: usize = 64 * 1024;

/// Default backing store capacity for paged pool quota (32MB)
pub const PAGED_BACKING_CAPACITY: usize = 32 * 1024 * 1024;

/// Default backing store capacity for non-paged pool quota (8MB)
pub const NONPAGED_BACKING_CAPACITY: usize = 8 * 1024 * 1024;
