/*!
 * Shared test helpers
 */

#![allow(dead_code)]

use ps_lifecycle::{Kernel, KernelConfig, ThreadCtx};
use std::time::{Duration, Instant};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(10);

pub fn kernel() -> Kernel {
    Kernel::builder()
        .with_config(KernelConfig::testing())
        .build()
        .expect("kernel")
}

/// Body that only takes callbacks until it is terminated
pub fn idle(ctx: &ThreadCtx) {
    loop {
        ctx.alertable_wait(Some(Duration::from_millis(5)));
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
