/*!
 * Structured Tracing
 * Subscriber setup and per-syscall spans using the tracing crate
 *
 * Features:
 * - Env-driven filtering with JSON or compact output
 * - `log` records bridged into the same subscriber
 * - Syscall spans carrying caller ids, result status and duration
 */

use crate::core::types::{Pid, Tid};
use crate::core::Status;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - KERNEL_TRACE_JSON: Enable JSON output (default: false)
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("KERNEL_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
    installed
}

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Span around one entry point call
///
/// Logs completion on drop; slow calls are reported at warn level.
pub struct SyscallSpan {
    span: tracing::Span,
    start: Instant,
    syscall: &'static str,
    trace_id: u64,
}

impl SyscallSpan {
    pub fn new(syscall: &'static str, pid: Pid, tid: Option<Tid>) -> Self {
        let trace_id = NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed);
        let span = span!(
            Level::DEBUG,
            "syscall",
            trace_id,
            syscall,
            pid,
            tid = tid.unwrap_or(0),
            status = tracing::field::Empty,
            duration_us = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            syscall,
            trace_id,
        }
    }

    #[inline]
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn record_status(&self, status: Status) {
        self.span.record("status", tracing::field::display(status));
    }

    /// Record `status` and pass it through
    pub fn finish(self, status: Status) -> Status {
        self.record_status(status);
        status
    }
}

impl Drop for SyscallSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_us", duration.as_micros() as u64);
        let _entered = self.span.enter();
        if duration.as_millis() > 100 {
            warn!(
                trace_id = self.trace_id,
                syscall = self.syscall,
                duration_ms = duration.as_millis() as u64,
                "slow syscall"
            );
        } else {
            debug!(trace_id = self.trace_id, syscall = self.syscall, "syscall completed");
        }
    }
}
