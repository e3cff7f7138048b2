/*!
 * Kernel Configuration
 *
 * Runtime tunables for termination timing and the quota ledger.
 * Loaded from JSON, overridden from the environment, swapped at run time
 * through `Kernel::reconfigure`.
 */

use super::errors::{KernelError, KernelResult};
use super::limits;
use crate::quota::QuotaLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Quota ledger policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Limits of the shared default block
    pub default_limits: QuotaLimits,
    /// Highest limit expansion may raise a block to (`NO_CAP` for none)
    pub expansion_cap: QuotaLimits,
    /// Smallest grant requested from the backing store
    pub expansion_increment: usize,
    /// Let non-default blocks shrink their limits on return
    pub giveback_enabled: bool,
    pub giveback_threshold: usize,
    pub giveback_increment: usize,
    /// Pool quota the backing store can grant
    pub backing_capacity: QuotaLimits,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limits: QuotaLimits::unlimited(),
            expansion_cap: QuotaLimits::unlimited(),
            expansion_increment: limits::EXPANSION_INCREMENT,
            giveback_enabled: true,
            giveback_threshold: limits::GIVEBACK_THRESHOLD,
            giveback_increment: limits::GIVEBACK_INCREMENT,
            backing_capacity: QuotaLimits {
                non_paged: limits::NONPAGED_BACKING_CAPACITY,
                paged: limits::PAGED_BACKING_CAPACITY,
                page_file: 0,
            },
        }
    }
}

impl QuotaConfig {
    #[inline]
    #[must_use]
    pub fn with_backing_capacity(mut self, capacity: QuotaLimits) -> Self {
        self.backing_capacity = capacity;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_expansion_increment(mut self, increment: usize) -> Self {
        self.expansion_increment = increment;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_giveback(mut self, threshold: usize, increment: usize) -> Self {
        self.giveback_enabled = true;
        self.giveback_threshold = threshold;
        self.giveback_increment = increment;
        self
    }

    #[inline]
    #[must_use]
    pub fn without_giveback(mut self) -> Self {
        self.giveback_enabled = false;
        self
    }
}

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Critical-object terminations break in instead of halting
    pub debugger_present: bool,
    /// Backoff for allocation and port send retries
    pub short_delay: Duration,
    /// Slice for waits that keep delivering kernel callbacks
    pub wait_poll_interval: Duration,
    /// Bound on get/set context completion waits; `None` waits forever
    pub context_wait_timeout: Option<Duration>,
    pub user_apc_alloc_retries: u32,
    pub shutdown_wait_timeout: Duration,
    pub shutdown_max_passes: u32,
    pub wait_all_initial_timeout: Duration,
    pub quota: QuotaConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            debugger_present: false,
            short_delay: limits::SHORT_DELAY,
            wait_poll_interval: limits::WAIT_POLL_INTERVAL,
            context_wait_timeout: None,
            user_apc_alloc_retries: limits::USER_APC_ALLOC_RETRIES,
            shutdown_wait_timeout: limits::SHUTDOWN_WAIT_TIMEOUT,
            shutdown_max_passes: limits::SHUTDOWN_MAX_PASSES,
            wait_all_initial_timeout: limits::WAIT_ALL_INITIAL_TIMEOUT,
            quota: QuotaConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Short delays and timeouts for test harnesses
    pub fn testing() -> Self {
        Self {
            short_delay: Duration::from_millis(5),
            wait_poll_interval: Duration::from_millis(1),
            shutdown_wait_timeout: Duration::from_secs(5),
            shutdown_max_passes: 3,
            wait_all_initial_timeout: Duration::from_millis(10),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> KernelResult<Self> {
        serde_json::from_str(json).map_err(|e| KernelError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> KernelResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> KernelResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| KernelError::Config(e.to_string()))
    }

    /// Apply overrides from the environment
    ///
    /// - KERNEL_DEBUGGER_PRESENT: `1`/`true` to attach a debugger
    /// - KERNEL_SHORT_DELAY_MS: retry backoff in milliseconds
    /// - KERNEL_CONTEXT_TIMEOUT_MS: bound context waits
    /// - KERNEL_QUOTA_GIVEBACK: `0`/`false` to disable giveback
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_flag("KERNEL_DEBUGGER_PRESENT") {
            self.debugger_present = v;
        }
        if let Some(ms) = env_u64("KERNEL_SHORT_DELAY_MS") {
            self.short_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("KERNEL_CONTEXT_TIMEOUT_MS") {
            self.context_wait_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(v) = env_flag("KERNEL_QUOTA_GIVEBACK") {
            self.quota.giveback_enabled = v;
        }
        self
    }

    #[inline]
    #[must_use]
    pub fn with_debugger(mut self, present: bool) -> Self {
        self.debugger_present = present;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_context_timeout(mut self, timeout: Duration) -> Self {
        self.context_wait_timeout = Some(timeout);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
