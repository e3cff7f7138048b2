/*!
 * Kernel Builder
 * Builder pattern for Kernel construction
 */

use super::{CidTable, Kernel, KernelInner, NotifyRegistry};
use crate::core::errors::KernelResult;
use crate::core::types::{ImageName, SYSTEM_PID};
use crate::core::KernelConfig;
use crate::monitoring::LifecycleStats;
use crate::process::object::ProcessFlags;
use crate::process::{
    AddressSpaceManager, Collaborators, IoCancellation, KernelStackAllocator, PoolAllocator,
    Process, Reaper, RegistryNotifyRundown, RundownOrchestrator, SecurityAudit, SubsystemRundown,
    TimerRundown,
};
use crate::quota::{BackingStore, QuotaLedger};
use arc_swap::ArcSwap;
use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;

/// Builder for Kernel
pub struct KernelBuilder {
    config: KernelConfig,
    collaborators: Collaborators,
    backing: Option<Arc<dyn BackingStore>>,
    subsystems: Vec<Arc<dyn SubsystemRundown>>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            collaborators: Collaborators::default(),
            backing: None,
            subsystems: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn PoolAllocator>) -> Self {
        self.collaborators.pool = pool;
        self
    }

    #[must_use]
    pub fn with_stacks(mut self, stacks: Arc<dyn KernelStackAllocator>) -> Self {
        self.collaborators.stacks = stacks;
        self
    }

    #[must_use]
    pub fn with_address_spaces(mut self, address_spaces: Arc<dyn AddressSpaceManager>) -> Self {
        self.collaborators.address_spaces = address_spaces;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn SecurityAudit>) -> Self {
        self.collaborators.audit = audit;
        self
    }

    /// Quota backing store; defaults to a pool store sized from the quota config
    #[must_use]
    pub fn with_backing_store(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.backing = Some(backing);
        self
    }

    /// Extra subsystem run down after the built-in ones
    #[must_use]
    pub fn with_subsystem(mut self, subsystem: Arc<dyn SubsystemRundown>) -> Self {
        self.subsystems.push(subsystem);
        self
    }

    pub fn build(self) -> KernelResult<Kernel> {
        let config = self.config;
        let stats = Arc::new(LifecycleStats::new());
        let quota = match self.backing {
            Some(backing) => QuotaLedger::new(config.quota.clone(), backing),
            None => QuotaLedger::with_pool_backing(config.quota.clone()),
        };

        let io = Arc::new(IoCancellation::new());
        let timers = Arc::new(TimerRundown::new());
        let registry = Arc::new(RegistryNotifyRundown::new());
        // Registered later runs first: callers' subsystems before the built-in ones
        let rundown = self.subsystems.into_iter().fold(
            RundownOrchestrator::new()
                .register(io.clone())
                .register(timers.clone())
                .register(registry.clone()),
            |orchestrator, subsystem| orchestrator.register(subsystem),
        );

        let cids = Arc::new(CidTable::new());
        let system = Arc::new(Process::new(
            SYSTEM_PID,
            ImageName::new("System"),
            None,
            true,
            None,
        ));
        quota.inherit(system.quota(), None);
        if self.collaborators.address_spaces.create(SYSTEM_PID) {
            system.test_and_set(ProcessFlags::HAS_ADDRESS_SPACE);
        }
        cids.insert_process(system.clone());

        let reaper = Reaper::start(
            cids.clone(),
            self.collaborators.stacks.clone(),
            stats.clone(),
        )?;

        let mut features = vec!["reaper"];
        if config.debugger_present {
            features.push("debugger");
        }
        if config.quota.giveback_enabled {
            features.push("quota-giveback");
        }
        if config.context_wait_timeout.is_some() {
            features.push("bounded-context-waits");
        }
        info!(
            "Kernel initialized with: {} ({} rundown subsystems)",
            features.join(", "),
            rundown.subsystem_count()
        );

        Ok(Kernel {
            inner: Arc::new(KernelInner {
                config: ArcSwap::from_pointee(config),
                cids,
                system,
                quota,
                reaper,
                collaborators: self.collaborators,
                rundown,
                io,
                timers,
                registry,
                notify: NotifyRegistry::default(),
                stats,
                halted: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                next_job: AtomicU32::new(1),
            }),
        })
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
