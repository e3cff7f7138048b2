/*!
 * Registry Notify Rundown
 * Change-notification watches registered by a thread
 */

use super::{RundownStats, SubsystemRundown};
use crate::core::types::Tid;
use dashmap::DashMap;
use smartstring::alias::String as SmartString;

#[derive(Debug, Default)]
pub struct RegistryNotifyRundown {
    watches: DashMap<Tid, Vec<SmartString>, ahash::RandomState>,
}

impl RegistryNotifyRundown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `key` for changes on behalf of `tid`
    pub fn watch(&self, tid: Tid, key: &str) {
        self.watches.entry(tid).or_default().push(SmartString::from(key));
    }

    pub fn watches_for(&self, tid: Tid) -> Vec<String> {
        self.watches
            .get(&tid)
            .map(|w| w.iter().map(|k| k.to_string()).collect())
            .unwrap_or_default()
    }
}

impl SubsystemRundown for RegistryNotifyRundown {
    fn rundown_thread(&self, tid: Tid) -> RundownStats {
        let count = self
            .watches
            .remove(&tid)
            .map(|(_, keys)| keys.len())
            .unwrap_or(0);
        RundownStats::cancelled(count)
    }

    fn subsystem(&self) -> &'static str {
        "registry_notify"
    }

    fn has_pending(&self, tid: Tid) -> bool {
        self.watches.get(&tid).is_some_and(|w| !w.is_empty())
    }
}
