/*!
 * Quota Types
 * Resource kinds, limit sets and read-only snapshots
 */

use crate::core::limits::NO_CAP;
use crate::core::Status;
use serde::{Deserialize, Serialize};

/// Pooled resource a quota entry tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    NonPaged = 0,
    Paged = 1,
    PageFile = 2,
}

impl QuotaKind {
    pub const COUNT: usize = 3;
    pub const ALL: [QuotaKind; 3] = [QuotaKind::NonPaged, QuotaKind::Paged, QuotaKind::PageFile];
    /// Kinds backed by pool memory (the ones that expand and give back)
    pub const POOL: [QuotaKind; 2] = [QuotaKind::NonPaged, QuotaKind::Paged];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn is_pool(self) -> bool {
        !matches!(self, QuotaKind::PageFile)
    }

    /// Status reported when a charge of this kind cannot be satisfied
    #[inline]
    pub const fn exceeded_status(self) -> Status {
        match self {
            QuotaKind::PageFile => Status::PAGEFILE_QUOTA_EXCEEDED,
            _ => Status::QUOTA_EXCEEDED,
        }
    }
}

/// One value per quota kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub non_paged: usize,
    pub paged: usize,
    pub page_file: usize,
}

impl QuotaLimits {
    pub const fn new(non_paged: usize, paged: usize, page_file: usize) -> Self {
        Self {
            non_paged,
            paged,
            page_file,
        }
    }

    pub const fn unlimited() -> Self {
        Self::new(NO_CAP, NO_CAP, NO_CAP)
    }

    #[inline]
    pub const fn get(&self, kind: QuotaKind) -> usize {
        match kind {
            QuotaKind::NonPaged => self.non_paged,
            QuotaKind::Paged => self.paged,
            QuotaKind::PageFile => self.page_file,
        }
    }

    #[inline]
    pub fn set(&mut self, kind: QuotaKind, value: usize) {
        match kind {
            QuotaKind::NonPaged => self.non_paged = value,
            QuotaKind::Paged => self.paged = value,
            QuotaKind::PageFile => self.page_file = value,
        }
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Counters of one entry at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntrySnapshot {
    pub usage: usize,
    pub limit: usize,
    pub peak: usize,
    pub pending_return: usize,
}

/// Block-wide view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaBlockSnapshot {
    pub id: u64,
    pub is_default: bool,
    pub entries: [QuotaEntrySnapshot; 3],
    pub reference_count: usize,
    pub process_count: usize,
}

impl QuotaBlockSnapshot {
    #[inline]
    pub fn entry(&self, kind: QuotaKind) -> &QuotaEntrySnapshot {
        &self.entries[kind.index()]
    }
}

/// What a process has charged, as its own mirror records it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessQuotaSnapshot {
    pub usage: [usize; 3],
    pub peak: [usize; 3],
    pub block: QuotaBlockSnapshot,
}

/// How one return was divided between the process block and the default block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSplit {
    pub block: usize,
    pub default: usize,
}

/// Ledger activity counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStats {
    pub charges: u64,
    pub returns: u64,
    pub failures: u64,
    pub cas_retries: u64,
    pub credit_reclaims: u64,
    pub expansions: u64,
    pub scavenges: u64,
    pub givebacks: u64,
    pub blocks_created: u64,
    pub blocks_destroyed: u64,
}
