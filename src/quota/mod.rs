/*!
 * Quota Ledger
 *
 * Per-kind usage/limit/peak/return counters shared by groups of processes.
 *
 * # Architecture
 *
 * - **QuotaEntry**: lock-free counters for one resource kind
 * - **QuotaBlock**: three entries plus explicit reference and process counts
 * - **QuotaLedger**: charge/return engine with expansion, scavenging and giveback
 * - **BackingStore**: the pool owner the ledger negotiates limit with
 */

mod backing;
mod block;
mod entry;
mod ledger;
mod types;

pub use backing::{BackingStore, PoolBackingStore};
pub use block::{QuotaBlock, QuotaBlockRef};
pub use entry::QuotaEntry;
pub use ledger::{ProcessCharge, ProcessQuota, QuotaAttachment, QuotaLedger};
pub use types::{
    ProcessQuotaSnapshot, QuotaBlockSnapshot, QuotaEntrySnapshot, QuotaKind, QuotaLimits,
    QuotaSplit, QuotaStats,
};
