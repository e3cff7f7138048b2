/*!
 * Message Ports
 *
 * Best-effort notification channels: termination ports registered by a
 * thread, a process's exception and debug ports, and job completion ports.
 */

use crate::core::types::{Pid, Tid};
use crate::core::Status;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Reason a job reports for a member process leaving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExitReason {
    ExitProcess,
    /// The process died of a fault, trap or user break
    AbnormalExitProcess,
}

/// Messages the lifecycle core sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortMessage {
    /// A client thread of the port owner died
    ClientDied {
        pid: Pid,
        tid: Tid,
        create_time: SystemTime,
    },
    /// Debugger: a thread of the debuggee exited
    ThreadExited { pid: Pid, tid: Tid, status: Status },
    /// Debugger: the debuggee's last thread exited
    ProcessExited { pid: Pid, status: Status },
    JobCompletion {
        job: u32,
        pid: Pid,
        reason: JobExitReason,
    },
}

/// Send failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// Transient; the sender retries after a short delay
    #[error("insufficient resources to queue the message")]
    InsufficientResources,
    #[error("port disconnected")]
    Disconnected,
}

impl PortError {
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, PortError::InsufficientResources)
    }
}

/// Destination for lifecycle notifications
pub trait MessagePort: Send + Sync {
    fn send(&self, message: PortMessage) -> Result<(), PortError>;
}

/// Port backed by an unbounded channel
///
/// Can be told to fail the next few sends with a transient error.
pub struct QueuePort {
    tx: flume::Sender<PortMessage>,
    transient_failures: AtomicU32,
}

impl QueuePort {
    pub fn new() -> (Arc<QueuePort>, flume::Receiver<PortMessage>) {
        let (tx, rx) = flume::unbounded();
        let port = Arc::new(QueuePort {
            tx,
            transient_failures: AtomicU32::new(0),
        });
        (port, rx)
    }

    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::Release);
    }
}

impl MessagePort for QueuePort {
    fn send(&self, message: PortMessage) -> Result<(), PortError> {
        let failing = self
            .transient_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PortError::InsufficientResources);
        }
        self.tx.send(message).map_err(|_| PortError::Disconnected)
    }
}

/// A termination port registered on a thread
#[derive(Clone)]
pub struct TerminationPort {
    pub port: Arc<dyn MessagePort>,
}

impl std::fmt::Debug for TerminationPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TerminationPort")
    }
}

/// Security port slot of a process
#[derive(Clone, Default)]
pub enum SecurityPort {
    #[default]
    None,
    Connected(Arc<dyn MessagePort>),
    /// Rundown closed it; nothing may connect again
    Closed,
}

impl SecurityPort {
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, SecurityPort::Closed)
    }
}
