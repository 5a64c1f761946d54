//! Long running operation registry.
//!
//! Every client visible operation (backup, restore, cleanup, lock,
//! unlock) gets a process-unique monotone id and a registry entry. The
//! actual work runs as a detached tokio task which owns the entry's
//! status; nothing an operation does can propagate a panic or error past
//! the task boundary. Entries are kept for the life of the process so
//! status can be queried after completion.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::progress::Progress;
use crate::tools::{AsyncSleeper, CancelToken};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpName {
    Backup,
    Lock,
    Restore,
    Unlock,
    Cleanup,
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpName::Backup => "backup",
            OpName::Lock => "lock",
            OpName::Restore => "restore",
            OpName::Unlock => "unlock",
            OpName::Cleanup => "cleanup",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for OpName {
    type Err = UnknownOpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(OpName::Backup),
            "lock" => Ok(OpName::Lock),
            "restore" => Ok(OpName::Restore),
            "unlock" => Ok(OpName::Unlock),
            "cleanup" => Ok(OpName::Cleanup),
            _ => Err(UnknownOpError { op_name: s.to_string(), op_id: 0 }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Starting,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl OpStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpStatus::Done | OpStatus::Failed | OpStatus::Cancelled)
    }
}

/// How an operation's task ends when it does not succeed.
#[derive(Debug, ThisError)]
pub enum OpError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, ThisError)]
#[error("unknown operation: {op_name} {op_id}")]
pub struct UnknownOpError {
    pub op_name: String,
    pub op_id: u64,
}

/// Point-in-time view of one operation, served by the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct OpSnapshot {
    pub state: OpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

struct OpEntry {
    op_name: OpName,
    op_status: OpStatus,
    message: Option<String>,
    progress: Option<Arc<Mutex<Progress>>>,
    sleeper: Option<Arc<AsyncSleeper>>,
    cancel: CancelToken,
}

#[derive(Default)]
struct RegistryInner {
    next_op_id: u64,
    ops: HashMap<u64, OpEntry>,
}

#[derive(Default)]
pub struct OpRegistry {
    inner: Mutex<RegistryInner>,
}

impl OpRegistry {
    pub fn new() -> OpRegistry {
        OpRegistry::default()
    }

    pub fn allocate_op_id(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_op_id += 1;
        inner.next_op_id
    }

    /// Register operation `op_id` and launch its work as a background
    /// task. `progress` is shared with the running operation and served
    /// on status queries for backup/restore; `sleeper` is woken by
    /// sub-result notifications; `cancel` is the operation's cooperative
    /// cancellation token.
    pub fn start_op<F>(
        self: &Arc<Self>,
        op_id: u64,
        op_name: OpName,
        progress: Option<Arc<Mutex<Progress>>>,
        sleeper: Option<Arc<AsyncSleeper>>,
        cancel: CancelToken,
        fut: F,
    ) where
        F: std::future::Future<Output = Result<(), OpError>> + Send + 'static,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.ops.insert(
                op_id,
                OpEntry {
                    op_name,
                    op_status: OpStatus::Starting,
                    message: None,
                    progress,
                    sleeper,
                    cancel,
                },
            );
        }
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.transition(op_id, OpStatus::Running, None);
            match fut.await {
                Ok(()) => {
                    log::info!("operation {} {} done", op_name, op_id);
                    registry.transition(op_id, OpStatus::Done, None);
                }
                Err(OpError::Cancelled) => {
                    log::info!("operation {} {} cancelled", op_name, op_id);
                    registry.transition(op_id, OpStatus::Cancelled, None);
                }
                Err(OpError::Failed(message)) => {
                    log::warn!("operation {} {} failed: {}", op_name, op_id, message);
                    registry.transition(op_id, OpStatus::Failed, Some(message));
                }
            }
        });
    }

    fn transition(&self, op_id: u64, op_status: OpStatus, message: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.ops.get_mut(&op_id) {
            if !entry.op_status.is_terminal() {
                entry.op_status = op_status;
                if message.is_some() {
                    entry.message = message;
                }
            }
        }
    }

    fn with_entry<T>(
        &self,
        op_id: u64,
        op_name: OpName,
        f: impl FnOnce(&OpEntry) -> T,
    ) -> Result<T, UnknownOpError> {
        let inner = self.inner.lock().unwrap();
        match inner.ops.get(&op_id) {
            Some(entry) if entry.op_name == op_name => Ok(f(entry)),
            _ => Err(UnknownOpError { op_name: op_name.to_string(), op_id }),
        }
    }

    pub fn get(&self, op_id: u64, op_name: OpName) -> Result<OpSnapshot, UnknownOpError> {
        self.with_entry(op_id, op_name, |entry| OpSnapshot {
            state: entry.op_status,
            message: entry.message.clone(),
            progress: entry.progress.as_ref().map(|p| p.lock().unwrap().clone()),
        })
    }

    /// Wake the operation's poller so it fetches node results right away.
    pub fn sub_result(&self, op_id: u64, op_name: OpName) -> Result<(), UnknownOpError> {
        self.with_entry(op_id, op_name, |entry| {
            if let Some(sleeper) = &entry.sleeper {
                sleeper.wakeup();
            }
        })
    }

    /// Request cooperative cancellation; the operation transitions to
    /// `cancelled` once its task observes the token.
    pub fn cancel(&self, op_id: u64, op_name: OpName) -> Result<(), UnknownOpError> {
        self.with_entry(op_id, op_name, |entry| entry.cancel.cancel())
    }
}
