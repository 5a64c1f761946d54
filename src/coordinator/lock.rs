//! Cluster wide locking.
//!
//! Long operations fence each other by holding a per-node lock on every
//! node agent under one locker token. The coordinator re-locks at half
//! the TTL while the operation runs; if the coordinator dies, the node
//! locks expire on their own, which is the designed fencing mechanism.

use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::cluster::{Cluster, LockResult};
use crate::coordinator::op::OpError;
use crate::tools::CancelToken;

/// Explicitly requested lock/unlock with a client supplied locker token
/// (the `POST /lock` and `POST /unlock` operations).
pub struct LockOps {
    cluster: Arc<Cluster>,
    locker: String,
    ttl: u64,
}

impl LockOps {
    pub fn new(cluster: Arc<Cluster>, locker: String, ttl: u64) -> LockOps {
        LockOps { cluster, locker, ttl }
    }

    pub async fn lock(&self) -> Result<(), OpError> {
        match self.cluster.request_lock(&self.locker, self.ttl).await {
            LockResult::Ok => Ok(()),
            _ => {
                // Some nodes may have locked; release those again.
                let _ = self.cluster.request_unlock(&self.locker).await;
                Err(OpError::Failed("unable to lock all nodes".to_string()))
            }
        }
    }

    pub async fn unlock(&self) -> Result<(), OpError> {
        match self.cluster.request_unlock(&self.locker).await {
            LockResult::Ok => Ok(()),
            _ => Err(OpError::Failed("unable to unlock all nodes".to_string())),
        }
    }
}

/// A held cluster lock owned by one long operation.
pub struct ClusterLock {
    pub locker: String,
    pub ttl: u64,
}

/// Take the cluster lock under a fresh locker token. On anything but a
/// clean acquire the partial locks are released again best effort.
pub async fn acquire_cluster_lock(cluster: &Cluster, ttl: u64) -> Result<ClusterLock, OpError> {
    let locker = uuid::Uuid::new_v4().to_string();
    match cluster.request_lock(&locker, ttl).await {
        LockResult::Ok => Ok(ClusterLock { locker, ttl }),
        result => {
            log::info!("cluster lock acquisition as {} failed: {:?}", locker, result);
            let _ = cluster.request_unlock(&locker).await;
            Err(OpError::Failed("unable to lock all nodes".to_string()))
        }
    }
}

/// Run `fut` while keeping `lock` refreshed. Terminates early when the
/// lock is lost or `cancel` fires; in every case the refresher is
/// stopped first and then the lock released best effort.
pub async fn run_with_lock<F>(
    cluster: Arc<Cluster>,
    lock: ClusterLock,
    cancel: CancelToken,
    fut: F,
) -> Result<(), OpError>
where
    F: std::future::Future<Output = Result<(), OpError>> + Send,
{
    let lock_lost = CancelToken::new();
    let refresher = tokio::spawn(relock_loop(
        Arc::clone(&cluster),
        lock.locker.clone(),
        lock.ttl,
        lock_lost.clone(),
    ));
    let result = tokio::select! {
        result = fut => result,
        _ = lock_lost.cancelled() => Err(OpError::Failed("cluster lock lost".to_string())),
        _ = cancel.cancelled() => Err(OpError::Cancelled),
    };
    refresher.abort();
    let _ = cluster.request_unlock(&lock.locker).await;
    result
}

async fn relock_loop(cluster: Arc<Cluster>, locker: String, ttl: u64, lock_lost: CancelToken) {
    let interval = Duration::from_secs(std::cmp::max(ttl / 2, 1));
    loop {
        tokio::time::sleep(interval).await;
        for node in cluster.nodes() {
            match cluster.request_relock(node, &locker, ttl).await {
                LockResult::Ok => {}
                LockResult::Failure => {
                    log::warn!("relock of {} as {} failed, giving up lock", node.url, locker);
                    lock_lost.cancel();
                    return;
                }
                LockResult::Exception => {
                    // Node temporarily unreachable; its lock has not
                    // expired yet, try again next tick.
                    log::warn!("relock of {} as {} errored, retrying next tick", node.url, locker);
                }
            }
        }
    }
}
