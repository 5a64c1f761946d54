//! The coordinator: client facing operations stitched together from the
//! cluster client, the lock protocol, the poller and the step pipeline.
//!
//! Every operation follows the same life cycle: allocate an id, acquire
//! the cluster lock where needed, run the plugin supplied pipeline as a
//! background task with a lock refresher at its side, release the lock
//! on any exit, and leave the outcome in the operation registry for
//! status queries.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error as ThisError;

use crate::config::CoordinatorConfig;
use crate::ipc::{CleanupRequest, ListRequest, ListResponse, RestoreRequest};
use crate::progress::Progress;
use crate::stats::StatsClient;
use crate::storage::{build_storage, HexDigestStorage, JsonStorage};
use crate::tools::http::HttpClient;
use crate::tools::{AsyncSleeper, CancelToken};

pub mod cleanup;
pub mod cluster;
pub mod list;
pub mod lock;
pub mod op;
pub mod plugins;
pub mod steps;

use cluster::Cluster;
use lock::{acquire_cluster_lock, run_with_lock, LockOps};
use op::{OpError, OpName, OpRegistry, OpSnapshot, UnknownOpError};
use plugins::{build_plugin, CoordinatorPlugin, OperationContext};
use steps::{run_pipeline, DynStep, StepError, StepsContext};

#[derive(Debug, ThisError)]
pub enum CoordinatorError {
    #[error("unable to lock all nodes")]
    LockingFailed,
    #[error("already caching list result")]
    ListBusy,
    #[error(transparent)]
    UnknownOp(#[from] UnknownOpError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Returned by every operation starting endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct StartedOp {
    pub op_id: u64,
    pub status_url: String,
}

/// Lock operations additionally hand the matching unlock URL back.
#[derive(Clone, Debug, serde::Serialize)]
pub struct LockStartResult {
    pub op_id: u64,
    pub status_url: String,
    pub unlock_url: String,
}

struct CachedListResponse {
    list_request: ListRequest,
    list_response: ListResponse,
    timestamp: Instant,
}

#[derive(Default)]
struct CoordinatorState {
    cached_list_response: Option<CachedListResponse>,
    cached_list_running: bool,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<OpRegistry>,
    plugin: Arc<dyn CoordinatorPlugin>,
    json_storage: Arc<dyn JsonStorage>,
    hexdigest_storage: Arc<dyn HexDigestStorage>,
    stats: Arc<StatsClient>,
    http: HttpClient,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Coordinator, anyhow::Error> {
        let (json_storage, hexdigest_storage) = build_storage(&config.object_storage)?;
        Self::with_storage(config, json_storage, hexdigest_storage)
    }

    /// Like [`Coordinator::new`], but on caller supplied storage
    /// backends instead of the configured ones.
    pub fn with_storage(
        config: CoordinatorConfig,
        json_storage: Arc<dyn JsonStorage>,
        hexdigest_storage: Arc<dyn HexDigestStorage>,
    ) -> Result<Coordinator, anyhow::Error> {
        config.validate()?;
        let stats = Arc::new(StatsClient::new(config.statsd.as_ref())?);
        let plugin = build_plugin(&config.plugin);
        Ok(Coordinator {
            config,
            registry: Arc::new(OpRegistry::new()),
            plugin,
            json_storage,
            hexdigest_storage,
            stats,
            http: HttpClient::new(),
            state: Mutex::new(CoordinatorState::default()),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn operation_context(&self) -> OperationContext {
        OperationContext {
            storage_name: self.config.storage_name.clone(),
            json_storage: self.json_storage.clone(),
            hexdigest_storage: self.hexdigest_storage.clone(),
        }
    }

    fn build_cluster(&self) -> Cluster {
        Cluster::new(
            self.config.nodes.clone(),
            self.config.poll.clone(),
            self.http.clone(),
            self.stats.clone(),
        )
    }

    fn status_url(&self, op_name: OpName, op_id: u64) -> String {
        format!(
            "{}/{}/{}",
            self.config.coordinator_url.trim_end_matches('/'),
            op_name,
            op_id
        )
    }

    /// Start a stepped long operation under the cluster lock.
    ///
    /// The lock is acquired before the operation is registered, so a
    /// fenced-out request fails synchronously; everything after that
    /// happens in the operation's own task.
    async fn start_locked_op(
        self: &Arc<Self>,
        op_name: OpName,
        steps: Vec<Box<dyn DynStep>>,
        attempts: u32,
        with_progress: bool,
    ) -> Result<StartedOp, CoordinatorError> {
        let op_id = self.registry.allocate_op_id();
        let sleeper = Arc::new(AsyncSleeper::new());
        let status_url = self.status_url(op_name, op_id);

        let mut cluster = self.build_cluster();
        cluster.set_subresult(format!("{}/sub-result", status_url), Arc::clone(&sleeper));
        let cluster = Arc::new(cluster);

        let progress = if with_progress {
            let progress = Arc::new(Mutex::new(Progress::default()));
            let handler_progress = Arc::clone(&progress);
            cluster.set_progress_handler(Some(Box::new(move |p| {
                *handler_progress.lock().unwrap() = p;
            })));
            Some(progress)
        } else {
            None
        };

        let lock = acquire_cluster_lock(&cluster, self.config.default_lock_ttl)
            .await
            .map_err(|_| CoordinatorError::LockingFailed)?;

        let cancel = CancelToken::new();
        let retry_wait = Duration::from_secs_f64(self.config.attempt_retry_wait);
        let run_cluster = Arc::clone(&cluster);
        let fut = run_with_lock(cluster, lock, cancel.clone(), async move {
            run_attempts(&run_cluster, &steps, op_name, attempts, retry_wait).await
        });
        self.registry
            .start_op(op_id, op_name, progress, Some(sleeper), cancel, fut);
        Ok(StartedOp { op_id, status_url })
    }

    pub async fn start_backup(self: &Arc<Self>) -> Result<StartedOp, CoordinatorError> {
        let steps = self.plugin.backup_steps(&self.operation_context())?;
        self.start_locked_op(OpName::Backup, steps, self.config.backup_attempts, true)
            .await
    }

    pub async fn start_restore(
        self: &Arc<Self>,
        req: RestoreRequest,
    ) -> Result<StartedOp, CoordinatorError> {
        let steps = self.plugin.restore_steps(&self.operation_context(), &req)?;
        self.start_locked_op(OpName::Restore, steps, self.config.restore_attempts, true)
            .await
    }

    pub async fn start_cleanup(
        self: &Arc<Self>,
        req: CleanupRequest,
    ) -> Result<StartedOp, CoordinatorError> {
        let steps = cleanup::cleanup_steps(&self.operation_context(), &self.config.retention, &req);
        self.start_locked_op(OpName::Cleanup, steps, 1, false).await
    }

    pub fn start_lock(self: &Arc<Self>, locker: String, ttl: u64) -> LockStartResult {
        let op_id = self.registry.allocate_op_id();
        let ops = LockOps::new(Arc::new(self.build_cluster()), locker.clone(), ttl);
        self.registry.start_op(
            op_id,
            OpName::Lock,
            None,
            None,
            CancelToken::new(),
            async move { ops.lock().await },
        );
        LockStartResult {
            op_id,
            status_url: self.status_url(OpName::Lock, op_id),
            unlock_url: format!(
                "{}/unlock?locker={}",
                self.config.coordinator_url.trim_end_matches('/'),
                locker
            ),
        }
    }

    pub fn start_unlock(self: &Arc<Self>, locker: String) -> StartedOp {
        let op_id = self.registry.allocate_op_id();
        let ops = LockOps::new(Arc::new(self.build_cluster()), locker, 0);
        self.registry.start_op(
            op_id,
            OpName::Unlock,
            None,
            None,
            CancelToken::new(),
            async move { ops.unlock().await },
        );
        StartedOp { op_id, status_url: self.status_url(OpName::Unlock, op_id) }
    }

    pub fn op_status(&self, op_name: OpName, op_id: u64) -> Result<OpSnapshot, CoordinatorError> {
        Ok(self.registry.get(op_id, op_name)?)
    }

    pub fn sub_result(&self, op_name: OpName, op_id: u64) -> Result<(), CoordinatorError> {
        Ok(self.registry.sub_result(op_id, op_name)?)
    }

    pub fn cancel_op(&self, op_name: OpName, op_id: u64) -> Result<(), CoordinatorError> {
        Ok(self.registry.cancel(op_id, op_name)?)
    }

    /// Cached backup listing with a single-flight build.
    ///
    /// At most one listing is computed at a time; readers racing a build
    /// are told busy rather than piling up behind it.
    pub async fn list_backups(&self, req: &ListRequest) -> Result<ListResponse, CoordinatorError> {
        let list_ttl = Duration::from_secs_f64(self.config.list_ttl);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(cached) = &state.cached_list_response {
                if cached.list_request == *req && cached.timestamp.elapsed() < list_ttl {
                    return Ok(cached.list_response.clone());
                }
            }
            if state.cached_list_running {
                return Err(CoordinatorError::ListBusy);
            }
            state.cached_list_running = true;
        }
        let result =
            list::compute_list_response(&self.config.storage_name, &self.json_storage).await;
        let mut state = self.state.lock().unwrap();
        state.cached_list_running = false;
        match result {
            Ok(list_response) => {
                state.cached_list_response = Some(CachedListResponse {
                    list_request: req.clone(),
                    list_response: list_response.clone(),
                    timestamp: Instant::now(),
                });
                Ok(list_response)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Run the pipeline up to `attempts` times, each attempt on a fresh
/// context; only transient step failures are worth another attempt.
async fn run_attempts(
    cluster: &Cluster,
    steps: &[Box<dyn DynStep>],
    op_name: OpName,
    attempts: u32,
    retry_wait: Duration,
) -> Result<(), OpError> {
    for attempt in 1..=attempts {
        log::info!("{} attempt {}/{}", op_name, attempt, attempts);
        let context = StepsContext::new(attempt, Utc::now());
        match run_pipeline(cluster, steps, &context).await {
            Ok(()) => return Ok(()),
            Err(StepError::Transient(message)) => {
                log::warn!(
                    "{} attempt {}/{} failed transiently: {}",
                    op_name,
                    attempt,
                    attempts,
                    message
                );
                if attempt < attempts {
                    tokio::time::sleep(retry_wait).await;
                }
            }
            Err(StepError::Failed(message)) => return Err(OpError::Failed(message)),
            Err(StepError::Internal(message)) => return Err(OpError::Failed(message)),
        }
    }
    Err(OpError::Failed(format!(
        "unable to complete operation in {} attempts",
        attempts
    )))
}
