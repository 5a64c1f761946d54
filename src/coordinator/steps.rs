//! The step pipeline: backup and restore are expressed as an ordered
//! sequence of steps, each reading earlier results from a shared context
//! and contributing exactly one typed result of its own.
//!
//! Results are keyed by the step's type, so a later step names the step
//! it depends on and gets that step's declared output type back. Writing
//! a result twice, or reading one that was never written, is a
//! programming error in the pipeline definition and fails the operation.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error as ThisError;

use crate::coordinator::cluster::{Cluster, WaitResultError};
use crate::ipc;

#[derive(Debug, ThisError)]
pub enum StepError {
    /// The step decided the operation cannot succeed.
    #[error("{0}")]
    Failed(String),
    /// A remote hiccup; the whole attempt may be retried.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Invariant violation in the pipeline definition itself.
    #[error("internal error: {0}")]
    Internal(String),
}

// Poll waits fail on remote weather (timeouts, flapping nodes); a new
// attempt gets a fresh chance.
impl From<WaitResultError> for StepError {
    fn from(err: WaitResultError) -> StepError {
        StepError::Transient(err.to_string())
    }
}

/// Carrier of per-attempt state across one pipeline run.
pub struct StepsContext {
    pub attempt: u32,
    pub attempt_start: DateTime<Utc>,
    step_results: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
}

impl StepsContext {
    pub fn new(attempt: u32, attempt_start: DateTime<Utc>) -> StepsContext {
        StepsContext {
            attempt,
            attempt_start,
            step_results: Mutex::new(HashMap::new()),
        }
    }

    /// Manifest name of the backup this attempt would produce.
    pub fn backup_name(&self) -> String {
        ipc::backup_name(self.attempt_start)
    }

    pub fn set_result<S: Step>(&self, result: S::Output) -> Result<(), StepError> {
        let mut results = self.step_results.lock().unwrap();
        if results.contains_key(&TypeId::of::<S>()) {
            return Err(StepError::Internal(format!(
                "result already set for step {}",
                std::any::type_name::<S>()
            )));
        }
        results.insert(TypeId::of::<S>(), Box::new(result));
        Ok(())
    }

    pub fn get_result<S: Step>(&self) -> Result<S::Output, StepError> {
        let results = self.step_results.lock().unwrap();
        results
            .get(&TypeId::of::<S>())
            .and_then(|result| result.downcast_ref::<S::Output>())
            .cloned()
            .ok_or_else(|| {
                StepError::Internal(format!("no result for step {}", std::any::type_name::<S>()))
            })
    }
}

/// One unit of a backup/restore pipeline, with a typed output.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    type Output: Clone + Send + 'static;

    async fn run_step(&self, cluster: &Cluster, context: &StepsContext)
        -> Result<Self::Output, StepError>;
}

/// Type-erased step so pipelines can hold heterogeneous step lists; the
/// blanket impl stores the typed output into the context under the
/// step's own type.
#[async_trait]
pub trait DynStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cluster: &Cluster, context: &StepsContext) -> Result<(), StepError>;
}

#[async_trait]
impl<S: Step> DynStep for S {
    fn name(&self) -> &'static str {
        std::any::type_name::<S>()
    }

    async fn run(&self, cluster: &Cluster, context: &StepsContext) -> Result<(), StepError> {
        let output = self.run_step(cluster, context).await?;
        context.set_result::<S>(output)
    }
}

/// Convenience for plugin step list construction.
pub fn boxed<S: Step>(step: S) -> Box<dyn DynStep> {
    Box::new(step)
}

/// Run `steps` in order against one context. The first error stops the
/// pipeline; whether the attempt may restart is the caller's call based
/// on the error kind.
pub async fn run_pipeline(
    cluster: &Cluster,
    steps: &[Box<dyn DynStep>],
    context: &StepsContext,
) -> Result<(), StepError> {
    for step in steps {
        log::debug!("running step {} (attempt {})", step.name(), context.attempt);
        step.run(cluster, context).await?;
    }
    Ok(())
}
