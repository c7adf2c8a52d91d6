//! Resolution and invocation of a job's target under a deadline.
//!
//! The [`JobExecutor`] resolves a [`JobRecord`]'s [`crate::job::TargetRef`] through a
//! [`TargetLoader`], caching the resolved [`Service`], and runs the handler on its own task
//! raced against the job's `timeout_seconds`.
//!
//! Failures never escape the executor: they are reported as an [`ExecutionResult`] with
//! `success == false` and an [`ExecutionError`].
//!
//! When a job times out the [`CancellationToken`] handed to the handler through its
//! [`JobContext`] is cancelled and the handler's task is aborted. Handlers that block a thread
//! synchronously cannot be preempted, in which case the timeout only affects what is reported.
use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use fxhash::FxHashMap;
use thiserror::Error;
use tokio::{task::JoinError, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::job::{JobId, JobRecord};

pub mod registry;

use registry::{LoadError, Service, TargetLoader};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// What a handler gets to see of the job it runs for.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_name: String,
    /// The job's `params`, passed verbatim.
    pub params: serde_json::Value,
    /// The attempt number within the current execution, starting at 1.
    pub attempt: u32,
    /// Cancelled when the attempt exceeds the job's timeout.
    pub cancellation: CancellationToken,
}

/// An invocable job target.
///
/// Implemented for any `Fn(JobContext) -> impl Future<Output = HandlerResult>`.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn call(&self, ctx: JobContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: JobContext) -> HandlerResult {
        (self)(ctx).await
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Service '{service}' could not be resolved")]
    TargetResolution {
        service: String,
        path: Option<String>,
    },
    #[error("Method '{method}' not found on service '{service}'")]
    TargetMethodMissing { service: String, method: String },
    #[error("Timeout of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),
    #[error("Job panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Failed(String),
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::TargetResolution { .. } => "target_resolution",
            Self::TargetMethodMissing { .. } => "target_method_missing",
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panic",
            Self::Failed(_) => "error",
        }
    }
}

impl From<LoadError> for ExecutionError {
    fn from(value: LoadError) -> Self {
        match value {
            LoadError::NotFound { service, path } => Self::TargetResolution { service, path },
        }
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::Panicked(message)
    }
}

/// The outcome of invoking a job's target once.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<ExecutionError>,
    pub result: Option<serde_json::Value>,
}

impl ExecutionResult {
    pub fn succeeded(duration: Duration, result: serde_json::Value) -> Self {
        Self {
            success: true,
            duration_ms: duration.as_millis() as u64,
            error: None,
            result: Some(result),
        }
    }

    pub fn failed(duration: Duration, error: ExecutionError) -> Self {
        Self {
            success: false,
            duration_ms: duration.as_millis() as u64,
            error: Some(error),
            result: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_ref().is_some_and(ExecutionError::is_timeout)
    }

    /// The error message, if the execution failed.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct CacheKey {
    service: String,
    path: Option<String>,
}

/// Resolves and invokes job targets.
pub struct JobExecutor {
    loader: Arc<dyn TargetLoader>,
    cache: std::sync::RwLock<FxHashMap<CacheKey, Arc<Service>>>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("cached_services", &self.cached_services())
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    pub fn new(loader: impl TargetLoader + 'static) -> Self {
        Self::from_arc(Arc::new(loader))
    }

    pub fn from_arc(loader: Arc<dyn TargetLoader>) -> Self {
        Self {
            loader,
            cache: Default::default(),
        }
    }

    /// Runs a single attempt of `job`.
    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, service = %job.target.service, method = %job.target.method)
    )]
    pub async fn execute(&self, job: &JobRecord, attempt: u32) -> ExecutionResult {
        let start = Instant::now();
        let job_id = job.id;
        let handler = match self.resolve(job) {
            Ok(handler) => handler,
            Err(error) => {
                tracing::error!(%job_id, ?error, "Failed to resolve target for job {job_id}: {error}");
                return ExecutionResult::failed(start.elapsed(), error);
            }
        };

        let timeout = Duration::from_secs(job.timeout_seconds);
        let cancellation = CancellationToken::new();
        let ctx = JobContext {
            job_id,
            job_name: job.name.clone(),
            params: job.params.clone(),
            attempt,
            cancellation: cancellation.clone(),
        };

        tracing::info!(%job_id, attempt, "Executing job {job_id} attempt {attempt}");
        let mut task = tokio::spawn(async move { handler.call(ctx).await }.in_current_span());

        let result = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(value))) => ExecutionResult::succeeded(start.elapsed(), value),
            Ok(Ok(Err(error))) => {
                ExecutionResult::failed(start.elapsed(), ExecutionError::Failed(error.to_string()))
            }
            Ok(Err(error)) => ExecutionResult::failed(start.elapsed(), error.into()),
            Err(_elapsed) => {
                cancellation.cancel();
                task.abort();
                ExecutionResult::failed(start.elapsed(), ExecutionError::Timeout(timeout))
            }
        };

        match &result.error {
            None => tracing::info!(
                %job_id,
                attempt,
                duration_ms = result.duration_ms,
                "Job {job_id} succeeded in {}ms",
                result.duration_ms
            ),
            Some(error) => tracing::warn!(
                %job_id,
                attempt,
                duration_ms = result.duration_ms,
                error_type = error.error_type(),
                "Job {job_id} failed: {error}"
            ),
        }
        result
    }

    fn resolve(&self, job: &JobRecord) -> Result<Arc<dyn JobHandler>, ExecutionError> {
        let target = &job.target;
        let service = self.service(&target.service, target.path.as_deref())?;
        service
            .method(&target.method)
            .ok_or_else(|| ExecutionError::TargetMethodMissing {
                service: target.service.clone(),
                method: target.method.clone(),
            })
    }

    fn service(&self, name: &str, path: Option<&str>) -> Result<Arc<Service>, ExecutionError> {
        let key = CacheKey {
            service: name.to_owned(),
            path: path.map(ToOwned::to_owned),
        };
        if let Some(service) = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
        {
            return Ok(service.clone());
        }

        let service = self.loader.load(name, path)?;
        tracing::debug!(service = name, ?path, "Caching resolved service {name}");
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, service.clone());
        Ok(service)
    }

    /// Forgets every resolved service.
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Forgets the resolved service `name`, under any path.
    pub fn remove_cached_service(&self, name: &str) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|key, _| key.service != name);
    }

    pub fn cached_services(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::job::TargetRef;
    use registry::TargetRegistry;

    #[derive(Debug)]
    pub(crate) struct MockError(pub String);

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for MockError {}

    /// A registry with a `mock` service exposing handlers for every kind of outcome.
    pub(crate) fn mock_registry() -> TargetRegistry {
        TargetRegistry::new()
            .with_handler("mock", "run", |ctx: JobContext| async move {
                Ok::<_, HandlerError>(json!({ "params": ctx.params }))
            })
            .with_handler("mock", "fail", |_ctx: JobContext| async {
                Err::<serde_json::Value, HandlerError>(Box::new(MockError("boom".to_owned())))
            })
            .with_handler("mock", "hang", |_ctx: JobContext| async {
                std::future::pending::<HandlerResult>().await
            })
            .with_handler("mock", "panic", |_ctx: JobContext| async {
                if true {
                    panic!("job panicked");
                }
                Ok::<_, HandlerError>(serde_json::Value::Null)
            })
    }

    fn job(method: &str) -> JobRecord {
        let mut job = JobRecord::raw_job();
        job.target = TargetRef::new("mock", method);
        job.params = json!({ "answer": 42 });
        job.timeout_seconds = 1;
        job
    }

    #[tokio::test]
    async fn execute_success() {
        let executor = JobExecutor::new(mock_registry());
        let result = executor.execute(&job("run"), 1).await;
        assert!(result.success);
        assert_eq!(result.error, None);
        assert_eq!(result.result, Some(json!({ "params": { "answer": 42 } })));
    }

    #[tokio::test]
    async fn execute_handler_error() {
        let executor = JobExecutor::new(mock_registry());
        let result = executor.execute(&job("fail"), 1).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ExecutionError::Failed("boom".to_owned())));
        assert_eq!(result.error_message().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn execute_panic() {
        let executor = JobExecutor::new(mock_registry());
        let result = executor.execute(&job("panic"), 1).await;
        assert!(!result.success);
        assert_eq!(
            result.error,
            Some(ExecutionError::Panicked("job panicked".to_owned()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn execute_timeout() {
        let executor = JobExecutor::new(mock_registry());
        let start = Instant::now();
        let result = executor.execute(&job("hang"), 1).await;

        assert!(!result.success);
        assert!(result.is_timeout());
        assert_eq!(
            result.error_message().as_deref(),
            Some("Timeout of 1000ms exceeded")
        );
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_handler() {
        let token = Arc::new(Mutex::new(None));
        let registry = TargetRegistry::new().with_handler("mock", "hang", {
            let token = token.clone();
            move |ctx: JobContext| {
                *token.lock().unwrap() = Some(ctx.cancellation.clone());
                async move {
                    ctx.cancellation.cancelled().await;
                    Ok::<_, HandlerError>(serde_json::Value::Null)
                }
            }
        });
        let executor = JobExecutor::new(registry);
        let result = executor.execute(&job("hang"), 1).await;

        assert!(result.is_timeout());
        let token = token.lock().unwrap().take().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn execute_unknown_service() {
        let executor = JobExecutor::new(mock_registry());
        let mut job = job("run");
        job.target = TargetRef::new("missing", "run");
        let result = executor.execute(&job, 1).await;
        assert_matches!(
            result.error,
            Some(ExecutionError::TargetResolution { service, path: None }) if service == "missing"
        );
        assert_eq!(executor.cached_services(), 0);
    }

    #[tokio::test]
    async fn execute_missing_method() {
        let executor = JobExecutor::new(mock_registry());
        let result = executor.execute(&job("unknown"), 1).await;
        assert_matches!(
            result.error,
            Some(ExecutionError::TargetMethodMissing { service, method })
                if service == "mock" && method == "unknown"
        );
    }

    struct CountingLoader {
        registry: TargetRegistry,
        loads: AtomicUsize,
    }

    impl TargetLoader for CountingLoader {
        fn load(&self, service: &str, path: Option<&str>) -> Result<Arc<Service>, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.registry.load(service, path)
        }
    }

    #[tokio::test]
    async fn resolution_is_cached() {
        let loader = Arc::new(CountingLoader {
            registry: mock_registry(),
            loads: AtomicUsize::new(0),
        });
        let executor = JobExecutor::from_arc(loader.clone());

        executor.execute(&job("run"), 1).await;
        executor.execute(&job("fail"), 1).await;
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(executor.cached_services(), 1);

        executor.remove_cached_service("mock");
        assert_eq!(executor.cached_services(), 0);
        executor.execute(&job("run"), 1).await;
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        executor.clear_cache();
        assert_eq!(executor.cached_services(), 0);
    }

    #[tokio::test]
    async fn handler_receives_context() {
        let registry = TargetRegistry::new().with_handler(
            "mock",
            "run",
            |ctx: JobContext| async move {
                Ok::<_, HandlerError>(json!({ "id": i64::from(ctx.job_id), "attempt": ctx.attempt }))
            },
        );
        let executor = JobExecutor::new(registry);
        let result = executor.execute(&job("run"), 3).await;
        assert_eq!(result.result, Some(json!({ "id": 1, "attempt": 3 })));
    }
}
