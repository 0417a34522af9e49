use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinError;

use crate::job::{BackoffConfig, Job};

/// Error type for job execution
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),
}

pub type JobResult = Result<(), JobError>;

type BoxedHandler =
    Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync>;

/// A typed job definition: the handler plus submission defaults for jobs of
/// this type.
///
/// # Example
/// ```ignore
/// let send_email = JobDefinition::new("send_email", |args: SendEmailArgs| async move {
///     deliver(&args.to).await.map_err(|e| e.to_string())
/// })
/// .with_queue("mail")
/// .with_max_attempts(5)
/// .with_timeout(Duration::from_secs(30));
///
/// orchestrator.register(&send_email);
/// orchestrator.submit(&send_email, SendEmailArgs { to: "user@example.com".into() }).await?;
/// ```
pub struct JobDefinition<T> {
    name: &'static str,
    handler: BoxedHandler,
    queue: &'static str,
    priority: i32,
    max_attempts: u32,
    backoff: BackoffConfig,
    rate_key: Option<&'static str>,
    timeout: Option<Duration>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> JobDefinition<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new<F, Fut>(name: &'static str, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        let boxed: BoxedHandler = Arc::new(move |payload: Vec<u8>| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: T = serde_json::from_slice(&payload)?;
                handler(args).await.map_err(JobError::Execution)
            })
        });

        Self {
            name,
            handler: boxed,
            queue: "default",
            priority: 0,
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            rate_key: None,
            timeout: None,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn with_queue(mut self, queue: &'static str) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_key(mut self, rate_key: &'static str) -> Self {
        self.rate_key = Some(rate_key);
        self
    }

    /// Wall-clock budget for one execution; past it the attempt counts as
    /// failed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn queue(&self) -> &'static str {
        self.queue
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    pub fn rate_key(&self) -> Option<&'static str> {
        self.rate_key
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn handler(&self) -> BoxedHandler {
        Arc::clone(&self.handler)
    }
}

struct RegisteredHandler {
    handler: BoxedHandler,
    timeout: Option<Duration>,
}

/// Registry for job handlers
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<T>(&self, def: &JobDefinition<T>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(
            def.name.to_string(),
            RegisteredHandler {
                handler: def.handler(),
                timeout: def.timeout(),
            },
        );
    }

    /// Execute a job using its registered handler
    pub async fn execute(&self, job: &Job) -> JobResult {
        let (handler, timeout) = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            let reg = handlers
                .get(&job.job_type)
                .ok_or_else(|| JobError::HandlerNotFound(job.job_type.clone()))?;
            (reg.handler.clone(), reg.timeout)
        };

        let future = handler(job.payload.clone());
        let mut handle = tokio::spawn(async move { future.await });

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                JobError::Execution("Job handler panicked".to_string())
            } else {
                JobError::Execution("Job handler cancelled".to_string())
            }
        };

        match timeout {
            Some(duration) => {
                tokio::select! {
                    res = &mut handle => {
                        res.map_err(join_to_error)?
                    }
                    _ = tokio::time::sleep(duration) => {
                        handle.abort();
                        Err(JobError::Timeout(duration))
                    }
                }
            }
            None => handle.await.map_err(join_to_error)?,
        }
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().cloned().collect()
    }
}
