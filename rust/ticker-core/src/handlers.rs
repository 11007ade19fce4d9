//! Handler registry.
//!
//! Handlers are registered by function name before the scheduler starts. The
//! registry is immutable afterwards and shared by reference between the
//! dispatcher and every worker. Each entry erases its payload type: the
//! invoker deserializes the stored request bytes into the handler's own
//! payload type before calling it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cron::CronParser;
use crate::domain::JobKind;
use crate::error::{SchedulerError, SchedulerResult};
use crate::payload;

/// Worker lane a handler runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
    /// Bypasses the bounded pool.
    LongRunning,
}

/// How a handler ended, other than success.
#[derive(Debug, Error)]
pub enum JobError {
    /// Ordinary failure. Subject to the retry policy.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// Terminate as `Skipped` without retrying.
    #[error("skipped: {reason}")]
    Skip { reason: String },

    /// The handler observed cancellation and stopped.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl JobError {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }
}

/// Result returned by every handler.
pub type JobResult = Result<(), JobError>;

/// Everything a handler knows about the execution it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: Uuid,
    pub kind: JobKind,
    pub function: String,
    /// Owning definition for cron occurrences.
    pub cron_id: Option<Uuid>,
    /// 1 for the first attempt, 2 for the first retry, and so on.
    pub attempt: u32,
    pub scheduled_for: DateTime<Utc>,
    pub node_id: String,
    cancel: CancellationToken,
}

impl JobContext {
    #[allow(clippy::too_many_arguments, reason = "mirrors the public context fields")]
    pub(crate) fn new(
        id: Uuid,
        kind: JobKind,
        function: String,
        cron_id: Option<Uuid>,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        node_id: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            kind,
            function,
            cron_id,
            attempt,
            scheduled_for,
            node_id,
            cancel,
        }
    }

    /// The token signalled when this execution is cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// `Err(JobError::Cancelled)` if cancellation was requested.
    pub fn check_cancelled(&self) -> JobResult {
        if self.is_cancelled() {
            Err(JobError::cancelled("cancellation requested"))
        } else {
            Ok(())
        }
    }
}

/// A strongly typed job handler.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Payload type the stored request bytes decode into.
    type Payload: DeserializeOwned + Send + 'static;

    async fn run(&self, ctx: JobContext, payload: Option<Self::Payload>) -> JobResult;
}

/// Adapts an async closure into a [`JobHandler`].
struct FnHandler<F, T> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<F, Fut, T> JobHandler for FnHandler<F, T>
where
    F: Fn(JobContext, Option<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    type Payload = T;

    async fn run(&self, ctx: JobContext, payload: Option<T>) -> JobResult {
        (self.f)(ctx, payload).await
    }
}

trait ErasedHandler: Send + Sync {
    fn invoke(&self, ctx: JobContext, request: Option<Vec<u8>>) -> BoxFuture<'static, JobResult>;
}

struct Typed<H>(Arc<H>);

impl<H: JobHandler> ErasedHandler for Typed<H> {
    fn invoke(&self, ctx: JobContext, request: Option<Vec<u8>>) -> BoxFuture<'static, JobResult> {
        let handler = Arc::clone(&self.0);
        Box::pin(async move {
            let payload = match request.filter(|bytes| !bytes.is_empty()) {
                Some(bytes) => Some(
                    payload::decode::<H::Payload>(&bytes)
                        .map_err(|e| JobError::Failed(anyhow::Error::new(e)))?,
                ),
                None => None,
            };
            handler.run(ctx, payload).await
        })
    }
}

/// Per-handler registration options.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    pub priority: Priority,
    /// Cron expression used for automatic seeding at startup.
    pub cron: Option<String>,
    /// Skip a cron occurrence while another occurrence of the same
    /// definition is still running.
    pub skip_if_already_running: bool,
}

impl HandlerOptions {
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn cron(mut self, expression: impl Into<String>) -> Self {
        self.cron = Some(expression.into().trim().to_string());
        self
    }

    #[must_use]
    pub fn skip_if_already_running(mut self) -> Self {
        self.skip_if_already_running = true;
        self
    }
}

/// A registered handler and its options.
pub struct RegisteredHandler {
    name: String,
    options: HandlerOptions,
    invoker: Arc<dyn ErasedHandler>,
}

impl RegisteredHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.options.priority
    }

    pub fn cron_expression(&self) -> Option<&str> {
        self.options.cron.as_deref()
    }

    pub fn skip_if_already_running(&self) -> bool {
        self.options.skip_if_already_running
    }

    /// Decode `request` and run the handler.
    pub fn invoke(&self, ctx: JobContext, request: Option<Vec<u8>>) -> BoxFuture<'static, JobResult> {
        self.invoker.invoke(ctx, request)
    }
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Immutable table of handlers keyed by function name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// `Ok` if `name` is registered.
    pub fn ensure_registered(&self, name: &str) -> SchedulerResult<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(SchedulerError::UnregisteredFunction(name.to_string()))
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// `(function, expression)` pairs declared for automatic cron seeding.
    pub fn cron_seeds(&self) -> impl Iterator<Item = (&str, &str)> {
        self.handlers
            .values()
            .filter_map(|h| h.cron_expression().map(|expr| (h.name(), expr)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Collects handlers before the registry is frozen.
#[derive(Debug, Default)]
pub struct HandlerRegistryBuilder {
    handlers: Vec<RegisteredHandler>,
}

impl HandlerRegistryBuilder {
    /// Register a [`JobHandler`] implementation.
    #[must_use]
    pub fn register<H: JobHandler>(
        mut self,
        name: impl Into<String>,
        options: HandlerOptions,
        handler: H,
    ) -> Self {
        self.handlers.push(RegisteredHandler {
            name: name.into(),
            options,
            invoker: Arc::new(Typed(Arc::new(handler))),
        });
        self
    }

    /// Register an async closure taking the context and an optional payload.
    #[must_use]
    pub fn register_fn<F, Fut, T>(self, name: impl Into<String>, options: HandlerOptions, f: F) -> Self
    where
        F: Fn(JobContext, Option<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        self.register(
            name,
            options,
            FnHandler {
                f,
                _payload: PhantomData,
            },
        )
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Fails on duplicate names and on unparsable seeding expressions.
    pub fn build(self) -> SchedulerResult<HandlerRegistry> {
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for handler in self.handlers {
            if let Some(expression) = handler.cron_expression() {
                CronParser::parse(expression).map_err(|e| SchedulerError::InvalidCronExpression {
                    expression: expression.to_string(),
                    reason: format!("{e:#}"),
                })?;
            }
            if handlers.contains_key(&handler.name) {
                return Err(SchedulerError::Config(format!(
                    "handler '{}' registered twice",
                    handler.name
                )));
            }
            handlers.insert(handler.name.clone(), handler);
        }
        Ok(HandlerRegistry { handlers })
    }
}

/// Details passed to the [`ExceptionHandler`].
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub id: Uuid,
    pub kind: JobKind,
    pub function: String,
    pub error: String,
}

/// Global hook notified of terminal failures and cancellations.
///
/// Errors returned from the hook are logged and discarded.
#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    /// Called once after the retry budget is exhausted.
    async fn on_failure(&self, failure: &JobFailure) -> anyhow::Result<()>;

    /// Called when a job ends `Cancelled`.
    async fn on_cancelled(&self, _failure: &JobFailure) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Greeting {
        name: String,
    }

    fn ctx() -> JobContext {
        JobContext::new(
            Uuid::new_v4(),
            JobKind::Time,
            "greet".to_string(),
            None,
            1,
            Utc::now(),
            "node-a".to_string(),
            CancellationToken::new(),
        )
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::builder()
            .register_fn("greet", HandlerOptions::default(), |_ctx, payload: Option<Greeting>| async move {
                match payload {
                    Some(greeting) if greeting.name == "skip" => Err(JobError::skip("asked to")),
                    Some(_) => Ok(()),
                    None => Err(anyhow::anyhow!("missing payload").into()),
                }
            })
            .register_fn(
                "cleanup",
                HandlerOptions::default().priority(Priority::Low).cron("0 0 * * * *"),
                |_ctx, _payload: Option<serde_json::Value>| async { Ok(()) },
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_decodes_payload() {
        let registry = registry();
        let handler = registry.get("greet").unwrap();

        let request = payload::encode(&serde_json::json!({"name": "ada"}), payload::Compression::None).unwrap();
        assert!(handler.invoke(ctx(), Some(request)).await.is_ok());

        let request = payload::encode(&serde_json::json!({"name": "skip"}), payload::Compression::Zstd).unwrap();
        assert!(matches!(handler.invoke(ctx(), Some(request)).await, Err(JobError::Skip { .. })));

        assert!(matches!(handler.invoke(ctx(), None).await, Err(JobError::Failed(_))));
    }

    #[tokio::test]
    async fn test_bad_payload_is_a_failure() {
        let registry = registry();
        let handler = registry.get("greet").unwrap();
        let result = handler.invoke(ctx(), Some(b"not json".to_vec())).await;
        assert!(matches!(result, Err(JobError::Failed(_))));
    }

    #[test]
    fn test_registry_lookup_and_seeds() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert!(registry.ensure_registered("greet").is_ok());
        assert!(matches!(
            registry.ensure_registered("missing"),
            Err(SchedulerError::UnregisteredFunction(_))
        ));
        assert_eq!(registry.get("cleanup").unwrap().priority(), Priority::Low);
        let seeds: Vec<_> = registry.cron_seeds().collect();
        assert_eq!(seeds, vec![("cleanup", "0 0 * * * *")]);
    }

    #[test]
    fn test_build_rejects_bad_seed_and_duplicates() {
        let bad = HandlerRegistry::builder()
            .register_fn("x", HandlerOptions::default().cron("not cron"), |_ctx, _p: Option<()>| async { Ok(()) })
            .build();
        assert!(matches!(bad, Err(SchedulerError::InvalidCronExpression { .. })));

        let dup = HandlerRegistry::builder()
            .register_fn("x", HandlerOptions::default(), |_ctx, _p: Option<()>| async { Ok(()) })
            .register_fn("x", HandlerOptions::default(), |_ctx, _p: Option<()>| async { Ok(()) })
            .build();
        assert!(matches!(dup, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_context_cancellation() {
        let ctx = ctx();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation_token().cancel();
        assert!(matches!(ctx.check_cancelled(), Err(JobError::Cancelled { .. })));
    }
}
