use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::{
    error::{JobError, QueueError, QueueResult},
    store::JobStore,
    types::{Job, JobStatus, LockToken},
};

/// Handler for one job kind.
///
/// Delivery is at-least-once: a handler may run again for an attempt that
/// already produced its side effect, so side effects should be keyed by
/// [`JobContext::idempotency_key`].
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Payload shape stored in `Job::payload`
    type Payload: DeserializeOwned + Send;

    /// Kind string this handler is registered under
    const KIND: &'static str;

    async fn handle(&self, payload: Self::Payload, ctx: &JobContext) -> Result<(), JobError>;
}

/// What a handler can see about the attempt it is running
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    lock_token: LockToken,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    pub fn new(job: Job, lock_token: LockToken, store: Arc<dyn JobStore>) -> Self {
        Self { job, lock_token, store }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// 1-based number of the attempt in progress
    pub fn attempt(&self) -> u32 {
        self.job.attempts + 1
    }

    pub fn idempotency_key(&self) -> String {
        self.job.idempotency_key()
    }

    /// Re-read the job and check nobody has cancelled, rescheduled or
    /// reclaimed it since it was leased. Handlers call this right before
    /// their side effect.
    ///
    /// An unreachable store counts as still wanted.
    pub async fn still_wanted(&self) -> bool {
        match self.store.get(&self.job.id).await {
            Ok(current) => {
                current.status == JobStatus::InFlight
                    && current.lock_token.as_ref() == Some(&self.lock_token)
                    && current.deferred.is_none()
            }
            Err(QueueError::NotFound(_)) => false,
            Err(err) => {
                warn!(job_id = %self.job.id, error = %err, "could not re-check job; proceeding");
                true
            }
        }
    }
}

/// Type-erased handler for runtime dispatch
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}

struct Typed<H>(H);

#[async_trait]
impl<H: JobHandler> ErasedHandler for Typed<H> {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        let payload: H::Payload = serde_json::from_value(ctx.job.payload.clone())
            .map_err(|e| JobError::permanent(format!("Failed to deserialize {} payload: {}", H::KIND, e)))?;
        self.0.handle(payload, ctx).await
    }
}

/// Mapping from job kind to handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: JobHandler>(&mut self, handler: H) -> QueueResult<()> {
        if self.handlers.contains_key(H::KIND) {
            return Err(QueueError::Config(format!("Job kind '{}' already registered", H::KIND)));
        }
        self.handlers.insert(H::KIND.to_string(), Arc::new(Typed(handler)));
        Ok(())
    }

    /// Builder-style [`HandlerRegistry::register`]
    pub fn with<H: JobHandler>(mut self, handler: H) -> QueueResult<Self> {
        self.register(handler)?;
        Ok(self)
    }

    /// Run the handler for the job's kind. Unknown kinds are a permanent error.
    pub async fn dispatch(&self, ctx: &JobContext) -> Result<(), JobError> {
        let handler = self
            .handlers
            .get(&ctx.job.kind)
            .ok_or_else(|| JobError::permanent(format!("Unknown job kind: {}", ctx.job.kind)))?;
        handler.run(ctx).await
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::NewJob;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Greeting {
        name: String,
    }

    struct GreetHandler;

    #[async_trait]
    impl JobHandler for GreetHandler {
        type Payload = Greeting;
        const KIND: &'static str = "greet";

        async fn handle(&self, payload: Greeting, _ctx: &JobContext) -> Result<(), JobError> {
            if payload.name.is_empty() {
                return Err(JobError::retryable("empty name"));
            }
            Ok(())
        }
    }

    async fn leased_context(store: &Arc<MemoryStore>, kind: &str, payload: serde_json::Value) -> JobContext {
        store.enqueue(NewJob::new(kind, payload).with_dedupe_key("k")).await.unwrap();
        let job = store.lease_due_jobs(Utc::now(), 1).await.unwrap().remove(0);
        let token = job.lock_token.clone().unwrap();
        JobContext::new(job, token, store.clone())
    }

    #[tokio::test]
    async fn test_dispatch_by_kind() {
        let store = Arc::new(MemoryStore::new());
        let registry = HandlerRegistry::new().with(GreetHandler).unwrap();
        assert_eq!(registry.registered_kinds(), vec!["greet"]);

        let ctx = leased_context(&store, "greet", json!({"name": "Ada"})).await;
        assert_eq!(registry.dispatch(&ctx).await, Ok(()));
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register(GreetHandler).unwrap();
        assert!(matches!(registry.register(GreetHandler), Err(QueueError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_permanent() {
        let store = Arc::new(MemoryStore::new());
        let registry = HandlerRegistry::new();
        let ctx = leased_context(&store, "mystery", json!({})).await;

        match registry.dispatch(&ctx).await {
            Err(JobError::Permanent(msg)) => assert!(msg.contains("Unknown job kind")),
            other => panic!("expected permanent error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_payload_is_permanent() {
        let store = Arc::new(MemoryStore::new());
        let registry = HandlerRegistry::new().with(GreetHandler).unwrap();
        let ctx = leased_context(&store, "greet", json!({"nom": 1})).await;

        assert!(matches!(registry.dispatch(&ctx).await, Err(JobError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_still_wanted_sees_late_cancel() {
        let store = Arc::new(MemoryStore::new());
        let ctx = leased_context(&store, "greet", json!({"name": "Ada"})).await;
        assert!(ctx.still_wanted().await);

        assert!(!store.cancel("k").await.unwrap());

        assert!(!ctx.still_wanted().await);
    }
}
