//! Layer Query Function Registry
//!
//! Resolves a [`WorkerTask::query_fn_name`](crate::types::WorkerTask) to the
//! callable that actually talks to a layer. Layer implementations live outside
//! the engine; the only contract is `(args, kwargs) -> LayerPayload`.
//!
//! # Example
//!
//! ```rust,ignore
//! use lqe_core::pool::QueryFnRegistry;
//! use lqe_core::LayerRecord;
//!
//! let registry = QueryFnRegistry::new();
//! registry.register_fn("episodic::search", |_args, _kwargs| async move {
//!     Ok(vec![LayerRecord::new("1", serde_json::json!({"text": "hello"}))])
//! });
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::types::LayerPayload;

// ─────────────────────────────────────────────────────────────────────────────
// Query Function Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A callable layer query
///
/// Errors are reported through the returned `Result`; the pool converts them
/// into a failed task result. Panics are caught at the task boundary too.
#[async_trait]
pub trait LayerQueryFn: Send + Sync {
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> anyhow::Result<LayerPayload>;
}

/// Adapter that turns an async closure into a [`LayerQueryFn`]
pub struct FnQuery<F>(F);

impl<F> FnQuery<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> LayerQueryFn for FnQuery<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<LayerPayload>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> anyhow::Result<LayerPayload> {
        (self.0)(args, kwargs).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Name to query function mapping shared by every worker
#[derive(Default)]
pub struct QueryFnRegistry {
    functions: RwLock<HashMap<String, Arc<dyn LayerQueryFn>>>,
}

impl QueryFnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query function, replacing any previous one with that name
    pub fn register(&self, name: impl Into<String>, function: Arc<dyn LayerQueryFn>) {
        self.functions.write().insert(name.into(), function);
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<LayerPayload>> + Send + 'static,
    {
        self.register(name, Arc::new(FnQuery::new(f)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.functions.write().remove(name).is_some()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn LayerQueryFn>> {
        self.functions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}
