use async_trait::async_trait;
use fxhash::FxHashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::host::Host;

/// The part of an operation the pool itself inspects: a name for metrics and
/// an optional routing key for token-aware placement.
pub trait BaseOperation: Send + Sync {
    /// Operation name, used for logging and metrics.
    fn name(&self) -> &str;

    /// Logical key this operation targets. `None` routes the operation to any
    /// available host instead of the token owner.
    fn key(&self) -> Option<&str>;
}

/// An operation executable against a backend transport. The transport type is
/// the wire-level seam; the pool never interprets payloads.
#[async_trait]
pub trait Operation<T>: BaseOperation {
    type Output: Send + 'static;

    async fn execute(&self, transport: &T) -> Result<Self::Output>;
}

/// The payload of a successful attempt, decorated with the node that served
/// it and a snapshot of the connection's context metadata at success time.
#[derive(Debug)]
pub struct OperationResult<R> {
    value: R,
    node: Option<Arc<Host>>,
    metadata: FxHashMap<String, String>,
    latency: Option<Duration>,
}

impl<R> OperationResult<R> {
    pub(crate) fn new(value: R) -> Self {
        OperationResult {
            value,
            node: None,
            metadata: Default::default(),
            latency: None,
        }
    }

    #[must_use]
    pub(crate) fn with_node(mut self, node: Arc<Host>) -> Self {
        self.node = Some(node);
        self
    }

    #[must_use]
    pub(crate) fn with_metadata(mut self, metadata: FxHashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    #[inline]
    pub fn value(&self) -> &R {
        &self.value
    }

    pub fn into_value(self) -> R {
        self.value
    }

    /// The host that served the successful attempt.
    #[inline]
    pub fn node(&self) -> Option<&Arc<Host>> {
        self.node.as_ref()
    }

    #[inline]
    pub fn metadata(&self) -> &FxHashMap<String, String> {
        &self.metadata
    }

    #[inline]
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}

/// Completion handle for an operation initiated with
/// [`execute_async`](crate::pool::ConnectionPool::execute_async). The borrowed
/// connection has already been returned by the time this future is handed out;
/// the in-flight work owns its transport independently.
pub struct OperationFuture<R> {
    handle: JoinHandle<Result<OperationResult<R>>>,
}

impl<R> OperationFuture<R> {
    pub(crate) fn new(handle: JoinHandle<Result<OperationResult<R>>>) -> Self {
        OperationFuture { handle }
    }
}

impl<R: Send + 'static> Future for OperationFuture<R> {
    type Output = Result<OperationResult<R>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_error)) => Poll::Ready(Err(Error::Fatal(format!(
                "async operation task failed: {join_error}"
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}
