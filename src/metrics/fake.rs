use crate::error::AppError;
use crate::metrics::{MetricsBackend, QueryResult, RangeQuery};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Handler = Box<dyn Fn(&str) -> Result<QueryResult, AppError> + Send + Sync>;

/// Scripted backend for tests: answers every query through `handler` and
/// records the expressions it was asked for.
pub struct FakeBackend {
    handler: Handler,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    range_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(
        handler: impl Fn(&str) -> Result<QueryResult, AppError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: None,
            calls: Mutex::new(Vec::new()),
            range_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self::new(|_| Err(AppError::UpstreamUnavailable("connection refused".into())))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn range_calls(&self) -> usize {
        self.range_calls.load(Ordering::SeqCst)
    }

    async fn answer(&self, expr: &str) -> Result<QueryResult, AppError> {
        self.calls.lock().expect("calls lock").push(expr.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(expr)
    }
}

#[async_trait]
impl MetricsBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn range_query(&self, query: &RangeQuery) -> Result<QueryResult, AppError> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(&query.expr).await
    }

    async fn instant_query(&self, expr: &str) -> Result<QueryResult, AppError> {
        self.answer(expr).await
    }
}
