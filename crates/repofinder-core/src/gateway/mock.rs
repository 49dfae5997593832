//! Scripted model gateway for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CompletionRequest, GatewayError, ModelGateway};
use crate::BoxFuture;

/// A hand-rolled [`ModelGateway`] returning scripted replies.
///
/// Replies are handed out in order; the last one repeats once the sequence
/// is exhausted. Every request is recorded.
pub struct MockGateway {
    responses: Mutex<Vec<Result<String, GatewayError>>>,
    fallback: Result<String, GatewayError>,
    requests: Mutex<Vec<CompletionRequest>>,
    call_count: AtomicUsize,
}

impl MockGateway {
    /// A gateway that always replies with `response`.
    pub fn new(response: Result<String, GatewayError>) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: response,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// A gateway that replies with `responses` in order, repeating the last.
    ///
    /// # Panics
    /// If `responses` is empty.
    pub fn with_sequence(mut responses: Vec<Result<String, GatewayError>>) -> Self {
        assert!(!responses.is_empty(), "sequence must have at least one response");
        responses.reverse();
        let fallback = responses[0].clone();
        Self {
            responses: Mutex::new(responses),
            fallback,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// A gateway replying with a JSON document.
    pub fn json(value: serde_json::Value) -> Self {
        Self::new(Ok(value.to_string()))
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_response(&self) -> Result<String, GatewayError> {
        match self.responses.lock() {
            Ok(mut seq) => seq.pop().unwrap_or_else(|| self.fallback.clone()),
            Err(_) => self.fallback.clone(),
        }
    }
}

impl ModelGateway for MockGateway {
    fn model(&self) -> &str {
        "mock"
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<String, GatewayError>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        let response = self.next_response();
        Box::pin(async move { response })
    }
}
