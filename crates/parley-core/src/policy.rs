// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use parley_model::{sleep, CancellationToken, OperationCanceled, RequestError};

use crate::conversation::Conversation;
use crate::events::ConversationEvent;

/// The resolution of a policy-wrapped request, plus policy bookkeeping.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub result: Result<(), RequestError>,
    /// Free-form map naming the policy and any relevant counters.
    pub metadata: Map<String, Value>,
}

pub type RequestFuture = Pin<Box<dyn Future<Output = Result<(), RequestError>> + Send>>;

/// A re-invocable request closure.  Each invocation arranges a fresh
/// attempt against the provider; the future resolves when streaming has
/// been arranged (not consumed), which is why retrying it is safe.
pub type RequestCall = Arc<dyn Fn() -> RequestFuture + Send + Sync>;

/// A reusable wrapper around request execution.
///
/// Contract: a pre-cancelled token fails with [`OperationCanceled`] before
/// the call starts; cancellation mid-call or mid-backoff propagates as the
/// raised error, never as a captured failure result.
#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        token: &CancellationToken,
        call: RequestCall,
    ) -> Result<PolicyOutcome, OperationCanceled>;
}

/// The policy used when a conversation is built without one: retry-only,
/// three attempts, exponential backoff from one second.
pub fn default_policy() -> Arc<dyn Policy> {
    Arc::new(RetryPolicy::default())
}

/// Race one attempt against the cancellation token so a cancel surfaces
/// promptly instead of waiting out the connection.
async fn race(
    token: &CancellationToken,
    fut: RequestFuture,
) -> Result<Result<(), RequestError>, OperationCanceled> {
    tokio::select! {
        biased;
        canceled = token.await_cancellation() => Err(canceled),
        result = fut => Ok(result),
    }
}

// ─── Noop ─────────────────────────────────────────────────────────────────────

/// Runs the call once inside the cancellation race and wraps the result.
pub struct NoopPolicy;

#[async_trait]
impl Policy for NoopPolicy {
    fn name(&self) -> &str {
        "NoopPolicy"
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        call: RequestCall,
    ) -> Result<PolicyOutcome, OperationCanceled> {
        token.throw_if_cancellation_requested()?;
        let result = race(token, call()).await?;
        let mut metadata = Map::new();
        metadata.insert("policy".into(), json!(self.name()));
        Ok(PolicyOutcome { result, metadata })
    }
}

// ─── Retry ────────────────────────────────────────────────────────────────────

type RetryPredicate = Box<dyn Fn(&RequestError) -> bool + Send + Sync>;

/// Retries retryable failures with exponential backoff.
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    backoff_factor: f64,
    retryable: Option<RetryPredicate>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            backoff_factor,
            retryable: None,
        }
    }

    /// Override the retry predicate.  The default is
    /// [`RequestError::retryable_by_default`].
    pub fn with_retryable(
        mut self,
        predicate: impl Fn(&RequestError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Some(Box::new(predicate));
        self
    }

    fn is_retryable(&self, error: &RequestError) -> bool {
        match &self.retryable {
            Some(predicate) => predicate(error),
            None => error.retryable_by_default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000), 2.0)
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    fn name(&self) -> &str {
        "RetryPolicy"
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        call: RequestCall,
    ) -> Result<PolicyOutcome, OperationCanceled> {
        token.throw_if_cancellation_requested()?;
        let mut backoff = self.initial_backoff;
        let mut attempt = 1u32;
        let result = loop {
            let result = race(token, call()).await?;
            match result {
                Ok(()) => break Ok(()),
                Err(error) => {
                    if attempt >= self.max_attempts || !self.is_retryable(&error) {
                        break Err(error);
                    }
                    debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "request failed; backing off before retry"
                    );
                    // A cancel during the backoff propagates from the sleep.
                    sleep(backoff, Some(token)).await?;
                    backoff = backoff.mul_f64(self.backoff_factor);
                    attempt += 1;
                }
            }
        };
        let mut metadata = Map::new();
        metadata.insert("policy".into(), json!(self.name()));
        metadata.insert("attempts".into(), json!(attempt));
        metadata.insert("max_attempts".into(), json!(self.max_attempts));
        Ok(PolicyOutcome { result, metadata })
    }
}

// ─── Rate limit ───────────────────────────────────────────────────────────────

/// Caps request starts to `limit` per sliding `period`.
///
/// The window is fed by `request_success` events from the attached
/// conversation and every descendant (bubbled `child_event`s included), so
/// one shared policy instance budgets a whole conversation tree.
pub struct RatePolicy {
    limit: usize,
    period: Duration,
    window: Arc<Mutex<VecDeque<Instant>>>,
}

impl RatePolicy {
    pub fn new(limit: usize, period: Duration) -> Self {
        Self {
            limit: limit.max(1),
            period,
            window: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Record one completed request at the current instant.
    pub fn record_success(&self) {
        self.window.lock().unwrap().push_back(Instant::now());
    }

    /// Feed the window from a conversation's event stream (including all
    /// descendants).  The listener task ends when the conversation goes
    /// away.
    pub fn attach(self: &Arc<Self>, conversation: &Conversation) {
        let mut rx = conversation.subscribe();
        let policy = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if matches!(event.innermost(), ConversationEvent::RequestSuccess { .. }) {
                            policy.record_success();
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn pending_wait(&self) -> Option<Duration> {
        let mut window = self.window.lock().unwrap();
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.period)
        {
            window.pop_front();
        }
        if window.len() < self.limit {
            return None;
        }
        let over = window.len() - self.limit;
        Some(self.period.mul_f64((over + 1) as f64 / self.limit as f64))
    }
}

#[async_trait]
impl Policy for RatePolicy {
    fn name(&self) -> &str {
        "RatePolicy"
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        call: RequestCall,
    ) -> Result<PolicyOutcome, OperationCanceled> {
        token.throw_if_cancellation_requested()?;
        let mut waits = 0u32;
        while let Some(wait) = self.pending_wait() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached; waiting");
            sleep(wait, Some(token)).await?;
            waits += 1;
        }
        let result = race(token, call()).await?;
        let mut metadata = Map::new();
        metadata.insert("policy".into(), json!(self.name()));
        metadata.insert("limit".into(), json!(self.limit));
        metadata.insert("waits".into(), json!(waits));
        Ok(PolicyOutcome { result, metadata })
    }
}

// ─── Token limit ──────────────────────────────────────────────────────────────

/// Which token counters the budget constrains.
#[derive(Debug, Clone, Copy)]
pub enum TokenBudget {
    /// Separate caps for input and output tokens per period.
    Split {
        input_tokens_per_period: u64,
        output_tokens_per_period: u64,
    },
    /// One combined cap per period.
    Total { total_tokens_per_period: u64 },
}

/// Delays requests while recent token consumption sits at or above its cap.
///
/// Fed by `message_complete` usage from the attached conversation tree.
pub struct TokenPolicy {
    budget: TokenBudget,
    period: Duration,
    window: Arc<Mutex<VecDeque<(Instant, u64, u64)>>>,
}

impl TokenPolicy {
    pub fn new(budget: TokenBudget, period: Duration) -> Self {
        Self {
            budget,
            period,
            window: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Record one completed request's token usage at the current instant.
    pub fn record_usage(&self, input_tokens: u64, output_tokens: u64) {
        self.window
            .lock()
            .unwrap()
            .push_back((Instant::now(), input_tokens, output_tokens));
    }

    /// Feed the window from a conversation's event stream (including all
    /// descendants).
    pub fn attach(self: &Arc<Self>, conversation: &Conversation) {
        let mut rx = conversation.subscribe();
        let policy = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let ConversationEvent::MessageComplete {
                            usage: Some(usage), ..
                        } = event.innermost()
                        {
                            policy.record_usage(usage.input(), usage.output());
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn pending_wait(&self) -> Option<Duration> {
        let mut window = self.window.lock().unwrap();
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|(t, _, _)| now.duration_since(*t) >= self.period)
        {
            window.pop_front();
        }
        let oldest = window.front().map(|(t, _, _)| *t)?;
        let input: u64 = window.iter().map(|(_, i, _)| i).sum();
        let output: u64 = window.iter().map(|(_, _, o)| o).sum();
        // Wait until the oldest entry expires whenever the relevant sum has
        // reached its cap; split budgets wait for the larger of the two.
        let until_oldest_expires = (oldest + self.period).saturating_duration_since(now);
        let wait_if = |sum: u64, cap: u64| (sum >= cap).then_some(until_oldest_expires);
        match self.budget {
            TokenBudget::Total {
                total_tokens_per_period,
            } => wait_if(input + output, total_tokens_per_period),
            TokenBudget::Split {
                input_tokens_per_period,
                output_tokens_per_period,
            } => {
                let input_wait = wait_if(input, input_tokens_per_period);
                let output_wait = wait_if(output, output_tokens_per_period);
                input_wait.max(output_wait)
            }
        }
        .filter(|wait| !wait.is_zero())
    }
}

#[async_trait]
impl Policy for TokenPolicy {
    fn name(&self) -> &str {
        "TokenPolicy"
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        call: RequestCall,
    ) -> Result<PolicyOutcome, OperationCanceled> {
        token.throw_if_cancellation_requested()?;
        let mut waits = 0u32;
        while let Some(wait) = self.pending_wait() {
            debug!(wait_ms = wait.as_millis() as u64, "token budget reached; waiting");
            sleep(wait, Some(token)).await?;
            waits += 1;
        }
        let result = race(token, call()).await?;
        let mut metadata = Map::new();
        metadata.insert("policy".into(), json!(self.name()));
        metadata.insert("waits".into(), json!(waits));
        Ok(PolicyOutcome { result, metadata })
    }
}

// ─── Composite ────────────────────────────────────────────────────────────────

/// Layers policies outermost-first: the first layer's `execute` wraps the
/// second's, and so on down to the real call.
///
/// An inner layer's failure outcome unwraps into an `Err` for the next
/// layer out, so every layer can observe (and e.g. retry) failures from
/// deeper in the stack.  Metadata from each layer nests under
/// `"<Name>[<index>]"` keys beside an `execution_order` list.
pub struct CompositePolicy {
    layers: Vec<Arc<dyn Policy>>,
}

impl CompositePolicy {
    pub fn new(layers: Vec<Arc<dyn Policy>>) -> Self {
        Self { layers }
    }
}

fn run_layer(
    layers: Arc<Vec<Arc<dyn Policy>>>,
    index: usize,
    token: CancellationToken,
    call: RequestCall,
    collected: Arc<Mutex<Map<String, Value>>>,
) -> Pin<Box<dyn Future<Output = Result<PolicyOutcome, OperationCanceled>> + Send>> {
    Box::pin(async move {
        let layer = Arc::clone(&layers[index]);
        let inner_call: RequestCall = if index + 1 == layers.len() {
            call
        } else {
            let layers = Arc::clone(&layers);
            let token = token.clone();
            let collected = Arc::clone(&collected);
            Arc::new(move || {
                let layers = Arc::clone(&layers);
                let token = token.clone();
                let call = Arc::clone(&call);
                let collected = Arc::clone(&collected);
                Box::pin(async move {
                    match run_layer(layers, index + 1, token, call, collected).await {
                        // Unwrap the inner outcome so this layer sees
                        // failures as errors it can act on.
                        Ok(outcome) => outcome.result,
                        // Unreachable in practice: the outer layer's own
                        // race resolves on the same token first.
                        Err(_) => Err(RequestError::other("operation canceled")),
                    }
                }) as RequestFuture
            })
        };
        let outcome = layer.execute(&token, inner_call).await?;
        collected.lock().unwrap().insert(
            format!("{}[{}]", layer.name(), index),
            Value::Object(outcome.metadata.clone()),
        );
        Ok(outcome)
    })
}

#[async_trait]
impl Policy for CompositePolicy {
    fn name(&self) -> &str {
        "CompositePolicy"
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        call: RequestCall,
    ) -> Result<PolicyOutcome, OperationCanceled> {
        if self.layers.is_empty() {
            return NoopPolicy.execute(token, call).await;
        }
        let collected: Arc<Mutex<Map<String, Value>>> = Arc::new(Mutex::new(Map::new()));
        let layers = Arc::new(self.layers.clone());
        let outcome = run_layer(
            layers,
            0,
            token.clone(),
            call,
            Arc::clone(&collected),
        )
        .await?;

        let mut metadata = Map::new();
        metadata.insert("policy".into(), json!(self.name()));
        metadata.insert(
            "execution_order".into(),
            json!(self
                .layers
                .iter()
                .map(|l| l.name())
                .collect::<Vec<&str>>()),
        );
        for (key, value) in collected.lock().unwrap().iter() {
            metadata.insert(key.clone(), value.clone());
        }
        Ok(PolicyOutcome {
            result: outcome.result,
            metadata,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
