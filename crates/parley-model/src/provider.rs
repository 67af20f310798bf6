// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::CancellationToken;
use crate::content::Message;
use crate::listener::StreamListener;
use crate::request::{ModelRequest, RequestError};

/// Message rewriting hooks a provider may carry for wire-format quirks.
///
/// Strictly narrower than the conversation-level transformer: both
/// directions are optional and there is no conversation context.  These run
/// before the conversation-level pipeline in both directions.
pub trait ProviderTransformer: Send + Sync {
    fn transform_prompt(&self, messages: Vec<Message>) -> Vec<Message> {
        messages
    }

    fn transform_completion(&self, message: Message) -> Message {
        message
    }
}

/// A streaming model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for display and raw-content routing.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Execute one request, driving `receiver` with streaming events.
    ///
    /// Resolves once the connection is established and streaming has been
    /// *arranged* — consumption continues asynchronously through the
    /// receiver.  A failure here is the only thing execution policies see;
    /// mid-stream failures go through `receiver.error` instead.
    ///
    /// The provider must observe `token` and signal `receiver.cancel()`
    /// when it trips.
    async fn execute_request(
        &self,
        request: ModelRequest,
        receiver: StreamListener,
        token: CancellationToken,
    ) -> Result<(), RequestError>;

    /// An independent handle to the same backend, for child conversations.
    fn clone_provider(&self) -> Arc<dyn ModelProvider>;

    /// Wire-quirk transformers, read fresh per request so routing providers
    /// may swap them.
    fn context_transformers(&self) -> Vec<Arc<dyn ProviderTransformer>> {
        Vec::new()
    }
}
