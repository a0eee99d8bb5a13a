// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Vertex AI driver.
//!
//! Same wire format as the Gemini driver (the request body and SSE chunk
//! shapes are identical), different endpoint and resource addressing:
//!
//! `POST https://{location}-aiplatform.googleapis.com/v1/projects/{project}\
//!  /locations/{location}/publishers/google/models/{model}:streamGenerateContent?alt=sse`
//!
//! Project and location come from `GOOGLE_CLOUD_PROJECT` /
//! `GOOGLE_CLOUD_LOCATION`; auth uses the same `x-goog-api-key` header
//! (Vertex AI express mode).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ModelBackend, ModelEventStream};
use crate::gemini::{build_request_body, gemini_event_stream};
use crate::{ChatRequest, ModelError};

pub struct VertexAiBackend {
    model: String,
    api_key: String,
    project: String,
    location: String,
    client: reqwest::Client,
}

impl VertexAiBackend {
    pub fn new(model: String, api_key: String, project: String, location: String) -> Self {
        Self {
            model,
            api_key,
            project,
            location,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{proj}/locations/{loc}\
             /publishers/google/models/{model}:streamGenerateContent?alt=sse",
            loc = self.location,
            proj = self.project,
            model = self.model,
        )
    }
}

#[async_trait]
impl ModelBackend for VertexAiBackend {
    fn backend_id(&self) -> &str {
        "vertexai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ModelEventStream, ModelError> {
        let body = build_request_body(&req);
        let url = self.endpoint();
        debug!(model = %self.model, project = %self.project, "sending Vertex AI request");

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, text));
        }

        Ok(gemini_event_stream(resp, cancel))
    }
}
