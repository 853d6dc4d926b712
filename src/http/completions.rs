//! `POST /completions`.
//!
//! Grounded on `original_source/.../llm_service/api/completions.py`: the handler does almost
//! nothing beyond header population, since [`crate::manager::Manager::complete`] already owns
//! caching, routing, budget, fallback, and event emission.

use crate::error::GatewayError;
use crate::http::RequestHeaders;
use crate::manager::Manager;
use crate::provider::{CompletionRequest, CompletionResponse};

/// Fill `workflow_id`/`agent_id` from headers when the request body left them unset, then
/// delegate to [`Manager::complete`] (§4.6 "Reads `X-Parent-Workflow-ID` / `X-Workflow-ID` /
/// `X-Agent-ID` headers ... when the body itself omits `workflow_id`/`agent_id`").
pub async fn handle_completions(
    manager: &Manager,
    mut request: CompletionRequest,
    headers: &RequestHeaders,
) -> Result<CompletionResponse, GatewayError> {
    if request.workflow_id.is_none() {
        request.workflow_id = headers.effective_workflow_id().map(str::to_string);
    }
    if request.agent_id.is_none() {
        request.agent_id = headers.agent_id.clone();
    }
    manager.complete(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, MessageContent, MessageRole};

    #[tokio::test]
    async fn populates_workflow_id_from_headers_when_body_omits_it() {
        let manager = Manager::new(crate::config::Settings::default());
        let request = CompletionRequest {
            messages: vec![ChatMessage { role: MessageRole::User, content: MessageContent::Text("hi".into()) }],
            ..Default::default()
        };
        let headers = RequestHeaders {
            workflow_id: Some("wf-1".to_string()),
            agent_id: Some("agent-1".to_string()),
            ..Default::default()
        };
        // No providers configured in the test environment: falls through to the mock response,
        // but the header-population step itself must not panic or be skipped.
        let response = handle_completions(&manager, request, &headers).await.unwrap();
        assert_eq!(response.provider, "mock");
    }
}
