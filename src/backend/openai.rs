//! Backend for OpenAI-compatible vision APIs.
//!
//! [`OpenAiBackend`] covers OpenAI itself and the many services that mirror
//! its chat API (DashScope compatible mode, vLLM, LM Studio, Together AI,
//! Groq, Ollama's `/v1/` endpoint, ...).
//!
//! Endpoint: `{base}/chat/completions`, where `base` already carries the
//! version segment (e.g. `https://api.openai.com/v1`).
//! Streaming: SSE with `data: {"choices": [{"delta": {"content": "token"}}]}`.

use super::sse::SseDecoder;
use super::{
    fragment_stream, provider_error, send_checked, Backend, FragmentDecoder, FragmentStream,
    VisionRequest,
};
use crate::client_pool::ClientHandle;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for any OpenAI-compatible chat API with image input.
///
/// The credential comes from the [`ClientHandle`] and is sent as
/// `Authorization: Bearer {key}` when non-empty.
///
/// # Example
///
/// ```
/// use vision_batch::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::new();
/// let with_org = OpenAiBackend::new().with_organization("org-abc");
/// ```
#[derive(Debug, Clone, Default)]
pub struct OpenAiBackend {
    /// Optional organization ID. If set, sent as `OpenAI-Organization: {org}`.
    pub(crate) organization: Option<String>,
}

impl OpenAiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the organization ID header.
    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    /// Build the request body: one user message holding the prompt text
    /// followed by the image.
    fn build_body(request: &VisionRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": request.prompt},
                    {"type": "image_url", "image_url": {"url": &*request.image_url}},
                ],
            }],
            "stream": true,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = json!(n);
        }
        body
    }

    /// Build the reqwest request with appropriate headers.
    fn build_http_request(
        &self,
        client: &Client,
        url: &str,
        api_key: &str,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let mut req = client.post(url).json(body);
        if !api_key.is_empty() {
            req = req.bearer_auth(api_key);
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }
        req
    }
}

/// Pulls `choices[0].delta.content` out of SSE frames.
#[derive(Debug, Default)]
pub(crate) struct ChatDeltaDecoder {
    sse: SseDecoder,
}

impl ChatDeltaDecoder {
    fn fragments(values: Vec<Value>) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for value in values {
            if let Some(err) = provider_error(&value) {
                return Err(err);
            }
            if let Some(content) = value
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|v| v.as_str())
            {
                if !content.is_empty() {
                    out.push(content.to_string());
                }
            }
        }
        Ok(out)
    }
}

impl FragmentDecoder for ChatDeltaDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        Self::fragments(self.sse.decode(chunk))
    }

    fn finish(&mut self) -> Result<Vec<String>> {
        Self::fragments(self.sse.flush())
    }

    fn is_done(&self) -> bool {
        self.sse.is_done()
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn open_stream(
        &self,
        handle: &ClientHandle,
        request: &VisionRequest,
    ) -> Result<FragmentStream> {
        let url = format!("{}/chat/completions", handle.base_url());
        let body = Self::build_body(request);
        let http = self.build_http_request(handle.client(), &url, handle.api_key(), &body);

        let resp = send_checked(http, &url).await?;
        Ok(fragment_stream(resp.bytes_stream(), ChatDeltaDecoder::default()))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;

    fn test_request() -> VisionRequest {
        VisionRequest {
            model: "qwen-vl-max".into(),
            prompt: "Extract the invoice fields.".into(),
            image_url: "data:image/jpeg;base64,QUJD".into(),
            image_name: "invoice.jpg".into(),
            temperature: None,
            max_tokens: None,
        }
    }

    #[test]
    fn test_body_has_text_then_image() {
        let body = OpenAiBackend::build_body(&test_request());

        assert_eq!(body["model"], "qwen-vl-max");
        assert_eq!(body["stream"], true);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");

        let content = messages[0]["content"].as_array().expect("content");
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "Extract the invoice fields.");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/jpeg;base64,QUJD");

        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_body_tuning_fields() {
        let mut request = test_request();
        request.temperature = Some(0.5);
        request.max_tokens = Some(1024);
        let body = OpenAiBackend::build_body(&request);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["max_tokens"], 1024);
    }

    #[test]
    fn test_auth_header() {
        let backend = OpenAiBackend::new().with_organization("org-abc");
        let client = Client::new();
        let req = backend
            .build_http_request(
                &client,
                "https://api.openai.com/v1/chat/completions",
                "sk-test123",
                &json!({}),
            )
            .build()
            .expect("build request");

        assert_eq!(req.headers().get("Authorization").expect("auth"), "Bearer sk-test123");
        assert_eq!(req.headers().get("OpenAI-Organization").expect("org"), "org-abc");
    }

    #[test]
    fn test_no_auth_with_empty_key() {
        let client = Client::new();
        let req = OpenAiBackend::new()
            .build_http_request(
                &client,
                "http://localhost:8000/v1/chat/completions",
                "",
                &json!({}),
            )
            .build()
            .expect("build request");
        assert!(req.headers().get("Authorization").is_none());
    }

    #[test]
    fn test_delta_decoder_collects_content() {
        let mut decoder = ChatDeltaDecoder::default();
        let frames = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"a\\\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\":1}\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let fragments = decoder.feed(frames.as_bytes()).unwrap();
        assert_eq!(fragments, vec!["{\"a\"", ":1}"]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_delta_decoder_error_frame() {
        let mut decoder = ChatDeltaDecoder::default();
        let err = decoder
            .feed(b"data: {\"error\":{\"message\":\"Rate limit reached\"}}\n\n")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport(ref m) if m.contains("Rate limit reached")));
    }
}
