//! Backend for Ollama's native chat API.
//!
//! [`OllamaBackend`] sends the image through `/api/chat` using the
//! message-level `images` field. Streaming uses NDJSON with
//! `{"message": {"content": "token"}, "done": false}` per line.

use super::ndjson::NdjsonDecoder;
use super::{
    fragment_stream, provider_error, send_checked, Backend, FragmentDecoder, FragmentStream,
    VisionRequest,
};
use crate::client_pool::ClientHandle;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Backend for Ollama's native API.
///
/// Endpoint: `{base}/api/chat`. The image is sent as bare base64 (the
/// `data:` prefix is stripped). A credential, when present, is sent as a
/// bearer token for hosted Ollama deployments.
#[derive(Debug, Clone, Default)]
pub struct OllamaBackend;

impl OllamaBackend {
    pub fn new() -> Self {
        Self
    }

    /// Build the JSON body for `/api/chat`.
    fn build_body(request: &VisionRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": [{
                "role": "user",
                "content": request.prompt,
                "images": [request.image_base64()],
            }],
            "stream": true,
        });

        let mut options = serde_json::Map::new();
        if let Some(t) = request.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(n) = request.max_tokens {
            options.insert("num_predict".into(), json!(n));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }
}

/// Pulls `message.content` out of NDJSON chat frames until `done: true`.
#[derive(Debug, Default)]
pub(crate) struct ChatLineDecoder {
    lines: NdjsonDecoder,
    done: bool,
}

impl ChatLineDecoder {
    fn push(&mut self, value: Value, out: &mut Vec<String>) -> Result<()> {
        if self.done {
            return Ok(());
        }
        if let Some(err) = provider_error(&value) {
            return Err(err);
        }
        if let Some(content) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
        {
            if !content.is_empty() {
                out.push(content.to_string());
            }
        }
        if value.get("done").and_then(|v| v.as_bool()) == Some(true) {
            self.done = true;
        }
        Ok(())
    }
}

impl FragmentDecoder for ChatLineDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for value in self.lines.decode(chunk) {
            self.push(value, &mut out)?;
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if let Some(value) = self.lines.flush() {
            self.push(value, &mut out)?;
        }
        Ok(out)
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn open_stream(
        &self,
        handle: &ClientHandle,
        request: &VisionRequest,
    ) -> Result<FragmentStream> {
        let url = format!("{}/api/chat", handle.base_url());
        let body = Self::build_body(request);

        let mut http = handle.client().post(&url).json(&body);
        if !handle.api_key().is_empty() {
            http = http.bearer_auth(handle.api_key());
        }

        let resp = send_checked(http, &url).await?;
        Ok(fragment_stream(resp.bytes_stream(), ChatLineDecoder::default()))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;

    fn test_request() -> VisionRequest {
        VisionRequest {
            model: "llava:13b".into(),
            prompt: "Describe the receipt as JSON.".into(),
            image_url: "data:image/png;base64,iVBORw0K".into(),
            image_name: "receipt.png".into(),
            temperature: None,
            max_tokens: None,
        }
    }

    #[test]
    fn test_chat_body_carries_bare_base64() {
        let body = OllamaBackend::build_body(&test_request());
        assert_eq!(body["model"], "llava:13b");
        assert_eq!(body["stream"], true);
        let message = &body["messages"][0];
        assert_eq!(message["role"], "user");
        assert_eq!(message["content"], "Describe the receipt as JSON.");
        assert_eq!(message["images"][0], "iVBORw0K");
        assert!(body.get("options").is_none());
    }

    #[test]
    fn test_chat_body_options() {
        let mut request = test_request();
        request.temperature = Some(0.0);
        request.max_tokens = Some(512);
        let body = OllamaBackend::build_body(&request);
        assert_eq!(body["options"]["temperature"], 0.0);
        assert_eq!(body["options"]["num_predict"], 512);
    }

    #[test]
    fn test_line_decoder_stops_at_done() {
        let mut decoder = ChatLineDecoder::default();
        let stream = concat!(
            "{\"message\":{\"content\":\"[1,\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"2]\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
            "{\"message\":{\"content\":\"ignored\"},\"done\":false}\n",
        );
        let fragments = decoder.feed(stream.as_bytes()).unwrap();
        assert_eq!(fragments, vec!["[1,", "2]"]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_line_decoder_flushes_unterminated_line() {
        let mut decoder = ChatLineDecoder::default();
        let fragments = decoder
            .feed(b"{\"message\":{\"content\":\"x\"},\"done\":true}")
            .unwrap();
        assert!(fragments.is_empty());
        assert_eq!(decoder.finish().unwrap(), vec!["x"]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_line_decoder_error_frame() {
        let mut decoder = ChatLineDecoder::default();
        let err = decoder.feed(b"{\"error\":\"model 'llava' not found\"}\n").unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));
    }
}
