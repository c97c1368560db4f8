//! URL fetch tool, guarded against SSRF.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use companion_chat::SourceItem;

use crate::ssrf::UrlGuard;
use crate::tool::{Result, Tool, ToolContext, ToolError, ToolOutput};

const DEFAULT_MAX_CHARS: usize = 50_000;
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<script.*?</script>|<style.*?</style>|<[^>]+>").unwrap());
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

#[derive(Deserialize)]
struct FetchUrlArgs {
    url: String,
    #[serde(default = "default_max_chars")]
    max_chars: usize,
}

fn default_max_chars() -> usize {
    DEFAULT_MAX_CHARS
}

pub struct FetchUrlTool {
    client: reqwest::Client,
    guard: UrlGuard,
}

impl Default for FetchUrlTool {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchUrlTool {
    pub fn new() -> Self {
        // Redirects are followed manually so each hop is re-validated.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self {
            client,
            guard: UrlGuard::new(),
        }
    }
}

/// Crude readable-text extraction: drop script/style/tags, collapse blank
/// runs. Enough for the model to work with; fidelity is not the goal.
fn strip_html(body: &str) -> String {
    let stripped = TAG_RE.replace_all(body, " ");
    let collapsed = WS_RE.replace_all(stripped.trim(), "\n\n");
    collapsed.into_owned()
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a public http(s) URL and return its readable text. \
         Private addresses, internal hostnames and non-web schemes are refused."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Fully-formed http(s) URL" },
                "max_chars": { "type": "integer", "description": "Max characters to return (default 50000)" }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn trace_step_type(&self) -> &str {
        "fetch_url"
    }

    fn format_trace_content(&self, input: &serde_json::Value, _output: &ToolOutput) -> Option<String> {
        input["url"].as_str().map(|url| format!("fetched {url}"))
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let args: FetchUrlArgs = serde_json::from_value(input)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        log::debug!("[{}] fetch_url {}", ctx.session_id, args.url);
        let response = self
            .guard
            .fetch(&self.client, &args.url)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ToolError::Execution(format!(
                "HTTP {} fetching {}",
                response.status(),
                args.url
            )));
        }

        let final_url = response.url().to_string();
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/html"))
            .unwrap_or(false);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_BODY_BYTES)]);

        let mut text = if is_html {
            strip_html(&body)
        } else {
            body.into_owned()
        };
        if text.chars().count() > args.max_chars {
            text = text.chars().take(args.max_chars).collect();
            text.push_str("\n[content truncated]");
        }

        Ok(ToolOutput::text(text).with_sources(vec![SourceItem {
            url: final_url.clone(),
            title: final_url,
        }]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_chat::{InMemoryAttachmentStore, InMemoryChatStore};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> ToolContext {
        ToolContext {
            workspace_id: "ws".to_string(),
            stream_id: "s1".to_string(),
            session_id: "sess".to_string(),
            persona_id: "p1".to_string(),
            cancel: CancellationToken::new(),
            messages: Arc::new(InMemoryChatStore::new()),
            attachments: Arc::new(InMemoryAttachmentStore::new()),
        }
    }

    #[test]
    fn strip_html_drops_tags_and_scripts() {
        let html = "<html><script>evil()</script><body><h1>Title</h1><p>Body text</p></body></html>";
        let text = strip_html(html);
        assert!(text.contains("Title"));
        assert!(text.contains("Body text"));
        assert!(!text.contains("evil"));
        assert!(!text.contains("<h1>"));
    }

    #[tokio::test]
    async fn private_address_is_refused_without_fetching() {
        let tool = FetchUrlTool::new();
        let error = tool
            .execute(json!({ "url": "http://10.0.0.1/admin" }), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(error, ToolError::Execution(_)));
    }

    #[tokio::test]
    async fn fetches_loopback_only_in_tests_via_mock_refusal() {
        // The guard blocks the mock server's loopback address; this pins
        // down that even a listening local service is unreachable.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
            .mount(&server)
            .await;

        let tool = FetchUrlTool::new();
        let error = tool
            .execute(json!({ "url": server.uri() }), &ctx())
            .await
            .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("blocked range"), "{message}");
    }
}
