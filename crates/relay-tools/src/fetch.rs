//! Web fetch tool

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use relay_agent::interaction::PermissionPrompt;
use relay_agent::{PermissionAware, Tool, ToolCategory, ToolResult};
use reqwest::Url;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_CHARS: usize = 50_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "main", "header", "footer", "nav", "aside", "h1", "h2", "h3",
    "h4", "h5", "h6", "ul", "ol", "li", "dl", "dt", "dd", "table", "tr", "pre", "blockquote",
    "figure", "figcaption", "hr",
];

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n+").expect("valid regex"));

/// Fetches a URL over HTTP(S). Every fetch asks, except hosts listed as
/// trusted.
pub struct WebFetchTool {
    client: reqwest::Client,
    trusted_domains: Vec<String>,
    max_body_bytes: usize,
}

impl WebFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to a default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            trusted_domains: Vec::new(),
            max_body_bytes: MAX_BODY_BYTES,
        }
    }

    pub fn with_trusted_domains(mut self, domains: Vec<String>) -> Self {
        self.trusted_domains = domains;
        self
    }

    fn is_trusted(&self, url: &str) -> bool {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) else {
            return false;
        };
        self.trusted_domains.iter().any(|domain| {
            let domain = domain.to_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        })
    }

    async fn fetch(&self, arguments: &Value, cancel: CancellationToken) -> ToolResult {
        let Some(raw) = arguments.get("url").and_then(Value::as_str) else {
            return ToolResult::error("Missing 'url' argument");
        };
        let url = match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => return ToolResult::error(format!("Unsupported URL scheme: {}", url.scheme())),
            Err(e) => return ToolResult::error(format!("Invalid URL {}: {}", raw, e)),
        };
        let max_chars = arguments
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|m| m as usize)
            .unwrap_or(DEFAULT_MAX_CHARS);

        let request = async {
            let mut response = self.client.get(url.clone()).send().await?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let mut body = Vec::new();
            let mut truncated = false;
            while let Some(chunk) = response.chunk().await? {
                let room = self.max_body_bytes - body.len();
                if chunk.len() > room {
                    body.extend_from_slice(&chunk[..room]);
                    truncated = true;
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            Ok::<_, reqwest::Error>((status, content_type, body, truncated))
        };
        let (status, content_type, body, truncated) = tokio::select! {
            _ = cancel.cancelled() => return ToolResult::error("Fetch cancelled"),
            result = request => match result {
                Ok(parts) => parts,
                Err(e) => return ToolResult::error(format!("Request to {} failed: {}", url, e)),
            },
        };

        let body = String::from_utf8_lossy(&body);
        let text = if content_type.contains("html") {
            html_to_text(&body)
        } else {
            body.into_owned()
        };
        let total = text.chars().count();
        let mut output: String = text.chars().take(max_chars).collect();
        if total > max_chars {
            output.push_str(&format!("\n\n... ({} more characters)", total - max_chars));
        }
        if truncated {
            tracing::debug!("Stopped reading {} after {} bytes", url, self.max_body_bytes);
            output.push_str(&format!(
                "\n\n... (response cut off after {} bytes)",
                self.max_body_bytes
            ));
        }

        if !status.is_success() {
            return ToolResult::error(format!("{} returned {}\n\n{}", url, status, output));
        }
        ToolResult::text(output).with_details(json!({
            "url": url.as_str(),
            "status": status.as_u16(),
            "content_type": content_type,
            "truncated": truncated,
        }))
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Readable text from an HTML page: the body's text nodes, one line per block
fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = Selector::parse("body")
        .ok()
        .and_then(|body| document.select(&body).next())
        .unwrap_or_else(|| document.root_element());

    let mut text = String::new();
    collect_text(root, &mut text);
    let lines: Vec<String> = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    BLANK_RUNS
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) if el.name() == "br" => out.push('\n'),
            Node::Element(el) if SKIPPED_ELEMENTS.contains(&el.name()) => {}
            Node::Element(el) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                let block = BLOCK_ELEMENTS.contains(&el.name());
                if block {
                    out.push('\n');
                }
                collect_text(child, out);
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn label(&self) -> &str {
        "Fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page or other HTTP resource and return its text. HTML is reduced to readable text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "http or https URL to fetch"
                },
                "max_chars": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum characters of content to return (default: 50000)"
                }
            },
            "required": ["url"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }

    async fn execute(&self, _tool_call_id: &str, arguments: Value, cancel: CancellationToken) -> ToolResult {
        self.fetch(&arguments, cancel).await
    }
}

#[async_trait]
impl PermissionAware for WebFetchTool {
    fn requires_permission(&self, arguments: &Value) -> bool {
        arguments
            .get("url")
            .and_then(Value::as_str)
            .is_none_or(|url| !self.is_trusted(url))
    }

    fn prepare_permission(&self, tool_call_id: &str, arguments: &Value) -> PermissionPrompt {
        let url = arguments.get("url").and_then(Value::as_str).unwrap_or("");
        PermissionPrompt {
            tool_name: self.name().to_string(),
            tool_call_id: tool_call_id.to_string(),
            summary: format!("Fetch {}", url),
            arguments: arguments.clone(),
            category: ToolCategory::Network,
        }
    }

    async fn execute_approved(&self, _tool_call_id: &str, arguments: Value, cancel: CancellationToken) -> ToolResult {
        self.fetch(&arguments, cancel).await
    }
}
