// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::fsutil::{absolutize, is_under};
use crate::permission::PermissionService;
use crate::tool::{Tool, ToolCall, ToolCtx, ToolError, ToolOutput};

/// Hard timeout ceiling for fetch.
const FETCH_TIMEOUT_CAP: Duration = Duration::from_secs(120);

/// Hard timeout ceiling for download.
const DOWNLOAD_TIMEOUT_CAP: Duration = Duration::from_secs(600);

/// Response body cap.
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Characters of converted text handed back to the model before a
/// truncation notice is appended.
const MAX_READ_CHARS: usize = 250_000;

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent("quill-agent/0.4")
        .build()?)
}

async fn read_body_capped(resp: reqwest::Response) -> anyhow::Result<(Vec<u8>, bool)> {
    use futures::StreamExt;
    let mut stream = resp.bytes_stream();
    let mut body: Vec<u8> = Vec::new();
    let mut truncated = false;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > MAX_BODY_BYTES {
            body.extend_from_slice(&chunk[..MAX_BODY_BYTES - body.len()]);
            truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body, truncated))
}

/// Convert HTML to readable text.  html2text's output keeps enough list and
/// heading structure that the same conversion serves the markdown format.
fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 100)
}

fn apply_read_cap(mut content: String, body_truncated: bool) -> String {
    let total = content.len();
    if total > MAX_READ_CHARS {
        let mut cut = MAX_READ_CHARS;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        content.push_str(&format!(
            "\n\n[content truncated at {MAX_READ_CHARS} of {total} characters]"
        ));
    } else if body_truncated {
        content.push_str(&format!(
            "\n\n[response body truncated at {MAX_BODY_BYTES} bytes]"
        ));
    }
    content
}

/// GET a URL and return its content as text, markdown, or raw HTML.
pub struct FetchTool {
    pub permissions: Arc<PermissionService>,
    pub default_timeout_secs: u64,
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return its content.\n\
         format: text (default, HTML stripped) | markdown | html (raw).\n\
         Body capped at 5 MB; a truncation notice is appended when content\n\
         is cut.  Timeout defaults from config, capped at 120 seconds."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "http(s) URL to fetch"
                },
                "format": {
                    "type": "string",
                    "enum": ["text", "markdown", "html"],
                    "description": "How to render the response (default text)"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Request timeout in seconds (capped at 120)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let url = match call.args.get("url").and_then(|v| v.as_str()) {
            Some(u) if u.starts_with("http://") || u.starts_with("https://") => u.to_string(),
            Some(u) => return Ok(ToolOutput::err(&call.id, format!("invalid URL: {u}"))),
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'url'")),
        };
        let format = call
            .args
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("text")
            .to_string();
        if !["text", "markdown", "html"].contains(&format.as_str()) {
            return Ok(ToolOutput::err(&call.id, format!("unknown format: {format}")));
        }
        let timeout = Duration::from_secs(
            call.args
                .get("timeout")
                .and_then(|v| v.as_u64())
                .unwrap_or(self.default_timeout_secs),
        )
        .min(FETCH_TIMEOUT_CAP);

        self.permissions
            .request(ctx, "fetch", "network", &url, "fetch a URL", json!({ "url": url }))
            .await?;

        debug!(url = %url, format = %format, "fetch tool");

        let fetched = async {
            let client = http_client(timeout)?;
            let resp = client.get(&url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!("request failed with status {status}");
            }
            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_lowercase();
            let (body, truncated) = read_body_capped(resp).await?;
            Ok::<_, anyhow::Error>((content_type, body, truncated))
        };

        let (content_type, body, truncated) = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Ok(ToolOutput::err(&call.id, "fetch canceled"));
            }
            result = fetched => match result {
                Ok(v) => v,
                Err(e) => return Ok(ToolOutput::err(&call.id, format!("fetch error: {e}"))),
            },
        };

        let text = match String::from_utf8(body) {
            Ok(t) => t,
            Err(_) => {
                return Ok(ToolOutput::err(
                    &call.id,
                    "response body is not valid UTF-8; use download for binary content",
                ))
            }
        };

        let is_html = content_type.contains("html") || format == "html";
        let content = match format.as_str() {
            "html" => text,
            _ if is_html => html_to_text(&text),
            _ => text,
        };

        Ok(ToolOutput::ok(&call.id, apply_read_cap(content, truncated)))
    }
}

/// Download a URL to a file under the working directory.
pub struct DownloadTool {
    pub permissions: Arc<PermissionService>,
}

#[async_trait]
impl Tool for DownloadTool {
    fn name(&self) -> &str {
        "download"
    }

    fn description(&self) -> &str {
        "Download a URL to a file below the working directory.\n\
         Timeout defaults to 10 minutes.  Parent directories are created."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "http(s) URL to download"
                },
                "file_path": {
                    "type": "string",
                    "description": "Destination path below the working directory"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Request timeout in seconds (capped at 600)"
                }
            },
            "required": ["url", "file_path"],
            "additionalProperties": false
        })
    }

    async fn invoke(&self, ctx: &ToolCtx, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let url = match call.args.get("url").and_then(|v| v.as_str()) {
            Some(u) if u.starts_with("http://") || u.starts_with("https://") => u.to_string(),
            Some(u) => return Ok(ToolOutput::err(&call.id, format!("invalid URL: {u}"))),
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'url'")),
        };
        let path_arg = match call.args.get("file_path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return Ok(ToolOutput::err(&call.id, "missing required parameter 'file_path'")),
        };
        let timeout = Duration::from_secs(
            call.args
                .get("timeout")
                .and_then(|v| v.as_u64())
                .unwrap_or(DOWNLOAD_TIMEOUT_CAP.as_secs()),
        )
        .min(DOWNLOAD_TIMEOUT_CAP);

        let path = absolutize(&ctx.working_dir, path_arg);
        if !is_under(&path, &ctx.working_dir) {
            return Ok(ToolOutput::err(
                &call.id,
                format!("{} is outside the working directory", path.display()),
            ));
        }

        self.permissions
            .request(
                ctx,
                "download",
                "write",
                &path.to_string_lossy(),
                "download a URL to disk",
                json!({ "url": url, "file_path": path.to_string_lossy() }),
            )
            .await?;

        debug!(url = %url, path = %path.display(), "download tool");

        let fetched = async {
            let client = http_client(timeout)?;
            let resp = client.get(&url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!("request failed with status {status}");
            }
            Ok::<_, anyhow::Error>(resp.bytes().await?)
        };

        let bytes = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Ok(ToolOutput::err(&call.id, "download canceled"));
            }
            result = fetched => match result {
                Ok(b) => b,
                Err(e) => return Ok(ToolOutput::err(&call.id, format!("download error: {e}"))),
            },
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = crate::builtin::edit::create_dirs(parent) {
                return Ok(ToolOutput::err(&call.id, format!("mkdir error: {e}")));
            }
        }
        if let Err(e) = std::fs::write(&path, &bytes) {
            return Ok(ToolOutput::err(&call.id, format!("write error: {e}")));
        }

        Ok(ToolOutput::ok(
            &call.id,
            format!("Downloaded {} bytes to {}", bytes.len(), path.display()),
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_to_text_strips_tags() {
        let html = "<html><body><h1>Hello</h1><p>World</p></body></html>";
        let text = html_to_text(html);
        assert!(text.contains("Hello"));
        assert!(text.contains("World"));
        assert!(!text.contains("<h1>"));
    }

    #[test]
    fn read_cap_appends_truncation_notice() {
        let long = "x".repeat(MAX_READ_CHARS + 100);
        let capped = apply_read_cap(long, false);
        assert!(capped.contains("content truncated at"));
        assert!(capped.len() < MAX_READ_CHARS + 200);
    }

    #[test]
    fn body_truncation_notice_when_under_read_cap() {
        let capped = apply_read_cap("short".into(), true);
        assert!(capped.contains("response body truncated"));
    }

    #[test]
    fn short_content_passes_through() {
        assert_eq!(apply_read_cap("hello".into(), false), "hello");
    }

    #[tokio::test]
    async fn fetch_rejects_non_http_url() {
        use crate::tool::test_ctx;
        use quill_config::PermissionConfig;
        let t = FetchTool {
            permissions: PermissionService::new(&PermissionConfig { yolo: true, ..Default::default() }),
            default_timeout_secs: 5,
        };
        let out = t
            .invoke(
                &test_ctx(),
                &ToolCall {
                    id: "f1".into(),
                    name: "fetch".into(),
                    args: serde_json::json!({"url": "ftp://example.com/x"}),
                },
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("invalid URL"));
    }

    #[tokio::test]
    async fn download_rejects_paths_outside_working_dir() {
        use crate::tool::test_ctx;
        use quill_config::PermissionConfig;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx();
        ctx.working_dir = dir.path().to_path_buf();
        let t = DownloadTool {
            permissions: PermissionService::new(&PermissionConfig { yolo: true, ..Default::default() }),
        };
        let out = t
            .invoke(
                &ctx,
                &ToolCall {
                    id: "d1".into(),
                    name: "download".into(),
                    args: serde_json::json!({
                        "url": "https://example.com/x",
                        "file_path": "/etc/pwned"
                    }),
                },
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("outside the working directory"));
    }
}
