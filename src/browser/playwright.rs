//! Playwright sidecar driven over JSON lines.
//!
//! The bridge script (`scripts/browser-bridge.mjs`) owns a single Chromium
//! context and answers one request per line: `{"id", "cmd", ...}` in,
//! `{"id", "ok", "value"?, "error"?}` out.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use super::{BrowserLauncher, BrowserPage, LaunchOptions};
use crate::config::BrowserConfig;
use crate::error::BrowserError;

/// Extra slack on top of a command's own timeout before the bridge is considered stuck.
const BRIDGE_GRACE: Duration = Duration::from_secs(10);

pub struct PlaywrightLauncher {
    node_binary: String,
    script: PathBuf,
    launch_timeout: Duration,
}

impl PlaywrightLauncher {
    pub fn from_config(config: &BrowserConfig) -> Self {
        Self {
            node_binary: config.node_binary.clone(),
            script: PathBuf::from(&config.bridge_script),
            launch_timeout: Duration::from_secs(config.page_load_timeout_secs),
        }
    }
}

#[async_trait]
impl BrowserLauncher for PlaywrightLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserPage>, BrowserError> {
        if !self.script.exists() {
            return Err(BrowserError::Launch(format!(
                "bridge script not found at {}",
                self.script.display()
            )));
        }
        let mut child = Command::new(&self.node_binary)
            .arg(&self.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrowserError::Launch(format!("failed to start {}: {e}", self.node_binary)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrowserError::Launch("bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrowserError::Launch("bridge stdout unavailable".into()))?;

        let mut page = PlaywrightPage {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        };
        page.request(json!({ "cmd": "launch", "options": options }), self.launch_timeout)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        info!(headless = options.headless, "browser context launched");
        Ok(Box::new(page))
    }
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

pub struct PlaywrightPage {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl PlaywrightPage {
    async fn request(&mut self, mut body: Value, timeout: Duration) -> Result<Value, BrowserError> {
        self.next_id += 1;
        let id = self.next_id;
        body["id"] = json!(id);
        body["timeoutMs"] = json!(timeout.as_millis() as u64);

        let mut line = serde_json::to_string(&body).map_err(|e| BrowserError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let read = async {
            loop {
                let Some(line) = self.stdout.next_line().await? else {
                    return Err(BrowserError::Protocol("bridge closed its output".into()));
                };
                let reply: BridgeReply = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(_) => {
                        debug!(line = %line, "ignoring non-protocol bridge output");
                        continue;
                    }
                };
                // Replies to timed-out requests can still arrive; skip them.
                if reply.id == id {
                    return Ok(reply);
                }
            }
        };
        let reply = tokio::time::timeout(timeout + BRIDGE_GRACE, read)
            .await
            .map_err(|_| BrowserError::StepTimeout((timeout + BRIDGE_GRACE).as_millis() as u64))??;

        if reply.ok {
            Ok(reply.value)
        } else {
            Err(classify_bridge_error(&body, reply.error.unwrap_or_default()))
        }
    }
}

fn classify_bridge_error(request: &Value, message: String) -> BrowserError {
    let cmd = request["cmd"].as_str().unwrap_or_default();
    if message.contains("Timeout") {
        return BrowserError::StepTimeout(request["timeoutMs"].as_u64().unwrap_or_default());
    }
    match cmd {
        "goto" => BrowserError::Navigation {
            url: request["url"].as_str().unwrap_or_default().to_string(),
            message,
        },
        "click" => BrowserError::ElementNotFound(request["selector"].as_str().unwrap_or_default().to_string()),
        _ => BrowserError::Protocol(message),
    }
}

const QUICK: Duration = Duration::from_secs(10);

#[async_trait]
impl BrowserPage for PlaywrightPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.request(json!({ "cmd": "goto", "url": url }), timeout).await?;
        Ok(())
    }

    async fn title(&mut self) -> Result<String, BrowserError> {
        let value = self.request(json!({ "cmd": "title" }), QUICK).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        let value = self.request(json!({ "cmd": "content" }), QUICK).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.request(json!({ "cmd": "click", "selector": selector }), timeout)
            .await?;
        Ok(())
    }

    async fn exists(&mut self, selector: &str) -> Result<bool, BrowserError> {
        let value = self
            .request(json!({ "cmd": "exists", "selector": selector }), QUICK)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let _ = self.request(json!({ "cmd": "close" }), QUICK).await;
        let _ = self.child.kill().await;
        Ok(())
    }
}
