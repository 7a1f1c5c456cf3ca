//! Tool discovery: the initialize / tools-list handshake.
//!
//! One second after a bridge reaches Running (and only when the config has
//! no cached tools) the bridge introduces itself to the child and asks for
//! its tool list, using reserved integer ids 1 and 2. The same handshake
//! backs the standalone [`validate`] path, which spawns the child outside
//! any bridge, applies a hard 5 second wall clock, and terminates it again.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdout;
use tokio_util::sync::CancellationToken;

use crate::bridge::BridgeShared;
use crate::config::{ChildConfig, ToolInfo};
use crate::error::BridgeError;
use crate::events::LogStream;
use crate::framing::LineFramer;
use crate::jsonrpc::{self, JsonRpcId};
use crate::supervisor;

/// Delay between the child reaching Running and the handshake starting.
const DISCOVERY_DELAY: Duration = Duration::from_secs(1);

/// Per-stage patience for the in-bridge handshake. Generous on purpose;
/// slow interpreters routinely take seconds to boot.
const STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wall clock for the standalone validate path.
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reserved JSON-RPC ids for the handshake.
pub const INITIALIZE_ID: i64 = 1;
pub const TOOLS_LIST_ID: i64 = 2;

fn initialize_message() -> String {
    json!({
        "jsonrpc": "2.0",
        "id": INITIALIZE_ID,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "mcproxy", "version": "1.0.0"}
        }
    })
    .to_string()
}

fn tools_list_message() -> String {
    json!({
        "jsonrpc": "2.0",
        "id": TOOLS_LIST_ID,
        "method": "tools/list",
        "params": {}
    })
    .to_string()
}

/// Flatten a `tools/list` reply into [`ToolInfo`] records.
///
/// Entries without a name are skipped; descriptions default to empty;
/// `inputSchema.properties.*.type` collapses to a `name -> type` map with
/// `"any"` standing in for anything that is not a plain string type.
pub fn parse_tools(reply: &Value) -> Vec<ToolInfo> {
    let Some(entries) = reply
        .get("result")
        .and_then(|r| r.get("tools"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    entries.iter().filter_map(parse_tool).collect()
}

fn parse_tool(entry: &Value) -> Option<ToolInfo> {
    let name = entry.get("name")?.as_str()?.to_string();
    let description = entry
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut parameters = BTreeMap::new();
    if let Some(props) = entry
        .pointer("/inputSchema/properties")
        .and_then(Value::as_object)
    {
        for (prop, schema) in props {
            let ty = schema
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("any");
            parameters.insert(prop.clone(), ty.to_string());
        }
    }
    Some(ToolInfo {
        name,
        description,
        parameters,
    })
}

/// In-bridge discovery task. Reserves the handshake ids at the router (so
/// colliding network ids are shadowed while it runs), performs the two-stage
/// exchange, caches the tool list, and emits the tools-changed event.
pub(crate) async fn run_startup_discovery(shared: Arc<BridgeShared>, cancel: CancellationToken) {
    if !shared.config.tools.is_empty() {
        return;
    }
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(DISCOVERY_DELAY) => {}
    }

    let rx = {
        let mut state = shared.state.lock().await;
        state.router.reserve_discovery_id(INITIALIZE_ID)
    };
    if !shared.write_child_line(initialize_message().as_bytes()).await {
        abandon(&shared, "could not send initialize").await;
        return;
    }
    let Some(init) = await_stage(rx, &cancel).await else {
        abandon(&shared, "no initialize response").await;
        return;
    };
    if init
        .pointer("/result/protocolVersion")
        .and_then(Value::as_str)
        .is_none()
    {
        abandon(&shared, "initialize response missing protocolVersion").await;
        return;
    }

    let rx = {
        let mut state = shared.state.lock().await;
        state.router.reserve_discovery_id(TOOLS_LIST_ID)
    };
    if !shared.write_child_line(tools_list_message().as_bytes()).await {
        abandon(&shared, "could not send tools/list").await;
        return;
    }
    let Some(reply) = await_stage(rx, &cancel).await else {
        abandon(&shared, "no tools/list response").await;
        return;
    };

    let tools = parse_tools(&reply);
    {
        let mut state = shared.state.lock().await;
        state.router.clear_discovery();
        state.tools = tools.clone();
    }
    shared.events.log(
        LogStream::System,
        format!("discovered {} tools", tools.len()),
    );
    shared.events.tools(tools);
}

async fn await_stage(
    rx: tokio::sync::oneshot::Receiver<Value>,
    cancel: &CancellationToken,
) -> Option<Value> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        reply = tokio::time::timeout(STAGE_TIMEOUT, rx) => reply.ok()?.ok(),
    }
}

async fn abandon(shared: &Arc<BridgeShared>, reason: &str) {
    shared.state.lock().await.router.clear_discovery();
    tracing::warn!(bridge_id = %shared.config.id, reason, "tool discovery abandoned");
}

/// Spawn the configured child, run the handshake under a 5 second wall
/// clock, terminate the child, and return its tool list.
///
/// Standalone: does not touch any running bridge.
pub async fn validate(config: &ChildConfig) -> Result<Vec<ToolInfo>, BridgeError> {
    let mut child = supervisor::spawn(config)?;
    let (stdin, stdout) = match (child.take_stdin(), child.take_stdout()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            child.terminate_and_wait().await;
            return Err(BridgeError::SpawnFailed {
                command: config.command.clone(),
                source: std::io::Error::other("child pipes were not captured"),
            });
        }
    };

    let result = tokio::time::timeout(VALIDATE_TIMEOUT, handshake(stdin, stdout)).await;
    child.terminate_and_wait().await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(BridgeError::ValidateTimeout {
            seconds: VALIDATE_TIMEOUT.as_secs(),
        }),
    }
}

async fn handshake(
    mut stdin: tokio::process::ChildStdin,
    stdout: ChildStdout,
) -> Result<Vec<ToolInfo>, BridgeError> {
    let mut reader = LineReader::new(stdout);

    let mut message = initialize_message();
    message.push('\n');
    stdin.write_all(message.as_bytes()).await?;
    stdin.flush().await?;

    let init = reader.wait_for_id(INITIALIZE_ID).await?;
    if init
        .pointer("/result/protocolVersion")
        .and_then(Value::as_str)
        .is_none()
    {
        return Err(BridgeError::ValidateFailed {
            reason: "initialize response missing protocolVersion".to_string(),
        });
    }

    let mut message = tools_list_message();
    message.push('\n');
    stdin.write_all(message.as_bytes()).await?;
    stdin.flush().await?;

    let reply = reader.wait_for_id(TOOLS_LIST_ID).await?;
    Ok(parse_tools(&reply))
}

/// Line-at-a-time reader over the child's stdout for the validate path.
struct LineReader {
    stdout: ChildStdout,
    framer: LineFramer,
    queued: VecDeque<String>,
}

impl LineReader {
    fn new(stdout: ChildStdout) -> Self {
        Self {
            stdout,
            framer: LineFramer::new(),
            queued: VecDeque::new(),
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>, BridgeError> {
        if let Some(line) = self.queued.pop_front() {
            return Ok(Some(line));
        }
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.stdout.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            let mut lines = self.framer.push(&chunk[..n]).into_iter();
            if let Some(first) = lines.next() {
                self.queued.extend(lines);
                return Ok(Some(first));
            }
        }
    }

    /// Read lines until one parses as JSON with the given integer id.
    /// Unrelated lines (logs, notifications) are skipped.
    async fn wait_for_id(&mut self, id: i64) -> Result<Value, BridgeError> {
        while let Some(line) = self.next_line().await? {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if value.get("id").and_then(jsonrpc::from_value) == Some(JsonRpcId::Int(id)) {
                return Ok(value);
            }
        }
        Err(BridgeError::ValidateFailed {
            reason: "child closed stdout before responding".to_string(),
        })
    }
}
