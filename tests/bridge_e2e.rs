//! End-to-end transport scenarios against real bridges and real children.
//!
//! `cat` makes a convenient loopback MCP server: every forwarded body comes
//! straight back on stdout, so a request's own JSON (id included) doubles as
//! the child's response line. Scripted `sh` children cover discovery and
//! selective emission.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use mcproxy::bridge::Bridge;
use mcproxy::config::ChildConfig;
use mcproxy::discovery;
use mcproxy::error::BridgeError;
use mcproxy::events::{BridgeEvent, BridgeStatus, EventSender};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

fn cat_config(id: &str) -> ChildConfig {
    ChildConfig::new(id, "cat")
}

fn script_config(id: &str, script: &str) -> ChildConfig {
    let mut config = ChildConfig::new(id, "sh");
    config.args = vec!["-c".to_string(), script.to_string()];
    config
}

async fn start_bridge(config: ChildConfig) -> (Bridge, u16) {
    let events = EventSender::disconnected(config.id.clone());
    let bridge = Bridge::new(config, events);
    let port = bridge.start().await.expect("bridge failed to start");
    assert!(port > 0);
    assert_eq!(bridge.actual_port(), port);
    assert_eq!(bridge.status(), BridgeStatus::Running);
    (bridge, port)
}

async fn connect(port: u16) -> TcpStream {
    tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

async fn send(stream: &mut TcpStream, bytes: &[u8]) {
    tokio::time::timeout(IO_TIMEOUT, stream.write_all(bytes))
        .await
        .expect("write timed out")
        .expect("write failed");
}

/// Read until the accumulated text satisfies `done`, returning everything
/// read so far.
async fn read_until_pred(
    stream: &mut TcpStream,
    what: &str,
    done: impl Fn(&str) -> bool,
) -> String {
    let mut collected: Vec<u8> = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, async {
        let mut chunk = [0u8; 4096];
        loop {
            let text = String::from_utf8_lossy(&collected).into_owned();
            if done(&text) {
                return text;
            }
            let n = stream.read(&mut chunk).await.expect("read failed");
            assert!(n > 0, "connection closed while waiting for {what}; got: {text}");
            collected.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Read until the accumulated text contains `needle`.
async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    read_until_pred(stream, &format!("{needle:?}"), |text| text.contains(needle)).await
}

/// Read a fresh stream's response head plus its complete endpoint event
/// (the session id is followed by a newline once the event is whole).
async fn read_endpoint_event(stream: &mut TcpStream) -> String {
    read_until_pred(stream, "endpoint event", |text| {
        match text.find("sessionId=") {
            Some(pos) => text[pos..].contains('\n'),
            None => false,
        }
    })
    .await
}

/// Read to EOF (the peer closes), returning everything.
async fn read_to_end(stream: &mut TcpStream) -> String {
    let mut collected = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, stream.read_to_end(&mut collected))
        .await
        .expect("read timed out")
        .expect("read failed");
    String::from_utf8_lossy(&collected).into_owned()
}

fn post(path: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut raw = format!("POST {path} HTTP/1.1\r\nHost: test\r\n");
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    raw.into_bytes()
}

fn session_id_from(endpoint_text: &str) -> String {
    let start = endpoint_text
        .find("sessionId=")
        .expect("no sessionId in endpoint event")
        + "sessionId=".len();
    endpoint_text[start..]
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect()
}

#[tokio::test]
async fn sse_happy_path() {
    let (bridge, port) = start_bridge(cat_config("sse-happy")).await;

    let mut sse = connect(port).await;
    send(
        &mut sse,
        b"GET /sse HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\n\r\n",
    )
    .await;
    let head = read_endpoint_event(&mut sse).await;
    assert!(head.contains("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: text/event-stream"));
    assert!(head.contains("Transfer-Encoding: chunked"));
    assert!(head.contains("X-Mcp-Session-Id: "));
    assert!(head.contains("event: endpoint"));

    let session_id = session_id_from(&head);
    assert!(head.contains(&format!(
        "data: http://127.0.0.1:{port}/message?sessionId={session_id}"
    )));

    let body = r#"{"jsonrpc":"2.0","id":7,"method":"tools/list","params":{}}"#;
    let mut poster = connect(port).await;
    send(
        &mut poster,
        &post(&format!("/message?sessionId={session_id}"), &[], body),
    )
    .await;
    let ack = read_until(&mut poster, "accepted").await;
    assert!(ack.contains("HTTP/1.1 202 Accepted"));

    // cat echoes the request; the response must arrive on the SSE stream.
    let event = read_until(&mut sse, "\"id\":7").await;
    assert!(event.contains("event: message"));
    assert!(event.contains("data: {\"jsonrpc\":\"2.0\",\"id\":7"));

    bridge.stop().await;
    assert_eq!(bridge.status(), BridgeStatus::Stopped);
    assert_eq!(bridge.actual_port(), 0);
}

#[tokio::test]
async fn sync_post_gets_exactly_one_response_then_fin() {
    let (bridge, port) = start_bridge(cat_config("sync-post")).await;

    let body = r#"{"jsonrpc":"2.0","id":"x","method":"ping"}"#;
    let mut conn = connect(port).await;
    send(&mut conn, &post("/", &[], body)).await;

    let response = read_to_end(&mut conn).await;
    assert!(response.contains("HTTP/1.1 200 OK"));
    assert!(response.contains("Content-Type: application/json"));
    assert!(response.contains("Connection: close"));
    let (_, got_body) = response
        .split_once("\r\n\r\n")
        .expect("no header/body separator");
    assert_eq!(got_body, body);

    bridge.stop().await;
}

#[tokio::test]
async fn notification_broadcasts_to_streams_but_not_sync() {
    // Child: swallows everything, emits one canned notification when poked.
    let script = r#"while IFS= read -r line; do
  case "$line" in
    *'"method":"emit"'*) printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/test"}';;
  esac
done"#;
    let (bridge, port) = start_bridge(script_config("broadcast", script)).await;

    let mut sse_a = connect(port).await;
    send(
        &mut sse_a,
        b"GET /events HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\n\r\n",
    )
    .await;
    read_until(&mut sse_a, "event: endpoint").await;

    let mut sse_b = connect(port).await;
    send(
        &mut sse_b,
        b"GET / HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\n\r\n",
    )
    .await;
    read_until(&mut sse_b, "event: endpoint").await;

    // NDJSON stream: no Accept header.
    let mut ndjson = connect(port).await;
    send(&mut ndjson, b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").await;
    read_until(&mut ndjson, "application/x-ndjson").await;

    // Sync POST that the child will never answer; it must stay pending and
    // must not receive the broadcast.
    let mut sync = connect(port).await;
    send(
        &mut sync,
        &post("/", &[], r#"{"jsonrpc":"2.0","id":"held","method":"hold"}"#),
    )
    .await;

    // Poke the child into emitting the notification.
    let mut poker = connect(port).await;
    send(
        &mut poker,
        &post("/", &[], r#"{"jsonrpc":"2.0","method":"emit"}"#),
    )
    .await;
    read_until(&mut poker, "202").await;

    let a = read_until(&mut sse_a, "notifications/test").await;
    assert!(a.contains("event: message"));
    let b = read_until(&mut sse_b, "notifications/test").await;
    assert!(b.contains("event: message"));
    let n = read_until(&mut ndjson, "notifications/test").await;
    assert!(!n.contains("event: message"), "NDJSON stream got SSE framing");

    // The pending sync connection stays silent.
    let mut probe = [0u8; 1];
    let got = tokio::time::timeout(Duration::from_millis(500), sync.read(&mut probe)).await;
    assert!(got.is_err(), "sync connection unexpectedly received data");

    bridge.stop().await;
}

#[tokio::test]
async fn streamable_post_upgrades_and_delivers_response() {
    let (bridge, port) = start_bridge(cat_config("streamable")).await;

    let body = r#"{"jsonrpc":"2.0","id":5,"method":"tools/list","params":{}}"#;
    let mut conn = connect(port).await;
    send(
        &mut conn,
        &post("/", &[("Accept", "text/event-stream")], body),
    )
    .await;

    let text = read_until(&mut conn, "\"id\":5").await;
    assert!(text.contains("HTTP/1.1 200 OK"));
    assert!(text.contains("Content-Type: text/event-stream"));
    assert!(text.contains("Transfer-Encoding: chunked"));
    assert!(text.contains("event: message"));

    bridge.stop().await;
}

#[tokio::test]
async fn session_name_sticks_across_reconnect() {
    let (bridge, port) = start_bridge(cat_config("sticky")).await;
    let session_id = "0b54f4a0-8f3f-4e3a-9b25-0e8e54f1c001";

    let initialize = r#"{"jsonrpc":"2.0","id":99,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"ChatWise","version":"1.0"}}}"#;
    let mut first = connect(port).await;
    send(
        &mut first,
        &post(&format!("/message?sessionId={session_id}"), &[], initialize),
    )
    .await;
    read_until(&mut first, "202").await;
    drop(first);

    // Reconnect with a browser User-Agent; the initialize name must win.
    let mut second = connect(port).await;
    send(
        &mut second,
        format!(
            "GET /sse?sessionId={session_id} HTTP/1.1\r\nHost: test\r\n\
             User-Agent: Mozilla/5.0 Chrome/120.0\r\nAccept: text/event-stream\r\n\r\n"
        )
        .as_bytes(),
    )
    .await;
    read_until(&mut second, "event: endpoint").await;

    let clients = bridge.active_clients().await;
    let client = clients
        .iter()
        .find(|c| c.session_id == session_id)
        .expect("session missing from active clients");
    assert_eq!(client.name, "ChatWise");
    assert!(!client.idle);

    bridge.stop().await;
}

#[tokio::test]
async fn restricted_port_goes_to_error_without_binding() {
    let mut config = cat_config("restricted");
    config.port = 80;
    let (events, mut rx) = EventSender::channel(config.id.clone());
    let bridge = Bridge::new(config, events);

    let err = bridge.start().await.expect_err("port 80 must be rejected");
    assert!(matches!(err, BridgeError::PortRestricted { port: 80 }));
    assert_eq!(bridge.status(), BridgeStatus::Error);
    assert_eq!(bridge.actual_port(), 0);

    let mut saw_restricted_log = false;
    let mut saw_error_status = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            BridgeEvent::Log(entry) if entry.message.contains("restricted") => {
                saw_restricted_log = true;
            }
            BridgeEvent::Status { status, .. } if status == BridgeStatus::Error => {
                saw_error_status = true;
            }
            _ => {}
        }
    }
    assert!(saw_restricted_log, "no log entry mentioning \"restricted\"");
    assert!(saw_error_status);
}

#[tokio::test]
async fn validate_times_out_against_silent_child() {
    let config = script_config("silent", "sleep 60");
    let started = Instant::now();
    let err = discovery::validate(&config)
        .await
        .expect_err("silent child must time out");
    let elapsed = started.elapsed();

    assert!(matches!(err, BridgeError::ValidateTimeout { seconds: 5 }));
    assert!(elapsed >= Duration::from_secs(5), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "took too long: {elapsed:?}");
}

#[tokio::test]
async fn validate_returns_tool_list() {
    let script = r#"while IFS= read -r line; do
  case "$line" in
    *'"id":1'*) printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"t","version":"0"}}}';;
    *'"id":2'*) printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo text","inputSchema":{"properties":{"text":{"type":"string"}}}}]}}';;
  esac
done"#;
    let config = script_config("validate-ok", script);
    let tools = discovery::validate(&config).await.expect("validate failed");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].description, "Echo text");
    assert_eq!(tools[0].parameters["text"], "string");
}

#[tokio::test]
async fn startup_discovery_captures_tools() {
    let script = r#"while IFS= read -r line; do
  case "$line" in
    *'"id":1'*) printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"t","version":"0"}}}';;
    *'"id":2'*) printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"search","inputSchema":{"properties":{"q":{"type":"string"},"n":{"type":"integer"}}}}]}}';;
  esac
done"#;
    let config = script_config("discover", script);
    let (events, mut rx) = EventSender::channel(config.id.clone());
    let bridge = Bridge::new(config, events);
    bridge.start().await.expect("bridge failed to start");

    // Discovery starts one second after Running; poll for the cache.
    let deadline = Instant::now() + IO_TIMEOUT;
    loop {
        let tools = bridge.tools().await;
        if !tools.is_empty() {
            assert_eq!(tools[0].name, "search");
            assert_eq!(tools[0].parameters["q"], "string");
            assert_eq!(tools[0].parameters["n"], "integer");
            break;
        }
        assert!(Instant::now() < deadline, "discovery never completed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut saw_tools_event = false;
    while let Ok(event) = rx.try_recv() {
        if let BridgeEvent::Tools { tools, .. } = event {
            assert_eq!(tools[0].name, "search");
            saw_tools_event = true;
        }
    }
    assert!(saw_tools_event, "no tools-changed event emitted");

    bridge.stop().await;
}

#[tokio::test]
async fn bearer_token_gates_requests() {
    let mut config = cat_config("bearer");
    config.bearer_token = Some("s3cret".to_string());
    let (bridge, port) = start_bridge(config).await;

    // Preflights pass without credentials.
    let mut preflight = connect(port).await;
    send(&mut preflight, b"OPTIONS / HTTP/1.1\r\nHost: test\r\n\r\n").await;
    let ok = read_until(&mut preflight, "204").await;
    assert!(ok.contains("Access-Control-Allow-Origin: *"));

    let mut denied = connect(port).await;
    send(
        &mut denied,
        b"GET /sse HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\n\r\n",
    )
    .await;
    let response = read_to_end(&mut denied).await;
    assert!(response.contains("HTTP/1.1 401 Unauthorized"));

    let mut allowed = connect(port).await;
    send(
        &mut allowed,
        b"GET /sse HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\nAuthorization: Bearer s3cret\r\n\r\n",
    )
    .await;
    let head = read_until(&mut allowed, "event: endpoint").await;
    assert!(head.contains("HTTP/1.1 200 OK"));

    bridge.stop().await;
}

#[tokio::test]
async fn tls_bytes_and_unknown_paths_are_rejected() {
    let (bridge, port) = start_bridge(cat_config("garbage")).await;

    // A mis-dialed HTTPS client: closed without a response.
    let mut tls = connect(port).await;
    send(&mut tls, &[0x16, 0x03, 0x01, 0x00, 0x05]).await;
    let response = read_to_end(&mut tls).await;
    assert!(response.is_empty(), "TLS garbage got a response: {response}");

    let mut lost = connect(port).await;
    send(&mut lost, b"GET /nope HTTP/1.1\r\nHost: test\r\n\r\n").await;
    let response = read_to_end(&mut lost).await;
    assert!(response.contains("HTTP/1.1 404 Not Found"));

    bridge.stop().await;
}

#[tokio::test]
async fn child_exit_stops_the_bridge() {
    let (bridge, port) = start_bridge(script_config("short-lived", "sleep 0.2")).await;

    let deadline = Instant::now() + IO_TIMEOUT;
    while bridge.status() != BridgeStatus::Stopped {
        assert!(Instant::now() < deadline, "bridge never stopped");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(bridge.actual_port(), 0);

    // The listener is gone too (give the accept task a beat to drop it).
    tokio::time::sleep(Duration::from_millis(200)).await;
    let refused = TcpStream::connect(("127.0.0.1", port)).await;
    assert!(refused.is_err(), "listener still accepting after child exit");
}
