//! Shared harness for driving the real `run_adapter` event loop against
//! an in-process mock backend speaking the `net/rpc/jsonrpc` wire shape,
//! the same style the unit tests in `session.rs`/`backend_transport.rs`
//! use for a single RPC call, scaled up to a whole DAP session.

use std::sync::Arc;
use std::sync::Mutex;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use godlv_bridge::config::AdapterConfig;
use godlv_bridge::dap_io::{DapReader, encode};

/// A canned-response backend: `respond(method, params) -> result value`.
/// Held behind `Arc<Mutex<..>>` so a test closure can carry counters
/// across calls (e.g. "first Command call returns X, second returns Y").
pub type Responder = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

pub struct MockBackend {
    pub addr: String,
}

/// Starts a one-shot-connection mock backend on an ephemeral port. Each
/// inbound `{"method":"RPCServer.Foo","params":[args],"id":N}` request is
/// matched by bare method name (the `RPCServer.` prefix stripped) and
/// answered with `{"id":N,"result":<responder(...)>,"error":null}`.
pub async fn start_mock_backend(responder: Responder) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (mut sock, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };

        let mut raw: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8 * 1024];

        loop {
            match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    raw.extend_from_slice(&buf[..n]);
                    loop {
                        let mut stream = serde_json::Deserializer::from_slice(&raw).into_iter::<Value>();
                        match stream.next() {
                            Some(Ok(req)) => {
                                let consumed = stream.byte_offset();
                                raw.drain(..consumed);

                                let id = req.get("id").cloned().unwrap_or(Value::Null);
                                let method = req
                                    .get("method")
                                    .and_then(Value::as_str)
                                    .unwrap_or("")
                                    .trim_start_matches("RPCServer.")
                                    .to_string();
                                let params = req
                                    .get("params")
                                    .and_then(Value::as_array)
                                    .and_then(|p| p.first())
                                    .cloned()
                                    .unwrap_or(Value::Null);

                                let result = responder(&method, &params);
                                let resp = json!({"id": id, "result": result, "error": Value::Null});
                                let mut bytes = serde_json::to_vec(&resp).unwrap();
                                bytes.push(b'\n');
                                if sock.write_all(&bytes).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) if e.is_eof() => break,
                            _ => break,
                        }
                    }
                }
            }
        }
    });

    MockBackend { addr }
}

/// A responder that always answers `GetVersion` with `apiVersion` and
/// every `Command` with a stopped-at-breakpoint `State`, regardless of
/// what else is asked — enough to get a session through `attach` and
/// `configurationDone` without caring about every RPC.
pub fn happy_path_responder(api_version: i64) -> Responder {
    Arc::new(move |method, params| match method {
        "GetVersion" => json!({"APIVersion": api_version}),
        "Command" => json!({"State": {"exited": false, "currentGoroutine": {"id": 1}}}),
        "ListGoroutines" => json!({"Locations": [{"id": 1}]}),
        "ListFunctionArgs" | "ListLocalVars" => json!({"Variables": []}),
        "ListPackageVars" => json!({"Variables": []}),
        "Stacktrace" | "StacktraceGoroutine" => json!({"Locations": []}),
        "ListBreakpoints" => json!({"Breakpoints": []}),
        "CreateBreakpoint" => {
            let line = params.get("Breakpoint").and_then(|bp| bp.get("line")).cloned().unwrap_or(json!(0));
            let file = params.get("Breakpoint").and_then(|bp| bp.get("file")).cloned().unwrap_or(json!(""));
            json!({"Breakpoint": {"id": 1, "file": file, "line": line, "verified": true}})
        }
        "Detach" => json!({}),
        _ => json!({}),
    })
}

/// Wraps the duplex pipe the test drives `run_adapter` through: writing
/// a DAP request on `to_adapter` makes it arrive on the adapter's
/// reader; reading from `from_adapter` yields whatever the adapter
/// wrote (responses and events, undifferentiated — callers filter).
pub struct ClientHarness {
    pub to_adapter: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    pub from_adapter: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    reader: DapReader,
}

impl ClientHarness {
    pub fn spawn(cfg: AdapterConfig) -> Self {
        let (client_end, adapter_end) = tokio::io::duplex(256 * 1024);
        let (adapter_read, adapter_write) = tokio::io::split(adapter_end);
        tokio::spawn(async move {
            let _ = godlv_bridge::run_adapter(adapter_read, adapter_write, cfg).await;
        });
        let (from_adapter, to_adapter) = tokio::io::split(client_end);
        Self { to_adapter, from_adapter, reader: DapReader::new() }
    }

    pub async fn send(&mut self, msg: Value) {
        self.to_adapter.write_all(&encode(&msg)).await.unwrap();
    }

    pub async fn request(&mut self, seq: i64, command: &str, arguments: Value) {
        self.send(json!({"seq": seq, "type": "request", "command": command, "arguments": arguments})).await;
    }

    /// Reads the next fully-framed message off the wire, waiting for
    /// more bytes as needed. Used both for responses and events; tests
    /// that need a specific one skip past ones they don't care about.
    pub async fn next_message(&mut self) -> Value {
        loop {
            if let Some(msg) = self.reader.next_message() {
                return msg.expect("well-formed DAP frame from the adapter");
            }
            let mut buf = [0u8; 8 * 1024];
            let n = self.from_adapter.read(&mut buf).await.expect("adapter still connected");
            assert!(n > 0, "adapter closed the connection unexpectedly");
            self.reader.add_bytes(&buf[..n]);
        }
    }

    /// Reads messages until one matches `pred`, returning it. Used to
    /// skip past events while waiting for a specific response.
    pub async fn next_matching(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        loop {
            let msg = self.next_message().await;
            if pred(&msg) {
                return msg;
            }
        }
    }
}

pub fn is_response_to(msg: &Value, command: &str) -> bool {
    msg.get("type").and_then(Value::as_str) == Some("response") && msg.get("command").and_then(Value::as_str) == Some(command)
}

pub fn is_event(msg: &Value, event: &str) -> bool {
    msg.get("type").and_then(Value::as_str) == Some("event") && msg.get("event").and_then(Value::as_str) == Some(event)
}

#[allow(dead_code)]
pub fn call_counter() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}
