/// WebSocket JSON-RPC dispatch engine
/// Persistent connections with one attached session each, single and batch
/// calls, per-call timeouts and server-initiated broadcast
use crate::errors::ApiError;
use crate::registry::{
    ApiService, CallContext, ClientChannel, HandlerRegistry, Outcome, Transport,
};
use crate::server::rest::shutdown_signal;
use crate::server::rpc::{RpcRequest, RpcResponse};
use crate::server::{invoke_with_timeout, Settled};
use crate::session::{Session, SessionStore};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub bind_host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
    /// Fixed artificial latency applied before flushing responses
    pub simulate_latency_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8081,
            request_timeout_ms: 10_000,
            simulate_latency_ms: 0,
        }
    }
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnState::Connecting => 0,
            ConnState::Open => 1,
            ConnState::Closing => 2,
            ConnState::Closed => 3,
        }
    }
}

/// One client connection: its session, outbound id counter and a writer
/// channel guarded by an explicit state check
pub struct Connection {
    pub id: u64,
    pub session_id: String,
    state: AtomicU8,
    request_counter: AtomicU64,
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    fn new(id: u64, session_id: String, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            session_id,
            state: AtomicU8::new(ConnState::Connecting.as_u8()),
            request_counter: AtomicU64::new(0),
            tx,
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Write a text frame, refusing once the connection is no longer open
    pub fn send_text(&self, text: String) -> bool {
        if self.state() != ConnState::Open {
            warn!(
                connection = self.id,
                state = ?self.state(),
                "unable to send message to client in invalid state"
            );
            return false;
        }

        self.tx.send(Message::Text(text)).is_ok()
    }
}

impl ClientChannel for Connection {
    /// Push a server-initiated request; no reply is expected
    fn request(&self, method: &str, params: Value) {
        let id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        let payload = RpcRequest::outbound(id, method, params);

        match serde_json::to_string(&payload) {
            Ok(text) => {
                self.send_text(text);
            }
            Err(e) => {
                warn!(method = %method, error = %e, "failed to send request");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }
}

/// Shared dispatcher state
struct WsState {
    registry: Arc<HandlerRegistry>,
    sessions: Arc<SessionStore>,
    links: Arc<HashMap<String, Arc<HashMap<String, Arc<dyn ApiService>>>>>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    connection_counter: AtomicU64,
    config: WsConfig,
}

/// WebSocket dispatch engine bound to one handler registry
pub struct RpcDispatcher {
    state: Arc<WsState>,
}

impl RpcDispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        sessions: Arc<SessionStore>,
        config: WsConfig,
    ) -> Self {
        let links = Arc::new(registry.cross_link());

        Self {
            state: Arc::new(WsState {
                registry,
                sessions,
                links,
                connections: Mutex::new(HashMap::new()),
                connection_counter: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Router exposing the upgrade endpoint at GET /ws
    pub fn router(&self) -> Router {
        let state = self.state.clone();

        Router::new().route(
            "/ws",
            get(
                move |ws: WebSocketUpgrade,
                      headers: HeaderMap,
                      Query(query): Query<HashMap<String, String>>| {
                    let state = state.clone();
                    async move {
                        let session = resolve_session(&state, &headers, &query);
                        let response: Response =
                            ws.on_upgrade(move |socket| handle_socket(socket, state, session));
                        response
                    }
                },
            ),
        )
    }

    /// Start the server with graceful shutdown
    pub async fn serve(&self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.state.config.bind_host, self.state.config.port);
        info!("Starting WebSocket server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to address {}: {}", addr, e))?;

        info!("WebSocket server listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("WebSocket server shutdown completed");
        Ok(())
    }

    /// Push a request-shaped message to every open connection
    pub fn broadcast(&self, method: &str, params: Value) {
        let connections: Vec<Arc<Connection>> = self
            .state
            .connections
            .lock()
            .expect("connection map lock poisoned")
            .values()
            .cloned()
            .collect();

        for connection in connections {
            connection.request(method, params.clone());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state
            .connections
            .lock()
            .expect("connection map lock poisoned")
            .len()
    }
}

/// Reuse a validly supplied session, otherwise attach a fresh one
fn resolve_session(
    state: &Arc<WsState>,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Session {
    let supplied = query
        .get("sessionId")
        .cloned()
        .or_else(|| session_cookie(headers));

    if let Some(id) = supplied {
        if let Some(session) = state.sessions.get(&id, true) {
            return session;
        }
    }

    state.sessions.create(None)
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "sessionId")
        .map(|(_, id)| id.to_string())
}

/// Run one connection: register it, pump frames, unregister on close
async fn handle_socket(socket: WebSocket, state: Arc<WsState>, session: Session) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let id = state.connection_counter.fetch_add(1, Ordering::SeqCst);
    let connection = Arc::new(Connection::new(id, session.id.clone(), tx));

    let total = {
        let mut connections = state
            .connections
            .lock()
            .expect("connection map lock poisoned");
        connections.insert(id, connection.clone());
        connections.len()
    };

    connection.set_state(ConnState::Open);

    info!(connection = id, total = total, "client connected");

    // All writes funnel through one task so concurrent batch responses and
    // broadcasts never interleave on the sink
    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // Each frame dispatches as its own task; a slow handler in
                // one frame must not hold up later frames on the connection
                spawn_frame(&state, &connection, text);
            }
            Ok(Message::Binary(_)) => {
                connection.send_text(binary_rejection());
            }
            Ok(Message::Close(_)) => {
                connection.set_state(ConnState::Closing);
                debug!(connection = id, "client closed connection");
                break;
            }
            Err(e) => {
                warn!(connection = id, error = %e, "websocket error");
                break;
            }
            _ => {}
        }
    }

    connection.set_state(ConnState::Closed);

    let remaining = {
        let mut connections = state
            .connections
            .lock()
            .expect("connection map lock poisoned");
        connections.remove(&id);
        connections.len()
    };

    write_task.abort();

    info!(connection = id, remaining = remaining, "client disconnected");
}

/// Dispatch one inbound frame independently and flush its reply
///
/// Replies from concurrent frames may interleave on the connection, but each
/// reply is a single write through the writer channel, never split.
fn spawn_frame(state: &Arc<WsState>, connection: &Arc<Connection>, text: String) {
    let state = state.clone();
    let connection = connection.clone();

    tokio::spawn(async move {
        let reply = handle_frame(&state, &connection, &text).await;
        connection.send_text(reply);
    });
}

fn binary_rejection() -> String {
    serialize_response(&RpcResponse::failure(
        Value::Null,
        &ApiError::invalid_request("Binary messages not supported"),
    ))
}

/// Process one text frame: a single call or a batch
///
/// All sub-requests of a batch dispatch concurrently; the combined reply is
/// flushed only once every one of them has reached a terminal state, in the
/// order they arrived.
#[instrument(skip_all, fields(connection = connection.id))]
async fn handle_frame(
    state: &Arc<WsState>,
    connection: &Arc<Connection>,
    text: &str,
) -> String {
    let payload: Value = match serde_json::from_str(text) {
        Ok(payload) => payload,
        Err(e) => {
            return serialize_response(&RpcResponse::failure(
                Value::Null,
                &ApiError::parse_error(format!("Parsing request JSON failed ({})", e)),
            ));
        }
    };

    let reply = match payload {
        Value::Array(items) => {
            if items.is_empty() {
                return serialize_response(&RpcResponse::failure(
                    Value::Null,
                    &ApiError::invalid_request("Empty batch"),
                ));
            }

            let calls = items
                .into_iter()
                .map(|item| dispatch_call(state, connection, item));
            let responses = join_all(calls).await;

            serde_json::to_string(&responses).unwrap_or_else(|e| {
                serialize_response(&RpcResponse::failure(
                    Value::Null,
                    &ApiError::internal(format!(
                        "Stringifying batch request response failed ({})",
                        e
                    )),
                ))
            })
        }
        item @ Value::Object(_) => serialize_response(&dispatch_call(state, connection, item).await),
        _ => serialize_response(&RpcResponse::failure(
            Value::Null,
            &ApiError::invalid_request("JSON object or array expected"),
        )),
    };

    if state.config.simulate_latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.config.simulate_latency_ms)).await;
    }

    reply
}

/// Dispatch one sub-request to its handler and settle it exactly once
async fn dispatch_call(
    state: &Arc<WsState>,
    connection: &Arc<Connection>,
    payload: Value,
) -> RpcResponse {
    let id = payload.get("id").cloned().unwrap_or(Value::Null);

    let fields = match payload.as_object() {
        Some(fields) => fields,
        None => {
            return RpcResponse::failure(
                id,
                &ApiError::invalid_request("Expected a request object"),
            );
        }
    };

    let method = match fields.get("method").and_then(Value::as_str) {
        Some(method) if !method.is_empty() => method,
        _ => {
            return RpcResponse::failure(
                id,
                &ApiError::invalid_request(
                    "Expected \"method\" argument to be a non-empty string",
                ),
            );
        }
    };

    debug!(connection = connection.id, method = %method, "dispatching call");

    let descriptor = match state.registry.find_by_method(method) {
        Some(descriptor) => descriptor,
        None => return RpcResponse::failure(id, &ApiError::method_not_found(method)),
    };

    let params = match fields.get("params").and_then(Value::as_object) {
        Some(params) => params,
        None => {
            return RpcResponse::failure(
                id,
                &ApiError::invalid_params(format!(
                    "Expected an object with keys: {}",
                    descriptor.argument_names.join(", ")
                )),
            );
        }
    };

    // Missing required parameters are rejected, consistent with REST
    let mut args = Vec::with_capacity(descriptor.argument_names.len());
    for name in &descriptor.argument_names {
        match params.get(name) {
            Some(value) => args.push(value.clone()),
            None => {
                return RpcResponse::failure(
                    id,
                    &ApiError::invalid_params(format!("Missing argument \"{}\"", name)),
                );
            }
        }
    }

    // The attached session can expire while the connection idles
    let session = match state.sessions.validate(&connection.session_id) {
        Ok(session) => session,
        Err(e) => return RpcResponse::failure(id, &e),
    };

    let ctx = CallContext::new(session, Transport::Websocket)
        .with_connection(connection.clone())
        .with_siblings(
            state
                .links
                .get(&descriptor.namespace)
                .cloned()
                .unwrap_or_default(),
        );

    let handler = descriptor.handler.clone();
    let timeout = Duration::from_millis(state.config.request_timeout_ms);

    let settled =
        invoke_with_timeout(async move { handler.invoke(args, ctx).await }, timeout).await;

    match settled {
        Settled::TimedOut => RpcResponse::failure(
            id,
            &ApiError::internal(format!(
                "Request timed out after {}ms",
                state.config.request_timeout_ms
            )),
        ),
        // A delegated outcome has no value to return on this transport, but
        // the batch slot still needs a terminal entry
        Settled::Finished(Ok(Outcome::Delegated(_))) => RpcResponse::success(id, Value::Null),
        Settled::Finished(Ok(Outcome::Value(value))) => RpcResponse::success(id, value),
        Settled::Finished(Err(e)) => RpcResponse::failure(id, &e),
    }
}

fn serialize_response(response: &RpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| {
        // Fallback shape mirrors RpcResponse::failure for INTERNAL_ERROR
        r#"{"jsonrpc":"2.0","id":null,"code":-32603,"status":500,"error":"INTERNAL_ERROR","message":"Stringifying request response failed"}"#
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{method, MethodDef};
    use serde_json::json;
    use std::time::Instant;

    struct TestApi;

    impl ApiService for TestApi {
        fn methods(&self) -> Vec<MethodDef> {
            vec![
                MethodDef {
                    member: "getAdd",
                    params: &["a", "b", "session"],
                    handler: method(|args, _ctx| async move {
                        let a = args[0].as_i64().unwrap_or(0);
                        let b = args[1].as_i64().unwrap_or(0);
                        Ok(Outcome::Value(json!(a + b)))
                    }),
                },
                MethodDef {
                    member: "getSlow",
                    params: &[],
                    handler: method(|_args, _ctx| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Outcome::Value(json!("slow done")))
                    }),
                },
                MethodDef {
                    member: "getFailSync",
                    params: &[],
                    handler: method(|_args, _ctx| async {
                        Err(ApiError::invalid_parameter("equivalent failure"))
                    }),
                },
                MethodDef {
                    member: "getFailAsync",
                    params: &[],
                    handler: method(|_args, _ctx| async {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Err(ApiError::invalid_parameter("equivalent failure"))
                    }),
                },
            ]
        }
    }

    fn make_state(timeout_ms: u64) -> Arc<WsState> {
        let mut registry = HandlerRegistry::new();
        registry.register_api("test", Arc::new(TestApi));
        let registry = Arc::new(registry);
        let links = Arc::new(registry.cross_link());

        Arc::new(WsState {
            registry,
            sessions: Arc::new(SessionStore::new()),
            links,
            connections: Mutex::new(HashMap::new()),
            connection_counter: AtomicU64::new(0),
            config: WsConfig {
                request_timeout_ms: timeout_ms,
                ..Default::default()
            },
        })
    }

    fn make_connection(
        state: &Arc<WsState>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = state.sessions.create(None);
        let connection = Arc::new(Connection::new(0, session.id, tx));
        connection.set_state(ConnState::Open);
        (connection, rx)
    }

    async fn frame(state: &Arc<WsState>, connection: &Arc<Connection>, text: &str) -> Value {
        let reply = handle_frame(state, connection, text).await;
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_json_yields_parse_error() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let reply = frame(&state, &connection, "{not json").await;
        assert_eq!(reply["code"], -32700);
        assert_eq!(reply["error"], "PARSE_ERROR");
        assert_eq!(reply["id"], json!(null));
    }

    #[tokio::test]
    async fn test_non_object_frame_is_invalid_request() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let reply = frame(&state, &connection, "42").await;
        assert_eq!(reply["code"], -32600);
        assert_eq!(reply["error"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_binary_frames_are_rejected() {
        let reply: Value = serde_json::from_str(&binary_rejection()).unwrap();
        assert_eq!(reply["code"], -32600);
        assert_eq!(reply["message"], "Binary messages not supported");
    }

    #[tokio::test]
    async fn test_missing_method_is_invalid_request() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let reply = frame(&state, &connection, r#"{"jsonrpc":"2.0","id":1}"#).await;
        assert_eq!(reply["code"], -32600);
        assert_eq!(reply["id"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_method_not_found() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let reply = frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":1,"method":"test.nope","params":{}}"#,
        )
        .await;
        assert_eq!(reply["code"], -32601);
        assert_eq!(reply["error"], "METHOD_NOT_FOUND");
        assert_eq!(reply["status"], 404);
    }

    #[tokio::test]
    async fn test_array_params_are_invalid() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let reply = frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":1,"method":"test.add","params":[2,3]}"#,
        )
        .await;
        assert_eq!(reply["code"], -32602);
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .contains("Expected an object with keys: a, b"));
    }

    #[tokio::test]
    async fn test_missing_argument_is_invalid_params() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let reply = frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":1,"method":"test.add","params":{"a":2}}"#,
        )
        .await;
        assert_eq!(reply["code"], -32602);
        assert_eq!(reply["error"], "INVALID_PARAMS");
        assert_eq!(reply["message"], "Missing argument \"b\"");
    }

    #[tokio::test]
    async fn test_single_call_returns_single_response() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let reply = frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":9,"method":"test.add","params":{"a":2,"b":3}}"#,
        )
        .await;
        assert_eq!(reply, json!({"jsonrpc":"2.0","id":9,"result":5}));
    }

    #[tokio::test]
    async fn test_bare_method_name_resolves_across_namespaces() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let reply = frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":1,"method":"add","params":{"a":1,"b":1}}"#,
        )
        .await;
        assert_eq!(reply["result"], json!(2));
    }

    #[tokio::test]
    async fn test_batch_preserves_order_with_timed_out_member() {
        let state = make_state(30);
        let (connection, _rx) = make_connection(&state);

        let batch = r#"[
            {"jsonrpc":"2.0","id":1,"method":"test.add","params":{"a":1,"b":1}},
            {"jsonrpc":"2.0","id":2,"method":"test.slow","params":{}},
            {"jsonrpc":"2.0","id":3,"method":"test.add","params":{"a":2,"b":2}}
        ]"#;

        let reply = frame(&state, &connection, batch).await;
        let responses = reply.as_array().unwrap();
        assert_eq!(responses.len(), 3);

        assert_eq!(responses[0]["id"], json!(1));
        assert_eq!(responses[0]["result"], json!(2));

        assert_eq!(responses[1]["id"], json!(2));
        assert_eq!(responses[1]["code"], -32603);
        assert_eq!(responses[1]["error"], "INTERNAL_ERROR");
        assert_eq!(responses[1]["message"], "Request timed out after 30ms");

        assert_eq!(responses[2]["id"], json!(3));
        assert_eq!(responses[2]["result"], json!(4));
    }

    #[tokio::test]
    async fn test_batch_members_dispatch_concurrently() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let batch = r#"[
            {"jsonrpc":"2.0","id":1,"method":"test.slow","params":{}},
            {"jsonrpc":"2.0","id":2,"method":"test.slow","params":{}}
        ]"#;

        let started = Instant::now();
        let reply = frame(&state, &connection, batch).await;
        let elapsed = started.elapsed();

        assert_eq!(reply.as_array().unwrap().len(), 2);
        // Two 100ms handlers fanned out together, not serially
        assert!(elapsed < Duration::from_millis(180), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_sync_and_async_failures_have_identical_shape() {
        let state = make_state(1_000);
        let (connection, _rx) = make_connection(&state);

        let sync_reply = frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":1,"method":"test.fail-sync","params":{}}"#,
        )
        .await;
        let async_reply = frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":1,"method":"test.fail-async","params":{}}"#,
        )
        .await;

        // Identical envelopes apart from the captured traces
        for field in ["jsonrpc", "id", "code", "status", "error", "message"] {
            assert_eq!(sync_reply[field], async_reply[field], "field {}", field);
        }
        assert!(sync_reply["trace"].is_string());
        assert!(async_reply["trace"].is_string());
        assert_eq!(sync_reply["status"], 400);
    }

    #[tokio::test]
    async fn test_slow_frame_does_not_block_later_frames() {
        let state = make_state(1_000);
        let (connection, mut rx) = make_connection(&state);

        spawn_frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":1,"method":"test.slow","params":{}}"#.to_string(),
        );
        spawn_frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":2,"method":"test.add","params":{"a":1,"b":1}}"#.to_string(),
        );

        // The fast call answers first even though its frame arrived second
        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let first: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(first["id"], json!(2));
        assert_eq!(first["result"], json!(2));

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let second: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(second["id"], json!(1));
        assert_eq!(second["result"], json!("slow done"));
    }

    #[tokio::test]
    async fn test_lost_session_fails_the_call() {
        let state = make_state(1_000);
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::new(0, "gone".to_string(), tx));
        connection.set_state(ConnState::Open);

        let reply = frame(
            &state,
            &connection,
            r#"{"jsonrpc":"2.0","id":1,"method":"test.add","params":{"a":1,"b":1}}"#,
        )
        .await;

        assert_eq!(reply["error"], "SESSION_NOT_FOUND");
        assert_eq!(reply["status"], 404);
        assert_eq!(reply["code"], -32603);
    }

    #[tokio::test]
    async fn test_send_refused_when_connection_not_open() {
        let state = make_state(1_000);
        let (connection, mut rx) = make_connection(&state);

        connection.set_state(ConnState::Closed);
        assert!(!connection.send_text("hello".to_string()));
        assert!(!connection.is_open());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_open_connections_with_fresh_ids() {
        let state = make_state(1_000);
        let dispatcher = RpcDispatcher {
            state: state.clone(),
        };

        let (first, mut first_rx) = make_connection(&state);
        let (second, mut second_rx) = make_connection(&state);
        state
            .connections
            .lock()
            .unwrap()
            .extend([(0, first.clone()), (1, second.clone())]);

        dispatcher.broadcast("news.update", json!({"title": "hi"}));
        dispatcher.broadcast("news.update", json!({"title": "again"}));

        for rx in [&mut first_rx, &mut second_rx] {
            let Message::Text(text) = rx.try_recv().unwrap() else {
                panic!("expected text frame");
            };
            let push: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(push["jsonrpc"], "2.0");
            assert_eq!(push["id"], json!(0));
            assert_eq!(push["method"], "news.update");

            let Message::Text(text) = rx.try_recv().unwrap() else {
                panic!("expected text frame");
            };
            let push: Value = serde_json::from_str(&text).unwrap();
            // Per-connection outbound counter advanced independently
            assert_eq!(push["id"], json!(1));
        }
    }
}
