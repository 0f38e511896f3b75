/// REST dispatch engine with graceful shutdown
/// Routes are derived from the registry's shadowed lookup table; every
/// request resolves a session, binds and coerces arguments, and produces
/// exactly one terminal response
use crate::coerce;
use crate::errors::ApiError;
use crate::registry::{
    ApiService, CallContext, HandlerDescriptor, HandlerRegistry, Outcome, RawResponse, Transport,
    Verb,
};
use crate::server::{invoke_with_timeout, Settled};
use crate::session::SessionStore;
use axum::{
    extract::{DefaultBodyLimit, Json, Path},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Name of the session continuity cookie
const SESSION_COOKIE: &str = "sessionId";

/// REST transport configuration
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub bind_host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
    /// Fixed artificial latency applied before flushing envelopes
    pub simulate_latency_ms: u64,
    /// Chaos-testing hook: percentage of requests that fail synthetically
    pub simulate_error_rate_percentage: f64,
    pub max_concurrency: usize,
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    pub cors_allow_origins: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_ms: 10_000,
            simulate_latency_ms: 0,
            simulate_error_rate_percentage: 0.0,
            max_concurrency: 100,
            rate_limit_rps: 50,
            rate_limit_burst: 100,
            cors_allow_origins: "*".to_string(),
        }
    }
}

/// Shared per-request dispatch state
#[derive(Clone)]
struct RestState {
    sessions: Arc<SessionStore>,
    links: Arc<HashMap<String, Arc<HashMap<String, Arc<dyn ApiService>>>>>,
    config: Arc<RestConfig>,
}

/// Where the declared arguments of one request come from
enum ArgSource {
    /// GET-like verbs: one path segment per argument
    Path(HashMap<String, String>),
    /// POST: all arguments in the JSON body
    Body(Option<Value>),
}

/// REST dispatch engine bound to one handler registry
pub struct RestDispatcher {
    state: RestState,
    router: Router,
}

impl RestDispatcher {
    pub fn new(
        registry: &HandlerRegistry,
        sessions: Arc<SessionStore>,
        config: RestConfig,
    ) -> Self {
        let state = RestState {
            sessions,
            links: Arc::new(registry.cross_link()),
            config: Arc::new(config),
        };

        let mut router = Router::new();

        // Route resolution follows the shadowed lookup table: the latest
        // registration of a (namespace, verb, name) triple wins
        for descriptor in registry.routable() {
            let handler_state = state.clone();
            let handler_descriptor = descriptor.clone();

            router = match descriptor.verb {
                // Shorter prefixes of the argument segments are routed too,
                // so a request missing a trailing argument reaches binding
                // and fails with INVALID_PARAMETER instead of a router 404
                Verb::Get => {
                    let mut router = router;
                    for route in get_route_prefixes(&descriptor) {
                        let handler_state = handler_state.clone();
                        let handler_descriptor = handler_descriptor.clone();
                        router = router.route(
                            &route,
                            get(move |Path(params): Path<HashMap<String, String>>,
                                      headers: HeaderMap| {
                                dispatch(
                                    handler_state.clone(),
                                    handler_descriptor.clone(),
                                    ArgSource::Path(params),
                                    headers,
                                )
                            }),
                        );
                    }
                    router
                }
                Verb::Post => router.route(
                    &descriptor.route,
                    post(move |headers: HeaderMap, body: Option<Json<Value>>| {
                        dispatch(
                            handler_state.clone(),
                            handler_descriptor.clone(),
                            ArgSource::Body(body.map(|Json(value)| value)),
                            headers,
                        )
                    }),
                ),
            };
        }

        let health_sessions = state.sessions.clone();
        router = router.route(
            "/health",
            get(move || {
                let sessions = health_sessions.clone();
                async move {
                    Json(json!({
                        "status": "healthy",
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                        "sessions": sessions.count(),
                    }))
                }
            }),
        );

        Self { state, router }
    }

    /// The bare dispatch router, without middleware (used by tests)
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Start the server with the full middleware stack and graceful shutdown
    pub async fn serve(&self) -> anyhow::Result<()> {
        let config = &self.state.config;

        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .key_extractor(SmartIpKeyExtractor)
                .per_second(config.rate_limit_rps.into())
                .burst_size(config.rate_limit_burst)
                .finish()
                .ok_or_else(|| anyhow::anyhow!("Failed to build rate limiter config"))?,
        );

        let router = self
            .router
            .clone()
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB request size limit
            .layer(GovernorLayer {
                config: governor_conf,
            })
            .layer(cors_layer(&config.cors_allow_origins)?)
            .layer(ConcurrencyLimitLayer::new(config.max_concurrency))
            .layer(SetResponseHeaderLayer::overriding(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::X_FRAME_OPTIONS,
                HeaderValue::from_static("DENY"),
            ))
            .layer(TraceLayer::new_for_http());

        let addr = format!("{}:{}", config.bind_host, config.port);
        info!("Starting REST server on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to address {}: {}", addr, e))?;

        info!("REST server listening on {}", addr);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("REST server shutdown completed");
        Ok(())
    }
}

/// The full GET route plus one variant per shorter argument prefix
fn get_route_prefixes(descriptor: &HandlerDescriptor) -> Vec<String> {
    let base = format!("/{}/{}", descriptor.namespace, descriptor.name);

    (0..=descriptor.argument_names.len())
        .map(|count| {
            let mut route = base.clone();
            for name in &descriptor.argument_names[..count] {
                route.push_str("/:");
                route.push_str(name);
            }
            route
        })
        .collect()
}

/// Build the CORS layer from configured origins (CSV or "*")
fn cors_layer(cors_allow_origins: &str) -> anyhow::Result<CorsLayer> {
    if cors_allow_origins.trim() == "*" {
        Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any))
    } else {
        let origins: Vec<HeaderValue> = cors_allow_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid CORS origin value: {}", e))?;

        Ok(CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any))
    }
}

/// Per-request dispatch: session, binding, invocation, envelope
#[instrument(skip_all, fields(route = %descriptor.route, verb = descriptor.verb.as_str()))]
async fn dispatch(
    state: RestState,
    descriptor: Arc<HandlerDescriptor>,
    source: ArgSource,
    headers: HeaderMap,
) -> Response {
    let (session, set_cookie) = resolve_session(&state, &headers);

    // The first missing argument fails the request before invocation
    let args = match bind_arguments(&descriptor, source) {
        Ok(args) => args,
        Err(e) => return error_response(&e, &set_cookie),
    };

    let args: Vec<Value> = args.into_iter().map(coerce::normalize).collect();

    let config = state.config.clone();

    if config.simulate_error_rate_percentage > 0.0
        && rand::thread_rng().gen_range(0.0..100.0) < config.simulate_error_rate_percentage
    {
        let e = ApiError::internal(format!(
            "simulated error at {}% rate",
            config.simulate_error_rate_percentage
        ));
        return error_response(&e, &set_cookie);
    }

    let ctx = CallContext::new(session, Transport::Rest).with_siblings(
        state
            .links
            .get(&descriptor.namespace)
            .cloned()
            .unwrap_or_default(),
    );

    let handler = descriptor.handler.clone();
    let timeout = Duration::from_millis(config.request_timeout_ms);

    let settled =
        invoke_with_timeout(async move { handler.invoke(args, ctx).await }, timeout).await;

    match settled {
        Settled::TimedOut => {
            // Timeout responses flush immediately, bypassing latency shaping
            let e = ApiError::internal(format!(
                "request timed out after {}ms",
                config.request_timeout_ms
            ));
            error_response(&e, &set_cookie)
        }
        Settled::Finished(Ok(Outcome::Delegated(raw))) => {
            // The handler wrote the response itself; the timer was already
            // cancelled by settling, so only the cookie is still ours
            with_cookie(raw_response(raw), &set_cookie)
        }
        Settled::Finished(Ok(Outcome::Value(value))) => {
            apply_latency(&config).await;

            if value.is_null() || value == Value::Bool(false) {
                return error_response(&ApiError::not_found(""), &set_cookie);
            }

            with_cookie((StatusCode::OK, Json(value)).into_response(), &set_cookie)
        }
        Settled::Finished(Err(e)) => {
            error!(
                route = %descriptor.route,
                kind = %e.kind.name(),
                error = %e.message,
                "request failed"
            );

            apply_latency(&config).await;
            error_response(&e, &set_cookie)
        }
    }
}

async fn apply_latency(config: &RestConfig) {
    if config.simulate_latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(config.simulate_latency_ms)).await;
    }
}

/// Resolve the request session from the cookie, creating one when the cookie
/// is absent or no longer valid; a fresh session is echoed back as a cookie
fn resolve_session(
    state: &RestState,
    headers: &HeaderMap,
) -> (crate::session::Session, Option<String>) {
    if let Some(id) = session_cookie(headers) {
        if let Some(session) = state.sessions.get(&id, true) {
            return (session, None);
        }
    }

    let session = state.sessions.create(None);
    let cookie = format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, session.id);

    (session, Some(cookie))
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, id)| id.to_string())
}

/// Bind declared arguments in order from their transport-specific source
fn bind_arguments(
    descriptor: &HandlerDescriptor,
    source: ArgSource,
) -> Result<Vec<Value>, ApiError> {
    match source {
        ArgSource::Path(params) => descriptor
            .argument_names
            .iter()
            .map(|name| {
                params
                    .get(name)
                    .cloned()
                    .map(Value::String)
                    .ok_or_else(|| missing_argument(name))
            })
            .collect(),
        ArgSource::Body(body) => {
            let empty = serde_json::Map::new();
            let fields = body
                .as_ref()
                .and_then(Value::as_object)
                .unwrap_or(&empty);

            descriptor
                .argument_names
                .iter()
                .map(|name| fields.get(name).cloned().ok_or_else(|| missing_argument(name)))
                .collect()
        }
    }
}

fn missing_argument(name: &str) -> ApiError {
    ApiError::invalid_parameter(format!("Missing argument \"{}\"", name))
}

/// Failure envelope: HTTP status from the error kind, body with exactly
/// kind, message and trace
fn error_response(e: &ApiError, set_cookie: &Option<String>) -> Response {
    let status =
        StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let body = json!({
        "error": e.kind.name(),
        "message": e.message,
        "trace": e.trace,
    });

    with_cookie((status, Json(body)).into_response(), set_cookie)
}

fn raw_response(raw: RawResponse) -> Response {
    let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::OK);

    match HeaderValue::from_str(&raw.content_type) {
        Ok(content_type) => {
            (status, [(header::CONTENT_TYPE, content_type)], raw.body).into_response()
        }
        Err(_) => (status, raw.body).into_response(),
    }
}

fn with_cookie(mut response: Response, set_cookie: &Option<String>) -> Response {
    if let Some(cookie) = set_cookie {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }

    response
}

/// Graceful shutdown signal handler
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }

    warn!("Shutdown signal received, starting graceful shutdown");
}
