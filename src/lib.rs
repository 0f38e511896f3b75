/// Dual-transport API server library
/// One handler registry served over REST and WebSocket JSON-RPC
use std::fmt;

pub mod coerce;
pub mod errors;
pub mod registry;
pub mod server;
pub mod services;
pub mod session;

// Re-export key types for public API
pub use errors::{ApiError, ErrorKind};
pub use registry::{ApiService, CallContext, HandlerRegistry, MethodDef, Outcome};
pub use server::rest::RestConfig;
pub use server::ws::WsConfig;
pub use server::{RestDispatcher, RpcDispatcher};
pub use session::{Session, SessionStore};

/// Library configuration
#[derive(Clone)]
pub struct Config {
    pub server_host: String,
    pub rest_port: u16,
    pub ws_port: u16,
    pub log_level: String,
    // Dispatch behavior
    pub request_timeout_ms: u64,
    pub simulate_latency_ms: u64,
    pub simulate_error_rate_percentage: f64,
    // HTTP and rate limiting config
    pub http_max_concurrency: usize,
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    pub cors_allow_origins: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_host", &self.server_host)
            .field("rest_port", &self.rest_port)
            .field("ws_port", &self.ws_port)
            .field("log_level", &self.log_level)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("simulate_latency_ms", &self.simulate_latency_ms)
            .field(
                "simulate_error_rate_percentage",
                &self.simulate_error_rate_percentage,
            )
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            rest_port: 8080,
            ws_port: 8081,
            log_level: "info".to_string(),
            request_timeout_ms: 10_000,
            simulate_latency_ms: 0,
            simulate_error_rate_percentage: 0.0,
            http_max_concurrency: 100,
            rate_limit_rps: 50,
            rate_limit_burst: 100,
            cors_allow_origins: "*".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    ///
    /// Every variable is optional; absent values fall back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let server_host =
            std::env::var("SERVER_HOST").unwrap_or_else(|_| defaults.server_host.clone());

        let rest_port = match std::env::var("REST_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid REST_PORT value"))?,
            Err(_) => defaults.rest_port,
        };

        let ws_port = match std::env::var("WS_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid WS_PORT value"))?,
            Err(_) => defaults.ws_port,
        };

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| defaults.log_level.clone());

        let request_timeout_ms = std::env::var("REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.request_timeout_ms);

        let simulate_latency_ms = std::env::var("SIMULATE_LATENCY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.simulate_latency_ms);

        let simulate_error_rate_percentage = std::env::var("SIMULATE_ERROR_RATE_PERCENTAGE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(defaults.simulate_error_rate_percentage);

        let http_max_concurrency = std::env::var("HTTP_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.http_max_concurrency);

        let rate_limit_rps = std::env::var("RATE_LIMIT_RPS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.rate_limit_rps);

        let rate_limit_burst = std::env::var("RATE_LIMIT_BURST")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.rate_limit_burst);

        let cors_allow_origins = std::env::var("CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|_| defaults.cors_allow_origins.clone());

        Ok(Self {
            server_host,
            rest_port,
            ws_port,
            log_level,
            request_timeout_ms,
            simulate_latency_ms,
            simulate_error_rate_percentage,
            http_max_concurrency,
            rate_limit_rps,
            rate_limit_burst,
            cors_allow_origins,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_host.trim().is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.rest_port == 0 {
            return Err(anyhow::anyhow!("REST port must be greater than 0"));
        }
        if self.ws_port == 0 {
            return Err(anyhow::anyhow!("WebSocket port must be greater than 0"));
        }
        if self.rest_port == self.ws_port {
            return Err(anyhow::anyhow!(
                "REST_PORT and WS_PORT must not be the same port"
            ));
        }

        if self.request_timeout_ms == 0 || self.request_timeout_ms > 300_000 {
            return Err(anyhow::anyhow!(
                "REQUEST_TIMEOUT_MS must be between 1 and 300000"
            ));
        }

        if !(0.0..=100.0).contains(&self.simulate_error_rate_percentage) {
            return Err(anyhow::anyhow!(
                "SIMULATE_ERROR_RATE_PERCENTAGE must be between 0 and 100"
            ));
        }

        if self.http_max_concurrency == 0 || self.http_max_concurrency > 10_000 {
            return Err(anyhow::anyhow!(
                "HTTP max concurrency must be between 1 and 10000"
            ));
        }
        if self.rate_limit_rps == 0 || self.rate_limit_rps > 10_000 {
            return Err(anyhow::anyhow!(
                "RATE_LIMIT_RPS must be between 1 and 10000"
            ));
        }
        if self.rate_limit_burst == 0 || self.rate_limit_burst > 10_000 {
            return Err(anyhow::anyhow!(
                "RATE_LIMIT_BURST must be between 1 and 10000"
            ));
        }

        // CORS origins basic validation (non-empty)
        if self.cors_allow_origins.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "CORS_ALLOW_ORIGINS cannot be empty (use * or CSV list)"
            ));
        }

        Ok(())
    }

    /// REST transport configuration derived from the top-level config
    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            bind_host: self.server_host.clone(),
            port: self.rest_port,
            request_timeout_ms: self.request_timeout_ms,
            simulate_latency_ms: self.simulate_latency_ms,
            simulate_error_rate_percentage: self.simulate_error_rate_percentage,
            max_concurrency: self.http_max_concurrency,
            rate_limit_rps: self.rate_limit_rps,
            rate_limit_burst: self.rate_limit_burst,
            cors_allow_origins: self.cors_allow_origins.clone(),
        }
    }

    /// WebSocket transport configuration derived from the top-level config
    pub fn ws_config(&self) -> WsConfig {
        WsConfig {
            bind_host: self.server_host.clone(),
            port: self.ws_port,
            request_timeout_ms: self.request_timeout_ms,
            simulate_latency_ms: self.simulate_latency_ms,
        }
    }
}
