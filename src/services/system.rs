/// System service implementation
/// Single Responsibility: Report server identity, time and liveness
use crate::registry::{method, ApiService, MethodDef, Outcome, RawResponse};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

pub struct SystemService {
    started: DateTime<Utc>,
}

impl SystemService {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
        }
    }
}

impl Default for SystemService {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiService for SystemService {
    fn methods(&self) -> Vec<MethodDef> {
        let started = self.started;

        vec![
            MethodDef {
                member: "getInfo",
                params: &["session"],
                handler: method(move |_args, ctx| async move {
                    debug!(session = %ctx.session.id, "serving server info");

                    let mut peers: Vec<&str> =
                        ctx.siblings.keys().map(String::as_str).collect();
                    peers.sort_unstable();

                    let uptime = (Utc::now() - started).num_seconds().max(0);
                    Ok(Outcome::Value(json!({
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                        "uptimeSeconds": uptime,
                        "peers": peers,
                        "session": ctx.session.id,
                    })))
                }),
            },
            MethodDef {
                member: "getTime",
                params: &[],
                handler: method(|_args, _ctx| async {
                    Ok(Outcome::Value(json!({
                        "now": Utc::now().to_rfc3339(),
                    })))
                }),
            },
            // Produces the transport response itself instead of a JSON value
            MethodDef {
                member: "getStatusText",
                params: &[],
                handler: method(|_args, _ctx| async {
                    Ok(Outcome::Delegated(RawResponse {
                        status: 200,
                        content_type: "text/plain".to_string(),
                        body: "OK".to_string(),
                    }))
                }),
            },
        ]
    }
}
