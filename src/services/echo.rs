/// Echo service implementation
/// Single Responsibility: Exercise argument binding, coercion, session
/// updates and pushes
use crate::errors::ApiError;
use crate::registry::{method, ApiService, MethodDef, Outcome};
use crate::session::SessionStore;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

pub struct EchoService {
    sessions: Arc<SessionStore>,
}

impl EchoService {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

impl ApiService for EchoService {
    fn methods(&self) -> Vec<MethodDef> {
        let sessions = self.sessions.clone();

        vec![
            MethodDef {
                member: "getSum",
                params: &["a", "b", "session"],
                handler: method(|args, _ctx| async move { sum(&args[0], &args[1]) }),
            },
            // Persists the message on the caller's session, so handlers that
            // only hold a snapshot still write through the store
            MethodDef {
                member: "postMessage",
                params: &["text", "session"],
                handler: method(move |args, ctx| {
                    let sessions = sessions.clone();
                    async move {
                        let text = args[0]
                            .as_str()
                            .ok_or_else(|| {
                                ApiError::invalid_parameter("Expected \"text\" to be a string")
                            })?
                            .to_string();

                        let mut fields = Map::new();
                        fields.insert("lastMessage".to_string(), json!(text));
                        let session = sessions.update(&ctx.session.id, fields)?;

                        Ok(Outcome::Value(json!({
                            "message": text,
                            "session": session.id,
                        })))
                    }
                }),
            },
            // Pushes a server-initiated notification back over the calling
            // connection; a no-op on connectionless transports
            MethodDef {
                member: "postNotify",
                params: &["text", "session"],
                handler: method(|args, ctx| async move {
                    let delivered = match &ctx.connection {
                        Some(connection) if connection.is_open() => {
                            debug!("pushing notification to caller");
                            connection.request("echo.notified", json!({"text": args[0]}));
                            true
                        }
                        _ => false,
                    };

                    Ok(Outcome::Value(json!({"delivered": delivered})))
                }),
            },
            // Always resolves to nothing, so the REST transport answers 404
            MethodDef {
                member: "getMissing",
                params: &[],
                handler: method(|_args, _ctx| async { Ok(Outcome::Value(Value::Null)) }),
            },
        ]
    }
}

fn sum(a: &Value, b: &Value) -> Result<Outcome, ApiError> {
    // Integer arguments stay integral in the reply
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return Ok(Outcome::Value(json!(a + b)));
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(Outcome::Value(json!(a + b))),
        _ => Err(ApiError::invalid_parameter(
            "Expected \"a\" and \"b\" to be numbers",
        )),
    }
}
