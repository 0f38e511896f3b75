/// Transport dispatch engines
/// REST and WebSocket share one timeout/at-most-once implementation
pub mod rest;
pub mod rpc;
pub mod ws;

// Re-export for convenience
pub use rest::RestDispatcher;
pub use ws::RpcDispatcher;

use crate::errors::ApiError;
use crate::registry::Outcome;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Terminal state of one dispatched call
pub(crate) enum Settled {
    Finished(Result<Outcome, ApiError>),
    TimedOut,
}

/// Race a handler invocation against its timeout timer
///
/// The handler runs as its own task and is never interrupted: when the timer
/// fires first the task is detached and its eventual settlement is observed
/// and discarded, so exactly one terminal outcome is ever produced per call.
/// A panicking handler settles as an internal error, identical in shape to a
/// returned error.
pub(crate) async fn invoke_with_timeout(
    fut: impl Future<Output = Result<Outcome, ApiError>> + Send + 'static,
    timeout: Duration,
) -> Settled {
    let mut task = tokio::spawn(fut);

    tokio::select! {
        settled = &mut task => {
            let result = match settled {
                Ok(result) => result,
                Err(join_error) => Err(ApiError::internal(format!(
                    "handler aborted: {}",
                    join_error
                ))),
            };

            Settled::Finished(result)
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "request time out");

            // Response path is cancelled; the handler itself keeps running
            tokio::spawn(async move {
                match task.await {
                    Ok(_) => debug!("late settlement after timeout, discarding"),
                    Err(_) => debug!("handler aborted after timeout"),
                }
            });

            Settled::TimedOut
        }
    }
}
