use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use tracing::{debug, warn};

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    debug!(target: "scorebook::ipc", id = %req.id, method = %req.method, "request");

    let handlers: [fn(&mut AppState, &Request) -> Option<serde_json::Value>; 6] = [
        handlers::core::try_handle,
        handlers::classes::try_handle,
        handlers::students::try_handle,
        handlers::score_config::try_handle,
        handlers::scores::try_handle,
        handlers::reports::try_handle,
    ];
    for handle in handlers {
        if let Some(resp) = handle(state, &req) {
            if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
                let code = resp
                    .pointer("/error/code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                debug!(target: "scorebook::ipc", method = %req.method, code, "request failed");
            }
            return resp;
        }
    }

    warn!(target: "scorebook::ipc", method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
