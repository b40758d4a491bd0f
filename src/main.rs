mod calc;
mod config;
mod db;
mod formula;
mod ipc;
mod roster;
mod score_config;
mod scores;
mod telemetry;

use serde_json::json;
use std::io::{self, BufRead, Write};
use tracing::{debug, error, info};

fn main() {
    let config = match config::DaemonConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("scorebookd: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = telemetry::init(&config.telemetry) {
        eprintln!("scorebookd: {e}");
        std::process::exit(2);
    }

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };
    if let Some(path) = config.workspace.as_ref() {
        // A bad startup workspace is not fatal; the client can select another.
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            error!(target: "scorebook::ipc", workspace = %path.display(), "failed to open startup workspace: {e:#}");
        }
    }
    info!(target: "scorebook::ipc", version = env!("CARGO_PKG_VERSION"), "scorebookd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                debug!(target: "scorebook::ipc", "rejecting malformed request: {e}");
                let resp = json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{resp}");
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!(target: "scorebook::ipc", "stdin closed; exiting");
}
