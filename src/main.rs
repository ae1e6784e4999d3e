mod backlog;
mod config;
mod db;
mod effective;
mod error;
mod grading;
mod ipc;
mod logging;
mod records;
mod results;
mod views;

use anyhow::Context;
use clap::Parser;
use std::io::{self, BufRead, Write};
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    let config = config::Config::parse();
    logging::init_tracing(&config.log_level);

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };
    if let Some(path) = &config.workspace {
        let conn = db::open_db(path)
            .with_context(|| format!("failed to open workspace {}", path.display()))?;
        state.db = Some(conn);
        state.workspace = Some(path.clone());
        info!(workspace = %path.display(), "workspace opened at startup");
    }
    info!(version = env!("CARGO_PKG_VERSION"), "recordsd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                warn!(error = %e, "unparseable request line");
                ipc::bad_json(e.to_string())
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    if let Some(conn) = state.db.take() {
        if let Err((_, e)) = conn.close() {
            warn!(error = %e, "database close failed");
        }
    }
    info!("stdin closed, shutting down");
    Ok(())
}
