pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod model;
pub mod notifier;
pub mod probe;
pub mod protocol;
pub mod roles;
pub mod storage;
pub mod targets;
pub mod util;

use std::io::IsTerminal;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `token` on Ctrl-C, or when `exit`/`shutdown` is typed on stdin
pub fn spawn_shutdown_listener(token: CancellationToken) {
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl-C, shutting down");
                ctrl_c.cancel();
            }
            Err(e) => warn!("cannot listen for Ctrl-C: {e}"),
        }
    });

    if !std::io::stdin().is_terminal() {
        return;
    }

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if matches!(line.trim().to_lowercase().as_str(), "exit" | "shutdown") {
                info!("shutdown requested from console");
                token.cancel();
                break;
            }
        }
    });
}
