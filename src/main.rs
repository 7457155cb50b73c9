// Copyright 2024-2026 David Allison
// All Rights Reserved
// See LICENSE file for licensing information.

use fastipc::{Tower, BROKER_SOCKET_PATH};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = serve() {
        eprintln!("fastipcd: {err}");
        std::process::exit(1);
    }
}

fn serve() -> fastipc::Result<()> {
    let tower = Tower::create(BROKER_SOCKET_PATH)?;
    tracing::info!("listening on {BROKER_SOCKET_PATH}");
    tower.run()
}
