// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod listener;

use anyhow::{Context, Result};
use clap::Parser;
use leshy_core::{
    config::{Config, RawConfig},
    pipeline::Pipeline,
    route::{NetlinkBackend, RouteController},
};
use log::*;
use simple_logger::SimpleLogger;
use std::{path::PathBuf, sync::Arc};
use tokio::signal::unix::{signal, SignalKind};

/// Split-horizon DNS forwarder with on-demand route installation for VPN
/// split-tunneling.
#[derive(Parser, Debug)]
#[clap(name = "leshy", version)]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    SimpleLogger::new()
        .env()
        .init()
        .context("failed to initialize the logger")?;

    let cli = Cli::parse();
    let raw_yaml = tokio::fs::read_to_string(&cli.config)
        .await
        .with_context(|| format!("reading configuration file {}", cli.config.display()))?;
    let raw: RawConfig = serde_yaml::from_str(&raw_yaml)?;
    let config = Config::compile(raw)?;

    let backend = NetlinkBackend::new().context("opening a netlink socket")?;
    let routes = Arc::new(RouteController::new(backend, config.aggregation_prefix));
    for route in &config.static_routes {
        routes.add_static(route).await;
    }

    let listen = config.listen;
    let pipeline = Arc::new(Pipeline::new(&config, routes.clone()));

    info!("leshy ready, listening on {}", listen);

    let serving = tokio::spawn(listener::run(listen, pipeline));

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = term.recv() => {
            info!("received SIGTERM, shutting down");
        }
        result = serving => {
            result.context("listener task panicked")??;
        }
    }

    routes.shutdown().await;
    Ok(())
}
