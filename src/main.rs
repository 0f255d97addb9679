use crate::adapter::OutboundRegistry;
use crate::config::{default_rules, load_config, RawRootCfg};
use crate::dispatch::Dispatching;
use crate::external::{init_tracing, ApiServer};
use crate::proxy::{Dispatcher, HttpInbound, Socks5Inbound, SourceManager, StatCenter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use structopt::StructOpt;

mod adapter;
mod config;
mod dispatch;
mod external;
mod proxy;

#[derive(Debug, StructOpt)]
#[structopt(name = "dualproxy", about = "Loopback HTTP/SOCKS5 forwarding proxy")]
struct Args {
    /// Path of the YAML configuration. Built-in defaults apply when omitted.
    #[structopt(short, long)]
    pub config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::from_args();
    let config = match &args.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Load config from {:?} failed: {}", path, err);
                return ExitCode::from(1);
            }
        },
        None => RawRootCfg::default(),
    };
    init_tracing(&config.log_level);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Tokio failed to initialize: {}", err);
            return ExitCode::from(1);
        }
    };
    let _guard = rt.enter();

    tracing::info!(
        "Starting proxy core on HTTP:{}, SOCKS5:{}, API:{}",
        config.http_port,
        config.socks5_port,
        config.api_port
    );
    tracing::debug!(
        "DNS collaborator config: port={} type={:?} doh={}; OpenVPN helper port={}",
        config.dns_port,
        config.dns_type,
        config.doh_server,
        config.openvpn_port
    );

    let rules = Arc::new(Dispatching::new(default_rules()));
    let registry = Arc::new(OutboundRegistry::new());
    let stats = Arc::new(StatCenter::new());
    let dispatcher = Arc::new(Dispatcher::new(
        rules.clone(),
        registry.clone(),
        stats.clone(),
    ));
    let sources = Arc::new(SourceManager::new(registry.clone(), stats.clone()));

    let http_inbound = match rt.block_on(HttpInbound::new(config.http_port, dispatcher.clone())) {
        Ok(inbound) => inbound,
        Err(err) => {
            eprintln!(
                "Failed to bind HTTP listener on port {}: {}",
                config.http_port, err
            );
            return ExitCode::from(1);
        }
    };
    let socks5_inbound =
        match rt.block_on(Socks5Inbound::new(config.socks5_port, dispatcher.clone())) {
            Ok(inbound) => inbound,
            Err(err) => {
                eprintln!(
                    "Failed to bind SOCKS5 listener on port {}: {}",
                    config.socks5_port, err
                );
                return ExitCode::from(1);
            }
        };

    let api_server = ApiServer::new(
        rules,
        registry,
        stats,
        sources,
        config.http_port,
        config.socks5_port,
    );
    let api_port = config.api_port;

    rt.spawn(http_inbound.run());
    rt.spawn(socks5_inbound.run());
    rt.spawn(api_server.run(api_port));

    rt.block_on(wait_for_shutdown());
    tracing::info!("Exiting...");
    rt.shutdown_background();
    ExitCode::from(0)
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
