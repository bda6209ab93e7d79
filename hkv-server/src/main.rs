//! Node entry point: loads config, bootstraps the node, and serves RESP and
//! HTTP traffic concurrently until shut down.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hkv_common::config::NodeConfig;
use hkv_server::node::Node;
use hkv_server::{http, server};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.get(1) {
        Some(path) => path.clone(),
        None => {
            eprintln!("usage: {} <config.toml>", args.first().map(String::as_str).unwrap_or("hkv-server"));
            return ExitCode::from(2);
        }
    };

    let config = match NodeConfig::load_from_path(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    init_tracing(&config.logging.level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: NodeConfig) -> ExitCode {
    let resp_addr = format!("{}:{}", config.network.resp_bind_addr, config.network.resp_port);
    let http_addr = format!("{}:{}", config.network.http_bind_addr, config.network.http_port);

    let node = match Node::bootstrap(config) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "node bootstrap failed");
            return ExitCode::FAILURE;
        }
    };

    node.join_cluster();
    info!(node_id = %node.config.node.id, "node bootstrapped");

    let resp_node = node.clone();
    let resp_task = tokio::spawn(async move { server::serve(resp_node, &resp_addr).await });

    let http_node = node.clone();
    let http_task = tokio::spawn(async move { serve_http(http_node, &http_addr).await });

    let shutdown_node = node.clone();
    tokio::select! {
        result = resp_task => {
            if let Ok(Err(err)) = result {
                error!(%err, "resp server exited");
            }
        }
        result = http_task => {
            if let Ok(Err(err)) = result {
                error!(%err, "http server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    shutdown_node.shutdown();
    ExitCode::SUCCESS
}

async fn serve_http(node: Arc<Node>, addr: &str) -> std::io::Result<()> {
    let router = http::build_router(node);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router).await
}

fn init_tracing(configured_level: &str) {
    let filter = std::env::var("HKV_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(configured_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
