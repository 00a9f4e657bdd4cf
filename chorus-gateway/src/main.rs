//! Client gateway server for the chorus replicated store.

use std::net::SocketAddr;
use std::sync::Arc;

use chorus_core::Peers;
use chorus_gateway::api::{ApiState, router};
use chorus_gateway::routing::Gateway;
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chorus-gateway")]
#[command(about = "Run the chorus client gateway")]
struct Args {
    #[arg(long, env = "GATEWAY_ID", default_value_t = 1)]
    id: u32,

    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8001)]
    port: u16,

    #[arg(long, env = "PROPOSER_HOSTS", value_parser = Peers::parse_arg, default_value = "proposer1:6001,proposer2:6002")]
    proposer_hosts: Peers,

    #[arg(long, env = "LEARNER_HOSTS", value_parser = Peers::parse_arg, default_value = "learner1:7001,learner2:7002")]
    learner_hosts: Peers,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args = Args::parse();
    let gateway = Arc::new(Gateway::new(
        args.proposer_hosts.urls(),
        args.learner_hosts.urls(),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        id = args.id,
        %addr,
        proposers = args.proposer_hosts.len(),
        learners = args.learner_hosts.len(),
        "gateway listening"
    );

    axum::serve(listener, router(ApiState { gateway })).await?;
    Ok(())
}
