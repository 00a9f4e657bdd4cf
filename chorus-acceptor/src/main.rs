//! Acceptor server for the chorus replicated store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chorus_acceptor::api::{ApiState, router};
use chorus_acceptor::metrics::{AcceptorMetrics, MetricsEncoder};
use chorus_acceptor::service::AcceptorService;
use chorus_acceptor::store::SlotStore;
use chorus_core::{AcceptorId, Peers};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "chorus-acceptor")]
#[command(about = "Run a chorus acceptor node")]
struct Args {
    #[arg(long, env = "ACCEPTOR_ID", default_value_t = 1)]
    id: u32,

    #[arg(long, env = "ACCEPTOR_PORT", default_value_t = 5001)]
    port: u16,

    /// Learners to fan ACCEPTED notifications out to.
    #[arg(long, env = "LEARNER_HOSTS", value_parser = Peers::parse_arg, default_value = "")]
    learner_hosts: Peers,

    #[arg(long, env = "DATA_DIR", default_value = "./chorus-data")]
    data_dir: PathBuf,
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
    let id = AcceptorId(args.id);

    let path = args.data_dir.join(format!("acceptor{}", args.id));
    info!(?path, "opening slot store");
    let store = match SlotStore::open(&path).await {
        Ok(store) => store,
        Err(report) => {
            error!(?report, "failed to open slot store");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(MetricsEncoder::new(AcceptorMetrics::new(store.clone())));
    let service = AcceptorService::new(id, store, args.learner_hosts.urls(), metrics.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%id, %addr, learners = args.learner_hosts.len(), "acceptor listening");

    axum::serve(listener, router(ApiState { service, metrics })).await?;
    Ok(())
}
