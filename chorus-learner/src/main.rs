//! Learner server for the chorus replicated store.

use std::net::SocketAddr;

use chorus_core::{LearnerId, Peers, config};
use chorus_learner::api::{ApiState, router};
use chorus_learner::catchup;
use chorus_learner::service::LearnerService;
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chorus-learner")]
#[command(about = "Run a chorus learner node")]
struct Args {
    #[arg(long, env = "LEARNER_ID", default_value_t = 1)]
    id: u32,

    #[arg(long, env = "LEARNER_PORT", default_value_t = 7001)]
    port: u16,

    #[arg(
        long,
        env = "ACCEPTOR_HOSTS",
        value_parser = Peers::parse_arg,
        default_value = "acceptor1:5001,acceptor2:5002,acceptor3:5003"
    )]
    acceptor_hosts: Peers,

    /// All learners, ordered by id; this node's own entry is skipped.
    #[arg(long, env = "LEARNER_HOSTS", value_parser = Peers::parse_arg, default_value = "learner1:7001,learner2:7002")]
    learner_hosts: Peers,

    #[arg(long, env = "PROPOSER_HOSTS", value_parser = Peers::parse_arg, default_value = "proposer1:6001,proposer2:6002")]
    proposer_hosts: Peers,

    #[arg(long, env = "TOTAL_ACCEPTORS")]
    total_acceptors: Option<usize>,

    #[arg(long, env = "QUORUM_SIZE")]
    quorum_size: Option<usize>,
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
    let id = LearnerId(args.id);

    let total = args.total_acceptors.unwrap_or(args.acceptor_hosts.len());
    let quorum = args.quorum_size.unwrap_or_else(|| config::quorum_size(total));

    let peer_urls: Vec<String> = args
        .learner_hosts
        .urls()
        .into_iter()
        .enumerate()
        .filter(|(index, _)| *index != (args.id as usize).saturating_sub(1))
        .map(|(_, url)| url)
        .collect();

    let service = LearnerService::new(id, quorum, peer_urls, args.acceptor_hosts.urls());
    let _catchup_task = catchup::spawn(service.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%id, %addr, quorum, "learner listening");

    let state = ApiState {
        service,
        proposer_urls: args.proposer_hosts.urls().into(),
    };
    axum::serve(listener, router(state)).await?;
    Ok(())
}
