//! Proposer server for the chorus replicated store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chorus_core::{Peers, ProposerId, config};
use chorus_proposer::api::{ApiState, router};
use chorus_proposer::node::{NodeConfig, ProposerNode};
use chorus_proposer::state::RoundStore;
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "chorus-proposer")]
#[command(about = "Run a chorus proposer node")]
struct Args {
    #[arg(long, env = "PROPOSER_ID", default_value_t = 1)]
    id: u32,

    #[arg(long, env = "PROPOSER_PORT", default_value_t = 6001)]
    port: u16,

    #[arg(
        long,
        env = "ACCEPTOR_HOSTS",
        value_parser = Peers::parse_arg,
        default_value = "acceptor1:5001,acceptor2:5002,acceptor3:5003"
    )]
    acceptor_hosts: Peers,

    #[arg(long, env = "LEARNER_HOSTS", value_parser = Peers::parse_arg, default_value = "learner1:7001,learner2:7002")]
    learner_hosts: Peers,

    /// All proposers, ordered by id.
    #[arg(long, env = "PROPOSER_HOSTS", value_parser = Peers::parse_arg, default_value = "proposer1:6001,proposer2:6002")]
    proposer_hosts: Peers,

    #[arg(long, env = "TOTAL_ACCEPTORS")]
    total_acceptors: Option<usize>,

    #[arg(long, env = "QUORUM_SIZE")]
    quorum_size: Option<usize>,

    /// Leader heartbeat period, in milliseconds.
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 500)]
    heartbeat_interval: u64,

    /// Follower timeout before candidacy, in milliseconds. Must be at least
    /// twice the heartbeat interval.
    #[arg(long, env = "LEADER_TIMEOUT", default_value_t = 1500)]
    leader_timeout: u64,

    /// Cap on concurrently inflight slots; writes beyond it are rejected.
    #[arg(long, env = "PIPELINE_WINDOW", default_value_t = 64)]
    pipeline_window: usize,

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
    let id = ProposerId(args.id);

    let heartbeat_interval = Duration::from_millis(args.heartbeat_interval);
    let leader_timeout = Duration::from_millis(args.leader_timeout);
    if let Err(report) = config::validate_timeouts(heartbeat_interval, leader_timeout) {
        error!(?report, "invalid timeout configuration");
        std::process::exit(2);
    }

    let total = args.total_acceptors.unwrap_or(args.acceptor_hosts.len());
    let quorum = args.quorum_size.unwrap_or_else(|| config::quorum_size(total));

    let path = args.data_dir.join(format!("proposer{}", args.id));
    info!(?path, "opening round store");
    let rounds = match RoundStore::open(&path).await {
        Ok(rounds) => rounds,
        Err(report) => {
            error!(?report, "failed to open round store");
            std::process::exit(1);
        }
    };

    let node = ProposerNode::new(
        NodeConfig {
            id,
            acceptor_urls: args.acceptor_hosts.urls(),
            proposer_urls: args.proposer_hosts.urls(),
            learner_urls: args.learner_hosts.urls(),
            quorum,
            heartbeat_interval,
            leader_timeout,
            pipeline_window: args.pipeline_window,
        },
        rounds,
    );

    chorus_proposer::election::spawn_background(node.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%id, %addr, quorum, "proposer listening");

    axum::serve(listener, router(ApiState { node })).await?;
    Ok(())
}
