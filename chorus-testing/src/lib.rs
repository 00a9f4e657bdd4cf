//! In-process cluster harness for integration tests.
//!
//! Every role runs as real axum servers on ephemeral localhost ports inside
//! one tokio runtime. Listeners are bound up front so the peer directories
//! can be written before any service starts; individual nodes can be stopped
//! (all their tasks aborted) or started late to stage failures.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chorus_acceptor::api::ApiState as AcceptorApiState;
use chorus_acceptor::metrics::{AcceptorMetrics, MetricsEncoder};
use chorus_acceptor::service::AcceptorService;
use chorus_acceptor::store::SlotStore;
use chorus_core::{AcceptorId, LearnerId, ProposerId, RpcClient, config};
use chorus_gateway::api::ApiState as GatewayApiState;
use chorus_gateway::routing::Gateway;
use chorus_learner::api::ApiState as LearnerApiState;
use chorus_learner::service::LearnerService;
use chorus_proposer::api::ApiState as ProposerApiState;
use chorus_proposer::node::{NodeConfig, ProposerNode};
use chorus_proposer::state::RoundStore;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG (or LOG_LEVEL) for filtering.
pub fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

pub struct ClusterOptions {
    pub acceptors: usize,
    pub proposers: usize,
    pub learners: usize,
    /// Learner indices whose servers start only when `serve_learner` is
    /// called, to stage catch-up scenarios.
    pub delayed_learners: Vec<usize>,
    pub heartbeat_interval: Duration,
    pub leader_timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            acceptors: 3,
            proposers: 2,
            learners: 2,
            delayed_learners: vec![],
            heartbeat_interval: Duration::from_millis(50),
            leader_timeout: Duration::from_millis(200),
        }
    }
}

struct DelayedLearner {
    index: usize,
    listener: TcpListener,
}

pub struct TestCluster {
    _dir: TempDir,
    pub acceptor_urls: Vec<String>,
    pub proposer_urls: Vec<String>,
    pub learner_urls: Vec<String>,
    pub gateway_url: String,
    pub rpc: RpcClient,
    pub quorum: usize,

    acceptor_tasks: Vec<Vec<JoinHandle<()>>>,
    proposer_tasks: Vec<Vec<JoinHandle<()>>>,
    learner_tasks: Vec<Vec<JoinHandle<()>>>,
    _gateway_task: JoinHandle<()>,
    delayed: Vec<DelayedLearner>,
    learner_states: Vec<LearnerApiState>,
    pub proposer_nodes: Vec<Arc<ProposerNode>>,
}

async fn bind_local() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

fn urls(addrs: &[SocketAddr]) -> Vec<String> {
    addrs.iter().map(|addr| format!("http://{addr}")).collect()
}

impl TestCluster {
    pub async fn start(options: ClusterOptions) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let quorum = config::quorum_size(options.acceptors);

        // Bind everything first so every peer directory is complete.
        let mut acceptor_listeners = Vec::new();
        let mut acceptor_addrs = Vec::new();
        for _ in 0..options.acceptors {
            let (listener, addr) = bind_local().await;
            acceptor_listeners.push(listener);
            acceptor_addrs.push(addr);
        }
        let mut proposer_listeners = Vec::new();
        let mut proposer_addrs = Vec::new();
        for _ in 0..options.proposers {
            let (listener, addr) = bind_local().await;
            proposer_listeners.push(listener);
            proposer_addrs.push(addr);
        }
        let mut learner_listeners = Vec::new();
        let mut learner_addrs = Vec::new();
        for _ in 0..options.learners {
            let (listener, addr) = bind_local().await;
            learner_listeners.push(listener);
            learner_addrs.push(addr);
        }
        let (gateway_listener, gateway_addr) = bind_local().await;

        let acceptor_urls = urls(&acceptor_addrs);
        let proposer_urls = urls(&proposer_addrs);
        let learner_urls = urls(&learner_addrs);

        // Acceptors.
        let mut acceptor_tasks = Vec::new();
        for (index, listener) in acceptor_listeners.into_iter().enumerate() {
            let store = SlotStore::open(dir.path().join(format!("acceptor{index}")))
                .await
                .expect("open slot store");
            let metrics = Arc::new(MetricsEncoder::new(AcceptorMetrics::new(store.clone())));
            #[allow(clippy::cast_possible_truncation)]
            let service = AcceptorService::new(
                AcceptorId(index as u32 + 1),
                store,
                learner_urls.clone(),
                metrics.clone(),
            );
            let router = chorus_acceptor::api::router(AcceptorApiState { service, metrics });
            let serve = tokio::spawn(async move {
                let _ = axum::serve(listener, router).await;
            });
            acceptor_tasks.push(vec![serve]);
        }

        // Learners.
        let mut learner_tasks = Vec::new();
        let mut learner_states = Vec::new();
        let mut delayed = Vec::new();
        for (index, listener) in learner_listeners.into_iter().enumerate() {
            let peer_urls: Vec<String> = learner_urls
                .iter()
                .enumerate()
                .filter(|(peer, _)| *peer != index)
                .map(|(_, url)| url.clone())
                .collect();
            #[allow(clippy::cast_possible_truncation)]
            let service = LearnerService::new(
                LearnerId(index as u32 + 1),
                quorum,
                peer_urls,
                acceptor_urls.clone(),
            );
            let state = LearnerApiState {
                service,
                proposer_urls: proposer_urls.clone().into(),
            };
            learner_states.push(state.clone());

            if options.delayed_learners.contains(&index) {
                delayed.push(DelayedLearner { index, listener });
                learner_tasks.push(vec![]);
            } else {
                learner_tasks.push(Self::serve_learner_state(listener, state));
            }
        }

        // Proposers.
        let mut proposer_tasks = Vec::new();
        let mut proposer_nodes = Vec::new();
        for (index, listener) in proposer_listeners.into_iter().enumerate() {
            let rounds = RoundStore::open(dir.path().join(format!("proposer{index}")))
                .await
                .expect("open round store");
            #[allow(clippy::cast_possible_truncation)]
            let node = ProposerNode::new(
                NodeConfig {
                    id: ProposerId(index as u32 + 1),
                    acceptor_urls: acceptor_urls.clone(),
                    proposer_urls: proposer_urls.clone(),
                    learner_urls: learner_urls.clone(),
                    quorum,
                    heartbeat_interval: options.heartbeat_interval,
                    leader_timeout: options.leader_timeout,
                    pipeline_window: 64,
                },
                rounds,
            );
            proposer_nodes.push(node.clone());

            let mut tasks = chorus_proposer::election::spawn_background(node.clone());
            let router = chorus_proposer::api::router(ProposerApiState { node });
            tasks.push(tokio::spawn(async move {
                let _ = axum::serve(listener, router).await;
            }));
            proposer_tasks.push(tasks);
        }

        // Gateway.
        let gateway = Arc::new(Gateway::new(proposer_urls.clone(), learner_urls.clone()));
        let router = chorus_gateway::api::router(GatewayApiState { gateway });
        let gateway_task = tokio::spawn(async move {
            let _ = axum::serve(gateway_listener, router).await;
        });

        Self {
            _dir: dir,
            acceptor_urls,
            proposer_urls,
            learner_urls,
            gateway_url: format!("http://{gateway_addr}"),
            rpc: RpcClient::new(),
            quorum,
            acceptor_tasks,
            proposer_tasks,
            learner_tasks,
            _gateway_task: gateway_task,
            delayed,
            learner_states,
            proposer_nodes,
        }
    }

    fn serve_learner_state(listener: TcpListener, state: LearnerApiState) -> Vec<JoinHandle<()>> {
        let catchup = chorus_learner::catchup::spawn(state.service.clone());
        let router = chorus_learner::api::router(state);
        let serve = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        vec![serve, catchup]
    }

    /// Start a learner whose server was delayed at cluster start.
    pub fn serve_learner(&mut self, index: usize) {
        let position = self
            .delayed
            .iter()
            .position(|d| d.index == index)
            .expect("learner was not delayed");
        let DelayedLearner { listener, .. } = self.delayed.swap_remove(position);
        let state = self.learner_states[index].clone();
        self.learner_tasks[index] = Self::serve_learner_state(listener, state);
    }

    #[must_use]
    pub fn learner_service(&self, index: usize) -> Arc<LearnerService> {
        self.learner_states[index].service.clone()
    }

    /// Stop an acceptor's server; later RPCs to it are refused.
    pub fn stop_acceptor(&mut self, index: usize) {
        for task in self.acceptor_tasks[index].drain(..) {
            task.abort();
        }
    }

    /// Silence a proposer entirely: server, heartbeats, election monitor.
    pub fn stop_proposer(&mut self, index: usize) {
        for task in self.proposer_tasks[index].drain(..) {
            task.abort();
        }
    }

    pub fn stop_learner(&mut self, index: usize) {
        for task in self.learner_tasks[index].drain(..) {
            task.abort();
        }
    }

}

/// Poll until `probe` yields a value or `timeout` passes.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
