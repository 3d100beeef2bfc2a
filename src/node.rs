use std::collections::{HashMap, HashSet};
use std::future::IntoFuture;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::Version;
use crate::bench::BenchmarkEngine;
use crate::chain::Chain;
use crate::config::NodeConfig;
use crate::crypto::Keypair;
use crate::directory::{parse_addr, Directory, DispatcherAddr};
use crate::error::{DispatchError, Result};
use crate::protocol::message::{Message, MessageKind, PeerHello};
use crate::scheduler::job::{Job, JobPriority, ScheduledJob};
use crate::scheduler::queue::{JobQueue, WorkerQueue};
use crate::session::{SessionHandle, SessionId};
use crate::store::{NodeState, NodeStore};

/// A worker session as the dispatcher sees it.
#[derive(Debug)]
pub struct WorkerInfo {
    pub pubkey: Vec<u8>,
    /// Job currently running on this worker. While set, the session is
    /// absent from the worker queue.
    pub assigned: Option<ScheduledJob>,
    pub shut: bool,
    pub handle: SessionHandle,
}

/// A neighbouring dispatcher session.
#[derive(Debug)]
pub struct NeighbourInfo {
    pub pubkey: Vec<u8>,
    /// Hex pubkeys this neighbour reports being directly connected to.
    /// Drives gossip loop-avoidance.
    pub neighbours: Vec<String>,
    pub handle: SessionHandle,
}

/// Everything guarded by the single dispatcher-wide lock.
#[derive(Debug, Default)]
pub struct State {
    pub job_pq: JobQueue,
    pub worker_pq: WorkerQueue,
    pub workers: HashMap<SessionId, WorkerInfo>,
    pub neighbours: HashMap<SessionId, NeighbourInfo>,
    /// Completed jobs waiting to be sealed into the next block.
    pub pending: Vec<Job>,
    /// Jobs cancelled after submission; consulted at dispatch time.
    pub cancelled: HashSet<Uuid>,
}

impl State {
    pub fn neighbour_pubs_hex(&self) -> Vec<String> {
        self.neighbours
            .values()
            .map(|n| hex::encode(&n.pubkey))
            .collect()
    }

    pub fn broadcast_workers(&self, frame: &[u8]) {
        for (session, worker) in &self.workers {
            if !worker.handle.send(frame.to_vec()) {
                tracing::debug!(%session, "Worker send failed during broadcast");
            }
        }
    }

    pub fn broadcast_neighbours(&self, frame: &[u8]) {
        for (session, neighbour) in &self.neighbours {
            if !neighbour.handle.send(frame.to_vec()) {
                tracing::debug!(%session, "Neighbour send failed during broadcast");
            }
        }
    }

    pub fn multicast_neighbours(&self, frame: &[u8], recipients: &[String]) {
        for (session, neighbour) in &self.neighbours {
            if recipients.contains(&hex::encode(&neighbour.pubkey))
                && !neighbour.handle.send(frame.to_vec())
            {
                tracing::debug!(%session, "Neighbour send failed during multicast");
            }
        }
    }
}

/// The dispatcher node: owns the queues, registries and commit buffer, and
/// coordinates every long-lived task.
pub struct Dispatcher {
    pub config: NodeConfig,
    pub(crate) keypair: Keypair,
    pub benchmark: BenchmarkEngine,
    pub chain: Chain,
    pub directory: Arc<Directory>,
    pub state: Mutex<State>,
    /// Signalled on every job/worker push; wakes the scheduler loop.
    pub(crate) sched_notify: Notify,
    pub(crate) write_tx: mpsc::UnboundedSender<Vec<Job>>,
    write_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Vec<Job>>>>,
    store: NodeStore,
    started_at: i64,
    new: bool,
}

impl Dispatcher {
    /// Build a dispatcher from persisted state (warm start) or a fresh
    /// identity (cold start). The chain genesis always uses the persisted
    /// pub verbatim, so a warm start resumes the same chain identity.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let store = NodeStore::open(&config.data_dir)?;
        let node = store.load_or_init()?;
        let directory = Arc::new(Directory::new(config.directory_url.clone()));
        if let Some(token) = &node.token {
            directory.set_token(token.clone());
        }
        let chain = Chain::create(node.keypair.public_hex());
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            config,
            keypair: node.keypair,
            benchmark: node.benchmark,
            chain,
            directory,
            state: Mutex::new(State::default()),
            sched_notify: Notify::new(),
            write_tx,
            write_rx: std::sync::Mutex::new(Some(write_rx)),
            store,
            started_at: chrono::Utc::now().timestamp(),
            new: node.new,
        }))
    }

    pub fn public_hex(&self) -> String {
        self.keypair.public_hex()
    }

    pub fn uptime_secs(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.started_at
    }

    pub fn version(&self) -> Version {
        Version {
            version: env!("CARGO_PKG_VERSION").to_string(),
            height: self.chain.height(),
            block_hashes: self.chain.block_hashes_hex(),
        }
    }

    /// Enqueue a job for dispatch. Returns the receiver the terminal job
    /// value will be delivered on.
    pub async fn submit_job(
        &self,
        task: Vec<u8>,
        priority: JobPriority,
    ) -> (Uuid, oneshot::Receiver<Job>) {
        let job = Job::new(task, priority);
        let id = job.id;
        let (scheduled, result_rx) = ScheduledJob::new(job);
        {
            let mut state = self.state.lock().await;
            state.job_pq.push(scheduled, priority);
        }
        tracing::info!(job_id = %id, %priority, "Job submitted");
        self.sched_notify.notify_one();
        (id, result_rx)
    }

    /// Flag a queued job as cancelled. The scheduler short-circuits delivery
    /// the next time it pops the job; already-dispatched jobs are unaffected.
    pub async fn cancel_job(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        state.cancelled.insert(id);
        tracing::info!(job_id = %id, "Job flagged cancelled");
    }

    /// Dial every dispatcher the directory knows about, pick the tallest as
    /// sync peer, and request each block we do not hold.
    pub async fn bootstrap(self: Arc<Self>) {
        let dispatchers = match self.directory.get_dispatchers().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "Directory returned no dispatcher list");
                return;
            }
        };
        if dispatchers.is_empty() {
            tracing::warn!("No dispatchers registered, skipping sync");
            return;
        }

        let own_pub = self.public_hex();
        let mut sync: Option<(Version, SessionId)> = None;
        for entry in dispatchers {
            let addr = match parse_addr(&entry) {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(entry = %entry, error = %e, "Skipping malformed directory entry");
                    continue;
                }
            };
            if addr.pubkey_hex == own_pub {
                continue;
            }
            let session = match self.clone().dial_peer(&addr).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(peer = %addr.pubkey_hex, error = %e, "Peer dial failed");
                    continue;
                }
            };
            match self.fetch_version(&addr).await {
                Ok(version) => {
                    let best = sync.as_ref().map(|(v, _)| v.height).unwrap_or(0);
                    if version.height > best {
                        sync = Some((version, session));
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %addr.pubkey_hex, error = %e, "Version fetch failed");
                }
            }
        }

        let Some((version, session)) = sync else {
            return;
        };
        tracing::warn!(height = version.height, "Node sync in progress");
        let held: HashSet<String> = self.chain.block_hashes_hex().into_iter().collect();
        let state = self.state.lock().await;
        let Some(peer) = state.neighbours.get(&session) else {
            return;
        };
        for hash_hex in &version.block_hashes {
            if held.contains(hash_hex) {
                continue;
            }
            let Ok(hash) = hex::decode(hash_hex) else {
                tracing::warn!(hash = %hash_hex, "Sync peer sent malformed block hash");
                continue;
            };
            let req = Message::signed(MessageKind::BlockReq, hash, &self.keypair);
            peer.handle.send(req.encode());
        }
    }

    /// Open an outgoing peer connection: register the neighbour under the
    /// advertised pubkey, start the writer and reader tasks, and say hello.
    pub async fn dial_peer(self: Arc<Self>, addr: &DispatcherAddr) -> Result<SessionId> {
        let pubkey =
            hex::decode(&addr.pubkey_hex).map_err(|e| DispatchError::PeerDial(e.to_string()))?;
        let (ws, _) = connect_async(addr.ws_url())
            .await
            .map_err(|e| DispatchError::PeerDial(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        let (handle, mut outbound_rx) = SessionHandle::new();
        let session = SessionId::next();

        let hello;
        {
            let mut state = self.state.lock().await;
            hello = PeerHello::new(self.keypair.public_bytes(), state.neighbour_pubs_hex());
            state.neighbours.insert(
                session,
                NeighbourInfo {
                    pubkey,
                    neighbours: Vec::new(),
                    handle: handle.clone(),
                },
            );
        }
        handle.send(Message::unsigned(MessageKind::Hello, hello.serialize()).encode());

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(WsMessage::Binary(frame)).await.is_err() {
                    break;
                }
            }
        });

        let dispatcher = self.clone();
        let reader_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                if let WsMessage::Binary(frame) = msg {
                    if dispatcher
                        .handle_peer_frame(session, &reader_handle, &frame)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            dispatcher.handle_peer_disconnect(session).await;
        });

        tracing::info!(peer = %addr.pubkey_hex, %session, "Dialed neighbour");
        Ok(session)
    }

    async fn fetch_version(&self, addr: &DispatcherAddr) -> Result<Version> {
        let version = reqwest::get(addr.version_url()).await?.json().await?;
        Ok(version)
    }

    /// Register a new node with the directory or wake an existing one.
    /// The node must be discoverable, so failure here is fatal.
    pub async fn announce(&self) -> Result<()> {
        if self.new {
            let token = self
                .directory
                .new_dispatcher(
                    &self.public_hex(),
                    &self.config.advertise_ip,
                    self.config.port,
                )
                .await?;
            self.persist_token(token)?;
            tracing::info!("Registered with directory");
        } else {
            self.directory.wake().await?;
            tracing::info!("Woke directory registration");
        }
        Ok(())
    }

    fn persist_token(&self, token: String) -> Result<()> {
        self.store.save_token(&NodeState {
            keypair: self.keypair.clone(),
            benchmark: self.benchmark.clone(),
            token: Some(token),
            new: false,
        })
    }

    pub(crate) fn take_write_rx(&self) -> mpsc::UnboundedReceiver<Vec<Job>> {
        self.write_rx
            .lock()
            .unwrap()
            .take()
            .expect("write queue receiver taken twice")
    }

    /// Run the dispatcher: verify the chain, spawn the scheduler and
    /// commit-flush loops, sync from the tallest peer, announce to the
    /// directory, then serve HTTP/websockets until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        if !self.chain.verify() {
            return Err(DispatchError::Internal("chain verification failed".into()));
        }

        tokio::spawn(crate::scheduler::dispatch_loop(
            self.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(self.clone().commit_flush_loop(shutdown.clone()));

        self.clone().bootstrap().await;
        self.announce().await?;

        let addr: std::net::SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| DispatchError::Internal(format!("bad listen address: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, node_pub = %self.public_hex(), "Dispatcher serving");

        let app = crate::api::router(self.clone());
        let server = axum::serve(listener, app).into_future();
        tokio::select! {
            result = server => {
                result.map_err(DispatchError::Io)?;
            }
            _ = shutdown.cancelled() => {
                self.graceful_shutdown().await;
            }
        }
        Ok(())
    }

    /// Graceful shutdown: tell the directory we are asleep, give every
    /// worker a signed SHUT, and allow the grace period for disconnects.
    pub async fn graceful_shutdown(&self) {
        tracing::warn!(uptime_secs = self.uptime_secs(), "Interrupt detected, shutting down");
        if let Err(e) = self.directory.sleep().await {
            tracing::warn!(error = %e, "Directory sleep failed");
        }
        let shut = Message::signed(MessageKind::Shut, Vec::new(), &self.keypair);
        {
            let state = self.state.lock().await;
            state.broadcast_workers(&shut.encode());
        }
        tokio::time::sleep(self.config.shutdown_grace).await;
    }
}
