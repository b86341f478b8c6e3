//! Quorum dispatcher: one persistent worker per replica connection, fanning
//! each logical operation out to all replicas and collecting replies until
//! a quorum of them succeeded.

use std::net::SocketAddr;

use crate::client::RemoteTable;
use crate::message::Timestamp;
use crate::server::ReplicaId;
use crate::utils::QuorumKvError;

use futures::future::join_all;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Dispatcher round ID type.
pub type RequestId = u64;

/// Operation fanned out to every replica in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumOp {
    Put {
        key: String,
        payload: Vec<u8>,
        ts: Timestamp,
    },
    Get {
        key: String,
    },
    Del {
        key: String,
    },
    Size,
    GetKeys,
    GetTs {
        key: String,
    },
}

/// Successful reply of one replica to a `QuorumOp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumReply {
    Put,
    Get { payload: Vec<u8>, ts: Timestamp },
    Del { found: bool },
    Size(usize),
    GetKeys(Vec<String>),
    GetTs(Timestamp),
}

/// Completion posted by a worker: `None` reply means the call failed.
type Completion = (RequestId, ReplicaId, Option<QuorumReply>);

/// Quorum dispatcher owning the replica workers.
pub struct QuorumDispatcher {
    /// Number of replicas.
    population: u8,

    /// Number of replicas that could not be reached at setup.
    initially_unreachable: usize,

    /// Last request ID used.
    req_id: RequestId,

    /// Per-worker task queues, indexed by replica ID.
    tx_tasks: Vec<mpsc::UnboundedSender<(RequestId, QuorumOp)>>,

    /// Shared completion queue.
    rx_done: mpsc::UnboundedReceiver<Completion>,

    /// Sender side of the quit flag.
    tx_quit: watch::Sender<bool>,

    /// Join handles of the workers.
    worker_handles: Vec<JoinHandle<()>>,
}

// QuorumDispatcher public API implementation
impl QuorumDispatcher {
    /// Connects to every replica concurrently and spawns one worker per
    /// replica. Replicas that cannot be reached now are kept as disconnected
    /// workers that keep trying to reconnect every `reconnect_backoff`.
    pub async fn new_and_setup(
        addrs: &[SocketAddr],
        retry_delay: Duration,
        reconnect_backoff: Duration,
    ) -> Result<Self, QuorumKvError> {
        if addrs.is_empty() {
            return logged_err!("empty replica address list");
        }
        if addrs.len() > ReplicaId::MAX as usize {
            return logged_err!("too many replicas: {}", addrs.len());
        }
        let population = addrs.len() as u8;

        let attempts = join_all(
            addrs
                .iter()
                .map(|&addr| RemoteTable::connect(addr, retry_delay)),
        )
        .await;

        let (tx_done, rx_done) = mpsc::unbounded_channel();
        let (tx_quit, rx_quit) = watch::channel(false);
        let mut tx_tasks = Vec::with_capacity(addrs.len());
        let mut worker_handles = Vec::with_capacity(addrs.len());
        let mut initially_unreachable = 0;

        for (replica, (attempt, &addr)) in
            attempts.into_iter().zip(addrs.iter()).enumerate()
        {
            let remote = match attempt {
                Ok(remote) => remote,
                Err(e) => {
                    pf_warn!(
                        "replica {} ({}) unreachable: {}",
                        replica,
                        addr,
                        e
                    );
                    initially_unreachable += 1;
                    RemoteTable::new(addr, retry_delay)
                }
            };

            let (tx_task, rx_task) = mpsc::unbounded_channel();
            tx_tasks.push(tx_task);
            worker_handles.push(tokio::spawn(Self::worker_thread(
                replica as ReplicaId,
                remote,
                rx_task,
                tx_done.clone(),
                rx_quit.clone(),
                reconnect_backoff,
            )));
        }

        Ok(QuorumDispatcher {
            population,
            initially_unreachable,
            req_id: 0,
            tx_tasks,
            rx_done,
            tx_quit,
            worker_handles,
        })
    }

    /// Number of replicas.
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Number of replicas that could not be reached at setup.
    pub fn initially_unreachable(&self) -> usize {
        self.initially_unreachable
    }

    /// Enqueues one copy of `op` per replica under a fresh request ID.
    fn fan_out(&mut self, op: &QuorumOp) -> Result<RequestId, QuorumKvError> {
        self.req_id += 1;
        for tx_task in &self.tx_tasks {
            tx_task.send((self.req_id, op.clone()))?;
        }
        Ok(self.req_id)
    }

    /// Runs one round: asks every replica, then waits until
    /// `expected_replies` of them succeeded. Fails as soon as too many
    /// replicas failed for that to remain possible. The returned vector is
    /// indexed by replica ID; replicas not heard from are `None`.
    pub async fn quorum_access(
        &mut self,
        op: QuorumOp,
        expected_replies: usize,
    ) -> Result<Vec<Option<QuorumReply>>, QuorumKvError> {
        let population = self.population as usize;
        if expected_replies == 0 || expected_replies > population {
            return logged_err!(
                "invalid expected_replies {} of {}",
                expected_replies,
                population
            );
        }

        // drop completions left over from earlier rounds
        while self.rx_done.try_recv().is_ok() {}

        let req_id = self.fan_out(&op)?;
        let mut replies: Vec<Option<QuorumReply>> = vec![None; population];
        let (mut succeeded, mut failed) = (0, 0);

        while succeeded < expected_replies {
            let (id, replica, reply) = match self.rx_done.recv().await {
                Some(completion) => completion,
                None => return logged_err!("completion channel closed"),
            };
            if id != req_id {
                continue; // stale
            }
            match reply {
                Some(reply) => {
                    replies[replica as usize] = Some(reply);
                    succeeded += 1;
                }
                None => {
                    failed += 1;
                    if population - failed < expected_replies {
                        return Err(QuorumKvError(format!(
                            "quorum unreachable: {} of {} replicas failed, \
                             {} replies needed",
                            failed, population, expected_replies
                        )));
                    }
                }
            }
        }

        Ok(replies)
    }

    /// Sends `op` to every replica without waiting for any reply. Its
    /// completions are discarded as stale by later rounds.
    pub fn post(&mut self, op: QuorumOp) -> Result<(), QuorumKvError> {
        self.fan_out(&op)?;
        Ok(())
    }

    /// Signals all workers to quit and waits for them to exit.
    pub async fn shutdown(&mut self) -> Result<(), QuorumKvError> {
        if self.worker_handles.is_empty() {
            return Ok(());
        }
        self.tx_quit.send_replace(true);
        for handle in self.worker_handles.drain(..) {
            handle.await?;
        }
        pf_debug!("dispatcher workers all exitted");
        Ok(())
    }
}

// QuorumDispatcher worker thread implementation
impl QuorumDispatcher {
    /// Performs the remote call of `op`.
    async fn perform(
        remote: &mut RemoteTable,
        op: QuorumOp,
    ) -> Result<QuorumReply, QuorumKvError> {
        match op {
            QuorumOp::Put { key, payload, ts } => {
                remote.put(&key, &payload, ts).await?;
                Ok(QuorumReply::Put)
            }
            QuorumOp::Get { key } => {
                let (payload, ts) = remote.get(&key).await?;
                Ok(QuorumReply::Get { payload, ts })
            }
            QuorumOp::Del { key } => Ok(QuorumReply::Del {
                found: remote.del(&key).await?,
            }),
            QuorumOp::Size => Ok(QuorumReply::Size(remote.size().await?)),
            QuorumOp::GetKeys => {
                Ok(QuorumReply::GetKeys(remote.getkeys().await?))
            }
            QuorumOp::GetTs { key } => {
                Ok(QuorumReply::GetTs(remote.get_timestamp(&key).await?))
            }
        }
    }

    /// Worker thread function, bound to one replica.
    async fn worker_thread(
        replica: ReplicaId,
        mut remote: RemoteTable,
        mut rx_task: mpsc::UnboundedReceiver<(RequestId, QuorumOp)>,
        tx_done: mpsc::UnboundedSender<Completion>,
        mut rx_quit: watch::Receiver<bool>,
        reconnect_backoff: Duration,
    ) {
        pf_debug!("worker thread for replica {} spawned", replica);

        loop {
            tokio::select! {
                biased;

                // quit flag raised or dispatcher dropped
                _ = rx_quit.changed() => break,

                task = rx_task.recv() => {
                    let (id, op) = match task {
                        Some(task) => task,
                        None => break,
                    };
                    // while disconnected, try once right away rather than
                    // holding the task until the next backoff tick
                    let reply = if remote.is_connected()
                        || remote.reconnect().await.is_ok()
                    {
                        match Self::perform(&mut remote, op).await {
                            Ok(reply) => Some(reply),
                            Err(e) => {
                                pf_debug!("replica {} call failed: {}", replica, e);
                                None
                            }
                        }
                    } else {
                        None
                    };
                    if tx_done.send((id, replica, reply)).is_err() {
                        break;
                    }
                },

                // keep trying to reconnect while disconnected
                _ = time::sleep(reconnect_backoff), if !remote.is_connected() => {
                    if remote.reconnect().await.is_ok() {
                        pf_info!("reconnected to replica {} ({})", replica, remote.addr());
                    }
                },
            }
        }

        pf_debug!("worker thread for replica {} exitted", replica);
    }
}

#[cfg(test)]
mod dispatcher_tests {
    use super::*;
    use crate::server::{ServerConfig, TableServer};
    use tokio::net::TcpListener;

    async fn spawn_server(
        name: &str,
    ) -> Result<(SocketAddr, watch::Sender<bool>), QuorumKvError> {
        let mut server = TableServer::new_and_setup(
            0,
            "127.0.0.1:0".parse()?,
            name,
            ServerConfig::default(),
            true,
        )
        .await?;
        let addr = server.api_addr();
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move { server.run(rx_term).await });
        Ok((addr, tx_term))
    }

    async fn dead_addr() -> Result<SocketAddr, QuorumKvError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(listener.local_addr()?)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn setup_invalid() -> Result<(), QuorumKvError> {
        let delay = Duration::from_millis(10);
        assert!(QuorumDispatcher::new_and_setup(&[], delay, delay)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn access_all_replies() -> Result<(), QuorumKvError> {
        let (addr0, _term0) = spawn_server("/tmp/test-quorumkv-dp-0").await?;
        let (addr1, _term1) = spawn_server("/tmp/test-quorumkv-dp-1").await?;
        let delay = Duration::from_millis(50);
        let mut dispatcher =
            QuorumDispatcher::new_and_setup(&[addr0, addr1], delay, delay)
                .await?;
        assert_eq!(dispatcher.initially_unreachable(), 0);

        let replies = dispatcher
            .quorum_access(
                QuorumOp::Put {
                    key: "k".into(),
                    payload: b"v".to_vec(),
                    ts: 1000,
                },
                2,
            )
            .await?;
        assert_eq!(replies, vec![Some(QuorumReply::Put); 2]);

        let replies = dispatcher
            .quorum_access(QuorumOp::GetTs { key: "k".into() }, 2)
            .await?;
        assert_eq!(replies, vec![Some(QuorumReply::GetTs(1000)); 2]);

        assert!(dispatcher.quorum_access(QuorumOp::Size, 3).await.is_err());
        assert!(dispatcher.quorum_access(QuorumOp::Size, 0).await.is_err());
        dispatcher.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn access_with_replica_down() -> Result<(), QuorumKvError> {
        let (addr0, _term0) = spawn_server("/tmp/test-quorumkv-dp-2").await?;
        let (addr1, _term1) = spawn_server("/tmp/test-quorumkv-dp-3").await?;
        // nobody listens on this one
        let addr2 = dead_addr().await?;
        let delay = Duration::from_millis(20);
        let mut dispatcher = QuorumDispatcher::new_and_setup(
            &[addr0, addr1, addr2],
            delay,
            delay,
        )
        .await?;
        assert_eq!(dispatcher.initially_unreachable(), 1);

        let replies = dispatcher.quorum_access(QuorumOp::Size, 2).await?;
        assert_eq!(replies[2], None);
        assert_eq!(replies.iter().filter(|r| r.is_some()).count(), 2);

        // all three can never answer
        assert!(dispatcher.quorum_access(QuorumOp::Size, 3).await.is_err());

        // fire-and-forget round does not disturb the next one
        dispatcher.post(QuorumOp::Size)?;
        let replies = dispatcher
            .quorum_access(QuorumOp::GetTs { key: "x".into() }, 2)
            .await?;
        for reply in replies.into_iter().flatten() {
            assert_eq!(reply, QuorumReply::GetTs(0));
        }
        dispatcher.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replica_comes_back() -> Result<(), QuorumKvError> {
        let (addr0, _term0) = spawn_server("/tmp/test-quorumkv-dp-4").await?;
        let (addr1, _term1) = spawn_server("/tmp/test-quorumkv-dp-5").await?;
        let addr2 = dead_addr().await?;
        let delay = Duration::from_millis(20);
        let mut dispatcher = QuorumDispatcher::new_and_setup(
            &[addr0, addr1, addr2],
            delay,
            delay,
        )
        .await?;
        assert_eq!(dispatcher.initially_unreachable(), 1);
        assert!(dispatcher.quorum_access(QuorumOp::Size, 3).await.is_err());

        // bring up a server on the address that was dead
        let mut server = TableServer::new_and_setup(
            2,
            addr2,
            "/tmp/test-quorumkv-dp-6",
            ServerConfig::default(),
            true,
        )
        .await?;
        let (_term2, rx_term) = watch::channel(false);
        tokio::spawn(async move { server.run(rx_term).await });
        time::sleep(delay * 10).await;

        let replies = dispatcher.quorum_access(QuorumOp::Size, 3).await?;
        assert!(replies[2].is_some());
        assert_eq!(replies, vec![Some(QuorumReply::Size(0)); 3]);
        dispatcher.shutdown().await
    }
}
