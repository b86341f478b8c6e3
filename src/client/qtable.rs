//! Quorum coordinator: a replicated table over N table servers, resolving
//! divergent replicas by last-writer-wins on logical timestamps and
//! repairing stale replicas on reads.

use std::net::SocketAddr;

use crate::client::{QuorumDispatcher, QuorumOp, QuorumReply};
use crate::message::{valid_key, Timestamp};
use crate::utils::QuorumKvError;

use serde::Deserialize;

use tokio::time::Duration;

/// Client ID type. Must be below 1000 so it fits in a timestamp's low part.
pub type ClientId = u64;

/// Timestamps reserve their three lowest decimal digits for the client ID.
const ROUND_BASE: Timestamp = 1000;

/// Timestamp for a new write by `client` that supersedes `ts`, or `None`
/// if the timestamp space above `ts` is exhausted.
pub fn next_round(ts: Timestamp, client: ClientId) -> Option<Timestamp> {
    (ts / ROUND_BASE + 1)
        .checked_mul(ROUND_BASE)?
        .checked_add(client)
}

/// Integer-truncated average, `None` if empty.
fn average(sizes: &[usize]) -> Option<usize> {
    if sizes.is_empty() {
        None
    } else {
        Some(sizes.iter().sum::<usize>() / sizes.len())
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuorumConfig {
    /// Delay before the single retry of a failed exchange, in millisecs.
    pub retry_delay_ms: u64,

    /// Interval of reconnection attempts to a lost replica, in millisecs.
    pub reconnect_backoff_ms: u64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        QuorumConfig {
            retry_delay_ms: 1000,
            reconnect_backoff_ms: 1000,
        }
    }
}

impl QuorumConfig {
    /// Parses the config from an optional TOML string over default values.
    pub fn parse(config_str: Option<&str>) -> Result<Self, QuorumKvError> {
        parsed_config!(config_str => QuorumConfig;
                       retry_delay_ms, reconnect_backoff_ms)
    }
}

/// Client-side replicated table.
pub struct QuorumTable {
    /// My client ID.
    id: ClientId,

    /// Dispatcher of quorum rounds.
    dispatcher: QuorumDispatcher,
}

impl QuorumTable {
    /// Connects to all replicas. Fails if too many of them are unreachable
    /// for a majority to be formed.
    pub async fn connect(
        addrs: &[SocketAddr],
        id: ClientId,
        config: &QuorumConfig,
    ) -> Result<Self, QuorumKvError> {
        if id >= ROUND_BASE {
            return logged_err!("invalid client ID {}", id);
        }
        let mut dispatcher = QuorumDispatcher::new_and_setup(
            addrs,
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.reconnect_backoff_ms),
        )
        .await?;

        let tolerable = (addrs.len() - 1) / 2;
        if dispatcher.initially_unreachable() > tolerable {
            let unreachable = dispatcher.initially_unreachable();
            dispatcher.shutdown().await?;
            return logged_err!(
                "{} of {} replicas unreachable, at most {} tolerable",
                unreachable,
                addrs.len(),
                tolerable
            );
        }

        pf_info!("connected to {} replicas", addrs.len());
        Ok(QuorumTable { id, dispatcher })
    }

    /// Majority size.
    pub fn quorum_size(&self) -> usize {
        self.dispatcher.population() as usize / 2 + 1
    }

    fn check_key(key: &str) -> Result<(), QuorumKvError> {
        if !valid_key(key) {
            return Err(QuorumKvError(format!("invalid key '{}'", key)));
        }
        Ok(())
    }

    /// Highest timestamp of `key` over a majority.
    pub async fn get_timestamp(
        &mut self,
        key: &str,
    ) -> Result<Timestamp, QuorumKvError> {
        Self::check_key(key)?;
        let replies = self
            .dispatcher
            .quorum_access(
                QuorumOp::GetTs { key: key.into() },
                self.quorum_size(),
            )
            .await?;
        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                Some(QuorumReply::GetTs(ts)) => Some(ts),
                _ => None,
            })
            .max()
            .unwrap_or(0))
    }

    /// Writes `payload` under `key` on a majority with a timestamp newer than
    /// any a majority has seen. Returns the timestamp assigned.
    pub async fn put(
        &mut self,
        key: &str,
        payload: &[u8],
    ) -> Result<Timestamp, QuorumKvError> {
        let seen = self.get_timestamp(key).await?;
        let ts = match next_round(seen, self.id) {
            Some(ts) => ts,
            None => {
                return logged_err!(
                    "no timestamp left above {} for '{}'",
                    seen,
                    key
                )
            }
        };
        self.dispatcher
            .quorum_access(
                QuorumOp::Put {
                    key: key.into(),
                    payload: payload.to_vec(),
                    ts,
                },
                self.quorum_size(),
            )
            .await?;
        pf_debug!("put '{}' at ts {}", key, ts);
        Ok(ts)
    }

    /// Reads `key` from a majority and returns the newest value with its
    /// timestamp, or `None` if the newest is a deletion or nothing at all.
    /// Replicas that answered with an older value get repaired in the
    /// background.
    pub async fn get(
        &mut self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Timestamp)>, QuorumKvError> {
        Self::check_key(key)?;
        let replies = self
            .dispatcher
            .quorum_access(
                QuorumOp::Get { key: key.into() },
                self.quorum_size(),
            )
            .await?;

        let answers: Vec<(Vec<u8>, Timestamp)> = replies
            .into_iter()
            .filter_map(|reply| match reply {
                Some(QuorumReply::Get { payload, ts }) => Some((payload, ts)),
                _ => None,
            })
            .collect();

        // strictly highest timestamp wins, earlier answer breaks ties
        let mut winner: Option<&(Vec<u8>, Timestamp)> = None;
        for answer in &answers {
            if winner.map_or(true, |w| answer.1 > w.1) {
                winner = Some(answer);
            }
        }
        let (payload, ts) = match winner {
            Some(w) => w.clone(),
            None => return logged_err!("no replies in a successful round"),
        };

        if answers.iter().any(|(_, t)| *t < ts) {
            pf_debug!("read-repairing '{}' to ts {}", key, ts);
            self.dispatcher.post(QuorumOp::Put {
                key: key.into(),
                payload: payload.clone(),
                ts,
            })?;
        }

        if payload.is_empty() {
            Ok(None)
        } else {
            Ok(Some((payload, ts)))
        }
    }

    /// Deletes `key` by writing an empty payload with a fresh timestamp.
    pub async fn del(&mut self, key: &str) -> Result<Timestamp, QuorumKvError> {
        self.put(key, &[]).await
    }

    /// Average number of live records over a majority (an approximation).
    pub async fn size(&mut self) -> Result<usize, QuorumKvError> {
        let replies = self
            .dispatcher
            .quorum_access(QuorumOp::Size, self.quorum_size())
            .await?;
        let sizes: Vec<usize> = replies
            .into_iter()
            .filter_map(|reply| match reply {
                Some(QuorumReply::Size(size)) => Some(size),
                _ => None,
            })
            .collect();
        match average(&sizes) {
            Some(avg) => Ok(avg),
            None => logged_err!("no replies in a successful round"),
        }
    }

    /// Key list of whichever majority member reported the most keys (an
    /// approximation).
    pub async fn getkeys(&mut self) -> Result<Vec<String>, QuorumKvError> {
        let replies = self
            .dispatcher
            .quorum_access(QuorumOp::GetKeys, self.quorum_size())
            .await?;
        let mut most: Vec<String> = vec![];
        for reply in replies.into_iter().flatten() {
            if let QuorumReply::GetKeys(keys) = reply {
                if keys.len() > most.len() {
                    most = keys;
                }
            }
        }
        Ok(most)
    }

    /// Shuts down all replica workers.
    pub async fn disconnect(mut self) -> Result<(), QuorumKvError> {
        self.dispatcher.shutdown().await
    }
}

#[cfg(test)]
mod qtable_tests {
    use super::*;
    use crate::client::RemoteTable;
    use crate::server::{ServerConfig, TableServer};
    use tokio::sync::watch;
    use tokio::time;

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

    async fn spawn_cluster(
        prefix: &str,
        n: usize,
    ) -> Result<(Vec<SocketAddr>, Vec<watch::Sender<bool>>), QuorumKvError>
    {
        let mut addrs = vec![];
        let mut terms = vec![];
        for i in 0..n {
            let name = format!("{}-{}", prefix, i);
            let (addr, term) = spawn_server(&name).await?;
            addrs.push(addr);
            terms.push(term);
        }
        Ok((addrs, terms))
    }

    fn test_config() -> QuorumConfig {
        QuorumConfig {
            retry_delay_ms: 20,
            reconnect_backoff_ms: 50,
        }
    }

    #[test]
    fn next_round_values() {
        assert_eq!(next_round(0, 7), Some(1007));
        assert_eq!(next_round(1007, 3), Some(2003));
        assert_eq!(next_round(2003, 3), Some(3003));
        assert_eq!(next_round(5999, 0), Some(6000));
        assert_eq!(next_round(u64::MAX, 0), None);
        assert_eq!(next_round(u64::MAX - 2000, 999), None);
    }

    #[test]
    fn average_sizes() {
        assert_eq!(average(&[10, 12, 11]), Some(11));
        assert_eq!(average(&[10, 11]), Some(10));
        assert_eq!(average(&[]), None);
    }

    #[test]
    fn parse_config() -> Result<(), QuorumKvError> {
        let config = QuorumConfig::parse(Some("retry_delay_ms = 5"))?;
        assert_eq!(config.retry_delay_ms, 5);
        assert_eq!(config.reconnect_backoff_ms, 1000);
        assert!(QuorumConfig::parse(Some("timeout = 5")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn put_then_get() -> Result<(), QuorumKvError> {
        let (addrs, _terms) =
            spawn_cluster("/tmp/test-quorumkv-qt-0", 3).await?;
        let mut table = QuorumTable::connect(&addrs, 7, &test_config()).await?;
        assert_eq!(table.quorum_size(), 2);

        let ts = table.put("k", b"hello").await?;
        assert_eq!(ts, 1007);
        let (payload, got_ts) = table.get("k").await?.ok_or_else(|| {
            QuorumKvError::msg("missing value just written")
        })?;
        assert_eq!(payload, b"hello".to_vec());
        assert!(got_ts >= ts);

        assert_eq!(table.put("k", b"again").await?, 2007);
        assert_eq!(table.get("nothing").await?, None);
        assert!(table.put("bad key", b"x").await.is_err());
        assert!(table.get("").await.is_err());

        table.del("k").await?;
        assert_eq!(table.get("k").await?, None);
        assert_eq!(table.size().await?, 0);
        assert!(table.getkeys().await?.is_empty());
        table.disconnect().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn read_repair() -> Result<(), QuorumKvError> {
        let (addrs, _terms) =
            spawn_cluster("/tmp/test-quorumkv-qt-1", 3).await?;
        let delay = Duration::from_millis(20);
        let mut remotes = vec![];
        for &addr in &addrs {
            remotes.push(RemoteTable::connect(addr, delay).await?);
        }
        remotes[0].put("key", b"old", 5).await?;
        remotes[1].put("key", b"new", 7).await?;
        remotes[2].put("key", b"new", 7).await?;

        let mut table = QuorumTable::connect(&addrs, 1, &test_config()).await?;
        assert_eq!(table.get("key").await?, Some((b"new".to_vec(), 7)));

        // a read quorum may not include replica 0; read from all until it
        // shows up as stale and gets repaired
        let mut repaired = false;
        for _ in 0..100 {
            if remotes[0].get_timestamp("key").await? == 7 {
                repaired = true;
                break;
            }
            table.get("key").await?;
            time::sleep(Duration::from_millis(20)).await;
        }
        assert!(repaired);
        assert_eq!(remotes[0].get("key").await?, (b"new".to_vec(), 7));
        table.disconnect().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn put_exhausted_timestamp() -> Result<(), QuorumKvError> {
        let (addrs, _terms) =
            spawn_cluster("/tmp/test-quorumkv-qt-4", 3).await?;
        let delay = Duration::from_millis(20);
        for &addr in &addrs {
            let mut remote = RemoteTable::connect(addr, delay).await?;
            remote.put("k", b"x", u64::MAX).await?;
        }

        let mut table = QuorumTable::connect(&addrs, 7, &test_config()).await?;
        assert!(table.put("k", b"lost").await.is_err());
        assert!(table.del("k").await.is_err());
        assert_eq!(table.get("k").await?, Some((b"x".to_vec(), u64::MAX)));
        table.disconnect().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_replica_down() -> Result<(), QuorumKvError> {
        let (mut addrs, _terms) =
            spawn_cluster("/tmp/test-quorumkv-qt-2", 2).await?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        addrs.push(listener.local_addr()?);
        drop(listener);

        let mut table = QuorumTable::connect(&addrs, 2, &test_config()).await?;
        let ts = table.put("k", b"v").await?;
        assert_eq!(table.get("k").await?, Some((b"v".to_vec(), ts)));
        table.disconnect().await?;

        // two of three down leaves no majority
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        addrs[1] = listener.local_addr()?;
        drop(listener);
        assert!(QuorumTable::connect(&addrs, 2, &test_config()).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn size_average_and_most_keys() -> Result<(), QuorumKvError> {
        let (addrs, _terms) =
            spawn_cluster("/tmp/test-quorumkv-qt-3", 3).await?;
        let delay = Duration::from_millis(20);
        for (i, &addr) in addrs.iter().enumerate() {
            let mut remote = RemoteTable::connect(addr, delay).await?;
            let count = [10, 12, 11][i];
            for k in 0..count {
                remote.put(&format!("key{}", k), b"v", 1000).await?;
            }
        }

        let mut table = QuorumTable::connect(&addrs, 3, &test_config()).await?;
        // majority of {10, 12, 11}: pairs average to 11 or 10
        let size = table.size().await?;
        assert!(size == 10 || size == 11);
        let keys = table.getkeys().await?;
        assert!(keys.len() >= 11);
        table.disconnect().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_invalid() -> Result<(), QuorumKvError> {
        let addr: SocketAddr = "127.0.0.1:1".parse()?;
        assert!(QuorumTable::connect(&[addr], 1000, &test_config())
            .await
            .is_err());
        assert!(QuorumTable::connect(&[], 1, &test_config()).await.is_err());
        Ok(())
    }
}
