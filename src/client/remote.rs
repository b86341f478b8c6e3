//! Client connection stub to one table server.

use std::net::SocketAddr;

use crate::message::{Content, Message, Opcode, Timestamp};
use crate::utils::{
    safe_tcp_read_frame, tcp_connect_with_retry, tcp_write_frame,
    QuorumKvError,
};

use bytes::BytesMut;

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Connection stub to a single remote table server. Every exchange is one
/// request frame followed by one reply frame; a failed exchange is retried
/// once over a fresh connection after `retry_delay`.
pub struct RemoteTable {
    /// Server address.
    addr: SocketAddr,

    /// Established connection, `None` while disconnected.
    conn: Option<TcpStream>,

    /// Buffer for partially read reply frames.
    read_buf: BytesMut,

    /// Delay before the single retry of a failed exchange.
    retry_delay: Duration,
}

impl RemoteTable {
    /// Creates a stub in disconnected state.
    pub fn new(addr: SocketAddr, retry_delay: Duration) -> Self {
        RemoteTable {
            addr,
            conn: None,
            read_buf: BytesMut::with_capacity(4 + 1024),
            retry_delay,
        }
    }

    /// Creates a stub and connects it.
    pub async fn connect(
        addr: SocketAddr,
        retry_delay: Duration,
    ) -> Result<Self, QuorumKvError> {
        let mut remote = Self::new(addr, retry_delay);
        remote.reconnect().await?;
        Ok(remote)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Makes one attempt at (re-)establishing the connection.
    pub async fn reconnect(&mut self) -> Result<(), QuorumKvError> {
        self.conn = None;
        self.read_buf.clear();
        let stream =
            tcp_connect_with_retry(self.addr, 0, self.retry_delay).await?;
        self.conn = Some(stream);
        Ok(())
    }

    /// Drops the connection.
    pub fn disconnect(&mut self) {
        self.conn = None;
        self.read_buf.clear();
    }

    async fn exchange(&mut self, req: &[u8]) -> Result<Message, QuorumKvError> {
        let conn = match self.conn {
            Some(ref mut conn) => conn,
            None => return Err(QuorumKvError::msg("not connected")),
        };
        tcp_write_frame(conn, req).await?;
        let reply = safe_tcp_read_frame(&mut self.read_buf, conn).await?;
        Message::decode(&reply)
    }

    /// Sends a request and waits for its reply. On I/O failure, waits
    /// `retry_delay`, reconnects, and retries the exchange once.
    pub async fn send_receive(
        &mut self,
        req: &Message,
    ) -> Result<Message, QuorumKvError> {
        let req_bytes = req.encode();
        match self.exchange(&req_bytes).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                pf_debug!(
                    "exchange with {} failed: {}, retrying once",
                    self.addr,
                    e
                );
                self.disconnect();
                time::sleep(self.retry_delay).await;
                let retried = match self.reconnect().await {
                    Ok(()) => self.exchange(&req_bytes).await,
                    Err(e) => Err(e),
                };
                if retried.is_err() {
                    self.disconnect();
                }
                retried
            }
        }
    }

    /// Sends a request and checks the reply carries the matching opcode.
    async fn request(
        &mut self,
        opcode: Opcode,
        content: Content,
    ) -> Result<Content, QuorumKvError> {
        let reply = self.send_receive(&Message::new(opcode, content)).await?;
        if Some(reply.opcode) != opcode.reply() {
            return Err(QuorumKvError(format!(
                "unexpected reply {:?} to {:?} from {}",
                reply.opcode, opcode, self.addr
            )));
        }
        Ok(reply.content)
    }

    fn unexpected(&self, content: Content) -> QuorumKvError {
        QuorumKvError(format!(
            "unexpected reply content type {} from {}",
            content.c_type(),
            self.addr
        ))
    }

    /// Stores `payload` under `key` with timestamp `ts`.
    pub async fn put(
        &mut self,
        key: &str,
        payload: &[u8],
        ts: Timestamp,
    ) -> Result<(), QuorumKvError> {
        let content = Content::Entry {
            key: key.into(),
            payload: payload.to_vec(),
            ts,
        };
        match self.request(Opcode::Put, content).await? {
            Content::Result(0) => Ok(()),
            Content::Result(r) => {
                Err(QuorumKvError(format!("put '{}' returned {}", key, r)))
            }
            other => Err(self.unexpected(other)),
        }
    }

    /// Fetches the payload and timestamp of `key`; an absent key yields an
    /// empty payload with timestamp 0.
    pub async fn get(
        &mut self,
        key: &str,
    ) -> Result<(Vec<u8>, Timestamp), QuorumKvError> {
        match self.request(Opcode::Get, Content::Key(key.into())).await? {
            Content::Value { payload, ts } => Ok((payload, ts)),
            other => Err(self.unexpected(other)),
        }
    }

    /// Removes `key` from the server outright. Returns `false` if absent.
    pub async fn del(&mut self, key: &str) -> Result<bool, QuorumKvError> {
        match self.request(Opcode::Del, Content::Key(key.into())).await? {
            Content::Result(r) => Ok(r == 0),
            other => Err(self.unexpected(other)),
        }
    }

    /// Number of live records on the server.
    pub async fn size(&mut self) -> Result<usize, QuorumKvError> {
        match self.request(Opcode::Size, Content::Result(0)).await? {
            Content::Result(r) if r >= 0 => Ok(r as usize),
            other => Err(self.unexpected(other)),
        }
    }

    /// Keys of all live records on the server.
    pub async fn getkeys(&mut self) -> Result<Vec<String>, QuorumKvError> {
        match self.request(Opcode::GetKeys, Content::Result(0)).await? {
            Content::Keys(keys) => Ok(keys),
            other => Err(self.unexpected(other)),
        }
    }

    /// Timestamp of `key` on the server, 0 if never written there.
    pub async fn get_timestamp(
        &mut self,
        key: &str,
    ) -> Result<Timestamp, QuorumKvError> {
        match self.request(Opcode::GetTs, Content::Key(key.into())).await? {
            Content::Timestamp(ts) => Ok(ts),
            other => Err(self.unexpected(other)),
        }
    }
}

#[cfg(test)]
mod remote_tests {
    use super::*;
    use crate::server::{ServerConfig, TableServer};
    use tokio::sync::watch;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_ops() -> Result<(), QuorumKvError> {
        let mut server = TableServer::new_and_setup(
            0,
            "127.0.0.1:0".parse()?,
            "/tmp/test-quorumkv-rt-0",
            ServerConfig::default(),
            true,
        )
        .await?;
        let addr = server.api_addr();
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move { server.run(rx_term).await });

        let mut remote =
            RemoteTable::connect(addr, Duration::from_millis(50)).await?;
        assert!(remote.is_connected());
        remote.put("a", b"1", 1000).await?;
        remote.put("b", b"2", 1000).await?;
        assert_eq!(remote.get("a").await?, (b"1".to_vec(), 1000));
        assert_eq!(remote.get("zzz").await?, (vec![], 0));
        assert_eq!(remote.get_timestamp("b").await?, 1000);
        assert_eq!(remote.size().await?, 2);
        let mut keys = remote.getkeys().await?;
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert!(remote.del("a").await?);
        assert!(!remote.del("a").await?);
        assert_eq!(remote.size().await?, 1);

        // exchange survives a dropped connection via the single retry
        remote.disconnect();
        assert_eq!(remote.get_timestamp("b").await?, 1000);

        tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn remote_unreachable() -> Result<(), QuorumKvError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        assert!(RemoteTable::connect(addr, Duration::from_millis(10))
            .await
            .is_err());
        let mut remote = RemoteTable::new(addr, Duration::from_millis(10));
        assert!(remote.get("k").await.is_err());
        assert!(!remote.is_connected());
        Ok(())
    }
}
