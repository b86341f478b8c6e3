//! Table server: configuration, setup, and the main event loop.

use std::net::SocketAddr;

use crate::server::external::ExternalApi;
use crate::server::skeleton::invoke;
use crate::server::{LocalStore, PersistenceManager, PersistentTable, SyncMode};
use crate::utils::QuorumKvError;

use serde::Deserialize;

use tokio::sync::watch;

/// Server replica ID type.
pub type ReplicaId = u8;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Number of bucket lists of the local store.
    pub n_lists: usize,

    /// Log size threshold in bytes that triggers checkpointing.
    pub max_log_size: usize,

    /// Durability mode of log appends.
    pub sync_mode: SyncMode,

    /// Maximum number of client connections open at once.
    pub max_conns: usize,

    /// Capacity of the request channel.
    pub chan_req_cap: usize,

    /// Capacity of each per-connection reply channel.
    pub chan_reply_cap: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            n_lists: 32,
            max_log_size: 1 << 20,
            sync_mode: SyncMode::Buffered,
            max_conns: 9,
            chan_req_cap: 1000,
            chan_reply_cap: 100,
        }
    }
}

impl ServerConfig {
    /// Parses the config from an optional TOML string over default values.
    pub fn parse(config_str: Option<&str>) -> Result<Self, QuorumKvError> {
        parsed_config!(config_str => ServerConfig;
                       n_lists, max_log_size, sync_mode, max_conns,
                       chan_req_cap, chan_reply_cap)
    }
}

/// A table server instance.
pub struct TableServer {
    /// Server ID, used in logging only.
    id: ReplicaId,

    /// ExternalApi module.
    external_api: ExternalApi,

    /// Persistent table holding the data.
    table: PersistentTable,
}

impl TableServer {
    /// Creates a new table server: opens (and possibly recovers) the
    /// persistent table under file prefix `name`, then starts accepting
    /// clients on `api_addr`. With `fresh` set, previously persisted files
    /// are removed first.
    pub async fn new_and_setup(
        id: ReplicaId,
        api_addr: SocketAddr,
        name: &str,
        config: ServerConfig,
        fresh: bool,
    ) -> Result<Self, QuorumKvError> {
        let mut pmanager = PersistenceManager::new_and_setup(
            name,
            config.max_log_size,
            config.sync_mode,
        )
        .await?;
        if fresh {
            pf_info!("removing persisted files of '{}'", name);
            pmanager.destroy_clear().await?;
        }
        let store = LocalStore::new(config.n_lists)?;
        let table = PersistentTable::open(store, pmanager).await?;

        let external_api = ExternalApi::new_and_setup(
            api_addr,
            config.max_conns,
            config.chan_req_cap,
            config.chan_reply_cap,
        )
        .await?;
        pf_info!(
            "server {} serving '{}' on {}",
            id,
            name,
            external_api.api_addr()
        );

        Ok(TableServer {
            id,
            external_api,
            table,
        })
    }

    /// Address clients should connect to.
    pub fn api_addr(&self) -> SocketAddr {
        self.external_api.api_addr()
    }

    /// Main event loop: handles one request at a time to completion until
    /// a termination signal arrives, then closes the table cleanly.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), QuorumKvError> {
        loop {
            tokio::select! {
                // client request
                req = self.external_api.get_req() => {
                    let (conn, req) = req?;
                    let reply = invoke(&mut self.table, req).await;
                    if let Err(e) = self.external_api.send_reply(reply, conn).await {
                        pf_warn!("error replying to {}: {}", conn, e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("server {} caught termination signal", self.id);
                    break;
                }
            }
        }

        self.table.close().await
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use crate::message::{Content, Message, Opcode};
    use crate::utils::{
        safe_tcp_read_frame, tcp_connect_with_retry, tcp_write_frame,
    };
    use bytes::BytesMut;
    use tokio::time::Duration;

    #[test]
    fn parse_config() -> Result<(), QuorumKvError> {
        let config = ServerConfig::parse(Some(
            "n_lists = 5\nsync_mode = 'FullSync'\nmax_conns = 2",
        ))?;
        assert_eq!(config.n_lists, 5);
        assert_eq!(config.sync_mode, SyncMode::FullSync);
        assert_eq!(config.max_conns, 2);
        assert_eq!(config.max_log_size, ServerConfig::default().max_log_size);
        assert!(ServerConfig::parse(Some("sync_mode = 'Sometimes'")).is_err());
        assert!(ServerConfig::parse(Some("batch_size = 3")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serve_then_terminate() -> Result<(), QuorumKvError> {
        let name = "/tmp/test-quorumkv-srv-0";
        let mut server = TableServer::new_and_setup(
            0,
            "127.0.0.1:0".parse()?,
            name,
            ServerConfig::default(),
            true,
        )
        .await?;
        let api_addr = server.api_addr();
        let (tx_term, rx_term) = watch::channel(false);
        let server_handle = tokio::spawn(async move {
            server.run(rx_term).await?;
            Ok::<_, QuorumKvError>(server)
        });

        let mut stream =
            tcp_connect_with_retry(api_addr, 3, Duration::from_millis(50))
                .await?;
        let mut read_buf = BytesMut::new();
        let put = Message::new(
            Opcode::Put,
            Content::Entry {
                key: "k".into(),
                payload: b"v".to_vec(),
                ts: 1000,
            },
        );
        tcp_write_frame(&mut stream, &put.encode()).await?;
        let reply = safe_tcp_read_frame(&mut read_buf, &mut stream).await?;
        assert_eq!(
            Message::decode(&reply)?,
            Message::new(Opcode::PutReply, Content::Result(0))
        );

        tx_term.send(true)?;
        let server = server_handle.await??;
        drop(server);

        // the put survives a restart
        let server = TableServer::new_and_setup(
            0,
            "127.0.0.1:0".parse()?,
            name,
            ServerConfig::default(),
            false,
        )
        .await?;
        assert_eq!(server.table.get_timestamp("k"), 1000);
        server.table.destroy().await
    }
}
