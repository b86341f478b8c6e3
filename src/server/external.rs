//! Table server external API module implementation.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::message::Message;
use crate::utils::{
    safe_tcp_read_frame, tcp_bind_with_retry, tcp_write_frame, QuorumKvError,
};

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Server-local connection ID type.
pub type ConnId = u64;

/// The external client-facing API module. Accepts connections and funnels
/// decoded requests from all of them into one req channel; replies are
/// routed back by connection ID.
pub(crate) struct ExternalApi {
    /// Actual address the listener is bound to.
    api_addr: SocketAddr,

    /// Receiver side of the req channel.
    rx_req: mpsc::Receiver<(ConnId, Message)>,

    /// Map from connection ID -> sender side of its reply channel, shared
    /// with the connection acceptor thread.
    tx_replies: flashmap::ReadHandle<ConnId, mpsc::Sender<Message>>,

    /// Join handle of the connection acceptor thread.
    conn_acceptor_handle: JoinHandle<()>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module. Binds the listener and spawns the
    /// connection acceptor thread, which keeps at most `max_conns` client
    /// connections open at once.
    pub(crate) async fn new_and_setup(
        api_addr: SocketAddr,
        max_conns: usize,
        chan_req_cap: usize,
        chan_reply_cap: usize,
    ) -> Result<Self, QuorumKvError> {
        if max_conns == 0 {
            return logged_err!("invalid max_conns {}", max_conns);
        }
        if chan_req_cap == 0 {
            return logged_err!("invalid chan_req_cap {}", chan_req_cap);
        }
        if chan_reply_cap == 0 {
            return logged_err!("invalid chan_reply_cap {}", chan_reply_cap);
        }

        let (tx_req, rx_req) = mpsc::channel(chan_req_cap);

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ConnId, mpsc::Sender<Message>>();

        let conn_listener = tcp_bind_with_retry(api_addr, 3).await?;
        let api_addr = conn_listener.local_addr()?;

        let conn_acceptor_handle = tokio::spawn(Self::conn_acceptor_thread(
            max_conns,
            tx_req,
            chan_reply_cap,
            conn_listener,
            tx_replies_write,
        ));

        Ok(ExternalApi {
            api_addr,
            rx_req,
            tx_replies: tx_replies_read,
            conn_acceptor_handle,
        })
    }

    /// Address the API is listening on.
    pub(crate) fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    /// Waits for the next request from any connection. Cancellation-safe.
    pub(crate) async fn get_req(
        &mut self,
    ) -> Result<(ConnId, Message), QuorumKvError> {
        match self.rx_req.recv().await {
            Some((conn, req)) => Ok((conn, req)),
            None => logged_err!("req channel has been closed"),
        }
    }

    /// Sends a reply back to the given connection.
    pub(crate) async fn send_reply(
        &mut self,
        reply: Message,
        conn: ConnId,
    ) -> Result<(), QuorumKvError> {
        let tx_reply = self.tx_replies.guard().get(&conn).cloned();
        match tx_reply {
            Some(tx_reply) => {
                tx_reply.send(reply).await?;
                Ok(())
            }
            None => {
                logged_err!("connection {} not found among active ones", conn)
            }
        }
    }
}

impl Drop for ExternalApi {
    fn drop(&mut self) {
        // servants exit once their reply channels get closed
        self.conn_acceptor_handle.abort();
    }
}

// ExternalApi conn_acceptor thread implementation
impl ExternalApi {
    /// Connection acceptor thread function.
    async fn conn_acceptor_thread(
        max_conns: usize,
        tx_req: mpsc::Sender<(ConnId, Message)>,
        chan_reply_cap: usize,
        conn_listener: TcpListener,
        mut tx_replies: flashmap::WriteHandle<ConnId, mpsc::Sender<Message>>,
    ) {
        pf_debug!("conn_acceptor thread spawned");

        let mut servant_handles: HashMap<ConnId, JoinHandle<()>> =
            HashMap::new();
        let mut next_conn: ConnId = 0;

        loop {
            let (stream, addr) = match conn_listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!("error accepting connection: {}", e);
                    continue;
                }
            };

            // garbage collect connections that have gone away
            let gone: Vec<ConnId> = servant_handles
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(&conn, _)| conn)
                .collect();
            if !gone.is_empty() {
                let mut tx_replies_guard = tx_replies.guard();
                for conn in gone {
                    servant_handles.remove(&conn);
                    tx_replies_guard.remove(conn);
                }
                tx_replies_guard.publish();
            }

            if servant_handles.len() >= max_conns {
                pf_warn!(
                    "refusing connection from {}: {} already open",
                    addr,
                    servant_handles.len()
                );
                continue; // dropping the stream closes it
            }

            let conn = next_conn;
            next_conn += 1;
            pf_info!("accepted connection {} from {}", conn, addr);

            let (tx_reply, rx_reply) = mpsc::channel(chan_reply_cap);
            let mut tx_replies_guard = tx_replies.guard();
            tx_replies_guard.insert(conn, tx_reply);
            tx_replies_guard.publish();

            let servant_handle = tokio::spawn(Self::conn_servant_thread(
                conn,
                addr,
                stream,
                tx_req.clone(),
                rx_reply,
            ));
            servant_handles.insert(conn, servant_handle);
        }
    }
}

// ExternalApi conn_servant thread implementation
impl ExternalApi {
    /// Connection request reader and reply writer thread function.
    async fn conn_servant_thread(
        conn: ConnId,
        addr: SocketAddr,
        mut stream: TcpStream,
        tx_req: mpsc::Sender<(ConnId, Message)>,
        mut rx_reply: mpsc::Receiver<Message>,
    ) {
        pf_debug!("conn_servant thread for {} ({}) spawned", conn, addr);

        let (mut conn_read, mut conn_write) = stream.split();
        let mut read_buf = BytesMut::with_capacity(4 + 1024);

        loop {
            tokio::select! {
                // select between getting a new reply to send back and
                // receiving a new request, prioritizing the former
                biased;

                // gets a reply to send back
                reply = rx_reply.recv() => {
                    match reply {
                        Some(reply) => {
                            if let Err(e) = tcp_write_frame(&mut conn_write, &reply.encode()).await {
                                pf_error!("error replying to {}: {}", conn, e);
                                break;
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // receives a request frame
                frame = safe_tcp_read_frame(&mut read_buf, &mut conn_read) => {
                    match frame {
                        Ok(frame) => match Message::decode(&frame) {
                            Ok(req) => {
                                pf_trace!("request from {} {:?}", conn, req);
                                if let Err(e) = tx_req.send((conn, req)).await {
                                    pf_error!("error sending to tx_req for {}: {}", conn, e);
                                    break;
                                }
                            },
                            Err(e) => {
                                pf_warn!("malformed request from {}: {}", conn, e);
                                let reply = Message::error().encode();
                                if let Err(e) = tcp_write_frame(&mut conn_write, &reply).await {
                                    pf_error!("error replying to {}: {}", conn, e);
                                    break;
                                }
                            },
                        },

                        Err(e) => {
                            pf_debug!("connection {} closed: {}", conn, e);
                            break;
                        }
                    }
                },
            }
        }

        pf_debug!("conn_servant thread for {} ({}) exitted", conn, addr);
    }
}
