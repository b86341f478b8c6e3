//! Safe TCP bind/connect/read/write helper functions for length-prefixed
//! frames (4-byte big-endian length followed by that many bytes).

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::QuorumKvError;

/// Length of the frame length header.
pub(crate) const FRAME_HDR_LEN: usize = 4;

/// Upper bound on a single frame's length, to refuse absurd length headers
/// coming from a misbehaving peer.
pub(crate) const FRAME_MAX_LEN: usize = 64 * 1024 * 1024;

/// Receives one frame from TCP readable connection `conn_read`, using
/// `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(bytes)` if successful; upon returning, consumed bytes are removed
///     from the read buffer
///   - `Err(err)` if the peer closed the connection or any unexpected error
///     occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u32()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and those two methods are not cancellation-safe. Instead, in the case
/// of being cancelled midway before receiving the entire frame (note that
/// such cancellation can only happen at `.await` points), bytes already read
/// are stored in the read buffer and will continue to be appended by future
/// invocations until successful returning.
pub(crate) async fn safe_tcp_read_frame<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<Vec<u8>, QuorumKvError>
where
    Conn: AsyncReadExt + Unpin,
{
    // read length of frame first
    if read_buf.capacity() < FRAME_HDR_LEN {
        read_buf.reserve(FRAME_HDR_LEN - read_buf.capacity());
    }
    while read_buf.len() < FRAME_HDR_LEN {
        // frame_len not wholesomely read from socket before last cancellation
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(QuorumKvError::msg("connection closed by peer"));
        }
    }
    let mut hdr = [0u8; FRAME_HDR_LEN];
    hdr.copy_from_slice(&read_buf[..FRAME_HDR_LEN]);
    let frame_len = u32::from_be_bytes(hdr) as usize;
    if frame_len > FRAME_MAX_LEN {
        return Err(QuorumKvError(format!(
            "frame length {} exceeds limit {}",
            frame_len, FRAME_MAX_LEN
        )));
    }

    // then read the frame body itself
    let frame_end = FRAME_HDR_LEN + frame_len;
    if read_buf.capacity() < frame_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(frame_end - read_buf.capacity());
    }
    while read_buf.len() < frame_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(QuorumKvError::msg("connection closed mid-frame"));
        }
    }
    let frame = read_buf[FRAME_HDR_LEN..frame_end].to_vec();

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    if read_buf.len() > frame_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[frame_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(frame)
}

/// Sends one frame containing `bytes` to TCP writable connection
/// `conn_write`. Not cancellation-safe; callers must not use it as a
/// `tokio::select!` branch.
pub(crate) async fn tcp_write_frame<Conn>(
    conn_write: &mut Conn,
    bytes: &[u8],
) -> Result<(), QuorumKvError>
where
    Conn: AsyncWriteExt + Unpin,
{
    if bytes.len() > FRAME_MAX_LEN {
        return Err(QuorumKvError(format!(
            "frame length {} exceeds limit {}",
            bytes.len(),
            FRAME_MAX_LEN
        )));
    }
    conn_write.write_u32(bytes.len() as u32).await?; // send length first
    conn_write.write_all(bytes).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, QuorumKvError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let bound = socket.bind(bind_addr).and_then(|_| socket.listen(1024));
        match bound {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
    backoff: Duration,
) -> Result<TcpStream, QuorumKvError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(backoff).await;
            }
        }
    }
}
