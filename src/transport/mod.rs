//! Outward network boundary: envelope codec and bounded publish/subscribe links
//!
//! Every message on the wire is a 4-byte big-endian length followed by the
//! MessagePack-encoded [`OutboundEnvelope`].

pub mod envelope;
pub mod publisher;
pub mod queue;
pub mod subscriber;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::TransportError;

pub use envelope::{CompressedImage, OutboundEnvelope};
pub use publisher::TcpPublisher;
pub use queue::{DropOldestQueue, QueueStats};
pub use subscriber::TcpSubscriber;

/// Upper bound on a single framed message
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// Bound on one dial attempt
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause after a failed accept, e.g. when out of file descriptors
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
/// How long closing waits for an endpoint's sockets to be released
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Which side of the TCP connection the publisher takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// Listen and fan out to every subscriber that connects
    Bind,
    /// Dial a listening subscriber, reconnecting when the link drops
    Connect,
}

/// Result of handing one message to the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Links the message was queued on
    pub links: usize,
    /// Older messages evicted to make room
    pub dropped: usize,
}

/// Sending half of the outbound transport.
///
/// Implementations must never block on a slow consumer: once a link's
/// queue is at its high-water-mark the oldest message is discarded.
pub trait Publish: Send {
    fn publish(&mut self, payload: Bytes) -> Result<PublishOutcome, TransportError>;

    fn close(&mut self);
}

/// Strip an optional `tcp://` scheme, leaving `host:port`.
pub fn parse_endpoint(endpoint: &str) -> Result<&str, TransportError> {
    let addr = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(addr),
        _ => Err(TransportError::Endpoint(endpoint.to_string())),
    }
}

pub(crate) fn resolve(endpoint: &str) -> Result<SocketAddr, TransportError> {
    parse_endpoint(endpoint)?
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Endpoint(endpoint.to_string()))
}

/// Small runtime driving one endpoint's sockets, independent of whatever
/// runtime (if any) the caller lives on.
pub(crate) fn io_runtime(name: &str) -> Result<Runtime, TransportError> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(name)
        .enable_all()
        .build()?;
    Ok(runtime)
}

/// Stop an endpoint's runtime, dropping its listener and links. Outside
/// async code this waits so a restarted run can rebind the same port.
pub(crate) fn shutdown_runtime(runtime: Runtime) {
    if Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
    }
}

pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. `Ok(None)` means the peer closed cleanly
/// between messages.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}
