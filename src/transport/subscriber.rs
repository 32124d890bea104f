//! Receiving end of the envelope stream, used by consumers and tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::envelope::{self, OutboundEnvelope};
use crate::transport::queue::{DropOldestQueue, Pop, Push, QueueStats};
use crate::transport::{
    io_runtime, read_frame, resolve, shutdown_runtime, ACCEPT_BACKOFF, CONNECT_TIMEOUT,
};

type Inbox = Arc<DropOldestQueue<Bytes>>;

/// Subscribes to a [`TcpPublisher`](super::TcpPublisher) stream.
///
/// Received messages wait in a bounded drop-oldest inbox, so a consumer
/// that falls behind sees the newest envelopes rather than stalling the
/// socket.
pub struct TcpSubscriber {
    /// `None` once closed
    runtime: Option<Runtime>,
    inbox: Inbox,
    local_addr: Option<SocketAddr>,
}

impl TcpSubscriber {
    /// Dial a binding publisher, reconnecting whenever the link drops.
    pub fn connect(
        endpoint: &str,
        high_water_mark: usize,
        reconnect: Duration,
    ) -> Result<Self, TransportError> {
        let addr = resolve(endpoint)?;
        let inbox = Arc::new(DropOldestQueue::new(high_water_mark)?);
        let runtime = io_runtime("subscribe-io")?;
        runtime.spawn(dial_loop(addr, inbox.clone(), reconnect));

        Ok(Self {
            runtime: Some(runtime),
            inbox,
            local_addr: None,
        })
    }

    /// Listen for dialing publishers.
    pub fn bind(endpoint: &str, high_water_mark: usize) -> Result<Self, TransportError> {
        let inbox = Arc::new(DropOldestQueue::new(high_water_mark)?);
        let listener = std::net::TcpListener::bind(resolve(endpoint)?)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = io_runtime("subscribe-io")?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };
        runtime.spawn(accept_loop(listener, inbox.clone()));
        info!("Subscriber listening on {}", local_addr);

        Ok(Self {
            runtime: Some(runtime),
            inbox,
            local_addr: Some(local_addr),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Next raw message, or `None` if nothing arrived within `timeout`
    pub fn recv_payload_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Bytes>, TransportError> {
        match self.inbox.pop_timeout(timeout) {
            Pop::Item(payload) => Ok(Some(payload)),
            Pop::Timeout => Ok(None),
            Pop::Closed => Err(TransportError::Closed),
        }
    }

    /// Next decoded and validated envelope
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<OutboundEnvelope>, TransportError> {
        self.recv_payload_timeout(timeout)?
            .map(|payload| envelope::decode(&payload))
            .transpose()
    }

    pub fn stats(&self) -> QueueStats {
        self.inbox.stats()
    }

    /// Disconnect every link and wake blocked receivers. Idempotent.
    pub fn close(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        self.inbox.close();
        shutdown_runtime(runtime);
    }
}

impl Drop for TcpSubscriber {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dial_loop(addr: SocketAddr, inbox: Inbox, reconnect: Duration) {
    while !inbox.is_closed() {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                info!("Subscribed to {}", addr);
                read_into(inbox.clone(), stream, addr).await;
            }
            Ok(Err(e)) => debug!("Connect to {} failed: {}", addr, e),
            Err(_) => debug!("Connect to {} timed out", addr),
        }
        sleep(reconnect).await;
    }
}

async fn accept_loop(listener: TcpListener, inbox: Inbox) {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Publisher connected from {}", peer);
                    readers.spawn(read_into(inbox.clone(), stream, peer));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                }
            },
            // Reap readers whose publisher has gone
            Some(_) = readers.join_next() => {}
        }
    }
}

/// Feed frames from `stream` into the inbox until EOF, error or close
async fn read_into(inbox: Inbox, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(payload)) => {
                if let Push::Closed(_) = inbox.push(payload) {
                    return;
                }
            }
            Ok(None) => {
                debug!("Publisher {} closed the link", peer);
                return;
            }
            Err(e) => {
                if !inbox.is_closed() {
                    warn!("Read from {} failed: {}", peer, e);
                }
                return;
            }
        }
    }
}
