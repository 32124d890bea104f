//! Fan-out TCP publisher with a per-link drop-oldest high-water-mark

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::queue::{DropOldestQueue, Push, QueueStats};
use crate::transport::{
    io_runtime, resolve, shutdown_runtime, write_frame, LinkMode, Publish, PublishOutcome,
    ACCEPT_BACKOFF, CONNECT_TIMEOUT, MAX_FRAME_LEN,
};
use crate::TransportConfig;

/// One subscriber connection and the task draining its queue onto it
struct Link {
    peer: String,
    queue: Arc<DropOldestQueue<Bytes>>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct Links {
    active: Vec<Link>,
    /// Totals of links that have gone away
    retired: QueueStats,
}

impl Links {
    /// Close the link's queue and cancel its writer. Dropping the writer's
    /// socket also releases a write stuck on a stalled peer.
    fn retire(&mut self, link: Link) {
        link.queue.close();
        link.writer.abort();
        let stats = link.queue.stats();
        self.retired.pushed += stats.pushed;
        self.retired.popped += stats.popped;
        self.retired.dropped += stats.dropped;
        self.retired.peak = self.retired.peak.max(stats.peak);
    }
}

/// Publishes framed envelopes to every connected subscriber.
///
/// Each link owns a bounded queue of `high_water_mark` messages. Publishing
/// never waits on the network: when a link is full its oldest message is
/// evicted. Sockets are driven by a private tokio runtime, so the publisher
/// can be used from plain threads.
pub struct TcpPublisher {
    /// `None` once closed
    runtime: Option<Runtime>,
    links: Arc<Mutex<Links>>,
    acceptor: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    mode: LinkMode,
}

impl TcpPublisher {
    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        match config.mode {
            LinkMode::Bind => Self::bind(&config.endpoint, config.high_water_mark),
            LinkMode::Connect => Self::connect(
                &config.endpoint,
                config.high_water_mark,
                config.reconnect_interval(),
            ),
        }
    }

    /// Listen on `endpoint` and accept subscribers in the background.
    pub fn bind(endpoint: &str, high_water_mark: usize) -> Result<Self, TransportError> {
        if high_water_mark == 0 {
            return Err(TransportError::InvalidHighWaterMark);
        }
        // Bind synchronously so address errors surface here
        let listener = std::net::TcpListener::bind(resolve(endpoint)?)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = io_runtime("publish-io")?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };
        let links = Arc::new(Mutex::new(Links::default()));
        let acceptor = runtime.spawn(accept_loop(listener, links.clone(), high_water_mark));
        info!("Publishing on {}", local_addr);

        Ok(Self {
            runtime: Some(runtime),
            links,
            acceptor: Some(acceptor),
            local_addr: Some(local_addr),
            mode: LinkMode::Bind,
        })
    }

    /// Dial a listening subscriber at `endpoint`, redialing every
    /// `reconnect` while the link is down. Messages published meanwhile wait
    /// in the queue, subject to the same high-water-mark.
    pub fn connect(
        endpoint: &str,
        high_water_mark: usize,
        reconnect: Duration,
    ) -> Result<Self, TransportError> {
        let addr = resolve(endpoint)?;
        let queue = Arc::new(DropOldestQueue::new(high_water_mark)?);
        let runtime = io_runtime("publish-io")?;
        let writer = runtime.spawn(dial_loop(addr, queue.clone(), reconnect));
        info!("Publishing to {}", addr);

        let links = Links {
            active: vec![Link {
                peer: addr.to_string(),
                queue,
                writer,
            }],
            retired: QueueStats::default(),
        };

        Ok(Self {
            runtime: Some(runtime),
            links: Arc::new(Mutex::new(links)),
            acceptor: None,
            local_addr: None,
            mode: LinkMode::Connect,
        })
    }

    /// Bound address in bind mode
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn link_count(&self) -> usize {
        lock(&self.links)
            .active
            .iter()
            .filter(|link| !link.queue.is_closed())
            .count()
    }

    /// Queue statistics summed over every link this publisher has had
    pub fn queue_stats(&self) -> QueueStats {
        let links = lock(&self.links);
        links
            .active
            .iter()
            .map(|link| link.queue.stats())
            .fold(links.retired, |acc, stats| QueueStats {
                pushed: acc.pushed + stats.pushed,
                popped: acc.popped + stats.popped,
                dropped: acc.dropped + stats.dropped,
                peak: acc.peak.max(stats.peak),
            })
    }
}

impl Publish for TcpPublisher {
    fn publish(&mut self, payload: Bytes) -> Result<PublishOutcome, TransportError> {
        if self.runtime.is_none() {
            return Err(TransportError::Closed);
        }
        if payload.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }

        let mut links = lock(&self.links);
        if self.mode == LinkMode::Bind {
            // Writers close their queue when the peer goes away
            let (dead, live): (Vec<_>, Vec<_>) = links
                .active
                .drain(..)
                .partition(|link| link.queue.is_closed());
            links.active = live;
            for link in dead {
                debug!("Subscriber {} gone", link.peer);
                links.retire(link);
            }
        }

        let mut outcome = PublishOutcome::default();
        for link in &links.active {
            match link.queue.push(payload.clone()) {
                Push::Queued => outcome.links += 1,
                Push::Evicted(_) => {
                    outcome.links += 1;
                    outcome.dropped += 1;
                }
                Push::Closed(_) => {}
            }
        }
        if outcome.dropped > 0 {
            metrics::counter!("panostream_transport_evictions").increment(outcome.dropped as u64);
        }
        Ok(outcome)
    }

    /// Stop accepting and disconnect every subscriber. Queued messages are
    /// discarded. Idempotent.
    fn close(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        {
            let mut links = lock(&self.links);
            let active: Vec<_> = links.active.drain(..).collect();
            for link in active {
                links.retire(link);
            }
        }
        shutdown_runtime(runtime);
        info!("Publisher closed");
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accept_loop(listener: TcpListener, links: Arc<Mutex<Links>>, high_water_mark: usize) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        match open_link(stream, peer, high_water_mark) {
            Ok(link) => {
                info!("Subscriber connected from {}", peer);
                lock(&links).active.push(link);
            }
            Err(e) => warn!("Dropping subscriber {}: {}", peer, e),
        }
    }
}

fn open_link(
    mut stream: TcpStream,
    peer: SocketAddr,
    high_water_mark: usize,
) -> Result<Link, TransportError> {
    stream.set_nodelay(true)?;
    let queue = Arc::new(DropOldestQueue::new(high_water_mark)?);

    let drained = queue.clone();
    let writer = tokio::spawn(async move {
        if let Err(e) = pump(&drained, &mut stream).await {
            info!("Subscriber {} disconnected: {}", peer, e);
        }
        drained.close();
    });

    Ok(Link {
        peer: peer.to_string(),
        queue,
        writer,
    })
}

async fn dial_loop(addr: SocketAddr, queue: Arc<DropOldestQueue<Bytes>>, reconnect: Duration) {
    while !queue.is_closed() {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                info!("Connected to subscriber {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Cannot disable Nagle on {}: {}", addr, e);
                }
                if let Err(e) = pump(&queue, &mut stream).await {
                    warn!("Link to {} lost: {}", addr, e);
                }
            }
            Ok(Err(e)) => debug!("Connect to {} failed: {}", addr, e),
            Err(_) => debug!("Connect to {} timed out", addr),
        }
        sleep(reconnect).await;
    }
}

/// Drain `queue` onto `stream` until the queue closes or the socket fails.
async fn pump(
    queue: &DropOldestQueue<Bytes>,
    stream: &mut TcpStream,
) -> Result<(), TransportError> {
    while let Some(payload) = queue.pop().await {
        write_frame(stream, &payload).await?;
    }
    Ok(())
}
