//! Pipeline counters that outlive individual runs

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Shared counters, incremented from every pipeline thread and mirrored to
/// the `metrics` facade.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: CachePadded<AtomicU64>,
    images_encoded: CachePadded<AtomicU64>,
    encode_failures: CachePadded<AtomicU64>,
    envelopes_published: CachePadded<AtomicU64>,
    envelopes_dropped: CachePadded<AtomicU64>,
    partial_frames_discarded: CachePadded<AtomicU64>,
    rejected_outputs: CachePadded<AtomicU64>,
    dispatcher_stalls: CachePadded<AtomicU64>,
    restarts: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub images_encoded: u64,
    pub encode_failures: u64,
    pub envelopes_published: u64,
    /// Envelopes evicted by a full transport queue
    pub envelopes_dropped: u64,
    pub partial_frames_discarded: u64,
    /// Worker outputs refused by the aggregator, duplicate or surplus lenses
    pub rejected_outputs: u64,
    pub dispatcher_stalls: u64,
    pub restarts: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("panostream_frames_captured").increment(1);
    }

    pub fn image_encoded(&self) {
        self.images_encoded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("panostream_images_encoded").increment(1);
    }

    pub fn encode_failed(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("panostream_encode_failures").increment(1);
    }

    pub fn envelope_published(&self) {
        self.envelopes_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("panostream_envelopes_published").increment(1);
    }

    pub fn envelopes_dropped(&self, count: u64) {
        self.envelopes_dropped.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("panostream_envelopes_dropped").increment(count);
    }

    pub fn partial_frames_discarded(&self, count: u64) {
        self.partial_frames_discarded.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("panostream_partial_frames_discarded").increment(count);
    }

    pub fn output_rejected(&self) {
        self.rejected_outputs.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("panostream_rejected_outputs").increment(1);
    }

    pub fn dispatcher_stalled(&self) {
        self.dispatcher_stalls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("panostream_dispatcher_stalls").increment(1);
    }

    pub fn restarted(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("panostream_restarts").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            images_encoded: self.images_encoded.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            envelopes_published: self.envelopes_published.load(Ordering::Relaxed),
            envelopes_dropped: self.envelopes_dropped.load(Ordering::Relaxed),
            partial_frames_discarded: self.partial_frames_discarded.load(Ordering::Relaxed),
            rejected_outputs: self.rejected_outputs.load(Ordering::Relaxed),
            dispatcher_stalls: self.dispatcher_stalls.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}
