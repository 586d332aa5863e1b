use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use keyframe_stream_common::frame::round1;
use keyframe_stream_common::protocol::StatsSnapshot;
use parking_lot::Mutex;

/// Rolling per-session counters.
///
/// Counters are written by the ingestion path (received/detected/skipped/
/// evicted) and the processing path (latency window, failures); readers take
/// a [`StatsSnapshot`].
pub struct StreamStats {
    frames_received: AtomicU64,
    keyframes_detected: AtomicU64,
    frames_skipped: AtomicU64,
    keyframes_evicted: AtomicU64,
    inference_failures: AtomicU64,
    /// 0 means no keyframe yet; sequence numbers start at 1.
    last_keyframe_seq: AtomicU64,
    latency: Mutex<LatencyWindow>,
    started: Mutex<(DateTime<Utc>, Instant)>,
}

struct LatencyWindow {
    samples: VecDeque<f64>,
    cap: usize,
    avg_ms: f64,
}

impl LatencyWindow {
    fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap: cap.max(1),
            avg_ms: 0.0,
        }
    }

    fn record(&mut self, ms: f64) {
        if self.samples.len() >= self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
        self.avg_ms = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.avg_ms = 0.0;
    }
}

impl StreamStats {
    pub fn new(latency_window: usize) -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            keyframes_detected: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            keyframes_evicted: AtomicU64::new(0),
            inference_failures: AtomicU64::new(0),
            last_keyframe_seq: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow::new(latency_window)),
            started: Mutex::new((Utc::now(), Instant::now())),
        }
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keyframe(&self, seq: u64) {
        self.keyframes_detected.fetch_add(1, Ordering::Relaxed);
        self.last_keyframe_seq.fetch_max(seq, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.keyframes_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inference_failure(&self) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a successful inference latency; returns the new rolling average.
    pub fn record_processing(&self, ms: f64) -> f64 {
        let mut window = self.latency.lock();
        window.record(ms);
        window.avg_ms
    }

    pub fn avg_processing_ms(&self) -> f64 {
        self.latency.lock().avg_ms
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn keyframes_detected(&self) -> u64 {
        self.keyframes_detected.load(Ordering::Relaxed)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    pub fn uptime_s(&self) -> f64 {
        self.started.lock().1.elapsed().as_secs_f64()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (session_start, started) = *self.started.lock();
        let uptime_s = started.elapsed().as_secs_f64();
        let frames_received = self.frames_received();
        let effective_fps = if uptime_s > 0.0 {
            frames_received as f64 / uptime_s
        } else {
            0.0
        };
        let last = self.last_keyframe_seq.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_received,
            keyframes_detected: self.keyframes_detected(),
            frames_skipped: self.frames_skipped(),
            keyframes_evicted: self.keyframes_evicted.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            avg_processing_ms: round1(self.avg_processing_ms()),
            last_keyframe_seq: (last > 0).then_some(last),
            effective_fps: round1(effective_fps),
            uptime_s: round1(uptime_s),
            session_start: session_start.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Zero every counter and restart the session clock.
    pub fn reset(&self) {
        for counter in [
            &self.frames_received,
            &self.keyframes_detected,
            &self.frames_skipped,
            &self.keyframes_evicted,
            &self.inference_failures,
            &self.last_keyframe_seq,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.latency.lock().clear();
        *self.started.lock() = (Utc::now(), Instant::now());
    }
}
