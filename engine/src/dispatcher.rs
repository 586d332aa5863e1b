use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use keyframe_stream_common::frame::{round1, StreamResult};
use keyframe_stream_common::protocol::{ServerMessage, StatsSnapshot};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stats::StreamStats;

/// Build the outbound `result` message for a processed keyframe.
pub fn result_message(result: &StreamResult, stats: StatsSnapshot) -> ServerMessage {
    ServerMessage::Result {
        seq: result.seq,
        timestamp: result.timestamp,
        garments: result.garment_summaries.clone(),
        processing_ms: round1(result.processing_ms),
        stats,
    }
}

/// Forwards processed results, and a periodic stats beacon, to the outbound
/// queue. Results leave in the order the processing loop produced them.
pub struct ResultDispatcher {
    results: mpsc::Receiver<StreamResult>,
    outbound: mpsc::Sender<ServerMessage>,
    stats: Arc<StreamStats>,
    cancel: CancellationToken,
    result_wait: Duration,
    stats_interval: Duration,
}

impl ResultDispatcher {
    pub fn new(
        results: mpsc::Receiver<StreamResult>,
        outbound: mpsc::Sender<ServerMessage>,
        stats: Arc<StreamStats>,
        cancel: CancellationToken,
        result_wait: Duration,
        stats_interval: Duration,
    ) -> Self {
        Self {
            results,
            outbound,
            stats,
            cancel,
            result_wait,
            stats_interval,
        }
    }

    pub async fn run(mut self) {
        let mut beacon =
            tokio::time::interval_at(Instant::now() + self.stats_interval, self.stats_interval);
        beacon.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut forwarded: u64 = 0;

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = beacon.tick() => ServerMessage::Stats(self.stats.snapshot()),
                next = tokio::time::timeout(self.result_wait, self.results.recv()) => match next {
                    Err(_) => continue,
                    Ok(None) => {
                        debug!("result channel closed");
                        break;
                    }
                    Ok(Some(result)) => {
                        forwarded += 1;
                        result_message(&result, self.stats.snapshot())
                    }
                },
            };

            // The writer may be stalled on a client that stopped reading.
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = self.outbound.send(message) => sent,
            };
            if sent.is_err() {
                debug!("outbound queue closed, stopping dispatcher");
                break;
            }
        }

        info!(forwarded, "result dispatcher stopped");
    }
}

/// Drain the outbound queue into the transport until every sender is gone,
/// then close the transport. A send failure cancels the session.
pub async fn write_outbound<K>(
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut sink: K,
    cancel: CancellationToken,
) where
    K: Sink<ServerMessage> + Unpin,
    K::Error: Display,
{
    while let Some(message) = outbound.recv().await {
        let kind = message.kind();
        if let Err(e) = sink.send(message).await {
            warn!(kind, error = %e, "outbound send failed, closing session");
            cancel.cancel();
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "transport already closed");
    }
}
