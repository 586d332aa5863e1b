use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use keyframe_stream_common::config::{Config, SelectorConfig};
use keyframe_stream_common::protocol::{ControlMessage, ServerMessage, StatsSnapshot};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, AuthValidator, SessionIdentity};
use crate::buffer::KeyframeBuffer;
use crate::dispatcher::{write_outbound, ResultDispatcher};
use crate::filter::KeyframeSelector;
use crate::inference::CaptureInferencePipeline;
use crate::ingest::FrameIngestor;
use crate::processing::ProcessingLoop;
use crate::stats::StreamStats;

/// How long a draining session waits for queued outbound messages to reach
/// the client before giving up on the transport.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound transport frame, independent of the wire library.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Binary(Bytes),
    Text(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why an active session started draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    StopRequested,
    ClientClosed,
    TransportError,
    OutboundClosed,
}

/// Per-session tunables, resolved from `[selector]` and `[stream]`.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub selector: SelectorConfig,
    pub buffer_capacity: usize,
    pub latency_window: usize,
    pub idle_wait: Duration,
    pub result_wait: Duration,
    pub stats_interval: Duration,
    pub result_queue: usize,
    pub outbound_queue: usize,
    pub flush_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let stream = &config.stream;
        Self {
            selector: config.selector.clone(),
            buffer_capacity: stream.buffer_capacity,
            latency_window: stream.latency_window,
            idle_wait: Duration::from_millis(stream.idle_wait_ms),
            result_wait: Duration::from_millis(stream.result_wait_ms),
            stats_interval: Duration::from_secs(stream.stats_interval_secs),
            result_queue: stream.result_queue,
            outbound_queue: stream.outbound_queue,
            flush_timeout: FLUSH_TIMEOUT,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A freshly accepted connection that has not been authenticated yet.
pub struct SessionController {
    state: SessionState,
    settings: SessionSettings,
    auth: Arc<dyn AuthValidator>,
    pipeline: Arc<dyn CaptureInferencePipeline>,
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        auth: Arc<dyn AuthValidator>,
        pipeline: Arc<dyn CaptureInferencePipeline>,
    ) -> Self {
        Self {
            state: SessionState::Connecting,
            settings,
            auth,
            pipeline,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        info!(from = %self.state, to = %next, "session state change");
        self.state = next;
    }

    /// Verify the connection token. On success the session's components are
    /// built and it becomes `Active`; on failure it is `Closed` and nothing
    /// else runs.
    pub fn authenticate(mut self, token: &str) -> Result<ActiveSession, AuthError> {
        self.transition(SessionState::Authenticating);
        match self.auth.verify(token) {
            Ok(identity) => {
                info!(identity = %identity, "session authenticated");
                self.transition(SessionState::Active);
                Ok(ActiveSession::new(identity, self.settings, self.pipeline))
            }
            Err(e) => {
                warn!(error = %e, "session rejected");
                self.transition(SessionState::Closed);
                Err(e)
            }
        }
    }
}

enum ControlOutcome {
    Reply(ServerMessage),
    Stop,
}

/// An authenticated session with its ingest, buffer and stats wired up.
pub struct ActiveSession {
    identity: SessionIdentity,
    state: SessionState,
    settings: SessionSettings,
    pipeline: Arc<dyn CaptureInferencePipeline>,
    ingestor: Arc<Mutex<FrameIngestor>>,
    buffer: Arc<KeyframeBuffer>,
    stats: Arc<StreamStats>,
    cancel: CancellationToken,
}

impl ActiveSession {
    fn new(
        identity: SessionIdentity,
        settings: SessionSettings,
        pipeline: Arc<dyn CaptureInferencePipeline>,
    ) -> Self {
        let buffer = Arc::new(KeyframeBuffer::new(settings.buffer_capacity));
        let stats = Arc::new(StreamStats::new(settings.latency_window));
        let ingestor = FrameIngestor::new(
            KeyframeSelector::from_config(&settings.selector),
            Arc::clone(&buffer),
            Arc::clone(&stats),
        );
        Self {
            identity,
            state: SessionState::Active,
            settings,
            pipeline,
            ingestor: Arc::new(Mutex::new(ingestor)),
            buffer,
            stats,
            cancel: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    fn transition(&mut self, next: SessionState) {
        info!(identity = %self.identity, from = %self.state, to = %next, "session state change");
        self.state = next;
    }

    /// Drive the session until the client stops, disconnects or the transport
    /// fails. Returns the final stats.
    pub async fn run<S, E, K>(mut self, inbound: S, sink: K) -> StatsSnapshot
    where
        S: Stream<Item = Result<ClientFrame, E>> + Unpin,
        E: Display,
        K: Sink<ServerMessage> + Unpin + Send + 'static,
        K::Error: Display,
    {
        let (outbound, outbound_rx) = mpsc::channel(self.settings.outbound_queue);
        let (results_tx, results_rx) = mpsc::channel(self.settings.result_queue);

        let writer = tokio::spawn(write_outbound(outbound_rx, sink, self.cancel.clone()));
        let processing = tokio::spawn(
            ProcessingLoop::new(
                Arc::clone(&self.buffer),
                Arc::clone(&self.stats),
                Arc::clone(&self.pipeline),
                results_tx,
                self.cancel.clone(),
                self.settings.idle_wait,
            )
            .run(),
        );
        let dispatcher = tokio::spawn(
            ResultDispatcher::new(
                results_rx,
                outbound.clone(),
                Arc::clone(&self.stats),
                self.cancel.clone(),
                self.settings.result_wait,
                self.settings.stats_interval,
            )
            .run(),
        );

        let reason = self.read_inbound(inbound, &outbound).await;
        self.drain(reason, processing, dispatcher, writer, outbound)
            .await
    }

    async fn read_inbound<S, E>(
        &mut self,
        mut inbound: S,
        outbound: &mpsc::Sender<ServerMessage>,
    ) -> EndReason
    where
        S: Stream<Item = Result<ClientFrame, E>> + Unpin,
        E: Display,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return EndReason::OutboundClosed,
                next = inbound.next() => next,
            };

            let reply = match next {
                None | Some(Ok(ClientFrame::Close)) => return EndReason::ClientClosed,
                Some(Err(e)) => {
                    warn!(identity = %self.identity, error = %e, "receive failed");
                    return EndReason::TransportError;
                }
                Some(Ok(ClientFrame::Binary(data))) => self.ingest(data).await,
                Some(Ok(ClientFrame::Text(text))) => match self.handle_control(&text) {
                    ControlOutcome::Reply(message) => message,
                    ControlOutcome::Stop => return EndReason::StopRequested,
                },
            };

            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return EndReason::OutboundClosed,
                sent = outbound.send(reply) => sent,
            };
            if sent.is_err() {
                return EndReason::OutboundClosed;
            }
        }
    }

    async fn ingest(&self, data: Bytes) -> ServerMessage {
        let ingestor = Arc::clone(&self.ingestor);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut ingestor = ingestor.lock();
            let meta = ingestor.ingest(&data);
            (meta, ingestor.buffer_depth())
        })
        .await;

        match outcome {
            Ok((meta, buffer_depth)) => ServerMessage::Ack {
                seq: meta.seq,
                is_keyframe: meta.is_keyframe,
                jpeg_size: meta.byte_size,
                buffer_depth,
            },
            Err(e) => {
                error!(identity = %self.identity, error = %e, "ingest worker failed");
                ServerMessage::Error {
                    detail: "frame ingest failed".into(),
                }
            }
        }
    }

    fn handle_control(&self, text: &str) -> ControlOutcome {
        let command = match ControlMessage::parse(text) {
            Ok(command) => command,
            Err(e) => {
                debug!(identity = %self.identity, error = %e, "rejected control message");
                return ControlOutcome::Reply(ServerMessage::error(&e));
            }
        };

        match command {
            ControlMessage::Ping => ControlOutcome::Reply(ServerMessage::Pong),
            ControlMessage::Stats => ControlOutcome::Reply(ServerMessage::Stats(self.stats.snapshot())),
            ControlMessage::Stop => ControlOutcome::Stop,
            ControlMessage::Configure(update) => {
                let mut ingestor = self.ingestor.lock();
                let selector = ingestor.filter_mut();
                match update.apply_to(&selector.params()) {
                    Ok(params) => {
                        selector.set_params(params);
                        info!(
                            identity = %self.identity,
                            ssim_threshold = params.ssim_threshold,
                            pixel_diff_threshold = params.pixel_diff_threshold,
                            min_interval_s = params.min_interval_s,
                            max_interval_s = params.max_interval_s,
                            "selector reconfigured"
                        );
                        ControlOutcome::Reply(ServerMessage::Configured { params })
                    }
                    Err(e) => ControlOutcome::Reply(ServerMessage::error(&e)),
                }
            }
        }
    }

    /// Single shutdown path. Runs once per session regardless of why it ended.
    async fn drain(
        mut self,
        reason: EndReason,
        processing: JoinHandle<()>,
        dispatcher: JoinHandle<()>,
        mut writer: JoinHandle<()>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> StatsSnapshot {
        self.transition(SessionState::Draining);
        debug!(identity = %self.identity, ?reason, "draining session");
        self.cancel.cancel();

        for (task, handle) in [("processing", processing), ("dispatcher", dispatcher)] {
            if let Err(e) = handle.await {
                error!(identity = %self.identity, task, error = %e, "session task failed");
            }
        }

        let final_stats = self.stats.snapshot();
        info!(
            identity = %self.identity,
            ?reason,
            frames_received = final_stats.frames_received,
            keyframes_detected = final_stats.keyframes_detected,
            frames_skipped = final_stats.frames_skipped,
            keyframes_evicted = final_stats.keyframes_evicted,
            inference_failures = final_stats.inference_failures,
            avg_processing_ms = final_stats.avg_processing_ms,
            effective_fps = final_stats.effective_fps,
            uptime_s = final_stats.uptime_s,
            "session final stats"
        );

        drop(outbound);
        match tokio::time::timeout(self.settings.flush_timeout, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(identity = %self.identity, error = %e, "outbound writer failed"),
            Err(_) => {
                warn!(identity = %self.identity, "outbound flush timed out, aborting writer");
                writer.abort();
            }
        }

        self.transition(SessionState::Closed);
        final_stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenValidator;
    use crate::inference::{InferenceError, StubPipeline};
    use crate::ingest::tests::encoded_frame;
    use futures::channel::mpsc as fmpsc;
    use image::{DynamicImage, ImageFormat};
    use keyframe_stream_common::config::AuthConfig;
    use keyframe_stream_common::frame::CaptureInference;
    use std::collections::HashMap;
    use std::convert::Infallible;

    type Inbound = fmpsc::UnboundedSender<Result<ClientFrame, Infallible>>;
    type Outbound = fmpsc::UnboundedReceiver<ServerMessage>;

    fn validator() -> Arc<dyn AuthValidator> {
        let mut tokens = HashMap::new();
        tokens.insert("abc123".to_string(), "user-1".to_string());
        Arc::new(StaticTokenValidator::from_config(&AuthConfig {
            tokens,
            dev_token: None,
            dev_identity: "dev-user".into(),
        }))
    }

    fn settings() -> SessionSettings {
        let mut settings = SessionSettings::default();
        settings.selector.thumbnail_width = 16;
        settings.selector.thumbnail_height = 12;
        settings.idle_wait = Duration::from_millis(5);
        settings.result_wait = Duration::from_millis(20);
        settings.stats_interval = Duration::from_secs(3600);
        settings
    }

    fn start(
        settings: SessionSettings,
        pipeline: Arc<dyn CaptureInferencePipeline>,
    ) -> (Inbound, Outbound, JoinHandle<StatsSnapshot>) {
        let session = SessionController::new(settings, validator(), pipeline)
            .authenticate("abc123")
            .unwrap();
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let task = tokio::spawn(session.run(in_rx, out_tx));
        (in_tx, out_rx, task)
    }

    fn send(inbound: &Inbound, frame: ClientFrame) {
        inbound.unbounded_send(Ok(frame)).unwrap();
    }

    fn text(json: &str) -> ClientFrame {
        ClientFrame::Text(json.to_string())
    }

    async fn next(outbound: &mut Outbound) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), outbound.next())
            .await
            .expect("timed out waiting for server message")
            .expect("outbound closed")
    }

    /// Next message that is not a periodic stats beacon.
    async fn next_reply(outbound: &mut Outbound) -> ServerMessage {
        loop {
            match next(outbound).await {
                ServerMessage::Stats(_) => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn rejected_token_never_becomes_active() {
        let controller =
            SessionController::new(settings(), validator(), Arc::new(StubPipeline::new()));
        assert_eq!(controller.state(), SessionState::Connecting);
        assert_eq!(controller.authenticate("wrong").err(), Some(AuthError::InvalidToken));

        let controller =
            SessionController::new(settings(), validator(), Arc::new(StubPipeline::new()));
        assert_eq!(controller.authenticate("").err(), Some(AuthError::MissingToken));
    }

    #[test]
    fn accepted_token_yields_active_session() {
        let session = SessionController::new(settings(), validator(), Arc::new(StubPipeline::new()))
            .authenticate("abc123")
            .unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.identity().to_string(), "user-1");
    }

    #[tokio::test]
    async fn every_frame_is_acked_in_arrival_order() {
        let (inbound, mut outbound, task) = start(settings(), Arc::new(StubPipeline::new()));
        let good = encoded_frame([40, 40, 40], ImageFormat::Jpeg);
        let frames = [
            good.clone(),
            b"not an image".to_vec(),
            good.clone(),
            Vec::new(),
            good.clone(),
        ];
        for frame in &frames {
            send(&inbound, ClientFrame::Binary(Bytes::from(frame.clone())));
        }
        send(&inbound, text(r#"{"type":"stop"}"#));

        let stats = task.await.unwrap();
        assert_eq!(stats.frames_received, 5);
        assert_eq!(stats.keyframes_detected, 1);

        let all: Vec<ServerMessage> = outbound.by_ref().collect().await;
        let acks: Vec<(u64, bool, u32)> = all
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Ack {
                    seq,
                    is_keyframe,
                    jpeg_size,
                    ..
                } => Some((*seq, *is_keyframe, *jpeg_size)),
                _ => None,
            })
            .collect();
        assert_eq!(acks.len(), 5);
        assert_eq!(acks.iter().map(|a| a.0).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert!(acks[0].1, "first decodable frame is a keyframe");
        assert!(!acks[1].1);
        assert_eq!(acks[1].2, 12);
        assert_eq!(acks[3].2, 0);
    }

    #[tokio::test]
    async fn keyframe_produces_result_with_stats() {
        let (inbound, mut outbound, task) = start(settings(), Arc::new(StubPipeline::new()));
        send(
            &inbound,
            ClientFrame::Binary(Bytes::from(encoded_frame([80, 80, 80], ImageFormat::Png))),
        );

        // Ack and result travel independent paths; either may arrive first.
        let (mut acked, mut resulted) = (false, false);
        while !(acked && resulted) {
            match next_reply(&mut outbound).await {
                ServerMessage::Ack {
                    seq, is_keyframe, ..
                } => {
                    assert_eq!(seq, 1);
                    assert!(is_keyframe);
                    acked = true;
                }
                ServerMessage::Result {
                    seq,
                    garments,
                    stats,
                    ..
                } => {
                    assert_eq!(seq, 1);
                    assert!(garments.is_empty());
                    assert_eq!(stats.keyframes_detected, 1);
                    assert_eq!(stats.last_keyframe_seq, Some(1));
                    resulted = true;
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        drop(inbound);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn control_messages_get_replies_and_session_stays_active() {
        let (inbound, mut outbound, task) = start(settings(), Arc::new(StubPipeline::new()));

        send(&inbound, text(r#"{"type":"ping"}"#));
        assert_eq!(next_reply(&mut outbound).await, ServerMessage::Pong);

        send(&inbound, text("{not json"));
        assert_eq!(
            next_reply(&mut outbound).await,
            ServerMessage::Error {
                detail: "Invalid JSON".into()
            }
        );

        send(&inbound, text(r#"{"type":"rewind"}"#));
        assert_eq!(
            next_reply(&mut outbound).await,
            ServerMessage::Error {
                detail: "Unknown command: rewind".into()
            }
        );

        send(&inbound, text(r#"{"type":"stats"}"#));
        match next(&mut outbound).await {
            ServerMessage::Stats(stats) => assert_eq!(stats.frames_received, 0),
            other => panic!("expected stats, got {other:?}"),
        }

        send(&inbound, text(r#"{"type":"ping"}"#));
        assert_eq!(next_reply(&mut outbound).await, ServerMessage::Pong);

        drop(inbound);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn configure_echoes_effective_params() {
        let (inbound, mut outbound, task) = start(settings(), Arc::new(StubPipeline::new()));

        send(&inbound, text(r#"{"type":"configure","ssim_threshold":0.9,"min_interval_s":0}"#));
        match next_reply(&mut outbound).await {
            ServerMessage::Configured { params } => {
                assert_eq!(params.ssim_threshold, 0.9);
                assert_eq!(params.min_interval_s, 0.0);
                assert_eq!(params.pixel_diff_threshold, 0.06);
                assert_eq!(params.max_interval_s, 10.0);
            }
            other => panic!("expected configured, got {other:?}"),
        }

        // Rejected updates leave the previous values in place.
        send(&inbound, text(r#"{"type":"configure","min_interval_s":20}"#));
        assert_eq!(next_reply(&mut outbound).await.kind(), "error");

        send(&inbound, text(r#"{"type":"configure"}"#));
        match next_reply(&mut outbound).await {
            ServerMessage::Configured { params } => {
                assert_eq!(params.ssim_threshold, 0.9);
                assert_eq!(params.min_interval_s, 0.0);
            }
            other => panic!("expected configured, got {other:?}"),
        }

        drop(inbound);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn periodic_stats_without_traffic() {
        let mut s = settings();
        s.stats_interval = Duration::from_millis(30);
        let (inbound, mut outbound, task) = start(s, Arc::new(StubPipeline::new()));

        for _ in 0..2 {
            assert_eq!(next(&mut outbound).await.kind(), "stats");
        }

        drop(inbound);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn transport_error_ends_session() {
        let session = SessionController::new(settings(), validator(), Arc::new(StubPipeline::new()))
            .authenticate("abc123")
            .unwrap();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<ClientFrame, std::io::Error>>();
        let (out_tx, _out_rx) = fmpsc::unbounded();
        in_tx
            .unbounded_send(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            )))
            .unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), session.run(in_rx, out_tx))
            .await
            .unwrap();
        assert_eq!(stats.frames_received, 0);
    }

    #[tokio::test]
    async fn closed_outbound_ends_session() {
        let session = SessionController::new(settings(), validator(), Arc::new(StubPipeline::new()))
            .authenticate("abc123")
            .unwrap();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<ClientFrame, Infallible>>();
        let (out_tx, out_rx) = fmpsc::unbounded();
        drop(out_rx);
        let task = tokio::spawn(session.run(in_rx, out_tx));
        in_tx
            .unbounded_send(Ok(text(r#"{"type":"ping"}"#)))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    /// Blocks inside `run` until released, signalling when it has started.
    struct GatedPipeline {
        started: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl CaptureInferencePipeline for GatedPipeline {
        fn run(&self, _frame: &DynamicImage) -> Result<CaptureInference, InferenceError> {
            let _ = self.started.lock().send(());
            let _ = self.release.lock().recv();
            Ok(CaptureInference::default())
        }
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_inference_and_discards_it() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let pipeline = Arc::new(GatedPipeline {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        let (inbound, mut outbound, task) = start(settings(), pipeline);
        let frame = encoded_frame([120, 120, 120], ImageFormat::Png);

        send(&inbound, ClientFrame::Binary(Bytes::from(frame.clone())));
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("inference should start");

        send(&inbound, text(r#"{"type":"stop"}"#));
        send(&inbound, ClientFrame::Binary(Bytes::from(frame)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished(), "session must wait for the in-flight inference");

        release_tx.send(()).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.frames_received, 1, "frames after stop are not ingested");

        let all: Vec<ServerMessage> = outbound.by_ref().collect().await;
        assert!(all.iter().all(|m| m.kind() != "result"));
        assert_eq!(all.iter().filter(|m| m.kind() == "ack").count(), 1);
    }

    #[tokio::test]
    async fn slow_inference_does_not_delay_acks_or_replies() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let pipeline = Arc::new(GatedPipeline {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        let (inbound, mut outbound, task) = start(settings(), pipeline);
        let frame = encoded_frame([120, 120, 120], ImageFormat::Png);

        send(&inbound, ClientFrame::Binary(Bytes::from(frame.clone())));
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("inference should start");

        // Inference is still held; everything below must be answered anyway.
        send(&inbound, ClientFrame::Binary(Bytes::from(frame.clone())));
        send(&inbound, ClientFrame::Binary(Bytes::from(frame)));
        send(&inbound, text(r#"{"type":"ping"}"#));

        for expected in 1..=3 {
            match next_reply(&mut outbound).await {
                ServerMessage::Ack { seq, .. } => assert_eq!(seq, expected),
                other => panic!("expected ack {expected}, got {other:?}"),
            }
        }
        assert_eq!(next_reply(&mut outbound).await, ServerMessage::Pong);

        release_tx.send(()).unwrap();
        drop(inbound);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stop_completes_when_client_stops_reading() {
        let mut s = settings();
        s.outbound_queue = 1;
        s.stats_interval = Duration::from_millis(5);
        s.flush_timeout = Duration::from_millis(100);
        let session = SessionController::new(s, validator(), Arc::new(StubPipeline::new()))
            .authenticate("abc123")
            .unwrap();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<ClientFrame, Infallible>>();
        // Zero-buffer sink whose receiver stays alive but is never polled.
        let (out_tx, _out_rx) = fmpsc::channel::<ServerMessage>(0);
        let task = tokio::spawn(session.run(in_rx, out_tx));

        // Let the stats beacon fill the sink and the outbound queue.
        tokio::time::sleep(Duration::from_millis(200)).await;
        in_tx.unbounded_send(Ok(text(r#"{"type":"stop"}"#))).unwrap();

        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("session should close after the flush timeout")
            .unwrap();
    }
}
