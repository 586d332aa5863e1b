use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use keyframe_stream_common::protocol::ServerMessage;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::ProducerError;

/// Close code the server uses for a rejected token.
const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Build the streaming URL with the token as a percent-encoded query
/// parameter. Existing query pairs on the endpoint are kept.
pub fn stream_url(endpoint: &str, token: &str) -> Result<String, ProducerError> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| ProducerError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    if !token.is_empty() {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url.into())
}

/// Log a server reply at a level matching its importance.
pub fn log_reply(msg: &ServerMessage) {
    match msg {
        ServerMessage::Ack {
            seq,
            is_keyframe,
            jpeg_size,
            buffer_depth,
        } => debug!(seq, is_keyframe, jpeg_size, buffer_depth, "ack"),
        ServerMessage::Result {
            seq,
            garments,
            processing_ms,
            ..
        } => info!(
            seq,
            garments = garments.len(),
            processing_ms,
            types = ?garments.iter().map(|g| g.garment_type.as_str()).collect::<Vec<_>>(),
            "result"
        ),
        ServerMessage::Stats(stats) => info!(
            frames_received = stats.frames_received,
            keyframes_detected = stats.keyframes_detected,
            frames_skipped = stats.frames_skipped,
            avg_processing_ms = stats.avg_processing_ms,
            effective_fps = stats.effective_fps,
            "server stats"
        ),
        ServerMessage::Pong => debug!("pong"),
        ServerMessage::Configured { params } => info!(?params, "selector configured"),
        ServerMessage::Error { detail } => warn!(detail = %detail, "server reported error"),
    }
}

/// Stream frames to the server, reconnecting with exponential backoff.
/// Returns when the frame source is exhausted or the token is rejected.
pub async fn run_uplink(
    endpoint: &str,
    token: &str,
    mut frames: mpsc::Receiver<Bytes>,
) -> Result<(), ProducerError> {
    let url = stream_url(endpoint, token)?;
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(endpoint, "connecting to stream endpoint");
        match stream_session(&url, &mut frames).await {
            Ok(SessionEnd::SourceExhausted) => return Ok(()),
            Ok(SessionEnd::ServerClosed) => {
                info!("server closed stream, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(ProducerError::Unauthorized) => return Err(ProducerError::Unauthorized),
            Err(e) => {
                error!(error = %e, "uplink error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

enum SessionEnd {
    SourceExhausted,
    ServerClosed,
}

async fn stream_session(
    url: &str,
    frames: &mut mpsc::Receiver<Bytes>,
) -> Result<SessionEnd, ProducerError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    info!("connected to stream endpoint");
    let (mut sender, mut receiver) = ws.split();
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(jpeg) = frame else {
                    info!(sent, "frame source finished, stopping session");
                    let _ = sender.send(Message::Text(r#"{"type":"stop"}"#.into())).await;
                    drain_replies(&mut receiver).await;
                    return Ok(SessionEnd::SourceExhausted);
                };
                sender.send(Message::Binary(jpeg.to_vec())).await?;
                sent += 1;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(reply) => log_reply(&reply),
                    Err(e) => warn!(error = %e, "unrecognized server message"),
                },
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        if frame.code == CloseCode::from(CLOSE_UNAUTHORIZED) {
                            return Err(ProducerError::Unauthorized);
                        }
                        debug!(code = %frame.code, reason = %frame.reason, "server close frame");
                    }
                    return Ok(SessionEnd::ServerClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(SessionEnd::ServerClosed),
            }
        }
    }
}

/// Read remaining replies until the server closes, bounded in time.
async fn drain_replies<S>(receiver: &mut S)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let drain = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(reply) = serde_json::from_str::<ServerMessage>(&text) {
                    log_reply(&reply);
                }
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("server did not close the stream after stop");
    }
}
