use std::time::Duration;

use anyhow::Result;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use huddle_common::helpers::{env_bool, is_production};
use huddle_common::{ClientEvent, Error, RelayEvent};

const OUTBOX_CAPACITY: usize = 64;
const INBOX_CAPACITY: usize = 64;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Checks that `raw` is a WebSocket URL the client is allowed to use.
///
/// Plain `ws://` is refused in production unless
/// `HUDDLE_ALLOW_INSECURE_SIGNALING` is set.
pub fn validate_signaling_url(raw: &str) -> huddle_common::Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::config(format!("invalid signaling URL {raw:?}: {e}")))?;

    match url.scheme() {
        "wss" => Ok(url),
        "ws" => {
            if is_production() && !env_bool("HUDDLE_ALLOW_INSECURE_SIGNALING", false) {
                return Err(Error::config(
                    "refusing insecure ws:// signaling URL in production; use wss:// or set HUDDLE_ALLOW_INSECURE_SIGNALING=1",
                ));
            }
            Ok(url)
        }
        other => Err(Error::config(format!(
            "signaling URL must use ws:// or wss://, got {other}://"
        ))),
    }
}

/// Two-way event pipe to the relay.
///
/// Backed either by a WebSocket (see [`connect`]) or by plain channels.
pub struct SignalingLink {
    outbound: mpsc::Sender<ClientEvent>,
    inbound: mpsc::Receiver<RelayEvent>,
    close: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingLink {
    /// Wraps an already wired pair of channels.
    pub fn from_channels(
        outbound: mpsc::Sender<ClientEvent>,
        inbound: mpsc::Receiver<RelayEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            close: None,
            tasks: Vec::new(),
        }
    }

    /// Sender half for tasks that emit events on their own (ICE trickle).
    pub fn sender(&self) -> mpsc::Sender<ClientEvent> {
        self.outbound.clone()
    }

    pub async fn emit(&self, event: ClientEvent) -> Result<()> {
        debug!("emit {} for room {}", event.name(), event.room());
        self.outbound
            .send(event)
            .await
            .map_err(|_| Error::SignalingClosed("outbound channel closed".into()).into())
    }

    /// Next event from the relay, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.inbound.recv().await
    }

    /// Flushes queued events, sends a close frame and stops the I/O tasks.
    pub async fn disconnect(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
        self.inbound.close();
        for mut task in self.tasks.drain(..) {
            match time::timeout(DISCONNECT_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!("signaling task ended abnormally: {}", e),
                Err(_) => {
                    debug!("signaling task did not stop in time, aborting");
                    task.abort();
                }
            }
        }
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens the WebSocket to the relay and spawns its reader and writer tasks.
pub async fn connect(url: &str) -> Result<SignalingLink> {
    let url = validate_signaling_url(url)?;
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    info!("connected to signaling relay: {}", url);

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(OUTBOX_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<RelayEvent>(INBOX_CAPACITY);
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = outbound_rx.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = send_event(&mut write, &event).await {
                        error!("failed to send signaling message: {}", e);
                        return;
                    }
                }
                _ = &mut close_rx => {
                    // Anything queued before the close request still goes out.
                    while let Ok(event) = outbound_rx.try_recv() {
                        if let Err(e) = send_event(&mut write, &event).await {
                            error!("failed to send signaling message: {}", e);
                            return;
                        }
                    }
                    break;
                }
            }
        }
        let _ = write.send(WsMessage::Close(None)).await;
        debug!("signaling writer stopped");
    });

    let reader = tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    let event: RelayEvent = match serde_json::from_str(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("failed to parse signaling message: {}", e);
                            continue;
                        }
                    };
                    if inbound_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(WsMessage::Binary(_)) => debug!("ignoring binary signaling frame"),
                Ok(_) => {}
                Err(e) => {
                    error!("signaling WebSocket error: {}", e);
                    break;
                }
            }
        }
        debug!("signaling reader stopped");
    });

    Ok(SignalingLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
        close: Some(close_tx),
        tasks: vec![writer, reader],
    })
}

async fn send_event<S>(write: &mut S, event: &ClientEvent) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(event)?;
    write.send(WsMessage::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::RoomName;

    #[test]
    fn test_validate_accepts_ws_and_wss() {
        assert!(validate_signaling_url("ws://127.0.0.1:3000/signal").is_ok());
        assert!(validate_signaling_url(" wss://relay.example.com/ ").is_ok());
    }

    #[test]
    fn test_validate_rejects_other_schemes() {
        assert!(matches!(
            validate_signaling_url("https://relay.example.com"),
            Err(Error::Config(_))
        ));
        assert!(validate_signaling_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_channel_link_round_trip() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut link = SignalingLink::from_channels(out_tx, in_rx);

        let room = RoomName::parse("standup").unwrap();
        link.emit(ClientEvent::Join { room: room.clone() })
            .await
            .unwrap();
        assert_eq!(out_rx.recv().await, Some(ClientEvent::Join { room }));

        in_tx.send(RelayEvent::Created).await.unwrap();
        assert_eq!(link.next_event().await, Some(RelayEvent::Created));

        drop(in_tx);
        assert_eq!(link.next_event().await, None);
    }

    #[tokio::test]
    async fn test_emit_after_peer_dropped_fails() {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (_in_tx, in_rx) = mpsc::channel(1);
        let link = SignalingLink::from_channels(out_tx, in_rx);
        drop(out_rx);
        let room = RoomName::parse("standup").unwrap();
        assert!(link.emit(ClientEvent::Leave { room }).await.is_err());
    }
}
