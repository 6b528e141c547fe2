//! WebSocket transport between clients and the [`BroadcastHub`].
//!
//! Each accepted connection gets a [`ChannelSubscriber`] and two halves:
//!
//! ```text
//!   socket reader ──► InboundFrame ──► dispatch() ──► hub (subscribe/relay)
//!   socket writer ◄── mpsc queue ◄──── hub.publish / acks
//! ```
//!
//! On disconnect the connection leaves every channel. A connection the hub
//! drops for falling behind gets an error frame and a close frame
//! (code 1013, try again later) instead of silently losing its feed.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hub::{BroadcastHub, ChannelSubscriber, Subscriber};
use crate::protocol::{AckFrame, ErrorFrame, InboundFrame, OutboundFrame, RelayFrame};

/// Applies one inbound frame on behalf of `subscriber`.
pub fn dispatch(hub: &BroadcastHub, subscriber: &Arc<dyn Subscriber>, frame: InboundFrame) {
    let id = subscriber.id();
    match frame {
        InboundFrame::Subscribe { channel } => {
            hub.subscribe(Arc::clone(subscriber), &channel);
            reply(subscriber, OutboundFrame::Ack(AckFrame::subscribed(&channel)));
        }
        InboundFrame::Unsubscribe { channel } => {
            hub.unsubscribe(id, &channel);
            reply(subscriber, OutboundFrame::Ack(AckFrame::unsubscribed(&channel)));
        }
        InboundFrame::Message { body } => {
            let delivered = hub.relay(id, &OutboundFrame::Relay(RelayFrame::from_body(&body)));
            debug!(connection = %id, delivered, "relayed client message");
        }
    }
}

fn reply(subscriber: &Arc<dyn Subscriber>, frame: OutboundFrame) {
    if let Err(e) = subscriber.deliver(&frame) {
        debug!(connection = %subscriber.id(), error = %e, "reply not delivered");
    }
}

/// Accepts WebSocket clients until `shutdown` is cancelled.
#[derive(Debug, Clone)]
pub struct Gateway {
    hub: Arc<BroadcastHub>,
    queue_capacity: usize,
}

impl Gateway {
    pub fn new(hub: Arc<BroadcastHub>, queue_capacity: usize) -> Self {
        Self {
            hub,
            queue_capacity,
        }
    }

    /// Serves clients from an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %listener.local_addr()?, "gateway listening");
        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let gateway = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                gateway.handle_connection(stream, peer, shutdown).await;
            });
        }
        info!("gateway stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%peer, error = %e, "websocket handshake failed");
                return;
            }
        };
        let (mut writer, mut reader) = ws.split();

        let (subscriber, mut outbound) = ChannelSubscriber::pair(self.queue_capacity);
        let id = subscriber.id();
        let evicted = subscriber.eviction();
        let subscriber: Arc<dyn Subscriber> = Arc::new(subscriber);
        info!(%peer, connection = %id, "client connected");

        let writer_evicted = evicted.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    () = writer_evicted.cancelled() => {
                        send_eviction_notice(&mut writer).await;
                        break;
                    }
                    frame = outbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        loop {
            let message = tokio::select! {
                () = shutdown.cancelled() => break,
                () = evicted.cancelled() => {
                    warn!(%peer, connection = %id, "closing connection that fell behind");
                    break;
                }
                message = reader.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => match InboundFrame::parse(&text) {
                    Ok(frame) => dispatch(&self.hub, &subscriber, frame),
                    Err(e) => reply(
                        &subscriber,
                        OutboundFrame::Error(ErrorFrame {
                            error: e.to_string(),
                        }),
                    ),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %id, error = %e, "websocket read failed");
                    break;
                }
            }
        }

        self.hub.unsubscribe_all(id);
        drop(subscriber);
        // The writer drains what is queued, then ends once the last sender is gone.
        let _ = writer_task.await;
        info!(%peer, connection = %id, "client disconnected");
    }
}

const EVICTION_REASON: &str = "delivery queue full, disconnected";

async fn send_eviction_notice<S>(writer: &mut S)
where
    S: futures::Sink<Message> + Unpin,
{
    let notice = OutboundFrame::Error(ErrorFrame {
        error: EVICTION_REASON.to_string(),
    });
    if let Ok(text) = notice.to_json() {
        let _ = writer.send(Message::Text(text)).await;
    }
    let close = CloseFrame {
        code: CloseCode::Again,
        reason: EVICTION_REASON.into(),
    };
    let _ = writer.send(Message::Close(Some(close))).await;
}
