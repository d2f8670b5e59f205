//! WebSocket subscription server.
//!
//! Every connection starts in request/response mode: `metadata` and
//! `snapshot` can be asked for any number of times. A `subscribe` request
//! registers the connection with the [`Hub`]; from then on the connection
//! receives a snapshot followed by diffs at its negotiated cadence.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message, WebSocketStream};

use crate::{
    broadcast::{Delivery, Hub, Subscriber, SubscriptionFilter},
    buffer::{PointBuffer, Snapshot},
    errors::ServerResult,
    protocol::{encode_diff, ClientMessage, Metadata, ServerMessage, SubscribeRequest},
    record::Encoding,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub default_encoding: Encoding,
    /// Broadcaster cadence; the fastest any subscriber can receive diffs.
    pub base_cadence: Duration,
    pub max_cadence: Duration,
    pub ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9240".to_string(),
            default_encoding: Encoding::Compact,
            base_cadence: Duration::from_millis(100),
            max_cadence: Duration::from_secs(60),
            ping_interval: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    /// Clamps a requested cadence into `[base_cadence, max_cadence]`.
    pub fn negotiate_cadence(&self, requested_ms: Option<u64>) -> Duration {
        let requested = requested_ms
            .map(Duration::from_millis)
            .unwrap_or(self.base_cadence);
        requested.clamp(self.base_cadence, self.max_cadence.max(self.base_cadence))
    }
}

struct ServerState {
    config: ServerConfig,
    buffer: Arc<PointBuffer>,
    hub: Arc<Hub>,
}

impl ServerState {
    fn metadata(&self, encoding: Encoding) -> Metadata {
        Metadata::new(self.buffer.len(), encoding, self.buffer.layout())
    }
}

pub struct RiskfieldServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl RiskfieldServer {
    pub async fn bind(
        config: ServerConfig,
        buffer: Arc<PointBuffer>,
        hub: Arc<Hub>,
    ) -> ServerResult<Self> {
        let listener = TcpListener::bind(&config.bind).await?;
        tracing::info!(addr = %listener.local_addr()?, count = buffer.len(), "server listening");
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                config,
                buffer,
                hub,
            }),
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ServerResult<()> {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };
            if *shutdown.borrow() {
                break;
            }
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let state = Arc::clone(&self.state);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match handle_connection(stream, peer, state, shutdown).await {
                    Ok(()) => tracing::info!(%peer, "connection closed"),
                    Err(err) => tracing::warn!(%peer, error = %err, "connection ended with error"),
                }
            });
        }
        tracing::info!("server stopped accepting");
        Ok(())
    }
}

struct Subscription {
    subscriber: Arc<Subscriber>,
    ticker: Option<Interval>,
}

type Connection = WebSocketStream<TcpStream>;

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    shutdown: watch::Receiver<bool>,
) -> ServerResult<()> {
    let mut ws = accept_async(stream).await?;
    tracing::info!(%peer, "connection accepted");
    let mut subscription: Option<Subscription> = None;
    let result = serve(&mut ws, peer, &state, &mut subscription, shutdown).await;
    if let Some(subscription) = subscription {
        state.hub.unsubscribe(subscription.subscriber.info.id);
    }
    result
}

async fn serve(
    ws: &mut Connection,
    peer: SocketAddr,
    state: &ServerState,
    subscription: &mut Option<Subscription>,
    mut shutdown: watch::Receiver<bool>,
) -> ServerResult<()> {
    let mut heartbeat = interval(state.config.ping_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            incoming = ws.next() => {
                let message = match incoming {
                    Some(message) => message?,
                    None => return Ok(()),
                };
                match message {
                    Message::Text(text) => {
                        let replies = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(request) => handle_request(request, state, subscription),
                            Err(err) => {
                                tracing::debug!(%peer, error = %err, "invalid control message");
                                vec![error_reply(format!("invalid control message: {err}"))]
                            }
                        };
                        for reply in replies {
                            ws.send(reply).await?;
                        }
                    }
                    Message::Binary(_) => {
                        ws.send(error_reply("binary frames are not accepted".to_string())).await?;
                    }
                    Message::Close(_) => return Ok(()),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            delivery = next_delivery(subscription.as_mut(), &state.buffer) => {
                let Some(delivery) = delivery else {
                    return Ok(());
                };
                for frame in delivery_frames(delivery, state) {
                    ws.send(frame).await?;
                }
            }
            _ = heartbeat.tick() => {
                ws.send(Message::Ping(Vec::new())).await?;
            }
            _ = shutdown.changed() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
        }
    }
}

fn handle_request(
    request: ClientMessage,
    state: &ServerState,
    subscription: &mut Option<Subscription>,
) -> Vec<Message> {
    match request {
        ClientMessage::Ping => vec![json_message(&ServerMessage::Pong)],
        ClientMessage::Metadata { encoding } => {
            let encoding = encoding.unwrap_or(state.config.default_encoding);
            vec![json_message(&ServerMessage::Metadata(state.metadata(encoding)))]
        }
        ClientMessage::Snapshot { encoding } => {
            let encoding = encoding.unwrap_or(state.config.default_encoding);
            snapshot_frames(state.buffer.snapshot(encoding), state)
        }
        ClientMessage::Subscribe(request) => {
            if let Some(previous) = subscription.take() {
                state.hub.unsubscribe(previous.subscriber.info.id);
            }
            let (next, reply) = subscribe(request, state);
            *subscription = Some(next);
            vec![json_message(&reply)]
        }
    }
}

fn subscribe(request: SubscribeRequest, state: &ServerState) -> (Subscription, ServerMessage) {
    let encoding = request.encoding.unwrap_or(state.config.default_encoding);
    let cadence = state.config.negotiate_cadence(request.cadence_ms);
    let filter = SubscriptionFilter::new(request.min_risk, request.min_shock);
    let subscriber = state.hub.subscribe(encoding, cadence, filter);

    // Subscribers at the broadcaster's own cadence are woken per diff;
    // slower ones poll and receive everything merged.
    let ticker = (cadence > state.config.base_cadence).then(|| {
        let mut ticker = interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    let reply = ServerMessage::Subscribed {
        subscription_id: subscriber.info.id,
        cadence_ms: cadence.as_millis() as u64,
        min_risk: filter.min_risk,
        min_shock: filter.min_shock,
        metadata: state.metadata(encoding),
    };
    (Subscription { subscriber, ticker }, reply)
}

/// Resolves to the next delivery for the connection, or never if it has
/// not subscribed. `None` means the queue was closed.
async fn next_delivery(subscription: Option<&mut Subscription>, buffer: &PointBuffer) -> Option<Delivery> {
    let Some(subscription) = subscription else {
        return std::future::pending().await;
    };
    let queue = &subscription.subscriber.queue;
    let encoding = subscription.subscriber.info.encoding;
    let resnapshot = || buffer.snapshot(encoding);
    match subscription.ticker.as_mut() {
        None => queue.recv(resnapshot).await,
        Some(ticker) => loop {
            ticker.tick().await;
            if queue.is_closed() {
                return None;
            }
            if let Some(delivery) = queue.take(resnapshot) {
                return Some(delivery);
            }
        },
    }
}

fn delivery_frames(delivery: Delivery, state: &ServerState) -> Vec<Message> {
    match delivery {
        Delivery::Snapshot(snapshot) => snapshot_frames(snapshot, state),
        Delivery::Diff(entries) => {
            tracing::trace!(updates = entries.len(), "sending diff");
            vec![Message::Binary(encode_diff(&entries))]
        }
    }
}

/// A snapshot is always a text marker followed by the binary records.
fn snapshot_frames(snapshot: Snapshot, state: &ServerState) -> Vec<Message> {
    let marker = ServerMessage::Snapshot {
        metadata: state.metadata(snapshot.encoding),
        version: snapshot.version,
    };
    vec![json_message(&marker), Message::Binary(snapshot.bytes.to_vec())]
}

fn json_message(message: &ServerMessage) -> Message {
    match serde_json::to_string(message) {
        Ok(text) => Message::Text(text),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode control message");
            Message::Text(r#"{"type":"error","message":"internal encoding error"}"#.to_string())
        }
    }
}

fn error_reply(message: String) -> Message {
    json_message(&ServerMessage::Error { message })
}
