//! Remote mirror client.
//!
//! Connects to a server, negotiates metadata and a subscription, and keeps a
//! [`Mirror`] in sync. A contract violation discards the mirror and
//! resubscribes, which makes the server start over with a fresh snapshot.
//! Dropped connections are redialled with exponential backoff.

use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::sleep};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    bitmask::MetaLayout,
    errors::{ClientError, ClientResult, ContractError},
    feed::ExponentialBackoff,
    mirror::Mirror,
    picking::{PickingHandle, ScreenTransform},
    protocol::{ClientMessage, Metadata, ServerMessage, SubscribeRequest},
    record::Encoding,
    types::EntityIndex,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct MirrorClientConfig {
    pub url: String,
    pub encoding: Encoding,
    pub cadence_ms: Option<u64>,
    pub min_risk: u8,
    pub min_shock: u8,
    /// Reject snapshots declaring any other meta layout.
    pub layout: Option<MetaLayout>,
    pub backoff: ExponentialBackoff,
    pub max_attempts: Option<u32>,
}

impl Default for MirrorClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9240".to_string(),
            encoding: Encoding::Compact,
            cadence_ms: None,
            min_risk: 0,
            min_shock: 0,
            layout: None,
            backoff: ExponentialBackoff::default(),
            max_attempts: Some(10),
        }
    }
}

impl MirrorClientConfig {
    fn subscribe_request(&self) -> ClientMessage {
        ClientMessage::Subscribe(SubscribeRequest {
            encoding: Some(self.encoding),
            cadence_ms: self.cadence_ms,
            min_risk: self.min_risk,
            min_shock: self.min_shock,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MirrorEvent {
    Subscribed {
        subscription_id: u64,
        cadence_ms: u64,
    },
    /// A full snapshot replaced the mirror.
    Snapshot { count: usize, generation: u64 },
    Diff { changed: Vec<EntityIndex> },
    /// The mirror was discarded after a contract error; a new snapshot is on
    /// its way.
    Resnapshot { reason: String },
    Reconnected { attempts: u32 },
    ServerError { message: String },
    Closed,
}

/// What a binary frame did to the mirror.
#[derive(Debug, PartialEq)]
enum FrameOutcome {
    Snapshot,
    Diff(Vec<EntityIndex>),
    Discarded(ContractError),
    Ignored,
}

pub struct MirrorClient {
    config: MirrorClientConfig,
    url: Url,
    stream: Option<WsStream>,
    mirror: Mirror,
    metadata: Option<Metadata>,
    pending_snapshot: Option<Metadata>,
    awaiting_snapshot: bool,
    picking: Option<(PickingHandle, ScreenTransform)>,
    generation: u64,
}

impl MirrorClient {
    pub fn new(config: MirrorClientConfig) -> ClientResult<Self> {
        let url = build_url(&config.url)?;
        let mirror = match config.layout {
            Some(layout) => Mirror::with_layout(layout),
            None => Mirror::new(),
        };
        Ok(Self {
            config,
            url,
            stream: None,
            mirror,
            metadata: None,
            pending_snapshot: None,
            awaiting_snapshot: true,
            picking: None,
            generation: 0,
        })
    }

    /// Keeps a picking index in step with the mirror's geometry.
    pub fn with_picking(mut self, handle: PickingHandle, transform: ScreenTransform) -> Self {
        self.picking = Some((handle, transform));
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> ClientResult<()> {
        let (mut stream, _) = connect_async(self.url.as_str()).await?;
        let metadata = handshake(&mut stream, &self.config).await?;
        tracing::info!(
            url = %self.url,
            count = metadata.count,
            stride = metadata.stride_bytes,
            layout = %metadata.meta_layout,
            "mirror client connected"
        );
        self.metadata = Some(metadata);
        self.stream = Some(stream);
        self.mirror.discard();
        self.pending_snapshot = None;
        self.awaiting_snapshot = true;
        Ok(())
    }

    /// Changes the camera. The picking index rebuilds only if the transform
    /// actually differs.
    pub async fn set_camera(&mut self, transform: ScreenTransform) -> ClientResult<()> {
        if let Some((handle, current)) = &mut self.picking {
            *current = transform;
            handle.set_camera(transform).await?;
        }
        Ok(())
    }

    /// Waits for the next thing that happened to the mirror.
    pub async fn next_event(&mut self) -> ClientResult<MirrorEvent> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                let attempts = self.reconnect().await?;
                return Ok(MirrorEvent::Reconnected { attempts });
            };

            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "mirror stream error");
                    self.stream = None;
                    continue;
                }
                None => {
                    tracing::warn!("mirror stream closed by server");
                    self.stream = None;
                    continue;
                }
            };

            match message {
                Message::Text(text) => {
                    if let Some(event) = self.handle_text(&text)? {
                        return Ok(event);
                    }
                }
                Message::Binary(bytes) => match self.handle_binary(&bytes) {
                    FrameOutcome::Snapshot => {
                        self.rebuild_picking().await?;
                        return Ok(MirrorEvent::Snapshot {
                            count: self.mirror.len(),
                            generation: self.mirror.generation(),
                        });
                    }
                    FrameOutcome::Diff(changed) => {
                        self.refresh_picking(&changed).await?;
                        return Ok(MirrorEvent::Diff { changed });
                    }
                    FrameOutcome::Discarded(err) => {
                        self.resubscribe().await?;
                        return Ok(MirrorEvent::Resnapshot {
                            reason: err.to_string(),
                        });
                    }
                    FrameOutcome::Ignored => {}
                },
                Message::Close(_) => {
                    self.stream = None;
                    return Ok(MirrorEvent::Closed);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> ClientResult<Option<MirrorEvent>> {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, len = text.len(), "skipping malformed control frame");
                return Ok(None);
            }
        };
        let event = match message {
            ServerMessage::Snapshot { metadata, version } => {
                tracing::debug!(version, count = metadata.count, "snapshot announced");
                self.pending_snapshot = Some(metadata);
                None
            }
            ServerMessage::Metadata(metadata) => {
                self.metadata = Some(metadata);
                None
            }
            ServerMessage::Subscribed {
                subscription_id,
                cadence_ms,
                metadata,
                ..
            } => {
                self.metadata = Some(metadata);
                Some(MirrorEvent::Subscribed {
                    subscription_id,
                    cadence_ms,
                })
            }
            ServerMessage::Pong => None,
            ServerMessage::Error { message } => {
                tracing::warn!(%message, "server reported an error");
                Some(MirrorEvent::ServerError { message })
            }
        };
        Ok(event)
    }

    fn handle_binary(&mut self, bytes: &[u8]) -> FrameOutcome {
        if let Some(metadata) = self.pending_snapshot.take() {
            return match self.mirror.apply_snapshot(&metadata, bytes) {
                Ok(()) => {
                    self.awaiting_snapshot = false;
                    if self
                        .metadata
                        .as_ref()
                        .map_or(true, |known| known.requires_reload(&metadata))
                    {
                        self.metadata = Some(metadata);
                    }
                    FrameOutcome::Snapshot
                }
                Err(err) => self.discard(err),
            };
        }
        if self.awaiting_snapshot {
            // Diffs still in flight from before a discard.
            return FrameOutcome::Ignored;
        }
        match self.mirror.apply_diff(bytes) {
            Ok(changed) => FrameOutcome::Diff(changed),
            Err(err) => self.discard(err),
        }
    }

    fn discard(&mut self, err: ContractError) -> FrameOutcome {
        tracing::warn!(error = %err, "contract violation, discarding mirror");
        self.mirror.discard();
        self.awaiting_snapshot = true;
        FrameOutcome::Discarded(err)
    }

    async fn resubscribe(&mut self) -> ClientResult<()> {
        let request = serde_json::to_string(&self.config.subscribe_request())?;
        if let Some(stream) = self.stream.as_mut() {
            stream.send(Message::Text(request)).await?;
        }
        Ok(())
    }

    async fn rebuild_picking(&self) -> ClientResult<()> {
        let (Some((handle, transform)), Some(layout)) = (&self.picking, self.mirror.layout()) else {
            return Ok(());
        };
        handle
            .rebuild(
                self.mirror.positions(),
                *transform,
                self.mirror.meta_words(),
                layout,
            )
            .await?;
        Ok(())
    }

    async fn refresh_picking(&self, changed: &[EntityIndex]) -> ClientResult<()> {
        let Some((handle, _)) = &self.picking else {
            return Ok(());
        };
        let updates = changed
            .iter()
            .filter_map(|index| self.mirror.record(*index).map(|r| (*index, r.meta)))
            .collect();
        handle.update_meta(updates).await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> ClientResult<u32> {
        let backoff = self.config.backoff.clone();
        let mut delay = backoff.initial;
        let mut attempts = 0;

        tracing::info!(generation = self.generation, "reconnect_begin");

        loop {
            if let Some(max) = self.config.max_attempts {
                if attempts >= max {
                    return Err(ClientError::ReconnectExhausted(max));
                }
            }
            attempts += 1;

            let wait = backoff.jittered(delay);
            tracing::warn!(attempts, ?wait, "reconnecting");
            sleep(wait).await;

            let dial_start = Instant::now();
            match self.connect().await {
                Ok(()) => {
                    self.generation = self.generation.wrapping_add(1);
                    tracing::info!(
                        attempts,
                        dial_elapsed = ?dial_start.elapsed(),
                        generation = self.generation,
                        "reconnect_completed"
                    );
                    return Ok(attempts);
                }
                Err(err) => {
                    tracing::error!(attempts, error = %err, "reconnect failed");
                    delay = backoff.next_delay(delay);
                }
            }
        }
    }

    pub async fn close(&mut self) -> ClientResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.close(None).await?;
        }
        Ok(())
    }
}

/// Requests metadata, then subscribes. Returns the metadata reply.
async fn handshake(stream: &mut WsStream, config: &MirrorClientConfig) -> ClientResult<Metadata> {
    let request = ClientMessage::Metadata {
        encoding: Some(config.encoding),
    };
    stream
        .send(Message::Text(serde_json::to_string(&request)?))
        .await?;

    let metadata = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)? {
                ServerMessage::Metadata(metadata) => break metadata,
                ServerMessage::Error { message } => {
                    return Err(ClientError::UnexpectedMessage(message));
                }
                _ => continue,
            },
            Some(Ok(Message::Binary(_))) => {
                return Err(ClientError::UnexpectedMessage(
                    "binary frame before metadata".to_string(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
            None => return Err(ClientError::Closed),
        }
    };
    metadata.encoding()?;

    stream
        .send(Message::Text(serde_json::to_string(&config.subscribe_request())?))
        .await?;
    Ok(metadata)
}

fn build_url(raw: &str) -> ClientResult<Url> {
    let candidate = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if raw.starts_with("ws://") || raw.starts_with("wss://") {
        raw.to_string()
    } else if let Some((scheme, _)) = raw.split_once("://") {
        return Err(ClientError::UnsupportedScheme(scheme.to_string()));
    } else {
        format!("ws://{raw}")
    };
    Ok(Url::parse(&candidate)?)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::watch;

    use super::*;
    use crate::{
        bitmask::pack,
        broadcast::Hub,
        buffer::PointBuffer,
        protocol::encode_diff,
        record::{DiffEntry, EntityRecord},
        server::{RiskfieldServer, ServerConfig},
        types::WorldPoint,
    };

    #[test]
    fn test_build_url_normalises_schemes() {
        assert_eq!(build_url("http://host:1/feed").unwrap().as_str(), "ws://host:1/feed");
        assert_eq!(build_url("https://host/x").unwrap().scheme(), "wss");
        assert_eq!(build_url("127.0.0.1:9240").unwrap().scheme(), "ws");
        assert!(matches!(
            build_url("ftp://host"),
            Err(ClientError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
    }

    fn snapshot_bytes(count: usize) -> (Metadata, Vec<u8>) {
        let mut bytes = Vec::new();
        for i in 0..count {
            EntityRecord::new(WorldPoint::planar(0.5, 0.5), i as u32, 0)
                .write(Encoding::Compact, &mut bytes);
        }
        (Metadata::new(count, Encoding::Compact, MetaLayout::Standard), bytes)
    }

    #[test]
    fn test_contract_error_discards_and_ignores_stale_diffs() {
        let mut client = MirrorClient::new(MirrorClientConfig::default()).unwrap();
        let (metadata, bytes) = snapshot_bytes(3);
        client.pending_snapshot = Some(metadata.clone());
        assert_eq!(client.handle_binary(&bytes), FrameOutcome::Snapshot);

        let bad = encode_diff(&[DiffEntry {
            index: EntityIndex(9),
            attr: 0,
            meta: 1,
        }]);
        assert!(matches!(
            client.handle_binary(&bad),
            FrameOutcome::Discarded(ContractError::IndexOutOfRange { .. })
        ));
        assert!(!client.mirror().is_ready());

        let good = encode_diff(&[DiffEntry {
            index: EntityIndex(1),
            attr: 0,
            meta: 1,
        }]);
        assert_eq!(client.handle_binary(&good), FrameOutcome::Ignored);

        client.pending_snapshot = Some(metadata);
        assert_eq!(client.handle_binary(&bytes), FrameOutcome::Snapshot);
        assert_eq!(
            client.handle_binary(&good),
            FrameOutcome::Diff(vec![EntityIndex(1)])
        );
    }

    #[test]
    fn test_garbage_control_frame_is_skipped() {
        let mut client = MirrorClient::new(MirrorClientConfig::default()).unwrap();
        assert_eq!(client.handle_text("{not json").unwrap(), None);
        assert_eq!(client.handle_text(r#"{"type":"teleport"}"#).unwrap(), None);

        // A valid frame after the garbage is still handled.
        let (metadata, bytes) = snapshot_bytes(2);
        let marker = serde_json::to_string(&ServerMessage::Snapshot {
            metadata,
            version: 1,
        })
        .unwrap();
        assert_eq!(client.handle_text(&marker).unwrap(), None);
        assert_eq!(client.handle_binary(&bytes), FrameOutcome::Snapshot);
    }

    #[test]
    fn test_truncated_snapshot_is_discarded() {
        let mut client = MirrorClient::new(MirrorClientConfig::default()).unwrap();
        let (metadata, bytes) = snapshot_bytes(3);
        client.pending_snapshot = Some(metadata);
        assert!(matches!(
            client.handle_binary(&bytes[..30]),
            FrameOutcome::Discarded(ContractError::StrideMismatch { .. })
        ));
    }

    async fn next(client: &mut MirrorClient) -> MirrorEvent {
        tokio::time::timeout(Duration::from_secs(2), client.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_with_picking() {
        let records = (0..3)
            .map(|i| EntityRecord::new(WorldPoint::planar(0.1 * (i + 1) as f32, 0.5), i, 0))
            .collect();
        let buffer = Arc::new(PointBuffer::new(records, MetaLayout::Standard));
        let hub = Arc::new(Hub::new(16));
        let server = RiskfieldServer::bind(
            ServerConfig {
                bind: "127.0.0.1:0".to_string(),
                base_cadence: Duration::from_millis(10),
                ..ServerConfig::default()
            },
            Arc::clone(&buffer),
            Arc::clone(&hub),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.run(shutdown_rx));

        let (picking, _task) = PickingHandle::spawn(24.0);
        let transform = ScreenTransform::unit_square(1000.0, 1000.0);
        let mut client = MirrorClient::new(MirrorClientConfig {
            url: format!("ws://{addr}"),
            ..MirrorClientConfig::default()
        })
        .unwrap()
        .with_picking(picking.clone(), transform);
        client.connect().await.unwrap();

        assert!(matches!(next(&mut client).await, MirrorEvent::Subscribed { .. }));
        assert_eq!(
            next(&mut client).await,
            MirrorEvent::Snapshot {
                count: 3,
                generation: 1
            }
        );
        assert_eq!(picking.stats().await.unwrap().rebuilds, 1);

        let word = pack(0, 99, 0, 0, 0);
        buffer.set_meta(EntityIndex(1), word).unwrap();
        hub.deliver(&buffer.drain_diff());
        assert_eq!(
            next(&mut client).await,
            MirrorEvent::Diff {
                changed: vec![EntityIndex(1)]
            }
        );

        // Diffs refresh decoration only; geometry is untouched.
        let pick = picking.query(200.0, 500.0, 10.0).await.unwrap().unwrap();
        assert_eq!(pick.index, EntityIndex(1));
        assert_eq!(pick.fields.unwrap().risk, 99);
        assert_eq!(picking.stats().await.unwrap().rebuilds, 1);

        client.close().await.unwrap();
        shutdown_tx.send(true).unwrap();
    }
}
