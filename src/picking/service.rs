use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use super::grid::{ScreenTransform, SpatialGrid};
use crate::{
    bitmask::{MetaCodec, MetaFields, MetaLayout},
    errors::PickError,
    timings::timed,
    types::{EntityIndex, WorldPoint},
};

const COMMAND_CAPACITY: usize = 64;

/// Result of a pointer query, decorated with the entity's decoded fields.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pick {
    pub index: EntityIndex,
    pub distance_px: f32,
    pub screen: (f32, f32),
    pub fields: Option<MetaFields>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectionEvent {
    pub sequence: u64,
    /// `None` when the pointer selected empty space.
    pub pick: Option<Pick>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PickingStats {
    pub rebuilds: u64,
    pub points: usize,
    pub occupied_cells: usize,
    pub queries: u64,
}

enum Command {
    Rebuild {
        points: Vec<WorldPoint>,
        transform: ScreenTransform,
        meta: Vec<u32>,
        layout: MetaLayout,
    },
    SetCamera(ScreenTransform),
    UpdateMeta(Vec<(EntityIndex, u32)>),
    Query {
        x: f32,
        y: f32,
        radius_px: f32,
        select: bool,
        reply: oneshot::Sender<Option<Pick>>,
    },
    Stats(oneshot::Sender<PickingStats>),
}

struct PickingService {
    cell_size: f32,
    grid: SpatialGrid,
    points: Vec<WorldPoint>,
    meta: Vec<u32>,
    codec: Option<MetaCodec>,
    stats: PickingStats,
    sequence: u64,
    selection: watch::Sender<Option<SelectionEvent>>,
}

impl PickingService {
    fn rebuild(&mut self, transform: &ScreenTransform) {
        let (grid, elapsed) = timed("picking_rebuild", || {
            SpatialGrid::build(&self.points, transform, self.cell_size)
        });
        self.grid = grid;
        self.stats.rebuilds += 1;
        self.stats.points = self.grid.len();
        self.stats.occupied_cells = self.grid.occupied_cells();
        tracing::debug!(
            points = self.stats.points,
            cells = self.stats.occupied_cells,
            elapsed_ms = elapsed.as_secs_f64() * 1e3,
            "picking grid rebuilt"
        );
    }

    fn query(&mut self, x: f32, y: f32, radius_px: f32) -> Option<Pick> {
        self.stats.queries += 1;
        let hit = self.grid.query(x, y, radius_px)?;
        let fields = match (self.codec, self.meta.get(hit.index.as_usize())) {
            (Some(codec), Some(word)) => Some(codec.unpack(*word)),
            _ => None,
        };
        Some(Pick {
            index: hit.index,
            distance_px: hit.distance_px,
            screen: self.grid.screen_position(hit.index).unwrap_or((x, y)),
            fields,
        })
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Rebuild {
                points,
                transform,
                meta,
                layout,
            } => {
                self.points = points;
                self.meta = meta;
                self.codec = Some(MetaCodec::new(layout));
                self.rebuild(&transform);
            }
            Command::SetCamera(transform) => {
                if self.grid.transform() != Some(&transform) {
                    self.rebuild(&transform);
                }
            }
            Command::UpdateMeta(updates) => {
                for (index, word) in updates {
                    if let Some(slot) = self.meta.get_mut(index.as_usize()) {
                        *slot = word;
                    }
                }
            }
            Command::Query {
                x,
                y,
                radius_px,
                select,
                reply,
            } => {
                let pick = self.query(x, y, radius_px);
                if select {
                    self.sequence += 1;
                    self.selection.send_replace(Some(SelectionEvent {
                        sequence: self.sequence,
                        pick,
                    }));
                }
                let _ = reply.send(pick);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats);
            }
        }
    }
}

/// Cloneable front end to the picking task. Callers never touch the grid.
#[derive(Clone, Debug)]
pub struct PickingHandle {
    commands: mpsc::Sender<Command>,
    selection: watch::Receiver<Option<SelectionEvent>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Rebuild { .. } => "Rebuild",
            Command::SetCamera(_) => "SetCamera",
            Command::UpdateMeta(_) => "UpdateMeta",
            Command::Query { .. } => "Query",
            Command::Stats(_) => "Stats",
        };
        f.write_str(name)
    }
}

impl PickingHandle {
    /// Spawns the picking task. It exits once every handle is dropped.
    pub fn spawn(cell_size: f32) -> (Self, JoinHandle<()>) {
        let (commands, mut rx) = mpsc::channel(COMMAND_CAPACITY);
        let (selection_tx, selection) = watch::channel(None);
        let mut service = PickingService {
            cell_size,
            grid: SpatialGrid::default(),
            points: Vec::new(),
            meta: Vec::new(),
            codec: None,
            stats: PickingStats::default(),
            sequence: 0,
            selection: selection_tx,
        };
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                service.handle(command);
            }
            tracing::debug!("picking service stopped");
        });
        (
            Self {
                commands,
                selection,
            },
            task,
        )
    }

    async fn send(&self, command: Command) -> Result<(), PickError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PickError::ServiceStopped)
    }

    /// Replaces the point set and rebuilds the grid.
    pub async fn rebuild(
        &self,
        points: Vec<WorldPoint>,
        transform: ScreenTransform,
        meta: Vec<u32>,
        layout: MetaLayout,
    ) -> Result<(), PickError> {
        self.send(Command::Rebuild {
            points,
            transform,
            meta,
            layout,
        })
        .await
    }

    /// Rebuilds only if the transform differs from the current one.
    pub async fn set_camera(&self, transform: ScreenTransform) -> Result<(), PickError> {
        self.send(Command::SetCamera(transform)).await
    }

    /// Refreshes decoration words without touching geometry.
    pub async fn update_meta(&self, updates: Vec<(EntityIndex, u32)>) -> Result<(), PickError> {
        if updates.is_empty() {
            return Ok(());
        }
        self.send(Command::UpdateMeta(updates)).await
    }

    pub async fn query(&self, x: f32, y: f32, radius_px: f32) -> Result<Option<Pick>, PickError> {
        self.ask(x, y, radius_px, false).await
    }

    /// Like [`query`](Self::query) but also publishes a [`SelectionEvent`].
    pub async fn select(&self, x: f32, y: f32, radius_px: f32) -> Result<Option<Pick>, PickError> {
        self.ask(x, y, radius_px, true).await
    }

    async fn ask(&self, x: f32, y: f32, radius_px: f32, select: bool) -> Result<Option<Pick>, PickError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Query {
            x,
            y,
            radius_px,
            select,
            reply,
        })
        .await?;
        rx.await.map_err(|_| PickError::ServiceStopped)
    }

    pub async fn stats(&self) -> Result<PickingStats, PickError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| PickError::ServiceStopped)
    }

    pub fn subscribe_selection(&self) -> watch::Receiver<Option<SelectionEvent>> {
        self.selection.clone()
    }
}
