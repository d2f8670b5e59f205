//! Client-side pointer picking.

pub mod grid;
pub mod service;

pub use grid::{GridHit, ScreenTransform, SpatialGrid, DEFAULT_CELL_SIZE_PX};
pub use service::{Pick, PickingHandle, PickingStats, SelectionEvent};
