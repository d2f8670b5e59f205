//! Uniform screen-space grid for pointer picking.
//!
//! Points are projected once per camera change and bucketed by
//! `(floor(x / cell), floor(y / cell))`. A query only looks at the cells
//! that can hold a point within the radius, so its cost depends on local
//! density rather than population size.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{EntityIndex, WorldPoint};

pub const DEFAULT_CELL_SIZE_PX: f32 = 24.0;

/// Camera projection from world space to screen pixels.
///
/// `view_proj` is a column-major 4x4 matrix producing clip coordinates;
/// screen `y` grows downwards.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScreenTransform {
    pub view_proj: [f32; 16],
    pub width: f32,
    pub height: f32,
}

impl ScreenTransform {
    pub fn new(view_proj: [f32; 16], width: f32, height: f32) -> Self {
        Self {
            view_proj,
            width,
            height,
        }
    }

    /// Maps world `x, y` in pixels straight onto the screen. Useful when
    /// positions are already laid out in screen units.
    pub fn pixels(width: f32, height: f32) -> Self {
        let sx = 2.0 / width.max(1.0);
        let sy = -2.0 / height.max(1.0);
        #[rustfmt::skip]
        let view_proj = [
            sx,   0.0,  0.0, 0.0,
            0.0,  sy,   0.0, 0.0,
            0.0,  0.0,  1.0, 0.0,
            -1.0, 1.0,  0.0, 1.0,
        ];
        Self::new(view_proj, width, height)
    }

    /// Fits the unit square onto the viewport.
    pub fn unit_square(width: f32, height: f32) -> Self {
        #[rustfmt::skip]
        let view_proj = [
            2.0,  0.0,  0.0, 0.0,
            0.0,  -2.0, 0.0, 0.0,
            0.0,  0.0,  1.0, 0.0,
            -1.0, 1.0,  0.0, 1.0,
        ];
        Self::new(view_proj, width, height)
    }

    /// Projects a point to screen pixels. Points behind the camera or with a
    /// degenerate `w` yield `None`.
    pub fn project(&self, point: WorldPoint) -> Option<(f32, f32)> {
        let m = &self.view_proj;
        let (x, y, z) = (point.x, point.y, point.z);
        let clip_x = m[0] * x + m[4] * y + m[8] * z + m[12];
        let clip_y = m[1] * x + m[5] * y + m[9] * z + m[13];
        let clip_w = m[3] * x + m[7] * y + m[11] * z + m[15];
        if !clip_w.is_finite() || clip_w <= f32::EPSILON {
            return None;
        }
        let ndc_x = clip_x / clip_w;
        let ndc_y = clip_y / clip_w;
        let sx = (ndc_x + 1.0) * 0.5 * self.width;
        let sy = (1.0 - ndc_y) * 0.5 * self.height;
        (sx.is_finite() && sy.is_finite()).then_some((sx, sy))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridHit {
    pub index: EntityIndex,
    pub distance_px: f32,
}

#[derive(Clone, Debug, Default)]
pub struct SpatialGrid {
    cell_size: f32,
    cells: HashMap<(i32, i32), Vec<u32>>,
    /// Occupied cell range as `(min_gx, max_gx, min_gy, max_gy)`.
    bounds: Option<(i32, i32, i32, i32)>,
    screen: Vec<Option<(f32, f32)>>,
    transform: Option<ScreenTransform>,
}

impl SpatialGrid {
    pub fn build(points: &[WorldPoint], transform: &ScreenTransform, cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            DEFAULT_CELL_SIZE_PX
        };
        let mut cells: HashMap<(i32, i32), Vec<u32>> = HashMap::new();
        let screen: Vec<Option<(f32, f32)>> =
            points.iter().map(|p| transform.project(*p)).collect();
        for (index, position) in screen.iter().enumerate() {
            if let Some((x, y)) = position {
                cells
                    .entry(cell_of(*x, *y, cell_size))
                    .or_default()
                    .push(index as u32);
            }
        }
        let bounds = cells.keys().fold(None, |acc, &(gx, gy)| match acc {
            None => Some((gx, gx, gy, gy)),
            Some((x0, x1, y0, y1)) => Some((x0.min(gx), x1.max(gx), y0.min(gy), y1.max(gy))),
        });
        Self {
            cell_size,
            cells,
            bounds,
            screen,
            transform: Some(*transform),
        }
    }

    /// Grid over points already expressed in screen pixels.
    pub fn from_screen_points(points: &[(f32, f32)], cell_size: f32) -> Self {
        let world: Vec<WorldPoint> = points
            .iter()
            .map(|(x, y)| WorldPoint::planar(*x, *y))
            .collect();
        let transform = ScreenTransform::pixels(4096.0, 4096.0);
        Self::build(&world, &transform, cell_size)
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.screen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.screen.is_empty()
    }

    pub fn occupied_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn transform(&self) -> Option<&ScreenTransform> {
        self.transform.as_ref()
    }

    pub fn screen_position(&self, index: EntityIndex) -> Option<(f32, f32)> {
        self.screen.get(index.as_usize()).copied().flatten()
    }

    /// Nearest point within `radius_px` of `(x, y)`. Ties go to the lower
    /// index. Scans the 3x3 block around the query cell, widening only when
    /// the radius exceeds one cell. The window never extends past the
    /// occupied cells, and a window larger than the occupied set walks the
    /// occupied cells instead.
    pub fn query(&self, x: f32, y: f32, radius_px: f32) -> Option<GridHit> {
        if !(x.is_finite() && y.is_finite() && radius_px.is_finite()) || radius_px < 0.0 {
            return None;
        }
        let (min_gx, max_gx, min_gy, max_gy) = self.bounds?;
        let (cx, cy) = cell_of(x, y, self.cell_size);
        let ring = ((radius_px / self.cell_size).ceil() as i32).max(1);
        let x0 = cx.saturating_sub(ring).max(min_gx);
        let x1 = cx.saturating_add(ring).min(max_gx);
        let y0 = cy.saturating_sub(ring).max(min_gy);
        let y1 = cy.saturating_add(ring).min(max_gy);
        if x0 > x1 || y0 > y1 {
            return None;
        }

        let limit = radius_px * radius_px;
        let mut best: Option<(f32, u32)> = None;
        let window = (x1 as i64 - x0 as i64 + 1) * (y1 as i64 - y0 as i64 + 1);
        if window > self.cells.len() as i64 {
            for (&(gx, gy), bucket) in &self.cells {
                if (x0..=x1).contains(&gx) && (y0..=y1).contains(&gy) {
                    self.scan_bucket(bucket, x, y, limit, &mut best);
                }
            }
        } else {
            for gx in x0..=x1 {
                for gy in y0..=y1 {
                    if let Some(bucket) = self.cells.get(&(gx, gy)) {
                        self.scan_bucket(bucket, x, y, limit, &mut best);
                    }
                }
            }
        }

        best.map(|(d2, index)| GridHit {
            index: EntityIndex(index),
            distance_px: d2.sqrt(),
        })
    }

    fn scan_bucket(&self, bucket: &[u32], x: f32, y: f32, limit: f32, best: &mut Option<(f32, u32)>) {
        for &index in bucket {
            let Some((px, py)) = self.screen[index as usize] else {
                continue;
            };
            let d2 = (px - x) * (px - x) + (py - y) * (py - y);
            if d2 > limit {
                continue;
            }
            let better = match *best {
                None => true,
                Some((best_d2, best_index)) => d2 < best_d2 || (d2 == best_d2 && index < best_index),
            };
            if better {
                *best = Some((d2, index));
            }
        }
    }
}

fn cell_of(x: f32, y: f32, cell_size: f32) -> (i32, i32) {
    (
        (x / cell_size).floor() as i32,
        (y / cell_size).floor() as i32,
    )
}
