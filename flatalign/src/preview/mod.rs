//! Composited single-plane preview of the whole mosaic.
//!
//! Decoded planes are cached per stack, so an offset change only recomposites
//! the rectangle the moved tile left and entered. Each tile is dark-subtracted
//! and divided by its assigned flat's profile, shifted down by the tile's Y
//! offset, so a good offset shows as even illumination. Only the preview reads
//! pixel data; it never mutates the [`AlignmentState`] it is given.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use common::parallel::par_map_limited_while;
use common::{Buffer2, Rect};

use crate::alignment::{microns_to_pixels, AlignmentState};
use crate::error::{Error, Result};
use crate::plane::{shifted_divisor, PlaneSource};
use crate::position_index::{PositionIndex, StackCoordinate, StagePosition};

/// Fraction of pixels below [`Mosaic::display_ceiling`].
const DISPLAY_PERCENTILE: f64 = 0.99;

/// Placement of one stack's tile in the composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBounds {
    pub position: StagePosition,
    pub rect: Rect,
    /// The stack has no plane at this z index (or it failed to decode).
    pub placeholder: bool,
}

/// The composited plane and what a front-end needs to draw and hit-test it.
#[derive(Debug, Clone)]
pub struct Mosaic {
    pub z_index: usize,
    pub image: Buffer2<f32>,
    /// Tiles in draw order; later tiles cover earlier ones.
    pub tiles: Vec<TileBounds>,
    /// X pixel of each column boundary after the first column.
    pub column_seams: Vec<i64>,
    /// Y pixel of each row boundary after the first row.
    pub row_seams: Vec<i64>,
}

impl Mosaic {
    /// Topmost tile under a pixel.
    pub fn tile_at(&self, x: i64, y: i64) -> Option<StagePosition> {
        self.tiles
            .iter()
            .rev()
            .find(|t| t.rect.contains(x, y))
            .map(|t| t.position)
    }

    pub fn tile(&self, position: &StagePosition) -> Option<&TileBounds> {
        self.tiles.iter().find(|t| t.position == *position)
    }

    /// 99th percentile of the composite, for contrast clipping.
    pub fn display_ceiling(&self) -> f32 {
        if self.image.is_empty() {
            return 0.0;
        }
        let mut values = self.image.pixels().to_vec();
        let idx = ((values.len() - 1) as f64 * DISPLAY_PERCENTILE) as usize;
        let (_, value, _) = values.select_nth_unstable_by(idx, f32::total_cmp);
        *value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderProgress {
    /// Tiles decoded so far in this render.
    pub current: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered,
    /// A newer render or [`CancelHandle::cancel`] overtook this one; its
    /// tiles were discarded and the previous mosaic is untouched.
    Superseded,
}

/// Supersedes whatever render is in flight. Cheap to clone and `Send`.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    generation: Arc<AtomicU64>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct CachedTile {
    pixels: Option<Arc<Buffer2<u16>>>,
    /// Pixel position before the Y offset is applied.
    origin: (i64, i64),
    /// Catalog index of the flat the tile was divided by.
    flat_index: Option<usize>,
    flat: Option<Arc<Vec<f32>>>,
}

/// Decoded planes of the current z index, keyed by stack.
#[derive(Debug, Default)]
struct TileCache {
    z_index: Option<usize>,
    tiles: BTreeMap<StagePosition, CachedTile>,
}

pub struct MosaicPreview<S: PlaneSource> {
    source: S,
    stacks: Vec<StackCoordinate>,
    xy_voxel_size: f64,
    dark: u16,
    max_concurrent: usize,
    generation: Arc<AtomicU64>,
    cache: TileCache,
    /// Flat profiles by catalog index; `None` marks a flat that failed to load.
    flats: BTreeMap<usize, Option<Arc<Vec<f32>>>>,
    /// Size used for placeholder tiles; the largest decoded plane so far.
    tile_size: (usize, usize),
    mosaic: Option<Mosaic>,
}

impl<S: PlaneSource> MosaicPreview<S> {
    /// # Panics
    ///
    /// Panics if `xy_voxel_size` is not positive or `max_concurrent` is 0.
    /// [`crate::Config::validate`] rejects both.
    pub fn new(
        source: S,
        index: &PositionIndex,
        xy_voxel_size: f64,
        dark: u16,
        max_concurrent: usize,
    ) -> Self {
        assert!(xy_voxel_size > 0.0, "xy_voxel_size must be positive");
        assert!(max_concurrent > 0, "max_concurrent must be > 0");
        Self {
            source,
            stacks: index.stacks().cloned().collect(),
            xy_voxel_size,
            dark,
            max_concurrent,
            generation: Arc::new(AtomicU64::new(0)),
            cache: TileCache::default(),
            flats: BTreeMap::new(),
            tile_size: (0, 0),
            mosaic: None,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            generation: Arc::clone(&self.generation),
        }
    }

    /// The last completed render.
    pub fn mosaic(&self) -> Option<&Mosaic> {
        self.mosaic.as_ref()
    }

    pub fn xy_voxel_size(&self) -> f64 {
        self.xy_voxel_size
    }

    pub fn render(&mut self, z_index: usize, state: &AlignmentState) -> RenderOutcome {
        self.render_with_progress(z_index, state, &|_| {})
    }

    /// Decodes plane `z_index` of every stack (in parallel) and composites
    /// it. Stacks shorter than `z_index` and planes that fail to decode get a
    /// blank tile. `progress` is called from worker threads after each tile.
    pub fn render_with_progress(
        &mut self,
        z_index: usize,
        state: &AlignmentState,
        progress: &(dyn Fn(RenderProgress) + Sync),
    ) -> RenderOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let is_current = || self.generation.load(Ordering::SeqCst) == generation;

        let total = self.stacks.len();
        let done = AtomicUsize::new(0);
        let source = &self.source;
        let decoded = par_map_limited_while(&self.stacks, self.max_concurrent, &is_current, |stack| {
            let pixels = stack.plane(z_index).and_then(|plane| {
                match source.load(&plane.path) {
                    Ok(pixels) => Some(Arc::new(pixels)),
                    Err(e) => {
                        tracing::warn!("Stack {}: {e}; showing a blank tile", stack.position);
                        None
                    }
                }
            });
            let current = done.fetch_add(1, Ordering::SeqCst) + 1;
            progress(RenderProgress { current, total });
            pixels
        });

        let decoded = match decoded {
            Some(decoded) if is_current() => decoded,
            _ => {
                tracing::debug!("Render of z={z_index} superseded, discarding tiles");
                return RenderOutcome::Superseded;
            }
        };

        self.cache.z_index = Some(z_index);
        self.layout(z_index, decoded, state);
        RenderOutcome::Rendered
    }

    /// Re-places and re-divides one stack's tile after its offset or flat
    /// changed and recomposites only the affected area. Returns the repainted
    /// rectangle, or `None` if nothing visible changed.
    pub fn refresh_tile(
        &mut self,
        position: StagePosition,
        state: &AlignmentState,
    ) -> Result<Option<Rect>> {
        let Some(cached) = self.cache.tiles.get(&position) else {
            if self.stacks.iter().any(|s| s.position == position) {
                return Ok(None);
            }
            return Err(Error::UnknownStack { position });
        };
        if self.mosaic.is_none() {
            return Ok(None);
        }
        let origin_y = cached.origin.1;

        let flat_index = state.record(&position).and_then(|r| r.flat);
        let flat_changed = cached.flat_index != flat_index;
        if flat_changed {
            let flat = self.flat_profile(flat_index, state);
            if let Some(cached) = self.cache.tiles.get_mut(&position) {
                cached.flat_index = flat_index;
                cached.flat = flat;
            }
        }

        let offset = y_offset_pixels(state, &position, self.xy_voxel_size);
        let Some(mosaic) = self.mosaic.as_mut() else {
            return Ok(None);
        };
        let Some(tile) = mosaic.tiles.iter_mut().find(|t| t.position == position) else {
            return Err(Error::UnknownStack { position });
        };
        let old = tile.rect;
        let new = Rect {
            y: origin_y + offset,
            ..old
        };
        if new == old && !flat_changed {
            return Ok(None);
        }
        tile.rect = new;

        let Some(dirty) = old.union(&new).clip(mosaic.image.width(), mosaic.image.height()) else {
            return Ok(None);
        };
        composite(mosaic, &self.cache, self.dark, dirty);
        Ok(Some(dirty))
    }

    /// Changes the pixel size and re-lays out the cached tiles. Offsets in
    /// `state` stay in microns; only their pixel placement changes.
    ///
    /// # Panics
    ///
    /// Panics if `xy_voxel_size` is not positive.
    pub fn set_xy_voxel_size(&mut self, xy_voxel_size: f64, state: &AlignmentState) {
        assert!(xy_voxel_size > 0.0, "xy_voxel_size must be positive");
        self.xy_voxel_size = xy_voxel_size;
        self.relayout(state);
    }

    pub fn set_dark(&mut self, dark: u16, state: &AlignmentState) {
        self.dark = dark;
        self.relayout(state);
    }

    /// Recomposites every cached tile without decoding planes. Flats are
    /// loaded only the first time a tile is assigned one.
    pub fn relayout(&mut self, state: &AlignmentState) {
        let Some(z_index) = self.cache.z_index else {
            return;
        };
        let decoded = self
            .stacks
            .iter()
            .map(|s| {
                self.cache
                    .tiles
                    .get(&s.position)
                    .and_then(|t| t.pixels.clone())
            })
            .collect();
        self.layout(z_index, decoded, state);
    }

    /// Rebuilds the cache and the full composite from `decoded` (one entry
    /// per stack, in stack order).
    fn layout(
        &mut self,
        z_index: usize,
        decoded: Vec<Option<Arc<Buffer2<u16>>>>,
        state: &AlignmentState,
    ) {
        for pixels in decoded.iter().flatten() {
            self.tile_size.0 = self.tile_size.0.max(pixels.width());
            self.tile_size.1 = self.tile_size.1.max(pixels.height());
        }
        let (tile_w, tile_h) = self.tile_size;

        let nominal: Vec<(i64, i64)> = self
            .stacks
            .iter()
            .map(|s| {
                (
                    microns_to_pixels(s.position.x_microns(), self.xy_voxel_size),
                    microns_to_pixels(s.position.y_microns(), self.xy_voxel_size),
                )
            })
            .collect();
        let min_x = nominal.iter().map(|n| n.0).min().unwrap_or(0);
        let min_y = nominal.iter().map(|n| n.1).min().unwrap_or(0);
        let max_x = nominal.iter().map(|n| n.0 - min_x).max().unwrap_or(0);
        let max_y = nominal.iter().map(|n| n.1 - min_y).max().unwrap_or(0);
        let (width, height) = if self.stacks.is_empty() {
            (0, 0)
        } else {
            (max_x as usize + tile_w, max_y as usize + tile_h)
        };

        let flat_indices: Vec<Option<usize>> = self
            .stacks
            .iter()
            .map(|s| state.record(&s.position).and_then(|r| r.flat))
            .collect();
        let flats: Vec<Option<Arc<Vec<f32>>>> = flat_indices
            .iter()
            .map(|&flat| self.flat_profile(flat, state))
            .collect();

        let mut cache = BTreeMap::new();
        let mut tiles = Vec::with_capacity(self.stacks.len());
        let placements = decoded.into_iter().zip(&nominal).zip(flat_indices.into_iter().zip(flats));
        for (stack, ((pixels, (nx, ny)), (flat_index, flat))) in self.stacks.iter().zip(placements) {
            let origin = (nx - min_x, ny - min_y);
            let (w, h) = pixels
                .as_ref()
                .map_or((tile_w, tile_h), |p| (p.width(), p.height()));
            let offset = y_offset_pixels(state, &stack.position, self.xy_voxel_size);
            tiles.push(TileBounds {
                position: stack.position,
                rect: Rect::new(origin.0, origin.1 + offset, w, h),
                placeholder: pixels.is_none(),
            });
            cache.insert(
                stack.position,
                CachedTile {
                    pixels,
                    origin,
                    flat_index,
                    flat,
                },
            );
        }

        let mut column_seams: Vec<i64> = nominal.iter().map(|n| n.0 - min_x).collect();
        column_seams.sort_unstable();
        column_seams.dedup();
        column_seams.retain(|&x| x > 0);
        let mut row_seams: Vec<i64> = nominal.iter().map(|n| n.1 - min_y).collect();
        row_seams.sort_unstable();
        row_seams.dedup();
        row_seams.retain(|&y| y > 0);

        self.cache.tiles = cache;
        let mut mosaic = Mosaic {
            z_index,
            image: Buffer2::new_filled(width, height, 0.0),
            tiles,
            column_seams,
            row_seams,
        };
        let full = mosaic.image.bounds();
        composite(&mut mosaic, &self.cache, self.dark, full);
        self.mosaic = Some(mosaic);
    }

    /// Profile of catalog flat `flat`, loaded through the plane source once.
    fn flat_profile(&mut self, flat: Option<usize>, state: &AlignmentState) -> Option<Arc<Vec<f32>>> {
        let index = flat?;
        if let Some(profile) = self.flats.get(&index) {
            return profile.clone();
        }
        let file = state.catalog().get(index)?;
        let profile = match self.source.load_flat_profile(&file.path) {
            Ok(profile) => Some(Arc::new(profile)),
            Err(e) => {
                tracing::warn!("Flat {}: {e}; its tiles are shown uncorrected", file.file_name());
                None
            }
        };
        self.flats.insert(index, profile.clone());
        profile
    }
}

fn y_offset_pixels(state: &AlignmentState, position: &StagePosition, xy_voxel_size: f64) -> i64 {
    state
        .record(position)
        .map_or(0, |r| r.y_offset_pixels(xy_voxel_size))
}

/// Clears `region` and redraws every tile overlapping it, in draw order.
fn composite(mosaic: &mut Mosaic, cache: &TileCache, dark: u16, region: Rect) {
    mosaic.image.fill_rect(region, 0.0);
    for tile in &mosaic.tiles {
        let Some(visible) = tile.rect.intersect(&region) else {
            continue;
        };
        let Some(cached) = cache.tiles.get(&tile.position) else {
            continue;
        };
        let Some(pixels) = cached.pixels.as_ref() else {
            mosaic.image.fill_rect(visible, 0.0);
            continue;
        };

        let divisor = cached.flat.as_ref().map(|profile| {
            shifted_divisor(profile, tile.rect.y - cached.origin.1, pixels.height())
        });
        for y in visible.y..visible.bottom() {
            let row = (y - tile.rect.y) as usize;
            let d = match &divisor {
                Some(divisor) if divisor[row].is_finite() && divisor[row] > 0.0 => divisor[row],
                _ => 1.0,
            };
            let row_region = Rect::new(visible.x, y, visible.width, 1);
            mosaic.image.blit_map(pixels, tile.rect.x, tile.rect.y, row_region, |v| {
                v.saturating_sub(dark) as f32 / d
            });
        }
    }
}
