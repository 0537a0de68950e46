//! Tiled rendering of one page at one zoom and rotation
//!
//! The display canvas is cut into a row-major grid of fixed-size tiles, the
//! last row and column clipped to the canvas. Each tile keeps its own
//! [`PixelRequest`] and renders the native region under it on demand, so a
//! viewer only pays for what is on screen. [`TileCache::render_visible`]
//! keeps a bounded set of rendered tiles and releases the least recently
//! shown ones.

use std::num::NonZeroUsize;

use log::debug;
use lru::LruCache;

use crate::error::{RenderError, Result};
use crate::geometry::{Rect, Rotation};
use crate::page::Page;
use crate::pixels::PixelRequest;
use crate::settings::settings;
use crate::types::ColorMode;

/// `(column, row)` of a tile in its grid
pub type TileKey = (u32, u32);

#[derive(Debug)]
pub struct Tile {
    column: u32,
    row: u32,
    rect: Rect,
    native_rect: Rect,
    pixels: PixelRequest,
}

impl Tile {
    #[must_use]
    pub fn key(&self) -> TileKey {
        (self.column, self.row)
    }

    /// Area on the display canvas
    #[must_use]
    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Same area in the native frame at zoom 1
    #[must_use]
    pub fn native_rect(&self) -> Rect {
        self.native_rect
    }

    #[must_use]
    pub fn pixels(&self) -> &PixelRequest {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut PixelRequest {
        &mut self.pixels
    }

    #[must_use]
    pub fn is_rendered(&self) -> bool {
        !self.pixels.is_dirty()
    }

    /// Render if not rendered yet; returns whether the engine was called
    pub fn render(&mut self) -> Result<bool> {
        self.pixels.draw_page(self.native_rect)
    }

    /// Release the tile's pixels; it renders again on the next request
    pub fn dispose(&mut self) {
        self.pixels.release();
    }
}

#[derive(Debug)]
pub struct TileCache {
    page: Page,
    extent: Rect,
    tile_width: u32,
    tile_height: u32,
    columns: u32,
    rows: u32,
    tiles: Vec<Tile>,
    resident: LruCache<TileKey, ()>,
}

impl TileCache {
    /// Tile `page` with tiles of the configured default size
    pub fn new(page: &Page, color: ColorMode, rotation: Rotation, zoom: f32) -> Result<Self> {
        let s = settings();
        Self::with_tile_size(page, color, rotation, zoom, s.tile_width, s.tile_height)
    }

    pub fn with_tile_size(
        page: &Page,
        color: ColorMode,
        rotation: Rotation,
        zoom: f32,
        tile_width: u32,
        tile_height: u32,
    ) -> Result<Self> {
        if tile_width == 0 || tile_height == 0 {
            return Err(RenderError::invalid(format!(
                "tile size must be positive, got {tile_width}x{tile_height}"
            )));
        }

        let template = PixelRequest::with(page.clone(), zoom, rotation, color)?;
        let extent = template.display_extent()?;
        let canvas = extent.round_out();
        let (width, height) = (canvas.width(), canvas.height());
        let columns = width.div_ceil(tile_width);
        let rows = height.div_ceil(tile_height);

        let mut tiles = Vec::with_capacity(columns as usize * rows as usize);
        for row in 0..rows {
            for column in 0..columns {
                let x0 = column * tile_width;
                let y0 = row * tile_height;
                let rect = Rect::new(
                    x0 as f32,
                    y0 as f32,
                    (x0 + tile_width).min(width) as f32,
                    (y0 + tile_height).min(height) as f32,
                );
                tiles.push(Tile {
                    column,
                    row,
                    rect,
                    native_rect: template.to_native(rect)?,
                    pixels: template.clone_settings(),
                });
            }
        }
        debug!(
            "Tiled page {} into {columns}x{rows} tiles of {tile_width}x{tile_height} ({width}x{height})",
            page.number()
        );

        let capacity = NonZeroUsize::new(settings().max_resident_tiles).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            page: page.clone(),
            extent: Rect::new(0.0, 0.0, width as f32, height as f32),
            tile_width,
            tile_height,
            columns,
            rows,
            tiles,
            resident: LruCache::new(capacity),
        })
    }

    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Whole canvas in display pixels, anchored at the origin
    #[must_use]
    pub fn extent(&self) -> Rect {
        self.extent
    }

    /// `(columns, rows)`
    #[must_use]
    pub fn grid_size(&self) -> (u32, u32) {
        (self.columns, self.rows)
    }

    #[must_use]
    pub fn tile_size(&self) -> (u32, u32) {
        (self.tile_width, self.tile_height)
    }

    /// Tiles in row-major order
    #[must_use]
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    fn index(&self, (column, row): TileKey) -> Option<usize> {
        (column < self.columns && row < self.rows)
            .then(|| row as usize * self.columns as usize + column as usize)
    }

    #[must_use]
    pub fn tile(&self, key: TileKey) -> Option<&Tile> {
        self.tiles.get(self.index(key)?)
    }

    pub fn tile_mut(&mut self, key: TileKey) -> Option<&mut Tile> {
        let index = self.index(key)?;
        self.tiles.get_mut(index)
    }

    /// Tiles overlapping `viewport` (display frame)
    pub fn tiles_in(&self, viewport: Rect) -> impl Iterator<Item = &Tile> {
        let viewport = viewport.normalized();
        self.tiles
            .iter()
            .filter(move |tile| tile.rect.intersects(&viewport))
    }

    /// Render every tile overlapping `viewport` and mark it recently shown.
    /// Tiles pushed out of the residency window are released. Returns how
    /// many tiles actually called the engine.
    pub fn render_visible(&mut self, viewport: Rect) -> Result<usize> {
        let visible: Vec<TileKey> = self.tiles_in(viewport).map(Tile::key).collect();
        let mut rendered = 0;
        for key in visible {
            let Some(tile) = self.tile_mut(key) else {
                continue;
            };
            if tile.render()? {
                rendered += 1;
            }
            if let Some((evicted, ())) = self.resident.push(key, ()) {
                if evicted != key {
                    if let Some(old) = self.tile_mut(evicted) {
                        debug!("Releasing tile {evicted:?}");
                        old.dispose();
                    }
                }
            }
        }
        Ok(rendered)
    }

    /// Render every tile in row-major order
    pub fn render_all(&mut self) -> Result<usize> {
        let mut rendered = 0;
        for tile in &mut self.tiles {
            if tile.render()? {
                rendered += 1;
            }
        }
        Ok(rendered)
    }

    /// Number of tiles currently holding pixels
    #[must_use]
    pub fn rendered_count(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_rendered()).count()
    }

    /// Release every tile's pixels
    pub fn dispose(&mut self) {
        for tile in &mut self.tiles {
            tile.dispose();
        }
        self.resident.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::document::Document;
    use crate::test_utils::{ScriptedDocument, ScriptedEngine, ScriptedPage};
    use crate::types::DocumentType;

    fn page(bbox: Rect, rotation: i32) -> (Arc<ScriptedEngine>, Page) {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedDocument::new(vec![ScriptedPage::new(bbox, rotation)]));
        let doc = Document::open(engine.clone(), b"t".to_vec(), None, DocumentType::Pdf, 0).unwrap();
        let page = doc.page(1).unwrap();
        (engine, page)
    }

    #[test]
    fn grid_covers_the_canvas_and_clips_the_edges() {
        let (_engine, page) = page(Rect::new(0.0, 0.0, 1000.0, 1030.0), 0);
        let cache = TileCache::with_tile_size(&page, ColorMode::Rgb, Rotation::Deg0, 1.0, 512, 512).unwrap();

        assert_eq!(cache.grid_size(), (2, 3));
        assert_eq!(cache.tiles().len(), 6);
        assert_eq!(cache.extent(), Rect::new(0.0, 0.0, 1000.0, 1030.0));

        let keys: Vec<TileKey> = cache.tiles().iter().map(Tile::key).collect();
        assert_eq!(keys, vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)]);

        let corner = cache.tile((1, 2)).unwrap();
        assert_eq!(corner.rect(), Rect::new(512.0, 1024.0, 1000.0, 1030.0));
        assert_eq!(corner.rect().height(), 6.0);
        assert!(cache.tile((2, 0)).is_none());
    }

    #[test]
    fn rotated_canvas_swaps_the_extent() {
        let (_engine, page) = page(Rect::new(0.0, 0.0, 1030.0, 1000.0), 0);
        let cache = TileCache::with_tile_size(&page, ColorMode::Rgb, Rotation::Deg90, 1.0, 512, 512).unwrap();
        assert_eq!(cache.extent(), Rect::new(0.0, 0.0, 1000.0, 1030.0));
        assert_eq!(cache.grid_size(), (2, 3));

        // The top-left display tile comes from the bottom-left of the page.
        let first = cache.tile((0, 0)).unwrap();
        assert_eq!(first.native_rect(), Rect::new(0.0, 488.0, 512.0, 1000.0));
    }

    #[test]
    fn tiles_render_to_their_display_size() {
        let (engine, page) = page(Rect::new(0.0, 0.0, 600.0, 400.0), 0);
        let mut cache = TileCache::with_tile_size(&page, ColorMode::Gray, Rotation::Deg270, 1.5, 256, 256).unwrap();
        assert_eq!(cache.render_all().unwrap(), cache.tiles().len());
        for tile in cache.tiles() {
            let rect = tile.rect();
            assert_eq!(tile.pixels().width(), rect.width() as u32);
            assert_eq!(tile.pixels().height(), rect.height() as u32);
        }
        assert_eq!(engine.stats().rasterize_calls(), cache.tiles().len());
        assert_eq!(cache.render_all().unwrap(), 0);
    }

    #[test]
    fn only_visible_tiles_are_rendered() {
        let (engine, page) = page(Rect::new(0.0, 0.0, 2048.0, 2048.0), 0);
        let mut cache = TileCache::with_tile_size(&page, ColorMode::Rgb, Rotation::Deg0, 1.0, 512, 512).unwrap();
        let viewport = Rect::new(100.0, 100.0, 700.0, 600.0);
        assert_eq!(cache.tiles_in(viewport).count(), 4);
        assert_eq!(cache.render_visible(viewport).unwrap(), 4);
        assert_eq!(cache.render_visible(viewport).unwrap(), 0);
        assert_eq!(cache.rendered_count(), 4);
        assert_eq!(engine.stats().rasterize_calls(), 4);
    }

    #[test]
    fn residency_is_bounded_while_panning() {
        let (engine, page) = page(Rect::new(0.0, 0.0, 2048.0, 2048.0), 0);
        let mut cache = TileCache::with_tile_size(&page, ColorMode::Gray, Rotation::Deg0, 1.0, 128, 128).unwrap();
        let limit = settings().max_resident_tiles;
        assert_eq!(cache.render_visible(cache.extent()).unwrap(), 256);
        assert_eq!(cache.rendered_count(), limit.min(256));
        assert_eq!(engine.stats().outstanding(), limit.min(256));

        // The most recently shown tile survives.
        assert!(cache.tile((15, 15)).unwrap().is_rendered());
        assert!(!cache.tile((0, 0)).unwrap().is_rendered() || limit >= 256);
    }

    #[test]
    fn zero_sized_tiles_are_rejected() {
        let (_engine, page) = page(Rect::new(0.0, 0.0, 100.0, 100.0), 0);
        assert!(matches!(
            TileCache::with_tile_size(&page, ColorMode::Rgb, Rotation::Deg0, 1.0, 0, 64),
            Err(RenderError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn dispose_returns_every_buffer() {
        let (engine, page) = page(Rect::new(0.0, 0.0, 1024.0, 1024.0), 0);
        let mut cache = TileCache::with_tile_size(&page, ColorMode::Rgb, Rotation::Deg0, 1.0, 512, 512).unwrap();
        cache.render_all().unwrap();
        assert_eq!(engine.stats().outstanding(), 4);
        cache.dispose();
        assert_eq!(engine.stats().outstanding(), 0);
        assert_eq!(cache.rendered_count(), 0);
    }
}
