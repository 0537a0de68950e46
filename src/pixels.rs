//! Pixel request: mutable render settings bound to one page
//!
//! Setters short-circuit on equal values; any real change marks the request
//! dirty and drops whatever was realized. Drawing is a no-op while clean, so
//! redundant UI events never reach the native layer. The engine buffer is held
//! in a [`BufferLease`] until its bytes are copied out, then handed back.

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use log::{debug, warn};

use crate::engine::RasterParams;
use crate::engine::pack::pack_bits;
use crate::error::{RenderError, Result};
use crate::geometry::{Rect, Rotation};
use crate::lease::BufferLease;
use crate::page::Page;
use crate::types::{ColorMode, PixelData};

/// Resolution of a render at zoom 1
pub const BASE_DPI: f32 = 72.0;

pub struct PixelRequest {
    page: Page,
    zoom: f32,
    rotation: Rotation,
    color: ColorMode,
    gamma: f32,
    bound_box: Rect,
    dirty: bool,
    lease: Option<BufferLease>,
    pixels: Option<PixelData>,
    image: Option<DynamicImage>,
}

impl std::fmt::Debug for PixelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelRequest")
            .field("page", &self.page.number())
            .field("zoom", &self.zoom)
            .field("rotation", &self.rotation)
            .field("color", &self.color)
            .field("gamma", &self.gamma)
            .field("bound_box", &self.bound_box)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

fn check_zoom(zoom: f32) -> Result<f32> {
    if zoom.is_finite() && zoom > 0.0 {
        Ok(zoom)
    } else {
        Err(RenderError::invalid(format!("zoom must be positive, got {zoom}")))
    }
}

fn sanitize_gamma(gamma: f32) -> f32 {
    if gamma.is_finite() && gamma > 0.0 {
        gamma
    } else {
        1.0
    }
}

impl PixelRequest {
    /// Zoom 1, no rotation, RGB, gamma 1
    #[must_use]
    pub fn new(page: Page) -> Self {
        Self {
            page,
            zoom: 1.0,
            rotation: Rotation::Deg0,
            color: ColorMode::Rgb,
            gamma: 1.0,
            bound_box: Rect::ZERO,
            dirty: true,
            lease: None,
            pixels: None,
            image: None,
        }
    }

    pub fn with(page: Page, zoom: f32, rotation: Rotation, color: ColorMode) -> Result<Self> {
        let mut request = Self::new(page);
        request.zoom = check_zoom(zoom)?;
        request.rotation = rotation;
        request.color = color;
        Ok(request)
    }

    /// Fresh, dirty request with the same parameters
    #[must_use]
    pub fn clone_settings(&self) -> Self {
        self.rebind(self.page.clone())
    }

    /// Fresh, dirty request on `page` with this request's parameters
    #[must_use]
    pub fn rebind(&self, page: Page) -> Self {
        Self {
            zoom: self.zoom,
            rotation: self.rotation,
            color: self.color,
            gamma: self.gamma,
            ..Self::new(page)
        }
    }

    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    #[must_use]
    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    /// Rotation as requested, possibly `Auto`
    #[must_use]
    pub fn requested_rotation(&self) -> Rotation {
        self.rotation
    }

    /// Rotation applied to the native call, composed with the page's own
    #[must_use]
    pub fn rotation(&self) -> i32 {
        self.rotation.effective(self.page.rotation())
    }

    #[must_use]
    pub fn color(&self) -> ColorMode {
        self.color
    }

    #[must_use]
    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    /// Requested box before a render, actual rendered box after
    #[must_use]
    pub fn bound_box(&self) -> Rect {
        self.bound_box
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.bound_box.width().max(0.0) as u32
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.bound_box.height().max(0.0) as u32
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn resolution(&self) -> f32 {
        BASE_DPI * self.zoom
    }

    /// Drop realized buffers and require a new render
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.release_buffers();
    }

    fn release_buffers(&mut self) {
        self.lease = None;
        self.pixels = None;
        self.image = None;
    }

    pub fn set_zoom(&mut self, zoom: f32) -> Result<bool> {
        let zoom = check_zoom(zoom)?;
        if zoom == self.zoom {
            return Ok(false);
        }
        self.zoom = zoom;
        self.mark_dirty();
        Ok(true)
    }

    pub fn set_rotation(&mut self, rotation: Rotation) -> bool {
        if rotation == self.rotation {
            return false;
        }
        self.rotation = rotation;
        self.mark_dirty();
        true
    }

    pub fn set_color(&mut self, color: ColorMode) -> bool {
        if color == self.color {
            return false;
        }
        self.color = color;
        self.mark_dirty();
        true
    }

    /// Non-positive or non-finite gamma means 1.0
    pub fn set_gamma(&mut self, gamma: f32) -> bool {
        let gamma = sanitize_gamma(gamma);
        if gamma == self.gamma {
            return false;
        }
        self.gamma = gamma;
        self.mark_dirty();
        true
    }

    /// Forward to the document; dirty only if the level actually changed
    pub fn set_anti_alias_level(&mut self, level: i32) -> bool {
        if !self.page.document().set_anti_alias_level(level) {
            return false;
        }
        self.mark_dirty();
        true
    }

    /// Page box at the origin, zoom 1, native frame
    fn local_box(&self) -> Rect {
        let bbox = self.page.bound_box();
        Rect::new(0.0, 0.0, bbox.width(), bbox.height())
    }

    /// Whole-page canvas in this request's display frame, anchored at the origin
    pub fn display_extent(&self) -> Result<Rect> {
        let local = self.local_box();
        Ok(local.rotate(&local, self.rotation())?.scale(self.zoom))
    }

    /// Map a native-frame page rectangle into this request's display frame
    pub fn to_display(&self, native: Rect) -> Result<Rect> {
        let bbox = self.page.bound_box();
        let local = native.translate(-bbox.x0, -bbox.y0);
        Ok(local.rotate(&self.local_box(), self.rotation())?.scale(self.zoom))
    }

    /// Map a display-frame rectangle back to the native frame at zoom 1
    pub fn to_native(&self, display: Rect) -> Result<Rect> {
        let bbox = self.page.bound_box();
        let local = self.local_box();
        let canvas = local.rotate(&local, self.rotation())?;
        let unrotated = display
            .normalized()
            .scale(1.0 / self.zoom)
            .rotate(&canvas, -self.rotation())?;
        Ok(unrotated.translate(bbox.x0, bbox.y0))
    }

    /// Rasterize `rect` (native frame, zoom 1; all-zero for the whole page).
    ///
    /// No-op returning `Ok(false)` while clean. On success the bound box
    /// becomes the actual rendered box and the request is clean. On failure
    /// the request stays dirty so it can be retried.
    pub fn draw_page(&mut self, rect: Rect) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.release_buffers();
        self.bound_box = rect;

        let params = RasterParams {
            zoom: self.zoom,
            rotation: self.rotation(),
            color: self.color,
            gamma: self.gamma,
            crop: rect,
        };
        let lease = match self.page.rasterize(&params) {
            Ok(lease) => lease,
            Err(RenderError::OutOfMemory) => {
                warn!("Out of memory rendering page {}", self.page.number());
                self.page.reclaim_memory();
                return Err(RenderError::OutOfMemory);
            }
            Err(e) => return Err(e),
        };

        let bbox = lease.bbox();
        let expected = bbox.width() as usize * bbox.height() as usize * self.color.bytes_per_pixel();
        if lease.samples().len() != expected {
            warn!(
                "Page {} returned {} bytes for a {}x{} box",
                self.page.number(),
                lease.samples().len(),
                bbox.width(),
                bbox.height()
            );
            return Err(RenderError::render_failed(
                "pixel buffer does not match the rendered box",
            ));
        }

        self.bound_box = bbox.to_rect();
        self.lease = Some(lease);
        self.dirty = false;
        Ok(true)
    }

    /// Whole page
    pub fn draw(&mut self) -> Result<bool> {
        self.draw_page(Rect::ZERO)
    }

    /// Rasterize `rect` given in `reference`'s display frame
    pub fn draw_page_in(&mut self, reference: &PixelRequest, rect: Rect) -> Result<bool> {
        let native = reference.to_native(rect)?;
        self.draw_page(native)
    }

    /// Rendered pixels, copied out of the engine buffer on first access.
    /// `None` while dirty.
    pub fn pixels(&mut self) -> Result<Option<&PixelData>> {
        if self.dirty {
            return Ok(None);
        }
        if self.pixels.is_none() {
            let Some(lease) = self.lease.take() else {
                return Ok(None);
            };
            match copy_out(lease.samples(), self.color) {
                Ok(data) => self.pixels = Some(data),
                Err(e) => {
                    self.dirty = true;
                    return Err(e);
                }
            }
            debug!(
                "Copied {}x{} pixels of page {}",
                self.width(),
                self.height(),
                self.page.number()
            );
        }
        Ok(self.pixels.as_ref())
    }

    /// Rendered image, built on first access. `None` while dirty.
    pub fn image(&mut self) -> Result<Option<&DynamicImage>> {
        if self.dirty {
            return Ok(None);
        }
        if self.image.is_none() {
            let (width, height, color) = (self.width(), self.height(), self.color);
            let Some(pixels) = self.pixels()? else {
                return Ok(None);
            };
            self.image = Some(materialize(pixels, width, height, color)?);
        }
        Ok(self.image.as_ref())
    }

    /// Binary renders as 1-bit rows, MSB first, each row padded to a byte.
    /// `None` while dirty or for non-binary color modes.
    pub fn bit_rows(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.color.is_binary() {
            return Ok(None);
        }
        let (width, height) = (self.width() as usize, self.height() as usize);
        Ok(self
            .pixels()?
            .and_then(PixelData::as_byte)
            .map(|bytes| pack_bits(bytes, width, height)))
    }

    /// Release every realized buffer; the next draw renders again
    pub fn release(&mut self) {
        self.mark_dirty();
    }
}

fn copy_out(samples: &[u8], color: ColorMode) -> Result<PixelData> {
    if color.is_packed_int() {
        let mut out = Vec::new();
        out.try_reserve_exact(samples.len() / 4)
            .map_err(|_| RenderError::OutOfMemory)?;
        out.extend(
            samples
                .chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]])),
        );
        Ok(PixelData::Int(out))
    } else {
        let mut out = Vec::new();
        out.try_reserve_exact(samples.len())
            .map_err(|_| RenderError::OutOfMemory)?;
        out.extend_from_slice(samples);
        Ok(PixelData::Byte(out))
    }
}

fn materialize(pixels: &PixelData, width: u32, height: u32, color: ColorMode) -> Result<DynamicImage> {
    let mismatch = || RenderError::render_failed("pixel buffer does not match the rendered box");
    let image = match pixels {
        PixelData::Byte(bytes) => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, bytes.clone()).ok_or_else(mismatch)?)
        }
        PixelData::Int(words) => match color {
            ColorMode::Argb | ColorMode::ArgbPre => {
                let raw = words
                    .iter()
                    .flat_map(|p| [(p >> 16) as u8, (p >> 8) as u8, *p as u8, (p >> 24) as u8])
                    .collect();
                DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, raw).ok_or_else(mismatch)?)
            }
            ColorMode::Bgr => {
                let raw = words
                    .iter()
                    .flat_map(|p| [*p as u8, (p >> 8) as u8, (p >> 16) as u8])
                    .collect();
                DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, raw).ok_or_else(mismatch)?)
            }
            _ => {
                let raw = words
                    .iter()
                    .flat_map(|p| [(p >> 16) as u8, (p >> 8) as u8, *p as u8])
                    .collect();
                DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, raw).ok_or_else(mismatch)?)
            }
        },
    };
    Ok(image)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::document::Document;
    use crate::test_utils::{ScriptedDocument, ScriptedEngine, ScriptedPage};
    use crate::types::DocumentType;

    fn setup(doc: ScriptedDocument) -> (Arc<ScriptedEngine>, Document) {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(doc);
        let document =
            Document::open(engine.clone(), b"pixels".to_vec(), None, DocumentType::Pdf, 0).unwrap();
        (engine, document)
    }

    fn letter_request() -> (Arc<ScriptedEngine>, PixelRequest) {
        let (engine, doc) = setup(ScriptedDocument::letter(2).with_shade(0x40));
        let request = PixelRequest::new(doc.page(1).unwrap());
        (engine, request)
    }

    #[test]
    fn defaults_match_a_plain_render() {
        let (_engine, request) = letter_request();
        assert_eq!(request.zoom(), 1.0);
        assert_eq!(request.gamma(), 1.0);
        assert_eq!(request.requested_rotation(), Rotation::Deg0);
        assert_eq!(request.color(), ColorMode::Rgb);
        assert!(request.is_dirty());
        assert_eq!(request.resolution(), 72.0);
    }

    #[test]
    fn clean_request_skips_the_native_call() {
        let (engine, mut request) = letter_request();
        assert!(request.draw().unwrap());
        assert!(!request.draw().unwrap());
        assert!(!request.draw_page(Rect::new(0.0, 0.0, 10.0, 10.0)).unwrap());
        assert_eq!(engine.stats().rasterize_calls(), 1);
        assert_eq!(request.bound_box(), Rect::new(0.0, 0.0, 612.0, 792.0));
    }

    #[test]
    fn equal_values_do_not_dirty() {
        let (engine, mut request) = letter_request();
        request.draw().unwrap();
        assert!(!request.set_zoom(1.0).unwrap());
        assert!(!request.set_rotation(Rotation::Deg0));
        assert!(!request.set_color(ColorMode::Rgb));
        assert!(!request.set_gamma(1.0));
        assert!(!request.set_gamma(-4.0));
        assert!(!request.is_dirty());

        assert!(request.set_zoom(2.0).unwrap());
        assert!(request.is_dirty());
        request.draw().unwrap();
        assert_eq!(engine.stats().rasterize_calls(), 2);
        assert_eq!(request.width(), 1224);
        assert_eq!(request.height(), 1584);
    }

    #[test]
    fn invalid_zoom_is_rejected() {
        let (_engine, mut request) = letter_request();
        assert!(matches!(
            request.set_zoom(0.0),
            Err(RenderError::InvalidArgument { .. })
        ));
        assert!(request.set_zoom(f32::NAN).is_err());
        assert_eq!(request.zoom(), 1.0);
    }

    #[test]
    fn effective_rotation_uses_inherent_rotation() {
        let (_engine, doc) = setup(ScriptedDocument::new(vec![ScriptedPage::new(
            Rect::new(0.0, 0.0, 200.0, 100.0),
            90,
        )]));
        let mut request = PixelRequest::new(doc.page(1).unwrap());
        assert_eq!(request.rotation(), 0);
        request.set_rotation(Rotation::Auto);
        assert_eq!(request.rotation(), 90);
        request.set_rotation(Rotation::Deg270);
        assert_eq!(request.rotation(), 0);
        request.set_rotation(Rotation::Deg90);
        assert_eq!(request.rotation(), 180);

        request.set_rotation(Rotation::Auto);
        request.draw().unwrap();
        assert_eq!(request.width(), 100);
        assert_eq!(request.height(), 200);
    }

    #[test]
    fn failed_render_stays_dirty_and_can_retry() {
        let (engine, mut request) = letter_request();
        engine.fail_next_rasters(1);
        assert!(matches!(
            request.draw(),
            Err(RenderError::RenderFailed { .. })
        ));
        assert!(request.is_dirty());
        assert!(request.pixels().unwrap().is_none());
        assert!(request.draw().unwrap());
    }

    #[test]
    fn out_of_memory_asks_the_engine_to_reclaim() {
        let (engine, mut request) = letter_request();
        engine.oom_next_rasters(1);
        assert!(matches!(request.draw(), Err(RenderError::OutOfMemory)));
        assert_eq!(engine.stats().reclaims(), 1);
        assert!(request.is_dirty());
    }

    #[test]
    fn short_buffer_is_rejected_and_stays_dirty() {
        let (engine, mut request) = letter_request();
        engine.truncate_next_rasters(1);
        assert!(matches!(
            request.draw_page(Rect::new(0.0, 0.0, 10.0, 10.0)),
            Err(RenderError::RenderFailed { .. })
        ));
        assert!(request.is_dirty());
        assert!(request.pixels().unwrap().is_none());
        assert_eq!(engine.stats().outstanding(), 0);

        assert!(request.draw_page(Rect::new(0.0, 0.0, 10.0, 10.0)).unwrap());
        assert_eq!(request.pixels().unwrap().unwrap().len(), 100);
    }

    #[test]
    fn anti_alias_change_forces_a_new_render() {
        let (engine, mut request) = letter_request();
        request.draw().unwrap();
        assert!(!request.set_anti_alias_level(8));
        assert!(!request.is_dirty());

        assert!(request.set_anti_alias_level(2));
        assert!(request.is_dirty());
        assert_eq!(request.page().document().anti_alias_level(), 2);
        assert!(request.draw().unwrap());
        assert_eq!(engine.stats().rasterize_calls(), 2);
    }

    #[test]
    fn binary_renders_pack_into_bit_rows() {
        let (_engine, doc) = setup(ScriptedDocument::letter(6).with_shade(0xFF));
        let mut light = PixelRequest::with(doc.page(6).unwrap(), 1.0, Rotation::Deg0, ColorMode::Binary).unwrap();
        light.draw_page(Rect::new(0.0, 0.0, 10.0, 2.0)).unwrap();
        assert_eq!(light.bit_rows().unwrap().unwrap(), vec![0xFF, 0b1100_0000, 0xFF, 0b1100_0000]);

        let mut dark = PixelRequest::with(doc.page(1).unwrap(), 1.0, Rotation::Deg0, ColorMode::Binary).unwrap();
        assert!(dark.bit_rows().unwrap().is_none());
        dark.draw_page(Rect::new(0.0, 0.0, 10.0, 2.0)).unwrap();
        assert_eq!(dark.bit_rows().unwrap().unwrap(), vec![0; 4]);

        let mut rgb = PixelRequest::new(doc.page(1).unwrap());
        rgb.draw_page(Rect::new(0.0, 0.0, 10.0, 2.0)).unwrap();
        assert!(rgb.bit_rows().unwrap().is_none());
    }

    #[test]
    fn pixels_are_copied_then_released() {
        let (engine, mut request) = letter_request();
        request.draw_page(Rect::new(0.0, 0.0, 4.0, 2.0)).unwrap();
        assert_eq!(engine.stats().outstanding(), 1);

        let pixels = request.pixels().unwrap().unwrap().clone();
        assert_eq!(engine.stats().outstanding(), 0);
        assert_eq!(engine.stats().releases(), 1);
        let words = pixels.as_int().unwrap();
        assert_eq!(words.len(), 8);
        assert!(words.iter().all(|p| *p == 0x0040_2820));
    }

    #[test]
    fn gray_pixels_come_back_as_bytes() {
        let (_engine, mut request) = letter_request();
        request.set_color(ColorMode::Gray);
        request.draw_page(Rect::new(0.0, 0.0, 3.0, 3.0)).unwrap();
        let pixels = request.pixels().unwrap().unwrap();
        assert_eq!(pixels.as_byte().unwrap().len(), 9);
    }

    #[test]
    fn image_is_materialized_lazily() {
        let (_engine, mut request) = letter_request();
        assert!(request.image().unwrap().is_none());
        request.draw_page(Rect::new(0.0, 0.0, 5.0, 4.0)).unwrap();
        let image = request.image().unwrap().unwrap();
        assert_eq!((image.width(), image.height()), (5, 4));
        let rgb = image.to_rgb8();
        assert_eq!(rgb.get_pixel(2, 2).0, [0x40, 0x28, 0x20]);

        request.set_color(ColorMode::Argb);
        assert!(request.image().unwrap().is_none());
        request.draw_page(Rect::new(0.0, 0.0, 5.0, 4.0)).unwrap();
        let image = request.image().unwrap().unwrap();
        assert_eq!(image.to_rgba8().get_pixel(0, 0).0, [0x40, 0x28, 0x20, 0xFF]);
    }

    #[test]
    fn dropping_the_request_returns_the_buffer() {
        let (engine, mut request) = letter_request();
        request.draw().unwrap();
        assert_eq!(engine.stats().outstanding(), 1);
        drop(request);
        assert_eq!(engine.stats().outstanding(), 0);
    }

    #[test]
    fn buffers_outliving_their_document_are_not_double_freed() {
        let (engine, doc) = setup(ScriptedDocument::letter(1));
        let mut request = PixelRequest::new(doc.page(1).unwrap());
        request.draw().unwrap();
        doc.close();
        assert_eq!(engine.stats().outstanding(), 0);
        drop(request);
        assert_eq!(engine.stats().releases(), 0);
    }

    #[test]
    fn display_and_native_frames_round_trip() {
        let (_engine, doc) = setup(ScriptedDocument::new(vec![ScriptedPage::new(
            Rect::new(10.0, 20.0, 210.0, 120.0),
            0,
        )]));
        let mut request = PixelRequest::new(doc.page(1).unwrap());
        request.set_zoom(2.0).unwrap();
        for rotation in [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270] {
            request.set_rotation(rotation);
            let native = Rect::new(30.0, 40.0, 70.0, 60.0);
            let display = request.to_display(native).unwrap();
            assert_eq!(request.to_native(display).unwrap(), native);
        }

        request.set_rotation(Rotation::Deg90);
        assert_eq!(
            request.display_extent().unwrap(),
            Rect::new(0.0, 0.0, 200.0, 400.0)
        );
    }

    #[test]
    fn draw_in_another_frame_converts_the_rect() {
        let (engine, doc) = setup(ScriptedDocument::letter(1));
        let page = doc.page(1).unwrap();
        let reference = PixelRequest::with(page.clone(), 2.0, Rotation::Deg0, ColorMode::Rgb).unwrap();
        let mut request = PixelRequest::new(page);
        request
            .draw_page_in(&reference, Rect::new(20.0, 40.0, 220.0, 240.0))
            .unwrap();
        let crop = engine.stats().raster_log().last().unwrap().crop;
        assert_eq!(crop, Rect::new(10.0, 20.0, 110.0, 120.0));
        assert_eq!((request.width(), request.height()), (100, 100));
    }

    #[test]
    fn clone_settings_starts_dirty() {
        let (_engine, mut request) = letter_request();
        request.set_zoom(3.0).unwrap();
        request.set_color(ColorMode::Bgr);
        request.draw().unwrap();
        let copy = request.clone_settings();
        assert!(copy.is_dirty());
        assert_eq!(copy.zoom(), 3.0);
        assert_eq!(copy.color(), ColorMode::Bgr);
        assert_eq!(copy.bound_box(), Rect::ZERO);
    }
}
