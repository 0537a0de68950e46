//! Page renderer - Idle/Rendering/Rendered state machine with one worker
//!
//! A renderer owns one [`PixelRequest`] and a cropping area. `render(true)`
//! runs on the calling thread; `render(false)` queues the job on a worker
//! thread that is started on first use and reused afterwards, so at most one
//! worker exists per renderer at a time. Configuration is frozen while a
//! render is in flight: setters called then are ignored. `dispose` frees the
//! worker and every buffer and leaves the renderer Idle and reusable.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use image::DynamicImage;
use log::{debug, error, warn};

use crate::error::{RenderError, Result};
use crate::geometry::{Rect, Rotation};
use crate::page::Page;
use crate::pixels::PixelRequest;
use crate::settings::settings;
use crate::types::ColorMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderPhase {
    Idle,
    Rendering,
    Rendered,
}

/// Result of one render, passed to the listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered { width: u32, height: u32 },
    OutOfMemory,
    Failed(String),
}

type Listener = Arc<dyn Fn(&RenderOutcome) + Send + Sync>;

/// Snapshot of a renderer's configuration, readable while a render runs
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderConfig {
    pub zoom: f32,
    pub rotation: Rotation,
    pub color: ColorMode,
    pub gamma: f32,
    pub crop: Rect,
}

struct RendererState {
    phase: RenderPhase,
    /// Checked out by the rendering thread while `phase == Rendering`
    pixels: Option<PixelRequest>,
    page: Page,
    config: RenderConfig,
    /// Jobs sent to the worker and not yet picked up
    queued: usize,
    last_outcome: Option<RenderOutcome>,
}

impl RendererState {
    fn refresh_config(&mut self) {
        if let Some(pixels) = &self.pixels {
            self.config = RenderConfig {
                zoom: pixels.zoom(),
                rotation: pixels.requested_rotation(),
                color: pixels.color(),
                gamma: pixels.gamma(),
                crop: self.config.crop,
            };
        }
    }
}

struct Shared {
    state: Mutex<RendererState>,
    settled: Condvar,
    listener: Mutex<Option<Listener>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RendererState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum WorkerMessage {
    Render,
    Shutdown,
}

struct Worker {
    tx: Sender<WorkerMessage>,
    handle: JoinHandle<()>,
}

pub struct PageRenderer {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    workers_spawned: AtomicUsize,
}

impl std::fmt::Debug for PageRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("PageRenderer")
            .field("page", &state.page.number())
            .field("phase", &state.phase)
            .field("config", &state.config)
            .finish_non_exhaustive()
    }
}

impl PageRenderer {
    /// Renderer for the whole of `page` at zoom 1, no rotation, RGB
    #[must_use]
    pub fn new(page: Page) -> Self {
        Self::from_request(PixelRequest::new(page))
    }

    pub fn with_settings(page: Page, zoom: f32, rotation: Rotation, color: ColorMode) -> Result<Self> {
        Ok(Self::from_request(PixelRequest::with(page, zoom, rotation, color)?))
    }

    fn from_request(pixels: PixelRequest) -> Self {
        let page = pixels.page().clone();
        let mut state = RendererState {
            phase: RenderPhase::Idle,
            config: RenderConfig {
                zoom: 1.0,
                rotation: Rotation::Deg0,
                color: ColorMode::Rgb,
                gamma: 1.0,
                crop: page.bound_box(),
            },
            pixels: Some(pixels),
            page,
            queued: 0,
            last_outcome: None,
        };
        state.refresh_config();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                settled: Condvar::new(),
                listener: Mutex::new(None),
            }),
            worker: Mutex::new(None),
            workers_spawned: AtomicUsize::new(0),
        }
    }

    /// Apply `change` unless rendering; back to Idle if it changed anything.
    fn update(
        &self,
        what: &str,
        change: impl FnOnce(&mut PixelRequest, &mut Rect) -> Result<bool>,
    ) -> Result<bool> {
        let mut state = self.shared.lock();
        if state.phase == RenderPhase::Rendering {
            debug!("Ignoring {what} change while rendering");
            return Ok(false);
        }
        let RendererState { pixels, config, .. } = &mut *state;
        let Some(pixels) = pixels.as_mut() else {
            return Ok(false);
        };
        let changed = change(pixels, &mut config.crop)?;
        if changed {
            state.phase = RenderPhase::Idle;
            state.refresh_config();
        }
        Ok(changed)
    }

    pub fn set_zoom(&self, zoom: f32) -> Result<bool> {
        self.update("zoom", |pixels, _| pixels.set_zoom(zoom))
    }

    pub fn set_rotation(&self, rotation: Rotation) -> Result<bool> {
        self.update("rotation", |pixels, _| Ok(pixels.set_rotation(rotation)))
    }

    pub fn set_color(&self, color: ColorMode) -> Result<bool> {
        self.update("color", |pixels, _| Ok(pixels.set_color(color)))
    }

    pub fn set_gamma(&self, gamma: f32) -> Result<bool> {
        self.update("gamma", |pixels, _| Ok(pixels.set_gamma(gamma)))
    }

    pub fn set_anti_alias_level(&self, level: i32) -> Result<bool> {
        self.update("anti-alias", |pixels, _| {
            Ok(pixels.set_anti_alias_level(level))
        })
    }

    /// Region to render in the native frame; all-zero resets to the page box
    pub fn set_cropping_area(&self, area: Rect) -> Result<bool> {
        self.update("cropping area", |pixels, crop| {
            let area = if area.is_zero() {
                pixels.page().bound_box()
            } else {
                area.normalized()
            };
            if area == *crop {
                return Ok(false);
            }
            *crop = area;
            pixels.mark_dirty();
            Ok(true)
        })
    }

    /// Rebind to another page, keeping zoom, rotation, color and gamma
    pub fn set_page(&self, page: Page) -> Result<bool> {
        let mut state = self.shared.lock();
        if state.phase == RenderPhase::Rendering {
            debug!("Ignoring page change while rendering");
            return Ok(false);
        }
        let Some(old) = state.pixels.take() else {
            return Ok(false);
        };
        state.pixels = Some(old.rebind(page.clone()));
        state.config.crop = page.bound_box();
        state.page = page;
        state.phase = RenderPhase::Idle;
        Ok(true)
    }

    /// Force the next render to run even if nothing changed
    pub fn needs_rendering(&self) -> Result<bool> {
        self.update("render state", |pixels, _| {
            pixels.mark_dirty();
            Ok(true)
        })
    }

    pub fn set_listener(&self, listener: impl Fn(&RenderOutcome) + Send + Sync + 'static) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    #[must_use]
    pub fn phase(&self) -> RenderPhase {
        self.shared.lock().phase
    }

    #[must_use]
    pub fn is_rendering(&self) -> bool {
        self.phase() == RenderPhase::Rendering
    }

    #[must_use]
    pub fn is_rendered(&self) -> bool {
        self.phase() == RenderPhase::Rendered
    }

    #[must_use]
    pub fn config(&self) -> RenderConfig {
        self.shared.lock().config
    }

    #[must_use]
    pub fn page(&self) -> Page {
        self.shared.lock().page.clone()
    }

    #[must_use]
    pub fn last_outcome(&self) -> Option<RenderOutcome> {
        self.shared.lock().last_outcome.clone()
    }

    /// Number of worker threads this renderer ever started; one per
    /// lifetime between disposals
    #[must_use]
    pub fn workers_spawned(&self) -> usize {
        self.workers_spawned.load(Ordering::Relaxed)
    }

    /// Render now on this thread (`wait`), or hand the job to the worker.
    ///
    /// Does nothing if already rendering or rendered.
    pub fn render(&self, wait: bool) -> Result<()> {
        if wait {
            run_render(&self.shared, false);
            return Ok(());
        }

        let tx = self.ensure_worker()?;
        self.shared.lock().queued += 1;
        if tx.send(WorkerMessage::Render).is_err() {
            warn!("Render worker is gone, rendering inline");
            run_render(&self.shared, true);
        }
        Ok(())
    }

    fn ensure_worker(&self) -> Result<Sender<WorkerMessage>> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.as_ref() {
            if !worker.handle.is_finished() {
                return Ok(worker.tx.clone());
            }
        }
        if let Some(stale) = slot.take() {
            let _ = stale.handle.join();
        }

        let (tx, rx) = flume::unbounded();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(settings().worker_thread_name.clone())
            .spawn(move || render_worker(&shared, rx))?;
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Worker {
            tx: tx.clone(),
            handle,
        });
        Ok(tx)
    }

    /// Block until no render is queued or running, or `timeout` elapses.
    /// Returns the phase at that point.
    pub fn wait_settled(&self, timeout: Duration) -> RenderPhase {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.queued > 0 || state.phase == RenderPhase::Rendering {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .shared
                .settled
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.phase
    }

    /// Rendered image; `None` unless the phase is Rendered
    pub fn image(&self) -> Result<Option<DynamicImage>> {
        self.with_result(|pixels| Ok(pixels.image()?.cloned()))
            .map(Option::flatten)
    }

    /// Run `f` on the rendered pixels; `None` unless the phase is Rendered.
    ///
    /// If `f` fails the result is discarded and the renderer is back to Idle,
    /// so the next `render` starts over.
    pub fn with_result<T>(&self, f: impl FnOnce(&mut PixelRequest) -> Result<T>) -> Result<Option<T>> {
        let mut state = self.shared.lock();
        if state.phase != RenderPhase::Rendered {
            return Ok(None);
        }
        let Some(pixels) = state.pixels.as_mut() else {
            return Ok(None);
        };
        match f(pixels) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Rendered page {} could not be read back: {e}", pixels.page().number());
                pixels.mark_dirty();
                state.phase = RenderPhase::Idle;
                state.last_outcome = Some(match &e {
                    RenderError::OutOfMemory => RenderOutcome::OutOfMemory,
                    other => RenderOutcome::Failed(other.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Stop the worker, wait out a render in flight and release every
    /// buffer. The renderer is left Idle with its settings and page, and a
    /// later `render` starts over. Idempotent.
    pub fn dispose(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.tx.send(WorkerMessage::Shutdown);
            if worker.handle.thread().id() == thread::current().id() {
                debug!("Renderer disposed from its own worker, not joining");
            } else if worker.handle.join().is_err() {
                error!("Render worker panicked during shutdown");
            }
        }

        let mut state = self.shared.lock();
        while state.phase == RenderPhase::Rendering {
            state = self
                .shared
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if let Some(pixels) = state.pixels.as_mut() {
            pixels.release();
        }
        state.queued = 0;
        state.phase = RenderPhase::Idle;
        drop(state);
        self.shared.settled.notify_all();
        debug!("Renderer disposed");
    }
}

impl Drop for PageRenderer {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn render_worker(shared: &Shared, requests: Receiver<WorkerMessage>) {
    debug!("Render worker started");
    for message in requests {
        match message {
            WorkerMessage::Render => {
                run_render(shared, true);
            }
            WorkerMessage::Shutdown => break,
        }
    }
    debug!("Render worker stopped");
}

/// One Idle -> Rendering -> Rendered/Idle transition. Returns `None` when
/// there was nothing to do.
fn run_render(shared: &Shared, queued: bool) -> Option<RenderOutcome> {
    let (mut pixels, crop) = {
        let mut state = shared.lock();
        if queued {
            state.queued = state.queued.saturating_sub(1);
        }
        if state.phase != RenderPhase::Idle {
            drop(state);
            shared.settled.notify_all();
            return None;
        }
        let Some(pixels) = state.pixels.take() else {
            drop(state);
            shared.settled.notify_all();
            return None;
        };
        state.phase = RenderPhase::Rendering;
        (pixels, state.config.crop)
    };

    let outcome = match catch_unwind(AssertUnwindSafe(|| pixels.draw_page(crop))) {
        Ok(Ok(_)) => RenderOutcome::Rendered {
            width: pixels.width(),
            height: pixels.height(),
        },
        Ok(Err(RenderError::OutOfMemory)) => {
            warn!("Out of memory rendering page {}, releasing buffers", pixels.page().number());
            pixels.release();
            RenderOutcome::OutOfMemory
        }
        Ok(Err(e)) => {
            warn!("Rendering page {} failed: {e}", pixels.page().number());
            RenderOutcome::Failed(e.to_string())
        }
        Err(_) => {
            error!("Rendering page {} panicked", pixels.page().number());
            pixels.release();
            RenderOutcome::Failed("render panicked".into())
        }
    };

    {
        let mut state = shared.lock();
        state.last_outcome = Some(outcome.clone());
        state.phase = match outcome {
            RenderOutcome::Rendered { .. } => RenderPhase::Rendered,
            _ => RenderPhase::Idle,
        };
        state.pixels = Some(pixels);
    }
    shared.settled.notify_all();

    let listener = shared
        .listener
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(listener) = listener {
        listener(&outcome);
    }
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::document::Document;
    use crate::test_utils::{ScriptedDocument, ScriptedEngine};
    use crate::types::DocumentType;

    const SETTLE: Duration = Duration::from_secs(5);

    fn renderer(doc: ScriptedDocument) -> (Arc<ScriptedEngine>, Document, PageRenderer) {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(doc);
        let document = Document::open(engine.clone(), b"r".to_vec(), None, DocumentType::Pdf, 0).unwrap();
        let renderer = PageRenderer::new(document.page(1).unwrap());
        (engine, document, renderer)
    }

    fn wait_until(check: impl Fn() -> bool) {
        let deadline = Instant::now() + SETTLE;
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn synchronous_render_reaches_rendered() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert_eq!(renderer.config().crop, Rect::new(0.0, 0.0, 612.0, 792.0));

        renderer.render(true).unwrap();
        assert!(renderer.is_rendered());
        assert_eq!(
            renderer.last_outcome(),
            Some(RenderOutcome::Rendered {
                width: 612,
                height: 792
            })
        );
        let image = renderer.image().unwrap().unwrap();
        assert_eq!((image.width(), image.height()), (612, 792));

        renderer.render(true).unwrap();
        assert_eq!(engine.stats().rasterize_calls(), 1);
        assert_eq!(renderer.workers_spawned(), 0);
    }

    #[test]
    fn changes_return_to_idle_and_rerender() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        renderer.render(true).unwrap();
        assert!(!renderer.set_zoom(1.0).unwrap());
        assert!(renderer.is_rendered());

        assert!(renderer.set_zoom(0.5).unwrap());
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert!(renderer.image().unwrap().is_none());
        renderer.render(true).unwrap();
        assert_eq!(engine.stats().rasterize_calls(), 2);

        assert!(renderer.needs_rendering().unwrap());
        renderer.render(true).unwrap();
        assert_eq!(engine.stats().rasterize_calls(), 3);
    }

    #[test]
    fn cropping_area_limits_the_render() {
        let (_engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        assert!(
            renderer
                .set_cropping_area(Rect::new(100.0, 100.0, 200.0, 150.0))
                .unwrap()
        );
        renderer.render(true).unwrap();
        assert_eq!(
            renderer.last_outcome(),
            Some(RenderOutcome::Rendered {
                width: 100,
                height: 50
            })
        );
        assert!(renderer.set_cropping_area(Rect::ZERO).unwrap());
        assert_eq!(renderer.config().crop, Rect::new(0.0, 0.0, 612.0, 792.0));
    }

    #[test]
    fn asynchronous_renders_share_one_worker() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        engine.set_raster_delay(Duration::from_millis(20));
        renderer.render(false).unwrap();
        renderer.render(false).unwrap();
        assert_eq!(renderer.wait_settled(SETTLE), RenderPhase::Rendered);

        renderer.needs_rendering().unwrap();
        renderer.render(false).unwrap();
        assert_eq!(renderer.wait_settled(SETTLE), RenderPhase::Rendered);

        assert_eq!(renderer.workers_spawned(), 1);
        assert_eq!(engine.stats().rasterize_calls(), 2);
    }

    #[test]
    fn configuration_is_frozen_while_rendering() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        engine.set_raster_delay(Duration::from_millis(100));
        renderer.render(false).unwrap();
        wait_until(|| renderer.is_rendering());

        assert!(!renderer.set_zoom(2.0).unwrap());
        assert!(!renderer.set_color(ColorMode::Gray).unwrap());
        assert_eq!(renderer.config().zoom, 1.0);

        assert_eq!(renderer.wait_settled(SETTLE), RenderPhase::Rendered);
        assert!(renderer.set_zoom(2.0).unwrap());
    }

    #[test]
    fn failed_render_returns_to_idle() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        engine.fail_next_rasters(1);
        renderer.render(true).unwrap();
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert!(matches!(renderer.last_outcome(), Some(RenderOutcome::Failed(_))));

        renderer.render(true).unwrap();
        assert!(renderer.is_rendered());
    }

    #[test]
    fn out_of_memory_releases_and_reclaims() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        engine.oom_next_rasters(1);
        renderer.render(true).unwrap();
        assert_eq!(renderer.last_outcome(), Some(RenderOutcome::OutOfMemory));
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert_eq!(engine.stats().reclaims(), 1);
        assert_eq!(engine.stats().outstanding(), 0);
    }

    #[test]
    fn panicking_render_is_contained() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        engine.panic_next_raster();
        renderer.render(true).unwrap();
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert!(matches!(renderer.last_outcome(), Some(RenderOutcome::Failed(_))));

        renderer.render(true).unwrap();
        assert!(renderer.is_rendered());
    }

    #[test]
    fn listener_hears_every_outcome() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        let heard = Arc::new(Mutex::new(Vec::new()));
        let sink = heard.clone();
        renderer.set_listener(move |outcome| sink.lock().unwrap().push(outcome.clone()));

        engine.fail_next_rasters(1);
        renderer.render(false).unwrap();
        renderer.wait_settled(SETTLE);
        renderer.render(false).unwrap();
        renderer.wait_settled(SETTLE);

        let heard = heard.lock().unwrap();
        assert_eq!(heard.len(), 2);
        assert!(matches!(heard[0], RenderOutcome::Failed(_)));
        assert!(matches!(heard[1], RenderOutcome::Rendered { .. }));
    }

    #[test]
    fn set_page_keeps_settings() {
        let (_engine, doc, renderer) = renderer(ScriptedDocument::letter(3));
        renderer.set_zoom(2.0).unwrap();
        renderer.render(true).unwrap();
        assert!(renderer.set_page(doc.page(3).unwrap()).unwrap());
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert_eq!(renderer.page().number(), 3);
        assert_eq!(renderer.config().zoom, 2.0);
    }

    #[test]
    fn dispose_stops_the_worker_and_frees_buffers() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        engine.set_raster_delay(Duration::from_millis(30));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        renderer.set_listener(move |_| flag.store(true, Ordering::SeqCst));

        renderer.render(false).unwrap();
        wait_until(|| renderer.is_rendering());
        renderer.dispose();
        renderer.dispose();

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(engine.stats().outstanding(), 0);
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert!(renderer.image().unwrap().is_none());
    }

    #[test]
    fn disposed_renderer_can_be_used_again() {
        let (engine, doc, renderer) = renderer(ScriptedDocument::letter(2));
        renderer.set_zoom(0.5).unwrap();
        renderer.render(false).unwrap();
        assert_eq!(renderer.wait_settled(SETTLE), RenderPhase::Rendered);
        renderer.dispose();
        assert_eq!(renderer.config().zoom, 0.5);

        assert!(renderer.set_page(doc.page(2).unwrap()).unwrap());
        renderer.render(true).unwrap();
        assert!(renderer.is_rendered());
        assert_eq!(renderer.image().unwrap().unwrap().width(), 306);

        renderer.needs_rendering().unwrap();
        renderer.render(false).unwrap();
        assert_eq!(renderer.wait_settled(SETTLE), RenderPhase::Rendered);
        assert_eq!(renderer.workers_spawned(), 2);
        assert_eq!(engine.stats().rasterize_calls(), 3);
    }

    #[test]
    fn short_buffer_leaves_the_renderer_retryable() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        renderer
            .set_cropping_area(Rect::new(0.0, 0.0, 10.0, 10.0))
            .unwrap();
        engine.truncate_next_rasters(1);
        renderer.render(true).unwrap();
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert!(matches!(renderer.last_outcome(), Some(RenderOutcome::Failed(_))));

        renderer.render(true).unwrap();
        assert_eq!(engine.stats().rasterize_calls(), 2);
        let image = renderer.image().unwrap().unwrap();
        assert_eq!((image.width(), image.height()), (10, 10));
    }

    #[test]
    fn failed_read_back_returns_to_idle() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        renderer.render(true).unwrap();
        let read: Result<Option<()>> = renderer.with_result(|_| Err(RenderError::OutOfMemory));
        assert!(matches!(read, Err(RenderError::OutOfMemory)));
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert_eq!(renderer.last_outcome(), Some(RenderOutcome::OutOfMemory));
        assert_eq!(engine.stats().outstanding(), 0);

        renderer.render(true).unwrap();
        assert!(renderer.is_rendered());
        assert_eq!(engine.stats().rasterize_calls(), 2);
        assert!(renderer.image().unwrap().is_some());
    }

    #[test]
    fn out_of_memory_then_retry_succeeds() {
        let (engine, _doc, renderer) = renderer(ScriptedDocument::letter(1));
        engine.oom_next_rasters(1);
        renderer.render(true).unwrap();
        assert_eq!(renderer.phase(), RenderPhase::Idle);

        renderer.render(true).unwrap();
        assert!(renderer.is_rendered());
        assert!(renderer.image().unwrap().is_some());
    }

    #[test]
    fn anti_alias_change_requires_a_new_render() {
        let (engine, doc, renderer) = renderer(ScriptedDocument::letter(1));
        renderer.render(true).unwrap();
        assert!(!renderer.set_anti_alias_level(8).unwrap());
        assert!(renderer.is_rendered());

        assert!(renderer.set_anti_alias_level(4).unwrap());
        assert_eq!(renderer.phase(), RenderPhase::Idle);
        assert_eq!(doc.anti_alias_level(), 4);
        renderer.render(true).unwrap();
        assert_eq!(engine.stats().rasterize_calls(), 2);
    }
}
