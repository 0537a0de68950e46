//! MuPDF backend
//!
//! MuPDF documents are not `Send`, so each context runs an actor thread that
//! owns the document and its loaded pages. Calls are shipped to it as boxed
//! jobs over a flume channel and answered on a one-shot reply channel.
//! Page bounds from MuPDF already include the page's `/Rotate`, so the
//! inherent rotation is reported as 0. Documents are opened from their bytes
//! with the declared type as the format hint.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::Sender;
use log::{debug, warn};
use mupdf::{Colorspace, Device, Document, IRect, Matrix, Page, Pixmap, TextPageFlags};

use super::pack::{Samples, pack};
use super::{
    BufferId, LinkTarget, NativeContext, NativeEngine, OpenFault, OutlineEntry, PageInfo, PageLink,
    PageToken, RasterFault, RasterOutput, RasterParams, TextSpan,
};
use crate::geometry::{PixelBox, Rect};
use crate::types::DocumentType;

const ACTOR_THREAD_NAME: &str = "pagerast-mupdf";
const DEFAULT_ANTI_ALIAS: i32 = 8;

/// Open codes used when MuPDF refuses a document
const OPEN_FAILED: i32 = -1;
const OPEN_NO_PAGES: i32 = -2;

type Job = Box<dyn FnOnce(&mut Actor) + Send>;

struct Actor {
    doc: Document,
    pages: HashMap<PageToken, Page>,
    next_page: u64,
}

/// Engine backed by the MuPDF library
#[derive(Debug, Default, Clone, Copy)]
pub struct MupdfEngine;

impl MupdfEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn to_rect(r: mupdf::Rect) -> Rect {
    Rect::new(r.x0, r.y0, r.x1, r.y1).normalized()
}

fn raster_fault(e: mupdf::error::Error) -> RasterFault {
    let message = e.to_string();
    if message.contains("out of memory") || message.contains("malloc") {
        RasterFault::OutOfMemory
    } else {
        RasterFault::NoBuffer(message)
    }
}

/// Open by the declared type rather than letting MuPDF guess from the name.
fn open_document(kind: DocumentType, path: &Path, password: Option<&str>) -> Result<(Document, i32), OpenFault> {
    let bytes = std::fs::read(path).map_err(|e| {
        warn!("Could not read {path:?}: {e}");
        OpenFault::Failed(OPEN_FAILED)
    })?;
    let mut doc = Document::from_bytes(&bytes, kind.extension()).map_err(|e| {
        warn!("MuPDF could not open {path:?} as {kind:?}: {e}");
        OpenFault::Failed(OPEN_FAILED)
    })?;
    if doc.needs_password().map_err(|_| OpenFault::Failed(OPEN_FAILED))? {
        let accepted = match password {
            Some(password) => doc
                .authenticate(password)
                .map_err(|_| OpenFault::Failed(OPEN_FAILED))?,
            None => false,
        };
        if !accepted {
            return Err(OpenFault::AuthenticationRequired);
        }
    }
    let page_count = doc
        .page_count()
        .map_err(|_| OpenFault::Failed(OPEN_NO_PAGES))?;
    Ok((doc, page_count))
}

impl NativeEngine for MupdfEngine {
    fn open(
        &self,
        kind: DocumentType,
        path: &Path,
        password: Option<&str>,
        max_store_bytes: usize,
    ) -> Result<Box<dyn NativeContext>, OpenFault> {
        let (jobs_tx, jobs_rx) = flume::unbounded::<Job>();
        let (open_tx, open_rx) = flume::bounded(1);
        let path = path.to_path_buf();
        let password = password.map(str::to_owned);

        let handle = thread::Builder::new()
            .name(ACTOR_THREAD_NAME.to_string())
            .spawn(move || {
                let doc = match open_document(kind, &path, password.as_deref()) {
                    Ok((doc, page_count)) => {
                        let _ = open_tx.send(Ok(page_count));
                        doc
                    }
                    Err(fault) => {
                        let _ = open_tx.send(Err(fault));
                        return;
                    }
                };
                let mut actor = Actor {
                    doc,
                    pages: HashMap::new(),
                    next_page: 1,
                };
                for job in jobs_rx {
                    job(&mut actor);
                }
                debug!("MuPDF actor for {path:?} stopped");
            })
            .map_err(|_| OpenFault::Failed(OPEN_FAILED))?;

        let page_count = match open_rx.recv() {
            Ok(Ok(count)) => count,
            Ok(Err(fault)) => {
                let _ = handle.join();
                return Err(fault);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(OpenFault::Failed(OPEN_FAILED));
            }
        };
        // MuPDF keeps one global store; the budget is advisory here.
        debug!("Opened {kind:?} with MuPDF, {page_count} pages, store budget {max_store_bytes} bytes");

        Ok(Box::new(MupdfContext {
            jobs: Some(jobs_tx),
            actor: Some(handle),
            page_count,
            anti_alias: DEFAULT_ANTI_ALIAS,
            next_buffer: 1,
            buffers: HashSet::new(),
        }))
    }
}

struct MupdfContext {
    jobs: Option<Sender<Job>>,
    actor: Option<JoinHandle<()>>,
    page_count: i32,
    anti_alias: i32,
    next_buffer: u64,
    buffers: HashSet<BufferId>,
}

impl MupdfContext {
    /// Run `f` on the actor thread and wait for its answer
    fn call<T: Send + 'static>(&self, f: impl FnOnce(&mut Actor) -> T + Send + 'static) -> Option<T> {
        let jobs = self.jobs.as_ref()?;
        let (reply_tx, reply_rx) = flume::bounded(1);
        jobs.send(Box::new(move |actor: &mut Actor| {
            let _ = reply_tx.send(f(actor));
        }))
        .ok()?;
        reply_rx.recv().ok()
    }
}

impl NativeContext for MupdfContext {
    fn page_count(&mut self) -> i32 {
        self.page_count
    }

    fn anti_alias_level(&mut self) -> i32 {
        self.anti_alias
    }

    /// Recorded only; the binding has no per-context anti-alias setter.
    fn set_anti_alias_level(&mut self, level: i32) {
        self.anti_alias = level;
    }

    fn new_page(&mut self, page_number: usize) -> Option<PageToken> {
        let index = i32::try_from(page_number.checked_sub(1)?).ok()?;
        self.call(move |actor| {
            let page = actor.doc.load_page(index).ok()?;
            let token = PageToken(actor.next_page);
            actor.next_page += 1;
            actor.pages.insert(token, page);
            Some(token)
        })
        .flatten()
    }

    fn free_page(&mut self, page: PageToken) {
        self.call(move |actor| {
            actor.pages.remove(&page);
        });
    }

    fn page_info(&mut self, page: PageToken) -> Option<PageInfo> {
        self.call(move |actor| {
            let bounds = actor.pages.get(&page)?.bounds().ok()?;
            Some(PageInfo {
                bbox: to_rect(bounds),
                rotation: 0,
            })
        })
        .flatten()
    }

    fn page_text(&mut self, page: PageToken, region: Rect) -> Vec<TextSpan> {
        self.call(move |actor| {
            let Some(page) = actor.pages.get(&page) else {
                return Vec::new();
            };
            let Ok(text_page) = page.to_text_page(TextPageFlags::empty()) else {
                return Vec::new();
            };
            let mut spans = Vec::new();
            for block in text_page.blocks() {
                for line in block.lines() {
                    let rect = to_rect(line.bounds());
                    if !region.is_zero() && !rect.intersects(&region) {
                        continue;
                    }
                    let text: String = line.chars().filter_map(|ch| ch.char()).collect();
                    if text.is_empty() {
                        continue;
                    }
                    spans.push(TextSpan {
                        rect,
                        end_of_line: true,
                        text,
                    });
                }
            }
            spans
        })
        .unwrap_or_default()
    }

    fn page_links(&mut self, page: PageToken) -> Vec<PageLink> {
        self.call(move |actor| {
            let Some(page) = actor.pages.get(&page) else {
                return Vec::new();
            };
            let Ok(links) = page.links() else {
                return Vec::new();
            };
            links
                .filter_map(|link| {
                    let target = if let Some(dest) = link.dest {
                        LinkTarget::Page(u32::try_from(dest.loc.page_number).ok()? + 1)
                    } else if link.uri.is_empty() {
                        return None;
                    } else if link.uri.starts_with("file:") {
                        LinkTarget::Launch(link.uri.clone())
                    } else if link.uri.starts_with('#') {
                        LinkTarget::Named(link.uri.trim_start_matches('#').to_string())
                    } else {
                        LinkTarget::Uri(link.uri.clone())
                    };
                    Some(PageLink {
                        rect: to_rect(link.bounds),
                        target,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
    }

    fn outline(&mut self) -> Vec<OutlineEntry> {
        self.call(|actor| {
            let mut entries = Vec::new();
            if let Ok(outlines) = actor.doc.outlines() {
                flatten_outlines(&outlines, 0, &mut entries);
            }
            entries
        })
        .unwrap_or_default()
    }

    fn rasterize(
        &mut self,
        page: PageToken,
        params: &RasterParams,
    ) -> Result<RasterOutput, RasterFault> {
        let params = *params;
        let (packed, width, height) = self
            .call(move |actor| render(actor, page, &params))
            .ok_or_else(|| RasterFault::NoBuffer("MuPDF actor is gone".into()))??;

        let buffer = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(buffer);
        Ok(RasterOutput {
            buffer,
            samples: Arc::from(packed),
            bbox: PixelBox::new(0, 0, width as i32, height as i32),
        })
    }

    fn release_buffer(&mut self, _page: PageToken, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }

    fn close(&mut self) {
        self.buffers.clear();
        // Dropping the sender ends the actor loop.
        self.jobs = None;
        if let Some(actor) = self.actor.take() {
            if actor.join().is_err() {
                warn!("MuPDF actor panicked");
            }
        }
    }
}

impl Drop for MupdfContext {
    fn drop(&mut self) {
        self.close();
    }
}

fn flatten_outlines(outlines: &[mupdf::Outline], level: usize, entries: &mut Vec<OutlineEntry>) {
    for outline in outlines {
        let title = outline.title.trim();
        if !title.is_empty() {
            entries.push(OutlineEntry {
                level,
                title: title.to_string(),
                page: outline
                    .dest
                    .and_then(|dest| u32::try_from(dest.loc.page_number).ok())
                    .map(|page| page + 1),
            });
        }
        if !outline.down.is_empty() {
            flatten_outlines(&outline.down, level + 1, entries);
        }
    }
}

/// Pixel box of the crop (whole page when zero) under `ctm`
fn display_box(bounds: Rect, crop: Rect, ctm: &Matrix) -> IRect {
    let area = if crop.is_zero() { bounds } else { crop.intersect(&bounds) };
    let r = mupdf::Rect::new(area.x0, area.y0, area.x1, area.y1).transform(ctm);
    let b = Rect::new(r.x0, r.y0, r.x1, r.y1).round_out();
    IRect::new(b.x0, b.y0, b.x1, b.y1)
}

/// Rasterize on the actor thread. Only the crop is drawn: the pixmap covers
/// the crop's display box and the page is run through a draw device onto it.
fn render(actor: &mut Actor, token: PageToken, params: &RasterParams) -> Result<(Vec<u8>, u32, u32), RasterFault> {
    let page = actor
        .pages
        .get(&token)
        .ok_or_else(|| RasterFault::NoBuffer("unknown page".into()))?;
    let bounds = to_rect(page.bounds().map_err(raster_fault)?);

    let mut transform = Matrix::new_scale(params.zoom, params.zoom);
    transform.concat(Matrix::new_rotate(params.rotation as f32));
    let area = display_box(bounds, params.crop, &transform);
    if area.x1 <= area.x0 || area.y1 <= area.y0 {
        return Err(RasterFault::NoBuffer("crop lies outside the page".into()));
    }

    let alpha = params.color.has_alpha();
    let mut pixmap = Pixmap::new_with_rect(&Colorspace::device_rgb(), area, alpha).map_err(raster_fault)?;
    if alpha {
        pixmap.clear().map_err(raster_fault)?;
    } else {
        pixmap.clear_with(255).map_err(raster_fault)?;
    }
    {
        let device = Device::from_pixmap(&pixmap).map_err(raster_fault)?;
        page.run(&device, &transform).map_err(raster_fault)?;
    }

    let (width, height) = (pixmap.width() as usize, pixmap.height() as usize);
    let packed = pack(
        &Samples {
            data: pixmap.samples(),
            width,
            height,
            stride: pixmap.stride() as usize,
            channels: pixmap.n() as usize,
            alpha,
        },
        params.color,
        params.gamma,
    )?;
    Ok((packed, width as u32, height as u32))
}
