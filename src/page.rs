//! Page handle bound to one document context
//!
//! A page holds its own mutex for page-local state and takes the document
//! mutex for each native call, always in that order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::document::Document;
use crate::engine::{NativeContext, PageLink, PageToken, RasterFault, RasterParams, TextSpan};
use crate::error::{RenderError, Result};
use crate::geometry::{Rect, normalize_degrees};
use crate::lease::BufferLease;
use crate::pixels::PixelRequest;

struct PageState {
    token: Option<PageToken>,
    links: Option<Arc<[PageLink]>>,
}

struct PageInner {
    doc: Document,
    number: usize,
    bbox: Rect,
    rotation: i32,
    state: Mutex<PageState>,
}

impl Drop for PageInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = state.token.take() {
            self.doc.shared().with_context(|ctx| ctx.free_page(token));
        }
    }
}

/// One page of an open document. Clones share the native page.
#[derive(Clone)]
pub struct Page {
    inner: Arc<PageInner>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("document", &self.inner.doc.id())
            .field("number", &self.inner.number)
            .field("bbox", &self.inner.bbox)
            .field("rotation", &self.inner.rotation)
            .finish()
    }
}

impl Page {
    pub(crate) fn open(doc: Document, number: usize) -> Result<Self> {
        if !doc.is_open() {
            return Err(RenderError::disposed("document"));
        }
        if number == 0 || number > doc.page_count() {
            return Err(RenderError::PageCreationFailed { page: number });
        }

        let opened = doc
            .shared()
            .with_context(|ctx| {
                let token = ctx.new_page(number)?;
                match ctx.page_info(token) {
                    Some(info) => Some((token, info)),
                    None => {
                        ctx.free_page(token);
                        None
                    }
                }
            })
            .ok_or_else(|| RenderError::disposed("document"))?;
        let (token, info) = opened.ok_or(RenderError::PageCreationFailed { page: number })?;

        let rotation = normalize_degrees(info.rotation).unwrap_or_else(|_| {
            warn!(
                "Page {number} declares rotation {}, treating as 0",
                info.rotation
            );
            0
        });
        debug!("Opened page {number} of {:?}: {:?}", doc.id(), info.bbox);

        Ok(Self {
            inner: Arc::new(PageInner {
                doc,
                number,
                bbox: info.bbox,
                rotation,
                state: Mutex::new(PageState {
                    token: Some(token),
                    links: None,
                }),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PageState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the page token under both the page and document locks.
    fn with_native<T>(&self, f: impl FnOnce(&mut dyn NativeContext, PageToken) -> T) -> Result<T> {
        let state = self.lock();
        let token = state.token.ok_or_else(|| RenderError::disposed("page"))?;
        self.inner
            .doc
            .shared()
            .with_context(|ctx| f(ctx, token))
            .ok_or_else(|| RenderError::disposed("document"))
    }

    /// 1-based page number
    #[must_use]
    pub fn number(&self) -> usize {
        self.inner.number
    }

    /// Untransformed page box as reported at creation
    #[must_use]
    pub fn bound_box(&self) -> Rect {
        self.inner.bbox
    }

    /// Rotation declared by the document, in [0, 360)
    #[must_use]
    pub fn rotation(&self) -> i32 {
        self.inner.rotation
    }

    #[must_use]
    pub fn document(&self) -> &Document {
        &self.inner.doc
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.lock().token.is_none() || !self.inner.doc.is_open()
    }

    /// Free the native page. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.lock();
        let Some(token) = state.token.take() else {
            return;
        };
        state.links = None;
        self.inner
            .doc
            .shared()
            .with_context(|ctx| ctx.free_page(token));
        debug!("Disposed page {} of {:?}", self.inner.number, self.inner.doc.id());
    }

    /// Text spans intersecting `region` (zero-rotation frame, zoom 1; all-zero
    /// means the whole page). Control characters come back as `'?'`.
    pub fn text_spans(&self, region: Rect) -> Result<Vec<TextSpan>> {
        let mut spans = self.with_native(|ctx, token| ctx.page_text(token, region))?;
        for span in &mut spans {
            if span.text.chars().any(char::is_control) {
                span.text = span
                    .text
                    .chars()
                    .map(|c| if (c as u32) < 0x20 { '?' } else { c })
                    .collect();
            }
        }
        Ok(spans)
    }

    /// Plain text of `region`, spans joined on their line breaks
    pub fn text(&self, region: Rect) -> Result<String> {
        Ok(assemble_text(&self.text_spans(region)?))
    }

    /// Plain text of `region` given in `pixels`' display frame
    pub fn text_in(&self, pixels: &PixelRequest, region: Rect) -> Result<String> {
        self.text(pixels.to_native(region)?)
    }

    /// Hyperlinks, fetched once and memoized. A page without links yields a
    /// single sentinel entry.
    pub fn links(&self) -> Result<Arc<[PageLink]>> {
        let mut state = self.lock();
        let token = state.token.ok_or_else(|| RenderError::disposed("page"))?;
        if let Some(links) = &state.links {
            return Ok(links.clone());
        }

        let fetched = if self.inner.doc.kind().supports_links() {
            self.inner
                .doc
                .shared()
                .with_context(|ctx| ctx.page_links(token))
                .ok_or_else(|| RenderError::disposed("document"))?
        } else {
            Vec::new()
        };

        let links: Arc<[PageLink]> = if fetched.is_empty() {
            Arc::from([PageLink::sentinel()])
        } else {
            Arc::from(fetched)
        };
        state.links = Some(links.clone());
        Ok(links)
    }

    /// Links mapped into `pixels`' zoomed, rotated display frame
    pub fn links_for(&self, pixels: &PixelRequest) -> Result<Vec<PageLink>> {
        self.links()?
            .iter()
            .map(|link| {
                if link.is_sentinel() {
                    return Ok(link.clone());
                }
                Ok(PageLink {
                    rect: pixels.to_display(link.rect)?,
                    target: link.target.clone(),
                })
            })
            .collect()
    }

    /// Issue one native rasterization and wrap the engine buffer
    pub(crate) fn rasterize(&self, params: &RasterParams) -> Result<BufferLease> {
        let state = self.lock();
        let token = state.token.ok_or_else(|| RenderError::disposed("page"))?;
        debug!(
            "Rasterizing page {} zoom={} rotation={} color={:?} crop={:?}",
            self.inner.number, params.zoom, params.rotation, params.color, params.crop
        );
        let shared = self.inner.doc.shared();
        let output = shared
            .with_context(|ctx| ctx.rasterize(token, params))
            .ok_or_else(|| RenderError::disposed("document"))?
            .map_err(|fault| match fault {
                RasterFault::OutOfMemory => RenderError::OutOfMemory,
                RasterFault::NoBuffer(detail) => RenderError::RenderFailed { detail },
            })?;
        drop(state);
        Ok(BufferLease::new(shared.clone(), token, output))
    }

    pub(crate) fn reclaim_memory(&self) {
        self.inner.doc.shared().reclaim_memory();
    }
}

/// Join spans into text. Separators are only added after a span that ends
/// its line: a newline after the last span or before a span on another
/// baseline, a space before a span on the same baseline that sits more than
/// one unit further right.
fn assemble_text(spans: &[TextSpan]) -> String {
    let mut text = String::new();
    for (i, span) in spans.iter().enumerate() {
        text.push_str(&span.text);
        if !span.end_of_line {
            continue;
        }
        match spans.get(i + 1) {
            None => text.push('\n'),
            Some(next) if next.rect.y0 == span.rect.y0 => {
                if next.rect.x1 - span.rect.x1 > 1.0 {
                    text.push(' ');
                }
            }
            Some(_) => text.push('\n'),
        }
    }
    text
}
