//! Contract with the native rendering engine
//!
//! The engine is a single-threaded, stateful resource. One [`NativeContext`]
//! per open document; a context must never be entered by two threads at once,
//! which is why every context lives behind its document's mutex. Independent
//! contexts may run in parallel.

pub mod pack;

#[cfg(feature = "mupdf")]
pub mod mupdf;

use std::path::Path;
use std::sync::Arc;

use crate::geometry::{PixelBox, Rect};
use crate::types::{ColorMode, DocumentType};

/// Native page token, unique within one context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageToken(pub u64);

/// Engine-owned pixel buffer, unique within one context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Native open failure, mirroring the engine's negative return codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OpenFault {
    #[error("native open failed ({0})")]
    Failed(i32),

    #[error("password required")]
    AuthenticationRequired,
}

impl OpenFault {
    pub const AUTH_CODE: i32 = -3;

    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        if code == Self::AUTH_CODE {
            Self::AuthenticationRequired
        } else {
            Self::Failed(code)
        }
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Failed(code) => code,
            Self::AuthenticationRequired => Self::AUTH_CODE,
        }
    }
}

/// Rasterization failure reported by the engine
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RasterFault {
    #[error("no pixel buffer produced: {0}")]
    NoBuffer(String),

    #[error("engine ran out of memory")]
    OutOfMemory,
}

/// Geometry of one page: `[x0, y0, x1, y1, rotation]` on the wire
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageInfo {
    pub bbox: Rect,
    pub rotation: i32,
}

impl PageInfo {
    #[must_use]
    pub fn from_array(info: [f32; 5]) -> Self {
        Self {
            bbox: Rect::new(info[0], info[1], info[2], info[3]).normalized(),
            rotation: info[4] as i32,
        }
    }
}

/// Parameters of one native rasterization call
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterParams {
    pub zoom: f32,
    /// Effective rotation in degrees, one of 0/90/180/270
    pub rotation: i32,
    pub color: ColorMode,
    pub gamma: f32,
    /// Region in the zero-rotation frame at zoom 1; all-zero means the whole page
    pub crop: Rect,
}

/// Pixels produced by a rasterization call.
///
/// `samples` stays engine-owned until [`NativeContext::release_buffer`] is
/// called with `buffer`; holders copy out of it and then release.
#[derive(Clone, Debug)]
pub struct RasterOutput {
    pub buffer: BufferId,
    pub samples: Arc<[u8]>,
    /// Actual rendered box, always anchored at the origin
    pub bbox: PixelBox,
}

/// A run of text sharing one baseline
#[derive(Clone, Debug, PartialEq)]
pub struct TextSpan {
    pub rect: Rect,
    pub end_of_line: bool,
    pub text: String,
}

/// Destination of a hyperlink
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkTarget {
    /// 1-based page number
    Page(u32),
    Uri(String),
    Launch(String),
    Named(String),
    Action(String),
    /// Placeholder stored when a page has no links
    Empty,
}

impl LinkTarget {
    /// Link type code: GOTO_PAGE=0, URL=1, LAUNCH=2, NAMED=3, ACTION=4
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Page(_) | Self::Empty => 0,
            Self::Uri(_) => 1,
            Self::Launch(_) => 2,
            Self::Named(_) => 3,
            Self::Action(_) => 4,
        }
    }
}

/// Hyperlink area on a page
#[derive(Clone, Debug, PartialEq)]
pub struct PageLink {
    pub rect: Rect,
    pub target: LinkTarget,
}

impl PageLink {
    #[must_use]
    pub const fn sentinel() -> Self {
        Self {
            rect: Rect::ZERO,
            target: LinkTarget::Empty,
        }
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.target == LinkTarget::Empty && self.rect.is_zero()
    }
}

/// Outline entry in depth-first order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutlineEntry {
    /// Nesting level (0 = top level)
    pub level: usize,
    pub title: String,
    /// 1-based destination page, if the entry points inside the document
    pub page: Option<u32>,
}

/// Factory for native document contexts
pub trait NativeEngine: Send + Sync {
    /// Open `path`, returning a fresh context that owns the parsed document.
    fn open(
        &self,
        kind: DocumentType,
        path: &Path,
        password: Option<&str>,
        max_store_bytes: usize,
    ) -> Result<Box<dyn NativeContext>, OpenFault>;
}

/// One open native document. Not re-entrant; callers serialize access.
pub trait NativeContext: Send {
    fn page_count(&mut self) -> i32;

    fn anti_alias_level(&mut self) -> i32;

    fn set_anti_alias_level(&mut self, level: i32);

    /// Load 1-based `page_number`, or `None` if out of range or the engine failed.
    fn new_page(&mut self, page_number: usize) -> Option<PageToken>;

    fn free_page(&mut self, page: PageToken);

    fn page_info(&mut self, page: PageToken) -> Option<PageInfo>;

    /// Text spans intersecting `region` (zero-rotation frame, zoom 1)
    fn page_text(&mut self, page: PageToken, region: Rect) -> Vec<TextSpan>;

    fn page_links(&mut self, page: PageToken) -> Vec<PageLink>;

    fn outline(&mut self) -> Vec<OutlineEntry>;

    fn rasterize(
        &mut self,
        page: PageToken,
        params: &RasterParams,
    ) -> Result<RasterOutput, RasterFault>;

    /// Hand a buffer from [`NativeContext::rasterize`] back to the engine.
    fn release_buffer(&mut self, page: PageToken, buffer: BufferId);

    /// Drop whatever the engine caches; called after an out-of-memory render.
    fn reclaim_memory(&mut self) {}

    /// Free the context together with every page and buffer it still owns.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_codes_map_to_faults() {
        assert_eq!(OpenFault::from_code(-3), OpenFault::AuthenticationRequired);
        assert_eq!(OpenFault::from_code(-1), OpenFault::Failed(-1));
        assert_eq!(OpenFault::from_code(-2).code(), -2);
    }

    #[test]
    fn page_info_normalizes_box() {
        let info = PageInfo::from_array([612.0, 792.0, 0.0, 0.0, 90.0]);
        assert_eq!(info.bbox, Rect::new(0.0, 0.0, 612.0, 792.0));
        assert_eq!(info.rotation, 90);
    }

    #[test]
    fn sentinel_link_is_recognizable() {
        let link = PageLink::sentinel();
        assert!(link.is_sentinel());
        assert_eq!(link.target.code(), 0);
        assert!(
            !PageLink {
                rect: Rect::new(1.0, 1.0, 2.0, 2.0),
                target: LinkTarget::Uri("https://example.org".into()),
            }
            .is_sentinel()
        );
    }
}
