//! Thread-safe page rasterization over a single-threaded native engine
//!
//! A [`Document`] owns one native context behind one mutex; [`Page`]s and
//! [`PixelRequest`]s borrow it for each native call. [`PageRenderer`] adds an
//! asynchronous state machine on top and [`TileCache`] splits large canvases
//! into independently rendered tiles.

pub mod document;
pub mod engine;
pub mod error;
pub mod geometry;
mod lease;
pub mod logging;
pub mod metrics;
pub mod outline;
pub mod page;
pub mod pixels;
pub mod renderer;
pub mod settings;
pub mod tiles;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use document::{Document, DocumentSource};
pub use engine::{LinkTarget, NativeContext, NativeEngine, PageLink, TextSpan};
pub use error::{RenderError, Result};
pub use geometry::{PixelBox, Rect, Rotation};
pub use outline::{NodeId, Outline, OutlineNode};
pub use page::Page;
pub use pixels::PixelRequest;
pub use renderer::{PageRenderer, RenderConfig, RenderOutcome, RenderPhase};
pub use settings::{Settings, VERSION, settings};
pub use tiles::{Tile, TileCache, TileKey};
pub use types::{ColorMode, DocumentId, DocumentType, PixelData};

#[cfg(feature = "mupdf")]
pub use engine::mupdf::MupdfEngine;
