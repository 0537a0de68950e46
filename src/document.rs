//! Document handle: one native context behind one mutex
//!
//! Every call that touches the native context goes through
//! [`DocumentShared::with_context`], so calls against one handle run one at a
//! time while distinct handles, even on the same file, never block each
//! other. Parallel work over a single file therefore opens several handles,
//! see [`Document::duplicate`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tempfile::TempPath;

use crate::engine::{BufferId, NativeContext, NativeEngine, OpenFault, PageToken};
use crate::error::{RenderError, Result};
use crate::metrics;
use crate::outline::Outline;
use crate::page::Page;
use crate::settings::{MAX_ANTI_ALIAS_LEVEL, settings};
use crate::types::{DocumentId, DocumentType};

static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Where a document is read from
#[derive(Clone, Debug)]
pub enum DocumentSource {
    Path(PathBuf),
    /// In-memory bytes, written to a temporary file that lives until close
    Bytes(Vec<u8>),
}

impl From<PathBuf> for DocumentSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for DocumentSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for DocumentSource {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<Vec<u8>> for DocumentSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// Native state guarded by the document mutex
struct NativeSlot {
    context: Option<Box<dyn NativeContext>>,
    anti_alias: i32,
    outline: Option<Arc<Outline>>,
    temp: Option<TempPath>,
}

pub(crate) struct DocumentShared {
    id: DocumentId,
    kind: DocumentType,
    engine: Arc<dyn NativeEngine>,
    path: PathBuf,
    from_bytes: bool,
    password: Option<String>,
    max_store: usize,
    page_count: usize,
    open: AtomicBool,
    native: Mutex<NativeSlot>,
}

impl DocumentShared {
    fn lock(&self) -> MutexGuard<'_, NativeSlot> {
        self.native.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the native context; `None` once the document is closed.
    pub(crate) fn with_context<T>(&self, f: impl FnOnce(&mut dyn NativeContext) -> T) -> Option<T> {
        let mut slot = self.lock();
        let context = slot.context.as_deref_mut()?;
        Some(f(context))
    }

    pub(crate) fn release_buffer(&self, page: PageToken, buffer: BufferId) {
        if self
            .with_context(|ctx| ctx.release_buffer(page, buffer))
            .is_some()
        {
            metrics::record_release();
        } else {
            // The context freed every buffer it owned when it closed.
            metrics::record_orphaned();
        }
    }

    pub(crate) fn reclaim_memory(&self) {
        self.with_context(|ctx| ctx.reclaim_memory());
    }

    pub(crate) fn id(&self) -> DocumentId {
        self.id
    }

    pub(crate) fn kind(&self) -> DocumentType {
        self.kind
    }

    pub(crate) fn page_count(&self) -> usize {
        if self.open.load(Ordering::Acquire) {
            self.page_count
        } else {
            0
        }
    }

    fn close(&self) {
        let mut slot = self.lock();
        let Some(mut context) = slot.context.take() else {
            return;
        };
        self.open.store(false, Ordering::Release);
        context.close();
        slot.outline = None;
        if let Some(temp) = slot.temp.take() {
            let path = temp.to_path_buf();
            if let Err(e) = temp.close() {
                warn!("Failed to remove temporary file {path:?}: {e}");
            }
        }
        info!("Closed document {:?} ({:?})", self.id, self.path);
    }
}

impl Drop for DocumentShared {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to one open document.
///
/// Clones share the same native context and identity.
#[derive(Clone)]
pub struct Document {
    shared: Arc<DocumentShared>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("path", &self.shared.path)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Native store budget in bytes for a megabyte count; `<= 0` picks the default
#[must_use]
pub fn max_store_bytes(max_store_mb: i32) -> usize {
    let mb = if max_store_mb <= 0 {
        settings().max_store_mb as usize
    } else {
        max_store_mb as usize
    };
    mb << 20
}

/// Spill in-memory bytes to a temporary file named after the document type,
/// so openers that sniff by extension see the declared format.
fn materialize(bytes: &[u8], kind: DocumentType) -> Result<TempPath> {
    let suffix = format!(".{}", kind.extension());
    let mut file = tempfile::Builder::new()
        .prefix(&settings().temp_prefix)
        .suffix(&suffix)
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

impl Document {
    /// Open a document through `engine`.
    ///
    /// Fails with `NotFound` when a path source does not exist,
    /// `AuthenticationRequired` when the password is missing or wrong, and
    /// `OpenFailed` for any other native failure.
    pub fn open(
        engine: Arc<dyn NativeEngine>,
        source: impl Into<DocumentSource>,
        password: Option<&str>,
        kind: DocumentType,
        max_store_mb: i32,
    ) -> Result<Self> {
        let (path, temp) = match source.into() {
            DocumentSource::Path(path) => {
                if !path.exists() {
                    return Err(RenderError::NotFound {
                        path: path.display().to_string(),
                    });
                }
                (path, None)
            }
            DocumentSource::Bytes(bytes) => {
                let temp = materialize(&bytes, kind)?;
                (temp.to_path_buf(), Some(temp))
            }
        };
        let from_bytes = temp.is_some();
        let max_store = max_store_bytes(max_store_mb);

        let mut context = engine
            .open(kind, &path, password, max_store)
            .map_err(|fault| match fault {
                OpenFault::AuthenticationRequired => RenderError::AuthenticationRequired,
                OpenFault::Failed(code) => RenderError::OpenFailed { code },
            })?;

        let page_count = usize::try_from(context.page_count()).unwrap_or(0);
        let anti_alias = settings().anti_alias_level;
        if context.anti_alias_level() != anti_alias {
            context.set_anti_alias_level(anti_alias);
        }
        let id = DocumentId::new(NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed));
        info!("Opened {kind:?} document {id:?} ({path:?}): {page_count} pages");

        Ok(Self {
            shared: Arc::new(DocumentShared {
                id,
                kind,
                engine,
                path,
                from_bytes,
                password: password.map(str::to_owned),
                max_store,
                page_count,
                open: AtomicBool::new(true),
                native: Mutex::new(NativeSlot {
                    context: Some(context),
                    anti_alias,
                    outline: None,
                    temp,
                }),
            }),
        })
    }

    /// Open a second, independent handle on the same source.
    pub fn duplicate(&self) -> Result<Self> {
        if !self.is_open() {
            return Err(RenderError::disposed("document"));
        }
        let s = &self.shared;
        let source = if s.from_bytes {
            DocumentSource::Bytes(std::fs::read(&s.path)?)
        } else {
            DocumentSource::Path(s.path.clone())
        };
        let max_store_mb = i32::try_from(s.max_store >> 20).unwrap_or(i32::MAX);
        Self::open(
            s.engine.clone(),
            source,
            s.password.as_deref(),
            s.kind,
            max_store_mb,
        )
    }

    pub(crate) fn shared(&self) -> &Arc<DocumentShared> {
        &self.shared
    }

    #[must_use]
    pub fn id(&self) -> DocumentId {
        self.shared.id()
    }

    #[must_use]
    pub fn kind(&self) -> DocumentType {
        self.shared.kind()
    }

    /// File the native context reads; a temporary file for in-memory sources
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Page count cached at open; 0 once closed
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.shared.page_count()
    }

    #[must_use]
    pub fn max_store_bytes(&self) -> usize {
        self.shared.max_store
    }

    /// Current anti-alias level; 0 once closed
    #[must_use]
    pub fn anti_alias_level(&self) -> i32 {
        let slot = self.shared.lock();
        if slot.context.is_some() {
            slot.anti_alias
        } else {
            0
        }
    }

    /// Clamp `level` to [0, 8] and push it to the engine if it changed.
    /// Returns whether the level changed.
    pub fn set_anti_alias_level(&self, level: i32) -> bool {
        let level = level.clamp(0, MAX_ANTI_ALIAS_LEVEL);
        let mut slot = self.shared.lock();
        if slot.anti_alias == level {
            return false;
        }
        let Some(context) = slot.context.as_deref_mut() else {
            return false;
        };
        context.set_anti_alias_level(level);
        slot.anti_alias = level;
        debug!("Document {:?} anti-alias level {level}", self.shared.id);
        true
    }

    /// Open 1-based page `number`
    pub fn page(&self, number: usize) -> Result<Page> {
        Page::open(self.clone(), number)
    }

    /// Outline tree, built on first request; `None` if the document has none
    #[must_use]
    pub fn outline(&self) -> Option<Arc<Outline>> {
        let mut slot = self.shared.lock();
        if let Some(outline) = &slot.outline {
            return Some(outline.clone());
        }
        let entries = slot.context.as_deref_mut()?.outline();
        if entries.is_empty() {
            return None;
        }
        let outline = Arc::new(Outline::from_entries(&entries));
        slot.outline = Some(outline.clone());
        Some(outline)
    }

    /// Release the native context. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}
