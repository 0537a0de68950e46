//! Scripted in-memory engine for tests
//!
//! Documents are described up front with builders, opened by path (or through
//! a default for in-memory sources) and rendered to a flat color per page, so
//! tests can check geometry, buffer bookkeeping and failure handling without
//! a native library.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::engine::pack::{Samples, pack};
use crate::engine::{
    BufferId, NativeContext, NativeEngine, OpenFault, OutlineEntry, PageInfo, PageLink, PageToken,
    RasterFault, RasterOutput, RasterParams, TextSpan,
};
use crate::geometry::{PixelBox, Rect};
use crate::types::DocumentType;

const DEFAULT_ANTI_ALIAS: i32 = 8;

/// Fallible lock for test scaffolding; a panicking render must not wedge stats
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug)]
pub struct ScriptedPage {
    bbox: Rect,
    rotation: i32,
    text: Vec<TextSpan>,
    links: Vec<PageLink>,
    broken: bool,
}

impl ScriptedPage {
    pub fn new(bbox: Rect, rotation: i32) -> Self {
        Self {
            bbox,
            rotation,
            text: Vec::new(),
            links: Vec::new(),
            broken: false,
        }
    }

    /// US letter, 612x792 points
    pub fn letter() -> Self {
        Self::new(Rect::new(0.0, 0.0, 612.0, 792.0), 0)
    }

    pub fn with_text(mut self, spans: Vec<TextSpan>) -> Self {
        self.text = spans;
        self
    }

    pub fn with_links(mut self, links: Vec<PageLink>) -> Self {
        self.links = links;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ScriptedDocument {
    pages: Vec<ScriptedPage>,
    password: Option<String>,
    open_fault: Option<i32>,
    outline: Vec<OutlineEntry>,
    shade: u8,
    anti_alias: i32,
}

impl ScriptedDocument {
    pub fn new(pages: Vec<ScriptedPage>) -> Self {
        Self {
            pages,
            password: None,
            open_fault: None,
            outline: Vec::new(),
            shade: 0x80,
            anti_alias: DEFAULT_ANTI_ALIAS,
        }
    }

    pub fn letter(page_count: usize) -> Self {
        Self::new(vec![ScriptedPage::letter(); page_count])
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Every open fails with the given native code
    pub fn failing_open(mut self, code: i32) -> Self {
        self.open_fault = Some(code);
        self
    }

    /// `(level, title, page)` triples in depth-first order
    pub fn with_outline(mut self, entries: Vec<(usize, &str, u32)>) -> Self {
        self.outline = entries
            .into_iter()
            .map(|(level, title, page)| OutlineEntry {
                level,
                title: title.to_string(),
                page: Some(page),
            })
            .collect();
        self
    }

    /// Native page creation fails for 1-based `page`
    pub fn with_broken_page(mut self, page: usize) -> Self {
        if let Some(p) = page.checked_sub(1).and_then(|i| self.pages.get_mut(i)) {
            p.broken = true;
        }
        self
    }

    /// Red channel of every rendered pixel
    pub fn with_shade(mut self, shade: u8) -> Self {
        self.shade = shade;
        self
    }

    /// Anti-alias level the native context starts with
    pub fn with_anti_alias(mut self, level: i32) -> Self {
        self.anti_alias = level;
        self
    }

    /// Flat RGB color rendered for 1-based `page`
    pub fn fill_for(&self, page: usize) -> [u8; 3] {
        [self.shade, (page * 40 % 256) as u8, 0x20]
    }
}

/// Call counters shared by an engine and every context it opened
#[derive(Debug, Default)]
pub struct EngineStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
    last_max_store: AtomicUsize,
    anti_alias_sets: AtomicUsize,
    outline_calls: AtomicUsize,
    new_pages: AtomicUsize,
    free_pages: AtomicUsize,
    page_info_calls: AtomicUsize,
    text_calls: AtomicUsize,
    link_calls: AtomicUsize,
    rasterize_calls: AtomicUsize,
    releases: AtomicUsize,
    reclaims: AtomicUsize,
    outstanding: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    raster_log: Mutex<Vec<RasterParams>>,
}

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        impl EngineStats {
            $(
                pub fn $name(&self) -> usize {
                    self.$name.load(Ordering::SeqCst)
                }
            )*
        }
    };
}

counters!(
    opens,
    closes,
    last_max_store,
    anti_alias_sets,
    outline_calls,
    new_pages,
    free_pages,
    page_info_calls,
    text_calls,
    link_calls,
    rasterize_calls,
    releases,
    reclaims,
    outstanding,
    peak_active,
);

impl EngineStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Parameters of every rasterization, in call order
    pub fn raster_log(&self) -> Vec<RasterParams> {
        lock(&self.raster_log).clone()
    }
}

/// Counts contexts inside a rasterization at the same time
struct ActiveGuard<'a>(&'a EngineStats);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a EngineStats) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_active.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail: usize,
    out_of_memory: usize,
    panic: usize,
    truncate: usize,
    delay: Duration,
}

#[derive(Default)]
pub struct ScriptedEngine {
    documents: Mutex<HashMap<PathBuf, ScriptedDocument>>,
    fallback: Mutex<Option<ScriptedDocument>>,
    stats: Arc<EngineStats>,
    faults: Arc<Mutex<Faults>>,
    opened: Mutex<Vec<PathBuf>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: impl AsRef<Path>, doc: ScriptedDocument) {
        lock(&self.documents).insert(path.as_ref().to_path_buf(), doc);
    }

    /// Document served for any unregistered path, in-memory sources included
    pub fn set_default(&self, doc: ScriptedDocument) {
        *lock(&self.fallback) = Some(doc);
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn fail_next_rasters(&self, count: usize) {
        lock(&self.faults).fail += count;
    }

    pub fn oom_next_rasters(&self, count: usize) {
        lock(&self.faults).out_of_memory += count;
    }

    pub fn panic_next_raster(&self) {
        lock(&self.faults).panic += 1;
    }

    /// Next rasterizations hand back a buffer shorter than the box they report
    pub fn truncate_next_rasters(&self, count: usize) {
        lock(&self.faults).truncate += count;
    }

    /// Every path passed to `open`, failed opens included
    pub fn opened_paths(&self) -> Vec<PathBuf> {
        lock(&self.opened).clone()
    }

    /// Sleep inside every rasterization, holding the context
    pub fn set_raster_delay(&self, delay: Duration) {
        lock(&self.faults).delay = delay;
    }
}

impl NativeEngine for ScriptedEngine {
    fn open(
        &self,
        _kind: DocumentType,
        path: &Path,
        password: Option<&str>,
        max_store_bytes: usize,
    ) -> Result<Box<dyn NativeContext>, OpenFault> {
        lock(&self.opened).push(path.to_path_buf());
        let doc = lock(&self.documents)
            .get(path)
            .cloned()
            .or_else(|| lock(&self.fallback).clone())
            .ok_or(OpenFault::Failed(-1))?;
        if let Some(code) = doc.open_fault {
            return Err(OpenFault::from_code(code));
        }
        if doc.password.is_some() && doc.password.as_deref() != password {
            return Err(OpenFault::AuthenticationRequired);
        }

        EngineStats::bump(&self.stats.opens);
        self.stats
            .last_max_store
            .store(max_store_bytes, Ordering::SeqCst);
        Ok(Box::new(ScriptedContext {
            anti_alias: doc.anti_alias,
            doc,
            stats: self.stats.clone(),
            faults: self.faults.clone(),
            next_id: 1,
            pages: HashMap::new(),
            buffers: HashMap::new(),
            closed: false,
        }))
    }
}

struct ScriptedContext {
    doc: ScriptedDocument,
    stats: Arc<EngineStats>,
    faults: Arc<Mutex<Faults>>,
    anti_alias: i32,
    next_id: u64,
    /// token -> 1-based page number
    pages: HashMap<PageToken, usize>,
    /// buffer -> owning page
    buffers: HashMap<BufferId, PageToken>,
    closed: bool,
}

impl ScriptedContext {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn script_for(&self, page: PageToken) -> Option<(usize, &ScriptedPage)> {
        let number = *self.pages.get(&page)?;
        Some((number, self.doc.pages.get(number - 1)?))
    }
}

impl NativeContext for ScriptedContext {
    fn page_count(&mut self) -> i32 {
        self.doc.pages.len() as i32
    }

    fn anti_alias_level(&mut self) -> i32 {
        self.anti_alias
    }

    fn set_anti_alias_level(&mut self, level: i32) {
        EngineStats::bump(&self.stats.anti_alias_sets);
        self.anti_alias = level;
    }

    fn new_page(&mut self, page_number: usize) -> Option<PageToken> {
        let page = self.doc.pages.get(page_number.checked_sub(1)?)?;
        if page.broken {
            return None;
        }
        EngineStats::bump(&self.stats.new_pages);
        let token = PageToken(self.next_id());
        self.pages.insert(token, page_number);
        Some(token)
    }

    fn free_page(&mut self, page: PageToken) {
        if self.pages.remove(&page).is_some() {
            EngineStats::bump(&self.stats.free_pages);
        }
    }

    fn page_info(&mut self, page: PageToken) -> Option<PageInfo> {
        EngineStats::bump(&self.stats.page_info_calls);
        let (_, script) = self.script_for(page)?;
        Some(PageInfo {
            bbox: script.bbox,
            rotation: script.rotation,
        })
    }

    fn page_text(&mut self, page: PageToken, region: Rect) -> Vec<TextSpan> {
        EngineStats::bump(&self.stats.text_calls);
        let Some((_, script)) = self.script_for(page) else {
            return Vec::new();
        };
        script.text
            .iter()
            .filter(|span| region.is_zero() || span.rect.intersects(&region))
            .cloned()
            .collect()
    }

    fn page_links(&mut self, page: PageToken) -> Vec<PageLink> {
        EngineStats::bump(&self.stats.link_calls);
        self.script_for(page)
            .map(|(_, script)| script.links.clone())
            .unwrap_or_default()
    }

    fn outline(&mut self) -> Vec<OutlineEntry> {
        EngineStats::bump(&self.stats.outline_calls);
        self.doc.outline.clone()
    }

    fn rasterize(
        &mut self,
        page: PageToken,
        params: &RasterParams,
    ) -> Result<RasterOutput, RasterFault> {
        let stats = self.stats.clone();
        let _active = ActiveGuard::enter(&stats);
        EngineStats::bump(&stats.rasterize_calls);
        lock(&stats.raster_log).push(*params);

        let (delay, panic, oom, fail, truncate) = {
            let mut faults = lock(&self.faults);
            let take = |n: &mut usize| {
                let hit = *n > 0;
                *n = n.saturating_sub(1);
                hit
            };
            let panic = take(&mut faults.panic);
            let oom = !panic && take(&mut faults.out_of_memory);
            let fail = !panic && !oom && take(&mut faults.fail);
            let truncate = take(&mut faults.truncate);
            (faults.delay, panic, oom, fail, truncate)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if panic {
            panic!("scripted rasterizer panic");
        }
        if oom {
            return Err(RasterFault::OutOfMemory);
        }
        if fail {
            return Err(RasterFault::NoBuffer("scripted failure".into()));
        }

        let (number, script) = self
            .script_for(page)
            .ok_or_else(|| RasterFault::NoBuffer("unknown page".into()))?;
        let crop = if params.crop.is_zero() {
            script.bbox
        } else {
            params.crop.intersect(&script.bbox)
        };
        let scaled = crop.scale(params.zoom).round_out();
        let (width, height) = if params.rotation % 180 == 0 {
            (scaled.width(), scaled.height())
        } else {
            (scaled.height(), scaled.width())
        };

        let [r, g, b] = self.doc.fill_for(number);
        let alpha = params.color.has_alpha();
        let pixel: &[u8] = if alpha { &[r, g, b, 255] } else { &[r, g, b] };
        let channels = pixel.len();
        let data: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * channels)
            .collect();
        let mut packed = pack(
            &Samples {
                data: &data,
                width: width as usize,
                height: height as usize,
                stride: width as usize * channels,
                channels,
                alpha,
            },
            params.color,
            params.gamma,
        )?;
        if truncate {
            packed.truncate(8);
        }

        let buffer = BufferId(self.next_id());
        self.buffers.insert(buffer, page);
        EngineStats::bump(&stats.outstanding);
        Ok(RasterOutput {
            buffer,
            samples: Arc::from(packed),
            bbox: PixelBox::new(0, 0, width as i32, height as i32),
        })
    }

    fn release_buffer(&mut self, _page: PageToken, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_some() {
            self.stats.outstanding.fetch_sub(1, Ordering::SeqCst);
            EngineStats::bump(&self.stats.releases);
        }
    }

    fn reclaim_memory(&mut self) {
        EngineStats::bump(&self.stats.reclaims);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stats
            .outstanding
            .fetch_sub(self.buffers.len(), Ordering::SeqCst);
        self.buffers.clear();
        self.pages.clear();
        EngineStats::bump(&self.stats.closes);
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.close();
    }
}
