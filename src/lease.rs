use std::sync::Arc;

use crate::document::DocumentShared;
use crate::engine::{PageToken, RasterOutput};
use crate::geometry::PixelBox;
use crate::metrics::record_lease;

/// Engine-owned pixel buffer, returned to the engine exactly once on drop.
pub(crate) struct BufferLease {
    doc: Arc<DocumentShared>,
    page: PageToken,
    output: Option<RasterOutput>,
}

impl BufferLease {
    pub(crate) fn new(doc: Arc<DocumentShared>, page: PageToken, output: RasterOutput) -> Self {
        record_lease();
        Self {
            doc,
            page,
            output: Some(output),
        }
    }

    /// Actual box the engine rendered
    pub(crate) fn bbox(&self) -> PixelBox {
        self.output.as_ref().map(|o| o.bbox).unwrap_or_default()
    }

    pub(crate) fn samples(&self) -> &[u8] {
        self.output.as_ref().map_or(&[], |o| &o.samples[..])
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(output) = self.output.take() {
            self.doc.release_buffer(self.page, output.buffer);
        }
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("page", &self.page)
            .field("bbox", &self.bbox())
            .field("bytes", &self.samples().len())
            .finish()
    }
}
