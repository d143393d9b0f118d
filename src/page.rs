//! The unit of the working document: where a page's content comes from,
//! where it currently sits, and its cached thumbnail.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Immutable snapshot of a document's bytes, shared by rendering and export.
pub type SourceBytes = Arc<[u8]>;

/// Identity of a byte snapshot, for caching work per distinct buffer. Only
/// meaningful while the snapshot is alive.
pub(crate) fn source_key(bytes: &SourceBytes) -> usize {
    Arc::as_ptr(bytes) as *const u8 as usize
}

/// A rasterized page or image. Shared, never mutated after creation.
pub type Bitmap = Arc<RgbImage>;

/// Stable identity of a page across every reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(u64);

impl PageId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

/// Hands out session-unique page ids.
#[derive(Debug, Default)]
pub struct PageIds {
    next: u64,
}

impl PageIds {
    pub fn next_id(&mut self) -> PageId {
        self.next += 1;
        PageId(self.next)
    }
}

#[derive(Clone)]
pub enum PageKind {
    /// Page of the loaded base document (1-based).
    OriginalPage { source_page_number: u32 },
    /// Page of another PDF the user inserted. Carries its own copy of the bytes.
    ImportedDocumentPage {
        bytes: SourceBytes,
        page_number: u32,
        file_name: String,
    },
    ImportedImage { image: Bitmap, file_name: String },
    /// Generated blank page, sized in points.
    Blank { width: u32, height: u32 },
}

impl fmt::Debug for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageKind::OriginalPage { source_page_number } => f
                .debug_struct("OriginalPage")
                .field("source_page_number", source_page_number)
                .finish(),
            PageKind::ImportedDocumentPage {
                bytes,
                page_number,
                file_name,
            } => f
                .debug_struct("ImportedDocumentPage")
                .field("file_name", file_name)
                .field("page_number", page_number)
                .field("bytes", &bytes.len())
                .finish(),
            PageKind::ImportedImage { image, file_name } => f
                .debug_struct("ImportedImage")
                .field("file_name", file_name)
                .field("dimensions", &image.dimensions())
                .finish(),
            PageKind::Blank { width, height } => f
                .debug_struct("Blank")
                .field("width", width)
                .field("height", height)
                .finish(),
        }
    }
}

#[derive(Clone, Default)]
pub enum RenderState {
    #[default]
    NotRendered,
    Rendered(Bitmap),
}

impl RenderState {
    pub fn bitmap(&self) -> Option<&Bitmap> {
        match self {
            RenderState::Rendered(bitmap) => Some(bitmap),
            RenderState::NotRendered => None,
        }
    }

    pub fn is_rendered(&self) -> bool {
        matches!(self, RenderState::Rendered(_))
    }
}

impl fmt::Debug for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderState::NotRendered => f.write_str("NotRendered"),
            RenderState::Rendered(bitmap) => write!(f, "Rendered({}x{})", bitmap.width(), bitmap.height()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageSource {
    pub id: PageId,
    pub kind: PageKind,
    /// Position in the owning sequence. Recomputed after every mutation.
    pub current_index: usize,
    pub render_state: RenderState,
}

impl PageSource {
    pub fn new(id: PageId, kind: PageKind) -> Self {
        Self {
            id,
            kind,
            current_index: 0,
            render_state: RenderState::NotRendered,
        }
    }

    pub fn original(id: PageId, source_page_number: u32) -> Self {
        Self::new(id, PageKind::OriginalPage { source_page_number })
    }

    pub fn blank(id: PageId, width: u32, height: u32) -> Self {
        Self::new(id, PageKind::Blank { width, height })
    }

    pub fn source_page_number(&self) -> Option<u32> {
        match self.kind {
            PageKind::OriginalPage { source_page_number } => Some(source_page_number),
            _ => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self.kind, PageKind::Blank { .. })
    }

    pub fn summary(&self) -> PageSummary {
        let (kind, label) = match &self.kind {
            PageKind::OriginalPage { source_page_number } => {
                (PageKindTag::Original, source_page_number.to_string())
            }
            PageKind::ImportedDocumentPage {
                file_name,
                page_number,
                ..
            } => (PageKindTag::ImportedPage, format!("{} p{}", file_name, page_number)),
            PageKind::ImportedImage { file_name, .. } => (PageKindTag::Image, file_name.clone()),
            PageKind::Blank { .. } => (PageKindTag::Blank, "BLANK".to_string()),
        };
        PageSummary {
            id: self.id,
            index: self.current_index,
            kind,
            label,
            rendered: self.render_state.is_rendered(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKindTag {
    Original,
    ImportedPage,
    Image,
    Blank,
}

/// Front-end view of one page card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSummary {
    pub id: PageId,
    pub index: usize,
    pub kind: PageKindTag,
    pub label: String,
    pub rendered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let mut ids = PageIds::default();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.to_string(), "page-1");
    }

    #[test]
    fn summary_labels_by_kind() {
        let mut ids = PageIds::default();
        let original = PageSource::original(ids.next_id(), 7);
        assert_eq!(original.summary().label, "7");
        assert_eq!(original.summary().kind, PageKindTag::Original);

        let blank = PageSource::blank(ids.next_id(), 595, 842);
        assert!(blank.is_blank());
        assert_eq!(blank.summary().kind, PageKindTag::Blank);
        assert!(!blank.summary().rendered);
    }
}
