//! The ordered working list of pages for one organizer session.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::page::{Bitmap, PageId, PageIds, PageKind, PageSource, RenderState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordered list of [`PageSource`] entries.
///
/// After every mutating call the `current_index` values are exactly
/// `0..len`, matching vector position.
#[derive(Debug, Clone, Default)]
pub struct DocumentSequence {
    pages: Vec<PageSource>,
}

impl DocumentSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// One `OriginalPage` per page of the base document, in source order.
    pub fn load_base(total_pages: u32, ids: &mut PageIds) -> AppResult<Self> {
        if total_pages == 0 {
            return Err(AppError::InvalidDocument("PDF has no pages.".to_string()));
        }
        let mut pages: Vec<PageSource> = (1..=total_pages)
            .map(|n| PageSource::original(ids.next_id(), n))
            .collect();
        for (i, page) in pages.iter_mut().enumerate() {
            page.current_index = i;
        }
        Ok(Self { pages })
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[PageSource] {
        &self.pages
    }

    pub fn ids(&self) -> Vec<PageId> {
        self.pages.iter().map(|p| p.id).collect()
    }

    pub fn get(&self, id: PageId) -> Option<&PageSource> {
        self.pages.iter().find(|p| p.id == id)
    }

    pub fn position(&self, id: PageId) -> Option<usize> {
        self.pages.iter().position(|p| p.id == id)
    }

    /// Splices `entries` in before `position` (clamped to `0..=len`).
    pub fn insert_at(&mut self, position: usize, entries: Vec<PageSource>) {
        if entries.is_empty() {
            return;
        }
        let at = position.min(self.pages.len());
        self.pages.splice(at..at, entries);
        self.reindex();
    }

    pub fn push(&mut self, entries: Vec<PageSource>) {
        let end = self.pages.len();
        self.insert_at(end, entries);
    }

    /// Removes the entry with `id`. Absent ids are ignored.
    pub fn remove(&mut self, id: PageId) -> Option<PageSource> {
        let index = self.position(id)?;
        let removed = self.pages.remove(index);
        self.reindex();
        Some(removed)
    }

    /// Moves `id` so it ends up at `destination` (clamped). Returns false if
    /// `id` is absent.
    pub fn move_page(&mut self, id: PageId, destination: usize) -> bool {
        let Some(from) = self.position(id) else {
            return false;
        };
        let page = self.pages.remove(from);
        let to = destination.min(self.pages.len());
        self.pages.insert(to, page);
        self.reindex();
        true
    }

    /// Orders by the current index. Descending reverses the current order.
    pub fn sort_by_index(&mut self, direction: SortDirection) {
        match direction {
            SortDirection::Ascending => self.pages.sort_by_key(|p| p.current_index),
            SortDirection::Descending => self
                .pages
                .sort_by(|a, b| b.current_index.cmp(&a.current_index)),
        }
        self.reindex();
    }

    /// Original pages by source page number, then inserted documents and
    /// images, then blanks. The last two keep their relative order.
    pub fn reset_to_original_order(&mut self) {
        let mut originals = Vec::new();
        let mut inserted = Vec::new();
        let mut blanks = Vec::new();
        for page in self.pages.drain(..) {
            match page.kind {
                PageKind::OriginalPage { .. } => originals.push(page),
                PageKind::ImportedDocumentPage { .. } | PageKind::ImportedImage { .. } => {
                    inserted.push(page)
                }
                PageKind::Blank { .. } => blanks.push(page),
            }
        }
        originals.sort_by_key(|p| p.source_page_number());
        self.pages = originals;
        self.pages.extend(inserted);
        self.pages.extend(blanks);
        self.reindex();
    }

    pub fn clear_all(&mut self) {
        self.pages.clear();
    }

    /// Owned copy of the current order, for work that outlives this borrow.
    pub fn snapshot(&self) -> Vec<PageSource> {
        self.pages.clone()
    }

    /// Stores a rendered thumbnail. Only the first result for an entry is
    /// kept; returns false when the entry is gone or already rendered.
    pub fn apply_render(&mut self, id: PageId, bitmap: Bitmap) -> bool {
        match self.pages.iter_mut().find(|p| p.id == id) {
            Some(page) if !page.render_state.is_rendered() => {
                page.render_state = RenderState::Rendered(bitmap);
                true
            }
            _ => false,
        }
    }

    fn reindex(&mut self) {
        for (i, page) in self.pages.iter_mut().enumerate() {
            page.current_index = i;
        }
    }
}
