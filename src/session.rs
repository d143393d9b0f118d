//! Organizer and split sessions: the state a user works on between opening a
//! file and saving the result.

use image::{imageops, ImageFormat};
use std::io::Cursor;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::Settings;
use crate::delivery::{deliver_many, deliver_single, Backend, DeliveryOutcome};
use crate::error::{AppError, AppResult};
use crate::materialize::{materialize_sequence, materialize_split, OutputFile};
use crate::page::{PageId, PageIds, PageKind, PageSource, PageSummary, SourceBytes};
use crate::pdf::{self, PageMetadata, PdfEngine};
use crate::ranges::{OutputUnit, PageRange, SplitMode, SplitPlan};
use crate::sequence::{DocumentSequence, SortDirection};
use crate::thumbnail::{
    MediaBoxRasterizer, Rasterizer, RenderOutcome, RenderPass, RenderReport, ThumbnailCache,
};

/// A file handed to the session by the user.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new<S: Into<String>>(name: S, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn read<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(AppError::InvalidDocument(format!(
                "Path is not a file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        Ok(Self::new(name, fs::read(path)?))
    }
}

fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.len() >= 5 && bytes[..1024.min(bytes.len())].windows(5).any(|w| w == b"%PDF-")
}

// --- Organizer ---

pub struct OrganizerSession {
    engine: PdfEngine,
    settings: Settings,
    base: SourceBytes,
    base_pages: u32,
    ids: PageIds,
    sequence: DocumentSequence,
    thumbnails: ThumbnailCache,
}

impl OrganizerSession {
    pub fn open(engine: PdfEngine, settings: Settings, bytes: Vec<u8>) -> AppResult<Self> {
        Self::open_with(engine, settings, bytes, Arc::new(MediaBoxRasterizer))
    }

    pub fn open_with(
        engine: PdfEngine,
        settings: Settings,
        bytes: Vec<u8>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> AppResult<Self> {
        let base: SourceBytes = Arc::from(bytes);
        let base_pages = engine.page_count(&base)?;
        let mut ids = PageIds::default();
        let sequence = DocumentSequence::load_base(base_pages, &mut ids)?;
        let thumbnails = ThumbnailCache::new(rasterizer, base.clone(), &settings);
        log::info!("organizer opened with {} pages", base_pages);
        Ok(Self {
            engine,
            settings,
            base,
            base_pages,
            ids,
            sequence,
            thumbnails,
        })
    }

    pub fn base_pages(&self) -> u32 {
        self.base_pages
    }

    pub fn sequence(&self) -> &DocumentSequence {
        &self.sequence
    }

    pub fn summaries(&self) -> Vec<PageSummary> {
        self.sequence.pages().iter().map(PageSource::summary).collect()
    }

    pub fn base_metadata(&self) -> AppResult<Vec<PageMetadata>> {
        Ok(pdf::page_metadata(&self.engine.decode(&self.base)?))
    }

    /// Builds the entries a file contributes. `None` means the file is
    /// skipped.
    fn entries_for(&mut self, file: InputFile) -> Option<Vec<PageSource>> {
        if looks_like_pdf(&file.bytes) {
            let count = match self.engine.page_count(&file.bytes) {
                Ok(0) => {
                    log::warn!("{} has no pages, skipped", file.name);
                    return None;
                }
                Ok(count) => count,
                Err(e) => {
                    log::warn!("could not read {}: {}", file.name, e);
                    return None;
                }
            };
            let bytes: SourceBytes = Arc::from(file.bytes);
            let entries = (1..=count)
                .map(|page_number| {
                    PageSource::new(
                        self.ids.next_id(),
                        PageKind::ImportedDocumentPage {
                            bytes: bytes.clone(),
                            page_number,
                            file_name: file.name.clone(),
                        },
                    )
                })
                .collect();
            return Some(entries);
        }

        match image::guess_format(&file.bytes) {
            Ok(ImageFormat::Png) | Ok(ImageFormat::Jpeg) => {}
            _ => {
                log::warn!("{} is neither a PDF nor a PNG/JPEG image, skipped", file.name);
                return None;
            }
        }
        let decoded = match image::load_from_memory(&file.bytes) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("could not decode {}: {}", file.name, e);
                return None;
            }
        };
        let scale = self.settings.imported_image_scale;
        let width = ((decoded.width() as f32 * scale).round() as u32).max(1);
        let height = ((decoded.height() as f32 * scale).round() as u32).max(1);
        let image = if (width, height) == decoded.dimensions() {
            decoded
        } else {
            imageops::resize(&decoded, width, height, imageops::FilterType::Triangle)
        };
        Some(vec![PageSource::new(
            self.ids.next_id(),
            PageKind::ImportedImage {
                image: Arc::new(image),
                file_name: file.name,
            },
        )])
    }

    /// Inserts every usable file at `position`, keeping file order. Returns
    /// the number of pages added.
    pub fn insert_files(&mut self, position: usize, files: Vec<InputFile>) -> usize {
        let mut entries = Vec::new();
        for file in files {
            if let Some(mut pages) = self.entries_for(file) {
                entries.append(&mut pages);
            }
        }
        let added = entries.len();
        self.sequence.insert_at(position, entries);
        log::info!("inserted {} pages at {}", added, position);
        added
    }

    /// "Add more": inserts at the end.
    pub fn append_files(&mut self, files: Vec<InputFile>) -> usize {
        let end = self.sequence.len();
        self.insert_files(end, files)
    }

    pub fn insert_blank(&mut self, position: usize) -> PageId {
        let id = self.ids.next_id();
        let blank = PageSource::blank(
            id,
            self.settings.blank_page_width,
            self.settings.blank_page_height,
        );
        self.sequence.insert_at(position, vec![blank]);
        id
    }

    pub fn remove(&mut self, id: PageId) -> bool {
        self.sequence.remove(id).is_some()
    }

    pub fn move_page(&mut self, id: PageId, destination: usize) -> bool {
        self.sequence.move_page(id, destination)
    }

    pub fn sort(&mut self, direction: SortDirection) {
        self.sequence.sort_by_index(direction);
    }

    pub fn reset_order(&mut self) {
        self.sequence.reset_to_original_order();
    }

    pub fn clear_all(&mut self) {
        self.sequence.clear_all();
    }

    /// Renders every pending thumbnail, holding the session throughout.
    pub async fn refresh_thumbnails(&mut self) -> RenderReport {
        self.thumbnails.refresh(&mut self.sequence).await
    }

    /// Detached render work for the current state. Drive it with
    /// [`RenderPass::next_batch`] and hand each batch to
    /// [`OrganizerSession::apply_renders`]; the session can be edited in
    /// between.
    pub fn begin_render(&self) -> RenderPass {
        self.thumbnails.begin(&self.sequence)
    }

    /// Stores a batch by id. Batches from a pass of another session are
    /// counted as stale.
    pub fn apply_renders(&mut self, pass: &RenderPass, outcomes: Vec<RenderOutcome>, report: &mut RenderReport) {
        if !Arc::ptr_eq(pass.base(), &self.base) {
            report.stale += outcomes.len();
            return;
        }
        report.apply(&mut self.sequence, outcomes);
    }

    /// PNG of a rendered thumbnail. `None` while the page has none yet.
    pub fn thumbnail_png(&self, id: PageId) -> AppResult<Option<Vec<u8>>> {
        let page = self
            .sequence
            .get(id)
            .ok_or_else(|| AppError::PageResolutionFailed(format!("{} is not in the document", id)))?;
        let Some(bitmap) = page.render_state.bitmap() else {
            return Ok(None);
        };
        let mut out = Cursor::new(Vec::new());
        bitmap.write_to(&mut out, ImageFormat::Png)?;
        Ok(Some(out.into_inner()))
    }

    /// Materializes the current order.
    pub async fn export(&self) -> AppResult<OutputFile> {
        materialize_sequence(
            &self.engine,
            &self.settings,
            &self.base,
            self.base_pages,
            self.sequence.snapshot(),
        )
        .await
    }

    /// Exports and hands the result to `backend`. A canceled prompt leaves
    /// the session untouched.
    pub async fn save<B: Backend>(&self, backend: &B) -> AppResult<DeliveryOutcome> {
        let output = self.export().await?;
        if !output.skipped.is_empty() {
            log::warn!("{} pages were left out of the export", output.skipped.len());
        }
        deliver_single(backend, &self.settings, &output).await
    }
}

// --- Split ---

const DEFAULT_PAGES_PER_CHUNK: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeKind {
    Custom,
    Fixed,
}

pub struct SplitSession {
    engine: PdfEngine,
    settings: Settings,
    source: Vec<u8>,
    total_pages: u32,
    mode: ModeKind,
    ranges: Vec<PageRange>,
    pages_per_chunk: u32,
}

impl SplitSession {
    pub fn open(engine: PdfEngine, settings: Settings, bytes: Vec<u8>) -> AppResult<Self> {
        let total_pages = engine.page_count(&bytes)?;
        if total_pages == 0 {
            return Err(AppError::InvalidDocument("Document has no pages".to_string()));
        }
        log::info!("split opened with {} pages", total_pages);
        Ok(Self {
            engine,
            settings,
            source: bytes,
            total_pages,
            mode: ModeKind::Custom,
            ranges: vec![PageRange::new(1, 1)],
            pages_per_chunk: DEFAULT_PAGES_PER_CHUNK,
        })
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn ranges(&self) -> &[PageRange] {
        &self.ranges
    }

    pub fn mode(&self) -> SplitMode {
        match self.mode {
            ModeKind::Custom => SplitMode::Custom {
                ranges: self.ranges.clone(),
            },
            ModeKind::Fixed => SplitMode::Fixed {
                pages_per_chunk: self.pages_per_chunk,
            },
        }
    }

    pub fn add_range(&mut self, range: PageRange) {
        self.ranges.push(range);
    }

    pub fn remove_range(&mut self, index: usize) -> Option<PageRange> {
        (index < self.ranges.len()).then(|| self.ranges.remove(index))
    }

    pub fn reset_ranges(&mut self) {
        self.ranges = vec![PageRange::new(1, 1)];
        self.pages_per_chunk = DEFAULT_PAGES_PER_CHUNK;
    }

    /// Switches mode, adopting the data the mode carries.
    pub fn set_mode(&mut self, mode: SplitMode) {
        match mode {
            SplitMode::Custom { ranges } => {
                self.mode = ModeKind::Custom;
                self.ranges = ranges;
            }
            SplitMode::Fixed { pages_per_chunk } => {
                self.mode = ModeKind::Fixed;
                self.pages_per_chunk = pages_per_chunk;
            }
        }
    }

    pub fn set_pages_per_chunk(&mut self, pages_per_chunk: u32) {
        self.pages_per_chunk = pages_per_chunk;
    }

    pub fn plan(&self, include_remainder: bool) -> AppResult<SplitPlan> {
        SplitPlan::from_mode(&self.mode(), self.total_pages, include_remainder)
    }

    /// Output files the current settings would produce, without building
    /// any of them.
    pub fn preview(&self, include_remainder: bool) -> AppResult<Vec<OutputUnit>> {
        Ok(self.plan(include_remainder)?.units())
    }

    pub async fn materialize(&self, include_remainder: bool) -> AppResult<Vec<OutputFile>> {
        let plan = self.plan(include_remainder)?;
        materialize_split(&self.engine, &self.settings, &self.source, &plan).await
    }

    pub async fn execute<B: Backend>(
        &self,
        backend: &B,
        include_remainder: bool,
    ) -> AppResult<DeliveryOutcome> {
        let outputs = self.materialize(include_remainder).await?;
        deliver_many(backend, &self.settings, &outputs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::FsBackend;
    use crate::page::PageKindTag;
    use crate::pdf::tests::{sample_pdf, widths_of};
    use image::RgbImage;

    fn engine() -> PdfEngine {
        PdfEngine::init().unwrap()
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn organizer(widths: &[i64]) -> OrganizerSession {
        OrganizerSession::open(engine(), Settings::default(), sample_pdf(widths)).unwrap()
    }

    #[test]
    fn insert_files_expands_pdfs_and_skips_junk() {
        let mut session = organizer(&[100, 200]);
        let added = session.insert_files(
            1,
            vec![
                InputFile::new("two.pdf", sample_pdf(&[300, 400])),
                InputFile::new("notes.txt", b"hello".to_vec()),
                InputFile::new("photo.png", png(100, 50)),
            ],
        );
        assert_eq!(added, 3);
        let kinds: Vec<PageKindTag> = session.summaries().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PageKindTag::Original,
                PageKindTag::ImportedPage,
                PageKindTag::ImportedPage,
                PageKindTag::Image,
                PageKindTag::Original,
            ]
        );
        match &session.sequence().pages()[3].kind {
            PageKind::ImportedImage { image, .. } => assert_eq!(image.dimensions(), (80, 40)),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[tokio::test]
    async fn removal_during_render_pass_is_skipped() {
        let mut session = organizer(&[100, 200, 300]);
        let mut pass = session.begin_render();
        let removed = session.sequence().pages()[2].id;
        assert!(session.remove(removed));

        let mut report = RenderReport::default();
        while let Some(outcomes) = pass.next_batch().await {
            session.apply_renders(&pass, outcomes, &mut report);
        }
        assert_eq!(report.rendered, 2);
        assert_eq!(report.stale, 1);
        assert!(session.summaries().iter().all(|p| p.rendered));
    }

    #[tokio::test]
    async fn render_pass_of_another_session_is_ignored() {
        let mut first = organizer(&[100, 200]);
        let second = organizer(&[100, 200]);
        let mut pass = second.begin_render();

        let mut report = RenderReport::default();
        while let Some(outcomes) = pass.next_batch().await {
            first.apply_renders(&pass, outcomes, &mut report);
        }
        assert_eq!(report.rendered, 0);
        assert_eq!(report.stale, 2);
        assert!(first.summaries().iter().all(|p| !p.rendered));
    }

    #[tokio::test]
    async fn thumbnails_are_served_as_png() {
        let mut session = organizer(&[100, 200]);
        let id = session.sequence().pages()[1].id;
        assert_eq!(session.thumbnail_png(id).unwrap(), None);

        session.refresh_thumbnails().await;
        let png = session.thumbnail_png(id).unwrap().unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (200, 800));

        session.remove(id);
        assert!(session.thumbnail_png(id).is_err());
    }

    #[test]
    fn opening_garbage_fails() {
        assert!(OrganizerSession::open(engine(), Settings::default(), b"nope".to_vec()).is_err());
        assert!(SplitSession::open(engine(), Settings::default(), Vec::new()).is_err());
    }

    #[tokio::test]
    async fn export_follows_current_order() {
        let mut session = organizer(&[100, 200, 300]);
        session.append_files(vec![InputFile::new("extra.pdf", sample_pdf(&[400]))]);
        session.insert_blank(0);
        let first_original = session.sequence().pages()[1].id;
        assert!(session.remove(first_original));

        let output = session.export().await.unwrap();
        assert_eq!(widths_of(&output.bytes), vec![595, 200, 300, 400]);
        assert_eq!(output.name, "organized.pdf");
    }

    #[tokio::test]
    async fn canceled_save_keeps_the_sequence() {
        let mut session = organizer(&[100, 200, 300]);
        session.sort(SortDirection::Descending);
        let before = session.sequence().ids();

        let outcome = session.save(&FsBackend::canceling()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Canceled);
        assert_eq!(session.sequence().ids(), before);
    }

    #[tokio::test]
    async fn cleared_session_has_nothing_to_export() {
        let mut session = organizer(&[100]);
        session.clear_all();
        assert!(matches!(session.export().await, Err(AppError::NoContentProduced)));
    }

    #[tokio::test]
    async fn failed_export_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.pdf");
        let mut session = organizer(&[100, 200]);
        session.clear_all();

        assert!(session.save(&FsBackend::save_to(&target)).await.is_err());
        assert!(!target.exists());
    }

    #[test]
    fn split_defaults_and_reset() {
        let mut session = SplitSession::open(engine(), Settings::default(), sample_pdf(&[100; 6])).unwrap();
        assert_eq!(session.ranges(), &[PageRange::new(1, 1)]);

        session.add_range(PageRange::new(3, 4));
        session.set_mode(SplitMode::Fixed { pages_per_chunk: 5 });
        let names: Vec<String> = session.preview(false).unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["split_1_pages_1-5.pdf", "split_2_pages_6-6.pdf"]);

        session.reset_ranges();
        assert_eq!(session.ranges(), &[PageRange::new(1, 1)]);
        let units = session.preview(false).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].pages, vec![1, 2, 3, 4]);
    }

    #[test]
    fn split_preview_reports_overlap() {
        let mut session = SplitSession::open(engine(), Settings::default(), sample_pdf(&[100; 5])).unwrap();
        session.add_range(PageRange::new(1, 3));
        assert!(matches!(
            session.preview(true),
            Err(AppError::OverlappingRanges { first: 1, second: 2 })
        ));
        assert_eq!(session.remove_range(0), Some(PageRange::new(1, 1)));
        assert_eq!(session.remove_range(7), None);
        let units = session.preview(true).unwrap();
        assert_eq!(units.last().unwrap().name, "remaining_pages.pdf");
        assert_eq!(units.last().unwrap().pages, vec![4, 5]);
    }

    #[tokio::test]
    async fn split_execute_writes_into_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SplitSession::open(engine(), Settings::default(), sample_pdf(&[100, 200, 300])).unwrap();
        session.set_mode(SplitMode::Custom {
            ranges: vec![PageRange::new(2, 3)],
        });

        let outcome = session.execute(&FsBackend::into_folder(dir.path()), true).await.unwrap();
        let DeliveryOutcome::Saved { paths } = outcome else {
            panic!("expected saved outcome");
        };
        assert_eq!(paths.len(), 2);
        assert_eq!(widths_of(&std::fs::read(dir.path().join("split_1_pages_2-3.pdf")).unwrap()), vec![200, 300]);
        assert_eq!(widths_of(&std::fs::read(dir.path().join("remaining_pages.pdf")).unwrap()), vec![100]);
    }
}
