//! Thumbnail rendering for organizer page cards.
//!
//! Rendering never touches the sequence directly: a [`RenderPass`] is built
//! from a snapshot, its batches are rasterized without holding the sequence,
//! and the results are applied back by id.

use image::{Rgb, RgbImage};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::page::{source_key, Bitmap, PageId, PageKind, PageSource, SourceBytes};
use crate::pdf::{self, SourceDocument};
use crate::sequence::DocumentSequence;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BORDER: Rgb<u8> = Rgb([0xe0, 0xe0, 0xe0]);

/// Turns one page of a decoded document into pixels.
pub trait Rasterizer: Send + Sync {
    fn rasterize(&self, source: &SourceDocument, page_number: u32, scale: f32) -> AppResult<RgbImage>;
}

/// Geometry-only rasterizer: a white canvas the size of the page's MediaBox.
/// Used where no content renderer is plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct MediaBoxRasterizer;

impl Rasterizer for MediaBoxRasterizer {
    fn rasterize(&self, source: &SourceDocument, page_number: u32, scale: f32) -> AppResult<RgbImage> {
        let page_id = source.page_id(page_number).ok_or_else(|| {
            AppError::PageResolutionFailed(format!("page {} does not exist", page_number))
        })?;
        let (width, height) = pdf::page_size(source.document(), page_id);
        let w = ((width * scale).round() as u32).max(1);
        let h = ((height * scale).round() as u32).max(1);
        Ok(RgbImage::from_pixel(w, h, WHITE))
    }
}

/// White page with a light 2px frame, as shown for inserted blanks.
pub fn blank_bitmap(width: u32, height: u32) -> RgbImage {
    let mut img = RgbImage::from_pixel(width.max(1), height.max(1), WHITE);
    let (w, h) = img.dimensions();
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        if x < 2 || y < 2 || x + 2 >= w || y + 2 >= h {
            *pixel = BORDER;
        }
    }
    img
}

#[derive(Clone)]
enum JobSource {
    Cached(Bitmap),
    Pdf { bytes: SourceBytes, page_number: u32 },
    Image(Bitmap),
    Blank { width: u32, height: u32 },
}

/// Everything needed to render one entry, detached from the sequence.
#[derive(Clone)]
pub struct RenderJob {
    pub id: PageId,
    source: JobSource,
}

type Decoded = Result<Arc<SourceDocument>, String>;

impl RenderJob {
    fn run(self, rasterizer: &dyn Rasterizer, scale: f32, decoded: Option<Decoded>) -> AppResult<Bitmap> {
        match self.source {
            JobSource::Cached(bitmap) | JobSource::Image(bitmap) => Ok(bitmap),
            JobSource::Pdf { page_number, .. } => match decoded {
                Some(Ok(source)) => Ok(Arc::new(rasterizer.rasterize(&source, page_number, scale)?)),
                Some(Err(reason)) => Err(AppError::PageResolutionFailed(reason)),
                None => Err(AppError::PageResolutionFailed("document was not decoded".to_string())),
            },
            JobSource::Blank { width, height } => Ok(Arc::new(blank_bitmap(width, height))),
        }
    }
}

/// Documents decoded during one pass, one per distinct byte buffer. The
/// buffer is kept alongside so its key stays valid.
#[derive(Default)]
struct DecodedSources {
    docs: HashMap<usize, (SourceBytes, Decoded)>,
}

impl DecodedSources {
    /// Decodes, concurrently, every buffer in `jobs` not seen before.
    async fn prepare(&mut self, jobs: &[RenderJob]) {
        let mut set = JoinSet::new();
        for job in jobs {
            if let JobSource::Pdf { bytes, .. } = &job.source {
                let key = source_key(bytes);
                if self.docs.contains_key(&key) {
                    continue;
                }
                self.docs.insert(key, (bytes.clone(), Err("decode did not finish".to_string())));
                let bytes = bytes.clone();
                set.spawn_blocking(move || {
                    let decoded = pdf::decode(&bytes)
                        .map(|doc| Arc::new(SourceDocument::new(doc)))
                        .map_err(|e| e.to_string());
                    (key, decoded)
                });
            }
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((key, decoded)) => {
                    if let Some(entry) = self.docs.get_mut(&key) {
                        entry.1 = decoded;
                    }
                }
                Err(e) => log::error!("decode task failed: {}", e),
            }
        }
    }

    fn get(&self, job: &RenderJob) -> Option<Decoded> {
        match &job.source {
            JobSource::Pdf { bytes, .. } => self.docs.get(&source_key(bytes)).map(|(_, d)| d.clone()),
            _ => None,
        }
    }
}

pub struct RenderOutcome {
    pub id: PageId,
    pub result: AppResult<Bitmap>,
}

#[derive(Debug, Default, Serialize)]
pub struct RenderReport {
    pub rendered: usize,
    /// Entries that could not be rendered, with the reason. They keep their
    /// placeholder.
    pub failed: Vec<(PageId, String)>,
    /// Results for entries that were removed or rendered in the meantime.
    pub stale: usize,
}

impl RenderReport {
    /// Stores a batch of results by id.
    pub fn apply(&mut self, sequence: &mut DocumentSequence, outcomes: Vec<RenderOutcome>) {
        for outcome in outcomes {
            match outcome.result {
                Ok(bitmap) => {
                    if sequence.apply_render(outcome.id, bitmap) {
                        self.rendered += 1;
                    } else {
                        self.stale += 1;
                    }
                }
                Err(e) => {
                    log::warn!("failed to render {}: {}", outcome.id, e);
                    self.failed.push((outcome.id, e.to_string()));
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ThumbnailCache {
    rasterizer: Arc<dyn Rasterizer>,
    base: SourceBytes,
    scale: f32,
    eager_count: usize,
    batch_size: usize,
}

impl ThumbnailCache {
    pub fn new(rasterizer: Arc<dyn Rasterizer>, base: SourceBytes, settings: &Settings) -> Self {
        Self {
            rasterizer,
            base,
            scale: settings.thumbnail_scale,
            eager_count: settings.eager_render_count,
            batch_size: settings.render_batch_size.max(1),
        }
    }

    pub fn base(&self) -> &SourceBytes {
        &self.base
    }

    pub fn job(&self, page: &PageSource) -> RenderJob {
        let source = if let Some(bitmap) = page.render_state.bitmap() {
            JobSource::Cached(bitmap.clone())
        } else {
            match &page.kind {
                PageKind::OriginalPage { source_page_number } => JobSource::Pdf {
                    bytes: self.base.clone(),
                    page_number: *source_page_number,
                },
                PageKind::ImportedDocumentPage {
                    bytes, page_number, ..
                } => JobSource::Pdf {
                    bytes: bytes.clone(),
                    page_number: *page_number,
                },
                PageKind::ImportedImage { image, .. } => JobSource::Image(image.clone()),
                PageKind::Blank { width, height } => JobSource::Blank {
                    width: *width,
                    height: *height,
                },
            }
        };
        RenderJob { id: page.id, source }
    }

    /// Renders one entry. Already rendered entries return their cached
    /// bitmap without calling the rasterizer.
    pub async fn render(&self, page: &PageSource) -> AppResult<Bitmap> {
        let mut decoded = DecodedSources::default();
        let mut outcomes = self.render_jobs(vec![self.job(page)], &mut decoded).await;
        match outcomes.pop() {
            Some(outcome) => outcome.result,
            None => Err(AppError::PageResolutionFailed(format!("no render result for {}", page.id))),
        }
    }

    /// Rasterizes jobs concurrently. Outcomes come back in job order; a
    /// failure only affects its own entry.
    async fn render_jobs(&self, jobs: Vec<RenderJob>, decoded: &mut DecodedSources) -> Vec<RenderOutcome> {
        decoded.prepare(&jobs).await;

        let mut set = JoinSet::new();
        let ids: Vec<PageId> = jobs.iter().map(|j| j.id).collect();
        for (i, job) in jobs.into_iter().enumerate() {
            let rasterizer = Arc::clone(&self.rasterizer);
            let scale = self.scale;
            let document = decoded.get(&job);
            set.spawn_blocking(move || (i, job.run(rasterizer.as_ref(), scale, document)));
        }

        let mut results: Vec<Option<AppResult<Bitmap>>> = ids.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, result)) => results[i] = Some(result),
                Err(e) => log::error!("render task failed: {}", e),
            }
        }

        ids.into_iter()
            .zip(results)
            .map(|(id, result)| RenderOutcome {
                id,
                result: result.unwrap_or_else(|| {
                    Err(AppError::PageResolutionFailed(format!("render task for {} did not finish", id)))
                }),
            })
            .collect()
    }

    /// Jobs for every entry still without a thumbnail: the eager prefix
    /// first, then fixed-size background batches.
    pub fn schedule(&self, sequence: &DocumentSequence) -> Vec<Vec<RenderJob>> {
        let pending: Vec<RenderJob> = sequence
            .pages()
            .iter()
            .filter(|p| !p.render_state.is_rendered())
            .map(|p| self.job(p))
            .collect();

        let mut batches = Vec::new();
        let split = self.eager_count.min(pending.len());
        let mut rest = pending;
        let background = rest.split_off(split);
        if !rest.is_empty() {
            batches.push(rest);
        }
        let mut iter = background.into_iter().peekable();
        while iter.peek().is_some() {
            batches.push(iter.by_ref().take(self.batch_size).collect());
        }
        batches
    }

    /// Snapshot of the pending work. The pass owns everything it needs, so
    /// the sequence stays free for editing while it runs.
    pub fn begin(&self, sequence: &DocumentSequence) -> RenderPass {
        RenderPass {
            cache: self.clone(),
            batches: self.schedule(sequence).into(),
            decoded: DecodedSources::default(),
            started: false,
        }
    }

    /// Renders everything pending in one go.
    pub async fn refresh(&self, sequence: &mut DocumentSequence) -> RenderReport {
        let mut pass = self.begin(sequence);
        let mut report = RenderReport::default();
        while let Some(outcomes) = pass.next_batch().await {
            report.apply(sequence, outcomes);
        }
        report
    }
}

pub struct RenderPass {
    cache: ThumbnailCache,
    batches: VecDeque<Vec<RenderJob>>,
    decoded: DecodedSources,
    started: bool,
}

impl RenderPass {
    /// Base document the pass was scheduled against.
    pub fn base(&self) -> &SourceBytes {
        self.cache.base()
    }

    pub fn remaining_batches(&self) -> usize {
        self.batches.len()
    }

    /// Renders the next batch, yielding first unless it is the eager one.
    pub async fn next_batch(&mut self) -> Option<Vec<RenderOutcome>> {
        let batch = self.batches.pop_front()?;
        if self.started {
            tokio::task::yield_now().await;
        }
        self.started = true;
        log::debug!("rendering batch of {} pages", batch.len());
        Some(self.cache.render_jobs(batch, &mut self.decoded).await)
    }
}
