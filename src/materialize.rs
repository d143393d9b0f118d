//! Turns a logical page order or a split plan into PDF bytes.
//!
//! Both paths work from owned snapshots, yield between batches of pages,
//! skip pages that cannot be resolved, and only hand back bytes that
//! decode again.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::page::{source_key, PageKind, PageSource, SourceBytes};
use crate::pdf::{PdfBuilder, PdfEngine, SourceDocument};
use crate::ranges::SplitPlan;
use crate::thumbnail::blank_bitmap;

/// A finished, validated output document.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub page_count: usize,
    /// Pages that were dropped, with the reason.
    pub skipped: Vec<String>,
}

/// Yields to the runtime every `batch_size` pages.
struct Pacer {
    batch_size: usize,
    done: usize,
}

impl Pacer {
    fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            done: 0,
        }
    }

    async fn tick(&mut self) {
        self.done += 1;
        if self.done % self.batch_size == 0 {
            tokio::task::yield_now().await;
        }
    }
}

fn skip(skipped: &mut Vec<String>, reason: String) {
    let err = AppError::PageResolutionFailed(reason);
    log::warn!("{}", err);
    skipped.push(err.to_string());
}

/// True when `pages` is exactly the base document in its original order.
pub fn is_original_order(pages: &[PageSource], base_pages: u32) -> bool {
    pages.len() == base_pages as usize
        && pages
            .iter()
            .enumerate()
            .all(|(i, p)| p.source_page_number() == Some(i as u32 + 1))
}

/// Organizer export. `pages` is the sequence snapshot taken when the export
/// started.
pub async fn materialize_sequence(
    engine: &PdfEngine,
    settings: &Settings,
    base: &SourceBytes,
    base_pages: u32,
    pages: Vec<PageSource>,
) -> AppResult<OutputFile> {
    if pages.is_empty() {
        return Err(AppError::NoContentProduced);
    }
    if is_original_order(&pages, base_pages) {
        log::info!("sequence unchanged, copying {} original bytes", base.len());
        return Ok(OutputFile {
            name: settings.organized_file_name.clone(),
            bytes: base.to_vec(),
            page_count: pages.len(),
            skipped: Vec::new(),
        });
    }

    let mut builder = PdfBuilder::new();
    let mut base_source: Option<AppResult<SourceDocument>> = None;
    let mut imported: HashMap<usize, Option<SourceDocument>> = HashMap::new();
    let mut skipped = Vec::new();
    let mut pacer = Pacer::new(settings.export_batch_size);

    for page in &pages {
        match &page.kind {
            PageKind::OriginalPage { source_page_number } => {
                match base_source.get_or_insert_with(|| engine.open_source(base)) {
                    Ok(source) => {
                        if let Err(e) = builder.add_page_from(source, *source_page_number) {
                            skip(&mut skipped, format!("original page {}: {}", source_page_number, e));
                        }
                    }
                    Err(e) => skip(&mut skipped, format!("base document: {}", e)),
                }
            }
            PageKind::ImportedDocumentPage {
                bytes,
                page_number,
                file_name,
            } => {
                let source = imported.entry(source_key(bytes)).or_insert_with(|| {
                    match engine.open_source(bytes) {
                        Ok(source) => Some(source),
                        Err(e) => {
                            log::warn!("cannot decode inserted document {}: {}", file_name, e);
                            None
                        }
                    }
                });
                match source {
                    Some(source) => {
                        if let Err(e) = builder.add_page_from(source, *page_number) {
                            skip(&mut skipped, format!("{} page {}: {}", file_name, page_number, e));
                        }
                    }
                    None => skip(
                        &mut skipped,
                        format!("{} page {} is unavailable", file_name, page_number),
                    ),
                }
            }
            PageKind::ImportedImage { image, file_name } => {
                if let Err(e) = builder.add_bitmap_page(image, settings.jpeg_quality) {
                    skip(&mut skipped, format!("image {}: {}", file_name, e));
                }
            }
            PageKind::Blank { width, height } => {
                let bitmap = match page.render_state.bitmap() {
                    Some(bitmap) => bitmap.clone(),
                    None => Arc::new(blank_bitmap(*width, *height)),
                };
                if let Err(e) = builder.add_bitmap_page(&bitmap, settings.jpeg_quality) {
                    skip(&mut skipped, format!("blank page: {}", e));
                }
            }
        }
        pacer.tick().await;
    }

    if builder.page_count() == 0 {
        return Err(AppError::NoContentProduced);
    }
    let (bytes, page_count) = engine.finish(builder)?;
    log::info!(
        "organized {} pages ({} skipped, {} bytes)",
        page_count,
        skipped.len(),
        bytes.len()
    );
    Ok(OutputFile {
        name: settings.organized_file_name.clone(),
        bytes,
        page_count,
        skipped,
    })
}

/// Split export. The source is decoded once; each unit gets a fresh output
/// document. Units whose pages all fail are dropped.
pub async fn materialize_split(
    engine: &PdfEngine,
    settings: &Settings,
    source: &[u8],
    plan: &SplitPlan,
) -> AppResult<Vec<OutputFile>> {
    let source = engine.open_source(source)?;
    let mut outputs = Vec::new();
    let mut pacer = Pacer::new(settings.export_batch_size);

    for unit in plan.units() {
        let mut builder = PdfBuilder::new();
        let mut skipped = Vec::new();

        for &page_number in &unit.pages {
            if let Err(e) = builder.add_page_from(&source, page_number) {
                skip(&mut skipped, format!("{} page {}: {}", unit.name, page_number, e));
            }
            pacer.tick().await;
        }

        if builder.page_count() == 0 {
            log::warn!("{} has no resolvable pages, not writing it", unit.name);
            continue;
        }
        let (bytes, page_count) = engine.finish(builder)?;
        log::debug!("{}: {} pages, {} bytes", unit.name, page_count, bytes.len());
        outputs.push(OutputFile {
            name: unit.name,
            bytes,
            page_count,
            skipped,
        });
    }

    if outputs.is_empty() {
        return Err(AppError::NoContentProduced);
    }
    log::info!("split into {} files", outputs.len());
    Ok(outputs)
}
