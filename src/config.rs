use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{AppError, AppResult};

/// Tunables shared by the organizer and split sessions.
///
/// Every field has a default, so a settings file only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Entries rendered before the first yield when thumbnails are refreshed.
    pub eager_render_count: usize,
    /// Entries rendered per background batch after the eager prefix.
    pub render_batch_size: usize,
    pub thumbnail_scale: f32,
    /// Pages materialized between cooperative yields.
    pub export_batch_size: usize,
    /// JPEG quality (1-100) for image and blank pages.
    pub jpeg_quality: u8,
    /// Imported images are downscaled by this factor on insert.
    pub imported_image_scale: f32,
    pub blank_page_width: u32,
    pub blank_page_height: u32,
    /// Buffers larger than this are delivered in chunks.
    pub chunk_threshold_bytes: usize,
    pub chunk_size_bytes: usize,
    pub organized_file_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            eager_render_count: 20,
            render_batch_size: 10,
            thumbnail_scale: 1.0,
            export_batch_size: 20,
            jpeg_quality: 90,
            imported_image_scale: 0.8,
            blank_page_width: 595,
            blank_page_height: 842,
            chunk_threshold_bytes: 50 * 1024 * 1024,
            chunk_size_bytes: 512 * 1024,
            organized_file_name: "organized.pdf".to_string(),
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads `path` when given, the defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> AppResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.export_batch_size == 0 || self.render_batch_size == 0 {
            return Err(AppError::Config("Batch sizes must be at least 1.".to_string()));
        }
        if self.chunk_size_bytes == 0 {
            return Err(AppError::Config("Chunk size must be at least 1 byte.".to_string()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(AppError::Config("JPEG quality must be within 1-100.".to_string()));
        }
        if self.thumbnail_scale <= 0.0 || self.imported_image_scale <= 0.0 {
            return Err(AppError::Config("Scales must be positive.".to_string()));
        }
        if self.blank_page_width == 0 || self.blank_page_height == 0 {
            return Err(AppError::Config("Blank page size must be non-zero.".to_string()));
        }
        Ok(())
    }
}
