//! lopdf-backed decode and construction.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use memmap2::Mmap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{AppError, AppResult};

const A4_WIDTH: f32 = 595.28;
const A4_HEIGHT: f32 = 841.89;
const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

fn media_box(width: f32, height: f32) -> Object {
    Object::Array(vec![
        Object::Integer(0),
        Object::Integer(0),
        Object::Real(width),
        Object::Real(height),
    ])
}

// --- Virtual Repair Reader for malformed PDFs ---

/// Reads `data` followed by `patch` without copying either.
struct PatchedReader<'a> {
    data: &'a [u8],
    patch: Vec<u8>,
    pos: usize,
}

impl<'a> PatchedReader<'a> {
    fn new(data: &'a [u8], patch: Vec<u8>) -> Self {
        Self { data, patch, pos: 0 }
    }
}

impl<'a> Read for PatchedReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut n = 0;
        if self.pos < self.data.len() {
            let take = (self.data.len() - self.pos).min(buf.len());
            buf[..take].copy_from_slice(&self.data[self.pos..self.pos + take]);
            self.pos += take;
            n += take;
        }
        if n < buf.len() {
            let patch_pos = self.pos.saturating_sub(self.data.len());
            if patch_pos < self.patch.len() {
                let take = (self.patch.len() - patch_pos).min(buf.len() - n);
                buf[n..n + take].copy_from_slice(&self.patch[patch_pos..patch_pos + take]);
                self.pos += take;
                n += take;
            }
        }
        Ok(n)
    }
}

fn find_start_xref(data: &[u8]) -> Option<u64> {
    let eof_pos = data.windows(5).rposition(|w| w == b"%%EOF")?;

    // startxref sits within 128 bytes before the last %%EOF
    let lookback = eof_pos.saturating_sub(128);
    let s_pos = data[lookback..eof_pos]
        .windows(9)
        .rposition(|w| w == b"startxref")?;

    let digits: String = data[lookback + s_pos + 9..eof_pos]
        .iter()
        .filter(|b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect();
    digits.parse::<u64>().ok()
}

/// Decodes a PDF, retrying with a synthetic trailer when the original one is
/// damaged.
pub fn decode(bytes: &[u8]) -> AppResult<Document> {
    match Document::load_mem(bytes) {
        Ok(doc) => Ok(doc),
        Err(e) => {
            let Some(offset) = find_start_xref(bytes) else {
                return Err(AppError::Pdf(e));
            };
            log::debug!("retrying decode with patched trailer (startxref {})", offset);
            let patch = format!("\n\nstartxref\n{}\n%%EOF", offset).into_bytes();
            Document::load_from(PatchedReader::new(bytes, patch)).map_err(|_| AppError::Pdf(e))
        }
    }
}

// --- Page geometry ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page_number: u32,
    pub width: f32,
    pub height: f32,
    pub is_landscape: bool,
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Real(f) => Some(*f),
        Object::Integer(i) => Some(*i as f32),
        _ => None,
    }
}

fn rect_size(doc: &Document, obj: &Object) -> Option<(f32, f32)> {
    let resolved = match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let nums: Vec<f32> = resolved.as_array().ok()?.iter().filter_map(number).collect();
    if nums.len() != 4 {
        return None;
    }
    Some(((nums[2] - nums[0]).abs(), (nums[3] - nums[1]).abs()))
}

/// MediaBox size of a page, following inheritance. A4 when absent.
pub fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let mut current = Some(page_id);
    let mut depth = 0;
    while let Some(id) = current {
        let Ok(dict) = doc.get_dictionary(id) else {
            break;
        };
        if let Some(size) = dict.get(b"MediaBox").ok().and_then(|o| rect_size(doc, o)) {
            return size;
        }
        depth += 1;
        if depth > 64 {
            break;
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    (A4_WIDTH, A4_HEIGHT)
}

pub fn page_metadata(doc: &Document) -> Vec<PageMetadata> {
    doc.get_pages()
        .into_iter()
        .map(|(page_number, page_id)| {
            let (width, height) = page_size(doc, page_id);
            PageMetadata {
                page_number,
                width,
                height,
                is_landscape: width > height,
            }
        })
        .collect()
}

/// Copies inherited page attributes from the page tree onto each page so the
/// page survives being reparented.
fn push_down_inherited(doc: &mut Document) {
    let page_ids: Vec<ObjectId> = doc.get_pages().values().copied().collect();
    for page_id in page_ids {
        let mut inherited: Vec<(Vec<u8>, Object)> = Vec::new();
        {
            let Ok(page) = doc.get_dictionary(page_id) else {
                continue;
            };
            let mut missing: Vec<&[u8]> = INHERITABLE.iter().copied().filter(|k| !page.has(k)).collect();
            let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
            let mut depth = 0;
            while let Some(pid) = parent {
                if missing.is_empty() || depth > 64 {
                    break;
                }
                depth += 1;
                let Ok(node) = doc.get_dictionary(pid) else {
                    break;
                };
                missing.retain(|key| match node.get(key) {
                    Ok(value) => {
                        inherited.push((key.to_vec(), value.clone()));
                        false
                    }
                    Err(_) => true,
                });
                parent = node.get(b"Parent").and_then(Object::as_reference).ok();
            }
            if missing.contains(&&b"MediaBox"[..]) {
                inherited.push((b"MediaBox".to_vec(), media_box(A4_WIDTH, A4_HEIGHT)));
            }
        }
        if inherited.is_empty() {
            continue;
        }
        if let Ok(page) = doc.get_object_mut(page_id).and_then(|o| o.as_dict_mut()) {
            for (key, value) in inherited {
                page.set(key, value);
            }
        }
    }
}

pub fn encode_jpeg(bitmap: &RgbImage, quality: u8) -> AppResult<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(bitmap)?;
    Ok(buf)
}

// --- Sources ---

static NEXT_SOURCE: AtomicUsize = AtomicUsize::new(1);

/// A decoded input document ready to have its pages copied. Inherited page
/// attributes are pushed down once, at construction.
pub struct SourceDocument {
    key: usize,
    doc: Document,
    pages: BTreeMap<u32, ObjectId>,
    /// Pages and every page-tree node above them.
    tree: HashSet<ObjectId>,
}

impl SourceDocument {
    pub fn new(mut doc: Document) -> Self {
        push_down_inherited(&mut doc);
        let pages = doc.get_pages();
        let mut tree = HashSet::new();
        for &page_id in pages.values() {
            let mut current = Some(page_id);
            while let Some(id) = current {
                if !tree.insert(id) {
                    break;
                }
                current = doc
                    .get_dictionary(id)
                    .and_then(|d| d.get(b"Parent"))
                    .and_then(Object::as_reference)
                    .ok();
            }
        }
        Self {
            key: NEXT_SOURCE.fetch_add(1, Ordering::Relaxed),
            doc,
            pages,
            tree,
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn page_id(&self, page_number: u32) -> Option<ObjectId> {
        self.pages.get(&page_number).copied()
    }
}

// --- Construction ---

/// Builds a new document page by page.
///
/// Copying a page brings along only the objects it reaches. Objects shared
/// by several pages of one source are copied once per output.
pub struct PdfBuilder {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<ObjectId>,
    copied: HashMap<(usize, ObjectId), ObjectId>,
    images: usize,
}

impl Default for PdfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfBuilder {
    pub fn new() -> Self {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
            copied: HashMap::new(),
            images: 0,
        }
    }

    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    /// Appends page `page_number` (1-based) of `source`. A page used twice
    /// gets its own dictionary.
    pub fn add_page_from(&mut self, source: &SourceDocument, page_number: u32) -> AppResult<()> {
        let root = source.page_id(page_number).ok_or_else(|| {
            AppError::PageResolutionFailed(format!("page {} does not exist", page_number))
        })?;
        let id = match self.copied.get(&(source.key, root)) {
            Some(&existing) => {
                let dict = self.doc.get_dictionary(existing)?.clone();
                self.doc.add_object(dict)
            }
            None => self.copy_page(source, root)?,
        };
        self.kids.push(id);
        Ok(())
    }

    fn copy_page(&mut self, source: &SourceDocument, root: ObjectId) -> AppResult<ObjectId> {
        source.doc.get_dictionary(root)?;
        let mut pending = Vec::new();
        let new_root = self.map_id(source.key, root, &mut pending);
        while let Some((old, new)) = pending.pop() {
            let object = source.doc.get_object(old)?;
            let copy = self.remap(source, root, object, &mut pending);
            self.doc.objects.insert(new, copy);
        }
        Ok(new_root)
    }

    fn map_id(&mut self, key: usize, old: ObjectId, pending: &mut Vec<(ObjectId, ObjectId)>) -> ObjectId {
        if let Some(&id) = self.copied.get(&(key, old)) {
            return id;
        }
        let id = self.doc.new_object_id();
        self.copied.insert((key, old), id);
        pending.push((old, id));
        id
    }

    /// Clones `object` with references rewritten into the output. Links to
    /// the page tree or to other pages become null; `save` sets the parent.
    fn remap(
        &mut self,
        source: &SourceDocument,
        root: ObjectId,
        object: &Object,
        pending: &mut Vec<(ObjectId, ObjectId)>,
    ) -> Object {
        match object {
            Object::Reference(id) => {
                if (*id != root && source.tree.contains(id)) || !source.doc.objects.contains_key(id) {
                    Object::Null
                } else {
                    Object::Reference(self.map_id(source.key, *id, pending))
                }
            }
            Object::Array(items) => Object::Array(
                items
                    .iter()
                    .map(|item| self.remap(source, root, item, pending))
                    .collect(),
            ),
            Object::Dictionary(dict) => Object::Dictionary(self.remap_dict(source, root, dict, pending)),
            Object::Stream(stream) => {
                let dict = self.remap_dict(source, root, &stream.dict, pending);
                let mut copy = stream.clone();
                copy.dict = dict;
                Object::Stream(copy)
            }
            other => other.clone(),
        }
    }

    fn remap_dict(
        &mut self,
        source: &SourceDocument,
        root: ObjectId,
        dict: &Dictionary,
        pending: &mut Vec<(ObjectId, ObjectId)>,
    ) -> Dictionary {
        let mut out = Dictionary::new();
        for (key, value) in dict.iter() {
            out.set(key.clone(), self.remap(source, root, value, pending));
        }
        out
    }

    /// Appends a page of `width` x `height` points filled by a JPEG.
    pub fn add_jpeg_page(&mut self, jpeg: Vec<u8>, width: u32, height: u32) -> ObjectId {
        self.images += 1;
        let name = format!("Im{}", self.images);
        let image_id = self.doc.add_object(
            Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => width as i64,
                    "Height" => height as i64,
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8,
                    "Filter" => "DCTDecode",
                },
                jpeg,
            )
            .with_compression(false),
        );
        let content = format!("q {} 0 0 {} 0 0 cm /{} Do Q", width, height, name);
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => media_box(width as f32, height as f32),
            "Resources" => dictionary! {
                "XObject" => dictionary! { name.as_str() => image_id },
            },
            "Contents" => content_id,
        });
        self.kids.push(page_id);
        page_id
    }

    pub fn add_bitmap_page(&mut self, bitmap: &RgbImage, quality: u8) -> AppResult<ObjectId> {
        let jpeg = encode_jpeg(bitmap, quality)?;
        Ok(self.add_jpeg_page(jpeg, bitmap.width(), bitmap.height()))
    }

    /// Appends `page_id` without checking that it exists.
    #[cfg(test)]
    pub(crate) fn push_unchecked_kid(&mut self, page_id: ObjectId) {
        self.kids.push(page_id);
    }

    /// Writes the flattened page tree and serializes the document.
    pub fn save(mut self) -> AppResult<Vec<u8>> {
        for &page_id in &self.kids {
            if let Ok(page) = self.doc.get_object_mut(page_id).and_then(|o| o.as_dict_mut()) {
                page.set("Parent", Object::Reference(self.pages_id));
            }
        }
        let pages_dict = dictionary! {
            "Type" => "Pages",
            "Count" => self.kids.len() as i64,
            "Kids" => self.kids.iter().copied().map(Object::Reference).collect::<Vec<_>>(),
        };
        self.doc
            .objects
            .insert(self.pages_id, Object::Dictionary(pages_dict));

        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);

        self.doc.prune_objects();
        self.doc.renumber_objects();

        let mut buf = Vec::new();
        self.doc.save_to(&mut buf)?;
        Ok(buf)
    }
}

// --- Capability ---

/// Handle on the PDF decode/construct capability. Obtained once per session
/// through [`PdfEngine::init`].
#[derive(Debug, Clone, Copy)]
pub struct PdfEngine {
    _checked: (),
}

impl PdfEngine {
    /// Round-trips a one-page document to make sure construction,
    /// serialization and decoding all work.
    pub fn init() -> AppResult<Self> {
        let mut builder = PdfBuilder::new();
        builder
            .add_bitmap_page(&RgbImage::from_pixel(1, 1, image::Rgb([255, 255, 255])), 90)
            .map_err(|e| AppError::CapabilityUnavailable(e.to_string()))?;
        let bytes = builder
            .save()
            .map_err(|e| AppError::CapabilityUnavailable(e.to_string()))?;
        let pages = decode(&bytes)
            .map_err(|e| AppError::CapabilityUnavailable(e.to_string()))?
            .get_pages()
            .len();
        if pages != 1 {
            return Err(AppError::CapabilityUnavailable(format!(
                "self-test produced {} pages",
                pages
            )));
        }
        Ok(Self { _checked: () })
    }

    pub fn decode(&self, bytes: &[u8]) -> AppResult<Document> {
        decode(bytes)
    }

    pub fn open_source(&self, bytes: &[u8]) -> AppResult<SourceDocument> {
        Ok(SourceDocument::new(decode(bytes)?))
    }

    /// Decodes a file in place through a memory map.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> AppResult<Document> {
        let file = fs::File::open(path)?;
        // Mapping is unsafe because another process could truncate the file
        // while it is being parsed. Accepted for local user files.
        let mmap = unsafe { Mmap::map(&file)? };
        decode(&mmap)
    }

    /// Serializes `builder` and passes the bytes through the validation
    /// gate. Returns the bytes and their page count.
    pub fn finish(&self, builder: PdfBuilder) -> AppResult<(Vec<u8>, usize)> {
        let page_count = builder.page_count();
        let bytes = builder.save()?;
        self.verify_output(&bytes, page_count)?;
        Ok((bytes, page_count))
    }

    pub fn page_count(&self, bytes: &[u8]) -> AppResult<u32> {
        Ok(self.decode(bytes)?.get_pages().len() as u32)
    }

    /// Output validation gate: the bytes must decode to `expected_pages`.
    pub fn verify_output(&self, bytes: &[u8], expected_pages: usize) -> AppResult<()> {
        let doc = decode(bytes).map_err(|e| AppError::MaterializationFailed(e.to_string()))?;
        let pages = doc.get_pages().len();
        if pages != expected_pages {
            return Err(AppError::MaterializationFailed(format!(
                "expected {} pages, decoded {}",
                expected_pages, pages
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};

    /// Document of `widths.len()` pages; page `i` is `widths[i]` points wide,
    /// which lets tests identify pages after reordering.
    pub(crate) fn sample_pdf(widths: &[i64]) -> Vec<u8> {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let mut kids = Vec::new();
        for (i, &width) in widths.iter().enumerate() {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Td", vec![Object::Integer(10), Object::Integer(10)]),
                    Operation::new(
                        "Tj",
                        vec![Object::string_literal(format!("Page {}", i + 1))],
                    ),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => media_box(width as f32, 800.0),
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Count" => kids.len() as i64,
                "Kids" => kids,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    pub(crate) fn widths_of(bytes: &[u8]) -> Vec<i64> {
        let doc = decode(bytes).unwrap();
        page_metadata(&doc)
            .into_iter()
            .map(|m| m.width.round() as i64)
            .collect()
    }

    #[test]
    fn engine_self_test_passes() {
        assert!(PdfEngine::init().is_ok());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode(b"definitely not a pdf"), Err(AppError::Pdf(_))));
    }

    #[test]
    fn finds_startxref_offset() {
        let data = b"%PDF-1.4\n...\nstartxref\n1234\n%%EOF\n";
        assert_eq!(find_start_xref(data), Some(1234));
        assert_eq!(find_start_xref(b"no trailer"), None);
    }

    #[test]
    fn patched_reader_appends_patch() {
        let mut reader = PatchedReader::new(b"abc", b"XYZ".to_vec());
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcXYZ");
    }

    #[test]
    fn builder_reorders_copied_pages() {
        let source = SourceDocument::new(decode(&sample_pdf(&[100, 200, 300])).unwrap());
        let mut builder = PdfBuilder::new();
        builder.add_page_from(&source, 3).unwrap();
        builder.add_page_from(&source, 1).unwrap();
        assert!(matches!(
            builder.add_page_from(&source, 4),
            Err(AppError::PageResolutionFailed(_))
        ));
        let bytes = builder.save().unwrap();
        assert_eq!(widths_of(&bytes), vec![300, 100]);
    }

    #[test]
    fn builder_copies_only_reachable_objects() {
        let source = SourceDocument::new(decode(&sample_pdf(&[100; 50])).unwrap());
        let mut builder = PdfBuilder::new();
        builder.add_page_from(&source, 7).unwrap();
        // The page and its content stream; nothing from the other 49 pages.
        assert_eq!(builder.doc.objects.len(), 2);
        let doc = decode(&builder.save().unwrap()).unwrap();
        let page = doc.get_pages()[&1];
        let content = doc.get_page_content(page).unwrap();
        assert!(String::from_utf8_lossy(&content).contains("Page 7"));
    }

    #[test]
    fn builder_duplicates_repeated_page() {
        let source = SourceDocument::new(decode(&sample_pdf(&[100, 200])).unwrap());
        let mut builder = PdfBuilder::new();
        builder.add_page_from(&source, 2).unwrap();
        builder.add_page_from(&source, 2).unwrap();
        let bytes = builder.save().unwrap();
        assert_eq!(widths_of(&bytes), vec![200, 200]);
    }

    #[test]
    fn builder_embeds_bitmap_page_at_pixel_size() {
        let mut builder = PdfBuilder::new();
        let bitmap = RgbImage::from_pixel(40, 30, image::Rgb([200, 10, 10]));
        builder.add_bitmap_page(&bitmap, 90).unwrap();
        let bytes = builder.save().unwrap();
        let doc = decode(&bytes).unwrap();
        let meta = page_metadata(&doc);
        assert_eq!(meta.len(), 1);
        assert_eq!((meta[0].width, meta[0].height), (40.0, 30.0));
        assert!(meta[0].is_landscape);
    }

    #[test]
    fn inherited_media_box_survives_copy() {
        let mut doc = decode(&sample_pdf(&[100])).unwrap();
        let page_id = doc.get_pages()[&1];
        let parent = doc
            .get_dictionary(page_id)
            .unwrap()
            .get(b"Parent")
            .unwrap()
            .as_reference()
            .unwrap();
        doc.get_object_mut(page_id)
            .unwrap()
            .as_dict_mut()
            .unwrap()
            .remove(b"MediaBox");
        doc.get_object_mut(parent)
            .unwrap()
            .as_dict_mut()
            .unwrap()
            .set("MediaBox", media_box(321.0, 800.0));

        let source = SourceDocument::new(doc);
        let mut builder = PdfBuilder::new();
        builder.add_page_from(&source, 1).unwrap();
        let bytes = builder.save().unwrap();
        assert_eq!(widths_of(&bytes), vec![321]);
    }

    #[test]
    fn verify_output_checks_page_count() {
        let engine = PdfEngine::init().unwrap();
        let bytes = sample_pdf(&[100, 100]);
        assert!(engine.verify_output(&bytes, 2).is_ok());
        assert!(matches!(
            engine.verify_output(&bytes, 3),
            Err(AppError::MaterializationFailed(_))
        ));
        assert!(matches!(
            engine.verify_output(b"broken", 1),
            Err(AppError::MaterializationFailed(_))
        ));
    }

    #[test]
    fn load_file_decodes_mapped_file() {
        let engine = PdfEngine::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.pdf");
        fs::write(&path, sample_pdf(&[100, 200, 300])).unwrap();

        let doc = engine.load_file(&path).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
        assert!(engine.load_file(dir.path().join("missing.pdf")).is_err());
    }
}
