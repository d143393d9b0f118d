//! Hands finished outputs to the file-system backend.

use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::materialize::OutputFile;

/// Result of one backend command. Cancellation is not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Done(T),
    Canceled,
    Failed(String),
}

/// Piece of a large buffer. The first chunk creates the file, the rest
/// append to it.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub data: &'a [u8],
    pub is_first: bool,
    pub is_last: bool,
}

/// Privileged side that owns dialogs and disk access.
pub trait Backend: Send + Sync {
    fn show_save_dialog(&self, suggested_name: &str) -> impl Future<Output = Reply<PathBuf>> + Send;

    fn show_folder_dialog(&self) -> impl Future<Output = Reply<PathBuf>> + Send;

    fn write_file(&self, path: &Path, bytes: &[u8]) -> impl Future<Output = Reply<()>> + Send;

    fn append_file(&self, path: &Path, bytes: &[u8]) -> impl Future<Output = Reply<()>> + Send;

    fn exists(&self, path: &Path) -> impl Future<Output = bool> + Send;

    /// Called after each output is fully written. `index` counts from 1.
    fn on_saved(&self, _index: usize, _total: usize, _path: &Path) {}

    fn write_chunk(&self, path: &Path, chunk: Chunk<'_>) -> impl Future<Output = Reply<()>> + Send {
        async move {
            if chunk.is_first {
                self.write_file(path, chunk.data).await
            } else {
                self.append_file(path, chunk.data).await
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Saved { paths: Vec<PathBuf> },
    /// The user dismissed a prompt. Nothing is reported as an error.
    Canceled,
}

/// `report.pdf` -> `report (n).pdf`
pub fn numbered_name(name: &str, n: u32) -> String {
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{} ({}).{}", stem, n, ext),
        None => format!("{} ({})", stem, n),
    }
}

/// First name in `dir` that does not exist yet.
pub async fn unique_path<B: Backend>(backend: &B, dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !backend.exists(&candidate).await {
        return candidate;
    }
    let mut n = 1;
    loop {
        let candidate = dir.join(numbered_name(name, n));
        if !backend.exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

/// Writes `bytes` to `path`, in chunks when above the configured threshold.
async fn transfer<B: Backend>(
    backend: &B,
    settings: &Settings,
    path: &Path,
    bytes: &[u8],
) -> Reply<()> {
    if bytes.len() <= settings.chunk_threshold_bytes {
        return backend.write_file(path, bytes).await;
    }
    let chunks: Vec<&[u8]> = bytes.chunks(settings.chunk_size_bytes.max(1)).collect();
    let total = chunks.len();
    log::debug!("writing {} in {} chunks", path.display(), total);
    for (i, data) in chunks.into_iter().enumerate() {
        let chunk = Chunk {
            data,
            is_first: i == 0,
            is_last: i + 1 == total,
        };
        match backend.write_chunk(path, chunk).await {
            Reply::Done(()) => {}
            other => return other,
        }
    }
    Reply::Done(())
}

/// One buffer, one save prompt.
pub async fn deliver_single<B: Backend>(
    backend: &B,
    settings: &Settings,
    file: &OutputFile,
) -> AppResult<DeliveryOutcome> {
    let path = match backend.show_save_dialog(&file.name).await {
        Reply::Done(path) => path,
        Reply::Canceled => {
            log::info!("save canceled, nothing written");
            return Ok(DeliveryOutcome::Canceled);
        }
        Reply::Failed(message) => return Err(AppError::BackendIo(message)),
    };
    match transfer(backend, settings, &path, &file.bytes).await {
        Reply::Done(()) => {
            log::info!("saved {}", path.display());
            backend.on_saved(1, 1, &path);
            Ok(DeliveryOutcome::Saved { paths: vec![path] })
        }
        Reply::Canceled => Ok(DeliveryOutcome::Canceled),
        Reply::Failed(message) => Err(AppError::BackendIo(message)),
    }
}

/// N buffers, one folder prompt, then sequential collision-safe writes.
pub async fn deliver_many<B: Backend>(
    backend: &B,
    settings: &Settings,
    files: &[OutputFile],
) -> AppResult<DeliveryOutcome> {
    let folder = match backend.show_folder_dialog().await {
        Reply::Done(folder) => folder,
        Reply::Canceled => {
            log::info!("folder selection canceled, nothing written");
            return Ok(DeliveryOutcome::Canceled);
        }
        Reply::Failed(message) => return Err(AppError::BackendIo(message)),
    };

    let mut paths = Vec::with_capacity(files.len());
    for file in files {
        let path = unique_path(backend, &folder, &file.name).await;
        match transfer(backend, settings, &path, &file.bytes).await {
            Reply::Done(()) => {
                backend.on_saved(paths.len() + 1, files.len(), &path);
                paths.push(path);
            }
            Reply::Canceled => {
                log::info!("delivery canceled after {} of {} files", paths.len(), files.len());
                return Ok(DeliveryOutcome::Canceled);
            }
            Reply::Failed(message) => return Err(AppError::BackendIo(message)),
        }
        tokio::task::yield_now().await;
    }
    log::info!("saved {} files into {}", paths.len(), folder.display());
    Ok(DeliveryOutcome::Saved { paths })
}

// --- File-system backend ---

/// Non-interactive backend: the "dialogs" answer with targets chosen up
/// front, `None` meaning the user cancels.
#[derive(Debug, Clone, Default)]
pub struct FsBackend {
    save_target: Option<PathBuf>,
    folder: Option<PathBuf>,
}

impl FsBackend {
    pub fn save_to<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            save_target: Some(path.into()),
            folder: None,
        }
    }

    pub fn into_folder<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            save_target: None,
            folder: Some(dir.into()),
        }
    }

    /// Backend whose prompts are always dismissed.
    pub fn canceling() -> Self {
        Self::default()
    }
}

fn io_reply(result: std::io::Result<()>) -> Reply<()> {
    match result {
        Ok(()) => Reply::Done(()),
        Err(e) => Reply::Failed(e.to_string()),
    }
}

impl Backend for FsBackend {
    async fn show_save_dialog(&self, suggested_name: &str) -> Reply<PathBuf> {
        match &self.save_target {
            Some(path) if path.is_dir() => Reply::Done(path.join(suggested_name)),
            Some(path) => Reply::Done(path.clone()),
            None => Reply::Canceled,
        }
    }

    async fn show_folder_dialog(&self) -> Reply<PathBuf> {
        match &self.folder {
            Some(dir) if dir.is_dir() => Reply::Done(dir.clone()),
            Some(dir) => Reply::Failed(format!("Output path is not a directory: {}", dir.display())),
            None => Reply::Canceled,
        }
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Reply<()> {
        io_reply(tokio::fs::write(path, bytes).await)
    }

    async fn append_file(&self, path: &Path, bytes: &[u8]) -> Reply<()> {
        let result = async {
            let mut file = tokio::fs::OpenOptions::new().append(true).open(path).await?;
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        io_reply(result)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn output(name: &str, bytes: &[u8]) -> OutputFile {
        OutputFile {
            name: name.to_string(),
            bytes: bytes.to_vec(),
            page_count: 1,
            skipped: Vec::new(),
        }
    }

    /// Records chunk markers on top of the file-system backend.
    struct RecordingBackend {
        inner: FsBackend,
        chunks: Mutex<Vec<(usize, bool, bool)>>,
        saved: Mutex<Vec<(usize, usize, PathBuf)>>,
    }

    impl RecordingBackend {
        fn new(inner: FsBackend) -> Self {
            Self {
                inner,
                chunks: Mutex::new(Vec::new()),
                saved: Mutex::new(Vec::new()),
            }
        }
    }

    impl Backend for RecordingBackend {
        async fn show_save_dialog(&self, suggested_name: &str) -> Reply<PathBuf> {
            self.inner.show_save_dialog(suggested_name).await
        }

        async fn show_folder_dialog(&self) -> Reply<PathBuf> {
            self.inner.show_folder_dialog().await
        }

        async fn write_file(&self, path: &Path, bytes: &[u8]) -> Reply<()> {
            self.inner.write_file(path, bytes).await
        }

        async fn append_file(&self, path: &Path, bytes: &[u8]) -> Reply<()> {
            self.inner.append_file(path, bytes).await
        }

        async fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path).await
        }

        fn on_saved(&self, index: usize, total: usize, path: &Path) {
            self.saved.lock().unwrap().push((index, total, path.to_path_buf()));
        }

        async fn write_chunk(&self, path: &Path, chunk: Chunk<'_>) -> Reply<()> {
            self.chunks
                .lock()
                .unwrap()
                .push((chunk.data.len(), chunk.is_first, chunk.is_last));
            if chunk.is_first {
                self.write_file(path, chunk.data).await
            } else {
                self.append_file(path, chunk.data).await
            }
        }
    }

    #[test]
    fn numbered_names_keep_extension() {
        assert_eq!(numbered_name("split_1_pages_1-3.pdf", 2), "split_1_pages_1-3 (2).pdf");
        assert_eq!(numbered_name("README", 1), "README (1)");
    }

    #[tokio::test]
    async fn many_files_avoid_collisions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"existing").unwrap();
        let backend = FsBackend::into_folder(dir.path());

        let outcome = deliver_many(
            &backend,
            &Settings::default(),
            &[output("a.pdf", b"one"), output("a.pdf", b"two")],
        )
        .await
        .unwrap();

        let DeliveryOutcome::Saved { paths } = outcome else {
            panic!("expected saved outcome");
        };
        assert_eq!(paths[0], dir.path().join("a (1).pdf"));
        assert_eq!(paths[1], dir.path().join("a (2).pdf"));
        assert_eq!(std::fs::read(dir.path().join("a.pdf")).unwrap(), b"existing");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"two");
    }

    #[tokio::test]
    async fn canceled_folder_prompt_writes_nothing() {
        let outcome = deliver_many(&FsBackend::canceling(), &Settings::default(), &[output("a.pdf", b"x")])
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Canceled);
    }

    #[tokio::test]
    async fn canceled_save_prompt_is_not_an_error() {
        let outcome = deliver_single(&FsBackend::canceling(), &Settings::default(), &output("o.pdf", b"x"))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Canceled);
    }

    #[tokio::test]
    async fn missing_folder_is_a_backend_error() {
        let backend = FsBackend::into_folder("/definitely/not/here");
        let result = deliver_many(&backend, &Settings::default(), &[output("a.pdf", b"x")]).await;
        assert!(matches!(result, Err(AppError::BackendIo(_))));
    }

    #[tokio::test]
    async fn large_buffers_are_chunked_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("big.pdf");
        let backend = RecordingBackend::new(FsBackend::save_to(&target));
        let settings = Settings {
            chunk_threshold_bytes: 8,
            chunk_size_bytes: 4,
            ..Settings::default()
        };
        let payload: Vec<u8> = (0u8..10).collect();

        let outcome = deliver_single(&backend, &settings, &output("big.pdf", &payload))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Saved { paths: vec![target.clone()] });
        assert_eq!(std::fs::read(&target).unwrap(), payload);
        let chunks = backend.chunks.lock().unwrap().clone();
        assert_eq!(chunks, vec![(4, true, false), (4, false, false), (2, false, true)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_small_chunks_land_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            chunk_threshold_bytes: 4096,
            chunk_size_bytes: 4096,
            ..Settings::default()
        };
        let payload: Vec<u8> = (0..200 * 4096).map(|i| (i / 4096) as u8 ^ (i % 251) as u8).collect();

        for round in 0..5 {
            let target = dir.path().join(format!("big_{}.pdf", round));
            let outcome = deliver_single(&FsBackend::save_to(&target), &settings, &output("big.pdf", &payload))
                .await
                .unwrap();
            assert_eq!(outcome, DeliveryOutcome::Saved { paths: vec![target.clone()] });
            assert_eq!(std::fs::read(&target).unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn each_saved_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new(FsBackend::into_folder(dir.path()));

        deliver_many(
            &backend,
            &Settings::default(),
            &[output("a.pdf", b"one"), output("b.pdf", b"two"), output("c.pdf", b"three")],
        )
        .await
        .unwrap();

        let saved = backend.saved.lock().unwrap().clone();
        assert_eq!(
            saved,
            vec![
                (1, 3, dir.path().join("a.pdf")),
                (2, 3, dir.path().join("b.pdf")),
                (3, 3, dir.path().join("c.pdf")),
            ]
        );
    }
}
