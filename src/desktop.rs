//! Tauri plugin exposing the organizer and split sessions to a webview.
//!
//! Register with `.plugin(paradise_organizer::desktop::init())`. The host
//! app must also register `tauri_plugin_dialog::init()` and grant
//! `organizer:default` in its capability file.

use std::path::{Path, PathBuf};
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Emitter, Manager, Runtime, State};
use tauri_plugin_dialog::DialogExt;
use tokio::sync::{oneshot, Mutex};

use crate::config::Settings;
use crate::delivery::{Backend, DeliveryOutcome, FsBackend, Reply};
use crate::error::{AppError, AppResult};
use crate::page::{PageId, PageSummary};
use crate::ranges::{OutputUnit, SplitMode};
use crate::sequence::SortDirection;
use crate::session::{InputFile, OrganizerSession, SplitSession};
use crate::thumbnail::RenderReport;
use crate::PdfEngine;

// --- Dialog backend ---

/// Native dialogs for the prompts; disk access goes through [`FsBackend`].
pub struct DialogBackend<R: Runtime> {
    app: AppHandle<R>,
    files: FsBackend,
    progress_event: Option<&'static str>,
}

impl<R: Runtime> DialogBackend<R> {
    pub fn new(app: AppHandle<R>) -> Self {
        Self {
            app,
            files: FsBackend::default(),
            progress_event: None,
        }
    }

    /// Emits `event` with the number of files written after each one.
    pub fn with_progress(mut self, event: &'static str) -> Self {
        self.progress_event = Some(event);
        self
    }
}

fn picked(answer: Result<Option<tauri_plugin_dialog::FilePath>, oneshot::error::RecvError>) -> Reply<PathBuf> {
    match answer {
        Ok(Some(path)) => match path.into_path() {
            Ok(path) => Reply::Done(path),
            Err(e) => Reply::Failed(e.to_string()),
        },
        Ok(None) => Reply::Canceled,
        Err(_) => Reply::Failed("Dialog closed without an answer".to_string()),
    }
}

impl<R: Runtime> Backend for DialogBackend<R> {
    async fn show_save_dialog(&self, suggested_name: &str) -> Reply<PathBuf> {
        let (tx, rx) = oneshot::channel();
        self.app
            .dialog()
            .file()
            .set_file_name(suggested_name)
            .add_filter("PDF", &["pdf"])
            .save_file(move |path| {
                let _ = tx.send(path);
            });
        picked(rx.await)
    }

    async fn show_folder_dialog(&self) -> Reply<PathBuf> {
        let (tx, rx) = oneshot::channel();
        self.app.dialog().file().pick_folder(move |path| {
            let _ = tx.send(path);
        });
        picked(rx.await)
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> Reply<()> {
        self.files.write_file(path, bytes).await
    }

    async fn append_file(&self, path: &Path, bytes: &[u8]) -> Reply<()> {
        self.files.append_file(path, bytes).await
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.exists(path).await
    }

    fn on_saved(&self, index: usize, _total: usize, _path: &Path) {
        if let Some(event) = self.progress_event {
            let _ = self.app.emit(event, index as u32);
        }
    }
}

// --- State ---

pub struct DesktopState {
    engine: PdfEngine,
    settings: Settings,
    organizer: Mutex<Option<OrganizerSession>>,
    split: Mutex<Option<SplitSession>>,
}

fn no_session(kind: &str) -> AppError {
    AppError::InvalidDocument(format!("No {} document is open", kind))
}

// --- Organizer commands ---

#[tauri::command]
async fn organizer_open(path: String, state: State<'_, DesktopState>) -> AppResult<Vec<PageSummary>> {
    let file = InputFile::read(&path)?;
    let session = OrganizerSession::open(state.engine, state.settings.clone(), file.bytes)?;
    let pages = session.summaries();
    *state.organizer.lock().await = Some(session);
    Ok(pages)
}

#[tauri::command]
async fn organizer_pages(state: State<'_, DesktopState>) -> AppResult<Vec<PageSummary>> {
    let guard = state.organizer.lock().await;
    let session = guard.as_ref().ok_or_else(|| no_session("organizer"))?;
    Ok(session.summaries())
}

#[tauri::command]
async fn organizer_insert_files(
    position: usize,
    paths: Vec<String>,
    state: State<'_, DesktopState>,
) -> AppResult<Vec<PageSummary>> {
    let mut files = Vec::new();
    for path in &paths {
        match InputFile::read(path) {
            Ok(file) => files.push(file),
            Err(e) => log::warn!("skipping {}: {}", path, e),
        }
    }
    let mut guard = state.organizer.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("organizer"))?;
    session.insert_files(position, files);
    Ok(session.summaries())
}

#[tauri::command]
async fn organizer_insert_blank(position: usize, state: State<'_, DesktopState>) -> AppResult<Vec<PageSummary>> {
    let mut guard = state.organizer.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("organizer"))?;
    session.insert_blank(position);
    Ok(session.summaries())
}

#[tauri::command]
async fn organizer_remove(id: PageId, state: State<'_, DesktopState>) -> AppResult<Vec<PageSummary>> {
    let mut guard = state.organizer.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("organizer"))?;
    session.remove(id);
    Ok(session.summaries())
}

#[tauri::command]
async fn organizer_move(
    id: PageId,
    destination: usize,
    state: State<'_, DesktopState>,
) -> AppResult<Vec<PageSummary>> {
    let mut guard = state.organizer.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("organizer"))?;
    session.move_page(id, destination);
    Ok(session.summaries())
}

#[tauri::command]
async fn organizer_sort(direction: SortDirection, state: State<'_, DesktopState>) -> AppResult<Vec<PageSummary>> {
    let mut guard = state.organizer.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("organizer"))?;
    session.sort(direction);
    Ok(session.summaries())
}

#[tauri::command]
async fn organizer_reset(state: State<'_, DesktopState>) -> AppResult<Vec<PageSummary>> {
    let mut guard = state.organizer.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("organizer"))?;
    session.reset_order();
    Ok(session.summaries())
}

#[tauri::command]
async fn organizer_clear(state: State<'_, DesktopState>) -> AppResult<Vec<PageSummary>> {
    let mut guard = state.organizer.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("organizer"))?;
    session.clear_all();
    Ok(session.summaries())
}

/// Renders pending thumbnails batch by batch. The session is only locked to
/// schedule and to store each batch, so edits can interleave.
#[tauri::command]
async fn organizer_render<R: Runtime>(app: AppHandle<R>, state: State<'_, DesktopState>) -> AppResult<RenderReport> {
    let mut pass = {
        let guard = state.organizer.lock().await;
        guard.as_ref().ok_or_else(|| no_session("organizer"))?.begin_render()
    };
    let mut report = RenderReport::default();
    while let Some(outcomes) = pass.next_batch().await {
        let ids: Vec<PageId> = outcomes.iter().map(|o| o.id).collect();
        let mut guard = state.organizer.lock().await;
        match guard.as_mut() {
            Some(session) => session.apply_renders(&pass, outcomes, &mut report),
            None => {
                report.stale += outcomes.len();
                break;
            }
        }
        drop(guard);
        let _ = app.emit("thumbnails-rendered", ids);
    }
    Ok(report)
}

/// PNG bytes of one page's thumbnail, or `None` before it is rendered.
#[tauri::command]
async fn organizer_thumbnail(id: PageId, state: State<'_, DesktopState>) -> AppResult<Option<Vec<u8>>> {
    let guard = state.organizer.lock().await;
    let session = guard.as_ref().ok_or_else(|| no_session("organizer"))?;
    session.thumbnail_png(id)
}

#[tauri::command]
async fn organizer_save<R: Runtime>(app: AppHandle<R>, state: State<'_, DesktopState>) -> AppResult<DeliveryOutcome> {
    let guard = state.organizer.lock().await;
    let session = guard.as_ref().ok_or_else(|| no_session("organizer"))?;
    session.save(&DialogBackend::new(app)).await
}

#[tauri::command]
async fn organizer_close(state: State<'_, DesktopState>) -> AppResult<()> {
    state.organizer.lock().await.take();
    Ok(())
}

// --- Split commands ---

#[tauri::command]
async fn split_open(path: String, state: State<'_, DesktopState>) -> AppResult<u32> {
    let file = InputFile::read(&path)?;
    let session = SplitSession::open(state.engine, state.settings.clone(), file.bytes)?;
    let total = session.total_pages();
    *state.split.lock().await = Some(session);
    Ok(total)
}

#[tauri::command]
async fn split_preview(
    mode: SplitMode,
    include_remainder: bool,
    state: State<'_, DesktopState>,
) -> AppResult<Vec<OutputUnit>> {
    let mut guard = state.split.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("split"))?;
    session.set_mode(mode);
    session.preview(include_remainder)
}

#[tauri::command]
async fn split_execute<R: Runtime>(
    app: AppHandle<R>,
    mode: SplitMode,
    include_remainder: bool,
    state: State<'_, DesktopState>,
) -> AppResult<DeliveryOutcome> {
    let mut guard = state.split.lock().await;
    let session = guard.as_mut().ok_or_else(|| no_session("split"))?;
    session.set_mode(mode);
    let backend = DialogBackend::new(app).with_progress("split-progress");
    session.execute(&backend, include_remainder).await
}

#[tauri::command]
async fn split_close(state: State<'_, DesktopState>) -> AppResult<()> {
    state.split.lock().await.take();
    Ok(())
}

pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("organizer")
        .invoke_handler(tauri::generate_handler![
            organizer_open,
            organizer_pages,
            organizer_insert_files,
            organizer_insert_blank,
            organizer_remove,
            organizer_move,
            organizer_sort,
            organizer_reset,
            organizer_clear,
            organizer_render,
            organizer_thumbnail,
            organizer_save,
            organizer_close,
            split_open,
            split_preview,
            split_execute,
            split_close,
        ])
        .setup(|app, _api| {
            let settings = Settings::load_or_default(None)?;
            let engine = PdfEngine::init()?;
            app.manage(DesktopState {
                engine,
                settings,
                organizer: Mutex::new(None),
                split: Mutex::new(None),
            });
            Ok(())
        })
        .build()
}
