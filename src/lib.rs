//! Paradise Organizer: page reordering and range splitting for PDF documents.
//!
//! Model layer: [`page`], [`sequence`], [`ranges`]. PDF layer: [`pdf`],
//! [`thumbnail`], [`materialize`]. Delivery and lifecycle: [`delivery`],
//! [`session`].

pub mod config;
pub mod delivery;
pub mod error;
pub mod materialize;
pub mod page;
pub mod pdf;
pub mod ranges;
pub mod sequence;
pub mod session;
pub mod thumbnail;

#[cfg(feature = "desktop")]
pub mod desktop;

pub use config::Settings;
pub use delivery::{Backend, DeliveryOutcome, FsBackend, Reply};
pub use error::{AppError, AppResult};
pub use materialize::OutputFile;
pub use page::{PageId, PageKind, PageSource};
pub use pdf::PdfEngine;
pub use ranges::{PageRange, SplitMode, SplitPlan};
pub use sequence::{DocumentSequence, SortDirection};
pub use session::{InputFile, OrganizerSession, SplitSession};
