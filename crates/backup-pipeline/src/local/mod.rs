//! Filesystem-backed collaborators used by `backupd`.

pub mod attachments;
pub mod export;
pub mod format;
pub mod validate;

pub use attachments::{AttachmentRecord, LocalAttachments};
pub use export::DirExporter;
pub use validate::ArtifactValidator;
