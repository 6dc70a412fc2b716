use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Local file holding one run's export.
///
/// Written once, read back for validation and upload. Dropping it removes the
/// file; `delete` does the same but reports failure.
pub struct TemporaryArtifact {
    file: NamedTempFile,
}

impl TemporaryArtifact {
    pub fn create(dir: Option<&Path>) -> Result<Self> {
        let mut b = tempfile::Builder::new();
        b.prefix("backup-").suffix(".artifact");
        let file = match dir {
            Some(d) => {
                fs::create_dir_all(d)
                    .map_err(|e| Error::io(format!("failed to create {}: {e}", d.display())))?;
                b.tempfile_in(d)
            }
            None => b.tempfile(),
        }
        .map_err(|e| Error::io(format!("failed to create backup artifact: {e}")))?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Fresh handle for the main export write, truncating earlier content.
    pub fn writer(&self) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.path())
            .map_err(|e| Error::io(format!("failed to open {} for writing: {e}", self.path().display())))
    }

    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(self.path())
            .map_err(|e| Error::io(format!("failed to open {} for append: {e}", self.path().display())))?;
        f.write_all(bytes)
            .map_err(|e| Error::io(format!("failed to append to {}: {e}", self.path().display())))
    }

    pub fn open_read(&self) -> Result<File> {
        File::open(self.path())
            .map_err(|e| Error::io(format!("failed to open {} for reading: {e}", self.path().display())))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(fs::metadata(self.path())
            .map_err(|e| Error::io(format!("failed to stat {}: {e}", self.path().display())))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn delete(self) -> std::io::Result<()> {
        self.file.close()
    }
}
