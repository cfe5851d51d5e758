//! Temporary files produced while parsing a request body.
//!
//! A descriptor owns its temp file from the moment the file is created, which
//! happens before the descriptor is registered. Every descriptor is released at
//! most once: the first of a page relocating the upload, finalize, or a timeout
//! purge takes the file and any later attempt is a no-op.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempPath;

use crate::logging::{LogLevel, Logger};

const TEMP_PREFIX: &str = "pagert_upload_";

#[derive(Debug)]
pub struct UploadFile {
    pub field: String,
    /// File name declared by the client.
    pub name: String,
    pub media_type: String,
    pub temp_path: PathBuf,
    size: AtomicU64,
    released: AtomicBool,
    temp: Mutex<Option<TempPath>>,
}

impl UploadFile {
    /// Creates an empty temp file in `dir` and a descriptor owning it. The returned
    /// handle is for writing the part's bytes.
    pub(crate) fn create(
        dir: &Path,
        field: impl Into<String>,
        name: impl Into<String>,
        media_type: impl Into<String>,
    ) -> io::Result<(Self, std::fs::File)> {
        let (file, temp) = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?
            .into_parts();
        Ok((Self::owning(field, name, media_type, temp), file))
    }

    fn owning(
        field: impl Into<String>,
        name: impl Into<String>,
        media_type: impl Into<String>,
        temp: TempPath,
    ) -> Self {
        UploadFile {
            field: field.into(),
            name: name.into(),
            media_type: media_type.into(),
            temp_path: temp.to_path_buf(),
            size: AtomicU64::new(0),
            released: AtomicBool::new(false),
            temp: Mutex::new(Some(temp)),
        }
    }

    /// Bytes written so far; final once the body parse finished.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn record_written(&self, n: u64) {
        self.size.fetch_add(n, Ordering::AcqRel);
    }

    /// True once the descriptor was consumed or deleted.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Takes the temp file away from the descriptor. Returns `None` if it was
    /// already taken; dropping the returned path deletes the file.
    pub(crate) fn take(&self) -> Option<TempPath> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        match self.temp.lock() {
            Ok(mut temp) => temp.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Deletes the temporary file if nothing took it before. Failures are logged
    /// and otherwise ignored.
    pub fn delete(&self, logger: &dyn Logger, site: &str) -> bool {
        let Some(temp) = self.take() else {
            return false;
        };
        match temp.close() {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => {
                logger.log(
                    LogLevel::Warn,
                    site,
                    &format!(
                        "could not delete upload temp file {}: {err}",
                        self.temp_path.display()
                    ),
                );
                false
            }
        }
    }
}

/// All uploads of one request, in creation order.
#[derive(Debug, Clone, Default)]
pub struct UploadLedger {
    files: Arc<Mutex<Vec<Arc<UploadFile>>>>,
}

impl UploadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, file: UploadFile) -> Arc<UploadFile> {
        let file = Arc::new(file);
        self.with_files(|files| files.push(file.clone()));
        file
    }

    pub fn files(&self) -> Vec<Arc<UploadFile>> {
        self.with_files(|files| files.clone())
    }

    pub fn by_field(&self, field: &str) -> Vec<Arc<UploadFile>> {
        self.with_files(|files| {
            files
                .iter()
                .filter(|f| f.field == field)
                .cloned()
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.with_files(|files| files.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes every descriptor not yet taken. Returns how many files were removed.
    pub fn purge(&self, logger: &dyn Logger, site: &str) -> usize {
        self.files()
            .iter()
            .filter(|f| f.delete(logger, site))
            .count()
    }

    fn with_files<R>(&self, f: impl FnOnce(&mut Vec<Arc<UploadFile>>) -> R) -> R {
        match self.files.lock() {
            Ok(mut files) => f(&mut files),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}
