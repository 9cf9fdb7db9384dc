// Persisted output sink: one JSON object per line in `status.jsonl`.

use crate::Result;
use somnode_types::StatusLine;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// File name of the persisted output sink inside the status directory.
pub const STATUS_FILE_NAME: &str = "status.jsonl";

/// Append-only handle on `<status_dir>/status.jsonl`, opened once for the
/// life of the status writer.
pub struct StatusFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl StatusFile {
    /// Creates the directory and the file if they don't exist. Existing
    /// content is kept.
    pub fn open(status_dir: &Path) -> Result<Self> {
        fs::create_dir_all(status_dir).map_err(|e| {
            error!("Failed to create status directory {:?}: {}", status_dir, e);
            e
        })?;

        let path = status_dir.join(STATUS_FILE_NAME);
        let file = OpenOptions::new().append(true).create(true).open(&path).map_err(|e| {
            error!("Failed to open or create status file {:?}: {}", path, e);
            e
        })?;
        debug!("Opened status file {:?}", path);

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffers one line. Nothing reaches the disk before `flush`.
    pub fn append(&mut self, line: &StatusLine) -> Result<()> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
