use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::writer::OutputFields;

/// One line of the metrics file.
#[derive(Serialize)]
struct Record<'a> {
    sample: u64,
    output_fields: &'a OutputFields,
}

/// Append-only newline-delimited JSON file of snapshots.
///
/// Each record is encoded into a reusable buffer first so a failed encode
/// never leaves a partial line behind.
pub struct FileSink {
    path: PathBuf,
    out: BufWriter<File>,
    line: Vec<u8>,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").field("path", &self.path).finish()
    }
}

impl FileSink {
    /// Opens `path` in append mode, creating it if needed.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            line: Vec::with_capacity(1024),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and flushes it to the file.
    pub fn write_sample(&mut self, sample: u64, output_fields: &OutputFields) -> Result<()> {
        self.line.clear();
        serde_json::to_writer(
            &mut self.line,
            &Record {
                sample,
                output_fields,
            },
        )
        .context("encoding metrics record")?;
        self.line.push(b'\n');

        self.out
            .write_all(&self.line)
            .with_context(|| format!("writing to {}", self.path.display()))?;
        self.out
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;

        Ok(())
    }
}
