use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::PipelineError;

pub const EXTRACTED_DATASET: &str = "python_tests.json";
pub const EXTRACTION_METADATA: &str = "extraction_metadata.json";
pub const DEDUPED_DATASET: &str = "python_tests_deduped.json";
pub const DEDUP_STATS: &str = "deduplication_stats.json";
pub const NORMALIZED_DATASET: &str = "python_tests_normalized.json";

/// Writes pretty-printed JSON next to `path` and renames it into place, so
/// readers never observe a partially written artifact.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    tmp.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Loads a mandatory JSON input. A missing file is a [`PipelineError`].
pub fn read_json<T: DeserializeOwned>(path: &Path, what: &'static str) -> Result<T> {
    if !path.exists() {
        return Err(PipelineError::MissingInput {
            what,
            path: path.to_owned(),
        }
        .into());
    }
    let f = File::open(path)?;
    serde_json::from_reader(BufReader::new(f))
        .with_context(|| format!("failed to load {}", path.display()))
}
