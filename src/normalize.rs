use std::io::{stderr, Write};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::{error, info, warn};

use crate::artifacts::{self, DEDUPED_DATASET, NORMALIZED_DATASET};
use crate::error::FormatError;
use crate::formatter::SourceFormatter;
use crate::model::FileEntry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeCounts {
    pub normalized: usize,
    pub skipped: usize,
}

fn import_alias_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"import\s+([a-zA-Z0-9_]+)\s+as\s+([a-zA-Z0-9_]+)").expect("valid regex")
    })
}

fn triple_single_quote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)'''(.+?)'''").expect("valid regex"))
}

/// Formats `code`, then canonicalizes `import x as y` spacing and rewrites
/// `'''...'''` to `"""..."""` textually. Fails as a whole when the
/// formatter fails.
pub fn normalize_code(formatter: &dyn SourceFormatter, code: &str) -> Result<String, FormatError> {
    let formatted = formatter.format(code)?;
    let formatted = import_alias_re().replace_all(&formatted, "import ${1} as ${2}");
    let formatted = triple_single_quote_re().replace_all(&formatted, "\"\"\"${1}\"\"\"");
    Ok(formatted.into_owned())
}

/// Rewrites every test body in place. A body that cannot be normalized is
/// left untouched and counted as skipped.
pub fn normalize_entries(formatter: &dyn SourceFormatter, data: &mut [FileEntry]) -> NormalizeCounts {
    let mut counts = NormalizeCounts::default();
    let total = data.len();
    for (i, entry) in data.iter_mut().enumerate() {
        report_progress(i + 1, total);
        for test in entry.tests.iter_mut() {
            match normalize_code(formatter, &test.body) {
                Ok(normalized) => {
                    if normalized != test.body {
                        counts.normalized += 1;
                        test.body = normalized;
                    }
                }
                Err(e) => {
                    warn!("Failed to normalize test {}: {e}", test.name);
                    counts.skipped += 1;
                }
            }
        }
    }
    if total > 0 {
        eprintln!();
    }
    counts
}

fn report_progress(done: usize, total: usize) {
    let mut err = stderr().lock();
    let _ = write!(err, "\rNormalizing test code: {done}/{total}");
    let _ = err.flush();
}

pub fn run_normalize(formatter: &dyn SourceFormatter, dataset_dir: &Path) -> Result<NormalizeCounts> {
    let input = dataset_dir.join(DEDUPED_DATASET);
    info!("Loading dataset from {}", input.display());
    let mut data: Vec<FileEntry> = match artifacts::read_json(&input, "Deduplicated dataset") {
        Ok(data) => data,
        Err(e) => {
            error!("Failed to load dataset: {e:#}");
            return Err(e);
        }
    };

    info!("Processing {} entries", data.len());
    let counts = normalize_entries(formatter, &mut data);

    let output = dataset_dir.join(NORMALIZED_DATASET);
    info!("Saving normalized dataset to {}", output.display());
    artifacts::write_json(&output, &data)?;

    info!(
        "Normalization complete: {} tests normalized, {} tests skipped",
        counts.normalized, counts.skipped
    );
    Ok(counts)
}
