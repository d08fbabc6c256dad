use std::ffi::OsStr;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ExtractError;
use crate::model::{FailedFile, FileEntry, RepoCounts, RepoMetadata, TestRecord};
use crate::py_parser;

/// What one worker hands back to the coordinator for one repository.
#[derive(Debug)]
pub struct RepoOutcome {
    pub repo: String,
    pub metadata: RepoMetadata,
    pub entries: Vec<FileEntry>,
}

/// A `.py` file qualifies when its name or one of its directories (relative
/// to the repository root) mentions "test".
pub fn is_candidate(relative: &Path) -> bool {
    relative.extension().and_then(OsStr::to_str) == Some("py")
        && relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().to_lowercase().contains("test"))
}

pub fn collect_python_test_files(root: &Path) -> Vec<PathBuf> {
    let mut tests = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable path under {}: {e}", root.display());
                continue;
            }
        };
        // Symlinked files are read through their target; directories are not followed.
        if !entry.path().is_file() {
            continue;
        }
        let path = entry.path();
        if let Ok(relative) = path.strip_prefix(root) {
            if is_candidate(relative) {
                tests.push(path.to_owned());
            }
        }
    }
    tests
}

/// Local clone directory for a repository identifier such as `owner/name`.
pub fn repo_dir(repo: &str, clones_dir: &Path) -> PathBuf {
    clones_dir.join(repo.rsplit('/').next().unwrap_or(repo))
}

pub fn process_repo(repo: &str, clones_dir: &Path) -> RepoOutcome {
    let repo_path = repo_dir(repo, clones_dir);
    if !repo_path.is_dir() {
        debug!("{repo}: no clone at {}", repo_path.display());
        return RepoOutcome {
            repo: repo.to_owned(),
            metadata: RepoMetadata::skipped(),
            entries: Vec::new(),
        };
    }

    let (counts, entries) = scan_repository(repo, &repo_path);
    RepoOutcome {
        repo: repo.to_owned(),
        metadata: RepoMetadata::Processed(counts),
        entries,
    }
}

fn scan_repository(repo: &str, repo_path: &Path) -> (RepoCounts, Vec<FileEntry>) {
    let mut counts = RepoCounts::default();
    let mut entries = Vec::new();

    for test_file in collect_python_test_files(repo_path) {
        counts.processed_files += 1;
        let relative_path = test_file
            .strip_prefix(repo_path)
            .unwrap_or(&test_file)
            .to_string_lossy()
            .into_owned();

        let tests = match extract_guarded(&test_file) {
            Ok(tests) => tests,
            Err(error) => {
                debug!("{repo}: {relative_path}: {error}");
                counts.failed_files.push(FailedFile {
                    file: relative_path,
                    error: error.to_string(),
                });
                continue;
            }
        };

        if !tests.is_empty() {
            counts.test_files_count += 1;
            counts.test_functions_count += tests.len();
            entries.push(FileEntry {
                repo: repo.to_owned(),
                file: relative_path,
                tests,
            });
        }
    }

    counts.failed_files_count = counts.failed_files.len();
    (counts, entries)
}

/// Runs extraction for one file, turning a panic inside the parser into a
/// per-file failure so the rest of the repository is still processed.
fn extract_guarded(path: &Path) -> Result<Vec<TestRecord>, ExtractError> {
    guarded(|| py_parser::find_tests_in_source(path))
}

fn guarded<F>(extract: F) -> Result<Vec<TestRecord>, ExtractError>
where
    F: FnOnce() -> Result<Vec<TestRecord>, ExtractError>,
{
    panic::catch_unwind(AssertUnwindSafe(extract)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned());
        Err(ExtractError::Processing(message))
    })
}
