use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::artifacts::{self, EXTRACTED_DATASET, EXTRACTION_METADATA};
use crate::error::PipelineError;
use crate::model::{ExtractionMetadata, FileEntry};
use crate::scanners::python::{process_repo, RepoOutcome};

pub struct ExtractionOutput {
    pub metadata: ExtractionMetadata,
    pub dataset: Vec<FileEntry>,
}

/// One worker per core, keeping one core for the coordinator.
pub fn worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

pub fn read_repository_list(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(PipelineError::MissingInput {
            what: "Repository list",
            path: path.to_owned(),
        }
        .into());
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read repository list {}", path.display()))?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Scans every repository on a bounded pool and folds the per-repository
/// outcomes, in input order, into corpus-wide results.
pub fn extract_corpus(repos: &[String], clones_dir: &Path, workers: usize) -> Result<ExtractionOutput> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()?;
    let outcomes: Vec<RepoOutcome> = pool.install(|| {
        repos
            .par_iter()
            .map(|repo| process_repo(repo, clones_dir))
            .collect()
    });

    let timestamp = chrono::Local::now().to_rfc3339();
    let mut metadata = ExtractionMetadata::new(timestamp, repos.len());
    let mut dataset = Vec::new();
    for (i, outcome) in outcomes.into_iter().enumerate() {
        info!(
            "[{}/{}] Processed {}: {} test files, {} test functions",
            i + 1,
            repos.len(),
            outcome.repo,
            outcome.metadata.test_files_count(),
            outcome.metadata.test_functions_count()
        );
        metadata.record(&outcome.repo, outcome.metadata);
        dataset.extend(outcome.entries.into_iter().filter(|e| !e.tests.is_empty()));
    }

    Ok(ExtractionOutput { metadata, dataset })
}

pub fn run_extraction(
    repos_file: &Path,
    clones_dir: &Path,
    dataset_dir: &Path,
    workers: usize,
) -> Result<ExtractionOutput> {
    if !clones_dir.exists() {
        return Err(PipelineError::MissingInput {
            what: "Clones directory",
            path: clones_dir.to_owned(),
        }
        .into());
    }
    let repos = read_repository_list(repos_file)?;
    info!("Found {} repositories to process", repos.len());
    info!("Using {workers} workers for parallel processing");

    let output = extract_corpus(&repos, clones_dir, workers)?;

    if output.dataset.is_empty() {
        warn!("No test files were found!");
    } else {
        let path = dataset_dir.join(EXTRACTED_DATASET);
        artifacts::write_json(&path, &output.dataset)?;
        info!("Extracted {} test files to {}", output.dataset.len(), path.display());
    }

    let path = dataset_dir.join(EXTRACTION_METADATA);
    artifacts::write_json(&path, &output.metadata)?;
    info!("Extraction report saved to {}", path.display());

    log_summary(&output.metadata);
    Ok(output)
}

fn log_summary(metadata: &ExtractionMetadata) {
    info!("EXTRACTION SUMMARY:");
    info!("Repositories processed: {}", metadata.total_repositories);
    info!(
        "Repositories with tests: {} ({:.1}%)",
        metadata.successful_repositories,
        metadata.success_rate()
    );
    info!("Total test files found: {}", metadata.total_test_files_found);
    info!(
        "Total test functions found: {}",
        metadata.total_test_functions_found
    );
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::model::RepoMetadata;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn worker_count_leaves_headroom() {
        let workers = worker_count();
        assert!(workers >= 1);
        assert!(workers <= num_cpus::get().max(1));
    }

    #[test]
    fn repository_list_ignores_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repos.txt");
        fs::write(&path, "a/one\n\n  b/two  \n").unwrap();
        assert_eq!(read_repository_list(&path).unwrap(), vec!["a/one", "b/two"]);
    }

    #[test]
    fn corpus_fold_keeps_input_order_and_totals() {
        let dir = tempdir().unwrap();
        write(dir.path(), "one/tests/test_a.py", "def test_a():\n    pass\n");
        write(
            dir.path(),
            "two/test_b.py",
            "def test_b():\n    pass\n\ndef test_c():\n    pass\n",
        );
        let repos = vec![
            "org/one".to_owned(),
            "org/missing".to_owned(),
            "org/two".to_owned(),
        ];

        let output = extract_corpus(&repos, dir.path(), 2).unwrap();
        assert_eq!(output.metadata.total_repositories, 3);
        assert_eq!(output.metadata.successful_repositories, 2);
        assert_eq!(output.metadata.total_test_files_found, 2);
        assert_eq!(output.metadata.total_test_functions_found, 3);
        assert_eq!(
            output.metadata.repositories["org/missing"],
            RepoMetadata::skipped()
        );
        let repos: Vec<_> = output.dataset.iter().map(|e| e.repo.as_str()).collect();
        assert_eq!(repos, vec!["org/one", "org/two"]);
    }

    #[test]
    fn missing_clones_directory_is_fatal() {
        let dir = tempdir().unwrap();
        let err = run_extraction(
            &dir.path().join("repos.txt"),
            &dir.path().join("clones"),
            &dir.path().join("dataset"),
            1,
        )
        .err()
        .unwrap();
        assert!(err.downcast_ref::<PipelineError>().is_some());
    }

    #[test]
    fn empty_results_still_write_metadata() {
        let dir = tempdir().unwrap();
        let clones = dir.path().join("clones");
        fs::create_dir_all(&clones).unwrap();
        let repos_file = dir.path().join("repos.txt");
        fs::write(&repos_file, "org/nothing\n").unwrap();
        let dataset_dir = dir.path().join("dataset");

        let output = run_extraction(&repos_file, &clones, &dataset_dir, 1).unwrap();
        assert!(output.dataset.is_empty());
        assert!(!dataset_dir.join(EXTRACTED_DATASET).exists());
        assert!(dataset_dir.join(EXTRACTION_METADATA).exists());
    }
}
