use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::artifacts::{self, DEDUPED_DATASET, DEDUP_STATS, EXTRACTED_DATASET};
use crate::model::{DedupStats, FileEntry, RepoDuplicates, TestRecord};

const TOP_REPOS: usize = 10;

pub struct DedupOutput {
    pub dataset: Vec<FileEntry>,
    pub stats: DedupStats,
}

/// Keeps the first record seen for every distinct body. Later records with
/// the same body are counted against the repository holding them.
///
/// An entry survives when it still owns at least one canonical record, and
/// only the first appearance of a `repo:file` key is ever emitted.
pub fn deduplicate(data: &[FileEntry]) -> DedupOutput {
    let mut canonical: HashMap<&str, (usize, usize)> = HashMap::new();
    let mut repo_duplicates: Vec<RepoDuplicates> = Vec::new();
    let mut repo_index: HashMap<&str, usize> = HashMap::new();

    for (entry_idx, entry) in data.iter().enumerate() {
        for (test_idx, test) in entry.tests.iter().enumerate() {
            match canonical.entry(test.body.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert((entry_idx, test_idx));
                }
                Entry::Occupied(_) => {
                    let idx = *repo_index.entry(entry.repo.as_str()).or_insert_with(|| {
                        repo_duplicates.push(RepoDuplicates {
                            repo: entry.repo.clone(),
                            duplicates: 0,
                        });
                        repo_duplicates.len() - 1
                    });
                    repo_duplicates[idx].duplicates += 1;
                }
            }
        }
    }

    let mut seen_files = HashSet::new();
    let mut dataset = Vec::new();
    for (entry_idx, entry) in data.iter().enumerate() {
        let tests: Vec<TestRecord> = entry
            .tests
            .iter()
            .enumerate()
            .filter(|(test_idx, test)| {
                canonical.get(test.body.as_str()) == Some(&(entry_idx, *test_idx))
            })
            .map(|(_, test)| test.clone())
            .collect();

        if !tests.is_empty() && seen_files.insert(entry.key()) {
            dataset.push(FileEntry {
                repo: entry.repo.clone(),
                file: entry.file.clone(),
                tests,
            });
        }
    }

    let original_tests = data.iter().map(|e| e.tests.len()).sum();
    let repositories_with_duplicates = repo_duplicates.len();
    // Stable sort: ties stay in the order the repositories first had a duplicate.
    repo_duplicates.sort_by(|a, b| b.duplicates.cmp(&a.duplicates));
    repo_duplicates.truncate(TOP_REPOS);

    let stats = DedupStats {
        original_entries: data.len(),
        original_tests,
        unique_entries: dataset.len(),
        unique_tests: canonical.len(),
        duplicate_entries: data.len() - dataset.len(),
        duplicate_tests: original_tests - canonical.len(),
        repositories_with_duplicates,
        top_duplicate_repos: repo_duplicates,
    };

    DedupOutput { dataset, stats }
}

pub fn run_dedup(dataset_dir: &Path) -> Result<DedupOutput> {
    info!("Loading dataset...");
    let data: Vec<FileEntry> =
        artifacts::read_json(&dataset_dir.join(EXTRACTED_DATASET), "Extracted dataset")?;
    let repo_count = data.iter().map(|e| e.repo.as_str()).collect::<HashSet<_>>().len();
    info!("Loaded {} test entries from {repo_count} repositories", data.len());

    info!("Deduplicating tests...");
    let output = deduplicate(&data);

    artifacts::write_json(&dataset_dir.join(DEDUPED_DATASET), &output.dataset)?;
    let stats_path = dataset_dir.join(DEDUP_STATS);
    artifacts::write_json(&stats_path, &output.stats)?;

    log_summary(&output.stats);
    info!("Detailed statistics saved to {}", stats_path.display());
    Ok(output)
}

fn log_summary(stats: &DedupStats) {
    info!("DEDUPLICATION SUMMARY:");
    info!(
        "Original dataset: {} entries with {} tests",
        stats.original_entries, stats.original_tests
    );
    info!(
        "Deduplicated dataset: {} entries with {} tests",
        stats.unique_entries, stats.unique_tests
    );
    info!(
        "Removed {} duplicate tests ({:.1}%)",
        stats.duplicate_tests,
        stats.removed_percentage()
    );
    info!(
        "Found duplicates in {} repositories",
        stats.repositories_with_duplicates
    );
    if !stats.top_duplicate_repos.is_empty() {
        info!("Top repositories with duplicates:");
        for top in stats.top_duplicate_repos.iter().take(5) {
            info!("  {}: {} duplicates", top.repo, top.duplicates);
        }
    }
}
