use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// A single test function or method, carrying its exact source text.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub name: String,
    pub body: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

impl Display for TestRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.file, self.name)
    }
}

/// All tests found in one source file of one repository.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub repo: String,
    pub file: String,
    pub tests: Vec<TestRecord>,
}

impl FileEntry {
    pub fn key(&self) -> String {
        format!("{}:{}", self.repo, self.file)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RepoCounts {
    pub test_files_count: usize,
    pub test_functions_count: usize,
    pub processed_files: usize,
    pub failed_files: Vec<FailedFile>,
    pub failed_files_count: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RepoMetadata {
    Processed(RepoCounts),
    Skipped { error: String },
}

impl RepoMetadata {
    pub fn skipped() -> Self {
        RepoMetadata::Skipped {
            error: "Directory not found".to_owned(),
        }
    }

    pub fn test_files_count(&self) -> usize {
        match self {
            RepoMetadata::Processed(counts) => counts.test_files_count,
            RepoMetadata::Skipped { .. } => 0,
        }
    }

    pub fn test_functions_count(&self) -> usize {
        match self {
            RepoMetadata::Processed(counts) => counts.test_functions_count,
            RepoMetadata::Skipped { .. } => 0,
        }
    }
}

/// Corpus-wide extraction report.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExtractionMetadata {
    pub timestamp: String,
    pub total_repositories: usize,
    pub successful_repositories: usize,
    pub total_test_files_found: usize,
    pub total_test_functions_found: usize,
    pub repositories: BTreeMap<String, RepoMetadata>,
}

impl ExtractionMetadata {
    pub fn new(timestamp: String, total_repositories: usize) -> Self {
        Self {
            timestamp,
            total_repositories,
            successful_repositories: 0,
            total_test_files_found: 0,
            total_test_functions_found: 0,
            repositories: BTreeMap::new(),
        }
    }

    /// Folds one repository's result into the totals.
    pub fn record(&mut self, repo: &str, metadata: RepoMetadata) {
        if metadata.test_files_count() > 0 {
            self.successful_repositories += 1;
            self.total_test_files_found += metadata.test_files_count();
            self.total_test_functions_found += metadata.test_functions_count();
        }
        self.repositories.insert(repo.to_owned(), metadata);
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_repositories == 0 {
            return 0.0;
        }
        self.successful_repositories as f64 / self.total_repositories as f64 * 100.0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RepoDuplicates {
    pub repo: String,
    pub duplicates: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub original_entries: usize,
    pub original_tests: usize,
    pub unique_entries: usize,
    pub unique_tests: usize,
    pub duplicate_entries: usize,
    pub duplicate_tests: usize,
    pub repositories_with_duplicates: usize,
    pub top_duplicate_repos: Vec<RepoDuplicates>,
}

impl DedupStats {
    pub fn removed_percentage(&self) -> f64 {
        if self.original_tests == 0 {
            return 0.0;
        }
        self.duplicate_tests as f64 / self.original_tests as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_is_omitted_when_absent() {
        let record = TestRecord {
            name: "test_a".to_owned(),
            body: "def test_a(): pass".to_owned(),
            file: "tests/test_a.py".to_owned(),
            class: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("class").is_none());

        let parsed: TestRecord =
            serde_json::from_str(r#"{"name":"n","body":"b","file":"f"}"#).unwrap();
        assert_eq!(parsed.class, None);
    }

    #[test]
    fn repo_metadata_is_tagged_by_status() {
        let json = serde_json::to_value(RepoMetadata::skipped()).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["error"], "Directory not found");

        let json = serde_json::to_value(RepoMetadata::Processed(RepoCounts::default())).unwrap();
        assert_eq!(json["status"], "processed");
        assert_eq!(json["failed_files"], serde_json::json!([]));
    }

    #[test]
    fn skipped_repos_contribute_nothing() {
        let mut metadata = ExtractionMetadata::new("now".to_owned(), 2);
        metadata.record("org/missing", RepoMetadata::skipped());
        metadata.record(
            "org/present",
            RepoMetadata::Processed(RepoCounts {
                test_files_count: 2,
                test_functions_count: 5,
                processed_files: 3,
                ..Default::default()
            }),
        );
        assert_eq!(metadata.successful_repositories, 1);
        assert_eq!(metadata.total_test_files_found, 2);
        assert_eq!(metadata.total_test_functions_found, 5);
        assert_eq!(metadata.success_rate(), 50.0);
        assert_eq!(metadata.repositories.len(), 2);
    }
}
