use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::config::{load_configuration, ConfigOrigin, PipelineConfig};
use crate::formatter::build_formatter;

pub mod artifacts;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod formatter;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod py_parser;
pub mod scanners;

const NORMALIZE_LOG: &str = "normalize.log";

#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[arg(
        short,
        long,
        value_name = "Config file",
        help = "Read pipeline locations from this file instead of the default config"
    )]
    config_file: Option<PathBuf>,

    #[arg(long, value_name = "Log file", help = "Mirror log output to this file")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stage {
    Extract,
    Dedup,
    Normalize,
    Run,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Extract test functions from every cloned repository")]
    Extract(ExtractArgs),
    #[command(about = "Drop tests whose body was already seen elsewhere in the corpus")]
    Dedup(DatasetArgs),
    #[command(about = "Reformat every surviving test body")]
    Normalize(NormalizeArgs),
    #[command(about = "Run extract, dedup and normalize in sequence")]
    Run(RunArgs),
}

#[derive(Args)]
struct DatasetArgs {
    #[arg(long, value_name = "Directory for dataset artifacts")]
    dataset_dir: Option<PathBuf>,
}

#[derive(Args)]
struct ExtractArgs {
    #[arg(long, value_name = "Repository list")]
    repos_file: Option<PathBuf>,

    #[arg(long, value_name = "Directory holding one clone per repository")]
    clones_dir: Option<PathBuf>,

    #[command(flatten)]
    dataset: DatasetArgs,
}

#[derive(Args)]
struct NormalizeArgs {
    #[command(flatten)]
    dataset: DatasetArgs,

    #[arg(long, value_name = "Directory for log files")]
    log_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    extract: ExtractArgs,

    #[arg(long, value_name = "Directory for log files")]
    log_dir: Option<PathBuf>,
}

fn override_path(slot: &mut PathBuf, value: Option<PathBuf>) {
    if let Some(p) = value {
        *slot = p;
    }
}

impl ExtractArgs {
    fn apply(self, config: &mut PipelineConfig) {
        override_path(&mut config.repos_file, self.repos_file);
        override_path(&mut config.clones_dir, self.clones_dir);
        override_path(&mut config.dataset_dir, self.dataset.dataset_dir);
    }
}

impl Command {
    /// Folds the subcommand's flags into `config` and names the stage to run.
    fn apply(self, config: &mut PipelineConfig) -> Stage {
        match self {
            Command::Extract(args) => {
                args.apply(config);
                Stage::Extract
            }
            Command::Dedup(args) => {
                override_path(&mut config.dataset_dir, args.dataset_dir);
                Stage::Dedup
            }
            Command::Normalize(args) => {
                override_path(&mut config.dataset_dir, args.dataset.dataset_dir);
                override_path(&mut config.log_dir, args.log_dir);
                Stage::Normalize
            }
            Command::Run(args) => {
                args.extract.apply(config);
                override_path(&mut config.log_dir, args.log_dir);
                Stage::Run
            }
        }
    }
}

pub struct Pipeline {
    stage: Stage,
    config: PipelineConfig,
    origin: Option<ConfigOrigin>,
    log_file: Option<PathBuf>,
}

impl Pipeline {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let (mut config, origin) = load_configuration(cli.config_file.as_deref())?;
        let stage = cli.command.apply(&mut config);
        let mut pipeline = Self::new(stage, config, cli.log_file);
        pipeline.origin = Some(origin);
        Ok(pipeline)
    }

    pub fn new(stage: Stage, config: PipelineConfig, log_file: Option<PathBuf>) -> Self {
        Self {
            stage,
            config,
            origin: None,
            log_file,
        }
    }

    /// Normalization always keeps a log artifact; other stages only log to a
    /// file when asked to.
    pub fn log_file(&self) -> Option<PathBuf> {
        match (&self.log_file, self.stage) {
            (Some(p), _) => Some(p.clone()),
            (None, Stage::Normalize | Stage::Run) => Some(self.config.log_dir.join(NORMALIZE_LOG)),
            (None, _) => None,
        }
    }

    pub fn run(&self) -> Result<()> {
        if let Some(origin) = &self.origin {
            info!("{origin}");
        }
        let result = match self.stage {
            Stage::Extract => self.extract().map(|_| ()),
            Stage::Dedup => self.dedup(),
            Stage::Normalize => self.normalize(),
            Stage::Run => self.run_all(),
        };
        result?;
        info!("Done!");
        Ok(())
    }

    fn extract(&self) -> Result<extract::ExtractionOutput> {
        extract::run_extraction(
            &self.config.repos_file,
            &self.config.clones_dir,
            &self.config.dataset_dir,
            extract::worker_count(),
        )
    }

    fn dedup(&self) -> Result<()> {
        dedup::run_dedup(&self.config.dataset_dir).map(|_| ())
    }

    fn normalize(&self) -> Result<()> {
        let formatter = build_formatter(&self.config.formatter)?;
        normalize::run_normalize(formatter.as_ref(), &self.config.dataset_dir).map(|_| ())
    }

    fn run_all(&self) -> Result<()> {
        if self.extract()?.dataset.is_empty() {
            info!("Nothing extracted, skipping deduplication and normalization");
            return Ok(());
        }
        self.dedup()?;
        self.normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("testsift").chain(args.iter().copied()))
    }

    #[test]
    fn subcommands_only_accept_their_own_locations() {
        assert!(parse(&["dedup", "--clones-dir", "/c"]).is_err());
        assert!(parse(&["dedup", "--log-dir", "/l"]).is_err());
        assert!(parse(&["normalize", "--repos-file", "r.txt"]).is_err());
        assert!(parse(&["extract", "--log-dir", "/l"]).is_err());
    }

    #[test]
    fn flags_override_configured_locations() {
        let cli = parse(&["run", "--clones-dir", "/c", "--dataset-dir", "/d", "--log-dir", "/l"]).unwrap();
        let mut config = PipelineConfig::default();
        assert_eq!(cli.command.apply(&mut config), Stage::Run);
        assert_eq!(config.clones_dir, PathBuf::from("/c"));
        assert_eq!(config.dataset_dir, PathBuf::from("/d"));
        assert_eq!(config.log_dir, PathBuf::from("/l"));
        assert_eq!(config.repos_file, PipelineConfig::default().repos_file);

        let cli = parse(&["dedup", "--dataset-dir", "/d2"]).unwrap();
        let mut config = PipelineConfig::default();
        assert_eq!(cli.command.apply(&mut config), Stage::Dedup);
        assert_eq!(config.dataset_dir, PathBuf::from("/d2"));
    }

    #[test]
    fn config_origin_is_kept_until_logging_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"log_dir": "/var/log/testsift"}"#).unwrap();

        let cli = parse(&["-c", path.to_str().unwrap(), "normalize"]).unwrap();
        let pipeline = Pipeline::from_cli(cli).unwrap();
        assert_eq!(pipeline.origin, Some(ConfigOrigin::Custom(path)));
        assert_eq!(
            pipeline.log_file(),
            Some(PathBuf::from("/var/log/testsift/normalize.log"))
        );
    }
}
