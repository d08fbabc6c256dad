use anyhow::Result;
use clap::Parser;

use testsift::{logging, Cli, Pipeline};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let pipeline = Pipeline::from_cli(cli)?;
    logging::init(pipeline.log_file().as_deref())?;
    pipeline.run()
}
