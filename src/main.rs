//! Command-line entry point for the strainscope toolkit.

use anyhow::Result;
use clap::Parser;
use log::info;

use strainscope::cli::{run_cli, Cli};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .build_global()?;
    info!("Using {} thread(s)", cli.threads);

    run_cli(cli)
}
