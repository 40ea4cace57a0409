use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    episode_outcome_cli::init_tracing();
    let cli = episode_outcome_cli::Cli::parse();
    episode_outcome_cli::run_cli(cli)
}
