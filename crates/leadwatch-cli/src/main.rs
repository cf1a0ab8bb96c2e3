use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = leadwatch_cli::Cli::parse();
    leadwatch_cli::run_cli(cli)
}
