//! datapack CLI: validate dataset manifests and distribute them as
//! versioned, content-addressed packages.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);

    let debug = cli.debug();
    match commands::run(cli).await {
        Ok(()) => Ok(()),
        Err(report) if debug => Err(report),
        Err(report) => {
            eprintln!("error: {report}");
            std::process::exit(1);
        }
    }
}
