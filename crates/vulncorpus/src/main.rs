use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vulncorpus::cli::{Cli, Commands};
use vulncorpus::config::Config;
use vulncorpus::download;
use vulncorpus::driver::Converter;
use vulncorpus::export;
use vulncorpus::store::RecordStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    config.ensure_dirs()?;

    match cli.command {
        Commands::Download => download::download_all(&config),
        Commands::Convert { repo, range } => {
            let mut converter = Converter::new(config)?;
            match (repo, range) {
                (Some(repo_url), _) => converter.convert_one(&repo_url),
                (None, Some(range)) => converter.convert_range(range[0], range[1]),
                (None, None) => converter.convert_all(),
            }
        }
        Commands::Export => {
            let store = RecordStore::open(&config.db_path())?;
            export::export_store(&store, &config.vulns_dir(), &config.revisions_dir())
        }
        Commands::Import => {
            let mut store = RecordStore::open(&config.db_path())?;
            export::import_tree(&mut store, &config.vulns_dir(), &config.revisions_dir())
        }
    }
}
