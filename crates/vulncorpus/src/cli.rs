use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "vulncorpus", version, about = "OSV to repository-revision corpus converter")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "vulncorpus.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Download OSV archives for the configured ecosystems
    Download,
    /// Convert OSV entries into vulnerability and revision records
    Convert {
        /// Convert only this repository URL
        #[arg(long, conflicts_with = "range")]
        repo: Option<String>,
        /// Convert a slice START END (half-open) of the sorted repository list
        #[arg(long, num_args = 2, value_names = ["START", "END"])]
        range: Option<Vec<usize>>,
    },
    /// Export the record store into the JSON file tree
    Export,
    /// Import the JSON file tree back into the record store
    Import,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_convert_range() {
        let cli = Cli::parse_from(["vulncorpus", "convert", "--range", "10", "20"]);
        match cli.command {
            Commands::Convert { repo, range } => {
                assert!(repo.is_none());
                assert_eq!(range, Some(vec![10, 20]));
            }
            _ => panic!("expected convert"),
        }
    }

    #[test]
    fn parses_convert_repo() {
        let cli = Cli::parse_from([
            "vulncorpus",
            "convert",
            "--repo",
            "https://github.com/example/repo",
        ]);
        match cli.command {
            Commands::Convert { repo, .. } => {
                assert_eq!(repo.as_deref(), Some("https://github.com/example/repo"));
            }
            _ => panic!("expected convert"),
        }
    }

    #[test]
    fn repo_and_range_conflict() {
        assert!(Cli::try_parse_from([
            "vulncorpus",
            "convert",
            "--repo",
            "https://github.com/example/repo",
            "--range",
            "0",
            "1",
        ])
        .is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["vulncorpus", "download", "--config", "custom.toml"]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
    }
}
