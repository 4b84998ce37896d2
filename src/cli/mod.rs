//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "audioprov",
    version,
    author = "neur0map",
    about = "Segment-based provenance matching for transformed audio clips",
    long_about = "Audioprov segments query audio, fuses per-segment nearest-neighbour evidence into \
                  file-level candidates, and accepts a source only when its score clears a \
                  severity-aware threshold. The CLI inspects segmentation, re-ranks recorded \
                  matches, summarises evaluation runs, and maintains the embedding cache."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/audioprov/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply (e.g., "audit", "fast")
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show how a WAV file is segmented at every configured scale
    Segment {
        /// Path to a WAV file
        input: PathBuf,

        /// Include escalation scales
        #[arg(long)]
        all_scales: bool,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Fuse and enforce recorded segment matches without the model or index
    Rank {
        /// JSON file holding one recorded query
        matches: PathBuf,

        /// Declared transform (e.g., "mp3", "pitch_shift", "low-pass")
        #[arg(short, long)]
        transform: Option<String>,

        /// Declared severity tier (mild, moderate, severe)
        #[arg(short, long)]
        severity: Option<String>,

        /// Maximum number of candidates to show
        #[arg(short = 'k', long)]
        topk: Option<usize>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Summarise a JSON array of saved query results
    Evaluate {
        /// Path to the results file
        results: PathBuf,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Manage the persisted segment-embedding cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show entry counts and stored size
    Stats {
        /// Cache database path
        db: PathBuf,
    },

    /// Delete cached embeddings
    Purge {
        /// Cache database path
        db: PathBuf,

        /// Only purge entries of this asset
        #[arg(short, long)]
        asset: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rank_arguments() {
        let cli = Cli::try_parse_from([
            "audioprov",
            "rank",
            "matches.json",
            "--transform",
            "mp3",
            "-k",
            "3",
            "--profile",
            "audit",
        ])
        .unwrap();

        assert_eq!(cli.profile.as_deref(), Some("audit"));
        match cli.command {
            Commands::Rank {
                matches,
                transform,
                topk,
                json,
                ..
            } => {
                assert_eq!(matches, PathBuf::from("matches.json"));
                assert_eq!(transform.as_deref(), Some("mp3"));
                assert_eq!(topk, Some(3));
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
