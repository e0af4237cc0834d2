//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use luanext_hmr::config::DEFAULT_CONFIG_FILE;

/// LuaNext development server with hot module replacement
#[derive(Parser, Debug, Clone)]
#[command(name = "luanext-dev", version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short = 'C', long, global = true, default_value = DEFAULT_CONFIG_FILE, value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build every target once and exit
    #[command(visible_alias = "b")]
    Build,

    /// Build, then watch the project root and deliver hot updates
    #[command(visible_alias = "d")]
    Dev {
        /// Quiet period before a batch of file events is handled
        #[arg(long, default_value_t = 100)]
        debounce_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_defaults() {
        let cli = Cli::try_parse_from(["luanext-dev", "dev"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Commands::Dev { debounce_ms: 100 }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["luanext-dev", "build", "-C", "other.yaml", "-v"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Build));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["luanext-dev"]).is_err());
    }
}
