// crates/manifold-server/src/cli/mod.rs
// Command-line interface

pub mod reindex;
pub mod serve;
pub mod validate;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "manifold",
    about = "Aggregating MCP proxy: many servers behind find and run",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve MCP over stdio (the default when no command is given)
    Serve {
        /// Profile name under the data directory's profiles/
        #[arg(short, long, default_value = "default", env = "MANIFOLD_PROFILE")]
        profile: String,
    },
    /// Check a profile file and the environment, then exit
    Validate {
        #[arg(short, long, default_value = "default", env = "MANIFOLD_PROFILE")]
        profile: String,
    },
    /// Discard the capability cache and re-index every downstream
    Reindex {
        #[arg(short, long, default_value = "default", env = "MANIFOLD_PROFILE")]
        profile: String,
    },
}
