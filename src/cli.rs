// src/cli.rs - Command definitions for the node binary

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Pyrite proof-of-work chain node", long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "pyrite.toml")]
    pub config: String,

    /// Path to the database directory.
    #[arg(long, global = true, default_value = "./pyrite_data")]
    pub data_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Starts the pyrite full node.
    StartNode {
        /// Run the proof-of-work miner alongside synchronization.
        #[arg(long)]
        mine: bool,
    },
}
