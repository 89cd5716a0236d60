//! CLI interface for plughub
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Plughub plugin resolver
///
/// Resolves plugins from a registry to runnable executables, downloading and
/// verifying remote binaries into a local cache.
#[derive(Parser, Debug)]
#[command(name = "plughub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the registry source (local path or http(s) URL)
    #[arg(long, global = true, value_name = "SOURCE")]
    pub registry: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve a plugin to an executable path
    Resolve {
        /// Plugin name
        name: String,

        /// Seconds to wait for a download (default: cache.download_timeout_secs)
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// List registry entries
    List,

    /// Manage the binary cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Check GitHub for newer releases of remote plugins
    CheckUpdates {
        /// Only check this plugin
        name: Option<String>,
    },
}

/// Cache management actions
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached binaries
    List,

    /// Remove cached binaries
    Purge {
        /// Only purge this plugin
        name: Option<String>,
    },
}
