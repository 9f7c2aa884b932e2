//! Configuration module.
//!
//! Command-line interface of the `manmap` tool using `clap`. The tool works offline on image
//! files: it inspects them, renders their mapped layout for a chosen base, and walks their
//! dependency graph.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Offline companion to the manual mapping engine.
///
/// Parses PE32/PE32+ images the way the engine does and shows what it would map.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true, help = "Set the logging level")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print headers, sections and directories of an image
    Inspect {
        image: PathBuf,
    },

    /// Lay an image out as it would appear in memory and write the flat view
    Layout {
        image: PathBuf,

        /// Base address to relocate for (hex with 0x prefix, or decimal); defaults to the
        /// preferred base
        #[arg(long, value_parser = parse_address)]
        base: Option<u64>,

        #[arg(short, long, default_value = "mapped.bin", help = "Path of the flat image")]
        output: PathBuf,
    },

    /// Show the dependency tree of an image
    Deps {
        image: PathBuf,

        /// Directories searched for dependencies, in order
        #[arg(short = 's', long = "search-path")]
        search_path: Vec<PathBuf>,
    },
}

/// Parses `0x`-prefixed hex or decimal addresses.
pub fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}
