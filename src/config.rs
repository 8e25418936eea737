//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Leading zero hex digits a block hash needs, matching what the device app mines.
pub const DEFAULT_DIFFICULTY: u8 = 4;

pub const DEFAULT_MAX_SEGMENT_BLOCKS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

/// Tamper-evident activity ledger server.
#[derive(Parser, Debug, Clone)]
#[command(name = "device-ledger")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Directory holding the server key and device ledgers
    #[arg(short, long, env = "LEDGER_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// HTTP listen address
    #[arg(short, long, env = "LEDGER_LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    pub listen_addr: SocketAddr,

    /// Leading zero hex digits required of every block hash
    #[arg(
        long,
        env = "LEDGER_DIFFICULTY",
        default_value_t = DEFAULT_DIFFICULTY,
        value_parser = clap::value_parser!(u8).range(0..=64)
    )]
    pub difficulty: u8,

    /// Largest segment accepted in one sync
    #[arg(
        long,
        env = "LEDGER_MAX_SEGMENT",
        default_value_t = DEFAULT_MAX_SEGMENT_BLOCKS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_segment_blocks: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LEDGER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format
    #[arg(long, env = "LEDGER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn settings(&self) -> LedgerSettings {
        LedgerSettings {
            difficulty: self.difficulty,
            max_segment_blocks: self.max_segment_blocks as usize,
        }
    }
}

/// Validation parameters shared by the reconciler and the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSettings {
    pub difficulty: u8,
    pub max_segment_blocks: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            max_segment_blocks: DEFAULT_MAX_SEGMENT_BLOCKS as usize,
        }
    }
}
