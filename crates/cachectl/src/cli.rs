use crate::programs::Demo;
use bytesize::ByteSize;
use clap::{Args, Parser};
use codecache::CacheConfig;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Maximum number of instructions per block
    #[arg(visible_alias("ipb"), long, default_value_t = 256)]
    pub max_block_instructions: u32,
    /// Whether to run blocks through the threaded recompiler
    #[arg(short, long, default_value_t = false)]
    pub recompiler: bool,
    /// Whether recompiled code should access RAM directly (requires the recompiler)
    #[arg(long, default_value_t = false)]
    pub fastmem: bool,
    /// Whether to disable direct links between blocks
    #[arg(long, default_value_t = false)]
    pub no_linking: bool,
    /// Size of the host code buffer
    #[arg(long, default_value = "1MiB")]
    pub code_buffer_size: ByteSize,
}

impl CacheArgs {
    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            max_block_instructions: self.max_block_instructions,
            use_recompiler: self.recompiler,
            fastmem: self.fastmem,
            enable_linking: !self.no_linking,
        }
    }
}

/// Cachectl: runs toy machine programs through the code cache
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub cache: CacheArgs,
    /// Built-in program to run. Ignored if an image is given.
    #[arg(short, long, value_enum, default_value_t = Demo::Loop)]
    pub demo: Demo,
    /// Path to a raw little endian image to load and execute.
    #[arg(short, long)]
    pub image: Option<PathBuf>,
    /// Address the image is loaded at and starts executing from.
    #[arg(long, value_parser = parse_address, default_value = "0x80001000")]
    pub load_address: u32,
    /// Maximum number of instructions to execute.
    #[arg(short, long)]
    pub budget: Option<u64>,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let s = s.replace('_', "");
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };

    parsed.map_err(|e| format!("invalid address: {e}"))
}
