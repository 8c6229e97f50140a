// CLI definitions using clap

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "astra-update", about = "Boot and flash Astra SoC devices over USB")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot firmware, then flash an image and wait for completion.
    Flash {
        #[arg(long)]
        flash_image: PathBuf,
        #[arg(long)]
        firmware_root: PathBuf,
        #[arg(long)]
        continuous: bool,
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(long)]
        temp_dir: Option<PathBuf>,
        #[arg(long)]
        usb_debug: bool,
        /// key=value overrides for the flash image's manifest.yaml
        #[arg(long = "config", value_parser = parse_key_val)]
        config: Vec<(String, String)>,
    },
    /// Boot a specific firmware by id without flashing anything.
    Boot {
        #[arg(long)]
        firmware_id: String,
        #[arg(long)]
        firmware_root: PathBuf,
        #[arg(long)]
        boot_command: Option<String>,
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(long)]
        temp_dir: Option<PathBuf>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    Ok((key.to_string(), value.to_string()))
}

pub fn config_map(pairs: &[(String, String)]) -> HashMap<String, String> {
    pairs.iter().cloned().collect()
}
