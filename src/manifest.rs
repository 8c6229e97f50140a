//! `manifest.yaml` parsing for boot-firmware directories and flash-image
//! directories.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest at {0:?}: {1}")]
    Io(std::path::PathBuf, #[source] std::io::Error),

    #[error("malformed manifest at {0:?}: {1}")]
    Parse(std::path::PathBuf, #[source] serde_yaml::Error),

    #[error("manifest at {0:?} missing required key {1:?}")]
    MissingKey(std::path::PathBuf, &'static str),

    #[error("manifest at {0:?} has invalid value for {1:?}: {2:?}")]
    InvalidValue(std::path::PathBuf, &'static str, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureBoot {
    V2,
    V3,
}

impl SecureBoot {
    fn parse(path: &Path, raw: &str) -> Result<Self, ManifestError> {
        match raw {
            "gen2" => Ok(SecureBoot::V2),
            "gen3" => Ok(SecureBoot::V3),
            other => Err(ManifestError::InvalidValue(path.to_path_buf(), "secure_boot", other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootConsole {
    Uart,
    Usb,
}

impl BootConsole {
    fn parse(path: &Path, raw: &str) -> Result<Self, ManifestError> {
        match raw {
            "uart" => Ok(BootConsole::Uart),
            "usb" => Ok(BootConsole::Usb),
            other => Err(ManifestError::InvalidValue(path.to_path_buf(), "console", other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLayout {
    Gb1,
    Gb2,
    Gb3,
    Gb4,
}

impl MemoryLayout {
    fn parse(path: &Path, raw: &str) -> Result<Self, ManifestError> {
        match raw {
            "1gb" => Ok(MemoryLayout::Gb1),
            "2gb" => Ok(MemoryLayout::Gb2),
            "3gb" => Ok(MemoryLayout::Gb3),
            "4gb" => Ok(MemoryLayout::Gb4),
            other => Err(ManifestError::InvalidValue(path.to_path_buf(), "memory_layout", other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBootManifest {
    id: String,
    chip: String,
    board: String,
    secure_boot: String,
    console: String,
    uenv_support: bool,
    vendor_id: String,
    product_id: String,
    memory_layout: String,
}

/// The parsed, validated contents of a boot-firmware `manifest.yaml`.
#[derive(Debug, Clone)]
pub struct BootManifest {
    pub id: String,
    pub chip: String,
    pub board: String,
    pub secure_boot: SecureBoot,
    pub console: BootConsole,
    pub uenv_support: bool,
    pub vendor_id: u16,
    pub product_id: u16,
    pub memory_layout: MemoryLayout,
}

/// Read and validate `<dir>/manifest.yaml` as a boot-firmware manifest.
pub fn load_boot_manifest(dir: &Path) -> Result<BootManifest, ManifestError> {
    let manifest_path = dir.join("manifest.yaml");
    let contents = std::fs::read_to_string(&manifest_path).map_err(|e| ManifestError::Io(manifest_path.clone(), e))?;
    let raw: RawBootManifest =
        serde_yaml::from_str(&contents).map_err(|e| ManifestError::Parse(manifest_path.clone(), e))?;

    let vendor_id = parse_hex(&manifest_path, "vendor_id", &raw.vendor_id)?;
    let product_id = parse_hex(&manifest_path, "product_id", &raw.product_id)?;

    Ok(BootManifest {
        id: raw.id,
        chip: raw.chip,
        board: raw.board,
        secure_boot: SecureBoot::parse(&manifest_path, &raw.secure_boot)?,
        console: BootConsole::parse(&manifest_path, &raw.console)?,
        uenv_support: raw.uenv_support,
        vendor_id,
        product_id,
        memory_layout: MemoryLayout::parse(&manifest_path, &raw.memory_layout)?,
    })
}

fn parse_hex(path: &Path, key: &'static str, raw: &str) -> Result<u16, ManifestError> {
    let trimmed = raw.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).map_err(|_| ManifestError::InvalidValue(path.to_path_buf(), key, raw.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashImageType {
    Spi,
    Nand,
    Emmc,
}

impl FlashImageType {
    fn parse(path: &Path, raw: &str) -> Result<Self, ManifestError> {
        match raw {
            "spi" => Ok(FlashImageType::Spi),
            "nand" => Ok(FlashImageType::Nand),
            "emmc" => Ok(FlashImageType::Emmc),
            other => Err(ManifestError::InvalidValue(path.to_path_buf(), "image_type", other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawFlashManifest {
    image_type: String,
    board: Option<String>,
    chip: Option<String>,
    boot_firmware: Option<String>,
    secure_boot: Option<String>,
    memory_layout: Option<String>,
}

/// The parsed contents of a flash-image `manifest.yaml`, with CLI config
/// overrides (`config`) already applied.
#[derive(Debug, Clone)]
pub struct FlashManifest {
    pub image_type: FlashImageType,
    pub board: Option<String>,
    pub chip: Option<String>,
    pub boot_firmware: Option<String>,
    pub secure_boot: Option<SecureBoot>,
    pub memory_layout: Option<MemoryLayout>,
}

/// Read `manifest_path` (or `<dir>/manifest.yaml` if unset) as a
/// flash-image manifest, with `config` values overriding those parsed
/// from the file.
pub fn load_flash_manifest(
    dir: &Path,
    manifest_path: Option<&Path>,
    config: &HashMap<String, String>,
) -> Result<FlashManifest, ManifestError> {
    let path = manifest_path.map(|p| p.to_path_buf()).unwrap_or_else(|| dir.join("manifest.yaml"));
    let contents = std::fs::read_to_string(&path).map_err(|e| ManifestError::Io(path.clone(), e))?;
    let raw: RawFlashManifest = serde_yaml::from_str(&contents).map_err(|e| ManifestError::Parse(path.clone(), e))?;

    let image_type_str = config.get("image_type").cloned().unwrap_or(raw.image_type);
    let image_type = FlashImageType::parse(&path, &image_type_str)?;

    let board = config.get("board").cloned().or(raw.board);
    let chip = config.get("chip").cloned().or(raw.chip);
    let boot_firmware = config.get("boot_firmware").cloned().or(raw.boot_firmware);

    let secure_boot_str = config.get("secure_boot").cloned().or(raw.secure_boot);
    let secure_boot = secure_boot_str.map(|s| SecureBoot::parse(&path, &s)).transpose()?;

    let memory_layout_str = config.get("memory_layout").cloned().or(raw.memory_layout);
    let memory_layout = memory_layout_str.map(|s| MemoryLayout::parse(&path, &s)).transpose()?;

    Ok(FlashManifest {
        image_type,
        board,
        chip,
        boot_firmware,
        secure_boot,
        memory_layout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_boot_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.yaml"),
            "id: f1\nchip: x\nboard: evk\nsecure_boot: gen3\nconsole: usb\nuenv_support: true\nvendor_id: \"0x1234\"\nproduct_id: \"0xabcd\"\nmemory_layout: 4gb\n",
        )
        .unwrap();

        let manifest = load_boot_manifest(dir.path()).unwrap();
        assert_eq!(manifest.id, "f1");
        assert_eq!(manifest.secure_boot, SecureBoot::V3);
        assert_eq!(manifest.console, BootConsole::Usb);
        assert!(manifest.uenv_support);
        assert_eq!(manifest.vendor_id, 0x1234);
        assert_eq!(manifest.product_id, 0xabcd);
        assert_eq!(manifest.memory_layout, MemoryLayout::Gb4);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_boot_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Io(_, _)));
    }

    #[test]
    fn malformed_secure_boot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.yaml"),
            "id: f1\nchip: x\nboard: evk\nsecure_boot: gen99\nconsole: usb\nuenv_support: true\nvendor_id: \"0x1234\"\nproduct_id: \"0xabcd\"\nmemory_layout: 4gb\n",
        )
        .unwrap();

        let err = load_boot_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidValue(_, "secure_boot", _)));
    }

    #[test]
    fn config_overrides_take_precedence_over_manifest_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.yaml"), "image_type: emmc\nboard: manifest-board\n").unwrap();

        let mut config = HashMap::new();
        config.insert("board".to_string(), "config-board".to_string());

        let manifest = load_flash_manifest(dir.path(), None, &config).unwrap();
        assert_eq!(manifest.image_type, FlashImageType::Emmc);
        assert_eq!(manifest.board.as_deref(), Some("config-board"));
    }
}
