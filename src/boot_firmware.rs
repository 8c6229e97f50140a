//! A boot-firmware directory (manifest + images) and the collection of
//! all boot firmwares known to a `Manager`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::image::Image;
use crate::manifest::{self, BootConsole, ManifestError, MemoryLayout, SecureBoot};

#[derive(Error, Debug)]
pub enum BootFirmwareError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to list directory {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("no boot firmware found at {0:?}")]
    NotFound(PathBuf),

    #[error("no boot firmware with id {0:?}")]
    NoSuchId(String),

    #[error("no boot firmware matches chip={chip:?} secure_boot={secure_boot:?} memory_layout={memory_layout:?} board={board:?}")]
    NoMatch {
        chip: String,
        secure_boot: SecureBoot,
        memory_layout: MemoryLayout,
        board: Option<String>,
    },
}

/// A directory of images plus a manifest describing chip/board/secure-boot
/// identifiers. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct BootFirmware {
    pub id: String,
    pub chip: String,
    pub board: String,
    pub secure_boot: SecureBoot,
    pub console: BootConsole,
    pub uenv_support: bool,
    pub vendor_id: u16,
    pub product_id: u16,
    pub memory_layout: MemoryLayout,
    pub image_names: Vec<String>,
    dir: PathBuf,
}

impl BootFirmware {
    /// Read `manifest.yaml` from `dir`, then enumerate every other file in
    /// `dir` as an image.
    pub fn load(dir: &Path) -> Result<Self, BootFirmwareError> {
        let m = manifest::load_boot_manifest(dir)?;

        let mut image_names = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| BootFirmwareError::Io(dir.to_path_buf(), e))? {
            let entry = entry.map_err(|e| BootFirmwareError::Io(dir.to_path_buf(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != "manifest.yaml" {
                image_names.push(name);
            }
        }

        Ok(BootFirmware {
            id: m.id,
            chip: m.chip,
            board: m.board,
            secure_boot: m.secure_boot,
            console: m.console,
            uenv_support: m.uenv_support,
            vendor_id: m.vendor_id,
            product_id: m.product_id,
            memory_layout: m.memory_layout,
            image_names,
            dir: dir.to_path_buf(),
        })
    }

    /// Build `Image`s for every file this firmware carries.
    pub fn images(&self) -> Vec<Image> {
        self.image_names.iter().map(|name| Image::from_path(self.dir.join(name))).collect()
    }

    /// The image whose successful send marks the end of the boot phase.
    pub fn final_boot_image_name(&self) -> &'static str {
        match self.secure_boot {
            SecureBoot::V2 => "minildr.img",
            SecureBoot::V3 => {
                if self.uenv_support {
                    "uEnv.txt"
                } else {
                    "gen3_uboot.bin.usb"
                }
            }
        }
    }

    /// Human-readable summary logged by `Manager::init` as an `Info`
    /// response when this firmware is chosen.
    pub fn describe(&self) -> String {
        format!(
            "chip={} board={} id={} secure_boot={:?} memory_layout={:?} console={:?} uenv_support={}",
            self.chip, self.board, self.id, self.secure_boot, self.memory_layout, self.console, self.uenv_support
        )
    }
}

/// All boot firmwares known to a `Manager`, loaded from a firmware root
/// directory.
pub struct BootFirmwareCollection {
    firmwares: Vec<BootFirmware>,
}

impl BootFirmwareCollection {
    /// If `root` contains a manifest directly, load it alone; if it's a
    /// parent directory, descend one level and load each child that has a
    /// manifest, skipping malformed entries with a warning.
    pub fn load(root: &Path) -> Result<Self, BootFirmwareError> {
        if root.join("manifest.yaml").is_file() {
            let firmware = BootFirmware::load(root)?;
            return Ok(BootFirmwareCollection { firmwares: vec![firmware] });
        }

        if !root.is_dir() {
            return Err(BootFirmwareError::NotFound(root.to_path_buf()));
        }

        let mut firmwares = Vec::new();
        for entry in std::fs::read_dir(root).map_err(|e| BootFirmwareError::Io(root.to_path_buf(), e))? {
            let entry = entry.map_err(|e| BootFirmwareError::Io(root.to_path_buf(), e))?;
            let child = entry.path();
            if !child.is_dir() || !child.join("manifest.yaml").is_file() {
                continue;
            }
            match BootFirmware::load(&child) {
                Ok(firmware) => firmwares.push(firmware),
                Err(e) => warn!("skipping boot firmware at {child:?}: {e}"),
            }
        }

        if firmwares.is_empty() {
            return Err(BootFirmwareError::NotFound(root.to_path_buf()));
        }

        Ok(BootFirmwareCollection { firmwares })
    }

    pub fn get_by_id(&self, id: &str) -> Result<&BootFirmware, BootFirmwareError> {
        self.firmwares
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| BootFirmwareError::NoSuchId(id.to_string()))
    }

    /// Filter to firmwares matching (chip, secure_boot, memory_layout[,
    /// board]); among survivors prefer uEnv-support, then USB console,
    /// then the first.
    pub fn select_for(
        &self,
        chip: &str,
        secure_boot: SecureBoot,
        memory_layout: MemoryLayout,
        board: Option<&str>,
    ) -> Result<&BootFirmware, BootFirmwareError> {
        let candidates: Vec<&BootFirmware> = self
            .firmwares
            .iter()
            .filter(|f| {
                f.chip == chip
                    && f.secure_boot == secure_boot
                    && f.memory_layout == memory_layout
                    && board.map(|b| f.board == b).unwrap_or(true)
            })
            .collect();

        if let Some(found) = candidates.iter().find(|f| f.uenv_support) {
            return Ok(found);
        }
        if let Some(found) = candidates.iter().find(|f| f.console == BootConsole::Usb) {
            return Ok(found);
        }
        candidates.into_iter().next().ok_or_else(|| BootFirmwareError::NoMatch {
            chip: chip.to_string(),
            secure_boot,
            memory_layout,
            board: board.map(str::to_string),
        })
    }

    pub fn len(&self) -> usize {
        self.firmwares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.firmwares.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, id: &str, uenv: bool, console: &str) {
        std::fs::write(
            dir.join("manifest.yaml"),
            format!(
                "id: {id}\nchip: x\nboard: evk\nsecure_boot: gen3\nconsole: {console}\nuenv_support: {uenv}\nvendor_id: \"0x1234\"\nproduct_id: \"0xabcd\"\nmemory_layout: 4gb\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn select_for_prefers_uenv_support() {
        let root = tempfile::tempdir().unwrap();
        let f1 = root.path().join("f1");
        let f2 = root.path().join("f2");
        std::fs::create_dir(&f1).unwrap();
        std::fs::create_dir(&f2).unwrap();
        write_manifest(&f1, "f1", true, "usb");
        write_manifest(&f2, "f2", false, "usb");

        let collection = BootFirmwareCollection::load(root.path()).unwrap();
        let chosen = collection.select_for("x", SecureBoot::V3, MemoryLayout::Gb4, None).unwrap();
        assert_eq!(chosen.id, "f1");
    }

    #[test]
    fn select_for_prefers_usb_console_when_no_uenv_support() {
        let root = tempfile::tempdir().unwrap();
        let f1 = root.path().join("f1");
        let f2 = root.path().join("f2");
        std::fs::create_dir(&f1).unwrap();
        std::fs::create_dir(&f2).unwrap();
        write_manifest(&f1, "f1", false, "uart");
        write_manifest(&f2, "f2", false, "usb");

        let collection = BootFirmwareCollection::load(root.path()).unwrap();
        let chosen = collection.select_for("x", SecureBoot::V3, MemoryLayout::Gb4, None).unwrap();
        assert_eq!(chosen.id, "f2");
    }

    #[test]
    fn malformed_entry_is_skipped_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let good = root.path().join("good");
        let bad = root.path().join("bad");
        std::fs::create_dir(&good).unwrap();
        std::fs::create_dir(&bad).unwrap();
        write_manifest(&good, "good", true, "usb");
        std::fs::write(bad.join("manifest.yaml"), "id: bad\n").unwrap();

        let collection = BootFirmwareCollection::load(root.path()).unwrap();
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.get_by_id("good").unwrap().id, "good");
    }

    #[test]
    fn final_boot_image_name_for_v2_and_v3() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join("manifest.yaml"),
            "id: f1\nchip: x\nboard: evk\nsecure_boot: gen2\nconsole: usb\nuenv_support: false\nvendor_id: \"0x1234\"\nproduct_id: \"0xabcd\"\nmemory_layout: 4gb\n",
        )
        .unwrap();
        let firmware = BootFirmware::load(root.path()).unwrap();
        assert_eq!(firmware.final_boot_image_name(), "minildr.img");
    }
}
