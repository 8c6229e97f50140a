//! The payload being flashed: directory scan, flash command string, and
//! the final-image marker that ends the update phase.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::image::Image;
use crate::manifest::{self, FlashImageType as ManifestImageType, ManifestError, MemoryLayout, SecureBoot};

#[derive(Error, Debug)]
pub enum FlashImageError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to list directory {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("eMMC flash image at {0:?} is missing its emmc_part_list sidecar")]
    MissingPartList(PathBuf),

    #[error("emmc_part_list at {0:?} has no non-empty lines")]
    EmptyPartList(PathBuf),

    #[error("image type {0:?} is not yet implemented")]
    Unsupported(ManifestImageType),
}

/// The payload's storage target. eMMC is the only fully implemented
/// variant; SPI/NAND parse their manifest but do not yet scan sidecars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashImageKind {
    Spi,
    Nand,
    Emmc,
}

/// The flash payload: directory contents, flash command, and the final
/// image name that marks update completion.
#[derive(Debug, Clone)]
pub struct FlashImage {
    pub kind: FlashImageKind,
    pub dir: PathBuf,
    pub boot_firmware_id: Option<String>,
    pub chip: Option<String>,
    pub board: Option<String>,
    pub secure_boot: Option<SecureBoot>,
    pub memory_layout: Option<MemoryLayout>,
    pub image_names: Vec<String>,
    pub flash_command: String,
    final_image_name: String,
    final_image_fields: Vec<String>,
}

impl FlashImage {
    /// Read the manifest at `dir` (or `manifest_path` if given), apply
    /// `config` overrides, and scan the directory for this kind of flash
    /// payload.
    pub fn from(dir: &Path, config: &HashMap<String, String>, manifest_path: Option<&Path>) -> Result<Self, FlashImageError> {
        let m = manifest::load_flash_manifest(dir, manifest_path, config)?;

        let kind = match m.image_type {
            ManifestImageType::Spi => FlashImageKind::Spi,
            ManifestImageType::Nand => FlashImageKind::Nand,
            ManifestImageType::Emmc => FlashImageKind::Emmc,
        };

        let mut flash_image = FlashImage {
            kind,
            dir: dir.to_path_buf(),
            boot_firmware_id: m.boot_firmware,
            chip: m.chip,
            board: m.board,
            secure_boot: m.secure_boot,
            memory_layout: m.memory_layout,
            image_names: Vec::new(),
            flash_command: String::new(),
            final_image_name: String::new(),
            final_image_fields: Vec::new(),
        };
        flash_image.load()?;
        Ok(flash_image)
    }

    /// Scan the directory, compute the flash command, and (for eMMC)
    /// parse the `emmc_part_list` sidecar for the final image name.
    fn load(&mut self) -> Result<(), FlashImageError> {
        match self.kind {
            FlashImageKind::Emmc => self.load_emmc(),
            FlashImageKind::Spi | FlashImageKind::Nand => Err(FlashImageError::Unsupported(match self.kind {
                FlashImageKind::Spi => ManifestImageType::Spi,
                FlashImageKind::Nand => ManifestImageType::Nand,
                FlashImageKind::Emmc => unreachable!(),
            })),
        }
    }

    fn load_emmc(&mut self) -> Result<(), FlashImageError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(|e| FlashImageError::Io(self.dir.clone(), e))? {
            let entry = entry.map_err(|e| FlashImageError::Io(self.dir.clone(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // The part-list sidecar itself happens to contain "emmc" in
            // its name; it describes the images, it isn't one.
            if name == "emmc_part_list" {
                continue;
            }
            if name.contains("emmc") || name.contains("subimg") {
                names.push(name);
            }
        }
        names.sort();
        self.image_names = names;

        let dir_basename = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string());
        self.flash_command = format!("l2emmc {dir_basename}");

        let part_list_path = self.dir.join("emmc_part_list");
        let contents = std::fs::read_to_string(&part_list_path)
            .map_err(|_| FlashImageError::MissingPartList(part_list_path.clone()))?;

        let last_line = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| FlashImageError::EmptyPartList(part_list_path.clone()))?;

        let fields: Vec<String> = last_line.split(',').map(|f| f.trim().to_string()).collect();
        self.final_image_name = fields.first().cloned().unwrap_or_default();
        self.final_image_fields = fields;
        Ok(())
    }

    /// Build `Image`s for every file this payload carries.
    pub fn images(&self) -> Vec<Image> {
        self.image_names.iter().map(|name| Image::from_path(self.dir.join(name))).collect()
    }

    /// The name of the image whose successful send marks update
    /// completion — the name field of the last `emmc_part_list` line.
    pub fn final_image_name(&self) -> &str {
        &self.final_image_name
    }

    /// The full comma-separated field list of the last `emmc_part_list`
    /// line, for diagnostic logging.
    pub fn final_image_fields(&self) -> &[String] {
        &self.final_image_fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_emmc_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.yaml"), "image_type: emmc\n").unwrap();
        std::fs::write(dir.path().join("rootfs.subimg"), b"data").unwrap();
        std::fs::write(dir.path().join("boot.emmc"), b"data").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"data").unwrap();
        std::fs::write(
            dir.path().join("emmc_part_list"),
            "boot.emmc, 0, 0x100000\n\nrootfs.subimg, 1, 0x800000\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn emmc_load_picks_matching_files_and_final_name() {
        let dir = setup_emmc_dir();
        let flash_image = FlashImage::from(dir.path(), &HashMap::new(), None).unwrap();

        assert_eq!(flash_image.image_names, vec!["boot.emmc", "rootfs.subimg"]);
        assert_eq!(
            flash_image.flash_command,
            format!("l2emmc {}", dir.path().file_name().unwrap().to_string_lossy())
        );
        assert_eq!(flash_image.final_image_name(), "rootfs.subimg");
        assert_eq!(flash_image.final_image_fields(), &["rootfs.subimg", "1", "0x800000"]);
    }

    #[test]
    fn missing_part_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.yaml"), "image_type: emmc\n").unwrap();
        let err = FlashImage::from(dir.path(), &HashMap::new(), None).unwrap_err();
        assert!(matches!(err, FlashImageError::MissingPartList(_)));
    }
}
