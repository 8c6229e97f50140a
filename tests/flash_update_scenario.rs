//! End-to-end composition: select a boot firmware from a collection using
//! the flash image's own manifest fields, then confirm the two agree on
//! the identifiers the device driver would use to drive an update. Drives
//! `manager::select_boot_firmware`, the exact decision `Manager::init`
//! makes, rather than re-implementing it in the test.

use std::collections::HashMap;

use astra_update::boot_firmware::BootFirmwareCollection;
use astra_update::flash_image::FlashImage;
use astra_update::manager::select_boot_firmware;

fn write_firmware_dir(root: &std::path::Path, id: &str, uenv_support: bool) {
    std::fs::write(
        root.join("manifest.yaml"),
        format!(
            "id: {id}\nchip: rb5\nboard: evk\nsecure_boot: gen3\nconsole: usb\nuenv_support: {uenv_support}\nvendor_id: \"0x18d1\"\nproduct_id: \"0xd00d\"\nmemory_layout: 4gb\n"
        ),
    )
    .unwrap();
    std::fs::write(root.join("gen3_uboot.bin.usb"), b"bootloader").unwrap();
}

fn write_flash_dir(root: &std::path::Path, boot_firmware: &str) {
    std::fs::write(
        root.join("manifest.yaml"),
        format!("image_type: emmc\nchip: rb5\nboard: evk\nsecure_boot: gen3\nmemory_layout: 4gb\nboot_firmware: {boot_firmware}\n"),
    )
    .unwrap();
    std::fs::write(root.join("rootfs.emmc"), b"rootfs contents").unwrap();
    std::fs::write(root.join("boot.subimg"), b"boot partition contents").unwrap();
    std::fs::write(
        root.join("emmc_part_list"),
        "boot.subimg, 0, 0x0\nrootfs.emmc, 1, 0x400000\n",
    )
    .unwrap();
}

#[test]
fn flash_image_manifest_selects_the_matching_boot_firmware() {
    let firmware_root = tempfile::tempdir().unwrap();
    let firmware_dir = firmware_root.path().join("rb5-emmc");
    std::fs::create_dir(&firmware_dir).unwrap();
    write_firmware_dir(&firmware_dir, "rb5-emmc", false);

    let flash_root = tempfile::tempdir().unwrap();
    write_flash_dir(flash_root.path(), "rb5-emmc");

    let flash_image = FlashImage::from(flash_root.path(), &HashMap::new(), None).unwrap();
    let collection = BootFirmwareCollection::load(firmware_root.path()).unwrap();

    let firmware = select_boot_firmware(&collection, None, Some(&flash_image)).unwrap();

    assert_eq!(firmware.id, flash_image.boot_firmware_id.as_deref().unwrap());
    assert_eq!(flash_image.final_image_name(), "rootfs.emmc");
    assert_eq!(flash_image.flash_command, format!("l2emmc {}", flash_root.path().file_name().unwrap().to_string_lossy()));
}

/// A flash image's `boot_firmware` id must win outright over chip-based
/// matching, even when a same-chip decoy firmware would otherwise be
/// preferred by `select_for`'s uEnv-support tiebreak (spec.md §4.9 item 3).
#[test]
fn flash_image_boot_firmware_id_overrides_chip_based_selection() {
    let firmware_root = tempfile::tempdir().unwrap();
    let named_dir = firmware_root.path().join("named");
    std::fs::create_dir(&named_dir).unwrap();
    write_firmware_dir(&named_dir, "rb5-emmc", false);

    let decoy_dir = firmware_root.path().join("decoy");
    std::fs::create_dir(&decoy_dir).unwrap();
    write_firmware_dir(&decoy_dir, "decoy-emmc", true);

    let flash_root = tempfile::tempdir().unwrap();
    write_flash_dir(flash_root.path(), "rb5-emmc");
    let flash_image = FlashImage::from(flash_root.path(), &HashMap::new(), None).unwrap();

    let collection = BootFirmwareCollection::load(firmware_root.path()).unwrap();

    // `select_for` alone would prefer "decoy-emmc" (uenv_support=true).
    let naive = collection.select_for("rb5", astra_update::manifest::SecureBoot::V3, astra_update::manifest::MemoryLayout::Gb4, Some("evk")).unwrap();
    assert_eq!(naive.id, "decoy-emmc");

    // The manifest's explicit `boot_firmware: rb5-emmc` must still win.
    let firmware = select_boot_firmware(&collection, None, Some(&flash_image)).unwrap();
    assert_eq!(firmware.id, "rb5-emmc");
}

#[test]
fn explicit_manager_config_boot_firmware_id_overrides_flash_image_entirely() {
    let firmware_root = tempfile::tempdir().unwrap();
    let dir = firmware_root.path().join("rb5-emmc");
    std::fs::create_dir(&dir).unwrap();
    write_firmware_dir(&dir, "rb5-emmc", false);

    let collection = BootFirmwareCollection::load(firmware_root.path()).unwrap();
    let firmware = select_boot_firmware(&collection, Some("rb5-emmc"), None).unwrap();

    assert_eq!(firmware.chip, "rb5");
    assert_eq!(firmware.final_boot_image_name(), "gen3_uboot.bin.usb");
}
