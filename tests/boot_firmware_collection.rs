//! Integration tests for loading and selecting among boot firmwares on
//! disk, exercising the full directory-scan path rather than a single
//! in-memory manifest.

use astra_update::boot_firmware::BootFirmwareCollection;
use astra_update::manifest::{MemoryLayout, SecureBoot};

fn write_firmware(root: &std::path::Path, id: &str, chip: &str, uenv: bool, console: &str, layout: &str) {
    let dir = root.join(id);
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(
        dir.join("manifest.yaml"),
        format!(
            "id: {id}\nchip: {chip}\nboard: evk\nsecure_boot: gen3\nconsole: {console}\nuenv_support: {uenv}\nvendor_id: \"0x1234\"\nproduct_id: \"0xabcd\"\nmemory_layout: {layout}\n"
        ),
    )
    .unwrap();
    std::fs::write(dir.join("gen3_uboot.bin.usb"), b"bootloader bytes").unwrap();
}

#[test]
fn select_by_chip_prefers_uenv_support() {
    let root = tempfile::tempdir().unwrap();
    write_firmware(root.path(), "f1", "x", true, "usb", "4gb");
    write_firmware(root.path(), "f2", "x", false, "usb", "4gb");

    let collection = BootFirmwareCollection::load(root.path()).unwrap();
    let chosen = collection.select_for("x", SecureBoot::V3, MemoryLayout::Gb4, None).unwrap();
    assert_eq!(chosen.id, "f1");
}

#[test]
fn select_with_no_uenv_support_prefers_usb_over_uart() {
    let root = tempfile::tempdir().unwrap();
    write_firmware(root.path(), "f1", "y", false, "uart", "2gb");
    write_firmware(root.path(), "f2", "y", false, "usb", "2gb");

    let collection = BootFirmwareCollection::load(root.path()).unwrap();
    let chosen = collection.select_for("y", SecureBoot::V3, MemoryLayout::Gb2, None).unwrap();
    assert_eq!(chosen.id, "f2");
}

#[test]
fn single_firmware_directory_loads_without_a_parent() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(
        root.path().join("manifest.yaml"),
        "id: solo\nchip: z\nboard: evk\nsecure_boot: gen2\nconsole: uart\nuenv_support: false\nvendor_id: \"0x1\"\nproduct_id: \"0x2\"\nmemory_layout: 1gb\n",
    )
    .unwrap();
    std::fs::write(root.path().join("minildr.img"), b"x").unwrap();

    let collection = BootFirmwareCollection::load(root.path()).unwrap();
    assert_eq!(collection.len(), 1);
    assert_eq!(collection.get_by_id("solo").unwrap().final_boot_image_name(), "minildr.img");
}

#[test]
fn selection_with_no_match_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    write_firmware(root.path(), "f1", "x", true, "usb", "4gb");

    let collection = BootFirmwareCollection::load(root.path()).unwrap();
    assert!(collection.select_for("nonexistent-chip", SecureBoot::V3, MemoryLayout::Gb4, None).is_err());
}

#[test]
fn board_filter_narrows_selection() {
    let root = tempfile::tempdir().unwrap();
    write_firmware(root.path(), "f1", "x", true, "usb", "4gb");

    let collection = BootFirmwareCollection::load(root.path()).unwrap();
    assert!(collection.select_for("x", SecureBoot::V3, MemoryLayout::Gb4, Some("not-evk")).is_err());
    assert!(collection.select_for("x", SecureBoot::V3, MemoryLayout::Gb4, Some("evk")).is_ok());
}
