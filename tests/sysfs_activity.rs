#![cfg(target_os = "linux")]

use airbridge::adapters::linux::SysfsActivitySource;
use airbridge::config::AppConfig;
use airbridge::core::{ActivitySource, ControllerState};
use std::fs;
use std::path::{Path, PathBuf};

fn fake_sysfs(root: &Path, udc_state: &str, written: u64) {
    let udc = root.join("class/udc/fe980000.usb");
    fs::create_dir_all(&udc).unwrap();
    fs::write(udc.join("state"), format!("{udc_state}\n")).unwrap();

    let part = root.join("block/mmcblk0/mmcblk0p3");
    fs::create_dir_all(&part).unwrap();
    fs::write(
        part.join("stat"),
        format!("     120        0     9600       40   311   0 {written}   1800        0      900     1840\n"),
    )
    .unwrap();
}

fn config(root: &Path) -> AppConfig {
    AppConfig {
        virtual_disk_path: PathBuf::from("/dev/mmcblk0p3"),
        udc_class_dir: root.join("class/udc"),
        sys_block_dir: root.join("block"),
        ..AppConfig::default()
    }
}

#[test]
fn test_reads_configured_controller_and_write_counter() {
    let temp = tempfile::tempdir().unwrap();
    fake_sysfs(temp.path(), "configured", 2048);

    let source = SysfsActivitySource::from_config(&config(temp.path()));

    assert_eq!(
        source.stat_path(),
        Some(temp.path().join("block/mmcblk0/mmcblk0p3/stat").as_path())
    );
    assert_eq!(source.controller_state(), ControllerState::Configured);
    assert_eq!(source.write_sectors(), Some(2048));
}

#[test]
fn test_other_controller_states_are_not_connected() {
    let temp = tempfile::tempdir().unwrap();
    fake_sysfs(temp.path(), "not attached", 0);

    let source = SysfsActivitySource::from_config(&config(temp.path()));

    let state = source.controller_state();
    assert_eq!(state, ControllerState::Other("not attached".to_string()));
    assert!(!state.is_configured());
}

#[test]
fn test_missing_udc_is_unavailable() {
    let temp = tempfile::tempdir().unwrap();
    let source = SysfsActivitySource::from_config(&config(temp.path()));

    assert_eq!(source.controller_state(), ControllerState::Unavailable);
    assert_eq!(source.write_sectors(), None);
}

#[test]
fn test_explicit_stat_path_wins() {
    let temp = tempfile::tempdir().unwrap();
    let stat = temp.path().join("custom_stat");
    fs::write(&stat, "1 2 3 4 5 6 77 8 9 10 11").unwrap();

    let source = SysfsActivitySource::from_config(&AppConfig {
        virtual_disk_path: PathBuf::from("/srv/usb.img"),
        write_stat_path: Some(stat),
        ..config(temp.path())
    });

    assert_eq!(source.write_sectors(), Some(77));
}
