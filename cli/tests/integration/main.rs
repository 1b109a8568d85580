use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

const FRAME_SIZES: [&str; 4] = ["16", "123", "3K", "2M"];

fn write_test_input(dir: &Path) -> PathBuf {
    let path = dir.join("input.txt");
    let mut file = fs::File::create(&path).unwrap();
    for i in 0..2000 {
        writeln!(file, "line {i}: seekable archive integration test corpus").unwrap();
    }
    path
}

fn test_cycle(frame_size: &str, extra_args: &[&str]) {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());
    let archive = dir.path().join("input.txt.sza");
    let restored = dir.path().join("restored");

    cargo_bin_cmd!("seekarc")
        .arg("compress")
        .arg(&input)
        .arg("--frame-size")
        .arg(frame_size)
        .arg("--output-file")
        .arg(&archive)
        .args(extra_args)
        .assert()
        .success();

    cargo_bin_cmd!("seekarc")
        .arg("decompress")
        .arg(&archive)
        .arg("--output-file")
        .arg(&restored)
        .assert()
        .success();

    assert_eq!(fs::read(&input).unwrap(), fs::read(&restored).unwrap());
}

#[test]
fn cycle() {
    for frame_size in FRAME_SIZES {
        test_cycle(frame_size, &[]);
    }
}

#[test]
fn cycle_lz4() {
    test_cycle("1K", &["--lz4"]);
}

#[test]
fn cycle_with_checksums() {
    test_cycle("1K", &["--checksums"]);
}

#[test]
fn cycle_with_coalesced_entries() {
    test_cycle("64", &["--frames-per-entry", "4"]);
}

#[test]
fn cycle_with_workers() {
    test_cycle("32K", &["--workers", "2"]);
}

#[test]
fn compress_from_stdin() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("stdin.sza");
    let restored = dir.path().join("restored");
    let data = b"data arriving on stdin".repeat(100);

    cargo_bin_cmd!("seekarc")
        .arg("compress")
        .arg("--frame-size")
        .arg("128")
        .arg("--output-file")
        .arg(&archive)
        .write_stdin(data.clone())
        .assert()
        .success();

    cargo_bin_cmd!("seekarc")
        .arg("decompress")
        .arg(&archive)
        .arg("--output-file")
        .arg(&restored)
        .assert()
        .success();

    assert_eq!(data, fs::read(&restored).unwrap());
}

#[test]
fn decompress_byte_range_to_stdout() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());
    let archive = dir.path().join("input.txt.sza");

    cargo_bin_cmd!("seekarc")
        .arg("compress")
        .arg(&input)
        .arg("--frame-size")
        .arg("256")
        .arg("--output-file")
        .arg(&archive)
        .assert()
        .success();

    let output = cargo_bin_cmd!("seekarc")
        .arg("decompress")
        .arg(&archive)
        .arg("--from")
        .arg("100")
        .arg("--to")
        .arg("1500")
        .arg("--stdout")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let expected = &fs::read(&input).unwrap()[100..1500];
    assert_eq!(output, expected);
}

#[test]
fn list_prints_archive_summary() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());
    let archive = dir.path().join("input.txt.sza");

    cargo_bin_cmd!("seekarc")
        .arg("compress")
        .arg(&input)
        .arg("--frame-size")
        .arg("1K")
        .arg("--output-file")
        .arg(&archive)
        .assert()
        .success();

    let summary = cargo_bin_cmd!("seekarc")
        .arg("list")
        .arg(&archive)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let summary = String::from_utf8(summary).unwrap();
    assert!(summary.contains("Entries"));
    assert!(summary.contains("input.txt.sza"));

    let detail = cargo_bin_cmd!("seekarc")
        .arg("list")
        .arg("--detail")
        .arg(&archive)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let detail = String::from_utf8(detail).unwrap();
    assert!(detail.contains("Decompressed Offset"));
}

#[test]
fn refuses_to_overwrite_without_force() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());
    let archive = dir.path().join("input.txt.sza");

    cargo_bin_cmd!("seekarc")
        .arg("compress")
        .arg(&input)
        .arg("--output-file")
        .arg(&archive)
        .assert()
        .success();

    // Quiet mode cannot prompt, so the second run must fail
    cargo_bin_cmd!("seekarc")
        .arg("--quiet")
        .arg("compress")
        .arg(&input)
        .arg("--output-file")
        .arg(&archive)
        .assert()
        .failure();

    // With --force it overwrites
    cargo_bin_cmd!("seekarc")
        .arg("compress")
        .arg(&input)
        .arg("--force")
        .arg("--output-file")
        .arg(&archive)
        .assert()
        .success();
}
