#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use strata::primitives::pager::{PageManager, StorageOptions};
use strata::types::page::PAGE_HDR_LEN;
use strata::{PageId, PageKind, TableId};
use tempfile::TempDir;

const PAGE: u32 = 4096;

fn setup_db(name: &str) -> (TempDir, PathBuf, Vec<PageId>) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.strata"));
    let pages = seed(&path).expect("seed data");
    (dir, path, pages)
}

fn seed(path: &Path) -> strata::Result<Vec<PageId>> {
    let options = StorageOptions {
        page_size: PAGE,
        ..StorageOptions::default()
    };
    let pm = PageManager::create(path, options)?;
    let mut txn = pm.begin_transaction();
    let mut pages = Vec::new();
    for i in 0..4u8 {
        let id = txn.create_page(TableId(1), PageKind::Table)?;
        txn.write_page(id, &[i; 64])?;
        pages.push(id);
    }
    let spare = txn.allocate_extent(3)?;
    txn.commit()?;
    pm.free_extent(spare)?;
    pm.close()?;
    Ok(pages)
}

fn run_failure(args: &[&str]) -> (Option<i32>, String) {
    let output = cargo_bin_cmd!("strata").args(args).output().expect("run strata");
    assert!(!output.status.success(), "strata {args:?} unexpectedly succeeded");
    (
        output.status.code(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    )
}

fn run_json(args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("strata")
        .args(args)
        .args(["--format", "json"])
        .output()
        .expect("run strata");
    assert!(
        output.status.success(),
        "strata {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json output")
}

#[test]
fn init_creates_database_and_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("new.strata");
    let db = path.to_str().unwrap();

    let report = run_json(&["init", db, "--page-size", "8192", "--storage-mode", "columnar"]);
    assert_eq!(report["page_size"], 8192);
    assert_eq!(report["storage_mode"], "columnar");
    assert_eq!(report["strategy"], "best_fit");
    assert!(path.exists());

    let (code, stderr) = run_failure(&["init", db]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("already exists"), "{stderr}");
}

#[test]
fn stats_reports_allocator_and_wal_sections() {
    let (_dir, path, _) = setup_db("stats");
    let report = run_json(&["stats", path.to_str().unwrap()]);
    assert_eq!(report["pager"]["page_size"], PAGE);
    assert_eq!(report["pager"]["storage_mode"], "paged");
    let total = report["allocator"]["total_pages"].as_u64().unwrap();
    let free = report["allocator"]["free_pages"].as_u64().unwrap();
    let allocated = report["allocator"]["allocated_pages"].as_u64().unwrap();
    assert_eq!(free + allocated, total);
    assert!(report["allocator"]["extent_count"].as_u64().unwrap() >= 1);
    assert!(report["wal"]["last_checkpoint_lsn"].as_u64().unwrap() > 0);
    assert_eq!(report["recovery"]["records_scanned"], 0);
    assert!(report["filesystem"]["db_size_bytes"].as_u64().unwrap() >= total * PAGE as u64);
}

#[test]
fn stats_text_output_names_each_section() {
    let (_dir, path, _) = setup_db("stats_text");
    let output = cargo_bin_cmd!("strata")
        .args(["stats", path.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for section in ["Pager:", "Allocator:", "WAL:", "Recovery:", "Filesystem:"] {
        assert!(text.contains(section), "missing {section} in:\n{text}");
    }
}

#[test]
fn verify_passes_on_clean_file_and_flags_corruption() {
    let (_dir, path, pages) = setup_db("verify");
    let db = path.to_str().unwrap();
    let report = run_json(&["verify", db]);
    assert_eq!(report["success"], true);
    assert_eq!(report["level"], "full");
    assert_eq!(report["counts"]["checksum_failures"], 0);
    assert!(report["counts"]["pages_ok"].as_u64().unwrap() >= pages.len() as u64);

    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(pages[1].0 * PAGE as u64 + PAGE_HDR_LEN as u64 + 5))
        .unwrap();
    file.write_all(&[0xFF]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let output = cargo_bin_cmd!("strata")
        .args(["verify", db, "--format", "json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["success"], false);
    assert_eq!(report["counts"]["checksum_failures"], 1);
    let message = report["findings"][0]["message"].as_str().unwrap();
    assert!(message.contains(&format!("page {}", pages[1].0)));

    let fast = run_json(&["verify", db, "--level", "fast"]);
    assert_eq!(fast["success"], true);
}

#[test]
fn checkpoint_and_coalesce_report_snapshot_state() {
    let (_dir, path, _) = setup_db("maint");
    let db = path.to_str().unwrap();

    let report = run_json(&["checkpoint", db]);
    assert_eq!(report["mode"], "force");
    assert_eq!(report["skipped"], false);
    assert_eq!(report["wrote_snapshot"], false);

    let best = run_json(&["checkpoint", db, "--mode", "best-effort"]);
    assert_eq!(best["mode"], "best_effort");

    let coalesce = run_json(&["coalesce", db]);
    assert_eq!(coalesce["merged"], 0);
    assert!(coalesce["extents_after"].as_u64().unwrap() >= 1);
    assert!(coalesce["largest_extent"].as_u64().unwrap() >= 3);
}

#[test]
fn dump_page_decodes_header_and_hex() {
    let (_dir, path, pages) = setup_db("dump");
    let db = path.to_str().unwrap();
    let page = pages[2].0.to_string();
    let report = run_json(&["dump-page", db, &page]);
    assert_eq!(report["page"], pages[2].0);
    assert_eq!(report["kind"], "table");
    assert_eq!(report["table_id"], 1);
    assert_eq!(report["checksum_ok"], true);
    assert_eq!(report["free"], false);
    let hex = report["hex"].as_str().unwrap();
    assert_eq!(hex.len(), PAGE as usize * 2);
    assert!(hex.starts_with(&hex::encode(b"STRP")));

    let header = run_json(&["dump-page", db, "0"]);
    assert_eq!(header["kind"], "meta");

    let (_, stderr) = run_failure(&["dump-page", db, "999999"]);
    assert!(stderr.contains("beyond the last page"), "{stderr}");
}

#[test]
fn missing_database_is_an_error() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("absent.strata");
    let (code, stderr) = run_failure(&["stats", db.to_str().unwrap()]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("database not found"), "{stderr}");
}

#[test]
fn config_file_supplies_storage_options() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("strata.toml");
    std::fs::write(&config, "page_size = 2048\ndefault_strategy = \"worst_fit\"\n").unwrap();
    let db = dir.path().join("configured.strata");
    let report = run_json(&[
        "init",
        db.to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
    ]);
    assert_eq!(report["page_size"], 2048);
    assert_eq!(report["strategy"], "worst_fit");
}
