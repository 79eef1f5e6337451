use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_manager;
use crate::admin::Result;
use crate::primitives::pager::{is_unwritten, PageManager};
use crate::types::page::{self, PageKind};
use crate::types::{PageId, StrataError};

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Header, allocator and snapshot checks only.
    Fast,
    /// Also reads every allocated page and checks its checksum.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Page tallies collected during a full scan.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Pages covered by the allocator.
    pub total_pages: u64,
    /// Free pages skipped by the scan.
    pub free_pages: u64,
    /// Allocated pages whose checksum and header verified.
    pub pages_ok: u64,
    /// Allocated pages that were never written.
    pub pages_unwritten: u64,
    /// Pages whose stored checksum disagreed.
    pub checksum_failures: u64,
    /// Pages whose checksum matched but whose header did not decode or match.
    pub header_errors: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification passed without any error finding.
    pub success: bool,
    /// Issues discovered, capped at 32 entries.
    pub findings: Vec<VerifyFinding>,
    /// Page tallies.
    pub counts: VerifyCounts,
}

/// Verifies the integrity of a database file.
///
/// Problems are collected rather than returned as errors, so a single bad
/// page does not hide the rest:
///
/// - `VerifyLevel::Fast`: allocator invariants and the snapshot chain
/// - `VerifyLevel::Full`: additionally reads every allocated page from disk
///
/// # Errors
///
/// Returns an error if the database cannot be opened or if I/O operations fail.
pub fn verify(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    level: VerifyLevel,
) -> Result<VerifyReport> {
    let manager = open_manager(path.as_ref(), opts)?;
    let mut findings = Vec::new();
    let mut counts = VerifyCounts {
        total_pages: manager.total_pages(),
        free_pages: manager.free_pages(),
        ..VerifyCounts::default()
    };

    if let Err(err) = manager.check_allocator() {
        push(&mut findings, VerifyFinding::error(format!("allocator: {err}")));
    }
    let meta = manager.meta();
    if meta.total_pages > manager.total_pages() {
        push(
            &mut findings,
            VerifyFinding::error(format!(
                "header records {} pages but allocator covers {}",
                meta.total_pages,
                manager.total_pages()
            )),
        );
    }
    let snapshot_pages = manager.snapshot_page_ids();
    for page in &snapshot_pages {
        if manager.is_free(*page) {
            push(
                &mut findings,
                VerifyFinding::error(format!("snapshot page {page} is marked free")),
            );
        }
    }

    if matches!(level, VerifyLevel::Full) {
        manager.flush_dirty_pages()?;
        scan_pages(&manager, &snapshot_pages, &mut counts, &mut findings)?;
    }

    let success = !findings
        .iter()
        .any(|f| matches!(f.severity, VerifySeverity::Error));
    Ok(VerifyReport {
        level,
        success,
        findings,
        counts,
    })
}

fn scan_pages(
    manager: &PageManager,
    snapshot_pages: &[PageId],
    counts: &mut VerifyCounts,
    findings: &mut Vec<VerifyFinding>,
) -> Result<()> {
    let salt = manager.salt();
    let path = manager.checksum_path();
    for raw_id in 1..manager.total_pages() {
        let id = PageId(raw_id);
        if manager.is_free(id) {
            continue;
        }
        let buf = manager.read_raw_page(id)?;
        if is_unwritten(&buf) {
            counts.pages_unwritten += 1;
            continue;
        }
        match page::verify(&buf, id, salt, path) {
            Ok(header) => {
                counts.pages_ok += 1;
                let in_chain = snapshot_pages.contains(&id);
                if (header.kind == PageKind::FreeList) != in_chain {
                    push(
                        findings,
                        VerifyFinding::warning(format!(
                            "page {id} has kind {} but {} the snapshot chain",
                            header.kind.as_str(),
                            if in_chain { "belongs to" } else { "is not in" }
                        )),
                    );
                }
            }
            Err(StrataError::ChecksumMismatch {
                expected, actual, ..
            }) => {
                counts.checksum_failures += 1;
                push(
                    findings,
                    VerifyFinding::error(format!(
                        "page {id}: checksum mismatch (stored {expected:#010x}, computed {actual:#010x})"
                    )),
                );
            }
            Err(StrataError::Io(err)) => return Err(StrataError::Io(err).into()),
            Err(err) => {
                counts.header_errors += 1;
                push(findings, VerifyFinding::error(format!("page {id}: {err}")));
            }
        }
    }
    Ok(())
}

fn push(findings: &mut Vec<VerifyFinding>, finding: VerifyFinding) {
    if findings.len() < MAX_FINDINGS {
        findings.push(finding);
    }
}
