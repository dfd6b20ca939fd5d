//! Word-sum checksums and the `V*.fex` side-files that carry them.
//!
//! A side-file `Vboot.fex` holds, as its first four bytes, the little-endian
//! sum of all 32-bit words of `boot.fex` (trailing bytes zero-padded).

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

const READ_BUF: usize = 0x10000;

/// Side-files that never hold a word-sum and are skipped by the scan.
pub const EXEMPT_SIDE_FILES: &[&str] =
    &["Vvbmeta.fex", "Vvbmeta_system.fex", "Vvbmeta_vendor.fex"];

/// Streaming word-sum. Bytes may be fed in arbitrary pieces; word
/// boundaries are tracked across calls.
#[derive(Debug, Default, Clone)]
pub struct WordSum {
    sum: u32,
    pending: [u8; 4],
    pending_len: usize,
}

impl WordSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (4 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < 4 {
                return;
            }
            self.sum = self.sum.wrapping_add(u32::from_le_bytes(self.pending));
            self.pending_len = 0;
        }
        let mut words = data.chunks_exact(4);
        for w in &mut words {
            self.sum = self.sum.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        }
        let rest = words.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    pub fn finalize(&self) -> u32 {
        if self.pending_len == 0 {
            return self.sum;
        }
        let mut last = [0u8; 4];
        last[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
        self.sum.wrapping_add(u32::from_le_bytes(last))
    }
}

/// Checksum of an in-memory buffer.
pub fn compute(bytes: &[u8]) -> u32 {
    let mut ws = WordSum::new();
    ws.update(bytes);
    ws.finalize()
}

/// Checksum of anything readable. Read failures are returned, never folded
/// into a zero sum.
pub fn compute_reader<R: Read>(mut r: R) -> io::Result<u32> {
    let mut ws = WordSum::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        ws.update(&buf[..n]);
    }
    Ok(ws.finalize())
}

pub fn compute_file(path: &Path) -> io::Result<u32> {
    compute_reader(File::open(path)?)
}

/// Outcome for one side-file in a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    Ok { value: u32 },
    Mismatch { expected: u32, actual: u32 },
    Repaired { old: u32, new: u32 },
    /// The sibling payload file is missing or could not be read.
    Unreadable { reason: String },
    /// The side-file itself is shorter than four bytes or unreadable.
    BadSideFile { reason: String },
    /// A mismatch was found but the corrected value could not be written.
    WriteFailed { expected: u32, actual: u32, reason: String },
}

impl ChecksumStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ChecksumStatus::Ok { .. } | ChecksumStatus::Repaired { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ChecksumOutcome {
    pub side_file: String,
    /// Name of the payload file the side-file describes.
    pub target: String,
    pub status: ChecksumStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ChecksumReport {
    pub outcomes: Vec<ChecksumOutcome>,
}

impl ChecksumReport {
    pub fn ok_count(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o.status, ChecksumStatus::Ok { .. })).count()
    }
    pub fn repaired_count(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o.status, ChecksumStatus::Repaired { .. })).count()
    }
    pub fn mismatch_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.status,
                    ChecksumStatus::Mismatch { .. } | ChecksumStatus::WriteFailed { .. }
                )
            })
            .count()
    }
    /// Entries that could not be checked at all.
    pub fn error_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.status,
                    ChecksumStatus::Unreadable { .. } | ChecksumStatus::BadSideFile { .. }
                )
            })
            .count()
    }
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_ok())
    }
}

/// `V<name>.fex` -> `<name>.fex`, or `None` when `name` is not a side-file
/// the scan should look at.
pub fn side_file_target(name: &str) -> Option<&str> {
    if !name.starts_with('V') || !name.contains(".fex") {
        return None;
    }
    if EXEMPT_SIDE_FILES.contains(&name) {
        return None;
    }
    Some(&name[1..])
}

/// Scan `dir` for checksum side-files and compare each against its sibling.
/// With `repair`, mismatching side-files are rewritten. Per-entry problems
/// are recorded and the scan continues; only an unreadable directory fails.
pub fn verify_or_repair(dir: &Path, repair: bool) -> crate::Result<ChecksumReport> {
    use crate::error::IoContext;

    let mut names: Vec<String> = Vec::new();
    let mut undecodable: Vec<String> = Vec::new();
    for ent in fs::read_dir(dir).at(dir)? {
        let ent = ent.at(dir)?;
        match ent.file_name().into_string() {
            Ok(name) => {
                if side_file_target(&name).is_some() {
                    names.push(name);
                }
            }
            Err(raw) => {
                let lossy = raw.to_string_lossy().into_owned();
                if lossy.starts_with('V') && lossy.contains(".fex") {
                    undecodable.push(lossy);
                } else {
                    debug!(name = %lossy, "non-UTF-8 file name ignored");
                }
            }
        }
    }
    // read_dir order is platform-dependent
    names.sort();
    undecodable.sort();

    let mut report = ChecksumReport::default();
    for side_file in undecodable {
        let target = side_file[1..].to_string();
        let status =
            ChecksumStatus::BadSideFile { reason: "file name is not valid UTF-8".into() };
        log_status(&target, &status);
        report.outcomes.push(ChecksumOutcome { side_file, target, status });
    }
    for name in names {
        let target = side_file_target(&name).unwrap_or_default().to_string();
        let status = check_one(&dir.join(&name), &dir.join(&target), repair);
        log_status(&target, &status);
        report.outcomes.push(ChecksumOutcome { side_file: name, target, status });
    }
    Ok(report)
}

fn check_one(side: &Path, target: &Path, repair: bool) -> ChecksumStatus {
    let expected = match read_side_file(side) {
        Ok(v) => v,
        Err(e) => return ChecksumStatus::BadSideFile { reason: e.to_string() },
    };
    let actual = match compute_file(target) {
        Ok(v) => v,
        Err(e) => return ChecksumStatus::Unreadable { reason: e.to_string() },
    };
    if actual == expected {
        return ChecksumStatus::Ok { value: actual };
    }
    if !repair {
        return ChecksumStatus::Mismatch { expected, actual };
    }
    match write_side_file(side, actual) {
        Ok(()) => ChecksumStatus::Repaired { old: expected, new: actual },
        Err(e) => ChecksumStatus::WriteFailed { expected, actual, reason: e.to_string() },
    }
}

fn log_status(target: &str, status: &ChecksumStatus) {
    match status {
        ChecksumStatus::Ok { value } => info!(file = target, value, "checksum ok"),
        ChecksumStatus::Mismatch { expected, actual } => {
            warn!(file = target, expected, actual, "checksum mismatch")
        }
        ChecksumStatus::Repaired { old, new } => info!(file = target, old, new, "checksum repaired"),
        ChecksumStatus::Unreadable { reason } => warn!(file = target, %reason, "cannot checksum"),
        ChecksumStatus::BadSideFile { reason } => {
            warn!(file = target, %reason, "cannot read side-file")
        }
        ChecksumStatus::WriteFailed { reason, .. } => {
            warn!(file = target, %reason, "cannot update side-file")
        }
    }
}

/// First four bytes of a side-file as a little-endian value.
pub fn read_side_file(path: &Path) -> io::Result<u32> {
    let mut f = File::open(path)?;
    let mut b = [0u8; 4];
    f.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub fn write_side_file(path: &Path, value: u32) -> io::Result<()> {
    fs::write(path, value.to_le_bytes())
}

/// Path of the side-file that would describe `payload`.
pub fn side_file_for(payload: &Path) -> Option<PathBuf> {
    let name = payload.file_name()?.to_str()?;
    Some(payload.with_file_name(format!("V{name}")))
}
