use std::fs::{self, File};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::checksum::{self, ChecksumReport};
use crate::error::{IoContext, Result, WtyError};
use crate::header::{self, FileEntry, ImageHeader, MAGIC};
use crate::manifest::{self, MANIFEST_NAME};
use crate::path_safety::{validate_path, PathPolicy};

#[derive(Clone, Copy, Debug)]
pub struct ExtractOptions {
    /// Run the read-only `V*.fex` scan after the payloads are written.
    pub verify_checksums: bool,
    pub path_policy: PathPolicy,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { verify_checksums: true, path_policy: PathPolicy::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Extracted { bytes: u64 },
    /// The container ended before the payload did; what was there is written.
    Truncated { bytes: u64, expected: u64 },
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct EntryReport {
    pub index: usize,
    pub name: String,
    pub outcome: EntryOutcome,
}

#[derive(Debug, Clone)]
pub struct ExtractReport {
    pub header: ImageHeader,
    pub entries: Vec<FileEntry>,
    pub files: Vec<EntryReport>,
    pub manifest_path: PathBuf,
    /// `None` when the scan was disabled or the directory could not be read.
    pub checksums: Option<ChecksumReport>,
}

impl ExtractReport {
    pub fn extracted_count(&self) -> usize {
        self.files.iter().filter(|f| matches!(f.outcome, EntryOutcome::Extracted { .. })).count()
    }
    pub fn problem_count(&self) -> usize {
        self.files.len() - self.extracted_count()
    }
}

/// `<image file name>.dump`, relative to the working directory.
pub fn default_dump_dir(image: &Path) -> PathBuf {
    let base = image.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    PathBuf::from(format!("{base}.dump"))
}

fn check_magic(path: &Path, hdr: &ImageHeader) -> Result<()> {
    if hdr.has_valid_magic() {
        return Ok(());
    }
    Err(WtyError::Format(format!(
        "{} is not an IMAGEWTY image (magic {:?}, expected {:?}); it may be encrypted",
        path.display(),
        String::from_utf8_lossy(&hdr.magic.0),
        String::from_utf8_lossy(MAGIC)
    )))
}

/// Read and magic-check the headers of a container without extracting.
pub fn open_image(path: &Path) -> Result<(ImageHeader, Vec<FileEntry>)> {
    let mut f = BufReader::new(File::open(path).at(path)?);
    let hdr = header::read_main_header(&mut f).at(path)?;
    check_magic(path, &hdr)?;
    let entries =
        header::read_all_file_entries(&mut f, hdr.num_files, hdr.record_len()).at(path)?;
    Ok((hdr, entries))
}

/// Unpack `image` into `out_dir`: every payload, `image.cfg`, then a
/// read-only checksum scan. Header problems abort; per-entry problems are
/// recorded in the report and the next entry is processed.
pub fn extract(image: &Path, out_dir: &Path, opts: &ExtractOptions) -> Result<ExtractReport> {
    let (hdr, entries) = open_image(image)?;
    let mut src = File::open(image).at(image)?;
    let image_len = src.metadata().at(image)?.len();

    fs::create_dir_all(out_dir).at(out_dir)?;
    let manifest_path = out_dir.join(MANIFEST_NAME);
    manifest::write_manifest(&manifest_path, &hdr, &entries)?;
    info!(path = %manifest_path.display(), "manifest written");

    let mut files = Vec::with_capacity(entries.len());
    for (index, fe) in entries.iter().enumerate() {
        let name = fe.name();
        let outcome = match extract_entry(&mut src, image_len, out_dir, fe, opts.path_policy) {
            Ok(o) => o,
            Err(e) => EntryOutcome::Skipped { reason: e.to_string() },
        };
        match &outcome {
            EntryOutcome::Extracted { bytes } => info!(file = %name, bytes, "extracted"),
            EntryOutcome::Truncated { bytes, expected } => {
                warn!(file = %name, bytes, expected, "payload truncated by end of image")
            }
            EntryOutcome::Skipped { reason } => warn!(file = %name, %reason, "entry skipped"),
        }
        files.push(EntryReport { index, name, outcome });
    }

    let checksums = if opts.verify_checksums {
        match checksum::verify_or_repair(out_dir, false) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "checksum scan failed");
                None
            }
        }
    } else {
        None
    };

    Ok(ExtractReport { header: hdr, entries, files, manifest_path, checksums })
}

fn extract_entry(
    src: &mut File,
    image_len: u64,
    out_dir: &Path,
    fe: &FileEntry,
    policy: PathPolicy,
) -> Result<EntryOutcome> {
    let rel = PathBuf::from(fe.name());
    let dest = validate_path(out_dir, &rel, policy)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }

    let expected = fe.original_length as u64;
    let start = fe.offset as u64;
    if start > image_len {
        return Err(WtyError::Format(format!(
            "payload offset {start:#x} lies past the end of the image ({image_len:#x})"
        )));
    }

    let mut out = File::create(&dest).at(&dest)?;
    src.seek(SeekFrom::Start(start)).at(&dest)?;
    let bytes = io::copy(&mut io::Read::take(&mut *src, expected), &mut out).at(&dest)?;
    if bytes < expected {
        return Ok(EntryOutcome::Truncated { bytes, expected });
    }
    Ok(EntryOutcome::Extracted { bytes })
}
