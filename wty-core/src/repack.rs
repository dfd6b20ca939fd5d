use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::checksum::{self, ChecksumReport};
use crate::error::{IoContext, Result, WtyError};
use crate::header::{
    self, align_up, FileEntry, ImageHeader, PayloadSource, FILENAME_LEN, MIN_RECORD_LEN,
    PAYLOAD_ALIGN,
};
use crate::manifest::{self, ManifestStrictness, MANIFEST_NAME};
use crate::path_safety::{validate_path, PathPolicy};

#[derive(Clone, Copy, Debug)]
pub struct RepackOptions {
    /// Rewrite stale `V*.fex` side-files before packing.
    pub repair_checksums: bool,
    pub strictness: ManifestStrictness,
    pub path_policy: PathPolicy,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            repair_checksums: true,
            strictness: ManifestStrictness::default(),
            path_policy: PathPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepackReport {
    pub checksums: Option<ChecksumReport>,
    pub manifest_warnings: Vec<String>,
    /// Header and entries exactly as written.
    pub header: ImageHeader,
    pub entries: Vec<FileEntry>,
    pub bytes_written: u64,
}

/// Derive the on-disk layout from the current payload sizes.
///
/// Works on copies: payloads are packed contiguously in declaration order
/// right after the record array, each padded to 16 bytes. Manifest values
/// for offset and both lengths are ignored.
pub fn plan_layout(
    header: &ImageHeader,
    entries: &[FileEntry],
    sizes: &[u64],
) -> Result<(ImageHeader, Vec<FileEntry>)> {
    if entries.len() != sizes.len() {
        return Err(WtyError::Format(format!(
            "{} entries but {} payload sizes",
            entries.len(),
            sizes.len()
        )));
    }
    let mut hdr = header.clone();
    hdr.file_header_length = hdr.record_len();
    if hdr.file_header_length < MIN_RECORD_LEN {
        return Err(WtyError::Format(format!(
            "file_header_length {:#x} is below the minimum {MIN_RECORD_LEN:#x}",
            hdr.file_header_length
        )));
    }
    hdr.num_files = u32::try_from(entries.len())
        .map_err(|_| WtyError::Format("too many entries".into()))?;

    let too_big = |what: &str| WtyError::Format(format!("{what} exceeds the 32-bit format limit"));
    let mut running = hdr.headers_end(entries.len());
    let mut out = Vec::with_capacity(entries.len());
    for (fe, &size) in entries.iter().zip(sizes) {
        let mut fe = fe.clone();
        let original = u32::try_from(size)
            .ok()
            .filter(|&n| n <= u32::MAX - (PAYLOAD_ALIGN - 1))
            .ok_or_else(|| too_big(&format!("size of {}", fe.name())))?;
        fe.original_length = original;
        fe.stored_length = align_up(original);
        fe.offset = u32::try_from(running).map_err(|_| too_big("image size"))?;
        if (fe.filename_length as usize) < fe.filename.as_bytes().len() {
            fe.filename_length = FILENAME_LEN as u32;
        }
        running += fe.stored_length as u64;
        debug!(file = %fe.name(), offset = fe.offset, stored = fe.stored_length, "layout");
        out.push(fe);
    }
    hdr.total_image_size = u32::try_from(running).map_err(|_| too_big("image size"))?;
    Ok((hdr, out))
}

/// Payloads read from regular files in a dump directory.
pub struct DirPayloads {
    paths: Vec<PathBuf>,
}

impl DirPayloads {
    /// `paths[i]` supplies entry `i`.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl PayloadSource for DirPayloads {
    fn open_payload(&mut self, index: usize, entry: &FileEntry) -> Result<Box<dyn Read + '_>> {
        let path = self.paths.get(index).ok_or_else(|| {
            WtyError::Format(format!("no payload file for entry {index} ({})", entry.name()))
        })?;
        let f = File::open(path).at(path)?;
        info!(file = %entry.name(), bytes = entry.original_length, "packing");
        Ok(Box::new(BufReader::new(f)))
    }
}

/// Rebuild a container from `dump_dir` into `output`.
///
/// The image is written to a temporary file next to `output` and renamed
/// over it only once complete, so a failed repack leaves `output` as it was.
pub fn repack(dump_dir: &Path, output: &Path, opts: &RepackOptions) -> Result<RepackReport> {
    let checksums = if opts.repair_checksums {
        Some(checksum::verify_or_repair(dump_dir, true)?)
    } else {
        None
    };

    let mf = manifest::load_manifest(&dump_dir.join(MANIFEST_NAME), opts.strictness)?;

    let mut paths = Vec::with_capacity(mf.entries.len());
    let mut sizes = Vec::with_capacity(mf.entries.len());
    for fe in &mf.entries {
        let path = validate_path(dump_dir, Path::new(&fe.name()), opts.path_policy)?;
        let meta = std::fs::metadata(&path).at(&path)?;
        if !meta.is_file() {
            return Err(WtyError::Format(format!("{} is not a regular file", path.display())));
        }
        sizes.push(meta.len());
        paths.push(path);
    }

    let (hdr, entries) = plan_layout(&mf.header, &mf.entries, &sizes)?;

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut builder = tempfile::Builder::new();
    builder.prefix(".wty-repack-");
    // Keep an existing image's mode; otherwise the usual 0666 less umask.
    let existing =
        std::fs::metadata(output).ok().filter(|m| m.is_file()).map(|m| m.permissions());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    let mut tmp = builder.tempfile_in(&parent).at(&parent)?;
    let bytes_written = {
        let mut w = BufWriter::new(tmp.as_file_mut());
        header::write_container(&mut w, &hdr, &entries, &mut DirPayloads::new(paths))?
    };
    tmp.as_file().sync_all().at(tmp.path())?;
    tmp.persist(output).map_err(|e| WtyError::io(output, e.error))?;
    if let Some(perms) = existing {
        std::fs::set_permissions(output, perms).at(output)?;
    }

    info!(
        output = %output.display(),
        bytes = bytes_written,
        files = entries.len(),
        "repack complete"
    );
    Ok(RepackReport {
        checksums,
        manifest_warnings: mf.warnings,
        header: hdr,
        entries,
        bytes_written,
    })
}
