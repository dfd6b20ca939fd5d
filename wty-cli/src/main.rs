use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use wty_core::checksum::{self, ChecksumReport, ChecksumStatus};
use wty_core::extract::{default_dump_dir, EntryOutcome};
use wty_core::manifest::load_manifest;
use wty_core::{ExtractOptions, FileEntry, ImageHeader, ManifestStrictness, RepackOptions};

#[derive(Parser)]
#[command(name = "wty", version, about = "Extract and repack Allwinner IMAGEWTY firmware images")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show the main header and file records of an image
    Info {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Extract every file plus image.cfg into a dump directory
    Extract {
        image: PathBuf,
        /// Defaults to <image>.dump in the current directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        no_verify: bool,
    },
    /// Rebuild an image from a dump directory
    Repack {
        dump_dir: PathBuf,
        output: PathBuf,
        /// Leave stale V*.fex side-files untouched
        #[arg(long, default_value_t = false)]
        no_repair: bool,
        /// Reject manifests with missing or unterminated file blocks
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Show the contents of an image.cfg manifest
    Config {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Check V*.fex side-files in a dump directory
    Verify {
        dump_dir: PathBuf,
        /// Rewrite side-files that do not match
        #[arg(long, default_value_t = false)]
        repair: bool,
    },
    /// Print the word-sum checksum of a file
    Checksum { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.cmd {
        Cmd::Info { image, json } => info(&image, json)?,
        Cmd::Extract { image, output, no_verify } => extract(&image, output, no_verify)?,
        Cmd::Repack { dump_dir, output, no_repair, strict } => {
            repack(&dump_dir, &output, no_repair, strict)?
        }
        Cmd::Config { manifest, json, strict } => config(&manifest, json, strict)?,
        Cmd::Verify { dump_dir, repair } => verify(&dump_dir, repair)?,
        Cmd::Checksum { file } => {
            let sum = checksum::compute_file(&file)
                .with_context(|| format!("read {}", file.display()))?;
            println!("0x{sum:08X}  {}", file.display());
        }
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[derive(Serialize)]
struct ImageView<'a> {
    header: &'a ImageHeader,
    entries: &'a [FileEntry],
}

fn print_view(header: &ImageHeader, entries: &[FileEntry], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(&ImageView { header, entries })?;
        println!("{out}");
        return Ok(());
    }
    println!("Magic            {}", header.magic);
    println!("Header version   0x{:08X}", header.header_version);
    println!("Format version   0x{:08X}", header.format_version);
    println!("Total size       {} bytes", header.total_image_size);
    println!("Record length    0x{:X}", header.file_header_length);
    println!("USB PID/VID      0x{:08X} / 0x{:08X}", header.usb_product_id, header.usb_vendor_id);
    println!("Hardware ID      0x{:08X}", header.hardware_id);
    println!("Firmware ID      0x{:08X}", header.firmware_id);
    println!("Files            {}", header.num_files);
    println!();
    println!(
        "{:>4}  {:<32} {:<8} {:<16} {:>10} {:>10} {:>10}",
        "#", "Name", "Main", "Sub", "Stored", "Original", "Offset"
    );
    for (i, fe) in entries.iter().enumerate() {
        println!(
            "{:>4}  {:<32} {:<8} {:<16} {:>10} {:>10} 0x{:08X}",
            i + 1,
            fe.filename,
            fe.maintype,
            fe.subtype,
            fe.stored_length,
            fe.original_length,
            fe.offset
        );
    }
    Ok(())
}

fn info(image: &Path, json: bool) -> Result<()> {
    let (hdr, entries) =
        wty_core::open_image(image).with_context(|| format!("open {}", image.display()))?;
    print_view(&hdr, &entries, json)
}

fn config(path: &Path, json: bool, strict: bool) -> Result<()> {
    let mf = load_manifest(path, strictness(strict))
        .with_context(|| format!("load {}", path.display()))?;
    print_view(&mf.header, &mf.entries, json)
}

fn strictness(strict: bool) -> ManifestStrictness {
    if strict {
        ManifestStrictness::Strict
    } else {
        ManifestStrictness::Lenient
    }
}

fn extract(image: &Path, output: Option<PathBuf>, no_verify: bool) -> Result<()> {
    let out_dir = output.unwrap_or_else(|| default_dump_dir(image));
    let opts = ExtractOptions { verify_checksums: !no_verify, ..Default::default() };
    let report = wty_core::extract(image, &out_dir, &opts)
        .with_context(|| format!("extract {}", image.display()))?;
    for f in &report.files {
        match &f.outcome {
            EntryOutcome::Extracted { bytes } => println!("Extracted  {} ({bytes} bytes)", f.name),
            EntryOutcome::Truncated { bytes, expected } => {
                println!("Truncated  {} ({bytes} of {expected} bytes)", f.name)
            }
            EntryOutcome::Skipped { reason } => println!("Skipped    {}: {reason}", f.name),
        }
    }
    println!("Manifest   {}", report.manifest_path.display());
    if let Some(cs) = &report.checksums {
        print_checksums(cs);
    }
    if report.problem_count() > 0 {
        bail!(
            "{} of {} entries were not fully extracted",
            report.problem_count(),
            report.files.len()
        );
    }
    Ok(())
}

fn repack(dump_dir: &Path, output: &Path, no_repair: bool, strict: bool) -> Result<()> {
    let opts = RepackOptions {
        repair_checksums: !no_repair,
        strictness: strictness(strict),
        ..Default::default()
    };
    let report = wty_core::repack(dump_dir, output, &opts)
        .with_context(|| format!("repack {} -> {}", dump_dir.display(), output.display()))?;
    if let Some(cs) = &report.checksums {
        print_checksums(cs);
    }
    for w in &report.manifest_warnings {
        println!("Warning    {w}");
    }
    for fe in &report.entries {
        println!("Packed     {} ({} bytes)", fe.filename, fe.original_length);
    }
    println!("Wrote      {} ({} bytes)", output.display(), report.bytes_written);
    Ok(())
}

fn verify(dump_dir: &Path, repair: bool) -> Result<()> {
    let report = checksum::verify_or_repair(dump_dir, repair)
        .with_context(|| format!("scan {}", dump_dir.display()))?;
    print_checksums(&report);
    if !report.all_ok() {
        bail!(
            "{} mismatched, {} unreadable",
            report.mismatch_count(),
            report.error_count()
        );
    }
    println!("OK");
    Ok(())
}

fn print_checksums(report: &ChecksumReport) {
    for o in &report.outcomes {
        match &o.status {
            ChecksumStatus::Ok { value } => println!("[OK]   {} (0x{value:08X})", o.target),
            ChecksumStatus::Mismatch { expected, actual } => println!(
                "[FAIL] {} expected 0x{expected:08X}, got 0x{actual:08X}",
                o.target
            ),
            ChecksumStatus::Repaired { old, new } => {
                println!("[FIX]  {} 0x{old:08X} -> 0x{new:08X}", o.target)
            }
            ChecksumStatus::Unreadable { reason } => println!("[ERR]  {}: {reason}", o.target),
            ChecksumStatus::BadSideFile { reason } => println!("[ERR]  {}: {reason}", o.side_file),
            ChecksumStatus::WriteFailed { reason, .. } => {
                println!("[ERR]  {}: cannot update: {reason}", o.side_file)
            }
        }
    }
}
