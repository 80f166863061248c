//! Chunk reader - inspects a single chunk image.
//!
//! Lists the files a chunk carries, or extracts one of them back to disk.
//! Extraction verifies the stored CRC-32C; a mismatch is reported loudly
//! but the (possibly corrupted) bytes are still written, since a partial
//! restore beats none at all.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use memmap2::Mmap;
use nix::unistd::{Gid, Group, Uid, User};
use tracing::{error, warn};

use tape_daemon::chunk::format::{parse_chunk, FileEntry, ParsedChunk};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the chunk file to inspect
    #[arg(long = "in", value_name = "FILE")]
    input: Option<PathBuf>,

    /// Index of the file entry to extract into the current directory
    #[arg(long, value_name = "INDEX")]
    extract: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let Some(input) = args.input else {
        eprintln!("No input chunk was specified (--in <FILE>)");
        return ExitCode::FAILURE;
    };

    match run(&input, args.extract) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(input: &Path, extract: Option<usize>) -> Result<()> {
    let file = File::open(input)
        .with_context(|| format!("cannot open chunk file {}", input.display()))?;
    // Safety: read-only mapping of a file we do not modify.
    let image = unsafe { Mmap::map(&file) }
        .with_context(|| format!("cannot map chunk file {}", input.display()))?;

    let parsed = parse_chunk(&image).context("cannot parse chunk image")?;

    println!(
        "Chunk {} of job {} ({} bytes, {} file entries)",
        parsed.header.chunk_index,
        parsed.header.job_uuid,
        parsed.header.chunk_len,
        parsed.header.num_entries,
    );

    match extract {
        None => list_files(&parsed),
        Some(index) => {
            let outcome = extract_entry(&parsed, &image, index, Path::new("."))?;
            if !outcome.crc_ok {
                error!("CRC MISMATCH DETECTED; THIS FILE MAY HAVE BEEN CORRUPTED!");
            }
            println!(
                "Wrote {} bytes to {}",
                outcome.bytes_written,
                outcome.output.display()
            );
            Ok(())
        }
    }
}

fn list_files(parsed: &ParsedChunk) -> Result<()> {
    for (index, entry) in parsed.entries.iter().enumerate() {
        print_file_info(index, entry);
    }
    Ok(())
}

fn print_file_info(index: usize, entry: &FileEntry) {
    println!("File {index}");
    println!("\tName: {}", entry.name);
    println!(
        "\tMode: {:o}; owner {}({}) group {}({})",
        entry.mode,
        name_for_uid(entry.owner),
        entry.owner,
        name_for_gid(entry.group),
        entry.group,
    );
    println!(
        "\tSize: {} (chunk offset = {}, length = {}, original file offset = {})",
        entry.size, entry.blob_start, entry.blob_len, entry.blob_file_offset,
    );
}

fn name_for_uid(uid: u32) -> String {
    User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| "<<< User not found >>>".to_string())
}

fn name_for_gid(gid: u32) -> String {
    Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| group.name)
        .unwrap_or_else(|| "<<< Group not found >>>".to_string())
}

struct ExtractOutcome {
    output: PathBuf,
    bytes_written: u64,
    crc_ok: bool,
}

/// Extract entry `index` into `out_dir`, named after the entry's basename.
/// The blob is written at its original file offset and the stored mode is
/// applied, so the parts of a split file can be layered into one output.
fn extract_entry(
    parsed: &ParsedChunk,
    image: &[u8],
    index: usize,
    out_dir: &Path,
) -> Result<ExtractOutcome> {
    let Some(entry) = parsed.entries.get(index) else {
        bail!(
            "no file entry at index {index} (chunk has {})",
            parsed.entries.len()
        );
    };

    print_file_info(index, entry);

    if entry.is_directory() {
        bail!("entry {index} is a directory, nothing to extract");
    }
    if entry.is_partial() {
        warn!(
            "the file's entire data is not contained in this chunk; \
             re-run with the subsequent chunks to complete it"
        );
    }

    let blob = parsed
        .blob_bytes(image, entry)
        .context("blob range is out of bounds")?;

    let crc_ok = match parsed.verify_entry_checksum(image, entry) {
        Ok(()) => true,
        Err(err) => {
            error!("{err}; proceeding with extraction anyways");
            false
        }
    };

    // Only the basename matters; the original directory layout does not.
    let name = Path::new(&entry.name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("extracted.bin"));
    let output = out_dir.join(name);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .mode(entry.mode & 0o7777)
        .open(&output)
        .with_context(|| format!("cannot open {} for writing", output.display()))?;

    file.seek(SeekFrom::Start(entry.blob_file_offset))?;
    file.write_all(blob)?;

    Ok(ExtractOutcome {
        output,
        bytes_written: entry.blob_len,
        crc_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tape_daemon::chunk::AddFileStatus;
    use tape_daemon::fs::source::FileSource;
    use tape_daemon::packer::{ChunkPacker, PackerConfig};
    use tempfile::TempDir;

    /// Pack a real file into a chunk image on disk, as the daemon would.
    fn chunk_image_for(data: &[u8], name: &str) -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().unwrap();
        let source_path = dir.path().join(name);
        fs::write(&source_path, data).unwrap();

        let packer = ChunkPacker::new(PackerConfig {
            max_chunk_size: 4 * 1024 * 1024,
            header_reserved: 128 * 1024,
            min_free_space: 16 * 1024,
        });
        let mut chunk = packer.new_chunk();
        let handle = FileSource::new(source_path.clone(), 0, None).into_handle();
        assert!(matches!(
            packer.add_file(&mut chunk, &handle),
            AddFileStatus::Success
        ));
        packer.finalize(&mut chunk).unwrap();
        chunk.set_index(0);

        let chunk_path = dir.path().join("0.chunk");
        fs::write(&chunk_path, chunk.image().unwrap()).unwrap();
        (dir, chunk_path, source_path)
    }

    #[test]
    fn test_list_and_extract_roundtrip() {
        let data = b"some file contents worth keeping";
        let (dir, chunk_path, _source) = chunk_image_for(data, "keepsake.txt");

        let file = File::open(&chunk_path).unwrap();
        let image = unsafe { Mmap::map(&file) }.unwrap();
        let parsed = parse_chunk(&image).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].size, data.len() as u64);

        let out_dir = dir.path().join("out");
        fs::create_dir(&out_dir).unwrap();
        let outcome = extract_entry(&parsed, &image, 0, &out_dir).unwrap();

        assert!(outcome.crc_ok);
        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert_eq!(outcome.output, out_dir.join("keepsake.txt"));
        assert_eq!(fs::read(&outcome.output).unwrap(), data);
    }

    #[test]
    fn test_corrupted_blob_still_extracts() {
        let data = vec![0x5Au8; 4096];
        let (dir, chunk_path, _source) = chunk_image_for(&data, "victim.bin");

        // Flip one byte inside the blob region.
        let mut image_bytes = fs::read(&chunk_path).unwrap();
        let parsed = parse_chunk(&image_bytes).unwrap();
        let blob_start = parsed.entries[0].blob_start as usize;
        image_bytes[blob_start + 100] ^= 0xFF;
        fs::write(&chunk_path, &image_bytes).unwrap();

        let file = File::open(&chunk_path).unwrap();
        let image = unsafe { Mmap::map(&file) }.unwrap();
        let parsed = parse_chunk(&image).unwrap();

        let out_dir = dir.path().join("out");
        fs::create_dir(&out_dir).unwrap();
        let outcome = extract_entry(&parsed, &image, 0, &out_dir).unwrap();

        // Mismatch is reported, extraction proceeds with corrupted bytes.
        assert!(!outcome.crc_ok);
        let extracted = fs::read(&outcome.output).unwrap();
        assert_eq!(extracted.len(), data.len());
        assert_ne!(extracted, data);
        assert_eq!(extracted[100], 0x5A ^ 0xFF);
    }

    #[test]
    fn test_extract_out_of_range() {
        let (dir, chunk_path, _source) = chunk_image_for(b"x", "one.bin");
        let file = File::open(&chunk_path).unwrap();
        let image = unsafe { Mmap::map(&file) }.unwrap();
        let parsed = parse_chunk(&image).unwrap();

        assert!(extract_entry(&parsed, &image, 5, dir.path()).is_err());
    }

    #[test]
    fn test_extract_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let source_path = dir.path().join("script.sh");
        fs::write(&source_path, b"#!/bin/sh\necho hi\n").unwrap();
        fs::set_permissions(&source_path, fs::Permissions::from_mode(0o754)).unwrap();

        let packer = ChunkPacker::new(PackerConfig {
            max_chunk_size: 1024 * 1024,
            header_reserved: 128 * 1024,
            min_free_space: 16 * 1024,
        });
        let mut chunk = packer.new_chunk();
        let handle = FileSource::new(source_path, 0, None).into_handle();
        assert!(matches!(
            packer.add_file(&mut chunk, &handle),
            AddFileStatus::Success
        ));
        packer.finalize(&mut chunk).unwrap();

        let image = chunk.image().unwrap();
        let parsed = parse_chunk(image).unwrap();

        let out_dir = dir.path().join("out");
        fs::create_dir(&out_dir).unwrap();
        let outcome = extract_entry(&parsed, image, 0, &out_dir).unwrap();

        let mode = fs::metadata(&outcome.output).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o754);
    }
}
