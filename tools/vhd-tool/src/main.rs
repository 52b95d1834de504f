use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vhd_engine::{
    vhd_timestamp, DiskType, Extent, FooterSource, StdFileBackend, VhdCreateOptions, VhdDisk,
    VhdImageInfo, VhdOpenOptions, DEFAULT_BLOCK_SIZE, SECTOR_SIZE,
};

// Refuse to dump more than this to a terminal in one go.
const MAX_READ_LEN: u64 = 64 * 1024 * 1024;
const CHECK_CHUNK: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "vhd-tool", about = "Create, inspect, read and write VHD disk images.")]
struct Args {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new fixed or dynamic image
    Create {
        path: PathBuf,

        /// Virtual disk size (bytes, or with a K/M/G/T suffix)
        #[arg(long, value_name = "SIZE", value_parser = parse_size)]
        size: u64,

        #[arg(long = "type", value_enum, default_value_t = ImageType::Dynamic)]
        disk_type: ImageType,

        /// Dynamic disk block size (power of two)
        #[arg(long, value_name = "SIZE", value_parser = parse_size, default_value_t = u64::from(DEFAULT_BLOCK_SIZE))]
        block_size: u64,

        /// Unique id to record (random if omitted)
        #[arg(long, value_name = "UUID")]
        uuid: Option<Uuid>,

        /// Discard the previous contents of an existing file
        #[arg(long, action = clap::ArgAction::SetTrue)]
        wipe: bool,

        /// Overwrite an existing file
        #[arg(long, action = clap::ArgAction::SetTrue)]
        force: bool,
    },

    /// Describe an image without modifying it
    Info {
        path: PathBuf,

        /// Emit JSON instead of text
        #[arg(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },

    /// Dump a byte range of the virtual disk
    Read {
        path: PathBuf,

        #[arg(long, value_parser = parse_size, default_value_t = 0)]
        offset: u64,

        #[arg(long, value_parser = parse_size, default_value_t = SECTOR_SIZE as u64)]
        length: u64,

        /// Write raw bytes to stdout instead of a hex dump
        #[arg(long, action = clap::ArgAction::SetTrue)]
        raw: bool,
    },

    /// Write a byte pattern or a file's contents into the virtual disk
    Write {
        path: PathBuf,

        #[arg(long, value_parser = parse_size, default_value_t = 0)]
        offset: u64,

        /// Fill byte (decimal or 0x-prefixed hex); requires --length
        #[arg(long, value_parser = parse_byte, conflicts_with = "input", requires = "length")]
        pattern: Option<u8>,

        #[arg(long, value_parser = parse_size)]
        length: Option<u64>,

        /// File whose contents are written
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Open the image and read every sector
    Check {
        path: PathBuf,

        /// Suppress progress output
        #[arg(long, action = clap::ArgAction::SetTrue)]
        quiet: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ImageType {
    Fixed,
    Dynamic,
}

#[derive(Debug, Serialize)]
struct InfoJson {
    disk_type: &'static str,
    virtual_size: u64,
    file_len: u64,
    footer_source: &'static str,
    unique_id: String,
    timestamp: u32,
    creator_app: String,
    creator_version: String,
    creator_os: String,
    saved_state: bool,
    geometry: GeometryJson,
    #[serde(skip_serializing_if = "Option::is_none")]
    dynamic: Option<DynamicJson>,
}

#[derive(Debug, Serialize)]
struct GeometryJson {
    cylinders: u16,
    heads: u8,
    sectors_per_track: u8,
}

#[derive(Debug, Serialize)]
struct DynamicJson {
    block_size: u32,
    max_table_entries: u32,
    table_offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    allocated_blocks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<ParentJson>,
}

#[derive(Debug, Serialize)]
struct ParentJson {
    unique_id: String,
    timestamp: u32,
    name: String,
    locators: Vec<LocatorJson>,
}

#[derive(Debug, Serialize)]
struct LocatorJson {
    platform_code: String,
    data_offset: u64,
    data_length: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    run(args.command)
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Create {
            path,
            size,
            disk_type,
            block_size,
            uuid,
            wipe,
            force,
        } => create(&path, size, disk_type, block_size, uuid, wipe, force),
        Command::Info { path, json } => info(&path, json),
        Command::Read {
            path,
            offset,
            length,
            raw,
        } => read(&path, offset, length, raw),
        Command::Write {
            path,
            offset,
            pattern,
            length,
            input,
        } => write(&path, offset, pattern, length, input.as_deref()),
        Command::Check { path, quiet } => check(&path, quiet),
    }
}

fn create(
    path: &Path,
    size: u64,
    disk_type: ImageType,
    block_size: u64,
    uuid: Option<Uuid>,
    wipe: bool,
    force: bool,
) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let block_size = u32::try_from(block_size).context("block size does not fit in 32 bits")?;
    let options = match disk_type {
        ImageType::Fixed => VhdCreateOptions::fixed(size),
        ImageType::Dynamic => VhdCreateOptions::dynamic(size).with_block_size(block_size),
    }
    .with_unique_id(uuid.unwrap_or_else(Uuid::new_v4))
    .with_timestamp(vhd_timestamp(SystemTime::now()))
    .with_wipe_out(wipe);

    let backend = if wipe {
        StdFileBackend::create(path)
    } else {
        StdFileBackend::open_or_create(path)
    }
    .with_context(|| format!("create {}", path.display()))?;
    let disk = VhdDisk::create(backend, options).context("lay out vhd image")?;
    let file_size = disk.file_size();
    disk.close().context("flush new image")?;

    println!(
        "created {} ({} bytes virtual, {} bytes on disk)",
        path.display(),
        size,
        file_size
    );
    Ok(())
}

fn probe(path: &Path) -> anyhow::Result<VhdImageInfo> {
    let mut backend = StdFileBackend::open_read_only(path)
        .with_context(|| format!("open {}", path.display()))?;
    VhdDisk::probe(&mut backend).with_context(|| format!("probe {}", path.display()))
}

fn open_read_only(path: &Path) -> anyhow::Result<VhdDisk<StdFileBackend>> {
    let backend = StdFileBackend::open_read_only(path)
        .with_context(|| format!("open {}", path.display()))?;
    let options = VhdOpenOptions {
        read_only: true,
        ..VhdOpenOptions::default()
    };
    VhdDisk::open_with(backend, options).with_context(|| format!("open vhd {}", path.display()))
}

fn fourcc(code: [u8; 4]) -> String {
    code.iter()
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
        .collect()
}

fn info(path: &Path, json: bool) -> anyhow::Result<()> {
    let probed = probe(path)?;
    let footer = &probed.footer;

    // Differencing disks cannot be opened, so only dynamic disks report allocation.
    let allocated_blocks = if footer.disk_type == DiskType::Dynamic {
        Some(open_read_only(path)?.allocated_blocks())
    } else {
        None
    };

    let report = InfoJson {
        disk_type: footer.disk_type.name(),
        virtual_size: footer.current_size,
        file_len: probed.file_len,
        footer_source: match probed.footer_source {
            FooterSource::Trailing => "trailing",
            FooterSource::HeaderCopy => "header-copy",
        },
        unique_id: footer.unique_id.to_string(),
        timestamp: footer.timestamp,
        creator_app: fourcc(footer.creator_app),
        creator_version: format!(
            "{}.{}",
            footer.creator_version >> 16,
            footer.creator_version & 0xFFFF
        ),
        creator_os: fourcc(footer.creator_os),
        saved_state: footer.saved_state,
        geometry: GeometryJson {
            cylinders: footer.geometry.cylinders,
            heads: footer.geometry.heads,
            sectors_per_track: footer.geometry.sectors_per_track,
        },
        dynamic: probed.dynamic_header.as_ref().map(|h| DynamicJson {
            block_size: h.block_size,
            max_table_entries: h.max_table_entries,
            table_offset: h.table_offset,
            allocated_blocks,
            parent: (footer.disk_type == DiskType::Differencing).then(|| ParentJson {
                unique_id: h.parent_unique_id.to_string(),
                timestamp: h.parent_timestamp,
                name: h.parent_name.clone(),
                locators: h
                    .parent_locators
                    .iter()
                    .filter(|l| !l.is_empty())
                    .map(|l| LocatorJson {
                        platform_code: fourcc(l.platform_code),
                        data_offset: l.data_offset,
                        data_length: l.data_length,
                    })
                    .collect(),
            }),
        }),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("type:          {}", report.disk_type);
    println!("virtual size:  {} bytes", report.virtual_size);
    println!("file length:   {} bytes", report.file_len);
    println!("footer:        {}", report.footer_source);
    println!("unique id:     {}", report.unique_id);
    println!(
        "creator:       {} {} ({})",
        report.creator_app, report.creator_version, report.creator_os
    );
    println!(
        "geometry:      {}/{}/{}",
        report.geometry.cylinders, report.geometry.heads, report.geometry.sectors_per_track
    );
    if report.saved_state {
        println!("saved state:   yes (image is read-only)");
    }
    if let Some(dynamic) = &report.dynamic {
        println!("block size:    {} bytes", dynamic.block_size);
        println!("bat entries:   {}", dynamic.max_table_entries);
        if let Some(allocated) = dynamic.allocated_blocks {
            println!("allocated:     {allocated} blocks");
        }
        if let Some(parent) = &dynamic.parent {
            println!("parent:        {} ({})", parent.name, parent.unique_id);
            for locator in &parent.locators {
                println!(
                    "  locator {} at {} ({} bytes)",
                    locator.platform_code, locator.data_offset, locator.data_length
                );
            }
        }
    }
    Ok(())
}

fn read(path: &Path, offset: u64, length: u64, raw: bool) -> anyhow::Result<()> {
    if length > MAX_READ_LEN {
        bail!("refusing to read more than {MAX_READ_LEN} bytes at once");
    }
    let mut disk = open_read_only(path)?;
    let mut buf = vec![0u8; length as usize];
    disk.read_disk(offset, &mut buf)
        .with_context(|| format!("read {length} bytes at offset {offset}"))?;

    let mut out = io::stdout().lock();
    if raw {
        out.write_all(&buf)?;
    } else {
        hex_dump(&mut out, offset, &buf)?;
    }
    out.flush()?;
    Ok(())
}

fn hex_dump(out: &mut impl Write, base: u64, data: &[u8]) -> io::Result<()> {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = line
            .iter()
            .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
            .collect();
        writeln!(
            out,
            "{:08x}  {:<47}  |{}|",
            base + (i * 16) as u64,
            hex.join(" "),
            ascii
        )?;
    }
    Ok(())
}

fn write(
    path: &Path,
    offset: u64,
    pattern: Option<u8>,
    length: Option<u64>,
    input: Option<&Path>,
) -> anyhow::Result<()> {
    let data = match (pattern, input) {
        (Some(byte), None) => {
            let length = length.context("--pattern requires --length")?;
            if length > MAX_READ_LEN {
                bail!("refusing to write more than {MAX_READ_LEN} bytes at once");
            }
            vec![byte; length as usize]
        }
        (None, Some(input)) => {
            fs::read(input).with_context(|| format!("read {}", input.display()))?
        }
        _ => bail!("exactly one of --pattern or --input is required"),
    };

    let backend =
        StdFileBackend::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut disk =
        VhdDisk::open(backend).with_context(|| format!("open vhd {}", path.display()))?;
    let blocks_before = disk.allocated_blocks();
    disk.write_disk(offset, &data)
        .with_context(|| format!("write {} bytes at offset {offset}", data.len()))?;
    debug!(
        new_blocks = disk.allocated_blocks() - blocks_before,
        "write complete"
    );
    disk.close().context("flush image")?;

    println!("wrote {} bytes at offset {offset}", data.len());
    Ok(())
}

fn check(path: &Path, quiet: bool) -> anyhow::Result<()> {
    let probed = probe(path)?;
    if probed.footer_source == FooterSource::HeaderCopy {
        eprintln!("warning: trailing footer is damaged; opened from the copy at offset 0");
    }

    let mut disk = open_read_only(path)?;
    let total = disk.virtual_size();
    let mut buf = vec![0u8; CHECK_CHUNK];
    let mut offset = 0u64;
    let mut data_bytes = 0u64;
    let mut last_report = Instant::now();

    while offset < total {
        let want = (total - offset).min(CHECK_CHUNK as u64) as usize;
        let extent = disk
            .read_aligned(offset, &mut buf[..want])
            .with_context(|| format!("read at offset {offset}"))?;
        if let Extent::Data(n) = extent {
            data_bytes += n as u64;
        }
        offset += extent.len() as u64;
        maybe_report_progress(&mut last_report, offset, total, quiet)?;
    }
    if !quiet {
        eprintln!();
    }

    println!(
        "ok: {} ({} bytes virtual, {} bytes with data)",
        disk.disk_type().name(),
        total,
        data_bytes
    );
    Ok(())
}

fn maybe_report_progress(
    last_report: &mut Instant,
    processed: u64,
    total: u64,
    quiet: bool,
) -> io::Result<()> {
    if quiet {
        return Ok(());
    }
    let now = Instant::now();
    if processed == total || now.duration_since(*last_report) >= Duration::from_millis(250) {
        *last_report = now;
        let pct = if total == 0 {
            100u64
        } else {
            ((processed as u128).saturating_mul(100) / total as u128) as u64
        };
        eprint!("\rchecking: {pct:3}% ({processed}/{total} bytes)");
        io::stderr().flush()?;
    }
    Ok(())
}

fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(format!("unknown size suffix '{c}'")),
            };
            (&s[..i], shift)
        }
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert!(parse_size("3Q").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn parse_byte_accepts_hex_and_decimal() {
        assert_eq!(parse_byte("0xAA").unwrap(), 0xAA);
        assert_eq!(parse_byte("17").unwrap(), 17);
        assert!(parse_byte("256").is_err());
    }

    #[test]
    fn hex_dump_formats_lines() {
        let mut out = Vec::new();
        hex_dump(&mut out, 0x200, b"AB\0").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("00000200  41 42 00"));
        assert!(text.trim_end().ends_with("|AB.|"));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
