//! kvfs CLI - Admin Command Line Interface
//!
//! Opens a kvfs table directly and runs filesystem operations against it.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use kvfs_common::config::BackendKind;
use kvfs_common::{Config, FileAttr, FileType, join_path};
use kvfs_engine::Filesystem;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bytes moved per read/write call by `put` and `cat`
const COPY_CHUNK: usize = 256 * 1024;

#[derive(Parser, Debug)]
#[command(name = "kvfs-cli")]
#[command(about = "kvfs Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "kvfs.toml")]
    config: PathBuf,

    /// Database file (overrides [backend].path)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Backend kind (overrides [backend].kind)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Log level (overrides [logging].level)
    #[arg(long)]
    log_level: Option<String>,

    /// Print machine-readable JSON where supported
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Memory,
    Redb,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(short, long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Long listing with attributes
        #[arg(short, long)]
        long: bool,
    },
    /// Copy a local file (or stdin with `-`) into the filesystem
    Put {
        source: String,
        path: String,
        #[arg(short, long, default_value = "644", value_parser = parse_mode)]
        mode: u32,
    },
    /// Write a file's contents to stdout
    Cat { path: String },
    /// Remove a file, symlink or link
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Rename a file
    Mv { from: String, to: String },
    /// Create a hard link (or a symlink with -s)
    Ln {
        target: String,
        path: String,
        #[arg(short, long)]
        symbolic: bool,
    },
    /// Print a symlink's target
    Readlink { path: String },
    /// Show attributes
    Stat { path: String },
    /// Show filesystem statistics
    Statfs,
    /// Set a file's size
    Truncate {
        path: String,
        /// New size (e.g. 4096, 64K, 10M)
        #[arg(value_parser = parse_size)]
        size: u64,
    },
    /// Change permission bits
    Chmod {
        #[arg(value_parser = parse_mode)]
        mode: u32,
        path: String,
    },
    /// Change owner and/or group (`uid`, `uid:gid` or `:gid`)
    Chown { owner: String, path: String },
    /// Set access/modification time to now
    Touch { path: String },
    /// Recount hard links and repair stored counts
    Fsck,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|_| format!("invalid octal mode: '{s}'"))
}

/// Parse a human-readable size string (e.g. "64K", "10M", "1G") into bytes.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        (s, 1)
    };
    let value: u64 = num.parse().map_err(|_| format!("invalid size: '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: '{s}'"))
}

/// Format bytes as a human-readable size string.
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// `ls -l` style mode string
fn format_mode(attr: &FileAttr) -> String {
    let kind = match attr.kind {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::RegularFile => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (attr.mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn format_time(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map_or_else(|| secs.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn parse_owner(s: &str) -> Result<(Option<u32>, Option<u32>)> {
    let (uid, gid) = match s.split_once(':') {
        Some((u, g)) => (u, g),
        None => (s, ""),
    };
    let parse = |v: &str| -> Result<Option<u32>> {
        if v.is_empty() {
            Ok(None)
        } else {
            Ok(Some(v.parse().with_context(|| format!("invalid id '{v}'"))?))
        }
    };
    Ok((parse(uid)?, parse(gid)?))
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the file
    if let Some(db) = &args.db {
        config.backend.path.clone_from(db);
    }
    if let Some(kind) = args.backend {
        config.backend.kind = match kind {
            BackendArg::Memory => BackendKind::Memory,
            BackendArg::Redb => BackendKind::Redb,
        };
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

async fn put(fs: &Filesystem, source: &str, path: &str, mode: u32) -> Result<u64> {
    let mut reader: Box<dyn Read> = if source == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(
            std::fs::File::open(Path::new(source)).with_context(|| format!("opening {source}"))?,
        )
    };

    match fs.create(path, mode).await {
        Ok(_) => {}
        Err(kvfs_common::Error::AlreadyExists(_)) => fs.truncate(path, 0).await?,
        Err(e) => return Err(e.into()),
    }

    let mut buf = vec![0u8; COPY_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        fs.write(path, offset, &buf[..n]).await?;
        offset += n as u64;
    }
    Ok(offset)
}

async fn cat(fs: &Filesystem, path: &str) -> Result<()> {
    let size = fs.getattr(path).await?.size;
    let mut out = std::io::stdout().lock();
    let mut offset = 0u64;
    while offset < size {
        let chunk = fs.read(path, offset, COPY_CHUNK as u64).await?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    out.flush()?;
    Ok(())
}

fn attr_json(path: &str, attr: &FileAttr) -> serde_json::Value {
    serde_json::json!({
        "path": path,
        "ino": attr.ino,
        "type": format!("{:?}", attr.kind),
        "mode": format!("{:o}", attr.mode),
        "nlink": attr.nlink,
        "uid": attr.uid,
        "gid": attr.gid,
        "size": attr.size,
        "blocks": attr.blocks,
        "atime": attr.atime,
        "mtime": attr.mtime,
        "ctime": attr.ctime,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("Backend: {:?} at {}", config.backend.kind, config.backend.path.display());
    let fs = Filesystem::mount(&config)
        .await
        .with_context(|| format!("opening {}", config.backend.path.display()))?;

    match args.command {
        Commands::Mkdir { path, mode } => {
            fs.mkdir(&path, mode).await?;
        }
        Commands::Ls { path, long } => {
            let names = fs.readdir(&path).await?;
            let children = names.iter().filter(|n| *n != "." && *n != "..");
            if args.json {
                let mut rows = Vec::new();
                for name in children {
                    let full = join_path(&path, name);
                    rows.push(attr_json(&full, &fs.getattr(&full).await?));
                }
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if long {
                for name in children {
                    let full = join_path(&path, name);
                    let attr = fs.getattr(&full).await?;
                    println!(
                        "{} {:>3} {:>5} {:>5} {:>10} {} {}",
                        format_mode(&attr),
                        attr.nlink,
                        attr.uid,
                        attr.gid,
                        attr.size,
                        format_time(attr.mtime),
                        name
                    );
                }
            } else {
                for name in children {
                    println!("{name}");
                }
            }
        }
        Commands::Put { source, path, mode } => {
            let written = put(&fs, &source, &path, mode).await?;
            info!("Wrote {} to {}", format_size(written), path);
        }
        Commands::Cat { path } => cat(&fs, &path).await?,
        Commands::Rm { path } => fs.unlink(&path).await?,
        Commands::Rmdir { path } => fs.rmdir(&path).await?,
        Commands::Mv { from, to } => fs.rename(&from, &to).await?,
        Commands::Ln {
            target,
            path,
            symbolic,
        } => {
            if symbolic {
                fs.symlink(&target, &path).await?;
            } else {
                fs.link(&target, &path).await.map_err(|e| match e {
                    kvfs_common::Error::NotSupported(_) => {
                        anyhow!("hard links are disabled (set enable_hard_links under [fs])")
                    }
                    e => e.into(),
                })?;
            }
        }
        Commands::Readlink { path } => println!("{}", fs.readlink(&path).await?),
        Commands::Stat { path } => {
            let attr = fs.getattr(&path).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&attr_json(&path, &attr))?);
            } else {
                println!("  File: {path}");
                println!("  Type: {:?}", attr.kind);
                println!("  Size: {} ({})", attr.size, format_size(attr.size));
                println!(" Inode: {}", attr.ino);
                println!(" Links: {}", attr.nlink);
                println!("  Mode: {:o} ({})", attr.mode, format_mode(&attr));
                println!("   Uid: {}  Gid: {}", attr.uid, attr.gid);
                println!("Access: {}", format_time(attr.atime));
                println!("Modify: {}", format_time(attr.mtime));
                println!("Change: {}", format_time(attr.ctime));
            }
        }
        Commands::Statfs => {
            let st = fs.statfs().await?;
            if args.json {
                let value = serde_json::json!({
                    "bsize": st.bsize,
                    "files": st.files,
                    "namemax": st.namemax,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Block size:  {}", format_size(st.bsize));
                println!("Rows:        {}", st.files);
                println!("Max name:    {}", st.namemax);
            }
        }
        Commands::Truncate { path, size } => fs.truncate(&path, size).await?,
        Commands::Chmod { mode, path } => fs.chmod(&path, mode).await?,
        Commands::Chown { owner, path } => {
            let (uid, gid) = parse_owner(&owner)?;
            if uid.is_none() && gid.is_none() {
                bail!("nothing to change in '{owner}'");
            }
            fs.chown(&path, uid, gid).await?;
        }
        Commands::Touch { path } => {
            if let Err(e) = fs.utimens(&path, None).await {
                if !e.is_not_found() {
                    return Err(e.into());
                }
                fs.create(&path, 0o644).await?;
            }
        }
        Commands::Fsck => {
            let report = fs.fsck().await?;
            println!("Scanned {} rows", report.scanned);
            for (id, stored, actual) in &report.repaired {
                println!("repaired file {id}: nlink {stored} -> {actual}");
            }
            for id in &report.destroyed {
                println!("removed unreferenced file {id}");
            }
            for path in &report.dangling {
                println!("dangling link: {path}");
            }
            for id in &report.orphan_blocks {
                println!("orphan blocks of file {id}");
            }
            if report.is_clean() {
                println!("clean");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("99999999999G").is_err());
        assert_eq!(parse_size("16777215G").unwrap(), 16_777_215 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0o600").unwrap(), 0o600);
        assert!(parse_mode("9").is_err());
    }

    #[test]
    fn test_parse_owner() {
        assert_eq!(parse_owner("1000").unwrap(), (Some(1000), None));
        assert_eq!(parse_owner("1000:50").unwrap(), (Some(1000), Some(50)));
        assert_eq!(parse_owner(":50").unwrap(), (None, Some(50)));
        assert!(parse_owner("bob").is_err());
    }

    #[test]
    fn test_format_mode() {
        let attr = FileAttr {
            ino: 1,
            kind: FileType::Directory,
            mode: 0o040_750,
            nlink: 2,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            blksize: 4096,
            atime: 0,
            mtime: 0,
            ctime: 0,
        };
        assert_eq!(format_mode(&attr), "drwxr-x---");
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "kvfs-cli",
            "--config",
            "/nonexistent/kvfs.toml",
            "--db",
            "/tmp/x.redb",
            "--backend",
            "memory",
            "statfs",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.backend.path, PathBuf::from("/tmp/x.redb"));
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.logging.level, "info");
    }
}
