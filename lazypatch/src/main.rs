//! Command-line front end: walks directory trees, groups the `.class`
//! files found there, runs the patcher and overwrites each patched
//! file in place. Exit code 0 means no failures.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use jclass::class_file::ClassHeader;
use lazyup::hierarchy::ClassHierarchy;
use lazyup::{group, patch, PatchResult};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Parser, Debug)]
#[command(author, version, about = "Upgrade 3.0-3.7 lazy vals to the 3.8 VarHandle layout")]
struct Args {
    /// Class files or directories to patch recursively
    #[arg(value_name = "PATHS", required = true)]
    paths: Vec<PathBuf>,

    /// Report what would change without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Disable colored status output
    #[arg(long)]
    no_color: bool,

    /// Verbose tracing (same as RUST_LOG=debug)
    #[arg(short, long)]
    verbose: bool,
}

fn collect_class_files(path: &Path, found: &mut Vec<PathBuf>) -> Result<(), String> {
    if path.is_dir() {
        let mut entries: Vec<PathBuf> = fs::read_dir(path)
            .map_err(|error| format!("cannot read {}: {error}", path.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect();
        entries.sort();
        for entry in entries {
            collect_class_files(&entry, found)?;
        }
        return Ok(());
    }
    if path.extension().and_then(|ext| ext.to_str()) == Some("class") {
        found.push(path.to_path_buf());
    }
    Ok(())
}

struct Status<'a> {
    color: &'a str,
    word: &'a str,
}

fn print_status(args: &Args, status: Status, names: &[&str], detail: Option<&str>) {
    let joined = names.join(" + ");
    let (color, reset) = if args.no_color {
        ("", "")
    } else {
        (status.color, RESET)
    };
    match detail {
        Some(detail) => println!("{color}{:>8}{reset} {joined}\n{detail}", status.word),
        None => println!("{color}{:>8}{reset} {joined}", status.word),
    }
}

fn write_patched(
    paths: &BTreeMap<String, PathBuf>,
    name: &str,
    bytes: &[u8],
    dry_run: bool,
) -> Result<(), String> {
    if dry_run {
        return Ok(());
    }
    let path = paths
        .get(name)
        .ok_or_else(|| format!("no source path recorded for {name}"))?;
    fs::write(path, bytes).map_err(|error| format!("cannot write {}: {error}", path.display()))
}

fn run(args: &Args) -> Result<bool, String> {
    let mut files = Vec::new();
    for path in &args.paths {
        collect_class_files(path, &mut files)?;
    }
    debug!(count = files.len(), "collected class files");

    let mut bytes_by_name: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut path_by_name: BTreeMap<String, PathBuf> = BTreeMap::new();
    for path in &files {
        let bytes =
            fs::read(path).map_err(|error| format!("cannot read {}: {error}", path.display()))?;
        let header = ClassHeader::from_bytes(&bytes)
            .map_err(|error| format!("{}: {error}", path.display()))?;
        path_by_name.insert(header.name.clone(), path.clone());
        bytes_by_name.insert(header.name, bytes);
    }

    let groups = group(&bytes_by_name).map_err(|error| error.to_string())?;

    let lookup_map = bytes_by_name.clone();
    let hierarchy = ClassHierarchy::new(move |name: &str| lookup_map.get(name).cloned());

    let mut failed = false;
    for class_group in &groups {
        let names: Vec<&str> = class_group.names();
        match patch(class_group, Some(&hierarchy)) {
            PatchResult::NotApplicable => {
                print_status(args, Status { color: YELLOW, word: "skipped" }, &names, None);
            }
            PatchResult::Patched { name, bytes } => {
                write_patched(&path_by_name, &name, &bytes, args.dry_run)?;
                print_status(
                    args,
                    Status { color: GREEN, word: "patched" },
                    &[name.as_str()],
                    None,
                );
            }
            PatchResult::PatchedPair {
                module_name,
                companion_name,
                module_bytes,
                companion_bytes,
            } => {
                write_patched(&path_by_name, &module_name, &module_bytes, args.dry_run)?;
                write_patched(&path_by_name, &companion_name, &companion_bytes, args.dry_run)?;
                print_status(
                    args,
                    Status { color: GREEN, word: "patched" },
                    &[module_name.as_str(), companion_name.as_str()],
                    None,
                );
            }
            PatchResult::Failed { diagnostic } => {
                failed = true;
                print_status(
                    args,
                    Status { color: RED, word: "failed" },
                    &names,
                    Some(&diagnostic),
                );
            }
        }
    }
    Ok(!failed)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(message) => {
            eprintln!("{RED}error{RESET}: {message}");
            ExitCode::FAILURE
        }
    }
}
