//! BPF Object Inspection Tool
//!
//! Loads a BPF object file and lists its programs and maps, dumps map
//! contents as JSON, or attaches the programs and streams perf events
//! with optional struct decoding.
//!
//! ## Usage
//!
//! ```bash
//! # List programs and maps of an object
//! bpfbind info probe.bpf.o
//!
//! # Dump a map's entries as JSON
//! bpfbind dump probe.bpf.o --map counters --pretty
//!
//! # Attach everything and stream decoded events for 30 seconds
//! sudo bpfbind watch probe.bpf.o --map events \
//!     --structs layout.json --struct-name execve_event --duration 30
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};

use bpfbind::{defs_from_json, BpfObject, PerfEventStreamBuilder, DEFAULT_PAGE_COUNT};

/// BPF object inspection and perf event streaming tool
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Verbose logging
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the programs and maps of a BPF object
    Info {
        /// Path to the BPF object file
        object: PathBuf,
    },

    /// Dump every entry of a map as JSON
    Dump {
        /// Path to the BPF object file
        object: PathBuf,

        /// Map to dump
        #[clap(short, long)]
        map: String,

        /// Pretty-print the JSON output
        #[clap(short, long)]
        pretty: bool,
    },

    /// Attach the object's programs and stream perf events to stdout
    Watch(WatchArgs),
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    /// Path to the BPF object file
    object: PathBuf,

    /// Perf event array map to stream from
    #[clap(short, long)]
    map: String,

    /// JSON file with struct definitions for event decoding
    #[clap(long)]
    structs: Option<PathBuf>,

    /// Struct to decode events as (requires --structs)
    #[clap(long)]
    struct_name: Option<String>,

    /// Ring pages per CPU (power of two)
    #[clap(long, default_value_t = DEFAULT_PAGE_COUNT)]
    pages: usize,

    /// Poll timeout in milliseconds
    #[clap(long, default_value_t = 100)]
    timeout_ms: i32,

    /// Seconds to stream before exiting (0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Stream without attaching the object's programs first
    #[clap(long)]
    no_attach: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match args.command {
        Command::Info { object } => cmd_info(object),
        Command::Dump {
            object,
            map,
            pretty,
        } => cmd_dump(object, &map, pretty),
        Command::Watch(watch) => cmd_watch(watch),
    }
}

fn cmd_info(object: PathBuf) -> Result<()> {
    let obj = BpfObject::new(object);
    obj.load()?;

    let programs = obj.program_names()?;
    let maps = obj.map_names()?;

    println!("object: {}", obj.path().display());
    println!();
    println!("programs ({}):", programs.len());
    for name in &programs {
        let prog = obj.program(name)?;
        println!("  {:<24} section={}", name, prog.section());
    }
    println!();
    println!("maps ({}):", maps.len());
    for name in &maps {
        let map = obj.map(name)?;
        println!(
            "  {:<24} type={} key={}B value={}B max_entries={}",
            name,
            map.map_type(),
            map.key_size(),
            map.value_size(),
            map.max_entries()
        );
    }

    Ok(())
}

fn cmd_dump(object: PathBuf, map_name: &str, pretty: bool) -> Result<()> {
    let obj = BpfObject::new(object);
    obj.load()?;
    let map = obj.map(map_name)?;

    let mut entries = Vec::new();
    for (key, value) in map.items()? {
        entries.push(serde_json::json!({
            "key": key.to_json(),
            "value": value.to_json(),
        }));
    }

    info!("map '{}' holds {} entries", map_name, entries.len());
    let doc = serde_json::Value::Array(entries);
    let text = if pretty {
        serde_json::to_string_pretty(&doc)?
    } else {
        serde_json::to_string(&doc)?
    };
    println!("{}", text);

    Ok(())
}

fn cmd_watch(args: WatchArgs) -> Result<()> {
    if args.struct_name.is_some() && args.structs.is_none() {
        anyhow::bail!("--struct-name requires --structs");
    }

    let defs = match &args.structs {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading struct definitions from {:?}", path))?;
            defs_from_json(&text).context("parsing struct definitions")?
        }
        None => Vec::new(),
    };

    let obj = BpfObject::with_structs(args.object, defs);
    obj.load()?;
    if !args.no_attach {
        obj.attach_all()?;
    }

    let map = obj.map(&args.map)?;
    let mut builder = PerfEventStreamBuilder::new(map, |cpu, event| {
        let line = serde_json::json!({
            "time": chrono::Utc::now().to_rfc3339(),
            "cpu": cpu,
            "event": event.to_json(),
        });
        println!("{}", line);
    })
    .pages(args.pages)
    .lost_cb(|cpu, count| warn!("lost {} events on cpu {}", count, cpu));
    if let Some(name) = args.struct_name {
        builder = builder.decode_as(name);
    }
    let stream = builder.build()?;

    let deadline =
        (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));

    // Ctrl-C flips the flag; the loop notices on its next pass and falls
    // through to the handle teardown instead of dying mid-stream.
    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&interrupted))
            .with_context(|| format!("installing handler for signal {}", signal))?;
    }

    info!(
        "watching map '{}' ({} pages per cpu), ctrl-c to stop",
        args.map, args.pages
    );

    let mut total = 0usize;
    while keep_watching(&interrupted, deadline) {
        match stream.poll(args.timeout_ms) {
            Ok(count) => total += count,
            // A signal arriving mid-poll surfaces as a poll failure.
            Err(err) if interrupted.load(Ordering::Relaxed) => {
                debug!("poll cut short by shutdown signal: {}", err);
            }
            Err(err) => return Err(err.into()),
        }
    }

    if interrupted.load(Ordering::Relaxed) {
        info!("interrupt received, shutting down");
    }
    info!("delivered {} events", total);
    Ok(())
}

/// Whether the watch loop should take another poll pass: false once the
/// shutdown flag is set or the deadline, if any, has passed.
fn keep_watching(interrupted: &AtomicBool, deadline: Option<Instant>) -> bool {
    if interrupted.load(Ordering::Relaxed) {
        return false;
    }
    match deadline {
        Some(deadline) => Instant::now() < deadline,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_watching_stops_on_interrupt() {
        let interrupted = AtomicBool::new(false);
        assert!(keep_watching(&interrupted, None));

        interrupted.store(true, Ordering::Relaxed);
        assert!(!keep_watching(&interrupted, None));
    }

    #[test]
    fn test_keep_watching_interrupt_beats_deadline() {
        let interrupted = AtomicBool::new(true);
        let far_off = Instant::now() + Duration::from_secs(3600);
        assert!(!keep_watching(&interrupted, Some(far_off)));
    }

    #[test]
    fn test_keep_watching_honors_deadline() {
        let interrupted = AtomicBool::new(false);
        assert!(keep_watching(
            &interrupted,
            Some(Instant::now() + Duration::from_secs(3600))
        ));
        assert!(!keep_watching(&interrupted, Some(Instant::now())));
    }
}
