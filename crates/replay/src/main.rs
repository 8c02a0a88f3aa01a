//! Offline bulk-replay tool (spec §4.C6 "Offline mode"): reads a
//! directory of pre-sorted flow capture files and drives the engine's
//! single-thread offline scheduler deterministically, for reproducible
//! bulk analysis and detector-parameter evaluation.

#![deny(unused_import_braces, unused_qualifications)]

use color_eyre::eyre::{Context as _, Result};
use engine::config::Config;
use engine::emitter::{output_channel, Emitter};
use engine::Engine;
use netflow::decode::{Frame, FrameReader};
use netflow::FlowRecord;
use std::path::PathBuf;
use std::sync::Arc;

/// Deterministically replays captured flow frames through the detector
/// engine, useful for reproducible bulk analysis and for evaluating
/// detector parameters offline.
#[derive(Debug, clap::Parser)]
struct CliArgs {
    /// TOML configuration file; falls back to documented defaults when absent.
    #[clap(long = "config")]
    config: Option<PathBuf>,

    /// Directory the daily `YYYYMMDD.log` event files are written into.
    #[clap(long = "log-dir", default_value = "./events")]
    log_dir: PathBuf,

    /// IPv4 blacklist source file.
    #[clap(long = "blacklist-ipv4")]
    blacklist_ipv4: Option<PathBuf>,
    /// IPv6 blacklist source file.
    #[clap(long = "blacklist-ipv6")]
    blacklist_ipv6: Option<PathBuf>,
    /// FQDN blacklist source file.
    #[clap(long = "blacklist-dns")]
    blacklist_dns: Option<PathBuf>,
    /// URL blacklist source file.
    #[clap(long = "blacklist-url")]
    blacklist_url: Option<PathBuf>,

    /// Directory of flow capture files (fixed-layout frames, walked recursively).
    input_dir: PathBuf,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading config file {}", p.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config file {}", p.display()))
        }
        None => Ok(Config::default()),
    }
}

fn load_blacklist(args: &CliArgs) -> Result<Option<Arc<blacklist::BlacklistEngine>>> {
    if args.blacklist_ipv4.is_none()
        && args.blacklist_ipv6.is_none()
        && args.blacklist_dns.is_none()
        && args.blacklist_url.is_none()
    {
        return Ok(None);
    }
    let bl = blacklist::BlacklistEngine::new(
        args.blacklist_ipv4.clone(),
        args.blacklist_ipv6.clone(),
        args.blacklist_dns.clone(),
        args.blacklist_url.clone(),
    )
    .context("loading initial blacklist snapshot")?;
    Ok(Some(Arc::new(bl)))
}

/// Flow capture files in deterministic, lexically-sorted order (offline
/// replay must be reproducible across runs).
fn capture_files(dir: &PathBuf) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_owned())
        .collect();
    files.sort();
    Ok(files)
}

/// Reads every frame out of one capture file, dropping unreadable ones
/// with a warning rather than aborting the whole replay.
fn read_frames(path: &PathBuf) -> Result<Vec<FlowRecord>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening capture file {}", path.display()))?;
    let mut reader = FrameReader::new(std::io::BufReader::new(file));
    let mut records = Vec::new();
    loop {
        match reader.next_frame() {
            Ok(Frame::Record(rec)) => records.push(rec),
            Ok(Frame::EndOfStream) => break,
            Err(e) => {
                log::warn!("dropping unreadable frame in {}: {e}", path.display());
                break;
            }
        }
    }
    Ok(records)
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let args: CliArgs = clap::Parser::parse();

    let config = load_config(args.config.as_ref())?;
    std::fs::create_dir_all(&args.log_dir).with_context(|| format!("creating log directory {}", args.log_dir.display()))?;
    let blacklist = load_blacklist(&args)?;

    let (sink, source) = output_channel(4096);
    std::thread::spawn(move || {
        for evt in source.iter() {
            log::debug!("emitted event: {:?}", evt.event_type);
        }
    });
    let emitter = Emitter::new(sink, &args.log_dir);
    let engine = Engine::new(config, emitter, blacklist);

    let files = capture_files(&args.input_dir)?;
    log::info!("found {} capture file(s) under {}", files.len(), args.input_dir.display());

    let progress = indicatif::ProgressBar::with_draw_target(Some(files.len() as u64), indicatif::ProgressDrawTarget::stderr_with_hz(1));
    progress.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{bar:40} {pos}/{len} files ({eta})")
            .unwrap(),
    );

    // Flatten into one continuous stream so the window/timeout clock (which
    // runs on `time_last`, not wall time) is unbroken across file boundaries.
    let mut records = Vec::new();
    for file in &files {
        records.extend(read_frames(file)?);
        progress.inc(1);
    }
    progress.finish_with_message("files read, replaying");

    log::info!("replaying {} flow record(s)", records.len());
    engine.run_offline(records);

    Ok(())
}
