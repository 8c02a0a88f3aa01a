//! Online detector process: reads decoded flow frames from stdin, drives
//! the engine's two-thread ingest/sweep scheduler, and shuts down cleanly
//! on SIGINT/SIGTERM (spec §5).

#![deny(unused_import_braces, unused_qualifications)]

use color_eyre::eyre::{Context as _, Result};
use engine::config::Config;
use engine::emitter::{output_channel, Emitter};
use engine::Engine;
use netflow::decode::{Frame, FrameReader};
use std::path::PathBuf;
use std::sync::Arc;

/// NEMEA-style host-profile detector: ingests decoded flow frames from
/// stdin and emits security events to a daily log directory.
#[derive(Debug, clap::Parser)]
struct CliArgs {
    /// TOML configuration file; falls back to documented defaults when absent.
    #[clap(long = "config")]
    config: Option<PathBuf>,

    /// Directory the daily `YYYYMMDD.log` event files are written into.
    #[clap(long = "log-dir", default_value = "./events")]
    log_dir: PathBuf,

    /// IPv4 blacklist source file (longest-prefix-match format).
    #[clap(long = "blacklist-ipv4")]
    blacklist_ipv4: Option<PathBuf>,
    /// IPv6 blacklist source file.
    #[clap(long = "blacklist-ipv6")]
    blacklist_ipv6: Option<PathBuf>,
    /// FQDN blacklist source file (suffix-matched).
    #[clap(long = "blacklist-dns")]
    blacklist_dns: Option<PathBuf>,
    /// URL blacklist source file (prefix-matched).
    #[clap(long = "blacklist-url")]
    blacklist_url: Option<PathBuf>,

    /// Bound on the output-transport channel before events are dropped.
    #[clap(long = "output-capacity", default_value_t = 1024)]
    output_capacity: usize,
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
    let bl = Arc::new(bl);

    let paths: Vec<PathBuf> = [&args.blacklist_ipv4, &args.blacklist_ipv6, &args.blacklist_dns, &args.blacklist_url]
        .into_iter()
        .flatten()
        .cloned()
        .collect();
    if !paths.is_empty() {
        let path_refs: Vec<&std::path::Path> = paths.iter().map(PathBuf::as_path).collect();
        let watcher = blacklist::watcher::watch(&path_refs, bl.reload_flag())?;
        // Leaking keeps the watcher thread alive for the process lifetime;
        // dropping it would stop the watch (see `watcher::watch`'s docs).
        std::mem::forget(watcher);
    }
    Ok(Some(bl))
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let args: CliArgs = clap::Parser::parse();

    let config = load_config(args.config.as_ref())?;
    std::fs::create_dir_all(&args.log_dir).with_context(|| format!("creating log directory {}", args.log_dir.display()))?;
    let blacklist = load_blacklist(&args)?;

    let (sink, source) = output_channel(args.output_capacity);
    std::thread::spawn(move || {
        // Downstream output transport is out of scope (spec §1); drain it
        // here so a full channel never blocks the emitter.
        for evt in source.iter() {
            log::debug!("emitted event: {:?}", evt.event_type);
        }
    });
    let emitter = Emitter::new(sink, &args.log_dir);

    let engine = Arc::new(Engine::new(config, emitter, blacklist));

    {
        let engine = Arc::clone(&engine);
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received, draining and stopping");
            engine.request_stop();
        })
        .context("installing SIGINT/SIGTERM handler")?;
    }

    let stdin = std::io::stdin();
    let mut reader = FrameReader::new(stdin.lock());
    engine.run_online(|_timeout| match reader.next_frame() {
        Ok(Frame::Record(rec)) => Some(rec),
        Ok(Frame::EndOfStream) => {
            log::info!("input transport reached end of stream");
            engine.request_stop();
            None
        }
        Err(e) => {
            log::warn!("dropping unreadable frame: {e}");
            None
        }
    });

    log::info!("shut down cleanly");
    Ok(())
}
