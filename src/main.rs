use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use refclockd::clock::SystemClock;
use refclockd::config::DaemonConfig;
use refclockd::selection::SelectionManager;
use refclockd::status::ManagerSnapshot;
use std::fs::File;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const DEFAULT_CONFIG_PATH: &str = "/etc/refclockd/config.json";
const LOCK_PATH: &str = "/var/run/refclockd.lock";
/// Where the current `ManagerSnapshot` is published as JSON for
/// `refclockctl` and any other external reader (spec §6 "exposed status
/// surface"). The daemon itself has no HTTP/CLI server — that's an
/// external collaborator per §1 — so a file is the simplest concrete
/// interface the core can own.
const STATUS_PATH: &str = "/run/refclockd/status.json";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON daemon configuration.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Overrides the interface used by PTP/PPS handlers that need one.
    #[arg(short, long)]
    interface: Option<String>,

    /// Skip systemd readiness notification and stay attached to the
    /// controlling terminal.
    #[arg(long, default_value_t = false)]
    foreground: bool,

    /// Raises the log level one step per occurrence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

/// Ensures a second instance can't steal the clock out from under this one
/// (spec §5 "single active instance").
fn acquire_singleton_lock() -> Result<File> {
    let file = File::create(LOCK_PATH).with_context(|| format!("failed to create lock file {LOCK_PATH}"))?;

    #[cfg(unix)]
    {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(file),
            Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
                "another instance of refclockd is already running (lockfile: {LOCK_PATH})"
            )),
            Err(e) => Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        Ok(file)
    }
}

/// Disables the distribution's own NTP client so it doesn't fight the
/// daemon for the system clock.
fn stop_conflicting_services() {
    match Command::new("timedatectl").args(["set-ntp", "false"]).output() {
        Ok(out) if out.status.success() => info!("disabled system NTP via timedatectl"),
        Ok(out) => warn!("timedatectl set-ntp false exited with {}", out.status),
        Err(e) => warn!("failed to run timedatectl (ignoring): {e}"),
    }
}

fn derive_clock_identity() -> [u8; 8] {
    let hostname = hostname_bytes();
    let mut identity = [0u8; 8];
    identity[0] = 0xAA;
    let n = hostname.len().min(7);
    identity[1..1 + n].copy_from_slice(&hostname[..n]);
    identity
}

fn hostname_bytes() -> Vec<u8> {
    std::fs::read("/etc/hostname")
        .ok()
        .map(|mut b| {
            b.retain(|c| !c.is_ascii_whitespace());
            b
        })
        .unwrap_or_else(|| b"refclockd".to_vec())
}

/// `--interface` overrides every configured PTP handler's interface (spec
/// §F). PPS/NMEA/PHC handlers take their device paths directly from the
/// config file and are unaffected.
fn apply_interface_override(config: &mut DaemonConfig, interface: &str) {
    use refclockd::config::ProtocolConfig;
    for src in config.primary_clocks.iter_mut().chain(config.secondary_clocks.iter_mut()) {
        if let ProtocolConfig::Ptp(ptp) = &mut src.protocol {
            ptp.interface = interface.to_string();
        }
    }
}

fn run(args: Args, running: Arc<AtomicBool>) -> Result<()> {
    if !args.foreground {
        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Status("starting")]);
    }

    let mut config = DaemonConfig::load(&args.config);
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}; falling back to defaults");
        config = DaemonConfig::default();
    }
    if let Some(interface) = &args.interface {
        apply_interface_override(&mut config, interface);
    }

    stop_conflicting_services();

    let clock_identity = derive_clock_identity();
    let system_clock: Box<dyn SystemClock> = build_system_clock()?;
    let mut manager = SelectionManager::new(&config, system_clock, clock_identity);
    manager.start_all();

    let mut notified_ready = false;
    while running.load(Ordering::SeqCst) {
        manager.tick();

        let snapshot = manager.snapshot();
        info!(
            "clock_state={:?} selected={:?}",
            snapshot.clock_state, snapshot.selected_source_id
        );
        publish_status(&snapshot);

        if !notified_ready && !args.foreground {
            let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready, sd_notify::NotifyState::Status("running")]);
            notified_ready = true;
        }

        std::thread::sleep(Duration::from_secs(1));
    }

    if !args.foreground {
        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    }
    manager.stop_all();
    Ok(())
}

fn publish_status(snapshot: &ManagerSnapshot) {
    let path = PathBuf::from(STATUS_PATH);
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("failed to create {}: {e}", parent.display());
            return;
        }
    }
    match serde_json::to_vec(snapshot) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(&path, bytes) {
                warn!("failed to write status snapshot to {}: {e}", path.display());
            }
        }
        Err(e) => warn!("failed to serialize status snapshot: {e}"),
    }
}

#[cfg(target_os = "linux")]
fn build_system_clock() -> Result<Box<dyn SystemClock>> {
    Ok(Box::new(refclockd::clock::linux::LinuxClock::new()?))
}

#[cfg(not(target_os = "linux"))]
fn build_system_clock() -> Result<Box<dyn SystemClock>> {
    Err(anyhow!("refclockd's system clock steering is only implemented for Linux"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("refclockd v{} starting", env!("CARGO_PKG_VERSION"));

    let _lock_file = acquire_singleton_lock()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        r.store(false, Ordering::SeqCst);
    })?;

    run(args, running)
}
