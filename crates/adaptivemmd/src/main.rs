//! adaptivemmd — adaptive memory-management daemon.
//!
//! Owns every process-level concern the core library deliberately stays
//! out of: CLI flags, config-file loading, daemonization, logging sink
//! selection, the PID lock file, and signal-to-shutdown-flag wiring.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use adaptivemmd_core::config::{parse_config_file, CliOverrides, Config, ConfigFileValues};
use adaptivemmd_core::{Daemon, Error, LinuxPaths, Result, TickReport};
use clap::Parser;

const LOCK_FILE_PATH: &str = "/var/run/adaptivemmd.pid";
const CONFIG_PATHS: [&str; 2] = ["/etc/sysconfig/adaptivemmd", "/etc/default/adaptivemmd"];

#[derive(Parser)]
#[command(name = "adaptivemmd")]
#[command(about = "Adaptive memory-management daemon")]
#[command(version = adaptivemmd_core::VERSION)]
struct Cli {
    /// Run in the foreground and log to stdout instead of syslog.
    #[arg(short = 'd')]
    debug: bool,

    /// Increase verbosity; stackable (-vvv).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Dry run: compute and log candidates but never write them. Implies
    /// `-d -v -v`.
    #[arg(short = 's')]
    script_mode: bool,

    /// Pin the watermark gap, in GB, instead of recomputing it from the
    /// reclaimable-memory share every tick.
    #[arg(short = 'm', value_name = "GB")]
    maxgap: Option<f64>,

    /// Aggressiveness level.
    #[arg(short = 'a', value_parser = clap::value_parser!(u8).range(1..=3))]
    aggressiveness: Option<u8>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("adaptivemmd: fatal: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let overrides = CliOverrides {
        debug: cli.debug,
        verbose_bumps: cli.verbose,
        dry_run_script_mode: cli.script_mode,
        max_gap_gb: cli.maxgap,
        aggressiveness: cli.aggressiveness,
    };

    let (file_values, file_warning) = load_config_file();
    let config = Config::from_sources(file_values, overrides);

    init_logging(&config);
    if let Some(warning) = file_warning {
        log::warn!("{warning}");
    }

    if !config.debug_mode {
        daemonize_process()?;
    }

    let lock = acquire_lock_file()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .map_err(|e| Error::Fatal(format!("failed to install SIGTERM handler: {e}")))?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&shutdown))
        .map_err(|e| Error::Fatal(format!("failed to install SIGHUP handler: {e}")))?;

    let periodicity = Duration::from_millis(config.periodicity_ms.max(0) as u64);
    let mut daemon = Daemon::new(LinuxPaths, config)?;
    let start = Instant::now();

    log::info!("adaptivemmd started, pid {}", std::process::id());

    while !shutdown.load(Ordering::SeqCst) {
        let now_ms = start.elapsed().as_millis() as i64;
        match daemon.run_once(now_ms) {
            Ok(report) => log_tick_report(&report),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => log::error!("tick failed, skipping actuation: {e}"),
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(periodicity);
    }

    log::info!("adaptivemmd shutting down");
    drop(lock);
    Ok(())
}

fn load_config_file() -> (ConfigFileValues, Option<String>) {
    for path in CONFIG_PATHS {
        if let Ok(content) = std::fs::read_to_string(path) {
            return parse_config_file(&content);
        }
    }
    (ConfigFileValues::default(), None)
}

fn daemonize_process() -> Result<()> {
    daemonize::Daemonize::new()
        .working_directory("/")
        .start()
        .map_err(|e| Error::Fatal(format!("daemonization failed: {e}")))
}

struct LockFile;

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(LOCK_FILE_PATH);
    }
}

fn acquire_lock_file() -> Result<LockFile> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(LOCK_FILE_PATH)
        .map_err(|e| {
            Error::Fatal(format!(
                "another instance may be running ({LOCK_FILE_PATH}): {e}"
            ))
        })?;
    writeln!(file, "{}", std::process::id())
        .map_err(|e| Error::Fatal(format!("failed to write lock file: {e}")))?;
    Ok(LockFile)
}

fn level_for(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

fn init_logging(config: &Config) {
    let max_level = level_for(config.verbose);
    if config.debug_mode {
        let logger: &'static StdoutLogger = Box::leak(Box::new(StdoutLogger));
        let _ = log::set_logger(logger);
        log::set_max_level(max_level);
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "adaptivemmd".into(),
        pid: std::process::id(),
    };

    match syslog::unix(formatter) {
        Ok(logger) => {
            let boxed = syslog::BasicLogger::new(logger);
            if log::set_boxed_logger(Box::new(boxed)).is_ok() {
                log::set_max_level(max_level);
            }
        }
        Err(e) => eprintln!("adaptivemmd: failed to connect to syslog, logging disabled: {e}"),
    }
}

struct StdoutLogger;

impl log::Log for StdoutLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        println!(
            "{} adaptivemmd[{}]: {}: {}",
            timestamp(),
            std::process::id(),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

fn timestamp() -> String {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    unsafe {
        let mut t: libc::time_t = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&mut t, &mut tm);
        format!(
            "{} {:2} {:02}:{:02}:{:02}",
            MONTHS[tm.tm_mon.clamp(0, 11) as usize],
            tm.tm_mday,
            tm.tm_hour,
            tm.tm_min,
            tm.tm_sec
        )
    }
}

fn log_tick_report(report: &TickReport) {
    for node in &report.nodes {
        log::debug!(
            "node {}: signal={:?} compaction_written={}",
            node.node,
            node.signal,
            node.compaction_written
        );
    }
    log::info!("watermark outcome: {:?}", report.watermark_outcome);
    if let Some(cap) = report.neg_dentry {
        log::info!("negative-dentry cap written: {cap}");
    }
    match report.leak.alert {
        adaptivemmd_core::leak::LeakAlert::None => {}
        adaptivemmd_core::leak::LeakAlert::SuddenLeak => {
            log::warn!(
                "possible sudden leak, unacct={} unmapped_pages={:?}",
                report.leak.unacct,
                report.leak.unmapped_pages
            );
            for (field, prev, now) in &report.leak.diff {
                log::warn!("  {field}: {prev} -> {now}");
            }
        }
        adaptivemmd_core::leak::LeakAlert::SlowLeak => {
            log::warn!(
                "possible slow leak, unacct={} unmapped_pages={:?}",
                report.leak.unacct,
                report.leak.unmapped_pages
            );
            for (field, prev, now) in &report.leak.diff {
                log::warn!("  {field}: {prev} -> {now}");
            }
        }
    }
}
