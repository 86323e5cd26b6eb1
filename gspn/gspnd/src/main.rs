//! `gspnd` probes a simulated GSPN device and drives it through the ioctl surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use gspn_core::sim::{SimBuffers, SimFences, SimHardware, SimMode};
use gspn_core::{DeviceStats, GspnDevice, SchedulerConfig, SuspendOutcome};
use gspn_spec::abi::encode_cmd_array;
use gspn_spec::{Capability, CmdInfo, IoctlRequest, CAPABILITY_SIZE, CMD_INFO_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Gspnd command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Override log level (e.g. info, debug, trace).
    #[arg(long, env = "GSPN_LOG_LEVEL")]
    log_level: Option<String>,
    /// Scheduler configuration (JSON); defaults apply to missing fields.
    #[arg(long, env = "GSPN_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,
    /// Chip id reported by the simulated hardware.
    #[arg(long, default_value_t = 0x9631_0000)]
    chip_id: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the capability report.
    Capability,
    /// Print the effective scheduler configuration.
    Config,
    /// Replay a workload file and print device statistics.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Workload definition (JSON).
    #[arg(long, value_name = "FILE")]
    workload: PathBuf,
    /// Simulated execution time of one trigger.
    #[arg(long, default_value_t = 2)]
    latency_ms: u64,
    /// Concurrent submitting clients.
    #[arg(long, default_value_t = 1)]
    clients: u32,
    /// Times each client replays the workload.
    #[arg(long, default_value_t = 1)]
    repeat: u32,
    /// Suspend the device once the replay finishes.
    #[arg(long)]
    suspend: bool,
}

/// One batch of commands submitted by a single ioctl.
#[derive(Debug, Clone, Deserialize)]
struct WorkloadFrame {
    #[serde(default, rename = "async")]
    async_flag: bool,
    commands: Vec<CmdInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct Workload {
    frames: Vec<WorkloadFrame>,
}

#[derive(Debug, Default, Serialize)]
struct ClientReport {
    submitted: u64,
    rejected: u64,
}

#[derive(Debug, Serialize)]
struct RunReport {
    elapsed_ms: u128,
    submitted: u64,
    rejected: u64,
    suspend: Option<SuspendOutcome>,
    stats: DeviceStats,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let level = cli
        .log_level
        .as_deref()
        .map(|lvl| lvl.to_ascii_uppercase())
        .map(|lvl| match lvl.as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            "WARN" => Level::WARN,
            "ERROR" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or_else(|| match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
    let Some(path) = path else {
        return Ok(SchedulerConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: SchedulerConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

fn load_workload(path: &Path) -> anyhow::Result<Workload> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workload {}", path.display()))?;
    let workload: Workload = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse workload {}", path.display()))?;
    if workload.frames.is_empty() {
        bail!("workload {} has no frames", path.display());
    }
    Ok(workload)
}

fn probe(config: SchedulerConfig, chip_id: u32, mode: SimMode) -> anyhow::Result<GspnDevice> {
    let hw = SimHardware::new(config.core_count, chip_id);
    hw.set_all_modes(mode);
    let device = GspnDevice::probe(
        config,
        Arc::new(hw),
        Arc::new(SimBuffers::new()),
        Arc::new(SimFences::new()),
    )
    .context("device probe failed")?;
    Ok(device)
}

fn read_capability(device: &GspnDevice) -> anyhow::Result<Capability> {
    let mut user = vec![0u8; CAPABILITY_SIZE];
    let raw = IoctlRequest::get_capability(CAPABILITY_SIZE as u32).encode();
    device
        .ioctl(std::process::id(), raw, &mut user)
        .context("GET_CAPABILITY failed")?;
    Ok(Capability::decode(&user)?)
}

fn run_client(device: &GspnDevice, pid: u32, workload: &Workload, repeat: u32) -> ClientReport {
    let mut report = ClientReport::default();
    for _ in 0..repeat {
        for frame in &workload.frames {
            let count = frame.commands.len() as u32;
            let mut user = encode_cmd_array(&frame.commands);
            let raw = IoctlRequest::set_param(count, frame.async_flag, CMD_INFO_SIZE as u32).encode();
            match device.ioctl(pid, raw, &mut user) {
                Ok(()) => report.submitted += 1,
                Err(code) => {
                    warn!(pid, code = code.as_raw(), error = %code, "frame rejected");
                    report.rejected += 1;
                }
            }
        }
    }
    report
}

fn run(device: &GspnDevice, args: &RunArgs) -> anyhow::Result<RunReport> {
    let workload = load_workload(&args.workload)?;
    let started = Instant::now();
    let reports: Vec<ClientReport> = thread::scope(|s| {
        let handles: Vec<_> = (0..args.clients)
            .map(|client| {
                let workload = &workload;
                s.spawn(move || run_client(device, client + 1, workload, args.repeat))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_default())
            .collect()
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while device.stats().remain_async > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let remain = device.stats().remain_async;
    if remain > 0 {
        warn!(remain, "asynchronous commands still pending");
    }
    let suspend = args.suspend.then(|| device.suspend());

    let report = RunReport {
        elapsed_ms: started.elapsed().as_millis(),
        submitted: reports.iter().map(|r| r.submitted).sum(),
        rejected: reports.iter().map(|r| r.rejected).sum(),
        suspend,
        stats: device.stats(),
    };
    info!(
        submitted = report.submitted,
        rejected = report.rejected,
        elapsed_ms = report.elapsed_ms as u64,
        "workload replayed"
    );
    Ok(report)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Capability => {
            let device = probe(config, cli.chip_id, SimMode::Manual)?;
            let cap = read_capability(&device)?;
            println!("{}", serde_json::to_string_pretty(&cap)?);
        }
        Command::Run(args) => {
            let mode = SimMode::Latency(Duration::from_millis(args.latency_ms));
            let device = probe(config, cli.chip_id, mode)?;
            let report = run(&device, args)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gspn_spec::LayerId;

    const COMPOSE: &str = include_str!("../workloads/compose.json");

    #[test]
    fn bundled_workload_parses_with_defaults() {
        let workload: Workload = serde_json::from_str(COMPOSE).unwrap();
        assert_eq!(workload.frames.len(), 2);
        assert!(workload.frames[0].async_flag);
        let cmd = &workload.frames[0].commands[1];
        assert_eq!(cmd.layer(LayerId::L2).share_fd, gspn_spec::NO_FD);
        assert_eq!(workload.frames[1].commands[0].split_total(), 2);
    }

    #[test]
    fn bundled_workload_replays_cleanly() {
        let workload: Workload = serde_json::from_str(COMPOSE).unwrap();
        let device = probe(
            SchedulerConfig::default(),
            0x9631_0000,
            SimMode::Latency(Duration::from_millis(1)),
        )
        .unwrap();
        let report = run_client(&device, 1, &workload, 2);
        assert_eq!(report.submitted, 4);
        assert_eq!(report.rejected, 0);
    }

    #[test]
    fn capability_reads_through_ioctl() {
        let device = probe(SchedulerConfig::default(), 0x1234_0000, SimMode::Manual).unwrap();
        let cap = read_capability(&device).unwrap();
        assert!(cap.is_valid());
        assert_eq!(cap, device.capability());
    }
}
