use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use lan_monitor_rs::config::{MonitorConfig, ProbeConfig, ScanConfig, ScanType};
use lan_monitor_rs::controller::{ProbeController, ScanController};
use lan_monitor_rs::jobs::HttpScanJobs;
use lan_monitor_rs::logging::init_logging;
use lan_monitor_rs::pool::ConnectionPool;
use lan_monitor_rs::types::{ProbeResult, ProbeSummary, ScanResult, ScanStatus};

/// lan-monitor: follow live probe and port-scan sessions of a monitoring backend.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "lan-monitor",
    version,
    about = "Follow live probe and port-scan sessions of a monitoring backend.",
    long_about = None
)]
struct Cli {
    /// Base URL of the streaming endpoints.
    #[arg(long = "ws-base", default_value = "ws://127.0.0.1:8000")]
    ws_base: String,

    /// Base URL of the job API.
    #[arg(long = "api-base", default_value = "http://127.0.0.1:8000/api/v1")]
    api_base: String,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Write the final summary and results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Probe one target for latency and packet loss.
    Probe {
        #[arg(long)]
        target: String,

        /// Number of probes; ignored with --continuous.
        #[arg(long, default_value_t = 10)]
        count: u32,

        /// Seconds between probes.
        #[arg(long, default_value_t = 1.0)]
        interval: f64,

        /// Probe until Ctrl+C.
        #[arg(long, default_value_t = false)]
        continuous: bool,

        #[arg(long = "packet-size", default_value_t = 64)]
        packet_size: u32,
    },
    /// Start a port scan job and follow its progress.
    Scan {
        /// Comma-separated IPs, host names or CIDRs.
        #[arg(long)]
        targets: String,

        /// Ports, e.g. `22,80,8000-8010`.
        #[arg(long, default_value = "1-1000")]
        ports: String,

        #[arg(long = "scan-type", default_value = "tcp")]
        scan_type: ScanType,

        #[arg(long = "max-threads", default_value_t = 200)]
        max_threads: u32,

        /// Per-port timeout in seconds.
        #[arg(long, default_value_t = 3.0)]
        timeout: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = MonitorConfig {
        ws_base: cli.ws_base.clone(),
        api_base: cli.api_base.clone(),
        ..Default::default()
    };
    config.validate()?;

    let pool = ConnectionPool::new(&config);
    let sweeper = pool.spawn_sweeper();

    let outcome = match cli.command.clone() {
        Command::Probe {
            target,
            count,
            interval,
            continuous,
            packet_size,
        } => {
            let probe = ProbeConfig {
                target,
                count,
                interval,
                packet_size,
                continuous,
                ..Default::default()
            };
            run_probe(pool.clone(), config, probe, cli.output.as_deref()).await
        }
        Command::Scan {
            targets,
            ports,
            scan_type,
            max_threads,
            timeout,
        } => {
            let scan = ScanConfig {
                targets,
                ports,
                scan_type,
                timeout,
                max_threads,
            };
            run_scan(pool.clone(), config, scan, cli.output.as_deref()).await
        }
    };

    pool.shutdown();
    let _ = sweeper.await;
    outcome
}

async fn run_probe(
    pool: ConnectionPool,
    config: MonitorConfig,
    probe: ProbeConfig,
    output: Option<&Path>,
) -> Result<()> {
    println!("lan-monitor probe:");
    println!("  target       : {}", probe.target);
    println!(
        "  count        : {}",
        if probe.continuous {
            "continuous".to_string()
        } else {
            probe.count.to_string()
        }
    );
    println!("  interval     : {}s", probe.interval);

    let controller = ProbeController::new(pool, config);
    let id = controller.start(probe).await.context("failed to start probe")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut last_seq = 0u64;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\nStopping...");
                controller.stop(id.as_str()).await?;
                break;
            }
            _ = ticker.tick() => {
                let seen = last_seq;
                for r in controller.results().iter().rev().filter(|r| r.sequence > seen) {
                    print_probe_line(r);
                    last_seq = r.sequence;
                }
                if !controller.is_running() {
                    break;
                }
            }
        }
    }

    let summary = controller.summary();
    let results = controller.results();
    print_probe_summary(&summary);
    if let Some(err) = controller.error() {
        eprintln!("Probe ended with error: {err}");
    }
    if let Some(path) = output {
        let report = ProbeReport {
            summary: &summary,
            results: &results,
        };
        match write_json(path, &report) {
            Ok(()) => println!("Wrote JSON results to {}", path.display()),
            Err(e) => eprintln!("Failed to write JSON to {}: {}", path.display(), e),
        }
    }
    Ok(())
}

async fn run_scan(
    pool: ConnectionPool,
    config: MonitorConfig,
    scan: ScanConfig,
    output: Option<&Path>,
) -> Result<()> {
    println!("lan-monitor scan:");
    println!("  targets      : {}", scan.targets);
    println!("  ports        : {}", scan.ports);
    println!("  scan_type    : {}", scan.scan_type.as_str());
    println!("  max_threads  : {}", scan.max_threads);

    let jobs = HttpScanJobs::new(config.api_base.clone(), config.request_timeout)?;
    let controller = ScanController::new(pool, config, Arc::new(jobs));
    let id = controller.start(scan).await.context("failed to start scan")?;
    println!("  scan_id      : {id}");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut last_progress = -1.0f64;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\nStopping...");
                controller.stop(id.as_str()).await?;
                break;
            }
            _ = ticker.tick() => {
                let status = controller.status();
                if status.progress > last_progress {
                    println!(
                        "progress {:>5.1}%  scanned {}/{}  found {}",
                        status.progress, status.scanned_ports, status.total_ports, status.found_ports
                    );
                    last_progress = status.progress;
                }
                if !controller.is_running() {
                    break;
                }
            }
        }
    }

    let status = controller.status();
    let results = controller.results();
    print_scan_table(&status, &results);
    for e in &status.target_errors {
        warn!(error = %e, "target was not scanned");
    }
    if let Some(err) = &status.error {
        eprintln!("Scan ended with error: {err}");
    }
    if let Some(path) = output {
        let report = ScanReport {
            status: &status,
            results: &results,
        };
        match write_json(path, &report) {
            Ok(()) => println!("Wrote JSON results to {}", path.display()),
            Err(e) => eprintln!("Failed to write JSON to {}: {}", path.display(), e),
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ProbeReport<'a> {
    summary: &'a ProbeSummary,
    results: &'a [ProbeResult],
}

#[derive(Serialize)]
struct ScanReport<'a> {
    status: &'a ScanStatus,
    results: &'a [ScanResult],
}

fn fmt_ms(v: Option<f64>) -> String {
    v.map(|t| format!("{t:.2}")).unwrap_or_else(|| "-".to_string())
}

fn print_probe_line(r: &ProbeResult) {
    match r.response_time {
        Some(t) => println!(
            "seq={} {} time={:.2}ms ttl={} status={:?}",
            r.sequence,
            r.target,
            t,
            r.ttl.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            r.status
        ),
        None => println!(
            "seq={} {} status={:?}{}",
            r.sequence,
            r.target,
            r.status,
            r.error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default()
        ),
    }
}

fn print_probe_summary(s: &ProbeSummary) {
    println!("\n--- {} probe statistics ({:?}) ---", s.target, s.status);
    println!(
        "{} sent, {} received, {:.1}% packet loss",
        s.packets_sent, s.packets_received, s.packet_loss
    );
    println!(
        "rtt min/avg/max = {}/{}/{} ms",
        fmt_ms(s.min_time),
        fmt_ms(s.avg_time),
        fmt_ms(s.max_time)
    );
}

fn print_scan_table(status: &ScanStatus, results: &[ScanResult]) {
    let mut target_w = "target".len();
    let mut service_w = "service".len();
    for r in results {
        target_w = target_w.max(r.target.len());
        service_w = service_w.max(r.service.len().min(40));
    }
    let port_w = 5usize.max("port".len());
    let state_w = "filtered".len();

    println!(
        "\nScan {} {:?}: {} ports found ({} of {} scanned)",
        status.scan_id, status.status, status.found_ports, status.scanned_ports, status.total_ports
    );
    println!(
        "{:<target_w$}  {:>port_w$}  {:<state_w$}  {:<service_w$}",
        "target", "port", "state", "service",
    );
    println!(
        "{:-<target_w$}  {:-<port_w$}  {:-<state_w$}  {:-<service_w$}",
        "", "", "", "",
    );
    for r in results {
        let service: String = r.service.chars().take(40).collect();
        let state = format!("{:?}", r.state).to_lowercase();
        println!(
            "{:<target_w$}  {:>port_w$}  {:<state_w$}  {:<service_w$}",
            r.target, r.port, state, service,
        );
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
