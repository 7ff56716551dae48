use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use rusty_probe::remote::RemoteSpm;
use rusty_probe::{
    load_config, load_config_or_default, AppConfig, AxisId, ProbeController, ProbeState,
    RemoteSpmClient, ScanMotion, ScanOrchestrator, ScanOutcome, ScanResult, SimulatedSpm,
    StopSignal,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Remote scan and probe control for the SPM bridge
#[derive(Parser, Debug)]
#[command(name = "probe-scan")]
#[command(about = "Run scans and probe moves on a remote SPM", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Run against the built-in simulator instead of the bridge
    #[arg(long, global = true)]
    simulate: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show server version, axis ranges and the signal catalogue
    Info,
    /// Run the configured scan
    Scan {
        /// Override the motion style
        #[arg(long, value_parser = ["line", "point"])]
        motion: Option<String>,
        /// Override the number of lines
        #[arg(long)]
        lines: Option<usize>,
        /// Override the points per line
        #[arg(long)]
        points: Option<usize>,
    },
    /// Run the configured Z sweep
    SweepZ,
    /// Lift the probe off the surface
    Lift {
        /// Lift height, nm
        lift_nm: f32,
        /// Time to wait for the trigger condition, s
        #[arg(long, default_value_t = 0.0)]
        trigger_time: f32,
    },
    /// Land the probe
    Land {
        /// Use the alternative landing procedure
        #[arg(long)]
        land2: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(Some(path))?,
        None => load_config_or_default(None),
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, &args);

    let mut remote = connect(&config, args.simulate)?;
    let stop = setup_shutdown_handler()?;

    let result = match &args.command {
        Command::Info => show_info(remote.as_mut(), args.json),
        Command::Scan {
            motion,
            lines,
            points,
        } => run_scan(
            remote.as_mut(),
            &config,
            stop,
            ScanOverrides {
                motion: motion.as_deref(),
                lines: *lines,
                points: *points,
            },
            args.json,
        ),
        Command::SweepZ => run_sweep(remote.as_mut(), &config, &stop, args.json),
        Command::Lift {
            lift_nm,
            trigger_time,
        } => {
            let lifted = ProbeController::new(remote.as_mut()).lift(*lift_nm, *trigger_time)?;
            if lifted {
                println!("Probe lifted by {lift_nm} nm");
            } else {
                println!("Probe was not lifted");
            }
            Ok(())
        }
        Command::Land { land2 } => {
            // Lift state does not survive between invocations
            let mut probe =
                ProbeController::with_state(remote.as_mut(), ProbeState::Lifted { total_nm: 0.0 });
            let outcome = if *land2 { probe.land2()? } else { probe.land()? };
            println!("{outcome:?}");
            Ok(())
        }
    };

    if let Err(e) = remote.disconnect() {
        warn!("Disconnect failed: {e}");
    }
    result
}

struct ScanOverrides<'a> {
    motion: Option<&'a str>,
    lines: Option<usize>,
    points: Option<usize>,
}

fn connect(
    config: &AppConfig,
    simulate: bool,
) -> Result<Box<dyn RemoteSpm>, Box<dyn std::error::Error>> {
    let mut remote: Box<dyn RemoteSpm> = if simulate {
        info!("Using simulated SPM");
        Box::new(SimulatedSpm::new(config.simulator.to_simulator_config()))
    } else {
        let mut builder = RemoteSpmClient::builder()
            .address(&config.connection.host)
            .port(config.connection.port)
            .config(config.connection.to_connection_config());
        if let Some(port) = config.connection.event_port {
            builder = builder.event_port(port);
        }
        Box::new(builder.build()?)
    };
    remote.connect()?;
    Ok(remote)
}

fn show_info(remote: &mut dyn RemoteSpm, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let server_version = remote.server_interface_version()?;
    let signals = remote.signals_list()?;
    let mut ranges = Vec::new();
    for axis in [AxisId::X, AxisId::Y, AxisId::Z] {
        ranges.push((axis, remote.axis_range(axis)?, remote.axis_position(axis)?));
    }

    if json {
        let value = serde_json::json!({
            "client_version": remote.client_interface_version(),
            "server_version": server_version,
            "axes": ranges
                .iter()
                .map(|(axis, range, position)| serde_json::json!({
                    "axis": axis.as_str(),
                    "range_um": range,
                    "position_um": position,
                }))
                .collect::<Vec<_>>(),
            "signals": signals,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "Interface version: client {}, server {}",
        remote.client_interface_version(),
        server_version
    );
    for (axis, range, position) in &ranges {
        println!("{axis}: range {range:.3} um, position {position:.3} um");
    }
    println!("Signals:");
    for signal in &signals {
        println!("  {} [{}]", signal.name, signal.unit);
    }
    Ok(())
}

fn run_scan(
    remote: &mut dyn RemoteSpm,
    config: &AppConfig,
    stop: StopSignal,
    overrides: ScanOverrides<'_>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut plan = config.scan.to_plan()?;
    if let Some(motion) = overrides.motion {
        plan.mode.motion = match motion {
            "point" => ScanMotion::Point,
            _ => ScanMotion::Line,
        };
    }
    if let Some(lines) = overrides.lines {
        plan.geometry.lines = lines;
    }
    if let Some(points) = overrides.points {
        plan.geometry.points_per_line = points;
    }

    let mut orchestrator = ScanOrchestrator::new(&mut *remote, stop);
    if let Some(interval) = config.handoff.diagnostic_interval() {
        orchestrator = orchestrator.with_diagnostic_interval(interval);
    }
    let result = orchestrator.run(plan)?;
    report_setpoints(remote, &result);

    if json {
        println!("{}", serde_json::to_string_pretty(&result.report)?);
    } else {
        print_scan_summary(&result);
    }
    Ok(())
}

/// Re-read set-points of axes that the SPM software moved during the scan
fn report_setpoints(remote: &mut dyn RemoteSpm, result: &ScanResult) {
    let mut axes: Vec<AxisId> = Vec::new();
    for axis in result.events.iter().flat_map(|event| event.affected_axes()) {
        if !axes.contains(axis) {
            axes.push(*axis);
        }
    }

    for axis in axes {
        match remote.axis_setpoint(axis) {
            Ok(value) => info!("Axis {axis} set-point now {value:.3} um"),
            Err(e) => warn!("Could not read set-point of {axis}: {e}"),
        }
    }
}

fn print_scan_summary(result: &ScanResult) {
    let report = &result.report;
    let status = match report.outcome {
        ScanOutcome::Completed => "completed",
        ScanOutcome::Cancelled => "cancelled",
    };
    println!(
        "{} {:?} scan {}: {} lines of {} points",
        report.variant, report.motion, status, report.lines_completed, report.points_per_line
    );
    println!(
        "Restarts: {}, retries: {}, duration: {:.1} s",
        report.restarts,
        report.retries,
        (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );

    for (index, name) in result.image.signals.iter().enumerate() {
        let channel = result.image.data.index_axis(ndarray::Axis(0), index);
        let finite: Vec<f32> = channel.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            println!("  {name}: no data");
            continue;
        }
        let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = finite.iter().sum::<f32>() / finite.len() as f32;
        println!("  {name}: min {min:.4}, max {max:.4}, mean {mean:.4}");
    }
}

fn run_sweep(
    remote: &mut dyn RemoteSpm,
    config: &AppConfig,
    stop: &StopSignal,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let params = config.sweep.to_params();
    let mut probe = ProbeController::new(remote);
    if let Some(interval) = config.handoff.diagnostic_interval() {
        probe = probe.with_diagnostic_interval(interval);
    }
    let data = probe.sweep_z(&params, stop)?;

    if json {
        let rows: Vec<Vec<f32>> = data.rows.outer_iter().map(|row| row.to_vec()).collect();
        let value = serde_json::json!({
            "signals": data.signals,
            "feedback_was_on": data.feedback_was_on,
            "cancelled": data.cancelled,
            "rows": rows,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "Z sweep {} -> {} nm: {} points{}",
        params.from_nm,
        params.to_nm,
        data.rows.nrows(),
        if data.cancelled { " (cancelled)" } else { "" }
    );
    println!("{}", data.signals.join("\t"));
    for row in data.rows.outer_iter() {
        let line: Vec<String> = row.iter().map(|v| format!("{v:.5}")).collect();
        println!("{}", line.join("\t"));
    }
    Ok(())
}

fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn log_startup_info(config: &AppConfig, args: &Args) {
    info!("=== Rusty Probe ===");
    match &args.config {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    if !args.simulate {
        info!(
            "Bridge: {}:{}",
            config.connection.host, config.connection.port
        );
    }
}

fn setup_shutdown_handler() -> Result<StopSignal, Box<dyn std::error::Error>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        if shutdown_flag_clone.swap(true, Ordering::SeqCst) {
            error!("Ctrl+C received again, still waiting for the server to stop");
        } else {
            info!("Ctrl+C received - stopping after the current buffer...");
        }
    })?;

    Ok(StopSignal::from_flag(shutdown_flag))
}
