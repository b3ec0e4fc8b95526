//! shmtask - shared-memory task queue

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use shmtask::error::ShmtaskError;
use shmtask::lifecycle::{Controller, RegionSpec};
use shmtask::logging::{self, LogConfig};
use shmtask::queue::{QueueStats, SharedRegion, TaskQueue};
use shmtask::records::RequestData;
use shmtask::submit::{CancelToken, Submitter};
use shmtask::worker::run_worker_main;
use shmtask::{config::WorkerMode, paths};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::Level;

use cli::{Cli, Commands};

/// Parses arguments, runs the selected command and turns errors into exit
/// codes: 2 for execution errors, 3 for a saturated queue, 4 for oversized
/// payloads, 130 for a cancelled wait and 1 for everything else.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Init(args) => cmd_init(args),
        Commands::Serve(args) => cmd_serve(args),
        Commands::Submit(args) => cmd_submit(args),
        Commands::Transform(args) => cmd_transform(args),
        Commands::Status(args) => cmd_status(args),
        Commands::Worker(args) => cmd_worker(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        let code = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<ShmtaskError>())
            .map_or(1, ShmtaskError::exit_code);
        std::process::exit(code);
    }
}

/// Pick the preset for the command, then let the environment and the
/// command line adjust it, in that order.
fn init_logging(cli: &Cli) {
    let mut config = match cli.command {
        Commands::Serve(_) => LogConfig::for_host(),
        Commands::Worker(_) => LogConfig::for_worker(),
        _ => LogConfig::for_cli(),
    }
    .with_env_overrides();

    let level = if cli.quiet {
        Some(Level::ERROR)
    } else {
        match cli.verbose {
            0 => None,
            1 => Some(Level::DEBUG),
            _ => Some(Level::TRACE),
        }
    };
    if let Some(level) = level {
        config = config
            .with_level(level)
            .with_filter(level.to_string().to_lowercase());
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    logging::init(config);
}

/// A flag raised by Ctrl+C or SIGTERM.
fn interrupt_flag(message: &'static str) -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        eprintln!("\n{}", message);
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")?;
    Ok(flag)
}

fn cmd_init(args: &cli::InitArgs) -> Result<()> {
    let config = args.queue.to_config()?;
    let path = args.region.path();
    let region = SharedRegion::create_or_attach(&path, &config)?;
    let layout = *region.layout();

    let verb = if region.is_creator() { "Created" } else { "Attached to existing" };
    println!(
        "{} region {}",
        verb.if_supports_color(Stdout, |text| text.green()),
        path.display()
    );
    println!(
        "  {} slots, buffers: input {} B, operation {} B, result {} B",
        layout.slot_count, layout.input_capacity, layout.operation_capacity, layout.result_capacity
    );
    Ok(())
}

fn cmd_serve(args: &cli::ServeArgs) -> Result<()> {
    let queue_config = args.queue.to_config()?;
    let pool_config = args.pool.to_config()?;
    let path = args.region.path();

    let stop = interrupt_flag("Received interrupt, shutting down workers...")?;
    let mut controller =
        Controller::start(RegionSpec::Path(path.clone()), &queue_config, pool_config)
            .with_context(|| format!("Failed to serve region {}", path.display()))?;
    eprintln!(
        "Serving {} with {} worker(s). Press Ctrl+C to stop.",
        path.display(),
        args.pool.workers
    );

    let report = controller.run_until(&stop)?;
    eprintln!(
        "Stopped: {} worker(s) exited, {} stopped hard",
        report.graceful, report.hard_stopped
    );
    Ok(())
}

fn cmd_submit(args: &cli::SubmitArgs) -> Result<()> {
    let path = args.region.path();
    let input = args.input.read_input()?;
    let queue = TaskQueue::new(
        SharedRegion::attach(&path)
            .with_context(|| format!("No task queue at {}; run `shmtask serve` first", path.display()))?,
    );

    let cancel = CancelToken::from_flag(interrupt_flag("Cancelling wait...")?);
    let mut submitter = Submitter::new(queue)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
        .with_cancel_token(cancel);
    if let Some(timeout_ms) = args.timeout_ms {
        submitter = submitter.with_timeout(Duration::from_millis(timeout_ms));
    }

    let result = submitter.submit(&input, args.input.operation.as_bytes())?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&result)?;
    stdout.write_all(b"\n")?;
    Ok(())
}

fn cmd_transform(args: &cli::TransformArgs) -> Result<()> {
    let input = args.input.read_input()?;
    let data = RequestData::from_json_str(&String::from_utf8_lossy(&input));
    let queue_config = args.queue.to_config()?;
    let pool_config = args.pool.to_config()?;

    let region = match pool_config.mode {
        WorkerMode::Process => RegionSpec::Path(paths::private_region_path()),
        WorkerMode::Thread => RegionSpec::Anonymous,
    };
    let mut controller = Controller::start(region, &queue_config, pool_config)?;

    let cancel = CancelToken::from_flag(interrupt_flag("Cancelling transform...")?);
    let submitter = controller.submitter().with_cancel_token(cancel);
    // Respawn crashed workers while waiting; a dead worker never answers.
    let outcome = controller.supervised(|| submitter.transform(&data, &args.input.operation));
    controller.shutdown()?;

    let mut stdout = std::io::stdout().lock();
    for record in outcome? {
        serde_json::to_writer(&mut stdout, &record)?;
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

fn cmd_status(args: &cli::StatusArgs) -> Result<()> {
    let path = args.region.path();
    let queue = TaskQueue::new(
        SharedRegion::attach(&path)
            .with_context(|| format!("No task queue at {}", path.display()))?,
    );
    let stats = queue.stats();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_status(&path, &stats);
    }
    Ok(())
}

fn print_status(path: &std::path::Path, stats: &QueueStats) {
    println!(
        "{} {}",
        "Region".if_supports_color(Stdout, |text| text.bold()),
        path.display()
    );
    println!(
        "  Slots:        {} ({} in use)",
        stats.slot_count,
        stats.states.in_use()
    );
    println!("  Empty:        {}", stats.states.empty);
    println!("  Pending:      {}", stats.states.request_pending);
    println!("  Claimed:      {}", stats.states.claimed);
    println!("  Ready:        {}", stats.states.response_ready);
    println!("  Error:        {}", stats.states.error);
    println!("  Head/tail:    {}/{}", stats.head, stats.tail);
    println!("  Workers:      {}", stats.registered_workers);
    println!("  Total claims: {}", stats.total_claims);
    println!(
        "  Buffers:      input {} B, operation {} B, result {} B",
        stats.input_capacity, stats.operation_capacity, stats.result_capacity
    );
    println!("  Lease:        {} ms", stats.lease_ms);
    if stats.shutdown_requested {
        println!(
            "  {}",
            "Shutdown requested".if_supports_color(Stdout, |text| text.yellow())
        );
    }
}

fn cmd_worker(args: &cli::WorkerArgs) -> Result<()> {
    let transform = args.transform.to_kind()?;
    let summary = run_worker_main(
        &args.region,
        args.worker_id,
        Duration::from_millis(args.poll_interval_ms),
        &transform,
    )?;
    tracing::debug!(
        worker_id = args.worker_id,
        completed = summary.completed,
        failed = summary.failed,
        dropped = summary.dropped,
        "Worker exiting"
    );
    Ok(())
}
