use clap::{CommandFactory, Parser};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use pmo::cli::{Cli, Command};
use pmo::config::{self, ServiceSpec};
use pmo::env_file;
use pmo::logs;
use pmo::paths::Paths;
use pmo::runner::{self, StartOutcome};
use pmo::status::{self, PidProbe, ServiceState, StatusRow};
use pmo::stop::{self, StopOutcome};
use std::path::Path;
use std::time::Duration;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let code = run(&cli.config, command).await;
    std::process::exit(code);
}

async fn run(config_path: &Path, command: Command) -> i32 {
    let paths = match Paths::new(config_path) {
        Ok(paths) => paths,
        Err(e) => {
            print_error(&e.to_string());
            return 1;
        }
    };
    let specs = match config::load_descriptor(paths.descriptor()) {
        Ok(specs) => specs,
        Err(e) => {
            print_error(&e.to_string());
            return 1;
        }
    };

    match command {
        Command::Start { services } => handle_start(&paths, &specs, &services),
        Command::Stop { services, timeout } => {
            handle_stop(&paths, &specs, &services, Duration::from_secs(timeout)).await
        }
        Command::Restart { services, timeout } => {
            handle_restart(&paths, &specs, &services, Duration::from_secs(timeout)).await
        }
        Command::Log {
            services,
            lines,
            no_follow,
        } => handle_log(&paths, &specs, &services, lines, no_follow).await,
        Command::Flush { services } => handle_flush(&paths, &specs, &services),
        Command::DryRun { services } => handle_dry_run(&specs, &services),
        Command::Ls => handle_ls(&paths, &specs).await,
    }
}

// ---------------------------------------------------------------------------
// Selection helpers
// ---------------------------------------------------------------------------

/// start/stop/restart act on nothing by default; prompt instead of guessing.
fn require_selection<'a>(
    specs: &'a [ServiceSpec],
    services: &[String],
    verb: &str,
) -> Option<(Vec<&'a ServiceSpec>, Vec<String>)> {
    if services.is_empty() {
        print_warning(&format!(
            "specify a service name, id, or 'all' to {verb} all services"
        ));
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        if !names.is_empty() {
            eprintln!("{}", format!("available services: {}", names.join(", ")).dimmed());
        }
        return None;
    }
    Some(config::resolve_selection(specs, services))
}

/// log/flush/dry-run default to every service, like the status table.
fn selection_or_all<'a>(
    specs: &'a [ServiceSpec],
    services: &[String],
) -> (Vec<&'a ServiceSpec>, Vec<String>) {
    if services.is_empty() {
        (specs.iter().collect(), Vec::new())
    } else {
        config::resolve_selection(specs, services)
    }
}

fn report_unknown(unknown: &[String]) {
    for selector in unknown {
        print_error(&format!("service not found: '{selector}'"));
    }
}

/// Map per-service accounting onto the exit-code contract: 0 all good,
/// 2 only unknown selectors, 3 partial, 1 total failure.
fn exit_code(ok: usize, failed: usize, unknown: usize) -> i32 {
    if failed == 0 && unknown == 0 {
        0
    } else if ok > 0 {
        3
    } else if failed == 0 {
        2
    } else {
        1
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn handle_start(paths: &Paths, specs: &[ServiceSpec], services: &[String]) -> i32 {
    let Some((picked, unknown)) = require_selection(specs, services, "start") else {
        return 1;
    };
    report_unknown(&unknown);

    let dotenv = env_file::load_layer(&paths.env_file());
    let mut ok = 0;
    let mut failed = 0;
    for spec in &picked {
        let env = config::effective_env(spec, &dotenv);
        match runner::start(paths, spec, &env, false) {
            Ok(StartOutcome::Started { pid }) => {
                println!(
                    "{}",
                    format!("service '{}' started (pid {pid})", spec.name).green()
                );
                ok += 1;
            }
            Ok(StartOutcome::AlreadyRunning { pid }) => {
                println!("service '{}' is already running (pid {pid})", spec.name);
                ok += 1;
            }
            Err(e) => {
                print_error(&e.to_string());
                failed += 1;
            }
        }
    }
    exit_code(ok, failed, unknown.len())
}

async fn handle_stop(
    paths: &Paths,
    specs: &[ServiceSpec],
    services: &[String],
    timeout: Duration,
) -> i32 {
    let Some((picked, unknown)) = require_selection(specs, services, "stop") else {
        return 1;
    };
    report_unknown(&unknown);

    let mut ok = 0;
    let mut failed = 0;
    for spec in &picked {
        match stop::stop(paths, &spec.name, timeout).await {
            Ok(StopOutcome::Stopped { .. }) => {
                println!("service '{}' stopped", spec.name);
                ok += 1;
            }
            Ok(StopOutcome::NotRunning) => {
                println!("service '{}' is not running", spec.name);
                ok += 1;
            }
            Err(e) => {
                print_error(&format!("failed to stop '{}': {e}", spec.name));
                failed += 1;
            }
        }
    }
    exit_code(ok, failed, unknown.len())
}

async fn handle_restart(
    paths: &Paths,
    specs: &[ServiceSpec],
    services: &[String],
    timeout: Duration,
) -> i32 {
    let Some((picked, unknown)) = require_selection(specs, services, "restart") else {
        return 1;
    };
    report_unknown(&unknown);

    let dotenv = env_file::load_layer(&paths.env_file());
    let mut ok = 0;
    let mut failed = 0;
    for spec in &picked {
        if let Err(e) = stop::stop(paths, &spec.name, timeout).await {
            print_error(&format!("failed to stop '{}': {e}", spec.name));
            failed += 1;
            continue;
        }
        let env = config::effective_env(spec, &dotenv);
        match runner::start(paths, spec, &env, true) {
            Ok(StartOutcome::Started { pid }) => {
                println!(
                    "{}",
                    format!("service '{}' restarted (pid {pid})", spec.name).green()
                );
                ok += 1;
            }
            // A concurrent invocation won the race; count it as done
            Ok(StartOutcome::AlreadyRunning { pid }) => {
                println!("service '{}' is already running (pid {pid})", spec.name);
                ok += 1;
            }
            Err(e) => {
                print_error(&e.to_string());
                failed += 1;
            }
        }
    }
    exit_code(ok, failed, unknown.len())
}

async fn handle_log(
    paths: &Paths,
    specs: &[ServiceSpec],
    services: &[String],
    lines: Option<usize>,
    no_follow: bool,
) -> i32 {
    let (picked, unknown) = selection_or_all(specs, services);
    report_unknown(&unknown);
    if picked.is_empty() {
        print_warning("no services selected for log viewing");
        return exit_code(0, 0, unknown.len()).max(1);
    }

    let lines = lines.unwrap_or(logs::DEFAULT_TAIL_LINES);
    // With several sources interleaved, each line needs its origin; a single
    // service's stdout stays untagged
    let tag_service = picked.len() > 1;

    let names: Vec<String> = picked.iter().map(|s| s.name.clone()).collect();
    let targets = logs::collect_targets(paths, &names);
    if targets.is_empty() {
        print_warning("no log files found for the selected services");
        return exit_code(picked.len(), 0, unknown.len());
    }

    match logs::tail(targets, lines, !no_follow, tag_service).await {
        Ok(()) => exit_code(picked.len(), 0, unknown.len()),
        Err(e) => {
            print_error(&format!("log tail failed: {e}"));
            1
        }
    }
}

fn handle_flush(paths: &Paths, specs: &[ServiceSpec], services: &[String]) -> i32 {
    let (picked, unknown) = selection_or_all(specs, services);
    report_unknown(&unknown);

    let mut ok = 0;
    let mut failed = 0;
    for spec in &picked {
        let running = matches!(status::probe_pid(paths, &spec.name), PidProbe::Alive(_));
        match logs::flush(paths, &spec.name, running) {
            Ok(logs::FlushOutcome::Cleared(n)) => {
                println!("cleared {n} log file(s) for running service '{}'", spec.name);
                ok += 1;
            }
            Ok(logs::FlushOutcome::Deleted(n)) => {
                println!("deleted {n} log file(s) for '{}'", spec.name);
                ok += 1;
            }
            Err(e) => {
                print_error(&format!("failed to flush '{}': {e}", spec.name));
                failed += 1;
            }
        }
    }
    exit_code(ok, failed, unknown.len())
}

fn handle_dry_run(specs: &[ServiceSpec], services: &[String]) -> i32 {
    let (picked, unknown) = selection_or_all(specs, services);
    report_unknown(&unknown);

    for spec in &picked {
        println!("{}", spec.name.cyan().bold());
        println!("  {} {}", "$".dimmed(), spec.cmd.trim());
        if let Some(cwd) = &spec.cwd {
            println!("  {} {}", "cwd:".dimmed(), cwd.display());
        }
        for (key, value) in &spec.env {
            println!("  {} {key}={value}", "env:".dimmed());
        }
    }
    exit_code(picked.len(), 0, unknown.len())
}

async fn handle_ls(paths: &Paths, specs: &[ServiceSpec]) -> i32 {
    if specs.is_empty() {
        print_warning("no services defined in config");
        return 0;
    }

    let rows = status::status_all(paths, specs).await;
    println!("{}", render_status_table(&rows));

    let running = rows
        .iter()
        .filter(|r| r.state == ServiceState::Running)
        .count();
    println!("{}", format!("Config: {}", paths.descriptor().display()).dimmed());
    println!("{}", format!("Running: {running}/{}", rows.len()).dimmed());
    0
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn state_color(state: ServiceState) -> Color {
    match state {
        ServiceState::Running => Color::Green,
        ServiceState::Stopped => Color::Reset,
        ServiceState::Stale => Color::Yellow,
    }
}

fn render_status_table(rows: &[StatusRow]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("id").add_attribute(Attribute::Bold),
        Cell::new("name").add_attribute(Attribute::Bold),
        Cell::new("pid").add_attribute(Attribute::Bold),
        Cell::new("uptime").add_attribute(Attribute::Bold),
        Cell::new("status").add_attribute(Attribute::Bold),
        Cell::new("cpu").add_attribute(Attribute::Bold),
        Cell::new("mem").add_attribute(Attribute::Bold),
        Cell::new("gpu mem").add_attribute(Attribute::Bold),
        Cell::new("gpu id").add_attribute(Attribute::Bold),
        Cell::new("restarts").add_attribute(Attribute::Bold),
        Cell::new("user").add_attribute(Attribute::Bold),
    ]);

    for (index, row) in rows.iter().enumerate() {
        let pid = row
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let restarts = row.restarts.to_string();
        let restarts_cell = if row.restarts > 0 {
            Cell::new(&restarts).fg(Color::Yellow)
        } else {
            Cell::new(&restarts)
        };
        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(&row.name).fg(Color::Cyan),
            Cell::new(pid),
            Cell::new(format_uptime(row.uptime_secs)),
            Cell::new(row.state.to_string()).fg(state_color(row.state)),
            Cell::new(format_cpu(row.cpu_percent)),
            Cell::new(format_memory_bytes(row.mem_rss)),
            Cell::new(format_gpu_mem(row.gpu_mem_mib)),
            Cell::new(format_gpu_ids(&row.gpu_ids)),
            restarts_cell,
            Cell::new(row.user.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn format_uptime(uptime: Option<f64>) -> String {
    let Some(uptime) = uptime else {
        return "-".to_string();
    };
    let s = uptime.max(0.0) as u64;
    match s {
        0..60 => format!("{s}s"),
        60..3600 => format!("{}m {}s", s / 60, s % 60),
        3600..86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        _ => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}

fn format_cpu(cpu: Option<f64>) -> String {
    match cpu {
        Some(v) => format!("{v:.1}%"),
        None => "-".to_string(),
    }
}

fn format_memory_bytes(bytes: Option<u64>) -> String {
    const KB: f64 = 1024.0;
    match bytes {
        None => "-".to_string(),
        Some(b) if (b as f64) < KB => format!("{b}B"),
        Some(b) if (b as f64) < KB * KB => format!("{:.1}KB", b as f64 / KB),
        Some(b) if (b as f64) < KB * KB * KB => format!("{:.1}MB", b as f64 / (KB * KB)),
        Some(b) => format!("{:.1}GB", b as f64 / (KB * KB * KB)),
    }
}

fn format_gpu_mem(mib: Option<u64>) -> String {
    match mib {
        Some(m) => format!("{m} MiB"),
        None => "-".to_string(),
    }
}

fn format_gpu_ids(ids: &[u32]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn print_error(message: &str) {
    eprintln!("{} {message}", "error:".red().bold());
}

fn print_warning(message: &str) {
    eprintln!("{} {message}", "warning:".yellow().bold());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
