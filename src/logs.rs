use crate::paths::Paths;
use owo_colors::OwoColorize;
use regex::Regex;
use std::io::{self, BufRead, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Lines of backlog shown before following.
pub const DEFAULT_TAIL_LINES: usize = 15;

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(150);
const MERGE_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One file being tailed, tagged with its owning service.
#[derive(Debug, Clone)]
pub struct LogTarget {
    pub service: String,
    pub stream: LogStream,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub service: String,
    pub stream: LogStream,
    pub timestamp: String,
    pub content: String,
}

// ---------------------------------------------------------------------------
// tail_file — last N lines of a file
// ---------------------------------------------------------------------------

pub fn tail_file(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let reader = io::BufReader::new(file);
    let lines: Vec<String> = reader.lines().collect::<io::Result<Vec<_>>>()?;
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].to_vec())
}

// ---------------------------------------------------------------------------
// Line normalization
// ---------------------------------------------------------------------------

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d{1,6})?)\]?[ \t]*:?[ \t]*")
        .expect("timestamp regex")
});

/// Split a leading timestamp off the line, or synthesize one from the wall
/// clock. The content is otherwise preserved verbatim.
pub fn parse_log_line(line: &str) -> (String, String) {
    let line = line.trim_end_matches(['\n', '\r']);
    if let Some(caps) = TIMESTAMP_RE.captures(line) {
        let matched = caps.get(0).expect("whole match");
        (caps[1].to_string(), line[matched.end()..].to_string())
    } else {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        (now.to_string(), line.to_string())
    }
}

// ---------------------------------------------------------------------------
// Target collection
// ---------------------------------------------------------------------------

/// Existing log files for the given services. Missing files are skipped
/// with a note so a never-started service does not abort the whole tail.
pub fn collect_targets(paths: &Paths, names: &[String]) -> Vec<LogTarget> {
    let mut targets = Vec::new();
    for name in names {
        let pairs = [
            (LogStream::Stdout, paths.stdout_log(name)),
            (LogStream::Stderr, paths.stderr_log(name)),
        ];
        for (stream, path) in pairs {
            if path.exists() {
                targets.push(LogTarget {
                    service: name.clone(),
                    stream,
                    path,
                });
            } else {
                let kind = match stream {
                    LogStream::Stdout => "stdout",
                    LogStream::Stderr => "stderr",
                };
                eprintln!("{}", format!("no {kind} log for '{name}' yet").dimmed());
            }
        }
    }
    targets
}

// ---------------------------------------------------------------------------
// Tail / follow
// ---------------------------------------------------------------------------

/// Print the backlog for every target and, unless `follow` is off, keep
/// streaming appended lines until Ctrl-C. One reader task per file feeds a
/// single printing sink, so lines within one stream stay in file order
/// while streams interleave by arrival.
///
/// `tag_service` selects the multi-service format: every line is prefixed
/// with its service name and stream kind. With a single service only error
/// lines carry a tag; stdout lines are printed bare.
pub async fn tail(
    targets: Vec<LogTarget>,
    backlog: usize,
    follow: bool,
    tag_service: bool,
) -> io::Result<()> {
    for target in &targets {
        for line in tail_file(&target.path, backlog)? {
            print_line(&normalize(target, &line), tag_service);
        }
    }

    if !follow || targets.is_empty() {
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel::<LogLine>(MERGE_CHANNEL_CAPACITY);
    for target in targets {
        tokio::spawn(follow_file(target, tx.clone()));
    }
    drop(tx);

    eprintln!("{}", "Following logs... (press Ctrl+C to stop)".dimmed());
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => print_line(&line, tag_service),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn follow_file(target: LogTarget, tx: mpsc::Sender<LogLine>) {
    let Ok(file) = tokio::fs::File::open(&target.path).await else {
        return;
    };
    let mut reader = BufReader::new(file);
    if reader.seek(SeekFrom::End(0)).await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            // No new data yet; poll again shortly
            Ok(0) => tokio::time::sleep(FOLLOW_POLL_INTERVAL).await,
            Ok(_) => {
                if tx.send(normalize(&target, &line)).await.is_err() {
                    return; // sink gone
                }
            }
            Err(_) => return,
        }
    }
}

fn normalize(target: &LogTarget, line: &str) -> LogLine {
    let (timestamp, content) = parse_log_line(line);
    LogLine {
        service: target.service.clone(),
        stream: target.stream,
        timestamp,
        content,
    }
}

fn print_line(line: &LogLine, tag_service: bool) {
    match (line.stream, tag_service) {
        (LogStream::Stdout, true) => println!(
            "{} | {}: {}",
            line.service.green(),
            line.timestamp.dimmed(),
            line.content
        ),
        (LogStream::Stderr, true) => println!(
            "{} {} | {}: {}",
            line.service.red(),
            "[err]".red().bold(),
            line.timestamp.dimmed(),
            line.content
        ),
        // Single service: stdout stays untagged, errors keep a marker
        (LogStream::Stdout, false) => {
            println!("{}: {}", line.timestamp.dimmed(), line.content)
        }
        (LogStream::Stderr, false) => println!(
            "{} {}: {}",
            "[err]".red().bold(),
            line.timestamp.dimmed(),
            line.content
        ),
    }
}

// ---------------------------------------------------------------------------
// Flush
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Files truncated in place; the running child keeps its descriptors.
    Cleared(usize),
    /// Files removed; the service was stopped.
    Deleted(usize),
}

pub fn flush(paths: &Paths, name: &str, running: bool) -> io::Result<FlushOutcome> {
    let files = [paths.stdout_log(name), paths.stderr_log(name)];
    if running {
        let mut cleared = 0;
        for file in &files {
            if file.exists() {
                // Truncate, never unlink: the child's open descriptors must
                // stay valid. Its append position resets on the next write.
                std::fs::OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(file)?;
                cleared += 1;
            }
        }
        Ok(FlushOutcome::Cleared(cleared))
    } else {
        let mut deleted = 0;
        for file in &files {
            match std::fs::remove_file(file) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(FlushOutcome::Deleted(deleted))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
