use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use exam_core::model::{ExamPlan, QuestionId, SessionId};
use services::exam::{CommandOutcome, RunnerSettings};
use services::in_memory::SilentPromptPlayer;
use services::{
    AttemptHistoryService, Clock, ExamController, HttpGateway, SessionCommand, SessionRunner,
};
use storage::repository::Storage;
use tracing_subscriber::EnvFilter;

mod recorder;

use recorder::DirectoryRecorder;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    MissingFlag { flag: &'static str },
    UnknownArg(String),
    InvalidNumber { flag: &'static str, raw: String },
    InvalidIds { flag: &'static str, raw: String },
    InvalidSessionId { raw: String },
    InvalidDbUrl { raw: String },
    MissingApiConfig,
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingFlag { flag } => write!(f, "{flag} is required"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidNumber { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidIds { flag, raw } => {
                write!(f, "invalid {flag} value (expected comma-separated ids): {raw}")
            }
            ArgsError::InvalidSessionId { raw } => write!(f, "invalid --session-id value: {raw:?}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::MissingApiConfig => write!(f, "EXAM_API_BASE_URL must be set"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- history  [--db <sqlite_url>] [--limit <n>]");
    eprintln!("  cargo run -p app -- rehearse --session-id <id> --part1 <ids> [--part2 <ids>]");
    eprintln!("                               [--part3 <ids>] [--time <Nmin>] --audio-dir <dir>");
    eprintln!("                               [--answer-secs <n>] [--db <sqlite_url>]");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db sqlite://exam.sqlite3");
    eprintln!("  --limit 10");
    eprintln!("  --answer-secs 5");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  EXAM_DB_URL, EXAM_API_BASE_URL, EXAM_API_TOKEN, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    History,
    Rehearse,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "history" => Some(Self::History),
            "rehearse" => Some(Self::Rehearse),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct HistoryArgs {
    db_url: String,
    limit: u32,
}

#[derive(Debug)]
struct RehearseArgs {
    db_url: String,
    session_id: SessionId,
    plan: ExamPlan,
    time_limit: Option<String>,
    audio_dir: PathBuf,
    answer_secs: u64,
}

fn default_db_url() -> String {
    std::env::var("EXAM_DB_URL")
        .ok()
        .map_or_else(|| "sqlite://exam.sqlite3".into(), normalize_sqlite_url)
}

fn parse_db(args: &mut impl Iterator<Item = String>) -> Result<String, ArgsError> {
    let value = require_value(args, "--db")?;
    if value.trim().is_empty() {
        return Err(ArgsError::InvalidDbUrl { raw: value });
    }
    Ok(normalize_sqlite_url(value))
}

fn parse_number<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<T, ArgsError> {
    let value = require_value(args, flag)?;
    value
        .trim()
        .parse()
        .map_err(|_| ArgsError::InvalidNumber { flag, raw: value })
}

fn parse_ids(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<Vec<QuestionId>, ArgsError> {
    let value = require_value(args, flag)?;
    value
        .split(',')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            raw.parse::<QuestionId>().map_err(|_| ArgsError::InvalidIds {
                flag,
                raw: value.clone(),
            })
        })
        .collect()
}

impl HistoryArgs {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = default_db_url();
        let mut limit = 10;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => db_url = parse_db(args)?,
                "--limit" => limit = parse_number(args, "--limit")?,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self { db_url, limit })
    }
}

impl RehearseArgs {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = default_db_url();
        let mut session_id = None;
        let mut parts: [Vec<QuestionId>; 3] = Default::default();
        let mut time_limit = None;
        let mut audio_dir = None;
        let mut answer_secs = 5;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => db_url = parse_db(args)?,
                "--session-id" => {
                    let value = require_value(args, "--session-id")?;
                    let parsed = SessionId::new(value.clone())
                        .map_err(|_| ArgsError::InvalidSessionId { raw: value })?;
                    session_id = Some(parsed);
                }
                "--part1" => parts[0] = parse_ids(args, "--part1")?,
                "--part2" => parts[1] = parse_ids(args, "--part2")?,
                "--part3" => parts[2] = parse_ids(args, "--part3")?,
                "--time" => time_limit = Some(require_value(args, "--time")?),
                "--audio-dir" => audio_dir = Some(PathBuf::from(require_value(args, "--audio-dir")?)),
                "--answer-secs" => answer_secs = parse_number(args, "--answer-secs")?,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        let [part1, part2, part3] = parts;
        Ok(Self {
            db_url,
            session_id: session_id.ok_or(ArgsError::MissingFlag {
                flag: "--session-id",
            })?,
            plan: ExamPlan::new(part1, part2, part3),
            time_limit,
            audio_dir: audio_dir.ok_or(ArgsError::MissingFlag { flag: "--audio-dir" })?,
            answer_secs,
        })
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }
    Ok(())
}

async fn open_storage(db_url: &str) -> Result<Storage, Box<dyn std::error::Error>> {
    prepare_sqlite_file(db_url)?;
    Ok(Storage::sqlite(db_url).await?)
}

async fn history(args: HistoryArgs) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_storage(&args.db_url).await?;
    let history = AttemptHistoryService::new(storage.attempts);
    let items = history.list_recent(args.limit).await?;
    if items.is_empty() {
        println!("no attempts recorded yet");
        return Ok(());
    }
    for item in items {
        println!(
            "#{:<4} session {:<12} {}  {} answers, {}s recorded{}",
            item.id,
            item.session_id,
            item.completed_at.format("%Y-%m-%d %H:%M"),
            item.recordings,
            item.total_recorded_secs,
            if item.expired { "  (time ran out)" } else { "" },
        );
    }
    Ok(())
}

async fn rehearse(args: RehearseArgs) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_storage(&args.db_url).await?;
    let gateway = Arc::new(HttpGateway::from_env().ok_or(ArgsError::MissingApiConfig)?);
    let recorder = DirectoryRecorder::open(&args.audio_dir).await?;

    let mut controller = ExamController::new(
        Clock::system(),
        gateway.clone(),
        Arc::new(recorder),
        Arc::new(SilentPromptPlayer::instant()),
        gateway,
    )
    .with_attempts(storage.attempts);
    controller
        .initialize(args.session_id, args.plan, args.time_limit.as_deref())
        .await?;

    let handle = SessionRunner::spawn(controller, RunnerSettings::default());
    let answer = Duration::from_secs(args.answer_secs);
    let mut landed = handle.send(SessionCommand::Begin).await?;

    loop {
        let snapshot = handle.snapshot();
        if snapshot.is_complete() {
            break;
        }
        if let CommandOutcome::Submitted(report) = &landed {
            println!("submitted {} answers", report.uploaded_count());
            break;
        }
        if snapshot.phase.is_thinking() {
            handle.send(SessionCommand::SkipThinking).await?;
        }
        if let Some(text) = &snapshot.question_text {
            tracing::info!(question = %text, "answering");
        }
        handle.send(SessionCommand::StartRecording).await?;
        tokio::time::sleep(answer).await;
        if handle.snapshot().is_complete() {
            // The exam clock ran out and handed the attempt in.
            println!("time is up; attempt submitted");
            break;
        }
        landed = handle.send(SessionCommand::Next).await?;
    }

    let controller = handle.exit().await?;
    if let Some(id) = controller.attempt_id() {
        println!("attempt recorded as #{id}");
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv = std::env::args().skip(1);
    let cmd = match argv.next() {
        None => {
            print_usage();
            return Ok(());
        }
        Some(first) if first == "--help" || first == "-h" => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(&first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };

    let report_args = |e: ArgsError| {
        eprintln!("{e}");
        print_usage();
        e
    };
    match cmd {
        Command::History => history(HistoryArgs::parse(&mut argv).map_err(report_args)?).await,
        Command::Rehearse => rehearse(RehearseArgs::parse(&mut argv).map_err(report_args)?).await,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run().await {
        // At this layer (binary glue), printing once is fine.
        eprintln!("{err}");
        std::process::exit(2);
    }
}
