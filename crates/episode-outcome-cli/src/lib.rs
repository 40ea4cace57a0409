//! Embedded episode command surface for host runtimes.
//!
//! Hosts embed episode behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_episode_with_db`] for direct [`Command`] execution against DB paths.
//! - [`run_episode`] for execution against an existing [`EpisodeService`].

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use episode_outcome_core::{
    counter_key, format_rfc3339, now_utc, parse_rfc3339_utc, EpisodeReport,
    EpisodicOutcomeService, Reflection, TaskIdentity, EPISODE_TASK_ID, EPISODE_TASK_TITLE,
};
use episode_outcome_store_sqlite::{SqliteCounterStore, SqliteOutcomeStore};
use serde::{Deserialize, Serialize};

pub const LOG_CONTRACT_VERSION: &str = "episode_log.v1";
pub const LIST_CONTRACT_VERSION: &str = "episode_report_list.v1";

const REPORT_DATE_FORMAT: &str = "[year]-[month]-[day] [hour]:[minute] UTC";

pub type EpisodeService = EpisodicOutcomeService<SqliteOutcomeStore, SqliteCounterStore>;

#[derive(Debug, Parser)]
#[command(name = "bed")]
#[command(about = "Episode outcome store CLI")]
pub struct Cli {
    #[arg(long, default_value = "./bed_support.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./bed_support.counters.sqlite3")]
    counters_db: PathBuf,

    #[arg(long, default_value = EPISODE_TASK_ID)]
    task: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Episode {
        #[command(subcommand)]
        command: Box<EpisodeCommand>,
    },
    Allocator {
        #[command(subcommand)]
        command: AllocatorCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum EpisodeCommand {
    Log(LogArgs),
    List(ListArgs),
    Show(ShowArgs),
}

#[derive(Debug, Args)]
pub struct LogArgs {
    #[arg(long = "trigger")]
    triggers: Vec<String>,
    #[arg(long)]
    control_level: u8,
    #[arg(long, default_value = "")]
    location: String,
    #[arg(long, default_value = "")]
    urge_to_eat: String,
    #[arg(long = "what-ate")]
    what_ate: Vec<String>,
    #[arg(long, default_value = "")]
    duration: String,
    #[arg(long)]
    recorded_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    id: u64,
}

#[derive(Debug, Subcommand)]
pub enum AllocatorCommand {
    Show,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EpisodeLogPayload {
    pub contract_version: String,
    pub task_id: String,
    pub occurrence_index: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EpisodeListPayload {
    pub contract_version: String,
    pub task_id: String,
    pub generated_at: String,
    pub reports: Vec<EpisodeReport>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AllocatorStatePayload {
    pub task_id: String,
    pub counter_key: String,
    pub next_index: u64,
}

/// Installs a stderr `tracing` subscriber filtered by `RUST_LOG` (default `warn`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_episode_with_db(&cli.db, &cli.counters_db, &cli.task, cli.command)
}

/// Executes a parsed command against the given outcome and counter DB paths.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_episode_with_db(
    db_path: &Path,
    counters_db_path: &Path,
    task_id: &str,
    command: Command,
) -> Result<()> {
    tracing::debug!(
        db = %db_path.display(),
        counters_db = %counters_db_path.display(),
        task_id,
        "opening episode stores"
    );
    let store = SqliteOutcomeStore::open(db_path)?;
    store.migrate()?;
    let counters = SqliteCounterStore::open(counters_db_path)?;
    counters.migrate()?;

    let service = EpisodicOutcomeService::new(store, counters);
    run_episode(command, task_id, &service)
}

/// Executes a parsed command against an existing service handle.
///
/// # Errors
/// Returns an error when validation, persistence, or retrieval fails.
pub fn run_episode(command: Command, task_id: &str, service: &EpisodeService) -> Result<()> {
    match command {
        Command::Episode { command } => match *command {
            EpisodeCommand::Log(args) => {
                let payload = log_episode(service, task_id, args)?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
                Ok(())
            }
            EpisodeCommand::List(args) => {
                let reports = list_reports(service, task_id)?;
                if args.json {
                    let payload = EpisodeListPayload {
                        contract_version: LIST_CONTRACT_VERSION.to_string(),
                        task_id: task_id.to_string(),
                        generated_at: format_rfc3339(now_utc())?,
                        reports,
                    };
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                } else {
                    print!("{}", render_report_table(&reports));
                }
                Ok(())
            }
            EpisodeCommand::Show(args) => {
                let task = require_task(service, task_id)?;
                let Some(report) = service.find_report(&task, args.id)? else {
                    return Err(anyhow!("episode report not found: {task_id}#{}", args.id));
                };
                print!("{}", render_report_text(&report)?);
                Ok(())
            }
        },
        Command::Allocator { command } => match command {
            AllocatorCommand::Show => {
                let task = require_task(service, task_id)?;
                let payload = AllocatorStatePayload {
                    task_id: task.task_id.clone(),
                    counter_key: counter_key(&task),
                    next_index: service.allocator().next_index(&task)?,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
                Ok(())
            }
        },
    }
}

fn log_episode(service: &EpisodeService, task_id: &str, args: LogArgs) -> Result<EpisodeLogPayload> {
    let recorded_at = match args.recorded_at.as_deref() {
        Some(raw) => {
            parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid --recorded-at value: {err}"))?
        }
        None => now_utc(),
    };

    let reflection = Reflection {
        triggers: args.triggers.into_iter().collect::<BTreeSet<_>>(),
        control_level: args.control_level,
        location: args.location,
        urge_to_eat: args.urge_to_eat,
        what_ate: args.what_ate.into_iter().collect::<BTreeSet<_>>(),
        episode_duration_label: args.duration,
        recorded_at,
    };
    reflection.validate()?;

    let title = if task_id == EPISODE_TASK_ID {
        EPISODE_TASK_TITLE
    } else {
        task_id
    };
    let task = service.store().ensure_task(task_id, title)?;
    let key = service
        .record(&task, &reflection)
        .with_context(|| format!("failed to record episode for task {task_id}"))?;

    Ok(EpisodeLogPayload {
        contract_version: LOG_CONTRACT_VERSION.to_string(),
        task_id: key.task.task_id,
        occurrence_index: key.occurrence_index,
    })
}

fn list_reports(service: &EpisodeService, task_id: &str) -> Result<Vec<EpisodeReport>> {
    match service.store().find_task(task_id)? {
        Some(task) => Ok(service.reports(&task)?),
        None => Ok(Vec::new()),
    }
}

fn require_task(service: &EpisodeService, task_id: &str) -> Result<TaskIdentity> {
    service
        .store()
        .find_task(task_id)?
        .ok_or_else(|| anyhow!("task not found: {task_id}"))
}

fn format_report_date(report: &EpisodeReport) -> Result<String> {
    let format = time::format_description::parse(REPORT_DATE_FORMAT)
        .map_err(|err| anyhow!("invalid report date format: {err}"))?;
    report
        .date
        .to_offset(time::UtcOffset::UTC)
        .format(&format)
        .context("failed to format report date")
}

/// Renders one report as the plain-text export block.
///
/// # Errors
/// Returns an error when the report date cannot be formatted.
pub fn render_report_text(report: &EpisodeReport) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "Episode report — {}", format_report_date(report)?)?;
    writeln!(out, "Feelings / triggers: {}", report.triggers)?;
    writeln!(out, "Control level: {}/10", report.control_level)?;
    writeln!(out, "Where: {}", report.location)?;
    writeln!(out, "Urge to eat: {}", report.urge_to_eat)?;
    writeln!(out, "What you ate: {}", report.what_ate)?;
    writeln!(out, "Episode duration: {}", report.episode_duration)?;
    Ok(out)
}

#[must_use]
pub fn render_report_table(reports: &[EpisodeReport]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<6} {:<25} {:<8} {:<20} triggers",
        "id", "date", "control", "location"
    );
    let _ = writeln!(out, "{}", "-".repeat(90));
    for report in reports {
        let date = format_rfc3339(report.date).unwrap_or_else(|_| "n/a".to_string());
        let control = format!("{}/10", report.control_level);
        let _ = writeln!(
            out,
            "{:<6} {:<25} {:<8} {:<20} {}",
            report.id, date, control, report.location,
            report.triggers
        );
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use std::fs;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    struct TempDbs {
        db: PathBuf,
        counters: PathBuf,
    }

    impl TempDbs {
        fn new(label: &str) -> Self {
            let id = Ulid::new();
            Self {
                db: std::env::temp_dir().join(format!("bed-{label}-{id}.sqlite3")),
                counters: std::env::temp_dir().join(format!("bed-{label}-{id}.counters.sqlite3")),
            }
        }

        fn args(&self) -> Vec<String> {
            vec![
                "bed".to_string(),
                "--db".to_string(),
                self.db.display().to_string(),
                "--counters-db".to_string(),
                self.counters.display().to_string(),
            ]
        }

        fn service(&self) -> EpisodeService {
            let store = must(SqliteOutcomeStore::open(&self.db));
            must(store.migrate());
            let counters = must(SqliteCounterStore::open(&self.counters));
            must(counters.migrate());
            EpisodicOutcomeService::new(store, counters)
        }
    }

    impl Drop for TempDbs {
        fn drop(&mut self) {
            for path in [&self.db, &self.counters] {
                for suffix in ["", "-wal", "-shm"] {
                    let _ = fs::remove_file(format!("{}{suffix}", path.display()));
                }
            }
        }
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args).map_err(|err| anyhow!(err.to_string()))?;
        run_cli(cli)
    }

    fn log_args(dbs: &TempDbs, recorded_at: &str, control_level: &str) -> Vec<String> {
        let mut args = dbs.args();
        args.extend(
            [
                "episode",
                "log",
                "--trigger",
                "Stress",
                "--trigger",
                "Anxiety",
                "--control-level",
                control_level,
                "--location",
                "Home",
                "--urge-to-eat",
                "Sweet / candy",
                "--what-ate",
                "Junk food",
                "--duration",
                "2 min 15 s",
                "--recorded-at",
                recorded_at,
            ]
            .iter()
            .map(ToString::to_string),
        );
        args
    }

    fn fixture_report() -> EpisodeReport {
        EpisodeReport {
            id: 3,
            date: must(parse_rfc3339_utc("2026-02-07T12:30:00Z").map_err(Into::into)),
            triggers: "Anxiety, Stress".to_string(),
            control_level: 7,
            location: "Home".to_string(),
            urge_to_eat: "Sweet / candy".to_string(),
            what_ate: "Junk food".to_string(),
            episode_duration: "2 min 15 s".to_string(),
        }
    }

    #[test]
    fn text_report_uses_export_labels() {
        let text = must(render_report_text(&fixture_report()));
        assert_eq!(
            text,
            "Episode report — 2026-02-07 12:30 UTC\n\
             Feelings / triggers: Anxiety, Stress\n\
             Control level: 7/10\n\
             Where: Home\n\
             Urge to eat: Sweet / candy\n\
             What you ate: Junk food\n\
             Episode duration: 2 min 15 s\n"
        );
    }

    #[test]
    fn table_lists_one_row_per_report() {
        let table = render_report_table(&[fixture_report()]);
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id"));
        assert!(lines[2].contains("2026-02-07T12:30:00Z"));
        assert!(lines[2].contains("7/10"));
        assert!(lines[2].ends_with("Anxiety, Stress"));
    }

    #[test]
    fn cli_defaults_match_documented_paths() {
        let cli = match Cli::try_parse_from(["bed", "allocator", "show"]) {
            Ok(value) => value,
            Err(err) => panic!("failed to parse default cli: {err}"),
        };
        assert_eq!(cli.db, PathBuf::from("./bed_support.sqlite3"));
        assert_eq!(cli.counters_db, PathBuf::from("./bed_support.counters.sqlite3"));
        assert_eq!(cli.task, EPISODE_TASK_ID);
    }

    #[test]
    fn cli_end_to_end_log_list_show_and_allocator() {
        let dbs = TempDbs::new("e2e");

        must(execute_cli(log_args(&dbs, "2026-02-05T08:00:00Z", "4")));
        must(execute_cli(log_args(&dbs, "2026-02-07T08:00:00Z", "7")));
        must(execute_cli(log_args(&dbs, "2026-02-06T08:00:00Z", "9")));

        let mut list = dbs.args();
        list.extend(["episode".to_string(), "list".to_string(), "--json".to_string()]);
        must(execute_cli(list));

        let mut show = dbs.args();
        show.extend(["episode", "show", "--id", "1"].iter().map(ToString::to_string));
        must(execute_cli(show));

        let mut allocator = dbs.args();
        allocator.extend(["allocator".to_string(), "show".to_string()]);
        must(execute_cli(allocator));

        let service = dbs.service();
        let task = match must(service.store().find_task(EPISODE_TASK_ID)) {
            Some(value) => value,
            None => panic!("episode task must be registered after log"),
        };
        let reports = must(service.reports(&task).map_err(Into::into));
        let ids = reports.iter().map(|report| report.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 0]);
        assert_eq!(reports[0].control_level, 7);
        assert_eq!(reports[0].triggers, "Anxiety, Stress");
        assert_eq!(
            must(service.allocator().next_index(&task).map_err(Into::into)),
            3
        );
    }

    #[test]
    fn invalid_control_level_writes_nothing() {
        let dbs = TempDbs::new("invalid");
        let err = match execute_cli(log_args(&dbs, "2026-02-05T08:00:00Z", "11")) {
            Ok(()) => panic!("control level 11 must be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("control_level MUST be in"));

        let service = dbs.service();
        assert_eq!(must(service.store().find_task(EPISODE_TASK_ID)), None);
    }

    #[test]
    fn reads_against_unregistered_task() {
        let dbs = TempDbs::new("unregistered");
        assert!(must(list_reports(&dbs.service(), "never_logged")).is_empty());

        let mut show = dbs.args();
        show.extend(["episode", "show", "--id", "0"].iter().map(ToString::to_string));
        let err = match execute_cli(show) {
            Ok(()) => panic!("show on an empty store must fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("task not found"));
    }

    #[test]
    fn embed_api_runs_against_existing_service() {
        let dbs = TempDbs::new("embed");
        let service = dbs.service();

        let payload = must(log_episode(
            &service,
            "custom_task",
            LogArgs {
                triggers: Vec::new(),
                control_level: 3,
                location: String::new(),
                urge_to_eat: String::new(),
                what_ate: Vec::new(),
                duration: String::new(),
                recorded_at: Some("2026-02-07T12:00:00Z".to_string()),
            },
        ));
        assert_eq!(
            payload,
            EpisodeLogPayload {
                contract_version: LOG_CONTRACT_VERSION.to_string(),
                task_id: "custom_task".to_string(),
                occurrence_index: 0,
            }
        );

        must(run_episode(
            Command::Episode {
                command: Box::new(EpisodeCommand::List(ListArgs { json: false })),
            },
            "custom_task",
            &service,
        ));

        let reports = must(list_reports(&service, "custom_task"));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].triggers, episode_outcome_core::NOT_SPECIFIED);
        assert_eq!(reports[0].episode_duration, episode_outcome_core::EMPTY_PLACEHOLDER);
    }
}
