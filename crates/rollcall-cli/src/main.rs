use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceStatus, EnrollmentStore, FeatureVector, StoreError};
use rollcall_engine::{Config, Engine, RecordOutcome};
use rollcall_store::{RecordFilter, SqliteStore};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Config file (overrides ROLLCALL_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database path (overrides config and ROLLCALL_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database and cache status
    Status,
    /// Manage enrolled face samples
    Faces {
        #[command(subcommand)]
        command: FacesCommand,
    },
    /// Match a feature vector against the enrolled faces
    Identify {
        /// JSON file holding an array of 128 numbers
        #[arg(long)]
        vector: PathBuf,
    },
    /// Record attendance for one identity
    Attend {
        #[arg(short, long)]
        session: String,
        identity: String,
        /// present or late
        #[arg(long, default_value = "present")]
        status: AttendanceStatus,
    },
    /// Mark every roster member without a record as absent
    Absent {
        #[arg(short, long)]
        session: String,
        /// File with one identity id per line
        #[arg(long)]
        roster: PathBuf,
    },
    /// Show matching records and per-status totals
    Report {
        #[arg(short, long)]
        session: Option<String>,
        /// Calendar day, YYYY-MM-DD
        #[arg(long)]
        day: Option<NaiveDate>,
        #[arg(long)]
        identity: Option<String>,
        #[arg(long)]
        status: Option<AttendanceStatus>,
    },
}

#[derive(Subcommand)]
enum FacesCommand {
    /// List enrolled identities and their sample counts
    List,
    /// Enroll a sample from a vector file
    Import {
        identity: String,
        /// JSON file holding an array of 128 numbers
        #[arg(long)]
        vector: PathBuf,
    },
    /// Remove every sample for an identity
    Remove { identity: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = SqliteStore::open(&config.db_path, config.store_timeout())
        .await
        .map_err(store_failure)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let engine = Engine::start(config, Arc::new(store.clone()), Arc::new(store.clone()))
        .await
        .map_err(store_failure)?;

    let result = run(cli.command, cli.json, &engine, &store).await;
    engine.shutdown().await;
    result
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?
            .with_env(|key| std::env::var(key).ok())
            .validated(),
        None => Config::load()?,
    };
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    tracing::debug!(db = %config.db_path.display(), policy = ?config.dedup_policy, "configuration loaded");
    Ok(config)
}

async fn run(command: Commands, as_json: bool, engine: &Engine, store: &SqliteStore) -> Result<()> {
    match command {
        Commands::Status => {
            let snapshot = engine.snapshot();
            let samples = store.count_faces().await.map_err(store_failure)?;
            if as_json {
                print_json(&json!({
                    "db_path": engine.config().db_path,
                    "samples": samples,
                    "identities": snapshot.identities().len(),
                    "cached_vectors": snapshot.len(),
                    "skipped_records": snapshot.skipped(),
                    "cache_generation": snapshot.generation(),
                    "dedup_policy": engine.config().dedup_policy,
                    "match_threshold": engine.config().match_threshold,
                }))?;
            } else {
                println!("database:   {}", engine.config().db_path.display());
                println!("samples:    {samples}");
                println!("identities: {}", snapshot.identities().len());
                println!("cached:     {} (skipped {} corrupt)", snapshot.len(), snapshot.skipped());
                println!("dedup:      {:?}", engine.config().dedup_policy);
                println!("threshold:  {}", engine.config().match_threshold);
            }
        }
        Commands::Faces { command } => run_faces(command, as_json, engine, store).await?,
        Commands::Identify { vector } => {
            let probe = read_vector(&vector)?;
            let result = engine.identify(&probe);
            if as_json {
                print_json(&result)?;
            } else if let Some(identity) = &result.identity_id {
                println!("matched {identity} (confidence {:.2})", result.confidence);
            } else {
                match result.distance {
                    Some(d) => println!("no match (nearest distance {d:.4})"),
                    None => println!("no match (no enrolled faces)"),
                }
            }
        }
        Commands::Attend { session, identity, status } => {
            let outcome = engine
                .confirm(&session, &identity, status)
                .await
                .map_err(store_failure)?;
            match outcome {
                RecordOutcome::Recorded(record) => {
                    if as_json {
                        print_json(&json!({ "outcome": "recorded", "record": record }))?;
                    } else {
                        println!("recorded {identity} as {} at {}", record.status, record.timestamp);
                    }
                }
                RecordOutcome::AlreadyRecorded => {
                    if as_json {
                        print_json(&json!({ "outcome": "already_recorded" }))?;
                    } else {
                        println!("{identity}: already recorded");
                    }
                }
            }
        }
        Commands::Absent { session, roster } => {
            let roster = read_roster(&roster)?;
            let marked = engine.mark_absent(&session, &roster).await.map_err(store_failure)?;
            if as_json {
                print_json(&json!({ "session": session, "roster": roster.len(), "marked_absent": marked }))?;
            } else {
                println!("marked {marked} of {} roster members absent", roster.len());
            }
        }
        Commands::Report { session, day, identity, status } => {
            let filter = report_filter(session, day, identity, status)?;
            let records = store.records(&filter).await.map_err(store_failure)?;
            let summary = store.summary(&filter).await.map_err(store_failure)?;
            if as_json {
                print_json(&json!({
                    "session": filter.session_id,
                    "day": filter.day,
                    "identity": filter.identity_id,
                    "status": filter.status,
                    "summary": summary,
                    "records": records,
                }))?;
            } else {
                for record in &records {
                    println!(
                        "{}  {:<8}  {:<10}  {}",
                        record.timestamp, record.status, record.session_id, record.identity_id
                    );
                }
                let totals: Vec<String> = summary.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!("{} records ({})", records.len(), totals.join(", "));
            }
        }
    }
    Ok(())
}

async fn run_faces(command: FacesCommand, as_json: bool, engine: &Engine, store: &SqliteStore) -> Result<()> {
    match command {
        FacesCommand::List => {
            let snapshot = engine.snapshot();
            let identities = snapshot.identities();
            if as_json {
                print_json(&identities)?;
            } else if identities.is_empty() {
                println!("No faces enrolled");
            } else {
                for (identity, samples) in &identities {
                    println!("{identity}\t{samples} samples");
                }
            }
        }
        FacesCommand::Import { identity, vector } => {
            let probe = read_vector(&vector)?;
            let reference = vector.display().to_string();
            let id = store
                .insert(&identity, &reference, &probe.to_bytes())
                .await
                .map_err(store_failure)?;
            engine.reload().await.map_err(store_failure)?;
            if as_json {
                print_json(&json!({ "identity": identity, "row_id": id }))?;
            } else {
                println!("imported sample {id} for {identity}");
            }
        }
        FacesCommand::Remove { identity } => {
            let removed = engine.remove_identity(&identity).await.map_err(store_failure)?;
            if as_json {
                print_json(&json!({ "identity": identity, "removed": removed }))?;
            } else {
                println!("removed {removed} samples for {identity}");
            }
        }
    }
    Ok(())
}

/// A report needs at least a session, a day or an identity to scope it.
fn report_filter(
    session_id: Option<String>,
    day: Option<NaiveDate>,
    identity_id: Option<String>,
    status: Option<AttendanceStatus>,
) -> Result<RecordFilter> {
    let filter = RecordFilter { session_id, identity_id, day, status };
    if filter.session_id.is_none() && filter.day.is_none() && filter.identity_id.is_none() {
        bail!("report needs --session, --day or --identity");
    }
    Ok(filter)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn store_failure(e: StoreError) -> anyhow::Error {
    if e.is_retryable() {
        anyhow!("{e} (retryable; try again)")
    } else {
        anyhow!(e)
    }
}

/// Read a JSON array of 128 numbers.
fn read_vector(path: &Path) -> Result<FeatureVector> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_vector(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parse_vector(text: &str) -> Result<FeatureVector> {
    let values: Vec<f32> = serde_json::from_str(text)?;
    Ok(FeatureVector::from_slice(&values)?)
}

/// One identity per line; blank lines and `#` comments are ignored.
fn read_roster(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_roster(&text))
}

/// First occurrence wins; file order is kept.
fn parse_roster(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(*line))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vector() {
        let values: Vec<String> = (0..128).map(|i| format!("{}", i as f32 / 128.0)).collect();
        let vector = parse_vector(&format!("[{}]", values.join(","))).unwrap();
        assert_eq!(vector.as_slice()[64], 0.5);

        assert!(parse_vector("[0.1, 0.2]").is_err());
        assert!(parse_vector("not json").is_err());
    }

    #[test]
    fn test_parse_roster() {
        let roster = parse_roster("# class 7A\nS001\n\n  S002 \nS002\nS003\n");
        assert_eq!(roster, vec!["S001", "S002", "S003"]);
    }

    #[test]
    fn test_parse_roster_drops_repeats_anywhere() {
        let roster = parse_roster("S003\nS001\nS002\nS001\n S003\n");
        assert_eq!(roster, vec!["S003", "S001", "S002"]);
    }

    #[test]
    fn test_read_roster_and_vector_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let roster_path = dir.path().join("7A.txt");
        std::fs::write(&roster_path, "# period 1\nS002\nS001\nS002\n").unwrap();
        assert_eq!(read_roster(&roster_path).unwrap(), vec!["S002", "S001"]);

        let vector_path = dir.path().join("probe.json");
        let values: Vec<f32> = vec![0.25; 128];
        std::fs::write(&vector_path, serde_json::to_string(&values).unwrap()).unwrap();
        assert_eq!(read_vector(&vector_path).unwrap().as_slice()[0], 0.25);

        std::fs::write(&vector_path, "[0.25, 0.5]").unwrap();
        let err = read_vector(&vector_path).unwrap_err();
        assert!(format!("{err:#}").contains("probe.json"));

        let missing = read_roster(&dir.path().join("missing.txt")).unwrap_err();
        assert!(missing.to_string().contains("missing.txt"));
    }

    #[test]
    fn test_cli_parses_report_filters() {
        let cli = Cli::try_parse_from([
            "rollcall", "report", "--day", "2026-09-14", "--identity", "S001", "--status", "late",
        ])
        .unwrap();
        match cli.command {
            Commands::Report { session, day, identity, status } => {
                let filter = report_filter(session, day, identity, status).unwrap();
                assert_eq!(filter.session_id, None);
                assert_eq!(filter.day, NaiveDate::from_ymd_opt(2026, 9, 14));
                assert_eq!(filter.identity_id.as_deref(), Some("S001"));
                assert_eq!(filter.status, Some(AttendanceStatus::Late));
            }
            _ => panic!("expected report"),
        }
        assert!(Cli::try_parse_from(["rollcall", "report", "--day", "14/09/2026"]).is_err());
    }

    #[test]
    fn test_report_without_scope_is_rejected() {
        assert!(report_filter(None, None, None, Some(AttendanceStatus::Absent)).is_err());
        assert!(report_filter(Some("BH01".into()), None, None, None).is_ok());
    }

    #[test]
    fn test_store_failure_marks_retryable() {
        let msg = store_failure(StoreError::Timeout(std::time::Duration::from_secs(10))).to_string();
        assert!(msg.contains("retryable"));
        let msg = store_failure(StoreError::Backend("no such table".into())).to_string();
        assert!(!msg.contains("retryable"));
    }

    #[test]
    fn test_cli_parses_attend() {
        let cli = Cli::try_parse_from(["rollcall", "--json", "attend", "-s", "BH01", "S001", "--status", "late"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Attend { session, identity, status } => {
                assert_eq!(session, "BH01");
                assert_eq!(identity, "S001");
                assert_eq!(status, AttendanceStatus::Late);
            }
            _ => panic!("expected attend"),
        }
    }
}
