use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gpa_history::{
    gpa, grade_scale, EntryRecord, HistoryConfig, PersistenceService, SummaryRecord,
};

const USAGE: &str = "usage: gpa-history <command>

commands:
  calc <courses.csv>    compute the GPA of a course list without saving it
  add <courses.csv>     compute and save the GPA together with its courses
  list [--json]         show saved results, newest first
  show <id>             show one saved result and its courses
  delete <id>           delete a saved result and its courses

environment:
  GPA_HISTORY_DB        database file (default: gpa_history.db)
  RUST_LOG              log filter (default: info)";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str);

    match command {
        Some("calc") => run_calc(csv_arg(&args)?),
        Some("add") => run_add(csv_arg(&args)?).await,
        Some("list") => run_list(args.iter().any(|a| a == "--json")).await,
        Some("show") => run_show(id_arg(&args)?).await,
        Some("delete") => run_delete(id_arg(&args)?).await,
        Some("help") | Some("--help") | Some("-h") => {
            println!("{}", USAGE);
            Ok(())
        }
        Some(other) => bail!("unknown command `{}`\n\n{}", other, USAGE),
        None => bail!("missing command\n\n{}", USAGE),
    }
}

fn csv_arg(args: &[String]) -> Result<&Path> {
    match args.get(1) {
        Some(path) => Ok(Path::new(path)),
        None => bail!("missing <courses.csv> argument\n\n{}", USAGE),
    }
}

fn id_arg(args: &[String]) -> Result<i64> {
    let raw = args
        .get(1)
        .with_context(|| format!("missing <id> argument\n\n{}", USAGE))?;
    raw.parse::<i64>()
        .with_context(|| format!("`{}` is not a valid summary id", raw))
}

fn config_from_env() -> HistoryConfig {
    match env::var("GPA_HISTORY_DB") {
        Ok(path) if !path.trim().is_empty() => HistoryConfig::new(path),
        _ => HistoryConfig::default(),
    }
}

fn open_service() -> Result<PersistenceService> {
    let config = config_from_env();
    PersistenceService::open(&config).with_context(|| {
        format!(
            "Failed to open GPA history at {}",
            config.database_path().display()
        )
    })
}

/// Stop the worker once every request has been dispatched.
fn close(mut service: PersistenceService) {
    service.shutdown();
    service.join_worker();
}

// ============================================================================
// COMMANDS
// ============================================================================

fn run_calc(csv_path: &Path) -> Result<()> {
    let entries = load_courses(csv_path)?;
    print_courses(&entries);

    let summary = gpa::summarize(&entries);
    println!();
    println!(
        "GPA {:.2} over {:.1} credits",
        summary.gpa, summary.total_credits
    );
    Ok(())
}

async fn run_add(csv_path: &Path) -> Result<()> {
    let entries = load_courses(csv_path)?;
    if entries.is_empty() {
        bail!("{} contains no courses", csv_path.display());
    }

    let summary = gpa::summarize(&entries);
    let mut service = open_service()?;

    let ticket = service.save_with_children(summary.gpa, summary.total_credits, entries);
    let saved = service
        .complete(ticket)
        .await
        .context("Failed to save GPA result")?;

    let id = saved.record.id.unwrap_or_default();
    println!("✓ Saved #{}: {}", id, saved.record);
    match &saved.children_error {
        None => println!("✓ {} courses stored", saved.record.children.len()),
        Some(err) => println!("⚠ Result saved without its courses: {}", err),
    }

    close(service);
    Ok(())
}

async fn run_list(as_json: bool) -> Result<()> {
    let mut service = open_service()?;
    let records = service
        .complete(service.load_all())
        .await
        .context("Failed to load GPA history")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No saved results yet.");
    } else {
        for record in &records {
            print_summary_line(record);
        }
    }

    close(service);
    Ok(())
}

async fn run_show(id: i64) -> Result<()> {
    let mut service = open_service()?;

    service
        .complete(service.load_all())
        .await
        .context("Failed to load GPA history")?;
    if !service.history().contains(id) {
        bail!("no saved result with id {}", id);
    }

    service
        .complete(service.load_children_for(id))
        .await
        .with_context(|| format!("Failed to load courses of #{}", id))?;

    if let Some(record) = service.history().find(id) {
        print_summary_line(record);
        println!();
        if record.children.is_empty() {
            println!("(no courses stored)");
        } else {
            print_courses(&record.children);
        }
    }

    close(service);
    Ok(())
}

async fn run_delete(id: i64) -> Result<()> {
    let mut service = open_service()?;

    let outcome = service.complete(service.delete(id)).await;
    close(service);

    match outcome {
        Ok(_) => {
            println!("✓ Deleted #{}", id);
            Ok(())
        }
        Err(err) if err.is_not_found() => bail!("no saved result with id {}", id),
        Err(err) => Err(err).context("Failed to delete GPA result"),
    }
}

// ============================================================================
// CSV + OUTPUT
// ============================================================================

fn load_courses(csv_path: &Path) -> Result<Vec<EntryRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for (row, result) in rdr.deserialize::<EntryRecord>().enumerate() {
        let entry: EntryRecord =
            result.with_context(|| format!("Failed to read course on row {}", row + 2))?;

        if !entry.has_well_formed_code() {
            warn!(code = %entry.code, "course code should end in four digits");
        }
        if !grade_scale::is_known_grade(&entry.grade) {
            warn!(grade = %entry.grade, course = %entry.code, "unknown grade counts as 0.0");
        }

        entries.push(entry);
    }

    Ok(entries)
}

fn print_summary_line(record: &SummaryRecord) {
    match record.id {
        Some(id) => println!("#{:<5} {}", id, record),
        None => println!("{:<6} {}", "-", record),
    }
}

fn print_courses(entries: &[EntryRecord]) {
    println!(
        "{:<10} {:<32} {:>6} {:>5} {:>6}",
        "CODE", "COURSE", "CREDIT", "GRADE", "POINTS"
    );
    for entry in entries {
        println!(
            "{:<10} {:<32} {:>6.1} {:>5} {:>6.2}",
            entry.code,
            entry.name,
            entry.credit_value,
            entry.grade,
            grade_scale::grade_points(&entry.grade)
        );
    }
}
