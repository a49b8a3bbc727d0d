use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use unmerge_review::config::{load_config, Config, DEFAULT_CONFIG_FILE};
use unmerge_review::{generate_worksheet, next_job_id, setup_database, EntityKind, WorksheetConsumer};

const DEFAULT_OUTPUT_FILENAME: &str = "unmerge_output.csv";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "unmerge-review: identity split review worksheets",
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the database path from the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the schema in the configured database
    InitDb,

    /// Generate the review worksheet for one entity kind
    Build {
        #[arg(long)]
        entity_kind: String,

        /// Defaults to <workbook_dir>/unmerge_workbook_<kind>.csv
        #[arg(long)]
        output_path: Option<PathBuf>,
    },

    /// Consume a reviewed worksheet into classification records
    Consume {
        #[arg(long)]
        entity_kind: String,

        /// File name under the workbook directory
        #[arg(long)]
        workbook: Option<String>,

        #[arg(long)]
        output_dir: Option<PathBuf>,

        #[arg(long, default_value = DEFAULT_OUTPUT_FILENAME)]
        output_filename: String,
    },
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(database) = cli.database {
        config.database = database;
    }

    match cli.command {
        Commands::InitDb => run_init_db(&config),
        Commands::Build {
            entity_kind,
            output_path,
        } => run_build(&config, &entity_kind, output_path),
        Commands::Consume {
            entity_kind,
            workbook,
            output_dir,
            output_filename,
        } => run_consume(&config, &entity_kind, workbook, output_dir, &output_filename),
    }
}

fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    setup_database(&conn).context("Failed to set up database schema")?;
    Ok(conn)
}

fn run_init_db(config: &Config) -> Result<()> {
    println!("🔧 Setting up database...");
    open_database(&config.database)?;
    println!("✓ Database initialized with WAL mode: {}", config.database.display());
    Ok(())
}

fn run_build(config: &Config, entity_kind: &str, output_path: Option<PathBuf>) -> Result<()> {
    let kind: EntityKind = entity_kind.parse()?;
    let output_path = output_path.unwrap_or_else(|| config.workbook_path(kind.as_str()));

    println!("📋 Building {} review worksheet", kind);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let conn = open_database(&config.database)?;
    let report = generate_worksheet(&conn, kind, config.codec(), &output_path)
        .with_context(|| format!("Worksheet generation failed for {}", kind))?;

    println!("✓ Identities: {}", report.identities);
    println!("✓ Tokens:     {}", report.tokens);
    println!("✓ Rows:       {}", report.rows);
    println!("✓ Columns:    {}", report.columns);
    println!("💾 Saved to {}", report.output_path.display());
    Ok(())
}

fn run_consume(
    config: &Config,
    entity_kind: &str,
    workbook: Option<String>,
    output_dir: Option<PathBuf>,
    output_filename: &str,
) -> Result<()> {
    let kind: EntityKind = entity_kind.parse()?;
    let worksheet_path = match workbook {
        Some(name) => config.workbook_dir.join(name),
        None => config.workbook_path(kind.as_str()),
    };
    let output_dir = output_dir.unwrap_or_else(|| config.output_dir.clone());

    // Missing worksheet fails here, before the database is opened
    if !worksheet_path.exists() {
        return Err(unmerge_review::UnmergeError::WorksheetNotFound(worksheet_path).into());
    }

    println!("📥 Consuming {} review worksheet", kind);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut conn = open_database(&config.database)?;
    let job_id = next_job_id(&conn).context("Failed to issue job id")?;
    info!(job_id, "issued job id");

    let consumer = WorksheetConsumer::new(&worksheet_path, job_id, kind, &output_dir, output_filename)?;
    let summary = consumer
        .consume(&mut conn)
        .with_context(|| format!("Worksheet consumption failed for {}", worksheet_path.display()))?;

    println!("✓ Job id:              {}", summary.job_id);
    println!("✓ Total records:       {}", summary.total_records);
    println!("✓ With GroupID:        {}", summary.records_with_group);
    println!("✓ Without GroupID:     {}", summary.records_without_group);
    println!("✓ Whitelisted:         {}", summary.whitelisted_identities);
    println!("✓ Do-not-merge pairs:  {}", summary.blacklist_pairs);
    println!("✓ Invalid SSNs:        {} recorded, {} skipped", summary.invalid_ssn_recorded, summary.invalid_ssn_skipped);
    println!("✓ Groups:              {}", summary.groups);
    println!("💾 Summary saved to {}", consumer.summary_path().display());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("UNMERGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("unmerge_review=info,warn"));

    let format = env::var("UNMERGE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}
