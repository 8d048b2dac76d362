use anyhow::{Context, Result};
use auth_rebac::{
    AuthorizationEngine, AuthzConfig, ChangeSet, EntityRef, EntityType, RelationName, Schema, SubjectRef, Tuple,
    TupleFilter,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

/// Inspect and exercise the document-sharing authorization engine
#[derive(Parser, Debug)]
#[command(name = "rebac")]
#[command(about = "Check permissions, list objects and manage relationship tuples")]
struct Args {
    /// Postgres connection string; the in-memory store is used when unset
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Organization whose tuples are addressed
    #[arg(long, env = "REBAC_ORGANIZATION_ID", global = true)]
    organization_id: Option<Uuid>,

    /// Schema file (YAML or JSON) replacing the built-in schema
    #[arg(long, env = "REBAC_SCHEMA_PATH", global = true)]
    schema: Option<PathBuf>,

    /// Wire-format tuple files written before the command runs
    #[arg(short, long = "tuples", global = true)]
    tuple_files: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether a subject has a relation on an object
    Check {
        /// e.g. user:alice or group:eng#member
        subject: SubjectRef,
        relation: RelationName,
        /// e.g. doc:99
        object: EntityRef,
    },
    /// List every object of a type on which the subject has the relation
    ListObjects {
        subject: SubjectRef,
        relation: RelationName,
        object_type: EntityType,
    },
    /// Print stored tuples matching a filter
    Read {
        #[arg(long)]
        subject: Option<SubjectRef>,
        #[arg(long)]
        relation: Option<RelationName>,
        #[arg(long)]
        object: Option<EntityRef>,
    },
    /// Validate and write a wire-format tuple file in one batch
    Write { file: PathBuf },
    /// Delete every tuple referencing an object
    DeleteObject { object: EntityRef },
    /// Validate a schema file
    ValidateSchema { file: PathBuf },
    /// Print the active schema
    ExportSchema {
        #[arg(long, value_enum, default_value_t = SchemaFormat::Yaml)]
        format: SchemaFormat,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchemaFormat {
    Yaml,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_tracing(args.verbose, args.json_logs);

    if let Command::ValidateSchema { ref file } = args.command {
        return validate_schema(file);
    }

    let mut config = AuthzConfig::from_env()?;
    config.database_url = args.database_url.clone();
    config.schema_path = args.schema.clone();
    if let Some(organization_id) = args.organization_id {
        config.organization_id = organization_id;
    }

    let engine = AuthorizationEngine::connect(&config).await?;

    for file in &args.tuple_files {
        let tuples = load_tuples(file)?;
        info!("Loading {} tuples from {}", tuples.len(), file.display());
        engine.apply(batch(tuples)).await?;
    }

    match args.command {
        Command::Check {
            subject,
            relation,
            object,
        } => {
            let allowed = engine.check(&subject, relation, &object).await?;
            let verdict = if allowed {
                "ALLOWED".bright_green()
            } else {
                "DENIED".bright_red()
            };
            println!("{} {} {} {}", verdict, subject, relation, object);
        }
        Command::ListObjects {
            subject,
            relation,
            object_type,
        } => {
            for object in engine.list_objects(&subject, relation, object_type).await? {
                println!("{}", object);
            }
        }
        Command::Read {
            subject,
            relation,
            object,
        } => {
            let filter = TupleFilter {
                subject,
                relation,
                object,
                ..TupleFilter::default()
            };
            for tuple in engine.read_tuples(&filter).await? {
                println!("{}", serde_json::to_string(&tuple)?);
            }
        }
        Command::Write { file } => {
            let tuples = load_tuples(&file)?;
            let count = tuples.len();
            engine.apply(batch(tuples)).await?;
            println!("{} {} tuples", "Wrote".bright_green(), count);
        }
        Command::DeleteObject { object } => {
            let deleted = engine.cascade_delete_object(&object).await?;
            for tuple in &deleted {
                println!("{}", serde_json::to_string(tuple)?);
            }
            println!("{} {} tuples referencing {}", "Deleted".bright_yellow(), deleted.len(), object);
        }
        Command::ExportSchema { format } => {
            let schema = engine.schema();
            let output = match format {
                SchemaFormat::Yaml => serde_yaml::to_string(schema.definition())?,
                SchemaFormat::Json => serde_json::to_string_pretty(schema.definition())?,
            };
            println!("{}", output);
        }
        Command::ValidateSchema { .. } => {}
    }

    Ok(())
}

fn validate_schema(file: &Path) -> Result<()> {
    let schema = Schema::load(file)?;
    let relations: usize = schema.definition().types.iter().map(|t| t.relations.len()).sum();
    println!(
        "{} {}: {} types, {} relations",
        "Valid".bright_green(),
        file.display(),
        schema.definition().types.len(),
        relations
    );
    Ok(())
}

fn load_tuples(file: &Path) -> Result<Vec<Tuple>> {
    let source = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&source).with_context(|| format!("Invalid tuple file {}", file.display()))
}

fn batch(tuples: Vec<Tuple>) -> ChangeSet {
    tuples.into_iter().fold(ChangeSet::new(), ChangeSet::write)
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("auth_rebac={},rebac={},sqlx=warn", level, level).into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
