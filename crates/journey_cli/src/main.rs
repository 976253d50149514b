//! journey-admin: operator CLI for the journey engine
//!
//! Reads the same environment as the engine (`DATABASE_URL`, `JOURNEY_*`,
//! `S3_*`), honoring a local `.env` file.
//!
//! Usage:
//!   journey-admin migrate
//!   journey-admin --tenant <uuid> ingest playbook.json
//!   journey-admin --tenant <uuid> assign-advisor --student <uuid> --advisor <uuid>
//!   journey-admin --tenant <uuid> snapshot --user <uuid> --locale en

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use journey_core::{
    Cancellation, EngineConfig, IngestStatus, JourneyService, PgStore, Principal, Role,
};

#[derive(Parser, Debug)]
#[command(name = "journey-admin")]
#[command(about = "Operate journey engine tenants from the command line")]
struct Cli {
    /// Tenant to operate on (not needed for `migrate`)
    #[arg(long, env = "JOURNEY_TENANT_ID", global = true)]
    tenant: Option<Uuid>,

    /// User id recorded as the actor of admin changes
    #[arg(long, env = "JOURNEY_OPERATOR_ID", global = true)]
    operator: Option<Uuid>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations
    Migrate,

    /// Ingest a playbook JSON file as the tenant's current version
    Ingest {
        /// Path to the playbook document
        path: PathBuf,
    },

    /// Print the tenant's current playbook version
    ShowPlaybook,

    /// Assign an advisor to a student
    AssignAdvisor {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        advisor: Uuid,
    },

    /// Clear a user's journey projection (instances and events are kept)
    Reset {
        #[arg(long)]
        user: Uuid,
    },

    /// Print a user's journey
    Snapshot {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        locale: Option<String>,
    },

    /// Print the tenant scoreboard
    Scoreboard,

    /// Unlock successors of a node that is already done
    Reactivate {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        node: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,journey_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let store = PgStore::connect(&config.database)
        .await
        .context("failed to connect to database")?;

    let (tenant, operator_id) = (cli.tenant, cli.operator.unwrap_or_else(Uuid::nil));
    let operator = || -> Result<Principal> {
        let tenant = tenant.context("--tenant (or JOURNEY_TENANT_ID) is required")?;
        Ok(Principal::new(tenant, operator_id, Role::Superadmin))
    };
    let service = JourneyService::new(Arc::new(store.clone()), &config);
    let cancel = Cancellation::none();

    match cli.command {
        Command::Migrate => {
            store.run_migrations().await.context("migration failed")?;
            tracing::info!("migrations applied");
        }
        Command::Ingest { path } => {
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let ingested = service.ingest_playbook(&operator()?, &raw, &cancel).await?;
            match ingested.status {
                IngestStatus::Created => {}
                IngestStatus::AlreadyCurrent => {
                    eprintln!("playbook {} is already current", ingested.version.version)
                }
                IngestStatus::Superseded => eprintln!(
                    "playbook {} matches an older stored version; the current version was not changed",
                    ingested.version.version
                ),
            }
            print_json(&ingested)?;
        }
        Command::ShowPlaybook => {
            let pb = service.current_playbook(&operator()?, &cancel).await?;
            println!(
                "{} (id {}, checksum {}, {} nodes, locale {})",
                pb.version,
                pb.version_id,
                pb.checksum,
                pb.node_count(),
                pb.locale_default
            );
        }
        Command::AssignAdvisor { student, advisor } => {
            service
                .assign_advisor(&operator()?, student, advisor, &cancel)
                .await?;
            println!("advisor {advisor} assigned to {student}");
        }
        Command::Reset { user } => {
            let removed = service.reset_journey(&operator()?, user, &cancel).await?;
            println!("removed {removed} journey rows for {user}");
        }
        Command::Snapshot { user, locale } => {
            let snapshot = service
                .get_journey(&operator()?, user, locale.as_deref(), &cancel)
                .await?;
            print_json(&snapshot)?;
        }
        Command::Scoreboard => {
            let board = service.get_scoreboard(&operator()?, &cancel).await?;
            print_json(&board)?;
        }
        Command::Reactivate { user, node } => {
            let opened = service.reactivate(&operator()?, user, &node, &cancel).await?;
            if opened.is_empty() {
                println!("nothing to unlock after {node}");
            }
            for inst in opened {
                println!("{} -> {}", inst.node_id, inst.state);
            }
        }
    }

    store.close().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
