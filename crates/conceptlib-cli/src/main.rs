//! conceptlib: administrative command-line tool for the concept library.
//!
//! Every command runs as the user named by `--user` (or `CONCEPTLIB_USER`),
//! or anonymously when none is given, so the same permission rules apply
//! as for any other caller. Results are printed to stdout as JSON; logs go
//! to stderr.

use std::str::FromStr;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conceptlib_db::{
    parse_entity_code, AccessContext, Actor, ConceptGraphRepository, CoreConfig, Database, EntityRef,
    EntityRepository, EntityType, ForkRevertOperator, PermissionResolver, PoolConfig, PublicationRepository,
    RevisionId, RevisionStore,
};

#[derive(Parser)]
#[command(name = "conceptlib")]
#[command(author, version, about = "Administer the clinical concept library")]
#[command(propagate_version = true)]
struct Cli {
    /// Username to act as (anonymous when omitted)
    #[arg(short, long, global = true, env = "CONCEPTLIB_USER")]
    user: Option<String>,

    /// Brand the request runs under
    #[arg(short, long, global = true, env = "CONCEPTLIB_BRAND")]
    brand: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// An entity given by type and display code.
#[derive(Args)]
struct EntityArg {
    /// Entity type (concept, phenotype, working_set, phenotype_workingset, data_source)
    #[arg(short = 't', long = "type", default_value = "concept")]
    entity_type: String,

    /// Display code or numeric id (C123, PH45, WS7, 12)
    code: String,
}

impl EntityArg {
    fn resolve(&self) -> anyhow::Result<EntityRef> {
        let entity_type = EntityType::from_str(&self.entity_type)?;
        Ok(parse_entity_code(entity_type, &self.code)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Show connection pool usage
    Status,

    /// List the revisions of an entity, newest first
    Revisions {
        #[command(flatten)]
        entity: EntityArg,
    },

    /// Show an entity as it was at a revision
    Show {
        #[command(flatten)]
        entity: EntityArg,

        /// Revision id (default: latest)
        #[arg(short, long)]
        revision: Option<RevisionId>,
    },

    /// Diff two revisions of an entity
    Diff {
        #[command(flatten)]
        entity: EntityArg,

        from: RevisionId,

        to: RevisionId,
    },

    /// Correct the change reason recorded on a revision
    Reason {
        #[command(flatten)]
        entity: EntityArg,

        revision: RevisionId,

        reason: String,
    },

    /// Export the codes of a revision
    Export {
        #[command(flatten)]
        entity: EntityArg,

        /// Revision id (default: latest)
        #[arg(short, long)]
        revision: Option<RevisionId>,
    },

    /// Copy a revision into a new entity owned by the acting user
    Fork {
        #[command(flatten)]
        entity: EntityArg,

        revision: RevisionId,
    },

    /// Restore an entity to an earlier revision
    Revert {
        #[command(flatten)]
        entity: EntityArg,

        revision: RevisionId,

        /// Refuse if the latest revision is no longer this one
        #[arg(long)]
        expect: Option<RevisionId>,
    },

    /// Request publication of a revision
    Publish {
        #[command(flatten)]
        entity: EntityArg,

        /// Revision id (default: latest)
        #[arg(short, long)]
        revision: Option<RevisionId>,
    },

    /// Approve a publication request
    Approve {
        #[command(flatten)]
        entity: EntityArg,

        revision: RevisionId,

        /// Message passed on to the owner
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Reject a publication request
    Reject {
        #[command(flatten)]
        entity: EntityArg,

        revision: RevisionId,

        /// Message passed on to the owner
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List publication requests awaiting review (moderators)
    Pending {
        /// Only this entity type
        #[arg(short = 't', long = "type")]
        entity_type: Option<String>,
    },

    /// Check whether a concept reference would close a cycle
    CheckCycle {
        /// Concept that would hold the reference
        parent: String,

        /// Concept that would be referenced
        child: String,
    },

    /// Code count of a published concept revision
    CodeCount {
        concept: String,

        revision: RevisionId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "conceptlib_cli=info,conceptlib_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI").ok().map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conceptlib_cli=info,conceptlib_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("conceptlib.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
        None
    } else {
        let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        if let Some(ansi) = log_ansi {
            layer = layer.with_ansi(ansi);
        }
        registry.with(layer).init();
        None
    };

    let cli = Cli::parse();

    let config = CoreConfig::from_env().context("Invalid core configuration")?;
    let database_url = conceptlib_db::database_url();
    let pool_config = PoolConfig::from_env().context("Invalid pool configuration")?;
    let db = Database::connect_with_config(&database_url, pool_config, config)
        .await
        .context("Failed to connect to database")?;

    let ctx = access_context(&db, cli.user.as_deref(), cli.brand.as_deref()).await?;
    info!(
        subsystem = "cli",
        actor_id = ?ctx.actor.user_id(),
        brand = ctx.brand.as_deref().unwrap_or("(none)"),
        "Acting context resolved"
    );

    run(&db, &ctx, cli.command).await
}

async fn access_context(db: &Database, user: Option<&str>, brand: Option<&str>) -> anyhow::Result<AccessContext> {
    let mut ctx = match user {
        Some(username) => {
            let user = db
                .directory
                .fetch_user_by_name(username)
                .await
                .with_context(|| format!("Unknown user {}", username))?;
            AccessContext::new(Actor::User(user))
        }
        None => AccessContext::anonymous(),
    };
    if let Some(brand) = brand {
        ctx = ctx.with_brand(brand);
    }
    Ok(ctx)
}

async fn revision_or_latest(db: &Database, entity: EntityRef, revision: Option<RevisionId>) -> anyhow::Result<RevisionId> {
    match revision {
        Some(id) => Ok(id),
        None => Ok(db.revisions.latest_revision_id(entity).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(db: &Database, ctx: &AccessContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Migrate => {
            db.migrate().await.context("Migration failed")?;
            info!(subsystem = "cli", op = "migrate", "Migrations applied");
        }
        Commands::Status => {
            let status = db.pool_status();
            status.log();
            print_json(&status)?;
        }
        Commands::Revisions { entity } => {
            let entity = entity.resolve()?;
            print_json(&db.revisions_for(ctx, entity).await?)?;
        }
        Commands::Show { entity, revision } => {
            let entity = entity.resolve()?;
            let revision = revision_or_latest(db, entity, revision).await?;
            print_json(&db.snapshot_for(ctx, entity, revision).await?)?;
        }
        Commands::Diff { entity, from, to } => {
            let entity = entity.resolve()?;
            db.permissions.ensure_view(ctx, entity, Some(from)).await?;
            db.permissions.ensure_view(ctx, entity, Some(to)).await?;
            print!("{}", db.revisions.diff_revisions(entity, from, to).await?);
        }
        Commands::Reason {
            entity,
            revision,
            reason,
        } => {
            let entity = entity.resolve()?;
            db.permissions.ensure_edit(ctx, entity).await?;
            db.revisions.update_change_reason(entity, revision, &reason).await?;
        }
        Commands::Export { entity, revision } => {
            let entity = entity.resolve()?;
            let revision = revision_or_latest(db, entity, revision).await?;
            print_json(&db.export_for(ctx, entity, revision).await?)?;
        }
        Commands::Fork { entity, revision } => {
            let entity = entity.resolve()?;
            let forked = db.fork.fork(ctx, entity, revision).await?;
            print_json(&db.entities.fetch(forked).await?)?;
        }
        Commands::Revert {
            entity,
            revision,
            expect,
        } => {
            let entity = entity.resolve()?;
            let new_revision = db.fork.revert(ctx, entity, revision, expect).await?;
            print_json(&serde_json::json!({ "entity": entity, "revision_id": new_revision }))?;
        }
        Commands::Publish { entity, revision } => {
            let entity = entity.resolve()?;
            let revision = revision_or_latest(db, entity, revision).await?;
            print_json(&db.publications.request_publication(ctx, entity, revision).await?)?;
        }
        Commands::Approve {
            entity,
            revision,
            message,
        } => {
            let entity = entity.resolve()?;
            print_json(&db.publications.approve(ctx, entity, revision, message.as_deref()).await?)?;
        }
        Commands::Reject {
            entity,
            revision,
            message,
        } => {
            let entity = entity.resolve()?;
            print_json(&db.publications.reject(ctx, entity, revision, message.as_deref()).await?)?;
        }
        Commands::Pending { entity_type } => {
            let entity_type = entity_type.as_deref().map(EntityType::from_str).transpose()?;
            print_json(&db.publications.pending_reviews(ctx, entity_type).await?)?;
        }
        Commands::CheckCycle { parent, child } => {
            let parent = parse_entity_code(EntityType::Concept, &parent)?;
            let child = parse_entity_code(EntityType::Concept, &child)?;
            let cycle = db.graph.detect_cycle(parent.id, child.id).await?;
            print_json(&serde_json::json!({ "parent": parent.id, "child": child.id, "cycle": cycle }))?;
        }
        Commands::CodeCount { concept, revision } => {
            let concept = parse_entity_code(EntityType::Concept, &concept)?;
            db.permissions.ensure_view(ctx, concept, Some(revision)).await?;
            let count = db.publications.published_code_count(concept.id, revision).await?;
            print_json(&serde_json::json!({ "concept_id": concept.id, "revision_id": revision, "code_count": count }))?;
        }
    }
    Ok(())
}
