//! # conceptlib-db
//!
//! PostgreSQL persistence for the clinical concept library.
//!
//! This crate provides:
//! - Connection pool management
//! - The append-only revision store and live entity repository
//! - Point-in-time snapshot reconstruction of entities and owned children
//! - The permission resolver and publication workflow
//! - Concept graph cycle checks, code collection and export aggregation
//! - Fork and revert
//!
//! ## Example
//!
//! ```rust,ignore
//! use conceptlib_db::{AccessContext, CoreConfig, Database, EntityRef, SnapshotReconstructor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/conceptlib", CoreConfig::from_env()?).await?;
//!     let snapshot = db.snapshots.reconstruct(EntityRef::phenotype(45), 9).await?;
//!     println!("{} at revision {}", snapshot.fields.name, snapshot.revision.revision_id);
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub(crate) mod children;
pub mod directory;
pub mod entities;
pub mod entity_filter;
pub mod fork;
pub mod graph;
pub mod permissions;
pub mod pool;
pub mod publication;
pub mod revisions;
pub mod snapshots;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

use std::sync::Arc;

use sqlx::PgPool;

// Re-export core types
pub use conceptlib_core::*;

pub use aggregator::PgCodeAggregator;
pub use directory::PgDirectory;
pub use entities::PgEntityRepository;
pub use entity_filter::{EntityFilterQueryBuilder, QueryParam};
pub use fork::PgForkRevert;
pub use graph::PgConceptGraph;
pub use permissions::PgPermissionResolver;
pub use pool::{create_pool, create_pool_with_config, database_url, PoolConfig, PoolStatus};
pub use publication::PgPublicationRepository;
pub use revisions::{render_diff, PgRevisionStore};
pub use snapshots::PgSnapshotReconstructor;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: PgPool,
    pub config: Arc<CoreConfig>,
    /// Live entity lifecycle.
    pub entities: PgEntityRepository,
    /// Revision listing, lookup and diff.
    pub revisions: PgRevisionStore,
    pub snapshots: PgSnapshotReconstructor,
    pub permissions: PgPermissionResolver,
    pub publications: PgPublicationRepository,
    /// Components, cycle checks and code collection.
    pub graph: PgConceptGraph,
    pub aggregator: PgCodeAggregator,
    pub fork: PgForkRevert,
    /// Users, groups and brand scopes.
    pub directory: PgDirectory,
}

impl Database {
    /// Create a Database using the built-in directory for groups and brands
    /// and a logging-only notifier.
    pub fn new(pool: PgPool, config: CoreConfig) -> Self {
        let directory = PgDirectory::new(pool.clone(), StaticBrandScopes::from_config(&config));
        let shared = Arc::new(directory.clone());
        Self::assemble(pool, config, directory, shared.clone(), shared, Arc::new(TracingNotifier))
    }

    /// Create a Database with caller-supplied collaborators.
    pub fn with_collaborators(
        pool: PgPool,
        config: CoreConfig,
        groups: Arc<dyn ActorDirectory>,
        brands: Arc<dyn BrandScopeProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let directory = PgDirectory::new(pool.clone(), StaticBrandScopes::from_config(&config));
        Self::assemble(pool, config, directory, groups, brands, notifier)
    }

    fn assemble(
        pool: PgPool,
        config: CoreConfig,
        directory: PgDirectory,
        groups: Arc<dyn ActorDirectory>,
        brands: Arc<dyn BrandScopeProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = Arc::new(config);
        let permissions = PgPermissionResolver::new(pool.clone(), config.clone(), groups, brands);
        Self {
            entities: PgEntityRepository::new(pool.clone(), config.clone(), permissions.clone()),
            revisions: PgRevisionStore::new(pool.clone()),
            snapshots: PgSnapshotReconstructor::new(pool.clone()),
            publications: PgPublicationRepository::new(
                pool.clone(),
                config.clone(),
                permissions.clone(),
                notifier,
            ),
            graph: PgConceptGraph::new(pool.clone(), config.clone(), permissions.clone()),
            aggregator: PgCodeAggregator::new(pool.clone(), config.clone()),
            fork: PgForkRevert::new(pool.clone(), config.clone(), permissions.clone()),
            permissions,
            directory,
            config,
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str, config: CoreConfig) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool, config))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, pool_config: PoolConfig, config: CoreConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, pool_config).await?;
        Ok(Self::new(pool, config))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_status(&self) -> PoolStatus {
        PoolStatus::of(&self.pool)
    }

    /// Snapshot of one revision, if the caller may view it.
    pub async fn snapshot_for(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
    ) -> Result<Snapshot> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        self.permissions.require_view(&mut conn, ctx, entity, Some(revision_id)).await?;
        snapshots::reconstruct_on(&mut conn, entity, revision_id).await
    }

    /// Export rows of one revision, if the caller may view it.
    pub async fn export_for(
        &self,
        ctx: &AccessContext,
        entity: EntityRef,
        revision_id: RevisionId,
    ) -> Result<Vec<ExportRow>> {
        self.permissions.ensure_view(ctx, entity, Some(revision_id)).await?;
        self.aggregator.aggregate(entity, revision_id).await
    }

    /// Revision listing, if the caller may view the latest revision.
    pub async fn revisions_for(&self, ctx: &AccessContext, entity: EntityRef) -> Result<Vec<RevisionSummary>> {
        self.permissions.ensure_view(ctx, entity, None).await?;
        self.revisions.list_revisions(entity).await
    }
}
