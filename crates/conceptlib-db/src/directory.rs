//! Users, groups and brands.
//!
//! Implements the collaborator traits the permission resolver consumes.
//! Brand scopes configured statically take precedence over the `brand`
//! table.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use conceptlib_core::{
    Actor, ActorDirectory, AuthenticatedUser, BrandScopeProvider, Error, GroupId, Result, StaticBrandScopes, TagId,
    UserId,
};

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: Option<String>,
    is_superuser: bool,
    is_moderator: bool,
}

impl From<UserRow> for AuthenticatedUser {
    fn from(row: UserRow) -> Self {
        AuthenticatedUser {
            id: row.id,
            username: row.username,
            email: row.email,
            is_superuser: row.is_superuser,
            is_moderator: row.is_moderator,
        }
    }
}

/// PostgreSQL-backed actor directory and brand scope provider.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
    static_scopes: StaticBrandScopes,
}

impl PgDirectory {
    pub fn new(pool: PgPool, static_scopes: StaticBrandScopes) -> Self {
        Self { pool, static_scopes }
    }

    pub async fn fetch_user(&self, id: UserId) -> Result<AuthenticatedUser> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, username, email, is_superuser, is_moderator FROM app_user WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        row.map(AuthenticatedUser::from)
            .ok_or_else(|| Error::NotFound(format!("User {}", id)))
    }

    pub async fn fetch_user_by_name(&self, username: &str) -> Result<AuthenticatedUser> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, email, is_superuser, is_moderator FROM app_user WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        row.map(AuthenticatedUser::from)
            .ok_or_else(|| Error::NotFound(format!("User {}", username)))
    }
}

#[async_trait]
impl ActorDirectory for PgDirectory {
    async fn current_actor_groups(&self, actor: &Actor) -> Result<BTreeSet<GroupId>> {
        let Some(user_id) = actor.user_id() else {
            return Ok(BTreeSet::new());
        };
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT group_id FROM user_group_member WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl BrandScopeProvider for PgDirectory {
    async fn brand_collection_scope(&self, brand: &str) -> Result<Option<BTreeSet<TagId>>> {
        if let Some(scope) = self.static_scopes.get(brand) {
            return Ok(Some(scope.clone()));
        }
        let row: Option<(Option<Vec<i64>>,)> = sqlx::query_as("SELECT collection_ids FROM brand WHERE name = $1")
            .bind(brand)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        let scope = row.and_then(|(ids,)| ids).map(|ids| ids.into_iter().collect::<BTreeSet<_>>());

        debug!(
            subsystem = "db",
            component = "directory",
            op = "brand_scope",
            brand,
            collection_count = scope.as_ref().map_or(0, BTreeSet::len),
            "Brand scope resolved"
        );
        Ok(scope)
    }
}
