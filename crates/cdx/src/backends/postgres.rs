// ai
//! 🐘 THE POSTGRES BACKEND
//!
//! 🎬 COLD OPEN: INT. CATALOG DATABASE, 2:13 AM
//!
//! An editor fixes a typo in a genre name. One row. One `UPDATE`. Meanwhile,
//! forty-seven film works that wear that genre are now lying to the search
//! index about who they are. This module finds them. Politely. With LIMIT and
//! OFFSET, so nobody's connection pool gets a hernia.
//!
//! 📐 Every value goes through a bound parameter. The only thing spliced into
//! SQL text is the schema name (validated as a plain identifier at config load)
//! and table names that come from a closed enum. Little Bobby Tables can
//! apply elsewhere. 🦆

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::trace;
use uuid::Uuid;

use crate::backends::{IdQuery, RelationalSource, RowQuery};
use crate::common::{EntityKind, JoinedFilmWorkRow};

/// 🐘 Connection details for the catalog database.
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default = "default_user")]
    pub user: String,
    /// 🔒 If this is in plaintext in a committed file, I've already filed a complaint.
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 📋 The namespace holding genre, person, film_work and the junction tables.
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_dbname() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "content".to_string()
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            dbname: default_dbname(),
            user: default_user(),
            password: String::new(),
            host: default_host(),
            port: default_port(),
            schema: default_schema(),
        }
    }
}

/// 🔒 Only `[A-Za-z_][A-Za-z0-9_]*` gets spliced into SQL. Everything else gets a lecture.
pub(crate) fn validate_identifier(candidate: &str) -> Result<()> {
    let mut chars = candidate.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!(
            "💀 '{candidate}' is not a plain SQL identifier. It goes straight into query text, so it has to be letters, digits and underscores. No quotes, no dots, no semicolons, no drama."
        );
    }
    Ok(())
}

/// 🐘 The relational source that actually talks to Postgres.
#[derive(Debug)]
pub struct PostgresSource {
    pool: PgPool,
    schema: String,
}

impl PostgresSource {
    /// 🚀 Build a lazily-connected pool. Nothing touches the network until the first
    /// query, so a database that is still booting is a retry problem, not a startup crash.
    pub fn new(config: &PostgresConfig) -> Result<Self> {
        validate_identifier(&config.schema)?;
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.dbname);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy_with(options);
        Ok(Self { pool, schema: config.schema.clone() })
    }
}

/// 🔍 Ids of `kind` changed after `$1`, oldest first, paged by `$2`/`$3`.
pub(crate) fn changed_ids_sql(schema: &str, kind: EntityKind) -> String {
    format!(
        "SELECT id FROM {schema}.{table} \
         WHERE modified > $1 \
         ORDER BY modified, id \
         LIMIT $2 OFFSET $3",
        table = kind.table(),
    )
}

/// 🔗 Film works reachable from `ANY($1)` ids of `kind`, through its junction table.
pub(crate) fn referencing_film_works_sql(schema: &str, kind: EntityKind) -> Result<String> {
    let (junction, column) = kind
        .junction()
        .with_context(|| format!("💀 '{kind}' has no junction table. Film works do not need to be expanded into film works. They already are film works."))?;
    Ok(format!(
        "SELECT DISTINCT fw.id, fw.modified \
         FROM {schema}.film_work fw \
         JOIN {schema}.{junction} link ON link.film_work_id = fw.id \
         WHERE link.{column} = ANY($1) \
         ORDER BY fw.modified, fw.id \
         LIMIT $2 OFFSET $3"
    ))
}

/// 🎬 The big join: one row per film work × person-role × genre.
pub(crate) fn film_work_rows_sql(schema: &str, query: &RowQuery) -> String {
    let filter = match query {
        RowQuery::ByIds(_) => "fw.id = ANY($1)",
        RowQuery::ModifiedSince(_) => "fw.modified > $1",
    };
    format!(
        "SELECT fw.id AS film_work_id, fw.title, fw.description, fw.rating, fw.type, \
                pfw.role, p.id AS person_id, p.full_name, g.name AS genre \
         FROM {schema}.film_work fw \
         LEFT JOIN {schema}.person_film_work pfw ON pfw.film_work_id = fw.id \
         LEFT JOIN {schema}.person p ON p.id = pfw.person_id \
         LEFT JOIN {schema}.genre_film_work gfw ON gfw.film_work_id = fw.id \
         LEFT JOIN {schema}.genre g ON g.id = gfw.genre_id \
         WHERE {filter} \
         ORDER BY fw.modified, fw.id, pfw.id, gfw.id \
         LIMIT $2 OFFSET $3"
    )
}

#[async_trait]
impl RelationalSource for PostgresSource {
    async fn fetch_ids(&self, query: &IdQuery, limit: i64, offset: i64) -> Result<Vec<Uuid>> {
        match query {
            IdQuery::ChangedSince { kind, since } => {
                let sql = changed_ids_sql(&self.schema, *kind);
                trace!(%sql, offset, "🐘 paging changed ids");
                let ids: Vec<Uuid> = sqlx::query_scalar(&sql)
                    .bind(*since)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
                    .with_context(|| format!("💀 Asked '{kind}' what changed since {since}. Postgres did not want to talk about it."))?;
                Ok(ids)
            }
            IdQuery::FilmWorksReferencing { kind, ids } => {
                let sql = referencing_film_works_sql(&self.schema, *kind)?;
                trace!(%sql, offset, bound_ids = ids.len(), "🐘 paging referencing film works");
                let rows: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(&sql)
                    .bind(ids.as_slice())
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await
                    .with_context(|| format!("💀 Couldn't follow '{kind}' back to its film works. The junction table is giving us the cold shoulder."))?;
                Ok(rows.into_iter().map(|(id, _modified)| id).collect())
            }
        }
    }

    async fn fetch_rows(&self, query: &RowQuery, limit: i64, offset: i64) -> Result<Vec<JoinedFilmWorkRow>> {
        let sql = film_work_rows_sql(&self.schema, query);
        trace!(%sql, offset, "🐘 paging joined film work rows");
        let statement = sqlx::query_as::<_, JoinedFilmWorkRow>(&sql);
        let statement = match query {
            RowQuery::ByIds(ids) => statement.bind(ids.as_slice()),
            RowQuery::ModifiedSince(since) => statement.bind(*since),
        };
        let rows = statement
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("💀 The big film work JOIN fell over. Five tables walked into a query and none of them walked out.")?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_only_boring_identifiers_get_in() {
        assert!(validate_identifier("content").is_ok());
        assert!(validate_identifier("_staging2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2fast").is_err());
        assert!(validate_identifier("content; DROP TABLE film_work").is_err());
        assert!(validate_identifier("public.content").is_err());
    }

    #[test]
    fn the_one_where_changed_ids_are_ordered_and_paged() {
        let sql = changed_ids_sql("content", EntityKind::Person);
        assert!(sql.starts_with("SELECT id FROM content.person"));
        assert!(sql.contains("WHERE modified > $1"));
        assert!(sql.contains("ORDER BY modified, id"));
        assert!(sql.ends_with("LIMIT $2 OFFSET $3"));
    }

    #[test]
    fn the_one_where_genres_walk_through_their_junction_table() {
        let sql = referencing_film_works_sql("content", EntityKind::Genre).unwrap();
        assert!(sql.contains("JOIN content.genre_film_work link ON link.film_work_id = fw.id"));
        assert!(sql.contains("link.genre_id = ANY($1)"));
        assert!(referencing_film_works_sql("content", EntityKind::FilmWork).is_err());
    }

    #[test]
    fn the_one_where_the_big_join_picks_its_filter() {
        let by_ids = film_work_rows_sql("content", &RowQuery::ByIds(vec![Uuid::new_v4()]));
        assert!(by_ids.contains("WHERE fw.id = ANY($1)"));
        let since = film_work_rows_sql("content", &RowQuery::ModifiedSince(Utc::now()));
        assert!(since.contains("WHERE fw.modified > $1"));
        for sql in [by_ids, since] {
            assert!(sql.contains("g.name AS genre"));
            assert!(sql.contains("LEFT JOIN content.person p ON p.id = pfw.person_id"));
        }
    }
}
