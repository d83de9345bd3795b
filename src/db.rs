//! SQLite persistence: the feed position singleton and per-revision thread
//! counters. Both are only ever read and written inside the worker's
//! per-poll transaction so that position advancement and counter bumps
//! commit together.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, ensure the parent directory exists.
/// Leaves in-memory URLs and non-sqlite schemes untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    if let Some(parent) = std::path::Path::new(path_part).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{path_part}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// True once the singleton feed position row exists.
#[instrument(skip_all)]
pub async fn is_seeded(pool: &Pool) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_position")
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// Seed the initial feed position. Refuses to run against an already
/// seeded store: seeding twice would silently rewind or skip feed events.
#[instrument(skip_all)]
pub async fn seed_position(pool: &Pool, position: i64) -> Result<()> {
    if is_seeded(pool).await? {
        return Err(anyhow!(
            "store has already been seeded; refusing to overwrite the feed position"
        ));
    }
    sqlx::query("INSERT INTO query_position (id, up_to_key) VALUES (1, ?)")
        .bind(position)
        .execute(pool)
        .await?;
    Ok(())
}

/// Read the current feed position inside the poll transaction.
pub async fn get_position(tx: &mut Transaction<'_, Sqlite>) -> Result<i64> {
    let position = sqlx::query_scalar::<_, i64>("SELECT up_to_key FROM query_position WHERE id = 1")
        .fetch_optional(&mut **tx)
        .await?;
    position.ok_or_else(|| {
        anyhow!("feed position has not been seeded yet, run `review-emails prepare` first")
    })
}

/// Advance the feed position inside the poll transaction.
pub async fn set_position(tx: &mut Transaction<'_, Sqlite>, position: i64) -> Result<()> {
    sqlx::query("UPDATE query_position SET up_to_key = ? WHERE id = 1")
        .bind(position)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Per-revision email thread counters.
///
/// `bump` gets-or-creates the counter for a revision and increments it by
/// exactly one, returning the post-increment value. Implementations decide
/// durability: the SQLite store lives inside the poll transaction, while the
/// in-memory store backs tests and one-shot runs.
#[async_trait]
pub trait ThreadStore: Send {
    async fn bump(&mut self, revision_id: i64) -> Result<i64>;
}

/// Thread counters stored in the `thread` table, scoped to a transaction.
pub struct DbThreadStore<'a, 'c> {
    tx: &'a mut Transaction<'c, Sqlite>,
}

impl<'a, 'c> DbThreadStore<'a, 'c> {
    pub fn new(tx: &'a mut Transaction<'c, Sqlite>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ThreadStore for DbThreadStore<'_, '_> {
    async fn bump(&mut self, revision_id: i64) -> Result<i64> {
        let existing =
            sqlx::query_scalar::<_, i64>("SELECT email_count FROM thread WHERE revision_id = ?")
                .bind(revision_id)
                .fetch_optional(&mut **self.tx)
                .await?;

        match existing {
            Some(count) => {
                let next = count + 1;
                sqlx::query("UPDATE thread SET email_count = ? WHERE revision_id = ?")
                    .bind(next)
                    .bind(revision_id)
                    .execute(&mut **self.tx)
                    .await?;
                Ok(next)
            }
            None => {
                sqlx::query("INSERT INTO thread (revision_id, email_count) VALUES (?, 1)")
                    .bind(revision_id)
                    .execute(&mut **self.tx)
                    .await?;
                Ok(1)
            }
        }
    }
}

/// In-memory thread counters for tests and run-once execution.
#[derive(Debug, Default)]
pub struct MemoryThreadStore {
    counts: HashMap<i64, i64>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn bump(&mut self, revision_id: i64) -> Result<i64> {
        let count = self.counts.entry(revision_id).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}
