//! Drives the pipeline against the persisted feed position.
use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::db::{self, DbThreadStore, Pool};
use crate::service::Pipeline;

/// Runs the email pipeline continuously until shutdown.
///
/// Each poll runs inside one database transaction covering the feed position
/// and every thread counter the pipeline touched. If the process dies
/// mid-poll the transaction rolls back and the next start reprocesses the
/// batch, so partially processed batches are redelivered rather than lost.
pub struct FeedWorker {
    pool: Pool,
    poll_gap: Duration,
    shutdown: watch::Receiver<bool>,
}

impl FeedWorker {
    pub fn new(pool: Pool, poll_gap: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            poll_gap,
            shutdown,
        }
    }

    /// Poll until the shutdown flag is raised. Shutdown is checked only
    /// between polls and during the caught-up sleep; an in-flight batch
    /// always finishes.
    #[instrument(skip_all)]
    pub async fn process(&mut self, pipeline: &Pipeline<'_>) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let caught_up = self.poll(pipeline).await?;

            if caught_up && !*self.shutdown.borrow() {
                debug!(
                    gap_seconds = self.poll_gap.as_secs(),
                    "caught up with feed, sleeping"
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_gap) => {}
                    _ = self.shutdown.changed() => {
                        info!("received shutdown signal between polls, stopping");
                    }
                }
            }
        }
        info!("feed worker stopped");
        Ok(())
    }

    /// One transactional poll. Returns true when the feed had nothing new.
    async fn poll(&self, pipeline: &Pipeline<'_>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let position = db::get_position(&mut tx).await?;

        let mut thread_store = DbThreadStore::new(&mut tx);
        let new_position = pipeline.run(&mut thread_store, position).await?;
        drop(thread_store);

        if new_position != position {
            db::set_position(&mut tx, new_position).await?;
        }
        // Counter bumps commit even when the position is unchanged: those
        // events were fully processed.
        tx.commit().await?;
        Ok(new_position == position)
    }
}

/// Runs the email pipeline exactly once from a fixed feed position.
///
/// Useful for local development and replaying captured feed data. Thread
/// counters touched by the run are committed; the stored feed position is
/// never written.
pub struct RunOnceWorker {
    pool: Pool,
    key: i64,
}

impl RunOnceWorker {
    pub fn new(pool: Pool, key: i64) -> Self {
        Self { pool, key }
    }

    #[instrument(skip_all, fields(key = self.key))]
    pub async fn process(&self, pipeline: &Pipeline<'_>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut thread_store = DbThreadStore::new(&mut tx);
        pipeline.run(&mut thread_store, self.key).await?;
        drop(thread_store);
        tx.commit().await?;
        Ok(())
    }
}
