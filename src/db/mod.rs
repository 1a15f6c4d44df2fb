use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use log::info;
use rusqlite::{params, Row, Transaction};

pub mod helpers;
mod migrations;
pub mod models;
pub mod pool;

use helpers::{invalid_column, parse_datetime};
use models::{
    ActivityCard, AppUsage, Batch, BatchStatus, Distraction, NewCard, NewSegment, Segment,
    SegmentStatus,
};
use pool::{ConnectionPool, PoolConfig};

/// Typed persistence operations over the pooled SQLite store.
///
/// Every mutating operation runs inside a single transaction scoped to
/// one pooled connection. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: Arc<ConnectionPool>,
}

impl Store {
    /// Opens the database, runs migrations, and starts the pool.
    /// A migration failure is fatal: the pipeline must not start on a
    /// half-initialized schema.
    pub fn open(db_path: PathBuf, pool_config: PoolConfig) -> Result<Self> {
        let pool = ConnectionPool::new(db_path.clone(), pool_config)?;

        {
            let mut conn = pool.acquire().context("failed to acquire for migration")?;
            migrations::run_migrations(&mut conn).context("failed to run database migrations")?;
        }

        info!("store initialized at {}", db_path.display());
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Checkpoints and closes every pooled connection.
    pub fn close(&self) {
        self.pool.close_all();
    }

    fn read<T>(&self, op: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let conn = self.pool.acquire()?;
        op(&conn)
    }

    fn write<T>(&self, op: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.pool.acquire()?;
        let tx = conn.transaction()?;
        let value = op(&tx)?;
        tx.commit().context("failed to commit transaction")?;
        Ok(value)
    }

    // ---- segments ----

    pub fn save_segment(&self, segment: &NewSegment) -> Result<i64> {
        let segment = segment.clone();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO segments (file_path, start_time, end_time, duration_secs, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    segment.file_path,
                    segment.start_time.to_rfc3339(),
                    segment.end_time.to_rfc3339(),
                    segment.duration_secs,
                    SegmentStatus::Pending.as_str(),
                ],
            )
            .context("failed to insert segment")?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Pending segments ordered by start time, oldest first.
    pub fn get_pending_segments(&self, limit: usize) -> Result<Vec<Segment>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_path, start_time, end_time, duration_secs, status, batch_id
                 FROM segments
                 WHERE status = ?1
                 ORDER BY start_time ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![SegmentStatus::Pending.as_str(), limit as i64],
                row_to_segment,
            )?;
            let mut segments = Vec::new();
            for row in rows {
                segments.push(row?);
            }
            Ok(segments)
        })
    }

    pub fn update_segment_status(
        &self,
        segment_id: i64,
        status: SegmentStatus,
        batch_id: Option<i64>,
    ) -> Result<()> {
        self.write(|tx| {
            match batch_id {
                Some(batch_id) => tx.execute(
                    "UPDATE segments SET status = ?1, batch_id = ?2 WHERE id = ?3",
                    params![status.as_str(), batch_id, segment_id],
                ),
                None => tx.execute(
                    "UPDATE segments SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), segment_id],
                ),
            }
            .with_context(|| format!("failed to update segment {segment_id} status"))?;
            Ok(())
        })
    }

    pub fn get_segment(&self, segment_id: i64) -> Result<Option<Segment>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_path, start_time, end_time, duration_secs, status, batch_id
                 FROM segments WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![segment_id], row_to_segment)?;
            rows.next().transpose().map_err(Into::into)
        })
    }

    // ---- batches ----

    /// Creates a batch already in Processing state; batches are born at
    /// the moment the scheduler starts working on them.
    pub fn create_batch(
        &self,
        segment_ids: &[i64],
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<i64> {
        let ids_json = serde_json::to_string(segment_ids)?;
        self.write(|tx| {
            tx.execute(
                "INSERT INTO analysis_batches (segment_ids, start_time, end_time, status)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    ids_json,
                    start_time.to_rfc3339(),
                    end_time.to_rfc3339(),
                    BatchStatus::Processing.as_str(),
                ],
            )
            .context("failed to insert batch")?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Terminal updates persist a completion timestamp; Completed also
    /// stores the serialized observation list, Failed the error message.
    pub fn update_batch(
        &self,
        batch_id: i64,
        status: BatchStatus,
        observations_json: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let observations = observations_json.map(str::to_owned);
        let error = error_message.map(str::to_owned);
        self.write(|tx| {
            match status {
                BatchStatus::Completed => tx.execute(
                    "UPDATE analysis_batches
                     SET status = ?1, observations_json = ?2, completed_at = ?3
                     WHERE id = ?4",
                    params![
                        status.as_str(),
                        observations.as_deref().unwrap_or("[]"),
                        Utc::now().to_rfc3339(),
                        batch_id,
                    ],
                ),
                BatchStatus::Failed => tx.execute(
                    "UPDATE analysis_batches
                     SET status = ?1, error_message = ?2, completed_at = ?3
                     WHERE id = ?4",
                    params![
                        status.as_str(),
                        error,
                        Utc::now().to_rfc3339(),
                        batch_id,
                    ],
                ),
                _ => tx.execute(
                    "UPDATE analysis_batches SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), batch_id],
                ),
            }
            .with_context(|| format!("failed to update batch {batch_id}"))?;
            Ok(())
        })
    }

    pub fn get_batch(&self, batch_id: i64) -> Result<Option<Batch>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, segment_ids, start_time, end_time, status, observations_json, error_message
                 FROM analysis_batches WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![batch_id], row_to_batch)?;
            rows.next().transpose().map_err(Into::into)
        })
    }

    // ---- cards ----

    pub fn save_card(&self, card: &NewCard, batch_id: Option<i64>) -> Result<i64> {
        let app_usage_json = serde_json::to_string(&card.app_usage)?;
        let distractions_json = serde_json::to_string(&card.distractions)?;
        let card = card.clone();
        self.write(move |tx| {
            tx.execute(
                "INSERT INTO timeline_cards
                 (batch_id, category, title, summary, start_time, end_time,
                  app_usage_json, distractions_json, productivity_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    batch_id,
                    card.category,
                    card.title,
                    card.summary,
                    card.start_time.to_rfc3339(),
                    card.end_time.to_rfc3339(),
                    app_usage_json,
                    distractions_json,
                    card.productivity_score,
                ],
            )
            .context("failed to insert card")?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Cards whose start time falls on the given calendar day (UTC),
    /// in chronological order.
    pub fn get_cards_for_date(&self, date: NaiveDate) -> Result<Vec<ActivityCard>> {
        let day_start = Utc
            .from_utc_datetime(&date.and_hms_opt(0, 0, 0).context("invalid date")?)
            .to_rfc3339();
        let day_end = Utc
            .from_utc_datetime(
                &date
                    .succ_opt()
                    .context("date out of range")?
                    .and_hms_opt(0, 0, 0)
                    .context("invalid date")?,
            )
            .to_rfc3339();

        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category, title, summary, start_time, end_time,
                        app_usage_json, distractions_json, productivity_score
                 FROM timeline_cards
                 WHERE start_time >= ?1 AND start_time < ?2
                 ORDER BY start_time ASC",
            )?;
            let rows = stmt.query_map(params![day_start, day_end], row_to_card)?;
            let mut cards = Vec::new();
            for row in rows {
                cards.push(row?);
            }
            Ok(cards)
        })
    }

    /// Most recently ended cards, newest first. Used as synthesis context.
    pub fn get_recent_cards(&self, limit: usize) -> Result<Vec<ActivityCard>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, category, title, summary, start_time, end_time,
                        app_usage_json, distractions_json, productivity_score
                 FROM timeline_cards
                 ORDER BY end_time DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_card)?;
            let mut cards = Vec::new();
            for row in rows {
                cards.push(row?);
            }
            Ok(cards)
        })
    }

    // ---- settings ----

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
            let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
            rows.next().transpose().map_err(Into::into)
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .context("failed to upsert setting")?;
            Ok(())
        })
    }
}

fn row_to_segment(row: &Row<'_>) -> Result<Segment, rusqlite::Error> {
    let start: String = row.get("start_time")?;
    let end: String = row.get("end_time")?;
    let status: String = row.get("status")?;

    Ok(Segment {
        id: row.get("id")?,
        file_path: row.get("file_path")?,
        start_time: parse_datetime(&start, "start_time").map_err(invalid_column)?,
        end_time: parse_datetime(&end, "end_time").map_err(invalid_column)?,
        duration_secs: row.get("duration_secs")?,
        status: SegmentStatus::parse(&status).map_err(invalid_column)?,
        batch_id: row.get("batch_id")?,
    })
}

fn row_to_batch(row: &Row<'_>) -> Result<Batch, rusqlite::Error> {
    let ids_json: String = row.get("segment_ids")?;
    let start: String = row.get("start_time")?;
    let end: String = row.get("end_time")?;
    let status: String = row.get("status")?;

    Ok(Batch {
        id: row.get("id")?,
        segment_ids: serde_json::from_str(&ids_json)
            .map_err(|e| invalid_column(anyhow::Error::new(e)))?,
        start_time: parse_datetime(&start, "start_time").map_err(invalid_column)?,
        end_time: parse_datetime(&end, "end_time").map_err(invalid_column)?,
        status: BatchStatus::parse(&status).map_err(invalid_column)?,
        observations_json: row.get("observations_json")?,
        error_message: row.get("error_message")?,
    })
}

fn row_to_card(row: &Row<'_>) -> Result<ActivityCard, rusqlite::Error> {
    let start: String = row.get("start_time")?;
    let end: String = row.get("end_time")?;
    let app_usage_json: String = row.get("app_usage_json")?;
    let distractions_json: String = row.get("distractions_json")?;

    let app_usage: Vec<AppUsage> = serde_json::from_str(&app_usage_json)
        .map_err(|e| invalid_column(anyhow::Error::new(e)))?;
    let distractions: Vec<Distraction> = serde_json::from_str(&distractions_json)
        .map_err(|e| invalid_column(anyhow::Error::new(e)))?;

    Ok(ActivityCard {
        id: row.get("id")?,
        category: row.get("category")?,
        title: row.get("title")?,
        summary: row.get("summary")?,
        start_time: parse_datetime(&start, "start_time").map_err(invalid_column)?,
        end_time: parse_datetime(&end, "end_time").map_err(invalid_column)?,
        app_usage,
        distractions,
        productivity_score: row.get("productivity_score")?,
    })
}
