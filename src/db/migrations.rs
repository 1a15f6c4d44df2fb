use anyhow::{bail, Context, Result};
use rusqlite::{Connection, Transaction};

const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Applies pending schema versions inside one transaction. Evolution is
/// additive only: new tables and nullable columns, never rewrites.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({}) is newer than supported schema ({})",
            version,
            CURRENT_SCHEMA_VERSION
        );
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)
            .with_context(|| format!("migration to version {next_version} failed"))?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => {
            tx.execute_batch(
                "CREATE TABLE segments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_path TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL,
                    duration_secs REAL NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    batch_id INTEGER
                );
                CREATE INDEX idx_segments_status_start
                    ON segments (status, start_time);

                CREATE TABLE analysis_batches (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    segment_ids TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    observations_json TEXT NOT NULL DEFAULT '[]',
                    error_message TEXT
                );

                CREATE TABLE timeline_cards (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    batch_id INTEGER,
                    category TEXT NOT NULL,
                    title TEXT NOT NULL,
                    summary TEXT NOT NULL DEFAULT '',
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL,
                    app_usage_json TEXT NOT NULL DEFAULT '[]',
                    distractions_json TEXT NOT NULL DEFAULT '[]',
                    productivity_score REAL NOT NULL DEFAULT 0
                );
                CREATE INDEX idx_cards_start ON timeline_cards (start_time);
                CREATE INDEX idx_cards_end ON timeline_cards (end_time);",
            )
            .context("failed to create base schema")?;
            Ok(())
        }
        2 => {
            tx.execute_batch(
                "CREATE TABLE settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                ALTER TABLE analysis_batches ADD COLUMN completed_at TEXT;",
            )
            .context("failed to apply settings/completed_at migration")?;
            Ok(())
        }
        _ => bail!("unknown migration target version: {version}"),
    }
}
