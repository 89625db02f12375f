use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id       TEXT NOT NULL UNIQUE,
    friendly_name   TEXT NOT NULL DEFAULT '',
    ip              TEXT NOT NULL DEFAULT '',
    base_url        TEXT NOT NULL DEFAULT '',
    device_auth     TEXT NOT NULL DEFAULT '',
    tuner_count     INTEGER NOT NULL DEFAULT 0,
    storage_url     TEXT,
    total_space     INTEGER,
    free_space      INTEGER,
    last_seen       INTEGER NOT NULL DEFAULT 0,
    online          INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS series (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    device_row_id   INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    series_id       TEXT NOT NULL,
    title           TEXT NOT NULL DEFAULT '',
    category        TEXT,
    image_url       TEXT,
    episodes_url    TEXT NOT NULL DEFAULT '',
    episode_count   INTEGER NOT NULL DEFAULT 0,
    total_duration  INTEGER NOT NULL DEFAULT 0,
    first_recorded  INTEGER,
    last_recorded   INTEGER,
    UNIQUE (device_row_id, series_id)
);

CREATE TABLE IF NOT EXISTS episodes (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    series_row_id     INTEGER NOT NULL REFERENCES series(id) ON DELETE CASCADE,
    program_id        TEXT NOT NULL,
    title             TEXT NOT NULL DEFAULT '',
    episode_title     TEXT,
    episode_number    TEXT,
    season            INTEGER,
    episode           INTEGER,
    synopsis          TEXT,
    channel_name      TEXT,
    channel_number    TEXT,
    start_time        INTEGER NOT NULL DEFAULT 0,
    end_time          INTEGER NOT NULL DEFAULT 0,
    duration          INTEGER NOT NULL DEFAULT 0,
    original_airdate  INTEGER,
    record_start_time INTEGER,
    record_end_time   INTEGER,
    filename          TEXT,
    play_url          TEXT NOT NULL DEFAULT '',
    cmd_url           TEXT NOT NULL DEFAULT '',
    resume_position   INTEGER NOT NULL DEFAULT 0,
    watched           INTEGER NOT NULL DEFAULT 0,
    record_success    INTEGER NOT NULL DEFAULT 1,
    image_url         TEXT,
    updated_at        INTEGER NOT NULL DEFAULT 0,
    UNIQUE (series_row_id, program_id)
);

CREATE INDEX IF NOT EXISTS idx_episodes_series ON episodes (series_row_id, start_time);

CREATE TABLE IF NOT EXISTS guide_channels (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    guide_number  TEXT NOT NULL UNIQUE,
    guide_name    TEXT NOT NULL DEFAULT '',
    image_url     TEXT,
    last_updated  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS guide_programs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id       INTEGER NOT NULL REFERENCES guide_channels(id) ON DELETE CASCADE,
    series_id        TEXT NOT NULL DEFAULT '',
    title            TEXT NOT NULL DEFAULT '',
    episode_title    TEXT,
    synopsis         TEXT,
    start_time       INTEGER NOT NULL DEFAULT 0,
    end_time         INTEGER NOT NULL DEFAULT 0,
    original_airdate INTEGER,
    image_url        TEXT,
    UNIQUE (channel_id, series_id, start_time)
);

CREATE INDEX IF NOT EXISTS idx_guide_programs_window ON guide_programs (start_time, end_time);

CREATE TABLE IF NOT EXISTS recording_rules (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id          TEXT NOT NULL UNIQUE,
    series_id        TEXT NOT NULL DEFAULT '',
    title            TEXT NOT NULL DEFAULT '',
    synopsis         TEXT,
    image_url        TEXT,
    channel_only     TEXT,
    team_only        TEXT,
    recent_only      INTEGER NOT NULL DEFAULT 0,
    after_original_airdate INTEGER,
    datetime_only    INTEGER,
    priority         INTEGER NOT NULL DEFAULT 0,
    start_padding    INTEGER NOT NULL DEFAULT 0,
    end_padding      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS live_tuners (
    tuner_id      TEXT PRIMARY KEY,
    device_id     TEXT NOT NULL,
    tuner_index   INTEGER NOT NULL,
    state         TEXT NOT NULL DEFAULT 'idle',
    channel       TEXT,
    viewer_count  INTEGER NOT NULL DEFAULT 0,
    last_accessed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS live_viewers (
    client_id      TEXT PRIMARY KEY,
    tuner_id       TEXT NOT NULL,
    channel        TEXT NOT NULL DEFAULT '',
    last_heartbeat INTEGER NOT NULL DEFAULT 0
);

CREATE TRIGGER IF NOT EXISTS episodes_after_insert
AFTER INSERT ON episodes
BEGIN
    UPDATE series SET
        episode_count  = (SELECT COUNT(*) FROM episodes WHERE series_row_id = NEW.series_row_id),
        total_duration = (SELECT COALESCE(SUM(duration), 0) FROM episodes WHERE series_row_id = NEW.series_row_id),
        first_recorded = (SELECT MIN(start_time) FROM episodes WHERE series_row_id = NEW.series_row_id),
        last_recorded  = (SELECT MAX(start_time) FROM episodes WHERE series_row_id = NEW.series_row_id)
    WHERE id = NEW.series_row_id;
END;

CREATE TRIGGER IF NOT EXISTS episodes_after_update
AFTER UPDATE ON episodes
BEGIN
    UPDATE series SET
        episode_count  = (SELECT COUNT(*) FROM episodes WHERE series_row_id = NEW.series_row_id),
        total_duration = (SELECT COALESCE(SUM(duration), 0) FROM episodes WHERE series_row_id = NEW.series_row_id),
        first_recorded = (SELECT MIN(start_time) FROM episodes WHERE series_row_id = NEW.series_row_id),
        last_recorded  = (SELECT MAX(start_time) FROM episodes WHERE series_row_id = NEW.series_row_id)
    WHERE id = NEW.series_row_id;
    UPDATE series SET
        episode_count  = (SELECT COUNT(*) FROM episodes WHERE series_row_id = OLD.series_row_id),
        total_duration = (SELECT COALESCE(SUM(duration), 0) FROM episodes WHERE series_row_id = OLD.series_row_id),
        first_recorded = (SELECT MIN(start_time) FROM episodes WHERE series_row_id = OLD.series_row_id),
        last_recorded  = (SELECT MAX(start_time) FROM episodes WHERE series_row_id = OLD.series_row_id)
    WHERE id = OLD.series_row_id AND OLD.series_row_id != NEW.series_row_id;
END;

CREATE TRIGGER IF NOT EXISTS episodes_after_delete
AFTER DELETE ON episodes
BEGIN
    UPDATE series SET
        episode_count  = (SELECT COUNT(*) FROM episodes WHERE series_row_id = OLD.series_row_id),
        total_duration = (SELECT COALESCE(SUM(duration), 0) FROM episodes WHERE series_row_id = OLD.series_row_id),
        first_recorded = (SELECT MIN(start_time) FROM episodes WHERE series_row_id = OLD.series_row_id),
        last_recorded  = (SELECT MAX(start_time) FROM episodes WHERE series_row_id = OLD.series_row_id)
    WHERE id = OLD.series_row_id;
END;
"#;

pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Reconcile the derived series columns against the episode rows. Run once
/// at startup so rows written before the triggers existed end up correct.
pub async fn recalculate_series_stats(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE series SET
            episode_count  = (SELECT COUNT(*) FROM episodes WHERE series_row_id = series.id),
            total_duration = (SELECT COALESCE(SUM(duration), 0) FROM episodes WHERE series_row_id = series.id),
            first_recorded = (SELECT MIN(start_time) FROM episodes WHERE series_row_id = series.id),
            last_recorded  = (SELECT MAX(start_time) FROM episodes WHERE series_row_id = series.id)
        "#,
    )
    .execute(pool)
    .await?;
    info!("series statistics reconciled: {} row(s)", result.rows_affected());
    Ok(result.rows_affected())
}

#[cfg(test)]
pub mod test_util {
    use super::*;

    /// A throwaway on-disk database. Returned alongside its TempDir so the
    /// file outlives the pool.
    pub async fn temp_pool() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect(&dir.path().join("test.db")).await.unwrap();
        (pool, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn seed_series(pool: &SqlitePool) -> i64 {
        sqlx::query("INSERT INTO devices (device_id) VALUES ('DEV1')")
            .execute(pool)
            .await
            .unwrap();
        let row = sqlx::query(
            "INSERT INTO series (device_row_id, series_id, title) VALUES (1, 'S1', 'Show') RETURNING id",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        row.get::<i64, _>(0)
    }

    async fn series_stats(pool: &SqlitePool, id: i64) -> (i64, i64, Option<i64>, Option<i64>) {
        let row = sqlx::query(
            "SELECT episode_count, total_duration, first_recorded, last_recorded FROM series WHERE id = ?",
        )
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap();
        (row.get(0), row.get(1), row.get(2), row.get(3))
    }

    #[tokio::test]
    async fn test_triggers_maintain_series_aggregates() {
        let (pool, _dir) = test_util::temp_pool().await;
        let series_id = seed_series(&pool).await;

        sqlx::query(
            "INSERT INTO episodes (series_row_id, program_id, start_time, end_time, duration)
             VALUES (?, 'EP1', 1000, 2800, 1800)",
        )
        .bind(series_id)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO episodes (series_row_id, program_id, start_time, end_time, duration)
             VALUES (?, 'EP2', 5000, 8600, 3600)",
        )
        .bind(series_id)
        .execute(&pool)
        .await
        .unwrap();

        let (count, duration, first, last) = series_stats(&pool, series_id).await;
        assert_eq!(count, 2);
        assert_eq!(duration, 5400);
        assert_eq!(first, Some(1000));
        assert_eq!(last, Some(5000));

        sqlx::query("DELETE FROM episodes WHERE program_id = 'EP2'")
            .execute(&pool)
            .await
            .unwrap();
        let (count, duration, _, last) = series_stats(&pool, series_id).await;
        assert_eq!(count, 1);
        assert_eq!(duration, 1800);
        assert_eq!(last, Some(1000));
    }

    #[tokio::test]
    async fn test_recalculate_fixes_drifted_stats() {
        let (pool, _dir) = test_util::temp_pool().await;
        let series_id = seed_series(&pool).await;
        sqlx::query(
            "INSERT INTO episodes (series_row_id, program_id, start_time, end_time, duration)
             VALUES (?, 'EP1', 1000, 2800, 1800)",
        )
        .bind(series_id)
        .execute(&pool)
        .await
        .unwrap();

        // Simulate rows written before the triggers existed.
        sqlx::query("UPDATE series SET episode_count = 99, total_duration = 0")
            .execute(&pool)
            .await
            .unwrap();

        recalculate_series_stats(&pool).await.unwrap();
        let (count, duration, _, _) = series_stats(&pool, series_id).await;
        assert_eq!(count, 1);
        assert_eq!(duration, 1800);
    }

    #[tokio::test]
    async fn test_guide_program_natural_key_is_unique() {
        let (pool, _dir) = test_util::temp_pool().await;
        sqlx::query("INSERT INTO guide_channels (guide_number, guide_name) VALUES ('2.1', 'KTVU')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO guide_programs (channel_id, series_id, title, start_time, end_time)
             VALUES (1, 'SER1', 'News', 1000, 2000)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let dup = sqlx::query(
            "INSERT INTO guide_programs (channel_id, series_id, title, start_time, end_time)
             VALUES (1, 'SER1', 'News', 1000, 2000)",
        )
        .execute(&pool)
        .await;
        assert!(dup.is_err());
    }
}
