use crate::appliance::{
    Appliance, ApplianceClient, RecordedEpisode, RecordedSeries, RESUME_WATCHED_SENTINEL,
};
use crate::discovery::DeviceRegistry;
use crate::error::{ApiError, Result};
use regex::Regex;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SeriesRecord {
    pub id: i64,
    pub device_id: String,
    pub series_id: String,
    pub title: String,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub episode_count: i64,
    pub total_duration: i64,
    pub first_recorded: Option<i64>,
    pub last_recorded: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EpisodeRecord {
    pub id: i64,
    pub series_row_id: i64,
    pub program_id: String,
    pub title: String,
    pub episode_title: Option<String>,
    pub episode_number: Option<String>,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub synopsis: Option<String>,
    pub channel_name: Option<String>,
    pub channel_number: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub original_airdate: Option<i64>,
    pub filename: Option<String>,
    pub play_url: String,
    pub cmd_url: String,
    pub resume_position: i64,
    pub watched: bool,
    pub record_success: bool,
    pub image_url: Option<String>,
    #[sqlx(default)]
    pub source_url: String,
    #[sqlx(default)]
    pub resume_minutes: i64,
}

impl EpisodeRecord {
    /// Canonicalize for presentation: a watched row whose stored position is
    /// the canonical zero reports the full duration, and the upstream play
    /// URL moves to `source_url` so `play_url` can point at the local proxy.
    fn canonicalize(mut self) -> Self {
        if self.watched && self.resume_position == 0 {
            self.resume_position = self.duration;
        }
        self.resume_minutes = self.resume_position / 60;
        self.source_url = self.play_url.clone();
        self.play_url = format!("/stream/{}/playlist.m3u8", self.id);
        self
    }
}

/// Parse an `SxxEyy` marker into season and episode numbers.
pub fn parse_episode_number(text: &str) -> (Option<i64>, Option<i64>) {
    let re = Regex::new(r"(?i)S(\d+)E(\d+)").unwrap();
    match re.captures(text) {
        Some(caps) => (
            caps[1].parse::<i64>().ok(),
            caps[2].parse::<i64>().ok(),
        ),
        None => (None, None),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct SyncReport {
    pub devices: usize,
    pub series: usize,
    pub episodes: usize,
}

#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
    client: ApplianceClient,
}

impl Catalog {
    pub fn new(pool: SqlitePool, client: ApplianceClient) -> Self {
        Self { pool, client }
    }

    /// Pull the series and episode catalogs from every DVR-capable appliance
    /// in the registry and upsert them.
    pub async fn sync_all(&self, registry: &Arc<DeviceRegistry>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for appliance in registry.dvr_appliances().await {
            match self.sync_appliance(&appliance).await {
                Ok((series, episodes)) => {
                    report.devices += 1;
                    report.series += series;
                    report.episodes += episodes;
                }
                Err(e) => {
                    warn!("catalog sync failed: device={} err={}", appliance.device_id, e);
                }
            }
        }
        info!(
            "catalog sync: devices={} series={} episodes={}",
            report.devices, report.series, report.episodes
        );
        Ok(report)
    }

    async fn sync_appliance(&self, appliance: &Appliance) -> Result<(usize, usize)> {
        let storage_url = appliance
            .storage_url
            .as_deref()
            .ok_or_else(|| ApiError::InvalidArgument("appliance has no storage".to_string()))?;

        let device_row_id = self.upsert_device(appliance).await?;
        let series_list = self.client.recorded_series(storage_url).await?;

        let mut series_count = 0usize;
        let mut episode_count = 0usize;
        for series in &series_list {
            let series_row_id = self.upsert_series(device_row_id, series).await?;
            series_count += 1;
            let episodes = self.client.episodes(&series.episodes_url).await?;
            for episode in &episodes {
                self.upsert_episode(series_row_id, episode).await?;
                episode_count += 1;
            }
        }
        Ok((series_count, episode_count))
    }

    pub async fn upsert_device(&self, appliance: &Appliance) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            INSERT INTO devices (device_id, friendly_name, ip, base_url, device_auth,
                                 tuner_count, storage_url, total_space, free_space, last_seen, online)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT (device_id) DO UPDATE SET
                friendly_name = excluded.friendly_name,
                ip = excluded.ip,
                base_url = excluded.base_url,
                device_auth = excluded.device_auth,
                tuner_count = excluded.tuner_count,
                storage_url = excluded.storage_url,
                total_space = excluded.total_space,
                free_space = excluded.free_space,
                last_seen = excluded.last_seen,
                online = 1
            RETURNING id
            "#,
        )
        .bind(&appliance.device_id)
        .bind(&appliance.friendly_name)
        .bind(&appliance.ip)
        .bind(&appliance.base_url)
        .bind(&appliance.device_auth)
        .bind(appliance.tuner_count as i64)
        .bind(&appliance.storage_url)
        .bind(appliance.total_space.map(|v| v as i64))
        .bind(appliance.free_space.map(|v| v as i64))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    pub async fn upsert_series(&self, device_row_id: i64, series: &RecordedSeries) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO series (device_row_id, series_id, title, category, image_url, episodes_url)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_row_id, series_id) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                image_url = excluded.image_url,
                episodes_url = excluded.episodes_url
            RETURNING id
            "#,
        )
        .bind(device_row_id)
        .bind(&series.series_id)
        .bind(&series.title)
        .bind(&series.category)
        .bind(&series.image_url)
        .bind(&series.episodes_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    pub async fn upsert_episode(&self, series_row_id: i64, ep: &RecordedEpisode) -> Result<i64> {
        // The appliance reports "fully watched" as the u32 sentinel. It must
        // never land raw in the signed column: store 0 and set the flag.
        let (resume, watched) = match ep.resume {
            Some(RESUME_WATCHED_SENTINEL) => (0i64, true),
            Some(v) => (v as i64, false),
            None => (0i64, false),
        };
        let duration = (ep.end_time - ep.start_time).max(0);
        let (season, episode) = ep
            .episode_number
            .as_deref()
            .map(parse_episode_number)
            .unwrap_or((None, None));
        let now = chrono::Utc::now().timestamp();

        let row = sqlx::query(
            r#"
            INSERT INTO episodes (series_row_id, program_id, title, episode_title, episode_number,
                                  season, episode, synopsis, channel_name, channel_number,
                                  start_time, end_time, duration, original_airdate,
                                  record_start_time, record_end_time, filename, play_url, cmd_url,
                                  resume_position, watched, record_success, image_url, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (series_row_id, program_id) DO UPDATE SET
                title = excluded.title,
                episode_title = excluded.episode_title,
                episode_number = excluded.episode_number,
                season = excluded.season,
                episode = excluded.episode,
                synopsis = excluded.synopsis,
                channel_name = excluded.channel_name,
                channel_number = excluded.channel_number,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                duration = excluded.duration,
                original_airdate = excluded.original_airdate,
                record_start_time = excluded.record_start_time,
                record_end_time = excluded.record_end_time,
                filename = excluded.filename,
                play_url = excluded.play_url,
                cmd_url = excluded.cmd_url,
                resume_position = excluded.resume_position,
                watched = excluded.watched,
                record_success = excluded.record_success,
                image_url = excluded.image_url,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(series_row_id)
        .bind(&ep.program_id)
        .bind(&ep.title)
        .bind(&ep.episode_title)
        .bind(&ep.episode_number)
        .bind(season)
        .bind(episode)
        .bind(&ep.synopsis)
        .bind(&ep.channel_name)
        .bind(&ep.channel_number)
        .bind(ep.start_time)
        .bind(ep.end_time)
        .bind(duration)
        .bind(ep.original_airdate)
        .bind(ep.record_start_time)
        .bind(ep.record_end_time)
        .bind(&ep.filename)
        .bind(&ep.play_url)
        .bind(&ep.cmd_url)
        .bind(resume)
        .bind(watched)
        .bind(ep.record_success.unwrap_or(1) == 1)
        .bind(&ep.image_url)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    pub async fn list_series(&self) -> Result<Vec<SeriesRecord>> {
        let rows = sqlx::query_as::<_, SeriesRecord>(
            r#"
            SELECT s.id, d.device_id, s.series_id, s.title, s.category, s.image_url,
                   s.episode_count, s.total_duration, s.first_recorded, s.last_recorded
            FROM series s JOIN devices d ON d.id = s.device_row_id
            ORDER BY s.title COLLATE NOCASE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_episodes(&self, series_row_id: i64) -> Result<Vec<EpisodeRecord>> {
        let rows = sqlx::query_as::<_, EpisodeRecord>(
            r#"
            SELECT id, series_row_id, program_id, title, episode_title, episode_number,
                   season, episode, synopsis, channel_name, channel_number,
                   start_time, end_time, duration, original_airdate, filename,
                   play_url, cmd_url, resume_position, watched, record_success, image_url
            FROM episodes WHERE series_row_id = ?
            ORDER BY start_time ASC
            "#,
        )
        .bind(series_row_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EpisodeRecord::canonicalize).collect())
    }

    pub async fn get_episode(&self, episode_id: i64) -> Result<EpisodeRecord> {
        let row = sqlx::query_as::<_, EpisodeRecord>(
            r#"
            SELECT id, series_row_id, program_id, title, episode_title, episode_number,
                   season, episode, synopsis, channel_name, channel_number,
                   start_time, end_time, duration, original_airdate, filename,
                   play_url, cmd_url, resume_position, watched, record_success, image_url
            FROM episodes WHERE id = ?
            "#,
        )
        .bind(episode_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("episode {episode_id}")))?;
        Ok(row.canonicalize())
    }

    /// Write the local progress row, then mirror to the appliance in the
    /// background. The appliance write is best-effort; its failure never
    /// fails the request.
    pub async fn update_progress(
        &self,
        episode_id: i64,
        position_seconds: u32,
        watched: bool,
    ) -> Result<EpisodeRecord> {
        let current = self.get_episode(episode_id).await?;
        if current.duration > 0 && (position_seconds as i64) > current.duration {
            return Err(ApiError::Conflict(format!(
                "position {position_seconds} exceeds episode duration {}",
                current.duration
            )));
        }

        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE episodes SET resume_position = ?, watched = ?, updated_at = ? WHERE id = ?",
        )
        .bind(position_seconds as i64)
        .bind(watched)
        .bind(now)
        .bind(episode_id)
        .execute(&self.pool)
        .await?;

        let cmd_url = current.cmd_url.clone();
        if !cmd_url.is_empty() {
            let client = self.client.clone();
            let value = if watched {
                RESUME_WATCHED_SENTINEL
            } else {
                position_seconds
            };
            tokio::spawn(async move {
                if let Err(e) = client.set_resume(&cmd_url, value).await {
                    warn!("progress mirror to appliance failed: {}", e);
                }
            });
        }

        self.get_episode(episode_id).await
    }

    /// Delete on the appliance first; the local row and the HLS cache are
    /// only touched after the appliance accepted the command.
    pub async fn delete_episode(&self, episode_id: i64, rerecord: bool) -> Result<EpisodeRecord> {
        let episode = self.get_episode(episode_id).await?;
        if !episode.cmd_url.is_empty() {
            self.client
                .delete_recording(&episode.cmd_url, rerecord)
                .await?;
        }
        sqlx::query("DELETE FROM episodes WHERE id = ?")
            .bind(episode_id)
            .execute(&self.pool)
            .await?;
        info!("episode deleted: id={} rerecord={}", episode_id, rerecord);
        Ok(episode)
    }

    /// Every episode across all series, oldest first. Feeds the transcode
    /// backfill driver.
    pub async fn list_all_episodes(&self) -> Result<Vec<EpisodeRecord>> {
        let rows = sqlx::query_as::<_, EpisodeRecord>(
            r#"
            SELECT id, series_row_id, program_id, title, episode_title, episode_number,
                   season, episode, synopsis, channel_name, channel_number,
                   start_time, end_time, duration, original_airdate, filename,
                   play_url, cmd_url, resume_position, watched, record_success, image_url
            FROM episodes ORDER BY start_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EpisodeRecord::canonicalize).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_pool;

    fn fake_appliance() -> Appliance {
        Appliance {
            device_id: "DEV1".into(),
            ip: "127.0.0.1".into(),
            base_url: "http://127.0.0.1:65530".into(),
            friendly_name: "Test DVR".into(),
            model_number: "HDVR-2US".into(),
            device_auth: "auth".into(),
            tuner_count: 2,
            lineup_url: String::new(),
            storage_url: Some("http://127.0.0.1:65530/recorded_files.json".into()),
            total_space: Some(1000),
            free_space: Some(500),
            last_seen: 0,
            online: true,
        }
    }

    fn fake_series(id: &str, title: &str) -> RecordedSeries {
        RecordedSeries {
            series_id: id.into(),
            title: title.into(),
            category: Some("series".into()),
            image_url: None,
            episodes_url: format!("http://127.0.0.1:65530/episodes/{id}"),
            start_time: None,
        }
    }

    fn fake_episode(program_id: &str, start: i64, end: i64, resume: Option<u32>) -> RecordedEpisode {
        RecordedEpisode {
            program_id: program_id.into(),
            series_id: "S1".into(),
            title: "Show".into(),
            episode_title: Some("Pilot".into()),
            episode_number: Some("S01E01".into()),
            synopsis: Some("First one.".into()),
            channel_name: Some("KTVU".into()),
            channel_number: Some("2.1".into()),
            start_time: start,
            end_time: end,
            original_airdate: None,
            record_start_time: Some(start),
            record_end_time: Some(end),
            filename: Some("show.mpg".into()),
            play_url: format!("http://127.0.0.1:65530/play/{program_id}"),
            cmd_url: String::new(),
            resume,
            record_success: Some(1),
            image_url: None,
        }
    }

    async fn seeded_catalog() -> (Catalog, i64, tempfile::TempDir) {
        let (pool, dir) = temp_pool().await;
        let catalog = Catalog::new(pool, ApplianceClient::new());
        let device_row = catalog.upsert_device(&fake_appliance()).await.unwrap();
        let series_row = catalog
            .upsert_series(device_row, &fake_series("S1", "Show"))
            .await
            .unwrap();
        (catalog, series_row, dir)
    }

    #[test]
    fn test_parse_episode_number() {
        assert_eq!(parse_episode_number("S02E05"), (Some(2), Some(5)));
        assert_eq!(parse_episode_number("s10e113"), (Some(10), Some(113)));
        assert_eq!(parse_episode_number("Pilot"), (None, None));
    }

    #[tokio::test]
    async fn test_sentinel_resume_canonicalized_on_sync() {
        let (catalog, series_row, _dir) = seeded_catalog().await;
        let id = catalog
            .upsert_episode(
                series_row,
                &fake_episode("EP1", 1000, 2800, Some(RESUME_WATCHED_SENTINEL)),
            )
            .await
            .unwrap();

        let ep = catalog.get_episode(id).await.unwrap();
        assert!(ep.watched);
        // Sentinel reads back as the full duration, not as a raw 2^32-1.
        assert_eq!(ep.resume_position, 1800);
        assert_eq!(ep.resume_minutes, 30);
    }

    #[tokio::test]
    async fn test_progress_round_trip() {
        let (catalog, series_row, _dir) = seeded_catalog().await;
        let id = catalog
            .upsert_episode(series_row, &fake_episode("EP1", 0, 3600, None))
            .await
            .unwrap();

        let ep = catalog.update_progress(id, 1800, false).await.unwrap();
        assert_eq!(ep.resume_position, 1800);
        assert_eq!(ep.resume_minutes, 30);
        assert!(!ep.watched);

        let ep = catalog.get_episode(id).await.unwrap();
        assert_eq!(ep.resume_position, 1800);
        assert!(!ep.watched);
    }

    #[tokio::test]
    async fn test_progress_beyond_duration_conflicts() {
        let (catalog, series_row, _dir) = seeded_catalog().await;
        let id = catalog
            .upsert_episode(series_row, &fake_episode("EP1", 0, 1800, None))
            .await
            .unwrap();
        let err = catalog.update_progress(id, 4000, false).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_play_url_rewritten_to_local_proxy() {
        let (catalog, series_row, _dir) = seeded_catalog().await;
        let id = catalog
            .upsert_episode(series_row, &fake_episode("EP1", 0, 3600, None))
            .await
            .unwrap();
        let ep = catalog.get_episode(id).await.unwrap();
        assert_eq!(ep.play_url, format!("/stream/{id}/playlist.m3u8"));
        assert!(ep.source_url.starts_with("http://127.0.0.1:65530/play/"));
    }

    #[tokio::test]
    async fn test_episodes_sorted_by_start_time() {
        let (catalog, series_row, _dir) = seeded_catalog().await;
        catalog
            .upsert_episode(series_row, &fake_episode("EP2", 5000, 8600, None))
            .await
            .unwrap();
        catalog
            .upsert_episode(series_row, &fake_episode("EP1", 1000, 2800, None))
            .await
            .unwrap();
        let episodes = catalog.list_episodes(series_row).await.unwrap();
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[0].program_id, "EP1");
        assert_eq!(episodes[1].program_id, "EP2");
    }

    #[tokio::test]
    async fn test_delete_without_cmd_url_is_local_and_idempotent() {
        let (catalog, series_row, _dir) = seeded_catalog().await;
        let id = catalog
            .upsert_episode(series_row, &fake_episode("EP1", 0, 3600, None))
            .await
            .unwrap();

        catalog.delete_episode(id, false).await.unwrap();
        let err = catalog.delete_episode(id, false).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sync_upsert_is_stable_on_repeat() {
        let (catalog, series_row, _dir) = seeded_catalog().await;
        let first = catalog
            .upsert_episode(series_row, &fake_episode("EP1", 0, 3600, Some(120)))
            .await
            .unwrap();
        let second = catalog
            .upsert_episode(series_row, &fake_episode("EP1", 0, 3600, Some(240)))
            .await
            .unwrap();
        assert_eq!(first, second);
        let ep = catalog.get_episode(first).await.unwrap();
        assert_eq!(ep.resume_position, 240);
    }
}
