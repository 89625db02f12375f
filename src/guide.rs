use crate::appliance::ApplianceClient;
use crate::config::GuideConfig;
use crate::discovery::DeviceRegistry;
use crate::error::{ApiError, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One channel group of the cloud guide response.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudGuideChannel {
    #[serde(rename = "GuideNumber", default)]
    pub guide_number: String,
    #[serde(rename = "GuideName", default)]
    pub guide_name: String,
    #[serde(rename = "ImageURL")]
    pub image_url: Option<String>,
    #[serde(rename = "Guide", default)]
    pub programs: Vec<CloudGuideProgram>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudGuideProgram {
    #[serde(rename = "SeriesID", default)]
    pub series_id: String,
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "EpisodeTitle")]
    pub episode_title: Option<String>,
    #[serde(rename = "Synopsis")]
    pub synopsis: Option<String>,
    #[serde(rename = "StartTime", default)]
    pub start_time: i64,
    #[serde(rename = "EndTime", default)]
    pub end_time: i64,
    #[serde(rename = "OriginalAirdate")]
    pub original_airdate: Option<i64>,
    #[serde(rename = "ImageURL")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudRule {
    #[serde(rename = "RecordingRuleID", default)]
    pub recording_rule_id: String,
    #[serde(rename = "SeriesID", default)]
    pub series_id: String,
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Synopsis")]
    pub synopsis: Option<String>,
    #[serde(rename = "ImageURL")]
    pub image_url: Option<String>,
    #[serde(rename = "ChannelOnly")]
    pub channel_only: Option<String>,
    #[serde(rename = "TeamOnly")]
    pub team_only: Option<String>,
    #[serde(rename = "RecentOnly", default)]
    pub recent_only: u8,
    #[serde(rename = "AfterOriginalAirdateOnly")]
    pub after_original_airdate_only: Option<i64>,
    #[serde(rename = "DateTimeOnly")]
    pub datetime_only: Option<i64>,
    #[serde(rename = "Priority", default)]
    pub priority: i64,
    #[serde(rename = "StartPadding", default)]
    pub start_padding: i64,
    #[serde(rename = "EndPadding", default)]
    pub end_padding: i64,
}

/// Rule mutation request as accepted on our own surface. Field names match
/// the vendor's casing so clients can pass rule fields through unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleRequest {
    #[serde(rename = "SeriesID", default)]
    pub series_id: String,
    #[serde(rename = "RecordingRuleID")]
    pub recording_rule_id: Option<String>,
    #[serde(rename = "ChannelOnly")]
    pub channel_only: Option<String>,
    #[serde(rename = "TeamOnly")]
    pub team_only: Option<String>,
    #[serde(rename = "RecentOnly")]
    pub recent_only: Option<bool>,
    #[serde(rename = "AfterOriginalAirdateOnly")]
    pub after_original_airdate_only: Option<i64>,
    #[serde(rename = "DateTimeOnly")]
    pub datetime_only: Option<i64>,
    #[serde(rename = "Priority")]
    pub priority: Option<i64>,
    #[serde(rename = "StartPadding")]
    pub start_padding: Option<i64>,
    #[serde(rename = "EndPadding")]
    pub end_padding: Option<i64>,
    #[serde(rename = "AfterRecordingRuleID")]
    pub after_recording_rule_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RuleRecord {
    pub rule_id: String,
    pub series_id: String,
    pub title: String,
    pub synopsis: Option<String>,
    pub image_url: Option<String>,
    pub channel_only: Option<String>,
    pub team_only: Option<String>,
    pub recent_only: bool,
    pub after_original_airdate: Option<i64>,
    pub datetime_only: Option<i64>,
    pub priority: i64,
    pub start_padding: i64,
    pub end_padding: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProgramView {
    pub guide_number: String,
    pub guide_name: String,
    pub series_id: String,
    pub title: String,
    pub episode_title: Option<String>,
    pub synopsis: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuideChannelView {
    pub guide_number: String,
    pub guide_name: String,
    pub image_url: Option<String>,
    pub programs: Vec<ProgramView>,
}

/// Local broker for the cloud guide and recording rules. Guide data is a
/// read-mostly cache; rules live authoritatively in the cloud and the local
/// table reconciles after every mutation.
pub struct GuidePlane {
    pool: SqlitePool,
    registry: Arc<DeviceRegistry>,
    appliance_client: ApplianceClient,
    http: reqwest::Client,
    config: GuideConfig,
    cached_auth: Mutex<Option<String>>,
}

fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl GuidePlane {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<DeviceRegistry>,
        appliance_client: ApplianceClient,
        config: GuideConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry,
            appliance_client,
            http: reqwest::Client::new(),
            config,
            cached_auth: Mutex::new(None),
        })
    }

    async fn device_auth(&self) -> Result<String> {
        {
            let cached = self.cached_auth.lock().await;
            if let Some(token) = cached.as_ref() {
                return Ok(token.clone());
            }
        }
        for appliance in self.registry.online().await {
            if !appliance.device_auth.is_empty() {
                let mut cached = self.cached_auth.lock().await;
                *cached = Some(appliance.device_auth.clone());
                return Ok(appliance.device_auth);
            }
        }
        Err(ApiError::AuthExpired)
    }

    /// Pull a fresh DeviceAuth straight from an appliance and persist it.
    async fn refresh_auth(&self) -> Result<String> {
        for appliance in self.registry.online().await {
            match self.appliance_client.discover(&appliance.ip).await {
                Ok(desc) if !desc.device_auth.is_empty() => {
                    let token = desc.device_auth;
                    let _ = sqlx::query("UPDATE devices SET device_auth = ? WHERE device_id = ?")
                        .bind(&token)
                        .bind(&appliance.device_id)
                        .execute(&self.pool)
                        .await;
                    let mut cached = self.cached_auth.lock().await;
                    *cached = Some(token.clone());
                    info!("device auth refreshed from {}", appliance.device_id);
                    return Ok(token);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("auth refresh via {} failed: {}", appliance.device_id, e);
                }
            }
        }
        Err(ApiError::AuthExpired)
    }

    /// Issue a cloud call; on 403, refresh the token and retry exactly once.
    async fn cloud_call<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.device_auth().await?;
        let resp = build(&token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("cloud", &e))?;
        if resp.status() != reqwest::StatusCode::FORBIDDEN {
            return check_cloud_status(resp);
        }

        debug!("cloud returned 403, refreshing device auth");
        let token = self.refresh_auth().await?;
        let retry = build(&token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("cloud", &e))?;
        if retry.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(ApiError::AuthExpired);
        }
        check_cloud_status(retry)
    }

    /// Fetch a guide window from the cloud and append it to the cache.
    pub async fn refresh_guide(&self, start: Option<i64>, duration_hours: Option<u32>) -> Result<usize> {
        let start = start.unwrap_or_else(now_epoch_secs).to_string();
        // The vendor serves at most 24 hours per request.
        let duration = duration_hours.unwrap_or(24).min(24).to_string();
        let url = format!("{}/guide", self.config.cloud_base_url.trim_end_matches('/'));
        let resp = self
            .cloud_call(|token| {
                self.http.get(&url).query(&[
                    ("DeviceAuth", token),
                    ("Start", start.as_str()),
                    ("Duration", duration.as_str()),
                ])
            })
            .await?;
        let channels: Vec<CloudGuideChannel> = resp
            .json()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("guide parse: {e}")))?;
        let stored = self.store_guide_channels(&channels).await?;
        info!(
            "guide refreshed: {} channel(s), {} new program(s)",
            channels.len(),
            stored
        );
        Ok(stored)
    }

    /// Append programs under their `(channel, series, start)` natural key.
    /// Re-fetched windows collide on the key and are ignored, so the table
    /// only ever grows forward.
    pub async fn store_guide_channels(&self, channels: &[CloudGuideChannel]) -> Result<usize> {
        let now = now_epoch_secs();
        let mut inserted = 0usize;
        for channel in channels {
            let channel_row: i64 = sqlx::query(
                r#"
                INSERT INTO guide_channels (guide_number, guide_name, image_url, last_updated)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (guide_number) DO UPDATE SET
                    guide_name = excluded.guide_name,
                    image_url = COALESCE(excluded.image_url, guide_channels.image_url),
                    last_updated = excluded.last_updated
                RETURNING id
                "#,
            )
            .bind(&channel.guide_number)
            .bind(&channel.guide_name)
            .bind(&channel.image_url)
            .bind(now)
            .fetch_one(&self.pool)
            .await?
            .get(0);

            for program in &channel.programs {
                let result = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO guide_programs
                        (channel_id, series_id, title, episode_title, synopsis,
                         start_time, end_time, original_airdate, image_url)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(channel_row)
                .bind(&program.series_id)
                .bind(&program.title)
                .bind(&program.episode_title)
                .bind(&program.synopsis)
                .bind(program.start_time)
                .bind(program.end_time)
                .bind(program.original_airdate)
                .bind(&program.image_url)
                .execute(&self.pool)
                .await?;
                inserted += result.rows_affected() as usize;
            }
        }
        Ok(inserted)
    }

    /// Refresh first when the cache is stale. Reads go through here.
    pub async fn ensure_fresh(&self) -> Result<()> {
        let newest: Option<i64> = sqlx::query("SELECT MAX(last_updated) FROM guide_channels")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let stale = match newest {
            Some(ts) => ts < now_epoch_secs() - self.config.freshness_window as i64,
            None => true,
        };
        if stale {
            if let Err(e) = self.refresh_guide(None, None).await {
                warn!("guide refresh failed, serving cached data: {}", e);
            }
        }
        Ok(())
    }

    /// Programs overlapping the next 24 hours, grouped by channel.
    pub async fn guide_window(&self) -> Result<Vec<GuideChannelView>> {
        let now = now_epoch_secs();
        self.grouped_programs(
            r#"
            SELECT c.guide_number, c.guide_name, p.series_id, p.title, p.episode_title,
                   p.synopsis, p.start_time, p.end_time, p.image_url
            FROM guide_programs p JOIN guide_channels c ON c.id = p.channel_id
            WHERE p.end_time > ? AND p.start_time < ?
            ORDER BY c.guide_number, p.start_time
            "#,
            &[now, now + 24 * 3600],
        )
        .await
    }

    /// Substring search across titles and synopses, seven days forward.
    pub async fn search(
        &self,
        query: &str,
        channel: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ProgramView>> {
        if query.is_empty() {
            return Err(ApiError::InvalidArgument("query must not be empty".to_string()));
        }
        let now = now_epoch_secs();
        let pattern = format!("%{query}%");
        let rows = sqlx::query_as::<_, ProgramView>(
            r#"
            SELECT c.guide_number, c.guide_name, p.series_id, p.title, p.episode_title,
                   p.synopsis, p.start_time, p.end_time, p.image_url
            FROM guide_programs p JOIN guide_channels c ON c.id = p.channel_id
            WHERE p.end_time > ? AND p.start_time < ?
              AND (p.title LIKE ? OR p.episode_title LIKE ? OR p.synopsis LIKE ?)
              AND (? IS NULL OR c.guide_number = ?)
            ORDER BY p.start_time
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(now + 7 * 24 * 3600)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(channel)
        .bind(channel)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// What is on right now: `start <= now < end`.
    pub async fn now_playing(&self) -> Result<Vec<ProgramView>> {
        let now = now_epoch_secs();
        let rows = sqlx::query_as::<_, ProgramView>(
            r#"
            SELECT c.guide_number, c.guide_name, p.series_id, p.title, p.episode_title,
                   p.synopsis, p.start_time, p.end_time, p.image_url
            FROM guide_programs p JOIN guide_channels c ON c.id = p.channel_id
            WHERE p.start_time <= ? AND p.end_time > ?
            ORDER BY c.guide_number
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn grouped_programs(&self, sql: &str, binds: &[i64]) -> Result<Vec<GuideChannelView>> {
        let mut query = sqlx::query_as::<_, ProgramView>(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out: Vec<GuideChannelView> = Vec::new();
        for row in rows {
            match out.last_mut() {
                Some(current) if current.guide_number == row.guide_number => {
                    current.programs.push(row);
                }
                _ => out.push(GuideChannelView {
                    guide_number: row.guide_number.clone(),
                    guide_name: row.guide_name.clone(),
                    image_url: None,
                    programs: vec![row],
                }),
            }
        }
        Ok(out)
    }

    pub async fn list_rules(&self) -> Result<Vec<RuleRecord>> {
        let url = format!(
            "{}/recording_rules",
            self.config.cloud_base_url.trim_end_matches('/')
        );
        let resp = self
            .cloud_call(|token| self.http.get(&url).query(&[("DeviceAuth", token)]))
            .await?;
        let rules: Option<Vec<CloudRule>> = resp
            .json()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("rules parse: {e}")))?;
        let rules = rules.unwrap_or_default();
        self.reconcile_rules(&rules).await?;
        self.local_rules().await
    }

    pub async fn local_rules(&self) -> Result<Vec<RuleRecord>> {
        let rows = sqlx::query_as::<_, RuleRecord>(
            r#"
            SELECT rule_id, series_id, title, synopsis, image_url, channel_only, team_only,
                   recent_only, after_original_airdate, datetime_only, priority,
                   start_padding, end_padding
            FROM recording_rules ORDER BY priority, rule_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Full replace of the local cache against the cloud's rule list.
    pub async fn reconcile_rules(&self, rules: &[CloudRule]) -> Result<()> {
        let ids: Vec<String> = rules.iter().map(|r| r.recording_rule_id.clone()).collect();
        let existing = sqlx::query("SELECT rule_id FROM recording_rules")
            .fetch_all(&self.pool)
            .await?;
        for row in existing {
            let rule_id: String = row.get(0);
            if !ids.contains(&rule_id) {
                sqlx::query("DELETE FROM recording_rules WHERE rule_id = ?")
                    .bind(&rule_id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        for rule in rules {
            sqlx::query(
                r#"
                INSERT INTO recording_rules
                    (rule_id, series_id, title, synopsis, image_url, channel_only, team_only,
                     recent_only, after_original_airdate, datetime_only, priority,
                     start_padding, end_padding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (rule_id) DO UPDATE SET
                    series_id = excluded.series_id,
                    title = excluded.title,
                    synopsis = excluded.synopsis,
                    image_url = excluded.image_url,
                    channel_only = excluded.channel_only,
                    team_only = excluded.team_only,
                    recent_only = excluded.recent_only,
                    after_original_airdate = excluded.after_original_airdate,
                    datetime_only = excluded.datetime_only,
                    priority = excluded.priority,
                    start_padding = excluded.start_padding,
                    end_padding = excluded.end_padding
                "#,
            )
            .bind(&rule.recording_rule_id)
            .bind(&rule.series_id)
            .bind(&rule.title)
            .bind(&rule.synopsis)
            .bind(&rule.image_url)
            .bind(&rule.channel_only)
            .bind(&rule.team_only)
            .bind(rule.recent_only == 1)
            .bind(rule.after_original_airdate_only)
            .bind(rule.datetime_only)
            .bind(rule.priority)
            .bind(rule.start_padding)
            .bind(rule.end_padding)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn add_rule(&self, request: &RuleRequest) -> Result<Vec<RuleRecord>> {
        if request.series_id.is_empty() {
            return Err(ApiError::InvalidArgument("SeriesID is required".to_string()));
        }
        self.mutate_rule("add", request).await?;
        self.fan_out_sync().await;
        self.list_rules().await
    }

    pub async fn change_rule(&self, request: &RuleRequest) -> Result<Vec<RuleRecord>> {
        if request.recording_rule_id.is_none() {
            return Err(ApiError::InvalidArgument(
                "RecordingRuleID is required".to_string(),
            ));
        }
        self.mutate_rule("change", request).await?;
        self.fan_out_sync().await;
        self.list_rules().await
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        let request = RuleRequest {
            recording_rule_id: Some(rule_id.to_string()),
            ..RuleRequest::default()
        };
        self.mutate_rule("delete", &request).await?;
        self.fan_out_sync().await;
        sqlx::query("DELETE FROM recording_rules WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mutate_rule(&self, cmd: &str, request: &RuleRequest) -> Result<()> {
        let url = format!(
            "{}/recording_rules",
            self.config.cloud_base_url.trim_end_matches('/')
        );
        let resp = self
            .cloud_call(|token| {
                let mut form: Vec<(&str, String)> = vec![
                    ("DeviceAuth", token.to_string()),
                    ("Cmd", cmd.to_string()),
                ];
                if !request.series_id.is_empty() {
                    form.push(("SeriesID", request.series_id.clone()));
                }
                if let Some(v) = &request.recording_rule_id {
                    form.push(("RecordingRuleID", v.clone()));
                }
                if let Some(v) = &request.channel_only {
                    form.push(("ChannelOnly", v.clone()));
                }
                if let Some(v) = &request.team_only {
                    form.push(("TeamOnly", v.clone()));
                }
                if let Some(v) = request.recent_only {
                    form.push(("RecentOnly", if v { "1" } else { "0" }.to_string()));
                }
                if let Some(v) = request.after_original_airdate_only {
                    form.push(("AfterOriginalAirdateOnly", v.to_string()));
                }
                if let Some(v) = request.datetime_only {
                    form.push(("DateTimeOnly", v.to_string()));
                }
                if let Some(v) = request.priority {
                    form.push(("Priority", v.to_string()));
                }
                if let Some(v) = request.start_padding {
                    form.push(("StartPadding", v.to_string()));
                }
                if let Some(v) = request.end_padding {
                    form.push(("EndPadding", v.to_string()));
                }
                if let Some(v) = &request.after_recording_rule_id {
                    form.push(("AfterRecordingRuleID", v.clone()));
                }
                self.http.post(&url).form(&form)
            })
            .await?;
        debug!("rule {} accepted by cloud: HTTP {}", cmd, resp.status());
        Ok(())
    }

    /// Tell every known appliance to re-pull its rules, in parallel and
    /// best-effort.
    async fn fan_out_sync(&self) {
        let appliances = self.registry.online().await;
        let tasks: Vec<_> = appliances
            .into_iter()
            .map(|appliance| {
                let client = self.appliance_client.clone();
                async move {
                    if let Err(e) = client.trigger_rule_sync(&appliance).await {
                        warn!(
                            "rule sync fan-out failed: device={} err={}",
                            appliance.device_id, e
                        );
                    }
                }
            })
            .collect();
        futures::future::join_all(tasks).await;
    }

    pub async fn run_refresh_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.refresh_interval);
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.refresh_guide(None, None).await {
                warn!("periodic guide refresh failed: {}", e);
            }
        }
    }
}

fn check_cloud_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(ApiError::UpstreamUnavailable(format!("cloud returned HTTP {status}")))
    }
}
