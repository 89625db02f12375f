use crate::appliance::ApplianceClient;
use crate::config::LiveConfig;
use crate::discovery::DeviceRegistry;
use crate::error::{ApiError, Result};
use crate::live_stream::{valid_live_artifact_name, LiveWorkers, LIVE_PLAYLIST};
use crate::metrics::LIVE_VIEWERS;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunerState {
    Idle,
    Active,
    Cooldown,
    Offline,
}

impl TunerState {
    fn as_str(&self) -> &'static str {
        match self {
            TunerState::Idle => "idle",
            TunerState::Active => "active",
            TunerState::Cooldown => "cooldown",
            TunerState::Offline => "offline",
        }
    }

    fn from_str(s: &str) -> TunerState {
        match s {
            "active" => TunerState::Active,
            "cooldown" => TunerState::Cooldown,
            "offline" => TunerState::Offline,
            _ => TunerState::Idle,
        }
    }
}

#[derive(Debug, Clone)]
struct Tuner {
    device_id: String,
    tuner_index: u32,
    state: TunerState,
    channel: Option<String>,
    viewer_count: usize,
    last_accessed: i64,
}

#[derive(Debug, Clone)]
struct Viewer {
    tuner_id: String,
    channel: String,
    last_heartbeat: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunerRecord {
    pub tuner_id: String,
    pub device_id: String,
    pub tuner_index: u32,
    pub state: TunerState,
    pub channel: Option<String>,
    pub viewer_count: usize,
    pub last_accessed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunerStatusView {
    #[serde(flatten)]
    pub tuner: TunerRecord,
    pub worker_running: bool,
    pub recent_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchResponse {
    pub tuner_id: String,
    pub channel: String,
    pub playlist_url: String,
    pub viewer_count: usize,
}

pub fn tuner_id_for(device_id: &str, tuner_index: u32) -> String {
    format!("{device_id}-tuner-{tuner_index}")
}

#[derive(Default)]
struct Table {
    tuners: HashMap<String, Tuner>,
    viewers: HashMap<String, Viewer>,
}

struct Inner {
    table: Mutex<Table>,
    workers: LiveWorkers,
    client: ApplianceClient,
    registry: Arc<DeviceRegistry>,
    pool: SqlitePool,
    config: LiveConfig,
}

/// Shared pool of live tuners across all appliances. One mutex covers the
/// tuner map and the viewer table; every state transition happens under it.
#[derive(Clone)]
pub struct TunerAllocator {
    inner: Arc<Inner>,
}

fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl TunerAllocator {
    pub fn new(
        workers: LiveWorkers,
        client: ApplianceClient,
        registry: Arc<DeviceRegistry>,
        pool: SqlitePool,
        config: LiveConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                workers,
                client,
                registry,
                pool,
                config,
            }),
        }
    }

    /// Load the mirrored tuner rows. No worker survived the restart, so
    /// anything persisted as active is forced back to idle.
    pub async fn startup_load(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT tuner_id, device_id, tuner_index, state, channel, last_accessed FROM live_tuners",
        )
        .fetch_all(&self.inner.pool)
        .await?;
        let mut table = self.inner.table.lock().await;
        for row in rows {
            let tuner_id: String = row.get(0);
            let state = TunerState::from_str(row.get::<String, _>(3).as_str());
            let (state, channel) = match state {
                TunerState::Active | TunerState::Cooldown => (TunerState::Idle, None),
                other => (other, row.get::<Option<String>, _>(4)),
            };
            table.tuners.insert(
                tuner_id,
                Tuner {
                    device_id: row.get(1),
                    tuner_index: row.get::<i64, _>(2) as u32,
                    state,
                    channel,
                    viewer_count: 0,
                    last_accessed: row.get(5),
                },
            );
        }
        drop(table);
        sqlx::query("UPDATE live_tuners SET state = CASE WHEN state IN ('active','cooldown') THEN 'idle' ELSE state END, viewer_count = 0")
            .execute(&self.inner.pool)
            .await?;
        sqlx::query("DELETE FROM live_viewers")
            .execute(&self.inner.pool)
            .await?;
        Ok(())
    }

    /// Reconcile the pool against the discovery registry: every tuner of an
    /// online appliance gets a slot, tuners of vanished appliances go
    /// offline.
    pub async fn register_appliances(&self) -> Result<()> {
        let appliances = self.inner.registry.list().await;
        let mut table = self.inner.table.lock().await;
        let mut dirty: Vec<String> = Vec::new();

        for appliance in &appliances {
            for index in 0..appliance.tuner_count {
                let id = tuner_id_for(&appliance.device_id, index);
                match table.tuners.get_mut(&id) {
                    Some(tuner) => {
                        if appliance.online && tuner.state == TunerState::Offline {
                            tuner.state = TunerState::Idle;
                            dirty.push(id);
                        } else if !appliance.online && tuner.state != TunerState::Offline {
                            tuner.state = TunerState::Offline;
                            tuner.channel = None;
                            tuner.viewer_count = 0;
                            dirty.push(id);
                        }
                    }
                    None => {
                        table.tuners.insert(
                            id.clone(),
                            Tuner {
                                device_id: appliance.device_id.clone(),
                                tuner_index: index,
                                state: if appliance.online {
                                    TunerState::Idle
                                } else {
                                    TunerState::Offline
                                },
                                channel: None,
                                viewer_count: 0,
                                last_accessed: 0,
                            },
                        );
                        dirty.push(id);
                    }
                }
            }
        }

        for id in &dirty {
            let tuner = table.tuners.get(id).unwrap().clone();
            self.persist_tuner(id, &tuner).await;
        }
        Ok(())
    }

    /// Bind `client_id` to a tuner streaming `channel`, starting a worker
    /// when no running one can be shared.
    pub async fn watch(&self, channel: &str, client_id: &str) -> Result<WatchResponse> {
        if channel.is_empty() || client_id.is_empty() {
            return Err(ApiError::InvalidArgument(
                "channel and clientId are required".to_string(),
            ));
        }

        let mut table = self.inner.table.lock().await;
        let now = now_epoch_secs();

        // A running worker on the same channel is shared, whether it still
        // has viewers or sits in cooldown.
        let reusable = sorted_ids(&table)
            .into_iter()
            .find(|id| {
                let t = &table.tuners[id];
                match t.state {
                    TunerState::Active => {
                        t.channel.as_deref() == Some(channel)
                            && t.viewer_count < self.inner.config.max_viewers_per_tuner
                    }
                    TunerState::Cooldown => t.channel.as_deref() == Some(channel),
                    _ => false,
                }
            });
        if let Some(id) = reusable {
            self.bind_viewer(&mut table, &id, channel, client_id, now).await;
            let tuner = &table.tuners[&id];
            debug!(
                "live watch: shared tuner={} channel={} viewers={}",
                id, channel, tuner.viewer_count
            );
            return Ok(watch_response(&id, tuner));
        }

        // Idle tuners next, deterministic order. The pool's opinion of
        // "idle" is advisory; the appliance gets the last word.
        for id in sorted_ids(&table) {
            let tuner = table.tuners[&id].clone();
            if tuner.state != TunerState::Idle {
                continue;
            }
            let Some(appliance) = self.inner.registry.get(&tuner.device_id).await else {
                continue;
            };
            if !appliance.online {
                continue;
            }
            if !self.inner.client.has_free_tuner(&appliance).await {
                continue;
            }

            let source_url = appliance.tuner_live_url(tuner.tuner_index, channel);
            self.inner.client.probe_live_url(&source_url).await?;
            self.inner.workers.start(&id, &source_url, channel).await?;
            if !self
                .inner
                .workers
                .wait_for_first_segment(&id, Duration::from_secs(10))
                .await
            {
                warn!("live watch: first segment slow to appear: tuner={}", id);
            }

            let t = table.tuners.get_mut(&id).unwrap();
            t.state = TunerState::Active;
            t.channel = Some(channel.to_string());
            t.last_accessed = now;
            self.bind_viewer(&mut table, &id, channel, client_id, now).await;
            let tuner = table.tuners[&id].clone();
            self.persist_tuner(&id, &tuner).await;
            info!("live watch: started tuner={} channel={}", id, channel);
            return Ok(watch_response(&id, &tuner));
        }

        // Cooldown tuners on other channels can be recycled.
        for id in sorted_ids(&table) {
            let tuner = table.tuners[&id].clone();
            if tuner.state != TunerState::Cooldown || tuner.viewer_count != 0 {
                continue;
            }
            let Some(appliance) = self.inner.registry.get(&tuner.device_id).await else {
                continue;
            };
            if !appliance.online || !self.inner.client.has_free_tuner(&appliance).await {
                continue;
            }

            self.inner.workers.stop(&id).await;
            let source_url = appliance.tuner_live_url(tuner.tuner_index, channel);
            if let Err(e) = self.inner.client.probe_live_url(&source_url).await {
                let t = table.tuners.get_mut(&id).unwrap();
                t.state = TunerState::Idle;
                t.channel = None;
                let tuner = t.clone();
                self.persist_tuner(&id, &tuner).await;
                return Err(e);
            }
            self.inner.workers.start(&id, &source_url, channel).await?;

            let t = table.tuners.get_mut(&id).unwrap();
            t.state = TunerState::Active;
            t.channel = Some(channel.to_string());
            t.last_accessed = now;
            self.bind_viewer(&mut table, &id, channel, client_id, now).await;
            let tuner = table.tuners[&id].clone();
            self.persist_tuner(&id, &tuner).await;
            info!("live watch: recycled tuner={} channel={}", id, channel);
            return Ok(watch_response(&id, &tuner));
        }

        Err(ApiError::NoTunersAvailable(format!(
            "no tuner can stream channel {channel}"
        )))
    }

    async fn bind_viewer(
        &self,
        table: &mut Table,
        tuner_id: &str,
        channel: &str,
        client_id: &str,
        now: i64,
    ) {
        // A client re-watching from another tuner moves, never double-counts.
        if let Some(old) = table.viewers.remove(client_id) {
            if old.tuner_id != tuner_id {
                if let Some(old_tuner) = table.tuners.get_mut(&old.tuner_id) {
                    old_tuner.viewer_count = old_tuner.viewer_count.saturating_sub(1);
                }
            }
        }
        table.viewers.insert(
            client_id.to_string(),
            Viewer {
                tuner_id: tuner_id.to_string(),
                channel: channel.to_string(),
                last_heartbeat: now,
            },
        );
        let tuner = table.tuners.get_mut(tuner_id).unwrap();
        tuner.viewer_count = table
            .viewers
            .values()
            .filter(|v| v.tuner_id == tuner_id)
            .count();
        tuner.state = TunerState::Active;
        tuner.last_accessed = now;
        LIVE_VIEWERS
            .with_label_values(&[tuner_id])
            .set(tuner.viewer_count as f64);

        let _ = sqlx::query(
            "INSERT OR REPLACE INTO live_viewers (client_id, tuner_id, channel, last_heartbeat) VALUES (?, ?, ?, ?)",
        )
        .bind(client_id)
        .bind(tuner_id)
        .bind(channel)
        .bind(now)
        .execute(&self.inner.pool)
        .await;
    }

    /// Refresh a viewer's liveness. Returns whether the client was known.
    pub async fn heartbeat(&self, client_id: &str) -> bool {
        let mut table = self.inner.table.lock().await;
        match table.viewers.get_mut(client_id) {
            Some(viewer) => {
                viewer.last_heartbeat = now_epoch_secs();
                true
            }
            None => false,
        }
    }

    pub async fn release(&self, client_id: &str) -> Result<()> {
        let mut table = self.inner.table.lock().await;
        self.release_locked(&mut table, client_id).await
    }

    async fn release_locked(&self, table: &mut Table, client_id: &str) -> Result<()> {
        let viewer = table
            .viewers
            .remove(client_id)
            .ok_or_else(|| ApiError::NotFound(format!("viewer {client_id}")))?;
        let _ = sqlx::query("DELETE FROM live_viewers WHERE client_id = ?")
            .bind(client_id)
            .execute(&self.inner.pool)
            .await;

        if let Some(tuner) = table.tuners.get_mut(&viewer.tuner_id) {
            tuner.viewer_count = tuner.viewer_count.saturating_sub(1);
            LIVE_VIEWERS
                .with_label_values(&[&viewer.tuner_id])
                .set(tuner.viewer_count as f64);
            if tuner.viewer_count == 0 && tuner.state == TunerState::Active {
                tuner.state = TunerState::Cooldown;
                tuner.last_accessed = now_epoch_secs();
                info!("tuner entering cooldown: tuner={}", viewer.tuner_id);
            }
            let tuner = tuner.clone();
            self.persist_tuner(&viewer.tuner_id, &tuner).await;
        }
        Ok(())
    }

    /// Reap viewers whose heartbeats stopped. The threshold is strict:
    /// exactly at the limit survives, strictly beyond does not.
    pub async fn sweep_dead_viewers(&self) {
        let threshold =
            (self.inner.config.client_heartbeat * self.inner.config.missed_heartbeats as u64) as i64;
        let now = now_epoch_secs();
        let mut table = self.inner.table.lock().await;
        let dead: Vec<String> = table
            .viewers
            .iter()
            .filter(|(_, v)| now - v.last_heartbeat > threshold)
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in dead {
            info!("reaping dead viewer: client={}", client_id);
            let _ = self.release_locked(&mut table, &client_id).await;
        }
    }

    /// Stop workers whose cooldown expired and return their tuners to idle.
    pub async fn sweep_idle_tuners(&self) {
        let cooldown = self.inner.config.tuner_cooldown as i64;
        let now = now_epoch_secs();
        let mut table = self.inner.table.lock().await;
        let expired: Vec<String> = table
            .tuners
            .iter()
            .filter(|(_, t)| {
                t.state == TunerState::Cooldown
                    && t.viewer_count == 0
                    && t.last_accessed + cooldown < now
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            info!("cooldown expired, stopping worker: tuner={}", id);
            self.inner.workers.stop(&id).await;
            if let Some(tuner) = table.tuners.get_mut(&id) {
                tuner.state = TunerState::Idle;
                tuner.channel = None;
                let tuner = tuner.clone();
                self.persist_tuner(&id, &tuner).await;
            }
        }
    }

    pub async fn run_viewer_sweep_loop(self) {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.sweep_dead_viewers().await;
        }
    }

    pub async fn run_tuner_sweep_loop(self) {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.sweep_idle_tuners().await;
        }
    }

    pub async fn list_tuners(&self) -> Vec<TunerRecord> {
        let table = self.inner.table.lock().await;
        let mut out: Vec<TunerRecord> = table
            .tuners
            .iter()
            .map(|(id, t)| TunerRecord {
                tuner_id: id.clone(),
                device_id: t.device_id.clone(),
                tuner_index: t.tuner_index,
                state: t.state,
                channel: t.channel.clone(),
                viewer_count: t.viewer_count,
                last_accessed: t.last_accessed,
            })
            .collect();
        out.sort_by(|a, b| {
            a.device_id
                .cmp(&b.device_id)
                .then(a.tuner_index.cmp(&b.tuner_index))
        });
        out
    }

    /// Tuner detail for one pool slot, including worker liveness and the
    /// transcoder's recent error lines.
    pub async fn tuner_status(&self, tuner_id: &str) -> Result<TunerStatusView> {
        let record = {
            let table = self.inner.table.lock().await;
            let tuner = table
                .tuners
                .get(tuner_id)
                .ok_or_else(|| ApiError::NotFound(format!("tuner {tuner_id}")))?;
            TunerRecord {
                tuner_id: tuner_id.to_string(),
                device_id: tuner.device_id.clone(),
                tuner_index: tuner.tuner_index,
                state: tuner.state,
                channel: tuner.channel.clone(),
                viewer_count: tuner.viewer_count,
                last_accessed: tuner.last_accessed,
            }
        };
        Ok(TunerStatusView {
            worker_running: self.inner.workers.is_running(tuner_id).await,
            recent_errors: self.inner.workers.errors(tuner_id).await,
            tuner: record,
        })
    }

    /// Serve one artifact from a tuner's live directory.
    pub async fn serve_live_file(
        &self,
        tuner_id: &str,
        filename: &str,
    ) -> Result<(Vec<u8>, &'static str)> {
        if !valid_live_artifact_name(filename) {
            return Err(ApiError::InvalidArgument(format!(
                "illegal artifact name: {filename}"
            )));
        }
        {
            let table = self.inner.table.lock().await;
            if !table.tuners.contains_key(tuner_id) {
                return Err(ApiError::NotFound(format!("tuner {tuner_id}")));
            }
        }
        let path = self.inner.workers.dir_for(tuner_id).join(filename);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| ApiError::NotFound(format!("{tuner_id}/{filename}")))?;
        let content_type = if filename == LIVE_PLAYLIST {
            "application/vnd.apple.mpegurl"
        } else {
            "video/mp2t"
        };
        Ok((bytes, content_type))
    }

    pub async fn shutdown(&self) {
        self.inner.workers.stop_all().await;
    }

    async fn persist_tuner(&self, tuner_id: &str, tuner: &Tuner) {
        let result = sqlx::query(
            r#"
            INSERT INTO live_tuners (tuner_id, device_id, tuner_index, state, channel, viewer_count, last_accessed)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tuner_id) DO UPDATE SET
                state = excluded.state,
                channel = excluded.channel,
                viewer_count = excluded.viewer_count,
                last_accessed = excluded.last_accessed
            "#,
        )
        .bind(tuner_id)
        .bind(&tuner.device_id)
        .bind(tuner.tuner_index as i64)
        .bind(tuner.state.as_str())
        .bind(&tuner.channel)
        .bind(tuner.viewer_count as i64)
        .bind(tuner.last_accessed)
        .execute(&self.inner.pool)
        .await;
        if let Err(e) = result {
            warn!("tuner mirror write failed: tuner={} err={}", tuner_id, e);
        }
    }

    #[cfg(test)]
    async fn force_tuner(&self, tuner_id: &str, tuner: Tuner) {
        self.inner
            .table
            .lock()
            .await
            .tuners
            .insert(tuner_id.to_string(), tuner);
    }

    #[cfg(test)]
    async fn backdate_heartbeat(&self, client_id: &str, seconds: i64) {
        let mut table = self.inner.table.lock().await;
        if let Some(viewer) = table.viewers.get_mut(client_id) {
            viewer.last_heartbeat -= seconds;
        }
    }

    #[cfg(test)]
    async fn backdate_tuner(&self, tuner_id: &str, seconds: i64) {
        let mut table = self.inner.table.lock().await;
        if let Some(tuner) = table.tuners.get_mut(tuner_id) {
            tuner.last_accessed -= seconds;
        }
    }

    #[cfg(test)]
    async fn tuner_snapshot(&self, tuner_id: &str) -> Option<(TunerState, usize, Option<String>)> {
        let table = self.inner.table.lock().await;
        table
            .tuners
            .get(tuner_id)
            .map(|t| (t.state, t.viewer_count, t.channel.clone()))
    }
}

fn sorted_ids(table: &Table) -> Vec<String> {
    let mut ids: Vec<(String, u32, String)> = table
        .tuners
        .iter()
        .map(|(id, t)| (t.device_id.clone(), t.tuner_index, id.clone()))
        .collect();
    ids.sort();
    ids.into_iter().map(|(_, _, id)| id).collect()
}

fn watch_response(tuner_id: &str, tuner: &Tuner) -> WatchResponse {
    WatchResponse {
        tuner_id: tuner_id.to_string(),
        channel: tuner.channel.clone().unwrap_or_default(),
        playlist_url: format!("/live/{tuner_id}/{LIVE_PLAYLIST}"),
        viewer_count: tuner.viewer_count,
    }
}
