use crate::config::TranscodingConfig;
use crate::error::{ApiError, Result};
use crate::metrics::ACTIVE_TRANSCODES;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

pub const PLAYLIST_NAME: &str = "stream.m3u8";
pub const SIDECAR_NAME: &str = "transcode.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeState {
    Pending,
    Transcoding,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeMode {
    /// A viewer is waiting. May evict the oldest running job when the
    /// engine is at capacity.
    Interactive,
    /// Backfill. Never evicts; the driver retries when capacity frees up.
    Bulk,
}

/// Catalog details baked into the sidecar so the cache directory remains
/// self-describing across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeMeta {
    pub show_name: Option<String>,
    pub episode_name: Option<String>,
    pub air_date: Option<i64>,
}

/// Durable per-directory state, `transcode.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    pub state: TranscodeState,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscodeStatus {
    pub state: TranscodeState,
    /// Seconds of output materialized so far.
    pub progress: u64,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Job {
    state: TranscodeState,
    start_time: i64,
    end_time: Option<i64>,
    output_dir: PathBuf,
    upstream_url: String,
    meta: EpisodeMeta,
    error: Option<String>,
    stop: Option<watch::Sender<bool>>,
    token: u64,
}

#[derive(Default)]
struct JobsTable {
    jobs: HashMap<i64, Job>,
    /// Episode ids currently transcoding, enqueue order. Front is the
    /// eviction victim.
    active: Vec<i64>,
}

struct Inner {
    table: Mutex<JobsTable>,
    config: TranscodingConfig,
    token_counter: AtomicU64,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct TranscodeEngine {
    inner: Arc<Inner>,
}

fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Only the playlist and 4-digit segment names may be served or created.
pub fn valid_artifact_name(name: &str) -> bool {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return false;
    }
    if name == PLAYLIST_NAME {
        return true;
    }
    if let Some(digits) = name
        .strip_prefix("segment")
        .and_then(|rest| rest.strip_suffix(".ts"))
    {
        return digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit());
    }
    false
}

pub fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else {
        "video/mp2t"
    }
}

async fn write_sidecar(dir: &Path, sidecar: &Sidecar) -> Result<()> {
    let body = serde_json::to_vec_pretty(sidecar)?;
    let tmp = dir.join(format!("{SIDECAR_NAME}.tmp"));
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, dir.join(SIDECAR_NAME)).await?;
    Ok(())
}

async fn read_sidecar(dir: &Path) -> Option<Sidecar> {
    let bytes = tokio::fs::read(dir.join(SIDECAR_NAME)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

impl TranscodeEngine {
    /// Create the engine, recovering durable state from the cache root:
    /// abandoned `Transcoding` directories are deleted, finished ones are
    /// re-registered so playback needs no re-transcode.
    pub async fn new(config: TranscodingConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.cache_dir).await?;
        let engine = Self {
            inner: Arc::new(Inner {
                table: Mutex::new(JobsTable::default()),
                config,
                token_counter: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        };
        engine.recover().await?;
        Ok(engine)
    }

    pub fn output_dir(&self, episode_id: i64) -> PathBuf {
        self.inner.config.cache_dir.join(episode_id.to_string())
    }

    async fn recover(&self) -> Result<()> {
        let mut recovered = 0usize;
        let mut abandoned = 0usize;
        let mut entries = tokio::fs::read_dir(&self.inner.config.cache_dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(episode_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            let Some(sidecar) = read_sidecar(&path).await else {
                continue;
            };
            match sidecar.state {
                TranscodeState::Transcoding => {
                    // No process survived the restart; the directory is a
                    // half-written artifact.
                    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                        warn!("recovery: failed to remove {}: {}", path.display(), e);
                    }
                    abandoned += 1;
                }
                TranscodeState::Complete => {
                    if tokio::fs::metadata(path.join(PLAYLIST_NAME)).await.is_ok() {
                        let mut table = self.inner.table.lock().await;
                        table.jobs.insert(
                            episode_id,
                            Job {
                                state: TranscodeState::Complete,
                                start_time: sidecar.start_time,
                                end_time: sidecar.end_time,
                                output_dir: path.clone(),
                                upstream_url: sidecar.source_url.clone(),
                                meta: EpisodeMeta {
                                    show_name: sidecar.show_name.clone(),
                                    episode_name: sidecar.episode_name.clone(),
                                    air_date: sidecar.air_date,
                                },
                                error: None,
                                stop: None,
                                token: 0,
                            },
                        );
                        recovered += 1;
                    }
                }
                _ => {}
            }
        }
        info!(
            "transcode cache recovered: {} complete, {} abandoned",
            recovered, abandoned
        );
        Ok(())
    }

    /// Idempotent start. At most one child process per episode; a Complete
    /// or Transcoding entry short-circuits to its directory.
    pub async fn start_transcode(
        &self,
        episode_id: i64,
        upstream_url: &str,
        mode: TranscodeMode,
        meta: EpisodeMeta,
    ) -> Result<PathBuf> {
        let output_dir = self.output_dir(episode_id);

        let (token, stop_rx) = {
            let mut table = self.inner.table.lock().await;
            if let Some(job) = table.jobs.get(&episode_id) {
                match job.state {
                    TranscodeState::Complete | TranscodeState::Transcoding => {
                        return Ok(job.output_dir.clone());
                    }
                    _ => {}
                }
            }

            if table.active.len() >= self.inner.config.max_concurrent_transcodes {
                match mode {
                    TranscodeMode::Bulk => {
                        // The bulk driver owns retry; it only sees this on a
                        // capacity race.
                        return Ok(output_dir);
                    }
                    TranscodeMode::Interactive => {
                        if let Some(victim) = table.active.first().copied() {
                            info!(
                                "transcode capacity reached, evicting oldest: episode={}",
                                victim
                            );
                            self.evict_locked(&mut table, victim).await;
                        }
                    }
                }
            }

            let token = self.inner.token_counter.fetch_add(1, Ordering::Relaxed);
            let (stop_tx, stop_rx) = watch::channel(false);
            table.jobs.insert(
                episode_id,
                Job {
                    state: TranscodeState::Transcoding,
                    start_time: now_epoch_secs(),
                    end_time: None,
                    output_dir: output_dir.clone(),
                    upstream_url: upstream_url.to_string(),
                    meta: meta.clone(),
                    error: None,
                    stop: Some(stop_tx),
                    token,
                },
            );
            table.active.push(episode_id);
            ACTIVE_TRANSCODES.set(table.active.len() as f64);
            (token, stop_rx)
        };

        if let Err(e) = self.launch(episode_id, token, &output_dir, upstream_url, &meta, stop_rx).await {
            self.fail_job(episode_id, token, format!("failed to start: {e}")).await;
            return Err(e);
        }

        // The playlist appearing is the signal the transcoder is actually
        // producing output.
        let wait = Duration::from_secs(self.inner.config.playlist_wait);
        if !wait_for_file(&output_dir.join(PLAYLIST_NAME), wait).await {
            // The job stays flagged Transcoding; the child may still come
            // up late, and the cleanup sweep owns abandoned directories.
            return Err(ApiError::TranscodeStartupTimeout(
                self.inner.config.playlist_wait,
            ));
        }
        Ok(output_dir)
    }

    async fn launch(
        &self,
        episode_id: i64,
        token: u64,
        output_dir: &Path,
        upstream_url: &str,
        meta: &EpisodeMeta,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(output_dir).await?;
        write_sidecar(
            output_dir,
            &Sidecar {
                state: TranscodeState::Transcoding,
                start_time: now_epoch_secs(),
                end_time: None,
                source_url: upstream_url.to_string(),
                show_name: meta.show_name.clone(),
                episode_name: meta.episode_name.clone(),
                air_date: meta.air_date,
                error: None,
                stderr_tail: None,
            },
        )
        .await?;

        let args = recorded_transcode_args(
            upstream_url,
            self.inner.config.segment_duration,
            output_dir,
        );
        debug!("spawning transcoder: episode={} args={:?}", episode_id, args);
        let child = Command::new(&self.inner.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ApiError::TranscoderFailed(format!("spawn: {e}")))?;

        if let Some(pid) = child.id() {
            info!("transcoder spawned: episode={} pid={}", episode_id, pid);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_child(inner, episode_id, token, child, stop_rx).await;
        });
        Ok(())
    }

    async fn fail_job(&self, episode_id: i64, token: u64, message: String) {
        let mut table = self.inner.table.lock().await;
        if let Some(job) = table.jobs.get_mut(&episode_id) {
            if job.token == token {
                job.state = TranscodeState::Error;
                job.end_time = Some(now_epoch_secs());
                job.error = Some(message);
                job.stop = None;
            }
        }
        table.active.retain(|id| *id != episode_id);
        ACTIVE_TRANSCODES.set(table.active.len() as f64);
    }

    /// Terminate and forget a running job and delete its directory. Caller
    /// holds the table lock.
    async fn evict_locked(&self, table: &mut JobsTable, episode_id: i64) {
        if let Some(job) = table.jobs.remove(&episode_id) {
            if let Some(stop) = job.stop {
                let _ = stop.send(true);
            }
            table.active.retain(|id| *id != episode_id);
            ACTIVE_TRANSCODES.set(table.active.len() as f64);
            if let Err(e) = tokio::fs::remove_dir_all(&job.output_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("evict: failed to remove {}: {}", job.output_dir.display(), e);
                }
            }
        }
    }

    /// Serve one artifact. While the transcode runs, a not-yet-written file
    /// is polled for a bounded window so players that race the transcoder
    /// still get their segment.
    pub async fn serve_file(&self, episode_id: i64, filename: &str) -> Result<(Vec<u8>, &'static str)> {
        if !valid_artifact_name(filename) {
            return Err(ApiError::InvalidArgument(format!(
                "illegal artifact name: {filename}"
            )));
        }

        let (dir, state) = {
            let table = self.inner.table.lock().await;
            match table.jobs.get(&episode_id) {
                Some(job) => (job.output_dir.clone(), job.state),
                None => {
                    return Err(ApiError::NotFound(format!(
                        "no transcode for episode {episode_id}"
                    )))
                }
            }
        };

        let path = dir.join(filename);
        if let Ok(bytes) = tokio::fs::read(&path).await {
            return Ok((bytes, content_type_for(filename)));
        }

        if state == TranscodeState::Transcoding {
            let deadline =
                tokio::time::Instant::now() + Duration::from_secs(self.inner.config.segment_wait);
            while tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if let Ok(bytes) = tokio::fs::read(&path).await {
                    return Ok((bytes, content_type_for(filename)));
                }
            }
        }

        let state = self
            .job_state(episode_id)
            .await
            .unwrap_or(TranscodeState::Pending);
        Err(ApiError::NotFound(format!(
            "{filename} not available (state {state:?})"
        )))
    }

    pub async fn status(&self, episode_id: i64) -> Result<TranscodeStatus> {
        let (state, start_time, end_time, error, dir) = {
            let table = self.inner.table.lock().await;
            match table.jobs.get(&episode_id) {
                Some(job) => (
                    job.state,
                    job.start_time,
                    job.end_time,
                    job.error.clone(),
                    job.output_dir.clone(),
                ),
                None => {
                    return Err(ApiError::NotFound(format!(
                        "no transcode for episode {episode_id}"
                    )))
                }
            }
        };
        let progress =
            count_segments(&dir).await * self.inner.config.segment_duration as u64;
        Ok(TranscodeStatus {
            state,
            progress,
            start_time,
            end_time,
            error,
        })
    }

    pub async fn job_state(&self, episode_id: i64) -> Option<TranscodeState> {
        self.inner
            .table
            .lock()
            .await
            .jobs
            .get(&episode_id)
            .map(|j| j.state)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.table.lock().await.active.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.config.max_concurrent_transcodes
    }

    /// Remove a transcode: stop a running child, forget the job, delete the
    /// directory. Safe to call for ids that were never transcoded.
    pub async fn delete_transcode(&self, episode_id: i64) -> Result<bool> {
        let dir = {
            let mut table = self.inner.table.lock().await;
            let existed = table.jobs.remove(&episode_id);
            table.active.retain(|id| *id != episode_id);
            ACTIVE_TRANSCODES.set(table.active.len() as f64);
            match existed {
                Some(job) => {
                    if let Some(stop) = job.stop {
                        let _ = stop.send(true);
                    }
                    job.output_dir
                }
                None => self.output_dir(episode_id),
            }
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Retention: directories untouched for longer than `max_cache_age` are
    /// deleted through the same path a manual delete takes.
    pub async fn cleanup_sweep(&self) {
        let max_age = Duration::from_secs(self.inner.config.max_cache_age);
        let mut entries = match tokio::fs::read_dir(&self.inner.config.cache_dir).await {
            Ok(e) => e,
            Err(e) => {
                warn!("cleanup: cannot read cache root: {}", e);
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let age = match entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .map(|t| t.elapsed().unwrap_or_default())
            {
                Ok(age) => age,
                Err(_) => continue,
            };
            if age <= max_age {
                continue;
            }
            match path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<i64>().ok())
            {
                Some(episode_id) => {
                    info!("cleanup: removing stale transcode: episode={}", episode_id);
                    if let Err(e) = self.delete_transcode(episode_id).await {
                        warn!("cleanup: delete failed: episode={} err={}", episode_id, e);
                    }
                }
                None => {
                    let _ = tokio::fs::remove_dir_all(&path).await;
                }
            }
        }
    }

    pub async fn run_cleanup_loop(self) {
        let interval = Duration::from_secs(self.inner.config.cleanup_interval);
        loop {
            tokio::time::sleep(interval).await;
            self.cleanup_sweep().await;
        }
    }

    /// Kill all children. Sidecars stay as they are; startup recovery treats
    /// the interrupted directories as abandoned.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let table = self.inner.table.lock().await;
        for id in &table.active {
            if let Some(job) = table.jobs.get(id) {
                if let Some(stop) = &job.stop {
                    let _ = stop.send(true);
                }
            }
        }
        info!("transcode engine shut down: {} job(s) terminated", table.active.len());
    }
}

/// Owns the child for one job: drains stderr into a bounded ring, waits for
/// exit, then settles the jobs table and the sidecar.
async fn run_child(
    inner: Arc<Inner>,
    episode_id: i64,
    token: u64,
    mut child: tokio::process::Child,
    mut stop_rx: watch::Receiver<bool>,
) {
    let stderr_ring: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
    if let Some(stderr) = child.stderr.take() {
        let ring = Arc::clone(&stderr_ring);
        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let mut reader = tokio::io::BufReader::new(stderr);
            let mut buffer = String::new();
            while let Ok(n) = reader.read_line(&mut buffer).await {
                if n == 0 {
                    break;
                }
                let line = buffer.trim().to_string();
                {
                    let mut ring = ring.lock().await;
                    if ring.len() >= 50 {
                        ring.pop_front();
                    }
                    ring.push_back(line.clone());
                }
                debug!("transcoder: {}", line);
                buffer.clear();
            }
        });
    }

    let status = tokio::select! {
        _ = stop_rx.changed() => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            info!("transcoder stopped (requested): episode={}", episode_id);
            None
        }
        status = child.wait() => match status {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("transcoder wait() failed: episode={} err={}", episode_id, e);
                None
            }
        },
    };

    let Some(status) = status else { return };
    if inner.shutting_down.load(Ordering::Acquire) {
        return;
    }

    let success = status.success();
    let tail: Vec<String> = stderr_ring.lock().await.iter().cloned().collect();
    if success {
        info!("transcode complete: episode={}", episode_id);
    } else {
        warn!(
            "transcode failed: episode={} status={} last_stderr_lines=\n{}",
            episode_id,
            status,
            tail.join("\n")
        );
    }

    let sidecar = {
        let mut table = inner.table.lock().await;
        let Some(job) = table.jobs.get_mut(&episode_id) else {
            return;
        };
        if job.token != token || job.state != TranscodeState::Transcoding {
            return;
        }
        job.state = if success {
            TranscodeState::Complete
        } else {
            TranscodeState::Error
        };
        job.end_time = Some(now_epoch_secs());
        job.error = if success {
            None
        } else {
            Some(format!("transcoder exited with {status}"))
        };
        job.stop = None;
        let sidecar = Sidecar {
            state: job.state,
            start_time: job.start_time,
            end_time: job.end_time,
            source_url: job.upstream_url.clone(),
            show_name: job.meta.show_name.clone(),
            episode_name: job.meta.episode_name.clone(),
            air_date: job.meta.air_date,
            error: job.error.clone(),
            stderr_tail: if success { None } else { Some(tail) },
        };
        let dir = job.output_dir.clone();
        table.active.retain(|id| *id != episode_id);
        ACTIVE_TRANSCODES.set(table.active.len() as f64);
        (dir, sidecar)
    };

    if let Err(e) = write_sidecar(&sidecar.0, &sidecar.1).await {
        warn!("failed to write sidecar: episode={} err={}", episode_id, e);
    }
}

async fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::fs::metadata(path).await.is_ok() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn count_segments(dir: &Path) -> u64 {
    let mut count = 0u64;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str() {
            if name != PLAYLIST_NAME && valid_artifact_name(name) {
                count += 1;
            }
        }
    }
    count
}

/// Argument vector for the recorded pipeline. Order matters to the
/// transcoder; the playlist path is last.
fn recorded_transcode_args(upstream_url: &str, segment_duration: u32, dir: &Path) -> Vec<String> {
    let segment_pattern = dir.join("segment%04d.ts").to_string_lossy().to_string();
    let playlist = dir.join(PLAYLIST_NAME).to_string_lossy().to_string();
    vec![
        "-i".into(),
        upstream_url.into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-crf".into(),
        "23".into(),
        "-maxrate".into(),
        "5000k".into(),
        "-bufsize".into(),
        "10000k".into(),
        "-g".into(),
        "48".into(),
        "-sc_threshold".into(),
        "0".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-ac".into(),
        "2".into(),
        "-ar".into(),
        "48000".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        segment_duration.to_string(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_flags".into(),
        "append_list".into(),
        "-hls_segment_filename".into(),
        segment_pattern,
        playlist,
    ]
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BulkReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: bool,
}

#[derive(Debug, Clone)]
pub struct BulkItem {
    pub episode_id: i64,
    pub source_url: String,
    pub meta: EpisodeMeta,
}

struct BulkState {
    running: AtomicBool,
    counters: Mutex<BulkReport>,
}

/// Backfill driver: FIFO queue over the engine, never evicting, with
/// aggregate counters. One run at a time.
#[derive(Clone)]
pub struct BulkBackfill {
    engine: TranscodeEngine,
    state: Arc<BulkState>,
}

impl BulkBackfill {
    pub fn new(engine: TranscodeEngine) -> Self {
        Self {
            engine,
            state: Arc::new(BulkState {
                running: AtomicBool::new(false),
                counters: Mutex::new(BulkReport::default()),
            }),
        }
    }

    pub async fn report(&self) -> BulkReport {
        let mut report = *self.state.counters.lock().await;
        report.running = self.state.running.load(Ordering::Acquire);
        report
    }

    /// Kick off a run over `items` in the background. Rejected with `Busy`
    /// while a previous run is still draining.
    pub async fn start(&self, items: Vec<BulkItem>) -> Result<BulkReport> {
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ApiError::Busy("bulk backfill already running".to_string()));
        }

        {
            let mut counters = self.state.counters.lock().await;
            *counters = BulkReport {
                total: items.len(),
                ..BulkReport::default()
            };
        }

        let driver = self.clone();
        tokio::spawn(async move {
            driver.drive(items).await;
            driver.state.running.store(false, Ordering::Release);
            let report = driver.report().await;
            info!(
                "bulk backfill finished: total={} completed={} failed={} skipped={}",
                report.total, report.completed, report.failed, report.skipped
            );
        });
        Ok(self.report().await)
    }

    async fn drive(&self, items: Vec<BulkItem>) {
        let mut queue: VecDeque<BulkItem> = VecDeque::new();
        for item in items {
            if self.engine.job_state(item.episode_id).await == Some(TranscodeState::Complete) {
                self.state.counters.lock().await.skipped += 1;
            } else {
                queue.push_back(item);
            }
        }

        let mut in_flight: Vec<i64> = Vec::new();
        loop {
            // Settle finished jobs first. A job that vanished from the table
            // was evicted by an interactive start; it counts as failed and
            // is not re-enqueued.
            let mut still_running = Vec::new();
            for id in in_flight.drain(..) {
                match self.engine.job_state(id).await {
                    Some(TranscodeState::Transcoding) => still_running.push(id),
                    Some(TranscodeState::Complete) => {
                        self.state.counters.lock().await.completed += 1;
                    }
                    Some(TranscodeState::Error) => {
                        self.state.counters.lock().await.failed += 1;
                    }
                    None | Some(TranscodeState::Pending) => {
                        warn!("bulk job evicted mid-run, counting as failed: episode={}", id);
                        self.state.counters.lock().await.failed += 1;
                    }
                }
            }
            in_flight = still_running;

            if queue.is_empty() && in_flight.is_empty() {
                break;
            }

            if !queue.is_empty() && self.engine.active_count().await < self.engine.max_concurrent()
            {
                let item = queue.pop_front().unwrap();
                match self
                    .engine
                    .start_transcode(
                        item.episode_id,
                        &item.source_url,
                        TranscodeMode::Bulk,
                        item.meta.clone(),
                    )
                    .await
                {
                    Ok(_) => match self.engine.job_state(item.episode_id).await {
                        Some(TranscodeState::Transcoding) => in_flight.push(item.episode_id),
                        Some(TranscodeState::Complete) => {
                            self.state.counters.lock().await.completed += 1;
                        }
                        _ => {
                            // Lost a capacity race; wait for a slot.
                            queue.push_front(item);
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    },
                    Err(e) => {
                        warn!(
                            "bulk start failed: episode={} err={}",
                            item.episode_id, e
                        );
                        self.state.counters.lock().await.failed += 1;
                    }
                }
            } else {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> TranscodingConfig {
        TranscodingConfig {
            cache_dir: dir.to_path_buf(),
            segment_duration: 4,
            cleanup_interval: 3600,
            max_cache_age: 30 * 24 * 3600,
            max_concurrent_transcodes: 2,
            playlist_wait: 2,
            segment_wait: 1,
            ffmpeg_path: "ffmpeg".into(),
        }
    }

    /// A stand-in transcoder: writes the playlist (its last argument) and
    /// then idles like a long encode would.
    #[cfg(unix)]
    fn fake_transcoder(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_artifact_name_validation() {
        assert!(valid_artifact_name("stream.m3u8"));
        assert!(valid_artifact_name("segment0000.ts"));
        assert!(valid_artifact_name("segment9999.ts"));
        assert!(!valid_artifact_name("segment12345.ts"));
        assert!(!valid_artifact_name("segment00.ts"));
        assert!(!valid_artifact_name("../segment0000.ts"));
        assert!(!valid_artifact_name("a/b.ts"));
        assert!(!valid_artifact_name("a\\b.ts"));
        assert!(!valid_artifact_name("index.m3u8"));
        assert!(!valid_artifact_name("segmentabcd.ts"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("stream.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("segment0000.ts"), "video/mp2t");
    }

    #[test]
    fn test_recorded_args_shape() {
        let args = recorded_transcode_args("http://dvr/play", 4, Path::new("/tmp/ep"));
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "http://dvr/play");
        assert_eq!(args.last().unwrap(), "/tmp/ep/stream.m3u8");
        let idx = args.iter().position(|a| a == "-hls_time").unwrap();
        assert_eq!(args[idx + 1], "4");
        assert!(args.contains(&"append_list".to_string()));
        assert!(args.iter().any(|a| a.ends_with("segment%04d.ts")));
    }

    #[tokio::test]
    async fn test_recovery_removes_abandoned_and_registers_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path();

        // Abandoned: sidecar says Transcoding.
        let abandoned = cache.join("41");
        std::fs::create_dir_all(&abandoned).unwrap();
        std::fs::write(
            abandoned.join(SIDECAR_NAME),
            r#"{"state":"transcoding","start_time":1,"source_url":"u"}"#,
        )
        .unwrap();

        // Finished: sidecar Complete plus playlist.
        let complete = cache.join("42");
        std::fs::create_dir_all(&complete).unwrap();
        std::fs::write(
            complete.join(SIDECAR_NAME),
            r#"{"state":"complete","start_time":1,"end_time":2,"source_url":"u"}"#,
        )
        .unwrap();
        std::fs::write(complete.join(PLAYLIST_NAME), "#EXTM3U\n#EXT-X-ENDLIST\n").unwrap();

        // Complete sidecar but the playlist is gone: ignored.
        let broken = cache.join("43");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(
            broken.join(SIDECAR_NAME),
            r#"{"state":"complete","start_time":1,"source_url":"u"}"#,
        )
        .unwrap();

        let engine = TranscodeEngine::new(test_config(cache)).await.unwrap();
        assert!(!cache.join("41").exists());
        assert_eq!(engine.job_state(42).await, Some(TranscodeState::Complete));
        assert_eq!(engine.job_state(43).await, None);
    }

    #[tokio::test]
    async fn test_complete_entry_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path();
        let complete = cache.join("42");
        std::fs::create_dir_all(&complete).unwrap();
        std::fs::write(
            complete.join(SIDECAR_NAME),
            r#"{"state":"complete","start_time":1,"source_url":"u"}"#,
        )
        .unwrap();
        std::fs::write(complete.join(PLAYLIST_NAME), "#EXTM3U\n").unwrap();

        let engine = TranscodeEngine::new(test_config(cache)).await.unwrap();
        // ffmpeg_path is bogus on purpose; a Complete entry must not spawn.
        let dir = engine
            .start_transcode(42, "http://dvr/play", TranscodeMode::Interactive, EpisodeMeta::default())
            .await
            .unwrap();
        assert_eq!(dir, complete);
        assert_eq!(engine.active_count().await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_starts_share_one_job() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.ffmpeg_path = fake_transcoder(
            tmp.path(),
            r#"for last; do :; done; echo '#EXTM3U' > "$last"; sleep 30"#,
        );
        let engine = TranscodeEngine::new(config).await.unwrap();

        let a = engine.clone();
        let b = engine.clone();
        let (ra, rb) = tokio::join!(
            a.start_transcode(7, "http://dvr/p", TranscodeMode::Interactive, EpisodeMeta::default()),
            b.start_transcode(7, "http://dvr/p", TranscodeMode::Interactive, EpisodeMeta::default()),
        );
        assert_eq!(ra.unwrap(), rb.unwrap());
        assert_eq!(engine.active_count().await, 1);
        engine.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interactive_evicts_oldest_and_bulk_does_not() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.max_concurrent_transcodes = 1;
        config.ffmpeg_path = fake_transcoder(
            tmp.path(),
            r#"for last; do :; done; echo '#EXTM3U' > "$last"; sleep 30"#,
        );
        let engine = TranscodeEngine::new(config).await.unwrap();

        engine
            .start_transcode(1, "http://dvr/1", TranscodeMode::Interactive, EpisodeMeta::default())
            .await
            .unwrap();
        assert_eq!(engine.job_state(1).await, Some(TranscodeState::Transcoding));

        // Bulk at capacity: no eviction, episode 1 keeps running.
        engine
            .start_transcode(2, "http://dvr/2", TranscodeMode::Bulk, EpisodeMeta::default())
            .await
            .unwrap();
        assert_eq!(engine.job_state(1).await, Some(TranscodeState::Transcoding));
        assert_eq!(engine.job_state(2).await, None);

        // Interactive at capacity: oldest is evicted and replaced.
        engine
            .start_transcode(3, "http://dvr/3", TranscodeMode::Interactive, EpisodeMeta::default())
            .await
            .unwrap();
        assert_eq!(engine.job_state(1).await, None);
        assert_eq!(engine.job_state(3).await, Some(TranscodeState::Transcoding));
        assert_eq!(engine.active_count().await, 1);
        assert!(!tmp.path().join("1").exists());
        engine.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_settles_job_and_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        // Exits successfully right after producing the playlist.
        config.ffmpeg_path = fake_transcoder(
            tmp.path(),
            r#"for last; do :; done; echo '#EXTM3U' > "$last""#,
        );
        let engine = TranscodeEngine::new(config).await.unwrap();
        engine
            .start_transcode(9, "http://dvr/9", TranscodeMode::Interactive, EpisodeMeta::default())
            .await
            .unwrap();

        let mut state = engine.job_state(9).await;
        for _ in 0..50 {
            if state == Some(TranscodeState::Complete) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            state = engine.job_state(9).await;
        }
        assert_eq!(state, Some(TranscodeState::Complete));
        assert_eq!(engine.active_count().await, 0);

        let sidecar = read_sidecar(&tmp.path().join("9")).await.unwrap();
        assert_eq!(sidecar.state, TranscodeState::Complete);
        assert!(sidecar.end_time.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_child_marks_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.ffmpeg_path = fake_transcoder(
            tmp.path(),
            r#"for last; do :; done; echo '#EXTM3U' > "$last"; echo 'boom' >&2; exit 1"#,
        );
        let engine = TranscodeEngine::new(config).await.unwrap();
        engine
            .start_transcode(9, "http://dvr/9", TranscodeMode::Interactive, EpisodeMeta::default())
            .await
            .unwrap();

        let mut state = engine.job_state(9).await;
        for _ in 0..50 {
            if state == Some(TranscodeState::Error) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            state = engine.job_state(9).await;
        }
        assert_eq!(state, Some(TranscodeState::Error));

        let sidecar = read_sidecar(&tmp.path().join("9")).await.unwrap();
        assert_eq!(sidecar.state, TranscodeState::Error);
        assert!(sidecar
            .stderr_tail
            .unwrap_or_default()
            .iter()
            .any(|l| l.contains("boom")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_timeout_when_no_playlist() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.playlist_wait = 1;
        config.ffmpeg_path = fake_transcoder(tmp.path(), "sleep 30");
        let engine = TranscodeEngine::new(config).await.unwrap();
        let err = engine
            .start_transcode(5, "http://dvr/5", TranscodeMode::Interactive, EpisodeMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::TranscodeStartupTimeout(_)));
        // The job stays flagged; cleanup owns the directory from here.
        assert_eq!(engine.job_state(5).await, Some(TranscodeState::Transcoding));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_file_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = TranscodeEngine::new(test_config(tmp.path())).await.unwrap();
        let err = engine.serve_file(1, "../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
        let err = engine.serve_file(1, "stream.m3u8/..").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_serve_file_from_complete_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path();
        let dir = cache.join("42");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(SIDECAR_NAME),
            r#"{"state":"complete","start_time":1,"source_url":"u"}"#,
        )
        .unwrap();
        std::fs::write(dir.join(PLAYLIST_NAME), "#EXTM3U\n#EXT-X-ENDLIST\n").unwrap();
        std::fs::write(dir.join("segment0000.ts"), vec![0x47; 188]).unwrap();

        let engine = TranscodeEngine::new(test_config(cache)).await.unwrap();
        let (bytes, ct) = engine.serve_file(42, "stream.m3u8").await.unwrap();
        assert_eq!(ct, "application/vnd.apple.mpegurl");
        assert!(String::from_utf8_lossy(&bytes).contains("#EXTM3U"));

        let (bytes, ct) = engine.serve_file(42, "segment0000.ts").await.unwrap();
        assert_eq!(ct, "video/mp2t");
        assert_eq!(bytes.len(), 188);

        let err = engine.serve_file(42, "segment0001.ts").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_transcode_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path();
        let dir = cache.join("42");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(SIDECAR_NAME),
            r#"{"state":"complete","start_time":1,"source_url":"u"}"#,
        )
        .unwrap();
        std::fs::write(dir.join(PLAYLIST_NAME), "#EXTM3U\n").unwrap();

        let engine = TranscodeEngine::new(test_config(cache)).await.unwrap();
        assert!(engine.delete_transcode(42).await.unwrap());
        assert!(!dir.exists());
        assert!(!engine.delete_transcode(42).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bulk_backfill_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();

        // Episode 1 is already complete and must be skipped.
        let done = cache.join("1");
        std::fs::create_dir_all(&done).unwrap();
        std::fs::write(
            done.join(SIDECAR_NAME),
            r#"{"state":"complete","start_time":1,"source_url":"u"}"#,
        )
        .unwrap();
        std::fs::write(done.join(PLAYLIST_NAME), "#EXTM3U\n").unwrap();

        let mut config = test_config(&cache);
        config.max_concurrent_transcodes = 1;
        config.ffmpeg_path = fake_transcoder(
            tmp.path(),
            r#"for last; do :; done; echo '#EXTM3U' > "$last""#,
        );
        let engine = TranscodeEngine::new(config).await.unwrap();
        let bulk = BulkBackfill::new(engine.clone());

        let items: Vec<BulkItem> = (1..=3)
            .map(|id| BulkItem {
                episode_id: id,
                source_url: format!("http://dvr/{id}"),
                meta: EpisodeMeta::default(),
            })
            .collect();
        bulk.start(items).await.unwrap();

        let mut report = bulk.report().await;
        for _ in 0..100 {
            if !report.running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            report = bulk.report().await;
        }
        assert!(!report.running);
        assert_eq!(report.total, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_bulk_rejects_overlapping_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = TranscodeEngine::new(test_config(tmp.path())).await.unwrap();
        let bulk = BulkBackfill::new(engine);
        bulk.state.running.store(true, Ordering::Release);
        let err = bulk.start(Vec::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::Busy(_)));
    }
}
