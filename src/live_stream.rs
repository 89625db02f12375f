use crate::config::LiveConfig;
use crate::error::{ApiError, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

pub const LIVE_PLAYLIST: &str = "playlist.m3u8";

/// Only the playlist and `segment-N.ts` names may be served.
pub fn valid_live_artifact_name(name: &str) -> bool {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return false;
    }
    if name == LIVE_PLAYLIST {
        return true;
    }
    if let Some(digits) = name
        .strip_prefix("segment-")
        .and_then(|rest| rest.strip_suffix(".ts"))
    {
        return !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
    }
    false
}

struct WorkerHandle {
    dir: PathBuf,
    pid: Option<u32>,
    stop: watch::Sender<bool>,
    exited: Arc<AtomicBool>,
    errors: Arc<Mutex<VecDeque<String>>>,
}

struct Inner {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    config: LiveConfig,
}

/// Maintains one transcoder child per tuner, writing a sliding HLS window
/// into the tuner's directory.
#[derive(Clone)]
pub struct LiveWorkers {
    inner: Arc<Inner>,
}

impl LiveWorkers {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                workers: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn dir_for(&self, tuner_id: &str) -> PathBuf {
        self.inner.config.cache_dir.join(tuner_id)
    }

    pub async fn is_running(&self, tuner_id: &str) -> bool {
        let workers = self.inner.workers.lock().await;
        workers
            .get(tuner_id)
            .is_some_and(|w| !w.exited.load(Ordering::Acquire))
    }

    /// Recent error-tagged transcoder output for a tuner.
    pub async fn errors(&self, tuner_id: &str) -> Vec<String> {
        let workers = self.inner.workers.lock().await;
        match workers.get(tuner_id) {
            Some(w) => w.errors.lock().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Spawn the live transcoder for one tuner-to-channel binding and wait
    /// for a non-empty playlist. Returns the child's process id.
    pub async fn start(&self, tuner_id: &str, source_url: &str, channel: &str) -> Result<u32> {
        {
            let workers = self.inner.workers.lock().await;
            if let Some(existing) = workers.get(tuner_id) {
                if !existing.exited.load(Ordering::Acquire) {
                    return Err(ApiError::Conflict(format!(
                        "worker already running for tuner {tuner_id}"
                    )));
                }
            }
        }

        let dir = self.dir_for(tuner_id);
        tokio::fs::create_dir_all(&dir).await?;

        let args = live_transcode_args(source_url, self.inner.config.segment_duration, &dir);
        debug!("spawning live transcoder: tuner={} args={:?}", tuner_id, args);
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ApiError::TranscoderFailed(format!("spawn: {e}")))?;

        let pid = child.id();
        info!(
            "live transcoder spawned: tuner={} channel={} pid={:?}",
            tuner_id, channel, pid
        );

        let errors: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let errors = Arc::clone(&errors);
            let tuner = tuner_id.to_string();
            tokio::spawn(async move {
                use tokio::io::AsyncBufReadExt;
                let mut reader = tokio::io::BufReader::new(stderr);
                let mut buffer = String::new();
                while let Ok(n) = reader.read_line(&mut buffer).await {
                    if n == 0 {
                        break;
                    }
                    let line = buffer.trim().to_string();
                    if line.to_ascii_lowercase().contains("error") {
                        let mut ring = errors.lock().await;
                        if ring.len() >= 20 {
                            ring.pop_front();
                        }
                        ring.push_back(line.clone());
                    }
                    debug!("live transcoder [{}]: {}", tuner, line);
                    buffer.clear();
                }
            });
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let exited = Arc::new(AtomicBool::new(false));
        let handle = WorkerHandle {
            dir: dir.clone(),
            pid,
            stop: stop_tx,
            exited: Arc::clone(&exited),
            errors: Arc::clone(&errors),
        };
        {
            let mut workers = self.inner.workers.lock().await;
            workers.insert(tuner_id.to_string(), handle);
        }

        let tuner = tuner_id.to_string();
        let buffer_window = Duration::from_secs(self.inner.config.buffer_minutes as u64 * 60);
        let prune_dir = dir.clone();
        tokio::spawn(async move {
            supervise_child(child, stop_rx, exited, tuner, prune_dir, buffer_window).await;
        });

        let ok = wait_for_nonempty_file(
            &dir.join(LIVE_PLAYLIST),
            Duration::from_secs(15),
        )
        .await;
        if !ok {
            warn!("live playlist never appeared: tuner={}", tuner_id);
            self.stop(tuner_id).await;
            return Err(ApiError::TranscodeStartupTimeout(15));
        }

        Ok(pid.unwrap_or(0))
    }

    /// Signal the worker to quit (graceful, then killed after a 5 s grace
    /// window by its supervisor) and delete the output directory.
    pub async fn stop(&self, tuner_id: &str) {
        let handle = {
            let mut workers = self.inner.workers.lock().await;
            workers.remove(tuner_id)
        };
        let Some(handle) = handle else { return };
        let _ = handle.stop.send(true);

        // Give the supervisor a moment to bring the child down before the
        // directory goes away underneath it.
        for _ in 0..50 {
            if handle.exited.load(Ordering::Acquire) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&handle.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove live dir {}: {}", handle.dir.display(), e);
            }
        }
        info!("live worker stopped: tuner={} pid={:?}", tuner_id, handle.pid);
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let workers = self.inner.workers.lock().await;
            workers.keys().cloned().collect()
        };
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Poll for the first segment to exist and pass a sanity size, so a
    /// joining player gets real data rather than a header fragment.
    pub async fn wait_for_first_segment(&self, tuner_id: &str, timeout: Duration) -> bool {
        let path = self.dir_for(tuner_id).join("segment-0.ts");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.len() > 10 * 1024 {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Owns the child: on stop, ask the transcoder to quit via stdin and
/// force-kill after 5 s; otherwise record the natural exit. Old segments
/// beyond the buffer window are pruned while the child runs.
async fn supervise_child(
    mut child: tokio::process::Child,
    mut stop_rx: watch::Receiver<bool>,
    exited: Arc<AtomicBool>,
    tuner_id: String,
    dir: PathBuf,
    buffer_window: Duration,
) {
    let mut stdin = child.stdin.take();
    let mut prune_tick = tokio::time::interval(Duration::from_secs(60));
    prune_tick.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if let Some(mut pipe) = stdin.take() {
                    let _ = pipe.write_all(b"q").await;
                    let _ = pipe.flush().await;
                }
                match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                    Ok(Ok(status)) => {
                        info!("live transcoder exited (requested): tuner={} status={}", tuner_id, status);
                    }
                    _ => {
                        warn!("live transcoder did not quit, killing: tuner={}", tuner_id);
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                    }
                }
                break;
            }
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => {
                        info!("live transcoder exited: tuner={} status={}", tuner_id, status);
                    }
                    Ok(status) => {
                        warn!("live transcoder failed: tuner={} status={}", tuner_id, status);
                    }
                    Err(e) => {
                        warn!("live transcoder wait() failed: tuner={} err={}", tuner_id, e);
                    }
                }
                break;
            }
            _ = prune_tick.tick() => {
                prune_old_segments(&dir, buffer_window).await;
            }
        }
    }
    exited.store(true, Ordering::Release);
}

/// The live playlist grows unbounded; the directory is kept to the buffer
/// window by deleting segments older than it.
async fn prune_old_segments(dir: &Path, window: Duration) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("segment-") || !name.ends_with(".ts") {
            continue;
        }
        let stale = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .map(|t| t.elapsed().unwrap_or_default() > window)
            .unwrap_or(false);
        if stale {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

async fn wait_for_nonempty_file(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.len() > 0 {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Live argument vector. Input flags tolerate the corrupt frames and odd
/// timestamps an off-air tuner feed produces; the HLS side writes an
/// append-only event playlist with independent MPEG-TS segments.
fn live_transcode_args(source_url: &str, segment_duration: u32, dir: &Path) -> Vec<String> {
    let segment_pattern = dir.join("segment-%d.ts").to_string_lossy().to_string();
    let playlist = dir.join(LIVE_PLAYLIST).to_string_lossy().to_string();
    vec![
        "-fflags".into(),
        "+discardcorrupt+genpts".into(),
        "-err_detect".into(),
        "ignore_err".into(),
        "-analyzeduration".into(),
        "3000000".into(),
        "-probesize".into(),
        "10000000".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-i".into(),
        source_url.into(),
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
        "append_list+omit_endlist+independent_segments".into(),
        "-hls_segment_type".into(),
        "mpegts".into(),
        "-start_number".into(),
        "0".into(),
        "-muxdelay".into(),
        "0".into(),
        "-muxpreload".into(),
        "0".into(),
        "-hls_segment_filename".into(),
        segment_pattern,
        playlist,
    ]
}
