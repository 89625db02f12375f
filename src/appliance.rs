use crate::error::{ApiError, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// An appliance as held by the discovery registry. Address fields come from
/// whichever discovery method observed the device; `device_auth` and the
/// storage fields come from its `discover.json`.
#[derive(Debug, Clone, Serialize)]
pub struct Appliance {
    pub device_id: String,
    pub ip: String,
    pub base_url: String,
    pub friendly_name: String,
    pub model_number: String,
    pub device_auth: String,
    pub tuner_count: u32,
    pub lineup_url: String,
    pub storage_url: Option<String>,
    pub total_space: Option<u64>,
    pub free_space: Option<u64>,
    pub last_seen: i64,
    pub online: bool,
}

impl Appliance {
    pub fn is_dvr(&self) -> bool {
        self.storage_url.is_some()
    }

    /// Live feed URL for a channel on the shared tuner pool.
    pub fn live_url(&self, channel: &str) -> String {
        format!("http://{}:5004/auto/v{}", self.ip, channel)
    }

    /// Live feed URL pinned to one physical tuner.
    pub fn tuner_live_url(&self, tuner_index: u32, channel: &str) -> String {
        format!("http://{}:5004/tuner{}/v{}", self.ip, tuner_index, channel)
    }
}

/// `GET /discover.json` body. The appliance omits storage fields on
/// tuner-only models, and firmware fields have drifted across revisions,
/// so everything beyond the identity core is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverResponse {
    #[serde(rename = "FriendlyName", default)]
    pub friendly_name: String,
    #[serde(rename = "ModelNumber", default)]
    pub model_number: String,
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "FirmwareName", default)]
    pub firmware_name: String,
    #[serde(rename = "FirmwareVersion", default)]
    pub firmware_version: String,
    #[serde(rename = "DeviceAuth", default)]
    pub device_auth: String,
    #[serde(rename = "BaseURL", default)]
    pub base_url: String,
    #[serde(rename = "LineupURL", default)]
    pub lineup_url: String,
    #[serde(rename = "TunerCount", default)]
    pub tuner_count: u32,
    #[serde(rename = "StorageID")]
    pub storage_id: Option<String>,
    #[serde(rename = "StorageURL")]
    pub storage_url: Option<String>,
    #[serde(rename = "TotalSpace")]
    pub total_space: Option<u64>,
    #[serde(rename = "FreeSpace")]
    pub free_space: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineupEntry {
    #[serde(rename = "GuideNumber")]
    pub guide_number: String,
    #[serde(rename = "GuideName")]
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// One row of `GET /status.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TunerStatus {
    #[serde(rename = "Resource", default)]
    pub resource: String,
    #[serde(rename = "InUse")]
    pub in_use: Option<u8>,
    #[serde(rename = "VctNumber")]
    pub vct_number: Option<String>,
    #[serde(rename = "VctName")]
    pub vct_name: Option<String>,
    #[serde(rename = "TargetIP")]
    pub target_ip: Option<String>,
    #[serde(rename = "SignalStrengthPercent")]
    pub signal_strength: Option<u32>,
}

impl TunerStatus {
    pub fn is_in_use(&self) -> bool {
        self.in_use == Some(1) || self.vct_number.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// One series entry of `GET /recorded_files.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordedSeries {
    #[serde(rename = "SeriesID", default)]
    pub series_id: String,
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Category")]
    pub category: Option<String>,
    #[serde(rename = "ImageURL")]
    pub image_url: Option<String>,
    #[serde(rename = "EpisodesURL", default)]
    pub episodes_url: String,
    #[serde(rename = "StartTime")]
    pub start_time: Option<i64>,
}

/// One episode record from a series' `EpisodesURL`.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordedEpisode {
    #[serde(rename = "ProgramID", default)]
    pub program_id: String,
    #[serde(rename = "SeriesID", default)]
    pub series_id: String,
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "EpisodeTitle")]
    pub episode_title: Option<String>,
    #[serde(rename = "EpisodeNumber")]
    pub episode_number: Option<String>,
    #[serde(rename = "Synopsis")]
    pub synopsis: Option<String>,
    #[serde(rename = "ChannelName")]
    pub channel_name: Option<String>,
    #[serde(rename = "ChannelNumber")]
    pub channel_number: Option<String>,
    #[serde(rename = "StartTime", default)]
    pub start_time: i64,
    #[serde(rename = "EndTime", default)]
    pub end_time: i64,
    #[serde(rename = "OriginalAirdate")]
    pub original_airdate: Option<i64>,
    #[serde(rename = "RecordStartTime")]
    pub record_start_time: Option<i64>,
    #[serde(rename = "RecordEndTime")]
    pub record_end_time: Option<i64>,
    #[serde(rename = "Filename")]
    pub filename: Option<String>,
    #[serde(rename = "PlayURL", default)]
    pub play_url: String,
    #[serde(rename = "CmdURL", default)]
    pub cmd_url: String,
    #[serde(rename = "Resume")]
    pub resume: Option<u32>,
    #[serde(rename = "RecordSuccess")]
    pub record_success: Option<u8>,
    #[serde(rename = "ImageURL")]
    pub image_url: Option<String>,
}

/// The appliance resume field uses this value for "fully watched".
pub const RESUME_WATCHED_SENTINEL: u32 = 0xFFFF_FFFF;

#[derive(Clone)]
pub struct ApplianceClient {
    http: reqwest::Client,
}

impl ApplianceClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .expect("reqwest client");
        Self { http }
    }

    pub async fn discover(&self, ip: &str) -> Result<DiscoverResponse> {
        let url = format!("http://{ip}/discover.json");
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("discover.json", &e))?
            .error_for_status()
            .map_err(|e| ApiError::from_upstream("discover.json", &e))?;
        resp.json::<DiscoverResponse>()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("discover.json parse: {e}")))
    }

    pub async fn lineup(&self, appliance: &Appliance) -> Result<Vec<LineupEntry>> {
        let url = format!("{}/lineup.json", appliance.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("lineup.json", &e))?
            .error_for_status()
            .map_err(|e| ApiError::from_upstream("lineup.json", &e))?;
        resp.json::<Vec<LineupEntry>>()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("lineup.json parse: {e}")))
    }

    pub async fn tuner_statuses(&self, appliance: &Appliance) -> Result<Vec<TunerStatus>> {
        let url = format!("{}/status.json", appliance.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("status.json", &e))?
            .error_for_status()
            .map_err(|e| ApiError::from_upstream("status.json", &e))?;
        resp.json::<Vec<TunerStatus>>()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("status.json parse: {e}")))
    }

    /// Ask the appliance whether it can take another live stream right now.
    /// Our pool state is advisory only; external clients use tuners too.
    pub async fn has_free_tuner(&self, appliance: &Appliance) -> bool {
        match self.tuner_statuses(appliance).await {
            Ok(statuses) => {
                let busy = statuses.iter().filter(|s| s.is_in_use()).count();
                debug!(
                    "tuner availability: device={} busy={} total={}",
                    appliance.device_id, busy, appliance.tuner_count
                );
                (busy as u32) < appliance.tuner_count
            }
            Err(e) => {
                warn!(
                    "tuner status check failed: device={} err={}",
                    appliance.device_id, e
                );
                false
            }
        }
    }

    pub async fn recorded_series(&self, storage_url: &str) -> Result<Vec<RecordedSeries>> {
        let resp = self
            .http
            .get(storage_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("recorded_files.json", &e))?
            .error_for_status()
            .map_err(|e| ApiError::from_upstream("recorded_files.json", &e))?;
        // An appliance with an empty DVR returns a JSON null body.
        let series: Option<Vec<RecordedSeries>> = resp
            .json()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("recorded_files parse: {e}")))?;
        Ok(series.unwrap_or_default())
    }

    pub async fn episodes(&self, episodes_url: &str) -> Result<Vec<RecordedEpisode>> {
        let resp = self
            .http
            .get(episodes_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("episodes list", &e))?
            .error_for_status()
            .map_err(|e| ApiError::from_upstream("episodes list", &e))?;
        let episodes: Option<Vec<RecordedEpisode>> = resp
            .json()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("episodes parse: {e}")))?;
        Ok(episodes.unwrap_or_default())
    }

    /// `POST {cmd_url}&cmd=set&Resume={n}`. Empty body, success is HTTP 200.
    pub async fn set_resume(&self, cmd_url: &str, resume: u32) -> Result<()> {
        let resp = self
            .http
            .post(cmd_url)
            .query(&[("cmd", "set"), ("Resume", &resume.to_string())])
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("cmd=set", &e))?;
        if !resp.status().is_success() {
            return Err(ApiError::UpstreamUnavailable(format!(
                "cmd=set returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// `POST {cmd_url}&cmd=delete&rerecord={0|1}`.
    pub async fn delete_recording(&self, cmd_url: &str, rerecord: bool) -> Result<()> {
        let resp = self
            .http
            .post(cmd_url)
            .query(&[("cmd", "delete"), ("rerecord", if rerecord { "1" } else { "0" })])
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("cmd=delete", &e))?;
        if !resp.status().is_success() {
            return Err(ApiError::UpstreamUnavailable(format!(
                "cmd=delete returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Tell the appliance to re-pull recording rules from the cloud.
    pub async fn trigger_rule_sync(&self, appliance: &Appliance) -> Result<()> {
        let url = format!(
            "{}/recording_events.post?sync",
            appliance.base_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("recording_events sync", &e))?;
        if !resp.status().is_success() {
            return Err(ApiError::UpstreamUnavailable(format!(
                "recording_events sync returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Fast pre-check of a live feed before any transcoder is spawned.
    /// Reads at most ~1 KB and maps the appliance error header to the
    /// specific failure the caller should surface.
    pub async fn probe_live_url(&self, url: &str) -> Result<()> {
        let resp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("live probe", &e))?;

        if let Some(code) = resp
            .headers()
            .get("X-HDHomeRun-Error")
            .and_then(|v| v.to_str().ok())
        {
            let code = code.trim();
            if code.starts_with("805") {
                return Err(ApiError::NoTunersAvailable(
                    "appliance reports all tuners in use".to_string(),
                ));
            }
            if code.starts_with("804") {
                return Err(ApiError::NoTunersAvailable(
                    "appliance reports tuner in use".to_string(),
                ));
            }
            if code.starts_with("811") {
                return Err(ApiError::DrmProtected(url.to_string()));
            }
            warn!("live probe: unrecognized appliance error header: {}", code);
        }

        let status = resp.status();
        if status.is_server_error() {
            return Err(ApiError::UpstreamUnavailable(format!(
                "live feed returned HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(ApiError::UpstreamUnavailable(format!(
                "live feed returned HTTP {status}"
            )));
        }

        // The header and status can lie on some firmware; make sure the feed
        // actually produces transport-stream bytes.
        let mut stream = resp.bytes_stream();
        let mut seen = 0usize;
        let read = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        seen += bytes.len();
                        if seen >= 1024 {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .await;

        if read.is_err() && seen == 0 {
            return Err(ApiError::UpstreamUnavailable(
                "live feed produced no data".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ApplianceClient {
    fn default() -> Self {
        Self::new()
    }
}
