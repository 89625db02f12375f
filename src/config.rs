use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transcoding: TranscodingConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub guide: GuideConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            transcoding: TranscodingConfig::default(),
            live: LiveConfig::default(),
            discovery: DiscoveryConfig::default(),
            guide: GuideConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tunercast.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodingConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Seconds per HLS segment for recorded content.
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    /// Retention sweep period in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Cache entries whose directory is older than this are deleted.
    #[serde(default = "default_max_cache_age")]
    pub max_cache_age: u64,
    #[serde(default = "default_max_concurrent_transcodes")]
    pub max_concurrent_transcodes: usize,
    /// How long to wait for the transcoder to produce the playlist.
    #[serde(default = "default_playlist_wait")]
    pub playlist_wait: u64,
    /// How long a segment request will wait for the file while transcoding.
    #[serde(default = "default_segment_wait")]
    pub segment_wait: u64,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("hls-cache")
}

fn default_segment_duration() -> u32 {
    4
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_max_cache_age() -> u64 {
    30 * 24 * 3600
}

fn default_max_concurrent_transcodes() -> usize {
    2
}

fn default_playlist_wait() -> u64 {
    15
}

fn default_segment_wait() -> u64 {
    5
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            segment_duration: default_segment_duration(),
            cleanup_interval: default_cleanup_interval(),
            max_cache_age: default_max_cache_age(),
            max_concurrent_transcodes: default_max_concurrent_transcodes(),
            playlist_wait: default_playlist_wait(),
            segment_wait: default_segment_wait(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_live_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_live_segment_duration")]
    pub segment_duration: u32,
    /// Sliding window kept on disk, in minutes of content.
    #[serde(default = "default_live_buffer_minutes")]
    pub buffer_minutes: u32,
    /// Seconds between expected client heartbeats.
    #[serde(default = "default_client_heartbeat")]
    pub client_heartbeat: u64,
    /// Missed heartbeats before a viewer is reaped.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    /// Seconds a worker keeps running with zero viewers.
    #[serde(default = "default_tuner_cooldown")]
    pub tuner_cooldown: u64,
    #[serde(default = "default_max_viewers_per_tuner")]
    pub max_viewers_per_tuner: usize,
}

fn default_live_cache_dir() -> PathBuf {
    PathBuf::from("live-cache")
}

fn default_live_segment_duration() -> u32 {
    6
}

fn default_live_buffer_minutes() -> u32 {
    60
}

fn default_client_heartbeat() -> u64 {
    30
}

fn default_missed_heartbeats() -> u32 {
    2
}

fn default_tuner_cooldown() -> u64 {
    300
}

fn default_max_viewers_per_tuner() -> usize {
    10
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_live_cache_dir(),
            segment_duration: default_live_segment_duration(),
            buffer_minutes: default_live_buffer_minutes(),
            client_heartbeat: default_client_heartbeat(),
            missed_heartbeats: default_missed_heartbeats(),
            tuner_cooldown: default_tuner_cooldown(),
            max_viewers_per_tuner: default_max_viewers_per_tuner(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Seconds between discovery passes.
    #[serde(default = "default_rediscover_interval")]
    pub rediscover_interval: u64,
    /// Vendor cloud endpoint listing devices on the local network.
    #[serde(default = "default_cloud_discover_url")]
    pub cloud_discover_url: String,
    /// Scan interface-adjacent /24 subnets when broadcast finds nothing.
    #[serde(default = "default_subnet_scan")]
    pub subnet_scan: bool,
    /// Subnets to probe, e.g. "192.168.1". Empty means skip the scan.
    #[serde(default)]
    pub scan_prefixes: Vec<String>,
}

fn default_rediscover_interval() -> u64 {
    600
}

fn default_cloud_discover_url() -> String {
    "https://ipv4-api.hdhomerun.com/discover".to_string()
}

fn default_subnet_scan() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rediscover_interval: default_rediscover_interval(),
            cloud_discover_url: default_cloud_discover_url(),
            subnet_scan: default_subnet_scan(),
            scan_prefixes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuideConfig {
    #[serde(default = "default_guide_base_url")]
    pub cloud_base_url: String,
    /// Background guide refresh period in seconds.
    #[serde(default = "default_guide_refresh_interval")]
    pub refresh_interval: u64,
    /// Reads refresh the cache first when it is older than this, in seconds.
    #[serde(default = "default_guide_freshness")]
    pub freshness_window: u64,
}

fn default_guide_base_url() -> String {
    "https://api.hdhomerun.com/api".to_string()
}

fn default_guide_refresh_interval() -> u64 {
    12 * 3600
}

fn default_guide_freshness() -> u64 {
    15 * 60
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            cloud_base_url: default_guide_base_url(),
            refresh_interval: default_guide_refresh_interval(),
            freshness_window: default_guide_freshness(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.transcoding.segment_duration, 4);
        assert_eq!(s.transcoding.max_concurrent_transcodes, 2);
        assert_eq!(s.transcoding.cleanup_interval, 3600);
        assert_eq!(s.transcoding.max_cache_age, 30 * 24 * 3600);
        assert_eq!(s.live.segment_duration, 6);
        assert_eq!(s.live.buffer_minutes, 60);
        assert_eq!(s.live.client_heartbeat, 30);
        assert_eq!(s.live.missed_heartbeats, 2);
        assert_eq!(s.live.tuner_cooldown, 300);
        assert_eq!(s.live.max_viewers_per_tuner, 10);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml = r#"
            [server]
            port = 9001

            [transcoding]
            max_concurrent_transcodes = 4
        "#;
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.transcoding.max_concurrent_transcodes, 4);
        assert_eq!(settings.transcoding.segment_duration, 4);
    }
}
