use lazy_static::lazy_static;
use prometheus::{register_gauge, register_gauge_vec, Encoder, Gauge, GaugeVec, TextEncoder};

lazy_static! {
    pub static ref ACTIVE_TRANSCODES: Gauge = register_gauge!(
        "tunercast_active_transcodes",
        "Number of transcoder child processes currently running"
    )
    .unwrap();
    pub static ref LIVE_VIEWERS: GaugeVec = register_gauge_vec!(
        "tunercast_live_viewers",
        "Current viewer count per live tuner",
        &["tuner_id"]
    )
    .unwrap();
    pub static ref APPLIANCES_ONLINE: Gauge = register_gauge!(
        "tunercast_appliances_online",
        "Appliances observed by the most recent discovery pass"
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
