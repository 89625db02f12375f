use crate::appliance::{Appliance, ApplianceClient};
use crate::config::DiscoveryConfig;
use crate::error::{ApiError, Result};
use crate::metrics::APPLIANCES_ONLINE;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DISCOVER_PORT: u16 = 65001;

const PACKET_TYPE_DISCOVER_REQUEST: u16 = 0x0002;
const PACKET_TYPE_DISCOVER_REPLY: u16 = 0x0003;

const TAG_DEVICE_TYPE: u8 = 0x01;
const TAG_DEVICE_ID: u8 = 0x02;
const TAG_TUNER_COUNT: u8 = 0x03;

pub const WILDCARD: u32 = 0xFFFF_FFFF;

fn push_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    let len = value.len();
    if len <= 127 {
        out.push(len as u8);
    } else {
        out.push(((len & 0x7F) as u8) | 0x80);
        out.push((len >> 7) as u8);
    }
    out.extend_from_slice(value);
}

fn read_tlv(buf: &[u8], pos: &mut usize) -> Option<(u8, Vec<u8>)> {
    if *pos + 2 > buf.len() {
        return None;
    }
    let tag = buf[*pos];
    let mut len = buf[*pos + 1] as usize;
    *pos += 2;
    if len & 0x80 != 0 {
        if *pos >= buf.len() {
            return None;
        }
        len = (len & 0x7F) | ((buf[*pos] as usize) << 7);
        *pos += 1;
    }
    if *pos + len > buf.len() {
        return None;
    }
    let value = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Some((tag, value))
}

/// Build a discover-request datagram: `header | tlv payload | crc32`.
/// Header is two big-endian u16 (packet type, payload length); the trailing
/// four bytes are the little-endian CRC-32 of everything before them.
pub fn encode_discover_request(device_type: u32, device_id: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    push_tlv(&mut payload, TAG_DEVICE_TYPE, &device_type.to_be_bytes());
    push_tlv(&mut payload, TAG_DEVICE_ID, &device_id.to_be_bytes());

    let mut packet = Vec::with_capacity(4 + payload.len() + 4);
    packet.extend_from_slice(&PACKET_TYPE_DISCOVER_REQUEST.to_be_bytes());
    packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(&payload);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&packet);
    let crc = hasher.finalize();
    packet.extend_from_slice(&crc.to_le_bytes());
    packet
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverReply {
    pub device_type: Option<u32>,
    pub device_id: Option<String>,
    pub tuner_count: Option<u8>,
}

/// Parse a reply datagram. Returns None for anything that is not a
/// CRC-valid discover reply.
pub fn parse_discover_reply(packet: &[u8]) -> Option<DiscoverReply> {
    if packet.len() < 8 {
        return None;
    }
    let (body, crc_bytes) = packet.split_at(packet.len() - 4);
    let expected = u32::from_le_bytes(crc_bytes.try_into().ok()?);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected {
        return None;
    }

    let packet_type = u16::from_be_bytes(body[0..2].try_into().ok()?);
    if packet_type != PACKET_TYPE_DISCOVER_REPLY {
        return None;
    }
    let payload_len = u16::from_be_bytes(body[2..4].try_into().ok()?) as usize;
    if 4 + payload_len != body.len() {
        return None;
    }

    let payload = &body[4..];
    let mut reply = DiscoverReply {
        device_type: None,
        device_id: None,
        tuner_count: None,
    };
    let mut pos = 0;
    while pos < payload.len() {
        let (tag, value) = read_tlv(payload, &mut pos)?;
        match tag {
            TAG_DEVICE_TYPE if value.len() == 4 => {
                reply.device_type = Some(u32::from_be_bytes(value.try_into().unwrap()));
            }
            TAG_DEVICE_ID if value.len() == 4 => {
                reply.device_id =
                    Some(format!("{:08X}", u32::from_be_bytes(value.try_into().unwrap())));
            }
            TAG_TUNER_COUNT if !value.is_empty() => {
                reply.tuner_count = Some(value[0]);
            }
            _ => {
                debug!("discover reply: ignoring tag 0x{:02x} len={}", tag, value.len());
            }
        }
    }
    Some(reply)
}

/// A device entry from the vendor cloud's local-device listing. Only the
/// address matters; the full description comes from the device itself.
#[derive(Debug, Clone, Deserialize)]
struct CloudDevice {
    #[serde(rename = "LocalIP")]
    local_ip: Option<String>,
}

/// Authoritative appliance set. One discovery pass at a time; observers see
/// either the previous set or the completed new one.
pub struct DeviceRegistry {
    appliances: RwLock<HashMap<String, Appliance>>,
    pass_running: AtomicBool,
    client: ApplianceClient,
    config: DiscoveryConfig,
}

impl DeviceRegistry {
    pub fn new(client: ApplianceClient, config: DiscoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            appliances: RwLock::new(HashMap::new()),
            pass_running: AtomicBool::new(false),
            client,
            config,
        })
    }

    pub async fn list(&self) -> Vec<Appliance> {
        let map = self.appliances.read().await;
        let mut out: Vec<Appliance> = map.values().cloned().collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    pub async fn online(&self) -> Vec<Appliance> {
        self.list().await.into_iter().filter(|a| a.online).collect()
    }

    pub async fn get(&self, device_id: &str) -> Option<Appliance> {
        self.appliances.read().await.get(device_id).cloned()
    }

    pub async fn dvr_appliances(&self) -> Vec<Appliance> {
        self.online()
            .await
            .into_iter()
            .filter(|a| a.is_dvr())
            .collect()
    }

    #[cfg(test)]
    pub async fn insert_for_test(&self, appliance: Appliance) {
        self.appliances
            .write()
            .await
            .insert(appliance.device_id.clone(), appliance);
    }

    /// Run one full discovery pass: UDP broadcast, then the HTTP fallbacks,
    /// then an atomic swap of the appliance set. A second trigger while one
    /// runs is rejected with `Busy`.
    pub async fn run_pass(&self) -> Result<Vec<Appliance>> {
        if self
            .pass_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ApiError::Busy("discovery pass already running".to_string()));
        }
        let result = self.run_pass_inner().await;
        self.pass_running.store(false, Ordering::Release);
        result
    }

    async fn run_pass_inner(&self) -> Result<Vec<Appliance>> {
        let mut candidate_ips: Vec<String> = Vec::new();
        let mut udp_ips: Vec<String> = Vec::new();

        match udp_broadcast_pass().await {
            Ok(ips) => {
                info!("discovery: udp broadcast found {} device(s)", ips.len());
                udp_ips = ips.clone();
                candidate_ips.extend(ips);
            }
            Err(e) => {
                warn!("discovery: udp broadcast failed: {}", e);
            }
        }

        // Cloud listing supplements broadcast; it also covers hosts on
        // subnets broadcast cannot reach.
        match self.cloud_device_ips().await {
            Ok(ips) => {
                debug!("discovery: cloud listed {} device(s)", ips.len());
                candidate_ips.extend(ips);
            }
            Err(e) => {
                warn!("discovery: cloud device list failed: {}", e);
            }
        }

        if candidate_ips.is_empty() && self.config.subnet_scan {
            let scanned = self.subnet_scan().await;
            info!("discovery: subnet scan found {} device(s)", scanned.len());
            candidate_ips.extend(scanned);
        }

        candidate_ips.sort();
        candidate_ips.dedup();

        let now = chrono::Utc::now().timestamp();
        let mut fresh: HashMap<String, Appliance> = HashMap::new();
        for ip in &candidate_ips {
            match self.client.discover(ip).await {
                Ok(desc) => {
                    let key = if desc.device_id.is_empty() {
                        ip.clone()
                    } else {
                        desc.device_id.clone()
                    };
                    let from_udp = udp_ips.contains(ip);
                    let appliance = Appliance {
                        device_id: key.clone(),
                        ip: ip.clone(),
                        base_url: if desc.base_url.is_empty() {
                            format!("http://{ip}:80")
                        } else {
                            desc.base_url
                        },
                        friendly_name: desc.friendly_name,
                        model_number: desc.model_number,
                        device_auth: desc.device_auth,
                        tuner_count: desc.tuner_count,
                        lineup_url: desc.lineup_url,
                        storage_url: desc.storage_url,
                        total_space: desc.total_space,
                        free_space: desc.free_space,
                        last_seen: now,
                        online: true,
                    };
                    merge_appliance(&mut fresh, appliance, from_udp);
                }
                Err(e) => {
                    debug!("discovery: {} did not answer discover.json: {}", ip, e);
                }
            }
        }

        // Swap in the new set. Devices that vanished stay listed but are
        // marked offline so viewers and queries can react.
        let mut map = self.appliances.write().await;
        for (id, old) in map.iter() {
            if !fresh.contains_key(id) {
                let mut gone = old.clone();
                gone.online = false;
                fresh.insert(id.clone(), gone);
            }
        }
        *map = fresh;
        let online = map.values().filter(|a| a.online).count();
        APPLIANCES_ONLINE.set(online as f64);
        info!(
            "discovery: pass complete, {} appliance(s), {} online",
            map.len(),
            online
        );
        let mut out: Vec<Appliance> = map.values().cloned().collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(out)
    }

    async fn cloud_device_ips(&self) -> Result<Vec<String>> {
        let http = reqwest::Client::new();
        let resp = http
            .get(&self.config.cloud_discover_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ApiError::from_upstream("cloud discover", &e))?
            .error_for_status()
            .map_err(|e| ApiError::from_upstream("cloud discover", &e))?;
        let devices: Vec<CloudDevice> = resp
            .json()
            .await
            .map_err(|e| ApiError::UpstreamUnavailable(format!("cloud discover parse: {e}")))?;
        Ok(devices
            .into_iter()
            .filter_map(|d| d.local_ip.filter(|ip| !ip.is_empty()))
            .collect())
    }

    /// Probe `discover.json` across the configured /24 prefixes at bounded
    /// parallelism. Only hosts that identify as the vendor's hardware count.
    /// With no configured prefixes, the interface-adjacent /24 is scanned.
    async fn subnet_scan(&self) -> Vec<String> {
        let prefixes = if self.config.scan_prefixes.is_empty() {
            local_subnet_prefix().into_iter().collect()
        } else {
            self.config.scan_prefixes.clone()
        };
        let mut hosts = Vec::new();
        for prefix in &prefixes {
            for host in 1..=254u32 {
                hosts.push(format!("{prefix}.{host}"));
            }
        }
        if hosts.is_empty() {
            return Vec::new();
        }

        let client = self.client.clone();
        futures::stream::iter(hosts)
            .map(|ip| {
                let client = client.clone();
                async move {
                    match client.discover(&ip).await {
                        Ok(desc) if desc.model_number.contains("HD") => Some(ip),
                        _ => None,
                    }
                }
            })
            .buffer_unordered(16)
            .filter_map(|x| async move { x })
            .collect()
            .await
    }
}

fn merge_appliance(map: &mut HashMap<String, Appliance>, incoming: Appliance, from_udp: bool) {
    match map.get_mut(&incoming.device_id) {
        Some(existing) => {
            // UDP-sourced entries win the address fields; everything else
            // merges by presence.
            if from_udp {
                existing.ip = incoming.ip;
                existing.base_url = incoming.base_url;
            }
            if existing.storage_url.is_none() {
                existing.storage_url = incoming.storage_url;
            }
            if !incoming.device_auth.is_empty() {
                existing.device_auth = incoming.device_auth;
            }
            existing.total_space = incoming.total_space.or(existing.total_space);
            existing.free_space = incoming.free_space.or(existing.free_space);
            existing.last_seen = incoming.last_seen;
            existing.online = true;
        }
        None => {
            map.insert(incoming.device_id.clone(), incoming);
        }
    }
}

fn local_subnet_prefix() -> Option<String> {
    match local_ip_address::local_ip() {
        Ok(std::net::IpAddr::V4(ip)) => {
            let octets = ip.octets();
            Some(format!("{}.{}.{}", octets[0], octets[1], octets[2]))
        }
        _ => None,
    }
}

/// Broadcast a wildcard discover request and collect replying source IPs
/// for a 3 second window.
async fn udp_broadcast_pass() -> std::io::Result<Vec<String>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    let packet = encode_discover_request(WILDCARD, WILDCARD);
    let target: SocketAddr = format!("255.255.255.255:{DISCOVER_PORT}").parse().unwrap();
    socket.send_to(&packet, target).await?;

    let mut ips = Vec::new();
    let mut buf = [0u8; 1500];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                if let Some(reply) = parse_discover_reply(&buf[..n]) {
                    debug!(
                        "discovery: reply from {} device_id={:?} tuners={:?}",
                        from, reply.device_id, reply.tuner_count
                    );
                    let ip = from.ip().to_string();
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_request_is_20_bytes_with_valid_crc() {
        let packet = encode_discover_request(WILDCARD, WILDCARD);
        assert_eq!(packet.len(), 20);

        // Header: type 0x0002, payload length 12.
        assert_eq!(&packet[0..2], &[0x00, 0x02]);
        assert_eq!(&packet[2..4], &[0x00, 0x0C]);

        // Both TLVs carry the 0xFFFFFFFF wildcard.
        assert_eq!(&packet[4..10], &[0x01, 0x04, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&packet[10..16], &[0x02, 0x04, 0xFF, 0xFF, 0xFF, 0xFF]);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&packet[..16]);
        let expected = hasher.finalize().to_le_bytes();
        assert_eq!(&packet[16..20], &expected);
    }

    fn encode_reply(device_type: u32, device_id: u32, tuner_count: Option<u8>) -> Vec<u8> {
        let mut payload = Vec::new();
        push_tlv(&mut payload, TAG_DEVICE_TYPE, &device_type.to_be_bytes());
        push_tlv(&mut payload, TAG_DEVICE_ID, &device_id.to_be_bytes());
        if let Some(n) = tuner_count {
            push_tlv(&mut payload, TAG_TUNER_COUNT, &[n]);
        }
        let mut packet = Vec::new();
        packet.extend_from_slice(&PACKET_TYPE_DISCOVER_REPLY.to_be_bytes());
        packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        packet.extend_from_slice(&payload);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&packet);
        let crc = hasher.finalize();
        packet.extend_from_slice(&crc.to_le_bytes());
        packet
    }

    #[test]
    fn test_reply_round_trip() {
        let packet = encode_reply(0x00000001, 0x1234ABCD, Some(2));
        let reply = parse_discover_reply(&packet).unwrap();
        assert_eq!(reply.device_type, Some(1));
        assert_eq!(reply.device_id.as_deref(), Some("1234ABCD"));
        assert_eq!(reply.tuner_count, Some(2));
    }

    #[test]
    fn test_corrupted_crc_is_rejected() {
        let mut packet = encode_reply(1, 0xDEADBEEF, None);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(parse_discover_reply(&packet).is_none());
    }

    #[test]
    fn test_request_packets_are_not_replies() {
        let packet = encode_discover_request(WILDCARD, WILDCARD);
        assert!(parse_discover_reply(&packet).is_none());
    }

    #[test]
    fn test_truncated_packet_is_rejected() {
        let packet = encode_reply(1, 2, Some(2));
        assert!(parse_discover_reply(&packet[..packet.len() - 6]).is_none());
    }

    #[test]
    fn test_two_octet_tlv_length() {
        let value = vec![0xAB; 200];
        let mut buf = Vec::new();
        push_tlv(&mut buf, 0x10, &value);
        assert_eq!(buf[1], ((200 & 0x7F) as u8) | 0x80);
        assert_eq!(buf[2], (200 >> 7) as u8);
        let mut pos = 0;
        let (tag, parsed) = read_tlv(&buf, &mut pos).unwrap();
        assert_eq!(tag, 0x10);
        assert_eq!(parsed, value);
        assert_eq!(pos, buf.len());
    }

    fn test_appliance(id: &str, ip: &str) -> Appliance {
        Appliance {
            device_id: id.to_string(),
            ip: ip.to_string(),
            base_url: format!("http://{ip}:80"),
            friendly_name: "dev".into(),
            model_number: "HDVR".into(),
            device_auth: "auth".into(),
            tuner_count: 2,
            lineup_url: String::new(),
            storage_url: None,
            total_space: None,
            free_space: None,
            last_seen: 100,
            online: true,
        }
    }

    #[test]
    fn test_merge_prefers_udp_address() {
        let mut map = HashMap::new();
        merge_appliance(&mut map, test_appliance("AA", "10.0.0.5"), false);

        let mut udp = test_appliance("AA", "192.168.1.5");
        udp.storage_url = Some("http://192.168.1.5/recorded_files.json".into());
        merge_appliance(&mut map, udp, true);

        let merged = map.get("AA").unwrap();
        assert_eq!(merged.ip, "192.168.1.5");
        assert!(merged.storage_url.is_some());
    }

    #[test]
    fn test_merge_keeps_existing_address_for_http_source() {
        let mut map = HashMap::new();
        merge_appliance(&mut map, test_appliance("AA", "192.168.1.5"), true);
        merge_appliance(&mut map, test_appliance("AA", "10.0.0.5"), false);
        assert_eq!(map.get("AA").unwrap().ip, "192.168.1.5");
    }
}
