//! Wire messages exchanged over the cluster channel.
//!
//! Two application messages exist. The data plane opens with a plain-JSON
//! `basic_info` advertising its plugin inventory; every config push from the
//! control plane is a gzip-deflated JSON `reconfigure` envelope. Heartbeats
//! ride on native ping/pong frames and carry only the applied fingerprint.

use super::types::PluginDescriptor;
use crate::types::ConfigTable;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Cap on an inflated snapshot. The frame limit bounds the compressed form;
/// this bounds what a hostile payload can expand to.
pub const MAX_INFLATED_LEN: u64 = 128 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("inflated payload exceeds {MAX_INFLATED_LEN} bytes")]
    TooLarge,
}

/// First application frame on every connection, data plane to control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "basic_info")]
pub struct BasicInfo {
    pub plugins: Vec<PluginDescriptor>,
}

impl BasicInfo {
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Config push envelope, control plane to data plane. Always sent deflated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "reconfigure")]
pub struct Reconfigure {
    pub timestamp: f64,
    pub config_table: ConfigTable,
}

impl Reconfigure {
    pub fn deflate(&self) -> Result<Vec<u8>, MessageError> {
        let json = serde_json::to_vec(self)?;
        gzip_deflate(&json)
    }

    pub fn inflate(data: &[u8]) -> Result<Self, MessageError> {
        let json = gzip_inflate(data)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

pub fn gzip_deflate(data: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Bounded inflate. Reads one byte past the cap to detect overrun.
pub fn gzip_inflate(data: &[u8]) -> Result<Vec<u8>, MessageError> {
    let mut out = Vec::new();
    let mut decoder = GzDecoder::new(data).take(MAX_INFLATED_LEN + 1);
    decoder.read_to_end(&mut out)?;
    if out.len() as u64 > MAX_INFLATED_LEN {
        return Err(MessageError::TooLarge);
    }
    Ok(out)
}

/// One item in a control-plane peer's outbound queue.
///
/// Payloads share one snapshot buffer across all peers; `Pong` is the
/// heartbeat reply sentinel. FIFO per peer, drained by the sole writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Payload(Bytes),
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_info_wire_shape() {
        let info = BasicInfo {
            plugins: vec![PluginDescriptor::new("key-auth", Some("3.0.0"))],
        };
        let value: serde_json::Value = serde_json::from_slice(&info.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "basic_info");
        assert_eq!(value["plugins"][0]["name"], "key-auth");
        assert_eq!(value["plugins"][0]["version"], "3.0.0");
    }

    #[test]
    fn basic_info_rejects_other_types() {
        assert!(BasicInfo::from_json(br#"{"type":"ping_pong","plugins":[]}"#).is_err());
        assert!(BasicInfo::from_json(b"not json").is_err());
    }

    #[test]
    fn reconfigure_envelope_round_trip() {
        let push = Reconfigure {
            timestamp: 1700000000.25,
            config_table: json!({"services": [{"name": "s1"}]}),
        };
        let deflated = push.deflate().unwrap();
        let back = Reconfigure::inflate(&deflated).unwrap();
        assert_eq!(back.timestamp, push.timestamp);
        assert_eq!(back.config_table, push.config_table);
    }

    #[test]
    fn reconfigure_carries_type_tag() {
        let push = Reconfigure { timestamp: 0.0, config_table: json!({}) };
        let json = gzip_inflate(&push.deflate().unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["type"], "reconfigure");
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(gzip_inflate(b"\x1f\x8b but not really gzip").is_err());
    }
}
