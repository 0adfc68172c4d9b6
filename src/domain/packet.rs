//! Packet-forwarder output parsing and LoRaWAN frame headers.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Start of an `rxpk` object; the object's end is found by the JSON parser.
static RXPK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{\s*"rxpk"\s*:\s*\["#).expect("rxpk pattern is valid")
});

/// One received packet as reported by the forwarder (`rxpk` entry).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RxPacket {
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub tmst: Option<u64>,
    #[serde(default)]
    pub freq: f64,
    #[serde(default)]
    pub chan: u8,
    #[serde(default)]
    pub rssi: i32,
    #[serde(default)]
    pub lsnr: f64,
    #[serde(default)]
    pub datr: String,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub data: String,
}

#[derive(Deserialize)]
struct RxpkEnvelope {
    rxpk: Vec<RxPacket>,
}

impl RxPacket {
    pub fn payload(&self) -> Result<Vec<u8>, DomainError> {
        STANDARD
            .decode(self.data.trim())
            .map_err(|e| DomainError::Serialization(format!("invalid base64 payload: {}", e)))
    }

    pub fn quality(&self) -> SignalQuality {
        SignalQuality::assess(self.rssi, self.lsnr)
    }
}

/// Extract all `rxpk` entries from a forwarder output line.
///
/// Lines without packet JSON yield an empty list.
pub fn parse_rxpk_line(line: &str) -> Vec<RxPacket> {
    // Parse one value from the match on, so trailing text or JSON is ignored
    RXPK_PATTERN
        .find(line)
        .and_then(|m| {
            serde_json::Deserializer::from_str(&line[m.start()..])
                .into_iter::<RxpkEnvelope>()
                .next()
        })
        .and_then(Result::ok)
        .map(|env| env.rxpk)
        .unwrap_or_default()
}

/// LoRaWAN message type (MHDR bits 7..5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    fn from_mhdr(mhdr: u8) -> Self {
        match mhdr >> 5 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }
}

/// Decoded header of a LoRaWAN data frame. The payload stays encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoRaWanFrame {
    pub mtype: MType,
    pub major: u8,
    /// Device address, most significant byte first.
    pub dev_addr: u32,
    pub adr: bool,
    pub ack: bool,
    pub fcnt: u16,
    pub fopts: Vec<u8>,
    pub fport: Option<u8>,
    pub frm_payload: Vec<u8>,
    pub mic: [u8; 4],
}

/// MHDR + DevAddr + FCtrl + FCnt + MIC
const MIN_DATA_FRAME_LEN: usize = 12;

impl LoRaWanFrame {
    pub fn parse(bytes: &[u8]) -> Result<Self, DomainError> {
        if bytes.len() < MIN_DATA_FRAME_LEN {
            return Err(DomainError::Serialization(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }

        let mhdr = bytes[0];
        let mtype = MType::from_mhdr(mhdr);
        if !mtype.is_data() {
            return Err(DomainError::Serialization(format!(
                "not a data frame: {:?}",
                mtype
            )));
        }

        let dev_addr = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let fctrl = bytes[5];
        let fopts_len = (fctrl & 0x0f) as usize;
        let fcnt = u16::from_le_bytes([bytes[6], bytes[7]]);

        let mic_start = bytes.len() - 4;
        let fopts_end = 8 + fopts_len;
        if fopts_end > mic_start {
            return Err(DomainError::Serialization(format!(
                "FOptsLen {} exceeds frame length",
                fopts_len
            )));
        }

        let (fport, frm_payload) = if fopts_end < mic_start {
            (
                Some(bytes[fopts_end]),
                bytes[fopts_end + 1..mic_start].to_vec(),
            )
        } else {
            (None, Vec::new())
        };

        let mut mic = [0u8; 4];
        mic.copy_from_slice(&bytes[mic_start..]);

        Ok(Self {
            mtype,
            major: mhdr & 0x03,
            dev_addr,
            adr: fctrl & 0x80 != 0,
            ack: fctrl & 0x20 != 0,
            fcnt,
            fopts: bytes[8..fopts_end].to_vec(),
            fport,
            frm_payload,
            mic,
        })
    }

    pub fn dev_addr_hex(&self) -> String {
        format!("{:08X}", self.dev_addr)
    }
}

/// Coarse rating used for RSSI and SNR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rating {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Rating::Excellent => "Excellent",
            Rating::Good => "Good",
            Rating::Fair => "Fair",
            Rating::Poor => "Poor",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalQuality {
    pub signal: Rating,
    pub snr: Rating,
    pub distance: &'static str,
}

impl SignalQuality {
    pub fn assess(rssi: i32, lsnr: f64) -> Self {
        let signal = if rssi > -80 {
            Rating::Excellent
        } else if rssi > -100 {
            Rating::Good
        } else if rssi > -120 {
            Rating::Fair
        } else {
            Rating::Poor
        };

        let snr = if lsnr > 5.0 {
            Rating::Excellent
        } else if lsnr > 0.0 {
            Rating::Good
        } else if lsnr > -10.0 {
            Rating::Fair
        } else {
            Rating::Poor
        };

        let distance = if rssi > -50 {
            "< 100m"
        } else if rssi > -80 {
            "100m - 1km"
        } else if rssi > -100 {
            "1km - 5km"
        } else if rssi > -120 {
            "5km - 15km"
        } else {
            "> 15km"
        };

        Self {
            signal,
            snr,
            distance,
        }
    }
}

/// Running counters for a monitoring session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub total: u64,
    pub matched: u64,
    pub undecodable: u64,
    pub per_device: BTreeMap<String, u64>,
}

impl MonitorStats {
    pub fn record(&mut self, frame: Option<&LoRaWanFrame>, matched: bool) {
        self.total += 1;
        if matched {
            self.matched += 1;
        }
        match frame {
            Some(f) => *self.per_device.entry(f.dev_addr_hex()).or_insert(0) += 1,
            None => self.undecodable += 1,
        }
    }

    pub fn match_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.matched as f64 * 100.0 / self.total as f64
        }
    }
}
