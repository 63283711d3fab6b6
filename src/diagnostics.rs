//! Status/diagnostics snapshot (spec §6's out-of-scope USB `STATUS` verb
//! still needs a data surface to read from). Serde-serializable so a host
//! binary can hand it to a log line, a debug endpoint, or a file, the way
//! the teacher reaches for `serde_json` for its lang tables rather than for
//! anything on the wire — the wire format stays the hand-packed binary
//! layout in `frame.rs`.

use serde::Serialize;

use crate::link::LinkStats;
use crate::slot::{SignalQuality, SlotState};

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub index: usize,
    pub state: String,
    pub display_name: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub signal: SignalQuality,
    pub key_age_secs: u64,
    pub seal_count: u64,
    pub needs_rekey: bool,
}

impl SlotStatus {
    pub(crate) fn state_label(state: SlotState) -> &'static str {
        match state {
            SlotState::Empty => "empty",
            SlotState::Saved => "saved",
            SlotState::Connecting => "connecting",
            SlotState::Connected => "connected",
            SlotState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub link: LinkStats,
    pub slots: Vec<SlotStatus>,
}

impl DeviceStatus {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_to_json() {
        let status = DeviceStatus {
            device_id: "12345678".to_string(),
            link: LinkStats::default(),
            slots: vec![SlotStatus {
                index: 0,
                state: SlotStatus::state_label(SlotState::Connected).to_string(),
                display_name: Some("peer-1".to_string()),
                bytes_sent: 10,
                bytes_received: 20,
                signal: SignalQuality { rssi: -60, snr: 10 },
                key_age_secs: 5,
                seal_count: 3,
                needs_rekey: false,
            }],
        };
        let json = status.to_json();
        assert!(json.contains("\"device_id\":\"12345678\""));
        assert!(json.contains("\"state\":\"connected\""));
    }
}
