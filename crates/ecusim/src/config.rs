//! DoIP server configuration
//!
//! A simulation script can carry the DoIP entity configuration in its
//! `Main` table. A script is recognized as the server configuration when it
//! defines `LOGICAL_ADDRESS`; everything else falls back to defaults.

use crate::model::EcuModel;

#[derive(Debug, Clone)]
pub struct DoipServerConfig {
    pub vin: String,
    pub logical_address: u16,
    pub eid: [u8; 6],
    pub gid: [u8; 6],
    pub further_action: u8,
    pub announce_num: u32,
    pub announce_interval_ms: u64,
    pub general_inactivity_ms: u64,
}

impl Default for DoipServerConfig {
    fn default() -> Self {
        Self {
            vin: "00000000000000000".to_string(),
            logical_address: 0x0000,
            eid: [0; 6],
            gid: [0; 6],
            further_action: 0x00,
            announce_num: 3,
            announce_interval_ms: 500,
            general_inactivity_ms: 50_000,
        }
    }
}

impl DoipServerConfig {
    /// Read the server configuration from a loaded script, if it carries
    /// one.
    pub fn from_model(model: &EcuModel) -> Option<Self> {
        let script = model.script();
        let logical_address = script.attr_u32("LOGICAL_ADDRESS")? as u16;

        let mut config = Self {
            logical_address,
            ..Self::default()
        };
        if let Some(vin) = script.attr_string("VIN") {
            config.vin = vin;
        }
        if let Some(eid) = script.attr_string("EID") {
            config.eid = entity_id_bytes(&eid);
        }
        if let Some(gid) = script.attr_string("GID") {
            config.gid = entity_id_bytes(&gid);
        }
        if let Some(further_action) = script.attr_u32("FURTHER_ACTION") {
            config.further_action = further_action as u8;
        }
        if let Some(num) = script.attr_u32("ANNOUNCE_NUM") {
            config.announce_num = num;
        }
        if let Some(interval) = script.attr_u32("ANNOUNCE_INTERVAL") {
            config.announce_interval_ms = interval as u64;
        }
        if let Some(inactivity) = script.attr_u32("T_TCP_General_Inactivity") {
            config.general_inactivity_ms = inactivity as u64;
        }
        Some(config)
    }
}

/// EID/GID values are written as decimal numbers in the scripts; the low
/// six big-endian bytes go on the wire.
fn entity_id_bytes(text: &str) -> [u8; 6] {
    let value = text.trim().parse::<u64>().unwrap_or(0);
    let be = value.to_be_bytes();
    [be[2], be[3], be[4], be[5], be[6], be[7]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_reads_the_main_table() {
        let chunk = r#"
            Main = {
                VIN = "SALGA2EV9HA298784",
                LOGICAL_ADDRESS = 0x0E00,
                EID = "74565",
                GID = "74565",
                FURTHER_ACTION = 0x00,
                ANNOUNCE_NUM = 5,
                ANNOUNCE_INTERVAL = 250,
                T_TCP_General_Inactivity = 50000,
            }
        "#;
        let model = EcuModel::from_chunk("doipserver", chunk).unwrap();
        let config = DoipServerConfig::from_model(&model).unwrap();
        assert_eq!(config.vin, "SALGA2EV9HA298784");
        assert_eq!(config.logical_address, 0x0E00);
        // 74565 == 0x012345
        assert_eq!(config.eid, [0, 0, 0, 0x01, 0x23, 0x45]);
        assert_eq!(config.announce_num, 5);
        assert_eq!(config.announce_interval_ms, 250);
        assert_eq!(config.general_inactivity_ms, 50_000);
    }

    #[test]
    fn scripts_without_logical_address_are_not_server_configs() {
        let chunk = r#"
            Main = {
                RequestId = 0x100,
                ResponseId = 0x200,
            }
        "#;
        let model = EcuModel::from_chunk("pcm", chunk).unwrap();
        assert!(DoipServerConfig::from_model(&model).is_none());
    }

    #[test]
    fn defaults_follow_iso_13400_conventions() {
        let config = DoipServerConfig::default();
        assert_eq!(config.vin.len(), 17);
        assert_eq!(config.announce_num, 3);
        assert_eq!(config.announce_interval_ms, 500);
        assert_eq!(config.general_inactivity_ms, 50_000);
    }
}
