use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::MAX_BUTTONS;
use crate::supervisor::SupervisorTiming;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("page_count must be at least 1")]
    NoPages,
    #[error("button_count {0} exceeds the {MAX_BUTTONS} buttons a page can track")]
    TooManyButtons(u8),
    #[error("button_count must be at least 1")]
    NoButtons,
    #[error("retry_max must be at least 1")]
    NoRetries,
    #[error("check_interval_ms must be non-zero")]
    ZeroInterval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NextionConfig {
    pub page_count: u8,
    pub button_count: u8,
    pub cache_enabled: bool,
    pub report_page0: bool,
    pub check_interval_ms: u64,
    pub retry_max: u32,
    pub boot_wait_ms: u64,
    pub reset_wait_ms: u64,
    pub version_query: String,
    pub max_bytes_per_poll: usize,
}

impl Default for NextionConfig {
    fn default() -> Self {
        Self {
            page_count: 14,
            button_count: 12,
            cache_enabled: true,
            report_page0: false,
            check_interval_ms: 5_000,
            retry_max: 5,
            boot_wait_ms: 5_000,
            reset_wait_ms: 5_000,
            version_query: "p[0].b[2].val".to_string(),
            max_bytes_per_poll: 256,
        }
    }
}

impl NextionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_count == 0 {
            return Err(ConfigError::NoPages);
        }
        if self.button_count == 0 {
            return Err(ConfigError::NoButtons);
        }
        if self.button_count > MAX_BUTTONS {
            return Err(ConfigError::TooManyButtons(self.button_count));
        }
        if self.retry_max == 0 {
            return Err(ConfigError::NoRetries);
        }
        if self.check_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    pub fn timing(&self) -> SupervisorTiming {
        SupervisorTiming {
            check_interval_ms: self.check_interval_ms,
            retry_max: self.retry_max,
            boot_wait_ms: self.boot_wait_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub ack_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub upload_baud: u32,
    pub settle_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2_000,
            inactivity_timeout_ms: 30_000,
            upload_baud: 115_200,
            settle_ms: 5_000,
        }
    }
}

impl TransferConfig {
    pub fn sanitize(&mut self) {
        self.ack_timeout_ms = self.ack_timeout_ms.clamp(500, 30_000);
        self.inactivity_timeout_ms = self.inactivity_timeout_ms.clamp(5_000, 300_000);
        if self.upload_baud == 0 {
            self.upload_baud = 115_200;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub node_name: String,
    pub group_name: String,
    pub lcd_firmware_url: String,
    pub status_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            node_name: "plate01".to_string(),
            group_name: "plates".to_string(),
            lcd_firmware_url: "http://haswitchplate.com/update/HASwitchPlate.tft".to_string(),
            status_interval_ms: 300_000,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.node_name.trim().is_empty() {
            self.node_name = Self::default().node_name;
        }
        if self.group_name.trim().is_empty() {
            self.group_name = Self::default().group_name;
        }
        self.status_interval_ms = self.status_interval_ms.max(10_000);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub nextion: NextionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) -> Result<(), ConfigError> {
        self.transfer.sanitize();
        self.network.sanitize();
        self.nextion.validate()
    }
}
