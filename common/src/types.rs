use serde::Serialize;

/// A request for the plate, from the bus or the local web server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlateCommand {
    StatusUpdate,
    Raw(String),
    Json(String),
    Page(u8),
    PageScope { page: u8, global: bool },
    GetAttr(String),
    SetAttr { attr: String, value: String },
    /// `None` means the configured firmware URL.
    LcdDownload(Option<String>),
    LcdReboot,
    Reboot,
    /// A stale last-will `OFF` showed up on our status topic.
    ReassertOnline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Publication {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            retain: true,
            ..Self::new(topic, payload)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlateStatus {
    pub status: &'static str,
    pub lcd_connected: bool,
    pub lcd_version: String,
    pub lcd_model: Option<String>,
    pub connection_state: &'static str,
    pub lcd_degraded: bool,
    pub active_page: u8,
    pub esp_uptime: u64,
}
