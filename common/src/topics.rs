use log::debug;

use crate::nextion::HmiEvent;
use crate::protocol::TouchState;
use crate::types::{PlateCommand, PlateStatus, Publication};

pub const STATUS_ONLINE: &str = "ON";
pub const STATUS_OFFLINE: &str = "OFF";
pub const SENSOR_UNAVAILABLE: &str = r#"{"status":"unavailable"}"#;

/// Subtopics handled by collaborators this firmware does not carry.
const FOREIGN_SUBTOPICS: [&str; 3] = ["espupdate", "factoryreset", "beep"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub state: String,
    pub state_json: String,
    pub command: String,
    pub group_command: String,
    pub status: String,
    pub sensor: String,
}

impl Topics {
    pub fn new(node: &str, group: &str) -> Self {
        Self {
            state: format!("hasp/{node}/state"),
            state_json: format!("hasp/{node}/state/json"),
            command: format!("hasp/{node}/command"),
            group_command: format!("hasp/{group}/command"),
            status: format!("hasp/{node}/status"),
            sensor: format!("hasp/{node}/sensor"),
        }
    }

    pub fn subscriptions(&self) -> [String; 3] {
        [
            format!("{}/#", self.command),
            format!("{}/#", self.group_command),
            self.status.clone(),
        ]
    }

    pub fn route(&self, topic: &str, payload: &str) -> Option<PlateCommand> {
        if topic == self.status {
            return (payload == STATUS_OFFLINE).then_some(PlateCommand::ReassertOnline);
        }

        let rest = topic
            .strip_prefix(self.command.as_str())
            .or_else(|| topic.strip_prefix(self.group_command.as_str()))?;

        if rest.is_empty() {
            return Some(if payload.is_empty() {
                PlateCommand::StatusUpdate
            } else {
                PlateCommand::Raw(payload.to_string())
            });
        }

        let subtopic = rest.strip_prefix('/')?;
        let command = match subtopic {
            "page" => PlateCommand::Page(parse_page(payload)?),
            "globalpage" => PlateCommand::PageScope {
                page: parse_page(payload)?,
                global: true,
            },
            "localpage" => PlateCommand::PageScope {
                page: parse_page(payload)?,
                global: false,
            },
            "json" => PlateCommand::Json(payload.to_string()),
            "statusupdate" => PlateCommand::StatusUpdate,
            "lcdupdate" => PlateCommand::LcdDownload(
                Some(payload.trim())
                    .filter(|url| !url.is_empty())
                    .map(str::to_string),
            ),
            "lcdreboot" => PlateCommand::LcdReboot,
            "reboot" => PlateCommand::Reboot,
            "" => return None,
            other if FOREIGN_SUBTOPICS.contains(&other) => {
                debug!("MQTT: ignoring unsupported command {other}");
                return None;
            }
            attr if payload.is_empty() => PlateCommand::GetAttr(attr.to_string()),
            attr => PlateCommand::SetAttr {
                attr: attr.to_string(),
                value: payload.to_string(),
            },
        };
        Some(command)
    }

    pub fn status_report(
        &self,
        status: &PlateStatus,
    ) -> Result<[Publication; 2], serde_json::Error> {
        Ok([
            Publication::retained(&self.sensor, serde_json::to_string(status)?),
            Publication::retained(&self.status, STATUS_ONLINE),
        ])
    }

    pub fn goodbye(&self) -> [Publication; 2] {
        [
            Publication::retained(&self.status, STATUS_OFFLINE),
            Publication::retained(&self.sensor, SENSOR_UNAVAILABLE),
        ]
    }
}

fn parse_page(payload: &str) -> Option<u8> {
    payload.trim().parse().ok()
}

impl HmiEvent {
    /// Bus messages announcing this event. Lifecycle events publish nothing
    /// here; the scheduler answers them with a status report.
    pub fn publications(&self, topics: &Topics) -> Vec<Publication> {
        match self {
            Self::Button {
                page,
                button,
                state,
            } => vec![
                Publication::new(
                    format!("{}/p[{page}].b[{button}]", topics.state),
                    state.as_str(),
                ),
                Publication::new(
                    &topics.state_json,
                    serde_json::json!({
                        "event": format!("p[{page}].b[{button}]"),
                        "value": state.as_str(),
                    })
                    .to_string(),
                ),
            ],
            Self::Touch { x, y, state } => {
                let subtopic = match state {
                    TouchState::Pressed => "touchOn",
                    TouchState::Released => "touchOff",
                };
                vec![Publication::new(
                    format!("{}/{subtopic}", topics.state),
                    format!("{x},{y}"),
                )]
            }
            Self::PageChanged { page } => vec![Publication::new(
                format!("{}/page", topics.state),
                page.to_string(),
            )],
            Self::StateReturn { subtopic, value } => vec![Publication::new(
                format!("{}{subtopic}", topics.state),
                value.clone(),
            )],
            Self::StartupReport { .. } | Self::PanelRebooted { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn topics() -> Topics {
        Topics::new("plate01", "plates")
    }

    #[test]
    fn builds_node_and_group_topics() {
        let topics = topics();
        assert_eq!(topics.state, "hasp/plate01/state");
        assert_eq!(topics.group_command, "hasp/plates/command");
        assert_eq!(
            topics.subscriptions(),
            [
                "hasp/plate01/command/#".to_string(),
                "hasp/plates/command/#".to_string(),
                "hasp/plate01/status".to_string(),
            ]
        );
    }

    #[test]
    fn routes_bare_command_topic() {
        let topics = topics();
        assert_eq!(
            topics.route("hasp/plate01/command", ""),
            Some(PlateCommand::StatusUpdate)
        );
        assert_eq!(
            topics.route("hasp/plates/command", "dim=50"),
            Some(PlateCommand::Raw("dim=50".to_string()))
        );
    }

    #[test]
    fn routes_named_subtopics() {
        let topics = topics();
        assert_eq!(
            topics.route("hasp/plate01/command/page", "3"),
            Some(PlateCommand::Page(3))
        );
        assert_eq!(topics.route("hasp/plate01/command/page", "x"), None);
        assert_eq!(
            topics.route("hasp/plate01/command/globalpage", "0"),
            Some(PlateCommand::PageScope {
                page: 0,
                global: true
            })
        );
        assert_eq!(topics.route("hasp/plate01/command/localpage", ""), None);
        assert_eq!(
            topics.route("hasp/plate01/command/lcdupdate", ""),
            Some(PlateCommand::LcdDownload(None))
        );
        assert_eq!(
            topics.route("hasp/plate01/command/lcdupdate", "http://nas/hasp.tft"),
            Some(PlateCommand::LcdDownload(Some("http://nas/hasp.tft".to_string())))
        );
        assert_eq!(
            topics.route("hasp/plate01/command/lcdreboot", ""),
            Some(PlateCommand::LcdReboot)
        );
        assert_eq!(topics.route("hasp/plate01/command/beep", "1,2,3"), None);
    }

    #[test]
    fn attribute_subtopics_get_or_set() {
        let topics = topics();
        assert_eq!(
            topics.route("hasp/plate01/command/p[1].b[4].txt", ""),
            Some(PlateCommand::GetAttr("p[1].b[4].txt".to_string()))
        );
        assert_eq!(
            topics.route("hasp/plates/command/p[1].b[4].txt", "\"Lights On\""),
            Some(PlateCommand::SetAttr {
                attr: "p[1].b[4].txt".to_string(),
                value: "\"Lights On\"".to_string()
            })
        );
    }

    #[test]
    fn ignores_foreign_topics_and_lookalikes() {
        let topics = topics();
        assert_eq!(topics.route("hasp/plate02/command", "dim=1"), None);
        assert_eq!(topics.route("hasp/plate01/commandeer", "x"), None);
        assert_eq!(topics.route("hasp/plate01/status", "ON"), None);
        assert_eq!(
            topics.route("hasp/plate01/status", "OFF"),
            Some(PlateCommand::ReassertOnline)
        );
    }

    #[test]
    fn button_event_publishes_plain_and_json() {
        let publications = HmiEvent::Button {
            page: 1,
            button: 2,
            state: TouchState::Pressed,
        }
        .publications(&topics());

        assert_eq!(publications[0], Publication::new("hasp/plate01/state/p[1].b[2]", "ON"));
        assert_eq!(publications[1].topic, "hasp/plate01/state/json");
        let json: serde_json::Value = serde_json::from_str(&publications[1].payload).unwrap();
        assert_eq!(json["event"], "p[1].b[2]");
        assert_eq!(json["value"], "ON");
    }

    #[test]
    fn touch_page_and_return_publications() {
        let topics = topics();
        assert_eq!(
            HmiEvent::Touch {
                x: 122,
                y: 30,
                state: TouchState::Released
            }
            .publications(&topics),
            vec![Publication::new("hasp/plate01/state/touchOff", "122,30")]
        );
        assert_eq!(
            HmiEvent::PageChanged { page: 2 }.publications(&topics),
            vec![Publication::new("hasp/plate01/state/page", "2")]
        );
        assert_eq!(
            HmiEvent::StateReturn {
                subtopic: "/p[1].b[2].val".to_string(),
                value: "42".to_string()
            }
            .publications(&topics),
            vec![Publication::new("hasp/plate01/state/p[1].b[2].val", "42")]
        );
        assert_eq!(
            HmiEvent::StateReturn {
                subtopic: String::new(),
                value: "hi".to_string()
            }
            .publications(&topics),
            vec![Publication::new("hasp/plate01/state", "hi")]
        );
    }

    #[test]
    fn goodbye_marks_plate_offline() {
        let [status, sensor] = topics().goodbye();
        assert_eq!(status, Publication::retained("hasp/plate01/status", "OFF"));
        assert_eq!(sensor.payload, r#"{"status":"unavailable"}"#);
    }

    #[test]
    fn status_report_serializes_camel_case() {
        let status = PlateStatus {
            status: "available",
            lcd_connected: true,
            lcd_version: "42".to_string(),
            lcd_model: Some("NX4832T035_011R".to_string()),
            connection_state: "connected",
            lcd_degraded: false,
            active_page: 1,
            esp_uptime: 60,
        };
        let [sensor, online] = topics().status_report(&status).unwrap();

        let json: serde_json::Value = serde_json::from_str(&sensor.payload).unwrap();
        assert_eq!(json["lcdConnected"], true);
        assert_eq!(json["lcdVersion"], "42");
        assert_eq!(json["espUptime"], 60);
        assert!(sensor.retain);
        assert_eq!(online.payload, "ON");
    }
}
