use log::{info, warn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    ProbingHandshake,
    ProbingAltBaud,
    QueryingVersion,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::ProbingHandshake => "probingHandshake",
            Self::ProbingAltBaud => "probingAltBaud",
            Self::QueryingVersion => "queryingVersion",
            Self::Connected => "connected",
        }
    }
}

/// What the driver currently knows about the panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub responding: bool,
    pub model_known: bool,
    pub version_known: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    SendConnect,
    /// Talk at 9600, ask the panel to switch to 115200, then follow it.
    ProbeAltBaud,
    QueryVersion {
        reconnect: bool,
    },
    /// Fires once, the first time the supervisor reaches `Connected`.
    StartupReport {
        degraded: bool,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorTiming {
    pub check_interval_ms: u64,
    pub retry_max: u32,
    pub boot_wait_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    timing: SupervisorTiming,
    state: ConnectionState,
    retries: u32,
    started_ms: Option<u64>,
    last_check_ms: Option<u64>,
    degraded: bool,
    reported: bool,
}

impl ConnectionSupervisor {
    pub fn new(timing: SupervisorTiming) -> Self {
        Self {
            timing,
            state: ConnectionState::Disconnected,
            retries: 0,
            started_ms: None,
            last_check_ms: None,
            degraded: false,
            reported: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Connected without ever learning the panel version.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn tick(&mut self, now_ms: u64, status: LinkStatus) -> Option<SupervisorAction> {
        let started = *self.started_ms.get_or_insert(now_ms);

        if self.state == ConnectionState::Connected {
            if self.degraded && status.version_known {
                info!("HMI panel version arrived late, leaving degraded mode");
                self.degraded = false;
            }
            return None;
        }

        if status.version_known {
            return self.connect(false);
        }

        if self.state == ConnectionState::Disconnected {
            let waited = now_ms.saturating_sub(started);
            if status.responding {
                info!("HMI panel responding, sending connect");
                self.state = ConnectionState::ProbingHandshake;
                self.last_check_ms = Some(now_ms);
                return Some(SupervisorAction::SendConnect);
            }
            if waited < self.timing.boot_wait_ms {
                return None;
            }
            info!("HMI panel silent after {waited} ms, probing");
            self.state = ConnectionState::ProbingHandshake;
        }

        if let Some(last) = self.last_check_ms {
            if now_ms.saturating_sub(last) < self.timing.check_interval_ms {
                return None;
            }
        }

        let max = self.timing.retry_max;
        let action = if !status.model_known && self.retries < max.saturating_sub(2) {
            self.state = ConnectionState::ProbingHandshake;
            SupervisorAction::SendConnect
        } else if !status.model_known && self.retries < max {
            self.state = ConnectionState::ProbingAltBaud;
            SupervisorAction::ProbeAltBaud
        } else if self.retries <= max {
            self.state = ConnectionState::QueryingVersion;
            SupervisorAction::QueryVersion {
                reconnect: !status.model_known,
            }
        } else {
            warn!("HMI panel did not report a version after {} retries", self.retries);
            return self.connect(true);
        };

        self.retries += 1;
        self.last_check_ms = Some(now_ms);
        Some(action)
    }

    fn connect(&mut self, degraded: bool) -> Option<SupervisorAction> {
        self.state = ConnectionState::Connected;
        self.degraded = degraded;
        if self.reported {
            return None;
        }
        self.reported = true;
        Some(SupervisorAction::StartupReport { degraded })
    }
}
