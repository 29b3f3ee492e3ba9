use log::{debug, info, warn};

use crate::cache::{CacheError, CachedAttr, PageCache};
use crate::command::{AttrCommand, Dispatch};
use crate::config::{ConfigError, NextionConfig, TransferConfig};
use crate::frame::{Frame, Framer};
use crate::link::{Clock, LinkError, PanelLink};
use crate::ota::{FirmwareTransfer, NetworkQuiesce, OtaError};
use crate::protocol::{
    decode, encode_command, get_command, page_command, InboundMessage, TouchState, CMD_BAUD_RESTORE,
    CMD_CONNECT, CMD_REBOOT, PANEL_ALT_BAUD, PANEL_BAUD, TERMINATOR,
};
use crate::supervisor::{ConnectionState, ConnectionSupervisor, LinkStatus, SupervisorAction};

/// Something the panel told us that the rest of the plate should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HmiEvent {
    Button {
        page: u8,
        button: u8,
        state: TouchState,
    },
    Touch {
        x: u16,
        y: u16,
        state: TouchState,
    },
    PageChanged {
        page: u8,
    },
    /// A value returned by `get`. An empty subtopic means nobody asked.
    StateReturn {
        subtopic: String,
        value: String,
    },
    StartupReport {
        degraded: bool,
    },
    PanelRebooted {
        responding: bool,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum InputStatus {
    Idle,
    Partial,
    Complete(Frame),
}

pub struct Nextion<L: PanelLink> {
    link: L,
    config: NextionConfig,
    framer: Framer,
    cache: PageCache,
    supervisor: ConnectionSupervisor,
    active_page: u8,
    lcd_connected: bool,
    model: Option<String>,
    lcd_version: u32,
    version_query_pending: bool,
    pending_query: Option<String>,
    reset_deadline_ms: Option<u64>,
    events: Vec<HmiEvent>,
}

impl<L: PanelLink> Nextion<L> {
    pub fn new(link: L, config: NextionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            link,
            cache: PageCache::new(config.page_count, config.button_count),
            supervisor: ConnectionSupervisor::new(config.timing()),
            config,
            framer: Framer::new(),
            active_page: 0,
            lcd_connected: false,
            model: None,
            lcd_version: 0,
            version_query_pending: false,
            pending_query: None,
            reset_deadline_ms: None,
            events: Vec::new(),
        })
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Panel firmware version, 0 until the panel answers the version query.
    pub fn lcd_version(&self) -> u32 {
        self.lcd_version
    }

    pub fn lcd_connected(&self) -> bool {
        self.lcd_connected
    }

    pub fn active_page(&self) -> u8 {
        self.active_page
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn is_degraded(&self) -> bool {
        self.supervisor.is_degraded()
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Consumes at most one byte from the panel.
    pub fn handle_input(&mut self) -> InputStatus {
        let Some(byte) = self.link.read_byte() else {
            return InputStatus::Idle;
        };
        if !self.lcd_connected {
            info!("HMI: LCD responding");
            self.lcd_connected = true;
        }
        match self.framer.push(byte) {
            Some(frame) => {
                debug!("HMI IN: {:02X?}", frame.as_bytes());
                InputStatus::Complete(frame)
            }
            None => InputStatus::Partial,
        }
    }

    pub fn process_input(&mut self, frame: &Frame) {
        let Some(message) = decode(frame) else {
            return;
        };

        match message {
            InboundMessage::Touch {
                page,
                button,
                state,
            } => {
                debug!("HMI IN: [Button {}] 'p[{page}].b[{button}]'", state.as_str());
                self.events.push(HmiEvent::Button {
                    page,
                    button,
                    state,
                });
                if state == TouchState::Released {
                    // Sliders and toggles only report .val on release; plain
                    // buttons answer 0x1A, which clears the query again.
                    self.get_attr(&format!("p[{page}].b[{button}].val"));
                }
            }
            InboundMessage::PageChange { page } => {
                debug!("HMI IN: [sendme Page] '{page}'");
                self.active_page = page;
                self.replay_page(page);
                if page != 0 || self.config.report_page0 {
                    self.events.push(HmiEvent::PageChanged { page });
                }
            }
            InboundMessage::Coordinate { x, y, state } => {
                debug!("HMI IN: [Touch {}] '{x},{y}'", state.as_str());
                self.events.push(HmiEvent::Touch { x, y, state });
            }
            InboundMessage::StringReturn(value) => {
                debug!("HMI IN: [String Return] '{value}'");
                self.resolve_query(value);
            }
            InboundMessage::IntReturn(value) => {
                debug!("HMI IN: [Int Return] '{value}'");
                if self.version_query_pending {
                    info!("HMI: lcdVersion {value}");
                    self.lcd_version = value;
                    self.version_query_pending = false;
                } else {
                    self.resolve_query(value.to_string());
                }
            }
            InboundMessage::Handshake { model } => match model {
                Some(model) => {
                    info!("HMI: Nextion model {model}");
                    self.model = Some(model);
                }
                None => warn!("HMI: handshake reply without a model field"),
            },
            InboundMessage::InvalidVariable => {
                if let Some(subtopic) = self.pending_query.take() {
                    debug!("HMI IN: no value for {subtopic}");
                }
                self.version_query_pending = false;
            }
        }
    }

    fn resolve_query(&mut self, value: String) {
        let subtopic = self.pending_query.take().unwrap_or_default();
        self.events.push(HmiEvent::StateReturn { subtopic, value });
    }

    /// One scheduler turn: drain up to `max_bytes_per_poll` bytes, then let
    /// the supervisor advance.
    pub fn poll(&mut self, now_ms: u64) -> Vec<HmiEvent> {
        for _ in 0..self.config.max_bytes_per_poll {
            match self.handle_input() {
                InputStatus::Idle => break,
                InputStatus::Partial => {}
                InputStatus::Complete(frame) => self.process_input(&frame),
            }
        }

        self.check_reset(now_ms);

        let status = LinkStatus {
            responding: self.lcd_connected,
            model_known: self.model.is_some(),
            version_known: self.lcd_version > 0,
        };
        if let Some(action) = self.supervisor.tick(now_ms, status) {
            self.run_supervisor(action);
        }

        std::mem::take(&mut self.events)
    }

    fn run_supervisor(&mut self, action: SupervisorAction) {
        match action {
            SupervisorAction::SendConnect => {
                info!("HMI: sending Nextion connect request");
                self.transmit(CMD_CONNECT);
            }
            SupervisorAction::ProbeAltBaud => {
                info!("HMI: no Nextion response, attempting {PANEL_ALT_BAUD}bps connection");
                if let Err(err) = self.probe_alt_baud() {
                    warn!("HMI: baud probe failed: {err}");
                }
            }
            SupervisorAction::QueryVersion { reconnect } => {
                if reconnect {
                    self.transmit(CMD_CONNECT);
                }
                info!("HMI: sending Nextion version query");
                let query = get_command(&self.config.version_query);
                self.transmit(&query);
                self.version_query_pending = true;
            }
            SupervisorAction::StartupReport { degraded } => {
                if degraded {
                    warn!("HMI: panel model/version unknown, continuing without them");
                }
                self.events.push(HmiEvent::StartupReport { degraded });
            }
        }
    }

    fn probe_alt_baud(&mut self) -> Result<(), LinkError> {
        self.link.set_baud_rate(PANEL_ALT_BAUD)?;
        self.link.write_all(&TERMINATOR)?;
        self.link.write_all(&encode_command(CMD_BAUD_RESTORE))?;
        self.link.flush()?;
        self.link.set_baud_rate(PANEL_BAUD)
    }

    /// Sends a command, routing page attribute writes through the cache.
    pub fn send_cmd(&mut self, text: &str) -> Dispatch {
        if !self.config.cache_enabled {
            return self.transmit(text);
        }
        let Some(cmd) = AttrCommand::parse(text) else {
            return self.transmit(text);
        };

        if let Err(err) = self.record(&cmd) {
            debug!("HMI: not cached ({err}): {text}");
        }
        let visible = u8::try_from(cmd.page)
            .is_ok_and(|page| page == self.active_page || self.cache.is_global(page));
        if visible {
            self.transmit(text)
        } else {
            debug!("HMI: held back for inactive page {}: {text}", cmd.page);
            Dispatch::Suppressed
        }
    }

    fn record(&mut self, cmd: &AttrCommand<'_>) -> Result<(), CacheError> {
        let page = u8::try_from(cmd.page).unwrap_or(u8::MAX);
        let button = u8::try_from(cmd.button).unwrap_or(u8::MAX);
        let attr = CachedAttr::parse(cmd.attr)
            .ok_or_else(|| CacheError::UnknownAttribute(cmd.attr.to_string()))?;
        self.cache.store(attr, page, button, cmd.value)
    }

    fn transmit(&mut self, text: &str) -> Dispatch {
        debug!("HMI OUT: {text}");
        match self.link.write_all(&encode_command(text)) {
            Ok(()) => Dispatch::Sent,
            Err(err) => {
                warn!("HMI OUT failed for '{text}': {err}");
                Dispatch::Failed
            }
        }
    }

    pub fn set_attr(&mut self, attr: &str, value: &str) -> Dispatch {
        self.send_cmd(&format!("{attr}={value}"))
    }

    /// Asks the panel for `attr`; the answer comes back as a
    /// `StateReturn` on subtopic `/<attr>`.
    pub fn get_attr(&mut self, attr: &str) -> Dispatch {
        self.pending_query = Some(format!("/{attr}"));
        self.transmit(&get_command(attr))
    }

    /// Runs every command of a JSON array, returning how many were sent.
    pub fn parse_json(&mut self, payload: &str) -> Result<usize, serde_json::Error> {
        let payload = payload.trim();
        let cleaned;
        let payload = match payload.strip_suffix(",]") {
            Some(head) => {
                cleaned = format!("{head}]");
                cleaned.as_str()
            }
            None => payload,
        };

        let commands: Vec<serde_json::Value> = serde_json::from_str(payload)?;
        let mut sent = 0;
        for command in commands {
            let dispatch = match command {
                serde_json::Value::Null => continue,
                serde_json::Value::String(text) => self.send_cmd(&text),
                other => self.send_cmd(&other.to_string()),
            };
            if dispatch != Dispatch::Failed {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Switches the panel to `page` unless it is already showing it.
    pub fn change_page(&mut self, page: u8) -> Dispatch {
        if self.active_page == page {
            debug!("HMI: page {page} already active");
            return Dispatch::Suppressed;
        }
        self.active_page = page;
        self.transmit(&page_command(page))
    }

    pub fn set_page_global(&mut self, page: u8, global: bool) {
        match self.cache.set_global(page, global) {
            Ok(()) => info!(
                "HMI: page {page} is now {}",
                if global { "global" } else { "local" }
            ),
            Err(err) => warn!("HMI: cannot change scope: {err}"),
        }
    }

    pub fn replay_page(&mut self, page: u8) -> usize {
        if !self.config.cache_enabled {
            return 0;
        }
        let commands = self.cache.replay_commands(page);
        if commands.is_empty() {
            return 0;
        }
        debug!("HMI: replaying {} cached commands for page {page}", commands.len());
        for command in &commands {
            self.transmit(command);
        }
        commands.len()
    }

    /// Reboots the panel. Completion is reported by a later `poll` as
    /// `PanelRebooted`.
    pub fn reset_panel(&mut self, now_ms: u64) {
        info!("HMI: Rebooting LCD");
        self.transmit(CMD_REBOOT);
        if let Err(err) = self.link.flush() {
            warn!("HMI: flush before reboot failed: {err}");
        }
        self.link.pulse_reset();
        self.framer.reset();
        self.lcd_connected = false;
        self.pending_query = None;
        self.reset_deadline_ms = Some(now_ms + self.config.reset_wait_ms);
    }

    fn check_reset(&mut self, now_ms: u64) {
        let Some(deadline) = self.reset_deadline_ms else {
            return;
        };
        if self.lcd_connected {
            info!("HMI: Rebooting LCD completed");
            self.reset_deadline_ms = None;
            if self.active_page != 0 {
                let page = self.active_page;
                self.transmit(&page_command(page));
            }
            self.events.push(HmiEvent::PanelRebooted { responding: true });
        } else if now_ms >= deadline {
            warn!("HMI: Rebooting LCD completed, but LCD is not responding");
            self.reset_deadline_ms = None;
            self.events.push(HmiEvent::PanelRebooted { responding: false });
        }
    }

    /// Hands the link to a firmware transfer. Nothing else can reach the
    /// panel until the transfer is dropped.
    pub fn start_firmware_transfer<'a, C: Clock>(
        &'a mut self,
        clock: &'a C,
        config: TransferConfig,
        declared_size: u32,
        network: &mut dyn NetworkQuiesce,
    ) -> Result<FirmwareTransfer<'a, L, C>, OtaError> {
        if declared_size == 0 {
            return Err(OtaError::UnknownSize);
        }
        network.quiesce();
        self.framer.reset();
        self.pending_query = None;
        self.version_query_pending = false;
        FirmwareTransfer::begin(&mut self.link, clock, config, declared_size)
    }
}
