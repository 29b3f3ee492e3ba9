use std::io::Read;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use hasp_common::topics::STATUS_ONLINE;
use hasp_common::{
    Clock, HmiEvent, NetworkQuiesce, Nextion, OtaError, PanelLink, PlateCommand, PlateStatus,
    Publication, RuntimeConfig, Topics, TransferConfig, TransferReport,
};
use log::{debug, info, warn};

const LOOP_IDLE_MS: u64 = 5;
const CHUNK_WAIT_MS: u64 = 100;

/// A remote TFT image, opened and sized but not yet read.
pub struct FirmwareSource {
    pub size: u32,
    pub reader: Box<dyn Read>,
}

/// What the scheduler needs from the board it runs on.
pub trait Platform: NetworkQuiesce {
    fn publish(&mut self, publication: &Publication);

    fn fetch_firmware(&mut self, url: &str) -> anyhow::Result<FirmwareSource>;

    /// Reboots the device. Host builds exit the process instead.
    fn restart(&mut self);

    fn status_changed(&mut self, _status: &PlateStatus) {}
}

pub enum LoopCommand {
    Plate(PlateCommand),
    /// Local upload. The image arrives in chunks until the sender hangs up.
    Upload {
        size: u32,
        chunks: Receiver<Vec<u8>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Restart,
}

/// The one loop that owns the panel. Every subsystem advances a little per
/// `step`; nothing in here blocks except a firmware transfer, which ends in
/// a restart anyway.
pub struct PlateLoop<L: PanelLink, C: Clock, P: Platform> {
    nextion: Nextion<L>,
    clock: C,
    platform: P,
    topics: Topics,
    transfer: TransferConfig,
    firmware_url: String,
    status_interval_ms: u64,
    next_status_ms: Option<u64>,
    commands: Receiver<LoopCommand>,
}

impl<L: PanelLink, C: Clock, P: Platform> PlateLoop<L, C, P> {
    pub fn new(
        nextion: Nextion<L>,
        clock: C,
        platform: P,
        runtime: &RuntimeConfig,
        commands: Receiver<LoopCommand>,
    ) -> Self {
        Self {
            nextion,
            clock,
            platform,
            topics: Topics::new(&runtime.network.node_name, &runtime.network.group_name),
            transfer: runtime.transfer.clone(),
            firmware_url: runtime.network.lcd_firmware_url.clone(),
            status_interval_ms: runtime.network.status_interval_ms,
            next_status_ms: None,
            commands,
        }
    }

    pub fn nextion(&self) -> &Nextion<L> {
        &self.nextion
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn run(mut self) {
        info!("HMI: loop started");
        loop {
            match self.step() {
                Step::Continue => self.clock.sleep_ms(LOOP_IDLE_MS),
                Step::Restart => {
                    self.platform.restart();
                    return;
                }
            }
        }
    }

    pub fn step(&mut self) -> Step {
        while let Ok(command) = self.commands.try_recv() {
            if self.handle(command) == Step::Restart {
                return Step::Restart;
            }
        }

        let now_ms = self.clock.now_ms();
        for event in self.nextion.poll(now_ms) {
            self.dispatch(event, now_ms);
        }

        if self.next_status_ms.is_some_and(|due| now_ms >= due) {
            self.publish_status(now_ms);
        }
        Step::Continue
    }

    pub fn status(&self, now_ms: u64) -> PlateStatus {
        PlateStatus {
            status: "available",
            lcd_connected: self.nextion.lcd_connected(),
            lcd_version: self.nextion.lcd_version().to_string(),
            lcd_model: self.nextion.model().map(str::to_string),
            connection_state: self.nextion.connection_state().as_str(),
            lcd_degraded: self.nextion.is_degraded(),
            active_page: self.nextion.active_page(),
            esp_uptime: now_ms / 1000,
        }
    }

    fn dispatch(&mut self, event: HmiEvent, now_ms: u64) {
        match event {
            HmiEvent::StartupReport { .. } | HmiEvent::PanelRebooted { .. } => {
                self.publish_status(now_ms)
            }
            event => {
                for publication in event.publications(&self.topics) {
                    self.platform.publish(&publication);
                }
            }
        }
    }

    fn publish_status(&mut self, now_ms: u64) {
        let status = self.status(now_ms);
        match self.topics.status_report(&status) {
            Ok(publications) => {
                for publication in &publications {
                    self.platform.publish(publication);
                }
            }
            Err(err) => warn!("MQTT: status serialization failed: {err}"),
        }
        self.platform.status_changed(&status);

        for page in self.nextion.cache().stats() {
            if page.attributes > 0 {
                debug!(
                    "HMI: cache page {} global={} attributes={} text_bytes={}",
                    page.page, page.global, page.attributes, page.text_bytes
                );
            }
        }
        self.next_status_ms = Some(now_ms + self.status_interval_ms);
    }

    fn handle(&mut self, command: LoopCommand) -> Step {
        match command {
            LoopCommand::Plate(command) => self.apply(command),
            LoopCommand::Upload { size, chunks } => self.upload(size, &chunks),
        }
    }

    fn apply(&mut self, command: PlateCommand) -> Step {
        match command {
            PlateCommand::StatusUpdate => self.publish_status(self.clock.now_ms()),
            PlateCommand::Raw(text) => {
                self.nextion.send_cmd(&text);
            }
            PlateCommand::Json(payload) => {
                if let Err(err) = self.nextion.parse_json(&payload) {
                    warn!("MQTT: rejected JSON command array: {err}");
                }
            }
            PlateCommand::Page(page) => {
                self.nextion.change_page(page);
            }
            PlateCommand::PageScope { page, global } => self.nextion.set_page_global(page, global),
            PlateCommand::GetAttr(attr) => {
                self.nextion.get_attr(&attr);
            }
            PlateCommand::SetAttr { attr, value } => {
                self.nextion.set_attr(&attr, &value);
            }
            PlateCommand::LcdDownload(url) => {
                let url = url.unwrap_or_else(|| self.firmware_url.clone());
                return self.download(&url);
            }
            PlateCommand::LcdReboot => self.nextion.reset_panel(self.clock.now_ms()),
            PlateCommand::Reboot => {
                info!("MQTT: reboot requested");
                self.say_goodbye();
                return Step::Restart;
            }
            PlateCommand::ReassertOnline => {
                info!("MQTT: stale OFF on our status topic, re-asserting ON");
                self.platform
                    .publish(&Publication::retained(&self.topics.status, STATUS_ONLINE));
            }
        }
        Step::Continue
    }

    fn upload(&mut self, size: u32, chunks: &Receiver<Vec<u8>>) -> Step {
        match self.stream_upload(size, chunks) {
            Err(OtaError::UnknownSize) => {
                warn!("LCD OTA: upload rejected, file size was never declared");
                Step::Continue
            }
            outcome => self.conclude(outcome),
        }
    }

    fn stream_upload(
        &mut self,
        size: u32,
        chunks: &Receiver<Vec<u8>>,
    ) -> Result<TransferReport, OtaError> {
        let mut transfer = self.nextion.start_firmware_transfer(
            &self.clock,
            self.transfer.clone(),
            size,
            &mut self.platform,
        )?;
        loop {
            match chunks.recv_timeout(Duration::from_millis(CHUNK_WAIT_MS)) {
                Ok(chunk) => transfer.write(&chunk)?,
                Err(RecvTimeoutError::Timeout) => transfer.check_inactivity()?,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        transfer.finish()
    }

    fn download(&mut self, url: &str) -> Step {
        info!("LCD OTA: attempting firmware download from {url}");
        let outcome = self.relay_download(url);
        self.conclude(outcome)
    }

    fn relay_download(&mut self, url: &str) -> Result<TransferReport, OtaError> {
        let source = self
            .platform
            .fetch_firmware(url)
            .map_err(|err| OtaError::Source(format!("{err:#}")))?;
        info!("LCD OTA: file found at server, {} bytes", source.size);

        let mut transfer = self.nextion.start_firmware_transfer(
            &self.clock,
            self.transfer.clone(),
            source.size,
            &mut self.platform,
        )?;
        transfer.relay(source.reader)?;
        transfer.finish()
    }

    fn conclude(&mut self, outcome: Result<TransferReport, OtaError>) -> Step {
        match outcome {
            Ok(report) => {
                info!(
                    "LCD OTA: success, wrote {} bytes in {} parts",
                    report.bytes, report.parts
                );
                // The panel may still be applying a bundled update of its own.
                self.clock.sleep_ms(self.transfer.settle_ms);
            }
            Err(err) => warn!("LCD OTA: failure, {err}"),
        }
        self.say_goodbye();
        Step::Restart
    }

    fn say_goodbye(&mut self) {
        for publication in self.topics.goodbye() {
            self.platform.publish(&publication);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::mpsc::{self, Sender};

    use hasp_common::{LinkError, NextionConfig};
    use pretty_assertions::assert_eq;

    use super::*;

    const ACK: u8 = 0x05;

    #[derive(Default)]
    struct ScriptedLink {
        input: VecDeque<u8>,
        written: Vec<u8>,
        replies: VecDeque<Vec<u8>>,
    }

    impl ScriptedLink {
        fn commands(&self) -> Vec<String> {
            let mut commands = Vec::new();
            let mut current = Vec::new();
            let mut ff = 0;
            for byte in &self.written {
                if *byte == 0xFF {
                    ff += 1;
                    if ff == 3 {
                        commands.push(String::from_utf8_lossy(&current).into_owned());
                        current.clear();
                        ff = 0;
                    }
                    continue;
                }
                ff = 0;
                current.push(*byte);
            }
            commands
        }
    }

    impl PanelLink for ScriptedLink {
        fn read_byte(&mut self) -> Option<u8> {
            self.input.pop_front()
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
            self.written.extend_from_slice(bytes);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), LinkError> {
            if let Some(reply) = self.replies.pop_front() {
                self.input.extend(reply);
            }
            Ok(())
        }

        fn set_baud_rate(&mut self, _baud: u32) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestClock {
        now: Cell<u64>,
    }

    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.now.get()
        }

        fn sleep_ms(&self, ms: u64) {
            self.now.set(self.now.get() + ms);
        }
    }

    #[derive(Default)]
    struct RecordingPlatform {
        published: Vec<Publication>,
        quiesced: u32,
        firmware: Option<Vec<u8>>,
    }

    impl RecordingPlatform {
        fn payload(&self, topic: &str) -> Option<&str> {
            self.published
                .iter()
                .rev()
                .find(|publication| publication.topic == topic)
                .map(|publication| publication.payload.as_str())
        }
    }

    impl NetworkQuiesce for RecordingPlatform {
        fn quiesce(&mut self) {
            self.quiesced += 1;
        }
    }

    impl Platform for RecordingPlatform {
        fn publish(&mut self, publication: &Publication) {
            self.published.push(publication.clone());
        }

        fn fetch_firmware(&mut self, url: &str) -> anyhow::Result<FirmwareSource> {
            let image = self
                .firmware
                .take()
                .ok_or_else(|| anyhow::anyhow!("404 for {url}"))?;
            Ok(FirmwareSource {
                size: image.len() as u32,
                reader: Box::new(Cursor::new(image)),
            })
        }

        fn restart(&mut self) {}
    }

    type TestLoop = PlateLoop<ScriptedLink, TestClock, RecordingPlatform>;

    fn plate(link: ScriptedLink) -> (TestLoop, Sender<LoopCommand>) {
        let (tx, rx) = mpsc::channel();
        let nextion = Nextion::new(link, NextionConfig::default()).unwrap();
        let plate = PlateLoop::new(
            nextion,
            TestClock::default(),
            RecordingPlatform::default(),
            &RuntimeConfig::default(),
            rx,
        );
        (plate, tx)
    }

    fn send(tx: &Sender<LoopCommand>, command: PlateCommand) {
        tx.send(LoopCommand::Plate(command)).unwrap();
    }

    #[test]
    fn button_press_is_published() {
        let link = ScriptedLink {
            input: [0x65, 0x01, 0x02, 0x01, 0xFF, 0xFF, 0xFF].into(),
            ..ScriptedLink::default()
        };
        let (mut plate, _tx) = plate(link);

        assert_eq!(plate.step(), Step::Continue);
        assert_eq!(
            plate.platform().payload("hasp/plate01/state/p[1].b[2]"),
            Some("ON")
        );
    }

    #[test]
    fn bus_commands_reach_the_panel() {
        let (mut plate, tx) = plate(ScriptedLink::default());
        send(&tx, PlateCommand::Raw("dim=50".to_string()));
        send(&tx, PlateCommand::Page(3));

        plate.step();

        let commands = plate.nextion().link().commands();
        assert_eq!(&commands[..2], ["dim=50", "page 3"]);
    }

    #[test]
    fn status_update_publishes_report_and_repeats_on_interval() {
        let (mut plate, tx) = plate(ScriptedLink::default());
        send(&tx, PlateCommand::StatusUpdate);
        plate.step();

        assert_eq!(plate.platform().payload("hasp/plate01/status"), Some("ON"));
        let sensor: serde_json::Value =
            serde_json::from_str(plate.platform().payload("hasp/plate01/sensor").unwrap())
                .unwrap();
        assert_eq!(sensor["status"], "available");
        assert_eq!(sensor["lcdConnected"], false);

        let reports = plate.platform().published.len();
        plate.clock.sleep_ms(300_000);
        plate.step();
        assert_eq!(plate.platform().published.len(), reports + 2);
    }

    #[test]
    fn stale_offline_status_is_overwritten() {
        let (mut plate, tx) = plate(ScriptedLink::default());
        send(&tx, PlateCommand::ReassertOnline);
        plate.step();

        let last = plate.platform().published.last().unwrap();
        assert_eq!(last, &Publication::retained("hasp/plate01/status", "ON"));
    }

    #[test]
    fn reboot_says_goodbye_first() {
        let (mut plate, tx) = plate(ScriptedLink::default());
        send(&tx, PlateCommand::Reboot);

        assert_eq!(plate.step(), Step::Restart);
        assert_eq!(plate.platform().payload("hasp/plate01/status"), Some("OFF"));
        assert_eq!(
            plate.platform().payload("hasp/plate01/sensor"),
            Some(r#"{"status":"unavailable"}"#)
        );
    }

    #[test]
    fn upload_without_size_is_rejected_without_restart() {
        let (mut plate, tx) = plate(ScriptedLink::default());
        let (_chunk_tx, chunks) = mpsc::channel();
        tx.send(LoopCommand::Upload { size: 0, chunks }).unwrap();

        assert_eq!(plate.step(), Step::Continue);
        assert_eq!(plate.platform().quiesced, 0);
        assert!(plate.nextion().link().written.is_empty());
    }

    #[test]
    fn local_upload_streams_every_part_then_restarts() {
        let link = ScriptedLink {
            replies: [vec![], vec![ACK], vec![ACK], vec![ACK]].into(),
            ..ScriptedLink::default()
        };
        let (mut plate, tx) = plate(link);
        let (chunk_tx, chunks) = mpsc::channel();
        for _ in 0..8 {
            chunk_tx.send(vec![0xAB; 1024]).unwrap();
        }
        drop(chunk_tx);
        tx.send(LoopCommand::Upload { size: 8192, chunks }).unwrap();

        assert_eq!(plate.step(), Step::Restart);
        assert_eq!(plate.platform().quiesced, 1);
        assert!(plate.clock.now_ms() >= 5_000);
        let written = &plate.nextion().link().written;
        assert_eq!(written.iter().filter(|byte| **byte == 0xAB).count(), 8192);
        assert_eq!(plate.platform().payload("hasp/plate01/status"), Some("OFF"));
    }

    #[test]
    fn missing_part_ack_still_restarts() {
        let link = ScriptedLink {
            replies: [vec![], vec![ACK]].into(),
            ..ScriptedLink::default()
        };
        let (mut plate, tx) = plate(link);
        let (chunk_tx, chunks) = mpsc::channel();
        chunk_tx.send(vec![0; 4096]).unwrap();
        drop(chunk_tx);
        tx.send(LoopCommand::Upload { size: 8192, chunks }).unwrap();

        assert_eq!(plate.step(), Step::Restart);
        assert!(plate.clock.now_ms() < 5_000);
        assert_eq!(plate.platform().payload("hasp/plate01/status"), Some("OFF"));
    }

    #[test]
    fn download_relays_the_image() {
        let link = ScriptedLink {
            replies: [vec![], vec![ACK], vec![ACK], vec![ACK]].into(),
            ..ScriptedLink::default()
        };
        let (mut plate, tx) = plate(link);
        plate.platform.firmware = Some(vec![0x5A; 5000]);
        send(&tx, PlateCommand::LcdDownload(None));

        assert_eq!(plate.step(), Step::Restart);
        let link = plate.nextion().link();
        assert_eq!(link.commands()[1], "whmi-wri 5000,115200,0");
        assert_eq!(link.written.iter().filter(|byte| **byte == 0x5A).count(), 5000);
    }

    #[test]
    fn failed_download_restarts_without_touching_the_panel() {
        let (mut plate, tx) = plate(ScriptedLink::default());
        send(
            &tx,
            PlateCommand::LcdDownload(Some("http://example.invalid/x.tft".to_string())),
        );

        assert_eq!(plate.step(), Step::Restart);
        assert_eq!(plate.platform().quiesced, 0);
        assert!(plate.nextion().link().written.is_empty());
    }
}
