use std::cell::Cell;
use std::collections::VecDeque;

use crate::link::{Clock, LinkError, PanelLink};

/// Scripted panel: bytes queued in `replies` become readable one batch per
/// `flush()`, the way the panel answers once a command hits the wire.
#[derive(Debug, Default)]
pub struct MockLink {
    pub input: VecDeque<u8>,
    pub written: Vec<u8>,
    pub replies: VecDeque<Vec<u8>>,
    pub bauds: Vec<u32>,
    pub resets: u32,
    pub fail_writes: bool,
}

impl MockLink {
    pub fn with_input(bytes: &[u8]) -> Self {
        Self {
            input: bytes.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    pub fn queue_reply(&mut self, bytes: &[u8]) {
        self.replies.push_back(bytes.to_vec());
    }

    /// Everything written so far, split on the command terminator.
    pub fn commands(&self) -> Vec<String> {
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
            current.extend(std::iter::repeat(0xFF).take(ff));
            ff = 0;
            current.push(*byte);
        }
        commands
    }

    pub fn take_commands(&mut self) -> Vec<String> {
        let commands = self.commands();
        self.written.clear();
        commands
    }
}

impl PanelLink for MockLink {
    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.fail_writes {
            return Err(LinkError::Write("mock link closed".to_string()));
        }
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LinkError> {
        if let Some(reply) = self.replies.pop_front() {
            self.input.extend(reply);
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), LinkError> {
        self.bauds.push(baud);
        Ok(())
    }

    fn pulse_reset(&mut self) {
        self.resets += 1;
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}
