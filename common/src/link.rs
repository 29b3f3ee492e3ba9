use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("serial write failed: {0}")]
    Write(String),
    #[error("serial reconfigure failed: {0}")]
    Configure(String),
}

/// Byte-level access to the panel UART.
///
/// Reads never block: `None` means nothing is buffered right now.
pub trait PanelLink {
    fn read_byte(&mut self) -> Option<u8>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    fn flush(&mut self) -> Result<(), LinkError>;

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), LinkError>;

    /// Power-cycles the panel when the board wires a reset line.
    fn pulse_reset(&mut self) {}

    /// Drops everything currently buffered on the receive side.
    fn drain_input(&mut self) -> usize {
        let mut dropped = 0;
        while self.read_byte().is_some() {
            dropped += 1;
        }
        dropped
    }
}

pub trait Clock {
    fn now_ms(&self) -> u64;

    fn sleep_ms(&self, ms: u64);
}
