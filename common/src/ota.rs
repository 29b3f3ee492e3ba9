use std::io::{ErrorKind, Read};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::TransferConfig;
use crate::link::{Clock, LinkError, PanelLink};
use crate::protocol::{encode_command, upload_command, OTA_ACK, TERMINATOR};

/// The panel commits its flash in pages of this size and acks each one.
pub const PART_SIZE: u32 = 4096;
pub const BUFFER_SIZE: usize = 1024;

const ACK_POLL_MS: u64 = 5;
const IDLE_POLL_MS: u64 = 10;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("firmware size was not declared before the upload started")]
    UnknownSize,
    #[error("panel did not accept the upload command")]
    HandshakeRejected,
    #[error("panel did not acknowledge part {part}")]
    PartRejected { part: u32 },
    #[error("panel did not acknowledge the final part")]
    FinalAckMissing,
    #[error("declared {declared} bytes but received {transferred}")]
    SizeMismatch { declared: u32, transferred: u64 },
    #[error("no firmware data for {idle_ms} ms")]
    Inactivity { idle_ms: u64 },
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("firmware source failed: {0}")]
    Source(String),
}

/// Anything that must stop talking to the network before the panel is
/// flashed.
pub trait NetworkQuiesce {
    fn quiesce(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaSession {
    pub declared_size: u32,
    pub transferred: u32,
    pub part_bytes: u32,
    pub parts_acked: u32,
    pub last_activity_ms: u64,
}

impl OtaSession {
    pub fn remaining(&self) -> u32 {
        self.declared_size - self.transferred
    }

    pub fn percent(&self) -> u32 {
        ((u64::from(self.transferred) * 100) / u64::from(self.declared_size.max(1))) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u32,
    pub parts: u32,
}

/// Streams a TFT image into the panel. Holds the link for its whole life,
/// so nothing else can write to the panel mid-flash.
pub struct FirmwareTransfer<'a, L: PanelLink, C: Clock> {
    link: &'a mut L,
    clock: &'a C,
    config: TransferConfig,
    session: OtaSession,
    buffer: [u8; BUFFER_SIZE],
}

impl<'a, L: PanelLink, C: Clock> FirmwareTransfer<'a, L, C> {
    pub fn begin(
        link: &'a mut L,
        clock: &'a C,
        config: TransferConfig,
        declared_size: u32,
    ) -> Result<Self, OtaError> {
        if declared_size == 0 {
            return Err(OtaError::UnknownSize);
        }

        info!(
            "LCD OTA: starting upload of {declared_size} bytes in {} parts",
            declared_size.div_ceil(PART_SIZE)
        );

        // Empty command first so the panel discards any half-typed instruction.
        link.write_all(&TERMINATOR)?;
        link.flush()?;
        let dropped = link.drain_input();
        if dropped > 0 {
            debug!("LCD OTA: dropped {dropped} stale bytes before handshake");
        }

        let command = upload_command(declared_size, config.upload_baud);
        debug!("HMI OUT: {command}");
        link.write_all(&encode_command(&command))?;
        link.flush()?;

        let mut transfer = Self {
            link,
            clock,
            session: OtaSession {
                declared_size,
                transferred: 0,
                part_bytes: 0,
                parts_acked: 0,
                last_activity_ms: clock.now_ms(),
            },
            config,
            buffer: [0; BUFFER_SIZE],
        };

        if !transfer.wait_ack() {
            warn!("LCD OTA: upload command rejected");
            return Err(OtaError::HandshakeRejected);
        }
        info!("LCD OTA: upload command accepted");
        transfer.session.last_activity_ms = clock.now_ms();
        Ok(transfer)
    }

    pub fn session(&self) -> &OtaSession {
        &self.session
    }

    /// Pushes the next slice of the image.
    pub fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let incoming = u64::from(self.session.transferred) + data.len() as u64;
        if incoming > u64::from(self.session.declared_size) {
            return Err(OtaError::SizeMismatch {
                declared: self.session.declared_size,
                transferred: incoming,
            });
        }

        let mut rest = data;
        while !rest.is_empty() {
            let len = self.next_chunk_len().min(rest.len());
            self.buffer[..len].copy_from_slice(&rest[..len]);
            self.send_buffered(len)?;
            rest = &rest[len..];
        }
        Ok(())
    }

    /// Pulls the rest of the image from `source`. Reads that report
    /// `WouldBlock`, `TimedOut` or `Interrupted` count as idle time.
    pub fn relay<R: Read>(&mut self, mut source: R) -> Result<(), OtaError> {
        while self.session.remaining() > 0 {
            let want = self.next_chunk_len();
            match source.read(&mut self.buffer[..want]) {
                Ok(0) => {
                    return Err(OtaError::Source(format!(
                        "stream ended after {} of {} bytes",
                        self.session.transferred, self.session.declared_size
                    )))
                }
                Ok(len) => self.send_buffered(len)?,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    self.check_inactivity()?;
                    self.clock.sleep_ms(IDLE_POLL_MS);
                }
                Err(err) => return Err(OtaError::Source(err.to_string())),
            }
        }
        Ok(())
    }

    pub fn check_inactivity(&self) -> Result<(), OtaError> {
        let idle_ms = self
            .clock
            .now_ms()
            .saturating_sub(self.session.last_activity_ms);
        if idle_ms > self.config.inactivity_timeout_ms {
            warn!("LCD OTA: upload stalled for {idle_ms} ms");
            return Err(OtaError::Inactivity { idle_ms });
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<TransferReport, OtaError> {
        if self.session.transferred != self.session.declared_size {
            return Err(OtaError::SizeMismatch {
                declared: self.session.declared_size,
                transferred: u64::from(self.session.transferred),
            });
        }

        if self.session.part_bytes > 0 {
            self.link.flush()?;
            if !self.wait_ack() {
                warn!("LCD OTA: final part not acknowledged");
                return Err(OtaError::FinalAckMissing);
            }
            self.session.parts_acked += 1;
            self.session.part_bytes = 0;
        }

        info!(
            "LCD OTA: complete, {} bytes in {} parts",
            self.session.transferred, self.session.parts_acked
        );
        Ok(TransferReport {
            bytes: self.session.transferred,
            parts: self.session.parts_acked,
        })
    }

    fn next_chunk_len(&self) -> usize {
        let part_left = PART_SIZE - self.session.part_bytes;
        BUFFER_SIZE
            .min(part_left as usize)
            .min(self.session.remaining() as usize)
    }

    fn send_buffered(&mut self, len: usize) -> Result<(), OtaError> {
        self.link.write_all(&self.buffer[..len])?;
        self.session.transferred += len as u32;
        self.session.part_bytes += len as u32;
        self.session.last_activity_ms = self.clock.now_ms();

        if self.session.part_bytes < PART_SIZE {
            return Ok(());
        }

        self.link.flush()?;
        let part = self.session.parts_acked + 1;
        if !self.wait_ack() {
            warn!("LCD OTA: part {part} failed at {}%", self.session.percent());
            return Err(OtaError::PartRejected { part });
        }
        self.session.parts_acked = part;
        self.session.part_bytes = 0;
        self.session.last_activity_ms = self.clock.now_ms();
        info!("LCD OTA: part {part} OK, {}% complete", self.session.percent());
        Ok(())
    }

    fn wait_ack(&mut self) -> bool {
        let started = self.clock.now_ms();
        loop {
            while let Some(byte) = self.link.read_byte() {
                if byte == OTA_ACK {
                    return true;
                }
                debug!("LCD OTA: ignoring byte 0x{byte:02X} while waiting for ack");
            }
            if self.clock.now_ms().saturating_sub(started) >= self.config.ack_timeout_ms {
                return false;
            }
            self.clock.sleep_ms(ACK_POLL_MS);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::{ManualClock, MockLink};

    const ACK: &[u8] = &[OTA_ACK];

    /// Flush for the empty command, then the handshake ack.
    fn accepting_link() -> MockLink {
        let mut link = MockLink::default();
        link.queue_reply(&[0x1A, 0xFF, 0xFF, 0xFF]);
        link.queue_reply(ACK);
        link
    }

    #[test]
    fn unknown_size_is_rejected_before_touching_the_link() {
        let mut link = MockLink::default();
        let clock = ManualClock::default();

        let result = FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 0);

        assert!(matches!(result, Err(OtaError::UnknownSize)));
        assert!(link.written.is_empty());
    }

    #[test]
    fn handshake_sends_flush_then_upload_command() {
        let mut link = accepting_link();
        let clock = ManualClock::default();

        let transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 100).unwrap();
        assert_eq!(transfer.session().declared_size, 100);
        drop(transfer);

        assert_eq!(
            link.commands(),
            vec!["".to_string(), "whmi-wri 100,115200,0".to_string()]
        );
    }

    #[test]
    fn missing_handshake_ack_aborts_before_payload() {
        let mut link = MockLink::default();
        let clock = ManualClock::default();

        let result = FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 4096);

        assert!(matches!(result, Err(OtaError::HandshakeRejected)));
        assert!(clock.now_ms() >= 2_000);
    }

    #[test]
    fn exact_two_parts_need_exactly_two_acks() {
        let mut link = accepting_link();
        link.queue_reply(ACK);
        link.queue_reply(ACK);
        let clock = ManualClock::default();
        let image = vec![0xAB; 8192];

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 8192).unwrap();
        for chunk in image.chunks(1500) {
            transfer.write(chunk).unwrap();
        }
        let report = transfer.finish().unwrap();

        assert_eq!(report, TransferReport { bytes: 8192, parts: 2 });
        assert!(link.replies.is_empty());
    }

    #[test]
    fn partial_last_part_waits_for_final_ack() {
        let mut link = accepting_link();
        link.queue_reply(ACK);
        link.queue_reply(ACK);
        let clock = ManualClock::default();

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 5000).unwrap();
        transfer.write(&[1; 5000]).unwrap();
        let report = transfer.finish().unwrap();

        assert_eq!(report, TransferReport { bytes: 5000, parts: 2 });
    }

    #[test]
    fn missing_final_ack_is_fatal() {
        let mut link = accepting_link();
        link.queue_reply(ACK);
        let clock = ManualClock::default();

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 5000).unwrap();
        transfer.write(&[1; 5000]).unwrap();

        assert!(matches!(transfer.finish(), Err(OtaError::FinalAckMissing)));
    }

    #[test]
    fn dropped_ack_mid_transfer_never_reports_success() {
        let mut link = accepting_link();
        link.queue_reply(ACK);
        link.queue_reply(&[]);
        let clock = ManualClock::default();

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 12_288).unwrap();
        let result = transfer.write(&[0; 12_288]);

        assert!(matches!(result, Err(OtaError::PartRejected { part: 2 })));
        assert_eq!(transfer.session().parts_acked, 1);
        assert!(transfer.session().transferred < 12_288);
    }

    #[test]
    fn finishing_short_is_a_size_mismatch() {
        let mut link = accepting_link();
        let clock = ManualClock::default();

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 4096).unwrap();
        transfer.write(&[0; 100]).unwrap();

        assert!(matches!(
            transfer.finish(),
            Err(OtaError::SizeMismatch {
                declared: 4096,
                transferred: 100
            })
        ));
    }

    #[test]
    fn data_past_declared_size_is_rejected() {
        let mut link = accepting_link();
        let clock = ManualClock::default();

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 10).unwrap();

        assert!(matches!(
            transfer.write(&[0; 11]),
            Err(OtaError::SizeMismatch { .. })
        ));
        assert_eq!(transfer.session().transferred, 0);
    }

    #[test]
    fn writes_to_uart_never_exceed_buffer_or_cross_parts() {
        let mut link = accepting_link();
        link.queue_reply(ACK);
        let clock = ManualClock::default();

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 4096).unwrap();
        transfer.write(&[7; 3000]).unwrap();
        assert_eq!(transfer.session().part_bytes, 3000);
        transfer.write(&[7; 1096]).unwrap();
        assert_eq!(transfer.session().part_bytes, 0);
        assert_eq!(transfer.session().parts_acked, 1);
    }

    struct StallingSource {
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Read for StallingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(Ok(bytes)) => {
                    let len = bytes.len().min(buf.len());
                    buf[..len].copy_from_slice(&bytes[..len]);
                    Ok(len)
                }
                Some(Err(err)) => Err(err),
                None => Err(io::Error::from(ErrorKind::WouldBlock)),
            }
        }
    }

    #[test]
    fn relay_streams_a_remote_image() {
        let mut link = accepting_link();
        link.queue_reply(ACK);
        let clock = ManualClock::default();
        let source = StallingSource {
            chunks: VecDeque::from(vec![
                Ok(vec![1; 1024]),
                Err(io::Error::from(ErrorKind::Interrupted)),
                Ok(vec![2; 1024]),
                Ok(vec![3; 1024]),
                Ok(vec![4; 1024]),
            ]),
        };

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 4096).unwrap();
        transfer.relay(source).unwrap();

        assert_eq!(transfer.finish().unwrap().parts, 1);
    }

    #[test]
    fn relay_gives_up_when_source_goes_quiet() {
        let mut link = accepting_link();
        let clock = ManualClock::default();
        let source = StallingSource {
            chunks: VecDeque::from(vec![Ok(vec![1; 512])]),
        };

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 4096).unwrap();
        let result = transfer.relay(source);

        assert!(matches!(result, Err(OtaError::Inactivity { idle_ms }) if idle_ms > 30_000));
    }

    #[test]
    fn relay_reports_truncated_stream() {
        let mut link = accepting_link();
        let clock = ManualClock::default();
        let source: &[u8] = &[0; 100];

        let mut transfer =
            FirmwareTransfer::begin(&mut link, &clock, TransferConfig::default(), 4096).unwrap();

        assert!(matches!(transfer.relay(source), Err(OtaError::Source(_))));
    }
}
