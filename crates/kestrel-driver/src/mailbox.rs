//! Per-core mailbox
//!
//! A mailbox is the pair of message queues joining the host to one core's
//! firmware: a request queue (host → firmware) and a response queue
//! (firmware → host), plus the negotiated log-severity threshold. Framing
//! is an 8-byte header (`type`, `length`) followed by `length` payload
//! bytes.
//!
//! The firmware may commit a message header before its payload is visible.
//! [`Mailbox::receive`] detects that and reports "nothing yet" instead of
//! corruption — the caller retries on the next drain pass, after the next
//! interrupt.

use bytes::Bytes;
use kestrel_chip::fw::{LogSeverity, MessageHeader, MessageType, HEADER_SIZE};
use tracing::{debug, warn};

use crate::error::{KestrelError, Result};
use crate::queue::{MessageQueue, QueueReader, QueueWriter};

/// Host ends of one core's message queues.
#[derive(Debug)]
pub struct Mailbox {
    request: QueueWriter,
    response: QueueReader,
    severity: LogSeverity,
    sent: u64,
    received: u64,
}

/// Firmware ends of one core's message queues, handed to the bus when the
/// mailbox is attached. On real hardware the region grant makes these
/// visible to the MCU; the simulator's firmware model drives them directly.
#[derive(Debug)]
pub struct FirmwareChannel {
    /// Firmware's reading end of the request queue.
    pub request: QueueReader,
    /// Firmware's writing end of the response queue.
    pub response: QueueWriter,
    /// Log-severity threshold the firmware must honor.
    pub severity: LogSeverity,
}

/// One fully received message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Wire header. The type code may be unknown to this driver build.
    pub header: MessageHeader,
    /// Payload bytes, exactly `header.length` of them.
    pub payload: Bytes,
}

impl Mailbox {
    /// Create the queue pair for one core.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is not a valid queue capacity.
    pub fn new(capacity: u32, severity: LogSeverity) -> Result<(Self, FirmwareChannel)> {
        let (req_writer, req_reader) = MessageQueue::pair(capacity)?;
        let (rsp_writer, rsp_reader) = MessageQueue::pair(capacity)?;

        let mailbox = Self {
            request: req_writer,
            response: rsp_reader,
            severity,
            sent: 0,
            received: 0,
        };
        let firmware = FirmwareChannel {
            request: req_reader,
            response: rsp_writer,
            severity,
        };

        Ok((mailbox, firmware))
    }

    /// Largest payload a single message can carry in this mailbox.
    #[must_use]
    pub fn max_payload_len(&self) -> u32 {
        self.request.capacity() - 1 - HEADER_SIZE as u32
    }

    /// Negotiated log-severity threshold.
    #[must_use]
    pub const fn severity(&self) -> LogSeverity {
        self.severity
    }

    /// Messages successfully sent since creation.
    #[must_use]
    pub const fn messages_sent(&self) -> u64 {
        self.sent
    }

    /// Messages fully received since creation.
    #[must_use]
    pub const fn messages_received(&self) -> u64 {
        self.received
    }

    /// Send one message: header and payload as a single atomic write.
    ///
    /// The queue publishes the write index only after every byte is copied,
    /// so the firmware can never observe a partial message from the host.
    ///
    /// # Errors
    ///
    /// - `KestrelError::MessageTooLarge` if the message can never fit.
    /// - `KestrelError::QueueFull` if it does not fit right now; nothing is
    ///   written and the caller may retry after the firmware drains.
    pub fn send(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<()> {
        let total = (HEADER_SIZE + payload.len()) as u32;
        if !self.request.can_ever_fit(total) {
            return Err(KestrelError::MessageTooLarge {
                length: total,
                max: self.request.capacity() - 1,
            });
        }

        let header = MessageHeader::new(msg_type, payload.len() as u32);
        self.request.write(&[&header.encode(), payload])?;
        self.sent += 1;

        let (read, write) = self.request.indices();
        debug!(
            "Sent message. type={:?}, length={}, read={}, write={}",
            msg_type,
            payload.len(),
            read,
            write
        );
        Ok(())
    }

    /// Receive the next fully visible message, if any.
    ///
    /// Returns `Ok(None)` when the queue is empty *or* when a header is
    /// visible but its payload is not yet — the firmware has committed the
    /// header first and the payload will arrive with the next interrupt.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Protocol` if a header declares a length that
    /// can never fit in the queue. The readable bytes are discarded to
    /// resynchronize with the writer.
    pub fn receive(&mut self) -> Result<Option<ReceivedMessage>> {
        let used = self.response.used_size();
        if used < HEADER_SIZE as u32 {
            return Ok(None);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        self.response.peek(&mut header_bytes)?;
        let header = MessageHeader::parse(&header_bytes)
            .ok_or_else(|| KestrelError::protocol("short header"))?;

        let max = self.max_payload_len();
        if header.length > max {
            warn!(
                "Discarding oversized message. type={}, length={}, max={}",
                header.msg_type, header.length, max
            );
            let available = self.response.used_size();
            self.response.skip(available)?;
            return Err(KestrelError::protocol(format!(
                "declared payload length {} exceeds queue maximum {max}",
                header.length
            )));
        }

        // The writer may have committed the header but not yet the payload.
        // Consume nothing and retry on the next drain pass.
        if used - (HEADER_SIZE as u32) < header.length {
            debug!(
                "Deferring message with pending payload. type={}, length={}, available={}",
                header.msg_type,
                header.length,
                used - HEADER_SIZE as u32
            );
            return Ok(None);
        }

        self.response.skip(HEADER_SIZE as u32)?;
        let mut payload = vec![0u8; header.length as usize];
        self.response.read(&mut payload)?;
        self.received += 1;

        let (read, write) = self.response.indices();
        debug!(
            "Received message. type={}, length={}, read={}, write={}",
            header.msg_type, header.length, read, write
        );

        Ok(Some(ReceivedMessage {
            header,
            payload: Bytes::from(payload),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_chip::fw::InferenceRequest;

    fn pair() -> (Mailbox, FirmwareChannel) {
        Mailbox::new(256, LogSeverity::Info).unwrap()
    }

    #[test]
    fn send_is_visible_to_firmware_end() {
        let (mut mb, mut fw) = pair();
        let req = InferenceRequest {
            token: 7,
            buffer_table: 0x6000_0000,
        };
        mb.send(MessageType::InferenceRequest, &req.encode()).unwrap();

        let mut header_bytes = [0u8; HEADER_SIZE];
        fw.request.read(&mut header_bytes).unwrap();
        let header = MessageHeader::parse(&header_bytes).unwrap();
        assert_eq!(header.message_type(), Some(MessageType::InferenceRequest));
        assert_eq!(header.length as usize, InferenceRequest::SIZE);

        let mut payload = [0u8; InferenceRequest::SIZE];
        fw.request.read(&mut payload).unwrap();
        assert_eq!(InferenceRequest::parse(&payload), Some(req));
        assert_eq!(mb.messages_sent(), 1);
    }

    #[test]
    fn receive_round_trips_firmware_message() {
        let (mut mb, mut fw) = pair();
        let header = MessageHeader::new(MessageType::Pong, 0);
        fw.response.write(&[&header.encode()]).unwrap();

        let msg = mb.receive().unwrap().unwrap();
        assert_eq!(msg.header.message_type(), Some(MessageType::Pong));
        assert!(msg.payload.is_empty());
        assert_eq!(mb.messages_received(), 1);
    }

    #[test]
    fn header_without_payload_is_deferred_not_corrupt() {
        let (mut mb, mut fw) = pair();

        // Firmware commits the header first, payload later.
        let header = MessageHeader::new(MessageType::Text, 16);
        fw.response.write(&[&header.encode()]).unwrap();

        assert!(mb.receive().unwrap().is_none());
        // Nothing consumed: the header is still there for the retry.
        assert_eq!(mb.messages_received(), 0);

        let mut payload = vec![4u8; 12];
        payload.extend_from_slice(b"late");
        fw.response.write(&[&payload]).unwrap();

        let msg = mb.receive().unwrap().unwrap();
        assert_eq!(msg.header.length, 16);
        assert_eq!(&msg.payload[12..], b"late");
    }

    #[test]
    fn oversized_message_is_rejected_before_send() {
        let (mut mb, _fw) = pair();
        let huge = vec![0u8; 512];
        let err = mb.send(MessageType::Text, &huge).unwrap_err();
        assert!(matches!(err, KestrelError::MessageTooLarge { .. }));
    }

    #[test]
    fn full_queue_send_fails_without_partial_write() {
        let (mut mb, fw) = pair();
        // Fill the request queue almost completely.
        let chunk = vec![0u8; 200];
        mb.send(MessageType::Text, &chunk).unwrap();

        let err = mb.send(MessageType::Text, &chunk).unwrap_err();
        assert!(matches!(err, KestrelError::QueueFull { .. }));
        // Firmware still sees exactly one message worth of bytes.
        assert_eq!(fw.request.used_size(), (HEADER_SIZE + 200) as u32);
    }

    #[test]
    fn impossible_declared_length_discards_and_errors() {
        let (mut mb, mut fw) = pair();
        let bogus = MessageHeader {
            msg_type: MessageType::Text as u32,
            length: 10_000,
        };
        fw.response.write(&[&bogus.encode()]).unwrap();

        let err = mb.receive().unwrap_err();
        assert!(matches!(err, KestrelError::Protocol { .. }));
        // Queue was resynchronized.
        assert!(mb.receive().unwrap().is_none());
    }
}
