//! Host↔firmware interface definitions.
//!
//! The firmware binary is built against this exact layout. Message type
//! codes are ABI: the inference request/response codes in particular are
//! baked into the RTL verification environment and must never be renumbered.
//!
//! All multi-byte fields are **host-native byte order** — the mailbox lives
//! in shared memory on the same SoC, there is no cross-endian hop.
//!
//! # Ring layout
//!
//! Each mailbox direction is one ring in shared memory:
//!
//! ```text
//! { capacity: u32, read: u32, <pad to QUEUE_ALIGN>,
//!   write: u32,               <pad to QUEUE_ALIGN>,
//!   data: u8[capacity] }
//! ```
//!
//! `capacity` must be a power of two. The ring holds at most
//! `capacity − 1` live bytes — one slot is permanently sacrificed so that
//! `read == write` always means *empty*, never *full*. The read and write
//! indices sit on separate cache lines so the two sides can flush and
//! invalidate independently.

/// Alignment separating host-written and firmware-written ring fields.
/// Matches the largest cache line across supported SoCs.
pub const QUEUE_ALIGN: usize = 128;

/// Size in bytes of [`MessageHeader`] on the wire.
pub const HEADER_SIZE: usize = 8;

/// Maximum number of hardware counters a profiling configuration can select.
pub const MAX_HW_COUNTERS: usize = 6;

/// Message type codes.
///
/// The numeric values are ABI — do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Host → firmware: run an inference. Payload: [`InferenceRequest`].
    InferenceRequest = 0,
    /// Firmware → host: inference finished. Payload: [`InferenceResponse`].
    InferenceResponse = 1,
    /// Firmware → host: free-form log line. Payload: severity `u32` + UTF-8 text.
    Text = 2,
    /// Host → firmware: profiling reconfiguration. Payload: [`ProfilingConfigPayload`].
    ConfigureProfiling = 3,
    /// Firmware → host: profiling reconfiguration committed. No payload.
    ConfigureProfilingAck = 4,
    /// Host → firmware: announce a memory region. Payload: [`RegionRequest`].
    RegionRequest = 5,
    /// Firmware → host: region setup result. Payload: [`RegionResponse`].
    RegionResponse = 6,
    /// Host → firmware: liveness probe. No payload.
    Ping = 7,
    /// Firmware → host: liveness reply. No payload.
    Pong = 8,
    /// Host → firmware: request the capability blob. No payload.
    CapsRequest = 9,
    /// Firmware → host: capability blob, stored verbatim by the host.
    CapsResponse = 10,
    /// Firmware → host: generic error report. Payload: [`ErrorReport`].
    ErrorReport = 11,
}

impl MessageType {
    /// Decode a wire type code. Returns `None` for codes this driver does
    /// not know — the dispatcher logs and discards those.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::InferenceRequest,
            1 => Self::InferenceResponse,
            2 => Self::Text,
            3 => Self::ConfigureProfiling,
            4 => Self::ConfigureProfilingAck,
            5 => Self::RegionRequest,
            6 => Self::RegionResponse,
            7 => Self::Ping,
            8 => Self::Pong,
            9 => Self::CapsRequest,
            10 => Self::CapsResponse,
            11 => Self::ErrorReport,
            _ => return None,
        })
    }
}

/// Message header: every message begins with this, payload follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw wire type code. May be a code this driver build does not know.
    pub msg_type: u32,
    /// Length in bytes of the payload that follows the header.
    pub length: u32,
}

impl MessageHeader {
    /// Build a header for a known message type.
    #[must_use]
    pub const fn new(msg_type: MessageType, length: u32) -> Self {
        Self {
            msg_type: msg_type as u32,
            length,
        }
    }

    /// Decode the type code, if known.
    #[must_use]
    pub const fn message_type(&self) -> Option<MessageType> {
        MessageType::from_raw(self.msg_type)
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.msg_type.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.length.to_ne_bytes());
        buf
    }

    /// Parse from wire bytes. Returns `None` if `buf` is too short.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            msg_type: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            length: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
        })
    }
}

/// Log severity carried by [`MessageType::Text`] messages and negotiated in
/// the mailbox descriptor. Lower value = more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum LogSeverity {
    /// Firmware is about to halt.
    Panic = 0,
    /// Operation failed.
    Error = 1,
    /// Unexpected but survivable condition.
    Warning = 2,
    /// Normal operational notice.
    Info = 3,
    /// Debug detail.
    Debug = 4,
    /// Per-message tracing.
    Verbose = 5,
}

impl LogSeverity {
    /// Decode a wire severity; out-of-range values clamp to `Verbose`,
    /// matching the firmware's own clamping.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Panic,
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            4 => Self::Debug,
            _ => Self::Verbose,
        }
    }
}

/// Memory regions the host announces to the firmware during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RegionId {
    /// Firmware code image.
    Firmware = 0,
    /// Mailbox queues, stacks, scratch.
    WorkingData = 1,
    /// Compiled-network command streams and buffer tables.
    CommandStream = 2,
}

impl RegionId {
    /// Every region, in the order bring-up announces them.
    pub const ALL: [Self; 3] = [Self::Firmware, Self::WorkingData, Self::CommandStream];

    /// Decode a wire region id.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Firmware,
            1 => Self::WorkingData,
            2 => Self::CommandStream,
            _ => return None,
        })
    }
}

/// Generic OK/error status used by response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseStatus {
    /// Operation succeeded.
    Ok = 0,
    /// Operation failed.
    Error = 1,
}

impl ResponseStatus {
    /// Decode a wire status; any nonzero value is an error.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        if raw == 0 { Self::Ok } else { Self::Error }
    }
}

/// Payload of [`MessageType::InferenceRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceRequest {
    /// Opaque host token, echoed back in the response. The firmware never
    /// interprets it.
    pub token: u64,
    /// Device address of the prepared buffer table.
    pub buffer_table: u64,
}

impl InferenceRequest {
    /// Wire size in bytes.
    pub const SIZE: usize = 16;

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.token.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.buffer_table.to_ne_bytes());
        buf
    }

    /// Parse from wire bytes.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            token: u64::from_ne_bytes(buf[0..8].try_into().ok()?),
            buffer_table: u64::from_ne_bytes(buf[8..16].try_into().ok()?),
        })
    }
}

/// Payload of [`MessageType::InferenceResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceResponse {
    /// The token from the matching [`InferenceRequest`].
    pub token: u64,
    /// Raw completion status, see [`ResponseStatus`].
    pub status: u32,
}

impl InferenceResponse {
    /// Wire size in bytes.
    pub const SIZE: usize = 12;

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.token.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.status.to_ne_bytes());
        buf
    }

    /// Parse from wire bytes.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            token: u64::from_ne_bytes(buf[0..8].try_into().ok()?),
            status: u32::from_ne_bytes(buf[8..12].try_into().ok()?),
        })
    }
}

/// Payload of [`MessageType::RegionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    /// Raw region id, see [`RegionId`].
    pub region: u32,
    /// Size in bytes of the region.
    pub size: u32,
}

impl RegionRequest {
    /// Wire size in bytes.
    pub const SIZE: usize = 8;

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.region.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.size.to_ne_bytes());
        buf
    }

    /// Parse from wire bytes.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            region: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            size: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
        })
    }
}

/// Payload of [`MessageType::RegionResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionResponse {
    /// Raw region id, see [`RegionId`].
    pub region: u32,
    /// Raw setup status, see [`ResponseStatus`].
    pub status: u32,
}

impl RegionResponse {
    /// Wire size in bytes.
    pub const SIZE: usize = 8;

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.region.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.status.to_ne_bytes());
        buf
    }

    /// Parse from wire bytes.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            region: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            status: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
        })
    }
}

/// Payload of [`MessageType::ConfigureProfiling`].
///
/// Describes the profiling state the firmware should move to. The buffer is
/// the *lossy* ring the firmware writes entries into — the firmware never
/// waits for the host to catch up, it simply overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingConfigPayload {
    /// Nonzero to enable profiling.
    pub enabled: u32,
    /// Device address of the profiling ring, 0 when disabled.
    pub buffer_addr: u64,
    /// Ring capacity in entries.
    pub buffer_entries: u32,
    /// Number of valid entries in `hw_counters`.
    pub num_hw_counters: u32,
    /// Selected hardware counter ids.
    pub hw_counters: [u32; MAX_HW_COUNTERS],
}

impl ProfilingConfigPayload {
    /// Wire size in bytes.
    pub const SIZE: usize = 4 + 8 + 4 + 4 + 4 * MAX_HW_COUNTERS;

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.enabled.to_ne_bytes());
        buf[4..12].copy_from_slice(&self.buffer_addr.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.buffer_entries.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.num_hw_counters.to_ne_bytes());
        for (i, c) in self.hw_counters.iter().enumerate() {
            buf[20 + i * 4..24 + i * 4].copy_from_slice(&c.to_ne_bytes());
        }
        buf
    }

    /// Parse from wire bytes.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut hw_counters = [0u32; MAX_HW_COUNTERS];
        for (i, c) in hw_counters.iter_mut().enumerate() {
            *c = u32::from_ne_bytes(buf[20 + i * 4..24 + i * 4].try_into().ok()?);
        }
        Some(Self {
            enabled: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            buffer_addr: u64::from_ne_bytes(buf[4..12].try_into().ok()?),
            buffer_entries: u32::from_ne_bytes(buf[12..16].try_into().ok()?),
            num_hw_counters: u32::from_ne_bytes(buf[16..20].try_into().ok()?),
            hw_counters,
        })
    }
}

/// One entry in the firmware-written profiling ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfilingEntry {
    /// Firmware cycle counter at the event.
    pub timestamp: u64,
    /// Event id.
    pub id: u32,
    /// Event kind (begin/end/counter sample).
    pub kind: u32,
}

impl ProfilingEntry {
    /// Size in bytes of one entry in the ring.
    pub const SIZE: usize = 16;

    /// Encode to ring bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.id.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.kind.to_ne_bytes());
        buf
    }

    /// Parse from ring bytes.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            timestamp: u64::from_ne_bytes(buf[0..8].try_into().ok()?),
            id: u32::from_ne_bytes(buf[8..12].try_into().ok()?),
            kind: u32::from_ne_bytes(buf[12..16].try_into().ok()?),
        })
    }
}

/// Payload of [`MessageType::ErrorReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    /// Firmware-defined error code.
    pub code: u32,
    /// Error-specific detail word.
    pub detail: u32,
}

impl ErrorReport {
    /// Wire size in bytes.
    pub const SIZE: usize = 8;

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.code.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.detail.to_ne_bytes());
        buf
    }

    /// Parse from wire bytes.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            code: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            detail: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_codes_are_pinned() {
        // Baked into the RTL verification environment.
        assert_eq!(MessageType::InferenceRequest as u32, 0);
        assert_eq!(MessageType::InferenceResponse as u32, 1);
    }

    #[test]
    fn header_round_trip() {
        let h = MessageHeader::new(MessageType::Text, 42);
        let parsed = MessageHeader::parse(&h.encode()).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.message_type(), Some(MessageType::Text));
    }

    #[test]
    fn unknown_type_decodes_to_none() {
        let h = MessageHeader {
            msg_type: 0xdead,
            length: 0,
        };
        assert_eq!(h.message_type(), None);
    }

    #[test]
    fn inference_request_round_trip() {
        let req = InferenceRequest {
            token: 0x1122_3344_5566_7788,
            buffer_table: 0x6000_0000,
        };
        assert_eq!(InferenceRequest::parse(&req.encode()), Some(req));
    }

    #[test]
    fn severity_clamps_out_of_range() {
        assert_eq!(LogSeverity::from_raw(99), LogSeverity::Verbose);
        assert_eq!(LogSeverity::from_raw(0), LogSeverity::Panic);
    }

    #[test]
    fn profiling_config_round_trip() {
        let cfg = ProfilingConfigPayload {
            enabled: 1,
            buffer_addr: 0x7000_0000,
            buffer_entries: 256,
            num_hw_counters: 2,
            hw_counters: [3, 7, 0, 0, 0, 0],
        };
        assert_eq!(ProfilingConfigPayload::parse(&cfg.encode()), Some(cfg));
    }

    #[test]
    fn truncated_payloads_fail_to_parse() {
        let rsp = InferenceResponse {
            token: 1,
            status: 0,
        };
        let bytes = rsp.encode();
        assert!(InferenceResponse::parse(&bytes[..bytes.len() - 1]).is_none());
    }
}
