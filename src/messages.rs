//! # Transport PDU Descriptors
//!
//! Types describing a received lower transport PDU after the network layer
//! has authenticated and decrypted it, plus the Segment Acknowledgment
//! control message this node emits.
//!
//! ## Framing
//!
//! | Framing | Raw PDU layout | Delivered upward |
//! |---------|----------------|------------------|
//! | Unsegmented | `header(1) \|\| access payload \|\| TransMIC(4)` | access payload |
//! | Segmented | `header(4) \|\| segment` | reassembled payload minus TransMIC |
//!
//! Every segment except the last carries exactly [`SEG_ACCESS_PDU_MAX_SIZE`]
//! bytes of the upper transport PDU. The TransMIC at the end of the
//! reassembled PDU is 4 or 8 bytes depending on SZMIC.
//!
//! ## Segment Acknowledgment
//!
//! ```text
//! [SEG=0 | opcode=0x00][OBO | SeqZero(13) | RFU(2)][BlockAck(32, big endian)]
//! ```

use std::fmt;

/// Unsegmented lower transport header length.
pub const UNSEG_PDU_OFFSET: usize = 1;

/// Segmented lower transport header length.
pub const SEG_PDU_OFFSET: usize = 4;

pub const TRANSMIC_SMALL_SIZE: usize = 4;
pub const TRANSMIC_LARGE_SIZE: usize = 8;

/// Upper transport bytes carried by each non-final segment.
pub const SEG_ACCESS_PDU_MAX_SIZE: usize = 12;

/// Largest access payload that fits an unsegmented PDU.
pub const UNSEG_ACCESS_PDU_MAX_SIZE: usize = 15;

/// SegN is 5 bits wide.
pub const MAX_SEGMENTS: u8 = 32;

/// SeqZero is the 13 low bits of the first segment's sequence number.
pub const SEQZERO_MAX: u16 = 0x1FFF;

pub const SEQNUM_MAX: u32 = 0x00FF_FFFF;

/// Encoded length of a Segment Acknowledgment PDU.
pub const SEG_ACK_PDU_SIZE: usize = 7;

const SEG_ACK_OPCODE: u8 = 0x00;
const SEG_ACK_OBO_BIT: u16 = 1 << 15;


// ============================================================================
// Addressing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Unicast,
    Group,
    Virtual,
}

impl AddressType {
    /// Classify a 16-bit mesh address. The unassigned address has no class.
    pub fn classify(addr: u16) -> Option<Self> {
        match addr {
            0x0000 => None,
            0x0001..=0x7FFF => Some(Self::Unicast),
            0x8000..=0xBFFF => Some(Self::Virtual),
            0xC000..=0xFFFF => Some(Self::Group),
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unicast => write!(f, "unicast"),
            Self::Group => write!(f, "group"),
            Self::Virtual => write!(f, "virtual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub value: u16,
    pub kind: AddressType,
}

impl Destination {
    pub fn new(value: u16, kind: AddressType) -> Self {
        Self { value, kind }
    }

    /// Build a destination from a raw address, deriving its class.
    pub fn from_address(value: u16) -> Option<Self> {
        AddressType::classify(value).map(|kind| Self { value, kind })
    }

    pub fn is_unicast(&self) -> bool {
        self.kind == AddressType::Unicast
    }
}


// ============================================================================
// Per-PDU metadata
// ============================================================================

/// Network metadata resolved for one received PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduMetadata {
    pub src: u16,
    pub dst: Destination,
    /// 24-bit sequence number.
    pub seq: u32,
    pub iv_index: u32,
    pub ttl: u8,
}

impl PduMetadata {
    pub fn new(src: u16, dst: Destination, seq: u32, iv_index: u32) -> Self {
        Self {
            src,
            dst,
            seq: seq & SEQNUM_MAX,
            iv_index,
            ttl: 0,
        }
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// SeqAuth of the segmented message this PDU belongs to, as
    /// `iv_index << 24 | seq` of its first segment.
    ///
    /// The first segment's sequence number is the latest one not above `seq`
    /// whose low 13 bits equal `seqzero`. It may fall in the previous epoch.
    pub fn seq_auth(&self, seqzero: u16) -> u64 {
        let current = (u64::from(self.iv_index) << 24) | u64::from(self.seq);
        let delta = self.seq.wrapping_sub(u32::from(seqzero)) & u32::from(SEQZERO_MAX);
        current.saturating_sub(u64::from(delta))
    }
}

/// How the caller resolved a PDU's destination against this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxAddressing {
    /// The destination is one of this node's elements or subscriptions.
    pub for_local: bool,
    /// The destination is a friend's unicast address this node acks for.
    pub ack_on_behalf_of_friend: bool,
}

impl RxAddressing {
    pub fn local() -> Self {
        Self { for_local: true, ack_on_behalf_of_friend: false }
    }

    pub fn friend() -> Self {
        Self { for_local: false, ack_on_behalf_of_friend: true }
    }

    pub fn foreign() -> Self {
        Self::default()
    }

    /// Whether a segment sent to `dst` is acknowledged, and with which OBO
    /// value. Only unicast targets are acknowledged.
    pub fn ack_obo(&self, dst: &Destination) -> Option<bool> {
        if !dst.is_unicast() {
            return None;
        }
        if self.for_local {
            Some(false)
        } else if self.ack_on_behalf_of_friend {
            Some(true)
        } else {
            None
        }
    }
}

/// Role a forwarded copy is tagged with when handed to the friend queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxRole {
    Originator,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Unsegmented,
    Segmented,
}

impl Framing {
    pub fn header_len(self) -> usize {
        match self {
            Self::Unsegmented => UNSEG_PDU_OFFSET,
            Self::Segmented => SEG_PDU_OFFSET,
        }
    }
}


// ============================================================================
// Segmentation parameters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransMicSize {
    #[default]
    Small,
    Large,
}

impl TransMicSize {
    pub fn len(self) -> usize {
        match self {
            Self::Small => TRANSMIC_SMALL_SIZE,
            Self::Large => TRANSMIC_LARGE_SIZE,
        }
    }
}

/// Why a segment was rejected before touching any session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    /// The lower transport header is missing or the PDU is too short.
    Truncated { len: usize },
    /// Unsegmented upper transport PDU longer than a single PDU can carry.
    Oversized { len: usize, max: usize },
    /// SeqZero does not fit in 13 bits.
    InvalidSeqZero(u16),
    /// SegN + 1 is zero or exceeds [`MAX_SEGMENTS`].
    InvalidSegmentCount(u8),
    /// SegO is not below the declared segment count.
    IndexOutOfRange { index: u8, count: u8 },
    /// Total length cannot be split into the declared number of segments.
    InvalidTotalLength { total_len: usize, count: u8 },
    /// Segment carries a different number of bytes than its position requires.
    LengthMismatch { index: u8, expected: usize, actual: usize },
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => write!(f, "PDU truncated ({} bytes)", len),
            Self::Oversized { len, max } => {
                write!(f, "upper transport PDU of {} bytes exceeds {}", len, max)
            }
            Self::InvalidSeqZero(seqzero) => write!(f, "SeqZero {:#06x} exceeds 13 bits", seqzero),
            Self::InvalidSegmentCount(count) => write!(f, "invalid segment count {}", count),
            Self::IndexOutOfRange { index, count } => {
                write!(f, "segment index {} outside declared count {}", index, count)
            }
            Self::InvalidTotalLength { total_len, count } => {
                write!(f, "total length {} does not fit {} segments", total_len, count)
            }
            Self::LengthMismatch { index, expected, actual } => write!(
                f,
                "segment {} carries {} bytes, expected {}",
                index, actual, expected
            ),
        }
    }
}

impl std::error::Error for SegmentError {}

/// Session parameters the caller derives from a segment's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SarParams {
    pub seqzero: u16,
    pub segment_count: u8,
    /// Length of the reassembled upper transport PDU, TransMIC included.
    pub total_len: usize,
    pub mic: TransMicSize,
}

impl SarParams {
    pub fn new(seqzero: u16, segment_count: u8, total_len: usize) -> Self {
        Self {
            seqzero,
            segment_count,
            total_len,
            mic: TransMicSize::Small,
        }
    }

    pub fn with_mic(mut self, mic: TransMicSize) -> Self {
        self.mic = mic;
        self
    }

    /// Bitmap with one bit set per expected segment.
    pub fn complete_mask(&self) -> u32 {
        if self.segment_count >= MAX_SEGMENTS {
            u32::MAX
        } else {
            (1u32 << self.segment_count) - 1
        }
    }

    /// Number of bytes segment `index` must carry.
    pub fn segment_len(&self, index: u8) -> usize {
        let last = self.segment_count.saturating_sub(1);
        if index < last {
            SEG_ACCESS_PDU_MAX_SIZE
        } else {
            self.total_len
                .saturating_sub(last as usize * SEG_ACCESS_PDU_MAX_SIZE)
        }
    }

    /// Validate the parameters and one segment against them.
    pub fn check_segment(&self, index: u8, len: usize) -> Result<(), SegmentError> {
        if self.seqzero > SEQZERO_MAX {
            return Err(SegmentError::InvalidSeqZero(self.seqzero));
        }
        let count = self.segment_count;
        if count == 0 || count > MAX_SEGMENTS {
            return Err(SegmentError::InvalidSegmentCount(count));
        }
        if index >= count {
            return Err(SegmentError::IndexOutOfRange { index, count });
        }

        let min_len = (count as usize - 1) * SEG_ACCESS_PDU_MAX_SIZE;
        let max_len = count as usize * SEG_ACCESS_PDU_MAX_SIZE;
        if self.total_len <= min_len
            || self.total_len > max_len
            || self.total_len <= self.mic.len()
        {
            return Err(SegmentError::InvalidTotalLength {
                total_len: self.total_len,
                count,
            });
        }

        let expected = self.segment_len(index);
        if len != expected {
            return Err(SegmentError::LengthMismatch {
                index,
                expected,
                actual: len,
            });
        }
        Ok(())
    }
}


// ============================================================================
// Segment Acknowledgment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    pub seqzero: u16,
    /// Bit `n` set means segment `n` was received.
    pub block_ack: u32,
    /// Sent on behalf of a friend rather than for this node.
    pub obo: bool,
}

impl SegmentAck {
    pub fn to_bytes(&self) -> [u8; SEG_ACK_PDU_SIZE] {
        let mut out = [0u8; SEG_ACK_PDU_SIZE];
        out[0] = SEG_ACK_OPCODE;

        let mut params = (self.seqzero & SEQZERO_MAX) << 2;
        if self.obo {
            params |= SEG_ACK_OBO_BIT;
        }
        out[1..3].copy_from_slice(&params.to_be_bytes());
        out[3..7].copy_from_slice(&self.block_ack.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SEG_ACK_PDU_SIZE || bytes[0] != SEG_ACK_OPCODE {
            return None;
        }
        let params = u16::from_be_bytes([bytes[1], bytes[2]]);
        let block_ack = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        Some(Self {
            seqzero: (params >> 2) & SEQZERO_MAX,
            block_ack,
            obo: params & SEG_ACK_OBO_BIT != 0,
        })
    }
}
