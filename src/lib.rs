mod messages;
mod node;
mod protocols;
mod relay;
mod replay;
mod sar;
mod timer;
mod transport;

pub use messages::{
    AddressType, Destination, Framing, PduMetadata, RxAddressing, SarParams, SegmentAck,
    SegmentError, TransMicSize, TxRole, MAX_SEGMENTS, SEG_ACCESS_PDU_MAX_SIZE, SEG_ACK_PDU_SIZE,
    SEG_PDU_OFFSET, SEQZERO_MAX, TRANSMIC_LARGE_SIZE, TRANSMIC_SMALL_SIZE,
    UNSEG_ACCESS_PDU_MAX_SIZE, UNSEG_PDU_OFFSET,
};
pub use node::Node;
pub use protocols::{AccessLayer, AckSender, FriendQueue, ReplayStore, TimerScheduler};
pub use relay::{NoFriendship, RelayDecision, RelayGate};
pub use replay::{CacheFull, EvictionPolicy, ReplayCache, ReplayEntry};
pub use sar::{SessionExhaustion, SessionKey, TimerId, TimerKind};
pub use timer::{Expiry, TokioTimers};
pub use transport::{
    Disposition, DropReason, RxOutcome, Transport, TransportConfig, TransportIo, TransportStats,
};
