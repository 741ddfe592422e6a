//! Collaborator trait definitions for the receive path.
//!
//! The transport core owns no I/O. Everything it hands out or asks about goes
//! through one of these traits, so the surrounding stack (access layer,
//! friend subsystem, timer wheel, bearer) can be swapped or mocked.
//!
//! ## Collaborators
//!
//! | Concern | Trait | Called for |
//! |---------|-------|------------|
//! | Application | [`AccessLayer`] | delivering reassembled or unsegmented payloads |
//! | Friend | [`FriendQueue`] | relay interest, queueing copies, SAR completion |
//! | Replay list | [`ReplayStore`] | duplicate detection for locally addressed PDUs |
//! | Timers | [`TimerScheduler`] | acknowledgment and idle timers per session |
//! | Bearer | [`AckSender`] | emitting Segment Acknowledgments |
//!
//! ## Design
//!
//! Every method returns immediately. The receive path processes one PDU to
//! completion per call and never suspends, so none of these are async.

use std::time::Duration;

use crate::messages::{AddressType, PduMetadata, SegmentAck, TxRole};
use crate::replay::CacheFull;
use crate::sar::TimerId;


/// Upper layer that consumes payloads addressed to this node.
pub trait AccessLayer: Send + Sync {
    /// Deliver an access payload (TransMIC already stripped).
    fn deliver(&self, payload: &[u8], src: u16, dst_kind: AddressType);
}


/// Friend subsystem serving low power nodes that rely on this node.
pub trait FriendQueue: Send + Sync {
    /// Whether any friend is interested in this PDU's destination.
    fn needs_packet(&self, meta: &PduMetadata) -> bool;

    /// Queue a copy of the raw lower transport PDU, header included.
    fn packet_in(&self, pdu: &[u8], meta: &PduMetadata, role: TxRole);

    /// A segmented message the friend was interested in has finished.
    fn sar_complete(&self, src: u16, seqzero: u16, success: bool);
}


/// Bounded history of `(source, sequence, iv index)` triples.
pub trait ReplayStore {
    fn has_elem(&self, src: u16, seq: u32, iv_index: u32) -> bool;

    fn add(&mut self, src: u16, seq: u32, iv_index: u32) -> Result<(), CacheFull>;

    /// Drop history belonging to epochs older than `iv_index`.
    fn prune_before(&mut self, _iv_index: u32) {}
}


/// Non-blocking, cancellable one-shot timers keyed by session.
pub trait TimerScheduler: Send + Sync {
    /// Arm `timer` to fire after `delay`, replacing any pending deadline.
    fn reschedule(&self, timer: TimerId, delay: Duration);

    /// Cancel `timer` if pending.
    fn abort(&self, timer: TimerId);
}


/// Sends Segment Acknowledgments back to the originator of a session.
pub trait AckSender: Send + Sync {
    fn send_ack(&self, to: u16, ack: SegmentAck);
}
