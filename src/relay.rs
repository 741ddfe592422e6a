//! Friend relay gate.
//!
//! Decides, before anything else happens to a received PDU, whether a friend
//! needs a copy, and hands that copy over. The decision is independent of
//! whether the PDU is addressed to this node: a low power node must keep
//! receiving its traffic even when this node would drop the PDU itself.
//!
//! # Rules
//!
//! - The gate is evaluated once per physically received PDU.
//! - A forwarded copy is the raw lower transport PDU, header included, tagged
//!   with the configured role.
//! - Completion of a segmented message is reported by the reassembly engine
//!   through [`RelayGate::notify_sar_complete`], never by the dispatcher.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::messages::{Framing, PduMetadata, TxRole, TRANSMIC_SMALL_SIZE};
use crate::protocols::FriendQueue;


/// Result of evaluating the gate for one PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayDecision {
    pub forward: bool,
    pub role: TxRole,
}

/// Friend subsystem for a node that has no friendship established.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFriendship;

impl FriendQueue for NoFriendship {
    fn needs_packet(&self, _meta: &PduMetadata) -> bool {
        false
    }

    fn packet_in(&self, _pdu: &[u8], _meta: &PduMetadata, _role: TxRole) {}

    fn sar_complete(&self, _src: u16, _seqzero: u16, _success: bool) {}
}


pub struct RelayGate {
    friend: Arc<dyn FriendQueue>,
    role: TxRole,
}

impl std::fmt::Debug for RelayGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayGate")
            .field("role", &self.role)
            .finish()
    }
}

impl RelayGate {
    pub fn new(friend: Arc<dyn FriendQueue>, role: TxRole) -> Self {
        Self { friend, role }
    }

    pub fn role(&self) -> TxRole {
        self.role
    }

    /// Ask the friend subsystem whether this PDU must be queued.
    pub fn evaluate(&self, meta: &PduMetadata) -> RelayDecision {
        RelayDecision {
            forward: self.friend.needs_packet(meta),
            role: self.role,
        }
    }

    /// Hand a copy of `pdu` to the friend queue if `decision` says so.
    ///
    /// Returns whether a copy was queued.
    pub fn forward(
        &self,
        pdu: &[u8],
        framing: Framing,
        meta: &PduMetadata,
        decision: RelayDecision,
    ) -> bool {
        if !decision.forward {
            return false;
        }

        let min_len = match framing {
            Framing::Unsegmented => framing.header_len() + TRANSMIC_SMALL_SIZE,
            Framing::Segmented => framing.header_len(),
        };
        if pdu.len() <= min_len {
            debug!(
                src = meta.src,
                len = pdu.len(),
                framing = ?framing,
                "refusing to queue truncated PDU for friend"
            );
            return false;
        }

        self.friend.packet_in(pdu, meta, decision.role);
        trace!(
            src = meta.src,
            dst = meta.dst.value,
            seq = meta.seq,
            len = pdu.len(),
            payload_len = pdu.len() - framing.header_len(),
            role = ?decision.role,
            "queued PDU for friend"
        );
        true
    }

    pub fn notify_sar_complete(&self, src: u16, seqzero: u16, success: bool) {
        debug!(src, seqzero, success, "friend SAR session finished");
        self.friend.sar_complete(src, seqzero, success);
    }
}
