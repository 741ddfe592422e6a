//! Receive dispatcher.
//!
//! [`Transport`] is the entry point for every lower transport PDU the network
//! layer has accepted. Each call runs to completion and produces an ordered
//! series of collaborator calls:
//!
//! 1. relay gate evaluation and, when a friend needs it, forwarding
//! 2. replay check and insertion (unsegmented) or reassembly (segmented)
//! 3. delivery to the access layer
//! 4. acknowledgment handling (segmented only)
//!
//! Forwarding always comes first. A friend keeps receiving its traffic even
//! when this node's own replay history or addressing would suppress delivery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::messages::{
    AddressType, Framing, PduMetadata, RxAddressing, SarParams, SegmentError, TxRole,
    SEG_PDU_OFFSET, TRANSMIC_SMALL_SIZE, UNSEG_ACCESS_PDU_MAX_SIZE, UNSEG_PDU_OFFSET,
};
use crate::protocols::{AccessLayer, AckSender, FriendQueue, ReplayStore, TimerScheduler};
use crate::relay::RelayGate;
use crate::replay::{EvictionPolicy, ReplayCache, ReplayEntry, DEFAULT_REPLAY_CACHE_CAPACITY};
use crate::sar::{
    Reassembler, SarContext, SegmentOutcome, SessionExhaustion, SessionKey, SessionLookup,
    TimerId, TimerKind, DEFAULT_ACK_BASE_DELAY, DEFAULT_ACK_PER_HOP_DELAY,
    DEFAULT_COMPLETED_HISTORY, DEFAULT_MAX_SAR_SESSIONS, DEFAULT_SESSION_IDLE_TIMEOUT,
};

/// Bytes of a PDU included in trace output.
const LOG_PREFIX_LEN: usize = 16;


// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Number of `(src, seq, iv_index)` triples remembered.
    pub replay_cache_capacity: usize,
    pub replay_eviction: EvictionPolicy,
    /// Concurrent reassembly sessions, completed ones included.
    pub max_sar_sessions: usize,
    pub session_exhaustion: SessionExhaustion,
    /// Completed messages remembered after their session is gone, so late
    /// retransmissions are acknowledged instead of reassembled again.
    pub completed_history: usize,
    /// Fixed part of the acknowledgment delay.
    pub ack_base_delay: Duration,
    /// Added to the acknowledgment delay per unit of received TTL.
    pub ack_per_hop_delay: Duration,
    /// Silence after which a session is torn down.
    pub session_idle_timeout: Duration,
    /// Role copies handed to the friend queue are tagged with.
    pub relay_role: TxRole,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            replay_cache_capacity: DEFAULT_REPLAY_CACHE_CAPACITY,
            replay_eviction: EvictionPolicy::default(),
            max_sar_sessions: DEFAULT_MAX_SAR_SESSIONS,
            session_exhaustion: SessionExhaustion::default(),
            completed_history: DEFAULT_COMPLETED_HISTORY,
            ack_base_delay: DEFAULT_ACK_BASE_DELAY,
            ack_per_hop_delay: DEFAULT_ACK_PER_HOP_DELAY,
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
            relay_role: TxRole::Relay,
        }
    }
}


// ============================================================================
// Outcomes
// ============================================================================

/// Why a PDU produced no delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Failed length or header validation. Nothing else happened.
    Malformed(SegmentError),
    /// The triple is already in the replay list.
    Replayed,
    /// The replay list could not take the triple.
    CacheFull,
    /// Segment disagrees with the open session's parameters.
    SessionConflict,
    /// No room for a new reassembly session.
    SessionsExhausted,
    /// Retransmission for a session that already completed.
    StaleSegment,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed PDU: {}", err),
            Self::Replayed => write!(f, "sequence number already seen"),
            Self::CacheFull => write!(f, "replay cache full"),
            Self::SessionConflict => write!(f, "segment conflicts with open session"),
            Self::SessionsExhausted => write!(f, "no free reassembly session"),
            Self::StaleSegment => write!(f, "segment for completed session"),
        }
    }
}

impl std::error::Error for DropReason {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the access layer.
    Delivered,
    /// Stored in a session that is still missing segments.
    Pending,
    /// Not addressed to this node; nothing to deliver.
    NotLocal,
    Dropped(DropReason),
}

/// Result of one receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxOutcome {
    /// A copy was queued for a friend.
    pub relayed: bool,
    pub disposition: Disposition,
}

impl RxOutcome {
    fn dropped(reason: DropReason) -> Self {
        Self {
            relayed: false,
            disposition: Disposition::Dropped(reason),
        }
    }
}

/// Running counters, reset only by constructing a new [`Transport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub delivered: u64,
    pub relayed: u64,
    pub replay_dropped: u64,
    pub replay_cache_full: u64,
    pub malformed: u64,
    pub session_conflicts: u64,
    pub sessions_exhausted: u64,
    pub sessions_evicted: u64,
    pub stale_segments: u64,
    pub acks_sent: u64,
    pub sessions_completed: u64,
    pub sessions_timed_out: u64,
    pub sessions_aborted: u64,
}


/// Collaborators a [`Transport`] drives.
#[derive(Clone)]
pub struct TransportIo {
    pub access: Arc<dyn AccessLayer>,
    pub friend: Arc<dyn FriendQueue>,
    pub timers: Arc<dyn TimerScheduler>,
    pub acks: Arc<dyn AckSender>,
}


/// Replay check, insertion and delivery of a locally addressed payload.
pub(crate) fn deliver_local(
    replay: &mut dyn ReplayStore,
    access: &dyn AccessLayer,
    stats: &mut TransportStats,
    entry: ReplayEntry,
    payload: &[u8],
    dst_kind: AddressType,
) -> Disposition {
    if replay.has_elem(entry.src, entry.seq, entry.iv_index) {
        stats.replay_dropped += 1;
        debug!(src = entry.src, seq = entry.seq, iv_index = entry.iv_index, "dropping replayed PDU");
        return Disposition::Dropped(DropReason::Replayed);
    }
    if let Err(err) = replay.add(entry.src, entry.seq, entry.iv_index) {
        stats.replay_cache_full += 1;
        debug!(src = entry.src, seq = entry.seq, error = %err, "dropping PDU");
        return Disposition::Dropped(DropReason::CacheFull);
    }

    access.deliver(payload, entry.src, dst_kind);
    stats.delivered += 1;
    trace!(src = entry.src, len = payload.len(), dst_kind = %dst_kind, "delivered to access layer");
    Disposition::Delivered
}

fn log_prefix(pdu: &[u8]) -> String {
    hex::encode(&pdu[..pdu.len().min(LOG_PREFIX_LEN)])
}


// ============================================================================
// Dispatcher
// ============================================================================

pub struct Transport<R: ReplayStore = ReplayCache> {
    config: TransportConfig,
    io: TransportIo,
    gate: RelayGate,
    replay: R,
    reassembler: Reassembler,
    stats: TransportStats,
}

impl Transport<ReplayCache> {
    pub fn new(config: TransportConfig, io: TransportIo) -> Self {
        let replay = ReplayCache::new(config.replay_cache_capacity, config.replay_eviction);
        Self::with_replay_store(config, io, replay)
    }
}

impl<R: ReplayStore> Transport<R> {
    pub fn with_replay_store(config: TransportConfig, io: TransportIo, replay: R) -> Self {
        let gate = RelayGate::new(io.friend.clone(), config.relay_role);
        let reassembler = Reassembler::new(&config);
        Self {
            config,
            io,
            gate,
            replay,
            reassembler,
            stats: TransportStats::default(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn replay(&self) -> &R {
        &self.replay
    }

    /// Reassembly sessions currently held, completed ones included.
    pub fn session_count(&self) -> usize {
        self.reassembler.session_count()
    }

    /// Received-segment bitmap of a session, if it exists.
    pub fn session_progress(&self, src: u16, seqzero: u16) -> Option<u32> {
        self.reassembler.received(&SessionKey::new(src, seqzero))
    }

    fn sar_parts(&mut self) -> (&mut Reassembler, SarContext<'_>) {
        let ctx = SarContext {
            gate: &self.gate,
            replay: &mut self.replay,
            access: self.io.access.as_ref(),
            timers: self.io.timers.as_ref(),
            acks: self.io.acks.as_ref(),
            stats: &mut self.stats,
        };
        (&mut self.reassembler, ctx)
    }

    /// Handle an unsegmented PDU: `header(1) || access payload || TransMIC(4)`.
    pub fn receive_unsegmented(
        &mut self,
        meta: &PduMetadata,
        addressing: RxAddressing,
        pdu: &[u8],
    ) -> RxOutcome {
        trace!(
            src = meta.src,
            dst = meta.dst.value,
            seq = meta.seq,
            pdu = %log_prefix(pdu),
            "unsegmented PDU"
        );

        if pdu.len() <= UNSEG_PDU_OFFSET + TRANSMIC_SMALL_SIZE {
            self.stats.malformed += 1;
            debug!(src = meta.src, len = pdu.len(), "dropping truncated unsegmented PDU");
            return RxOutcome::dropped(DropReason::Malformed(SegmentError::Truncated {
                len: pdu.len(),
            }));
        }
        let upper_len = pdu.len() - UNSEG_PDU_OFFSET;
        if upper_len > UNSEG_ACCESS_PDU_MAX_SIZE {
            self.stats.malformed += 1;
            debug!(src = meta.src, len = upper_len, "dropping oversized unsegmented PDU");
            return RxOutcome::dropped(DropReason::Malformed(SegmentError::Oversized {
                len: upper_len,
                max: UNSEG_ACCESS_PDU_MAX_SIZE,
            }));
        }

        let decision = self.gate.evaluate(meta);
        let relayed = self.gate.forward(pdu, Framing::Unsegmented, meta, decision);
        if relayed {
            self.stats.relayed += 1;
        }

        if !addressing.for_local {
            trace!(src = meta.src, dst = meta.dst.value, relayed, "not addressed to this node");
            return RxOutcome { relayed, disposition: Disposition::NotLocal };
        }

        let payload = &pdu[UNSEG_PDU_OFFSET..pdu.len() - TRANSMIC_SMALL_SIZE];
        let entry = ReplayEntry::new(meta.src, meta.seq, meta.iv_index);
        let disposition = deliver_local(
            &mut self.replay,
            self.io.access.as_ref(),
            &mut self.stats,
            entry,
            payload,
            meta.dst.kind,
        );
        RxOutcome { relayed, disposition }
    }

    /// Handle one segment: `header(4) || segment`.
    ///
    /// `params` and `segment_index` come from the segment's own header.
    pub fn receive_segmented(
        &mut self,
        meta: &PduMetadata,
        addressing: RxAddressing,
        pdu: &[u8],
        segment_index: u8,
        params: &SarParams,
    ) -> RxOutcome {
        trace!(
            src = meta.src,
            dst = meta.dst.value,
            seq = meta.seq,
            seqzero = params.seqzero,
            index = segment_index,
            pdu = %log_prefix(pdu),
            "segmented PDU"
        );

        if pdu.len() <= SEG_PDU_OFFSET {
            self.stats.malformed += 1;
            debug!(src = meta.src, len = pdu.len(), "dropping truncated segment");
            return RxOutcome::dropped(DropReason::Malformed(SegmentError::Truncated {
                len: pdu.len(),
            }));
        }
        let segment = &pdu[SEG_PDU_OFFSET..];
        if let Err(err) = params.check_segment(segment_index, segment.len()) {
            self.stats.malformed += 1;
            debug!(src = meta.src, seqzero = params.seqzero, error = %err, "dropping malformed segment");
            return RxOutcome::dropped(DropReason::Malformed(err));
        }

        let decision = self.gate.evaluate(meta);
        let key = SessionKey::new(meta.src, params.seqzero);
        let seq_auth = meta.seq_auth(params.seqzero);
        let relayed = match self.reassembler.lookup(&key, params, seq_auth) {
            SessionLookup::Conflict | SessionLookup::Complete | SessionLookup::Outdated => {
                trace!(
                    src = meta.src,
                    seqzero = params.seqzero,
                    friend_interest = decision.forward,
                    "not forwarding segment of conflicting or finished message"
                );
                false
            }
            SessionLookup::Absent | SessionLookup::Open | SessionLookup::Superseded => {
                self.gate.forward(pdu, Framing::Segmented, meta, decision)
            }
        };
        if relayed {
            self.stats.relayed += 1;
        }

        let (reassembler, mut ctx) = self.sar_parts();
        let outcome = reassembler.on_segment(
            &mut ctx,
            meta,
            addressing,
            segment,
            segment_index,
            params,
            decision.forward,
        );

        let disposition = match outcome {
            SegmentOutcome::Pending => Disposition::Pending,
            SegmentOutcome::Completed(disposition) => disposition,
            SegmentOutcome::Stale => Disposition::Dropped(DropReason::StaleSegment),
            SegmentOutcome::Rejected(reason) => Disposition::Dropped(reason),
        };
        RxOutcome { relayed, disposition }
    }

    /// Entry point for expiries of timers armed through [`TimerScheduler`].
    pub fn handle_timer(&mut self, timer: TimerId) {
        let (reassembler, mut ctx) = self.sar_parts();
        match timer.kind {
            TimerKind::Ack => reassembler.on_ack_timeout(&mut ctx, timer.key),
            TimerKind::Idle => reassembler.on_idle_timeout(&mut ctx, timer.key),
        }
    }

    /// Discard a reassembly session without delivering or reporting it.
    pub fn abort_session(&mut self, src: u16, seqzero: u16) -> bool {
        let (reassembler, mut ctx) = self.sar_parts();
        reassembler.abort(&mut ctx, SessionKey::new(src, seqzero))
    }

    /// The network moved to a new IV index.
    ///
    /// Replay history of the previous epoch is kept, since PDUs sent under
    /// `iv_index - 1` are still accepted during the transition. Anything
    /// older is forgotten.
    pub fn iv_index_updated(&mut self, iv_index: u32) {
        let keep_from = iv_index.saturating_sub(1);
        debug!(iv_index, keep_from, "IV index updated");
        self.replay.prune_before(keep_from);
    }
}
