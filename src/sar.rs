//! Segmentation and reassembly (SAR) of inbound segmented messages.
//!
//! One [`SarSession`] exists per `(source, SeqZero)` pair. Sessions from
//! different sources share nothing, so segments from several senders can be
//! interleaved freely.
//!
//! # Session lifecycle
//!
//! ```text
//!   first segment          last missing segment        idle timer
//! ────────────────► Open ─────────────────────► Complete ──────────► (history)
//!                    │
//!                    └── idle timer / abort / eviction ─────────────► (gone)
//! ```
//!
//! A completed session keeps only its bitmap until its idle timer fires or
//! its slot is reclaimed. The bitmap and the message's SeqAuth also go into a
//! bounded history of completed messages that outlives the session, so
//! retransmissions from a sender that missed our acknowledgment are answered
//! without being forwarded or delivered a second time. A segment carrying the
//! same SeqZero but a newer SeqAuth starts a new message.
//!
//! # Acknowledgments
//!
//! Only unicast destinations are acknowledged: this node's own (OBO clear) or
//! a friend's (OBO set). An open session re-arms its ack timer on every
//! segment; a complete session acknowledges immediately.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::messages::{
    AddressType, PduMetadata, RxAddressing, SarParams, SegmentAck, SEG_ACCESS_PDU_MAX_SIZE,
};
use crate::protocols::{AccessLayer, AckSender, ReplayStore, TimerScheduler};
use crate::relay::RelayGate;
use crate::replay::ReplayEntry;
use crate::transport::{deliver_local, Disposition, DropReason, TransportConfig, TransportStats};


pub const DEFAULT_MAX_SAR_SESSIONS: usize = 8;
pub const DEFAULT_ACK_BASE_DELAY: Duration = Duration::from_millis(150);
pub const DEFAULT_ACK_PER_HOP_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_COMPLETED_HISTORY: usize = 32;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub src: u16,
    pub seqzero: u16,
}

impl SessionKey {
    pub fn new(src: u16, seqzero: u16) -> Self {
        Self { src, seqzero }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Delayed Segment Acknowledgment for an open session.
    Ack,
    /// Tears the session down when no segment arrives for a while.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub key: SessionKey,
    pub kind: TimerKind,
}

impl TimerId {
    pub fn ack(key: SessionKey) -> Self {
        Self { key, kind: TimerKind::Ack }
    }

    pub fn idle(key: SessionKey) -> Self {
        Self { key, kind: TimerKind::Idle }
    }
}

/// What to do when a new session arrives and the table is full of open ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionExhaustion {
    #[default]
    RejectNew,
    EvictOldest,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Complete,
}

#[derive(Debug)]
pub(crate) struct SarSession {
    params: SarParams,
    received: u32,
    buffer: Vec<u8>,
    state: SessionState,
    dst_kind: AddressType,
    friend_interest: bool,
    for_local: bool,
    seq_auth: u64,
    /// Sequence number and epoch of the most recent segment.
    last_seq: u32,
    iv_index: u32,
    ack_obo: Option<bool>,
}

impl SarSession {
    fn new(params: SarParams, dst_kind: AddressType, seq_auth: u64) -> Self {
        Self {
            params,
            received: 0,
            buffer: vec![0u8; params.total_len],
            state: SessionState::Open,
            dst_kind,
            friend_interest: false,
            for_local: false,
            seq_auth,
            last_seq: 0,
            iv_index: 0,
            ack_obo: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.state == SessionState::Complete
    }

    /// Store a segment. Returns false if it was already present.
    fn insert(&mut self, index: u8, data: &[u8]) -> bool {
        let bit = 1u32 << index;
        if self.received & bit != 0 {
            return false;
        }
        let offset = index as usize * SEG_ACCESS_PDU_MAX_SIZE;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
        self.received |= bit;
        true
    }

    fn all_received(&self) -> bool {
        self.received == self.params.complete_mask()
    }

    /// Release the buffer and return the payload without its TransMIC.
    fn take_payload(&mut self) -> Vec<u8> {
        let mut payload = std::mem::take(&mut self.buffer);
        payload.truncate(self.params.total_len - self.params.mic.len());
        payload
    }
}

/// What is left of a message after its session is gone.
#[derive(Debug, Clone, Copy)]
struct CompletedMessage {
    seq_auth: u64,
    received: u32,
}


/// Borrowed collaborators the engine drives while handling one event.
pub(crate) struct SarContext<'a> {
    pub gate: &'a RelayGate,
    pub replay: &'a mut dyn ReplayStore,
    pub access: &'a dyn AccessLayer,
    pub timers: &'a dyn TimerScheduler,
    pub acks: &'a dyn AckSender,
    pub stats: &'a mut TransportStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionLookup {
    Absent,
    Open,
    /// The message already completed; the segment is a retransmission.
    Complete,
    /// Same SeqZero as a completed message but a newer SeqAuth.
    Superseded,
    /// Older than the completed message recorded for this SeqZero.
    Outdated,
    Conflict,
}

impl SessionLookup {
    fn against_completed(recorded: u64, seq_auth: u64) -> Self {
        match seq_auth.cmp(&recorded) {
            std::cmp::Ordering::Equal => Self::Complete,
            std::cmp::Ordering::Greater => Self::Superseded,
            std::cmp::Ordering::Less => Self::Outdated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentOutcome {
    /// Stored; more segments are missing.
    Pending,
    /// This segment completed the message.
    Completed(Disposition),
    /// The session already completed; only acknowledged.
    Stale,
    Rejected(DropReason),
}


pub(crate) struct Reassembler {
    sessions: LruCache<SessionKey, SarSession>,
    completed: LruCache<SessionKey, CompletedMessage>,
    exhaustion: SessionExhaustion,
    ack_base_delay: Duration,
    ack_per_hop_delay: Duration,
    idle_timeout: Duration,
}

impl Reassembler {
    pub fn new(config: &TransportConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_sar_sessions)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        let history = NonZeroUsize::new(config.completed_history)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            sessions: LruCache::new(capacity),
            completed: LruCache::new(history),
            exhaustion: config.session_exhaustion,
            ack_base_delay: config.ack_base_delay,
            ack_per_hop_delay: config.ack_per_hop_delay,
            idle_timeout: config.session_idle_timeout,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn received(&self, key: &SessionKey) -> Option<u32> {
        self.sessions.peek(key).map(|s| s.received)
    }

    #[cfg(test)]
    pub fn is_complete(&self, key: &SessionKey) -> Option<bool> {
        self.sessions.peek(key).map(|s| s.is_complete())
    }

    pub fn ack_delay(&self, ttl: u8) -> Duration {
        self.ack_base_delay + self.ack_per_hop_delay * u32::from(ttl)
    }

    /// Classify a segment against existing state without touching it.
    pub fn lookup(&self, key: &SessionKey, params: &SarParams, seq_auth: u64) -> SessionLookup {
        match self.sessions.peek(key) {
            Some(session) if session.is_complete() => {
                SessionLookup::against_completed(session.seq_auth, seq_auth)
            }
            Some(session) if session.params != *params => SessionLookup::Conflict,
            Some(_) => SessionLookup::Open,
            None => match self.completed.peek(key) {
                Some(done) => SessionLookup::against_completed(done.seq_auth, seq_auth),
                None => SessionLookup::Absent,
            },
        }
    }

    /// Feed one validated segment into its session.
    #[allow(clippy::too_many_arguments)]
    pub fn on_segment(
        &mut self,
        ctx: &mut SarContext<'_>,
        meta: &PduMetadata,
        addressing: RxAddressing,
        segment: &[u8],
        index: u8,
        params: &SarParams,
        relay: bool,
    ) -> SegmentOutcome {
        let key = SessionKey::new(meta.src, params.seqzero);
        let ack_obo = addressing.ack_obo(&meta.dst);
        let seq_auth = meta.seq_auth(params.seqzero);

        let opening = match self.lookup(&key, params, seq_auth) {
            SessionLookup::Conflict => {
                ctx.stats.session_conflicts += 1;
                debug!(
                    src = key.src,
                    seqzero = key.seqzero,
                    segment_count = params.segment_count,
                    total_len = params.total_len,
                    "ignoring segment with parameters conflicting with open session"
                );
                return SegmentOutcome::Rejected(DropReason::SessionConflict);
            }
            SessionLookup::Complete => {
                return self.on_stale_segment(ctx, key, index, ack_obo);
            }
            SessionLookup::Outdated => {
                ctx.stats.stale_segments += 1;
                trace!(src = key.src, seqzero = key.seqzero, seq = meta.seq, "segment of an older message");
                return SegmentOutcome::Stale;
            }
            SessionLookup::Open => false,
            SessionLookup::Absent => true,
            SessionLookup::Superseded => {
                self.forget_completed(ctx, key);
                true
            }
        };

        if opening {
            if !self.make_room(ctx) {
                ctx.stats.sessions_exhausted += 1;
                warn!(
                    src = key.src,
                    seqzero = key.seqzero,
                    sessions = self.sessions.len(),
                    "SAR session table full, rejecting new session"
                );
                return SegmentOutcome::Rejected(DropReason::SessionsExhausted);
            }
            self.sessions.put(key, SarSession::new(*params, meta.dst.kind, seq_auth));
            trace!(
                src = key.src,
                seqzero = key.seqzero,
                seq_auth = format_args!("{:#x}", seq_auth),
                segment_count = params.segment_count,
                total_len = params.total_len,
                "opened SAR session"
            );
        }

        let ack_delay = self.ack_delay(meta.ttl);
        let idle_timeout = self.idle_timeout;
        let Some(session) = self.sessions.get_mut(&key) else {
            return SegmentOutcome::Rejected(DropReason::SessionsExhausted);
        };

        if !session.insert(index, segment) {
            trace!(src = key.src, seqzero = key.seqzero, index, "duplicate segment");
        }
        session.friend_interest |= relay;
        session.for_local |= addressing.for_local;
        session.last_seq = meta.seq;
        session.iv_index = meta.iv_index;
        session.ack_obo = ack_obo;

        ctx.timers.reschedule(TimerId::idle(key), idle_timeout);

        if !session.all_received() {
            if ack_obo.is_some() {
                ctx.timers.reschedule(TimerId::ack(key), ack_delay);
            }
            return SegmentOutcome::Pending;
        }

        session.state = SessionState::Complete;
        let payload = session.take_payload();
        let received = session.received;
        let for_local = session.for_local;
        let friend_interest = session.friend_interest;
        let entry = ReplayEntry::new(key.src, session.last_seq, session.iv_index);
        let dst_kind = session.dst_kind;
        let record = CompletedMessage { seq_auth: session.seq_auth, received };

        self.completed.put(key, record);

        ctx.timers.abort(TimerId::ack(key));
        ctx.stats.sessions_completed += 1;
        debug!(
            src = key.src,
            seqzero = key.seqzero,
            len = payload.len(),
            for_local,
            friend_interest,
            "SAR session complete"
        );

        let disposition = if for_local {
            deliver_local(ctx.replay, ctx.access, ctx.stats, entry, &payload, dst_kind)
        } else {
            Disposition::NotLocal
        };

        if friend_interest {
            ctx.gate.notify_sar_complete(key.src, key.seqzero, true);
        }

        if let Some(obo) = ack_obo {
            Self::send_ack(ctx, key, received, obo);
        }

        SegmentOutcome::Completed(disposition)
    }

    fn on_stale_segment(
        &mut self,
        ctx: &mut SarContext<'_>,
        key: SessionKey,
        index: u8,
        ack_obo: Option<bool>,
    ) -> SegmentOutcome {
        ctx.stats.stale_segments += 1;
        trace!(src = key.src, seqzero = key.seqzero, index, "segment for completed session");

        let received = if let Some(session) = self.sessions.get(&key) {
            // The sender is still retrying, keep answering it.
            ctx.timers.reschedule(TimerId::idle(key), self.idle_timeout);
            session.received
        } else if let Some(done) = self.completed.get(&key) {
            done.received
        } else {
            return SegmentOutcome::Stale;
        };
        if let Some(obo) = ack_obo {
            Self::send_ack(ctx, key, received, obo);
        }
        SegmentOutcome::Stale
    }

    /// Drop every trace of a completed message whose SeqZero is being reused.
    fn forget_completed(&mut self, ctx: &mut SarContext<'_>, key: SessionKey) {
        self.completed.pop(&key);
        if self.sessions.pop(&key).is_some() {
            ctx.timers.abort(TimerId::idle(key));
        }
        trace!(src = key.src, seqzero = key.seqzero, "SeqZero reused by a new message");
    }

    /// Ensure a slot is free for a new session.
    fn make_room(&mut self, ctx: &mut SarContext<'_>) -> bool {
        if self.sessions.len() < self.sessions.cap().get() {
            return true;
        }

        let completed = self.sessions
            .iter()
            .rev()
            .find(|(_, session)| session.is_complete())
            .map(|(key, _)| *key);
        if let Some(key) = completed {
            self.sessions.pop(&key);
            ctx.timers.abort(TimerId::idle(key));
            trace!(src = key.src, seqzero = key.seqzero, "reclaimed completed SAR session");
            return true;
        }

        match self.exhaustion {
            SessionExhaustion::RejectNew => false,
            SessionExhaustion::EvictOldest => {
                if let Some((key, session)) = self.sessions.pop_lru() {
                    ctx.stats.sessions_evicted += 1;
                    warn!(
                        src = key.src,
                        seqzero = key.seqzero,
                        received = format_args!("{:#x}", session.received),
                        "evicted open SAR session to make room"
                    );
                    ctx.timers.abort(TimerId::idle(key));
                    Self::fail_open(ctx, key, &session);
                }
                true
            }
        }
    }

    /// Teardown of an open session that will never complete.
    fn fail_open(ctx: &mut SarContext<'_>, key: SessionKey, session: &SarSession) {
        ctx.timers.abort(TimerId::ack(key));
        if session.friend_interest {
            ctx.gate.notify_sar_complete(key.src, key.seqzero, false);
        }
    }

    fn send_ack(ctx: &mut SarContext<'_>, key: SessionKey, block_ack: u32, obo: bool) {
        let ack = SegmentAck {
            seqzero: key.seqzero,
            block_ack,
            obo,
        };
        ctx.acks.send_ack(key.src, ack);
        ctx.stats.acks_sent += 1;
        trace!(
            to = key.src,
            seqzero = key.seqzero,
            block_ack = format_args!("{:#010x}", block_ack),
            obo,
            "sent segment acknowledgment"
        );
    }

    pub fn on_ack_timeout(&mut self, ctx: &mut SarContext<'_>, key: SessionKey) {
        let (received, ack_obo) = match self.sessions.peek(&key) {
            Some(session) if !session.is_complete() => (session.received, session.ack_obo),
            _ => return,
        };
        if let Some(obo) = ack_obo {
            Self::send_ack(ctx, key, received, obo);
        }
    }

    pub fn on_idle_timeout(&mut self, ctx: &mut SarContext<'_>, key: SessionKey) {
        let Some(session) = self.sessions.pop(&key) else {
            return;
        };
        if session.is_complete() {
            ctx.timers.abort(TimerId::ack(key));
            trace!(src = key.src, seqzero = key.seqzero, "released completed SAR session");
            return;
        }

        ctx.stats.sessions_timed_out += 1;
        debug!(
            src = key.src,
            seqzero = key.seqzero,
            received = format_args!("{:#x}", session.received),
            expected = format_args!("{:#x}", session.params.complete_mask()),
            "SAR session timed out"
        );
        Self::fail_open(ctx, key, &session);
    }

    /// Discard a session without completing it. Returns false if unknown.
    pub fn abort(&mut self, ctx: &mut SarContext<'_>, key: SessionKey) -> bool {
        let Some(session) = self.sessions.pop(&key) else {
            return false;
        };
        ctx.timers.abort(TimerId::ack(key));
        ctx.timers.abort(TimerId::idle(key));
        ctx.stats.sessions_aborted += 1;
        debug!(
            src = key.src,
            seqzero = key.seqzero,
            complete = session.is_complete(),
            "SAR session aborted"
        );
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::messages::{Destination, TransMicSize, TxRole};
    use crate::protocols::FriendQueue;
    use crate::replay::{EvictionPolicy, ReplayCache};

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<(Vec<u8>, u16, AddressType)>>,
        acks: Mutex<Vec<(u16, SegmentAck)>>,
        timers: Mutex<Vec<(TimerId, Option<Duration>)>>,
        completions: Mutex<Vec<(u16, u16, bool)>>,
    }

    impl AccessLayer for Recorder {
        fn deliver(&self, payload: &[u8], src: u16, dst_kind: AddressType) {
            self.delivered.lock().unwrap().push((payload.to_vec(), src, dst_kind));
        }
    }

    impl AckSender for Recorder {
        fn send_ack(&self, to: u16, ack: SegmentAck) {
            self.acks.lock().unwrap().push((to, ack));
        }
    }

    impl TimerScheduler for Recorder {
        fn reschedule(&self, timer: TimerId, delay: Duration) {
            self.timers.lock().unwrap().push((timer, Some(delay)));
        }

        fn abort(&self, timer: TimerId) {
            self.timers.lock().unwrap().push((timer, None));
        }
    }

    impl FriendQueue for Recorder {
        fn needs_packet(&self, _meta: &PduMetadata) -> bool {
            true
        }

        fn packet_in(&self, _pdu: &[u8], _meta: &PduMetadata, _role: TxRole) {}

        fn sar_complete(&self, src: u16, seqzero: u16, success: bool) {
            self.completions.lock().unwrap().push((src, seqzero, success));
        }
    }

    struct Harness {
        rec: Arc<Recorder>,
        gate: RelayGate,
        replay: ReplayCache,
        stats: TransportStats,
        sar: Reassembler,
    }

    impl Harness {
        fn new(config: TransportConfig) -> Self {
            let rec = Arc::new(Recorder::default());
            Self {
                gate: RelayGate::new(rec.clone(), TxRole::Relay),
                rec,
                replay: ReplayCache::new(16, EvictionPolicy::RejectWhenFull),
                stats: TransportStats::default(),
                sar: Reassembler::new(&config),
            }
        }

        fn feed(
            &mut self,
            meta: &PduMetadata,
            addressing: RxAddressing,
            segment: &[u8],
            index: u8,
            params: &SarParams,
            relay: bool,
        ) -> SegmentOutcome {
            let mut ctx = SarContext {
                gate: &self.gate,
                replay: &mut self.replay,
                access: self.rec.as_ref(),
                timers: self.rec.as_ref(),
                acks: self.rec.as_ref(),
                stats: &mut self.stats,
            };
            self.sar.on_segment(&mut ctx, meta, addressing, segment, index, params, relay)
        }

        fn idle_timeout(&mut self, key: SessionKey) {
            let mut ctx = SarContext {
                gate: &self.gate,
                replay: &mut self.replay,
                access: self.rec.as_ref(),
                timers: self.rec.as_ref(),
                acks: self.rec.as_ref(),
                stats: &mut self.stats,
            };
            self.sar.on_idle_timeout(&mut ctx, key);
        }

        fn ack_timeout(&mut self, key: SessionKey) {
            let mut ctx = SarContext {
                gate: &self.gate,
                replay: &mut self.replay,
                access: self.rec.as_ref(),
                timers: self.rec.as_ref(),
                acks: self.rec.as_ref(),
                stats: &mut self.stats,
            };
            self.sar.on_ack_timeout(&mut ctx, key);
        }
    }

    fn unicast_meta(src: u16, seq: u32) -> PduMetadata {
        PduMetadata::new(src, Destination::new(0x0010, AddressType::Unicast), seq, 0)
    }

    fn segment(index: u8, len: usize) -> Vec<u8> {
        vec![index + 1; len]
    }

    #[test]
    fn out_of_order_segments_assemble_in_index_order() {
        let mut h = Harness::new(TransportConfig::default());
        let params = SarParams::new(3, 3, 2 * SEG_ACCESS_PDU_MAX_SIZE + 6);

        for (seq, index) in [(0u32, 2u8), (1, 0)] {
            let data = segment(index, params.segment_len(index));
            let out = h.feed(&unicast_meta(1, seq), RxAddressing::local(), &data, index, &params, false);
            assert_eq!(out, SegmentOutcome::Pending);
        }
        assert!(h.rec.delivered.lock().unwrap().is_empty());

        let data = segment(1, SEG_ACCESS_PDU_MAX_SIZE);
        let out = h.feed(&unicast_meta(1, 2), RxAddressing::local(), &data, 1, &params, false);
        assert_eq!(out, SegmentOutcome::Completed(Disposition::Delivered));

        let delivered = h.rec.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        let (payload, src, kind) = &delivered[0];
        assert_eq!(*src, 1);
        assert_eq!(*kind, AddressType::Unicast);
        // Last segment is 6 bytes, 4 of which are the TransMIC.
        assert_eq!(payload.len(), 2 * SEG_ACCESS_PDU_MAX_SIZE + 2);
        assert_eq!(&payload[..12], &[1u8; 12]);
        assert_eq!(&payload[12..24], &[2u8; 12]);
        assert_eq!(&payload[24..], &[3u8; 2]);

        // Terminal sequence number is the completing segment's.
        assert!(h.replay.has_elem(1, 2, 0));
        assert!(!h.replay.has_elem(1, 0, 0));
    }

    #[test]
    fn large_mic_is_stripped() {
        let mut h = Harness::new(TransportConfig::default());
        let params = SarParams::new(0, 1, 12).with_mic(TransMicSize::Large);
        let out = h.feed(&unicast_meta(1, 0), RxAddressing::local(), &[9u8; 12], 0, &params, false);
        assert_eq!(out, SegmentOutcome::Completed(Disposition::Delivered));
        assert_eq!(h.rec.delivered.lock().unwrap()[0].0, vec![9u8; 4]);
    }

    #[test]
    fn duplicate_segment_is_idempotent() {
        let mut h = Harness::new(TransportConfig::default());
        let params = SarParams::new(0, 2, 24);
        let key = SessionKey::new(1, 0);

        h.feed(&unicast_meta(1, 0), RxAddressing::local(), &[1u8; 12], 0, &params, false);
        h.feed(&unicast_meta(1, 1), RxAddressing::local(), &[1u8; 12], 0, &params, false);
        assert_eq!(h.sar.received(&key), Some(0b01));
        assert_eq!(h.sar.is_complete(&key), Some(false));
        assert_eq!(h.sar.session_count(), 1);
    }

    #[test]
    fn open_session_schedules_ack_with_ttl_delay() {
        let config = TransportConfig::default();
        let mut h = Harness::new(config.clone());
        let params = SarParams::new(0, 2, 24);
        let key = SessionKey::new(1, 0);
        let meta = unicast_meta(1, 0).with_ttl(2);

        h.feed(&meta, RxAddressing::local(), &[1u8; 12], 0, &params, false);

        let expected = config.ack_base_delay + config.ack_per_hop_delay * 2;
        let timers = h.rec.timers.lock().unwrap().clone();
        assert!(timers.contains(&(TimerId::ack(key), Some(expected))));
        assert!(timers.contains(&(TimerId::idle(key), Some(config.session_idle_timeout))));
        assert!(h.rec.acks.lock().unwrap().is_empty());

        h.ack_timeout(key);
        let acks = h.rec.acks.lock().unwrap().clone();
        assert_eq!(acks, vec![(1, SegmentAck { seqzero: 0, block_ack: 0b01, obo: false })]);
    }

    #[test]
    fn group_sessions_are_never_acked() {
        let mut h = Harness::new(TransportConfig::default());
        let params = SarParams::new(0, 2, 24);
        let meta = PduMetadata::new(1, Destination::new(0xC000, AddressType::Group), 0, 0);

        h.feed(&meta, RxAddressing::local(), &[1u8; 12], 0, &params, false);
        h.feed(&meta, RxAddressing::local(), &[1u8; 12], 1, &params, false);

        assert!(h.rec.acks.lock().unwrap().is_empty());
        assert!(h.rec.timers.lock().unwrap().iter().all(|(t, d)| {
            t.kind == TimerKind::Idle || d.is_none()
        }));
        assert_eq!(h.rec.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn idle_timeout_reports_failure_to_interested_friend() {
        let mut h = Harness::new(TransportConfig::default());
        let params = SarParams::new(7, 2, 24);
        let key = SessionKey::new(1, 7);

        h.feed(&unicast_meta(1, 0), RxAddressing::friend(), &[1u8; 12], 0, &params, true);
        h.idle_timeout(key);

        assert_eq!(h.sar.session_count(), 0);
        assert_eq!(h.stats.sessions_timed_out, 1);
        assert_eq!(h.rec.completions.lock().unwrap().clone(), vec![(1, 7, false)]);
        assert!(h.rec.timers.lock().unwrap().contains(&(TimerId::ack(key), None)));

        // A late ack timer for a torn down session does nothing.
        h.ack_timeout(key);
        assert!(h.rec.acks.lock().unwrap().is_empty());
    }

    #[test]
    fn idle_timeout_of_completed_session_is_silent() {
        let mut h = Harness::new(TransportConfig::default());
        let params = SarParams::new(0, 1, 12);
        let key = SessionKey::new(1, 0);

        h.feed(&unicast_meta(1, 0), RxAddressing::friend(), &[1u8; 12], 0, &params, true);
        assert_eq!(h.rec.completions.lock().unwrap().clone(), vec![(1, 0, true)]);

        h.idle_timeout(key);
        assert_eq!(h.sar.session_count(), 0);
        assert_eq!(h.stats.sessions_timed_out, 0);
        assert_eq!(h.rec.completions.lock().unwrap().len(), 1);
    }

    #[test]
    fn conflicting_parameters_are_ignored() {
        let mut h = Harness::new(TransportConfig::default());
        let params = SarParams::new(0, 2, 24);
        h.feed(&unicast_meta(1, 0), RxAddressing::local(), &[1u8; 12], 0, &params, false);

        let other = SarParams::new(0, 3, 36);
        let out = h.feed(&unicast_meta(1, 1), RxAddressing::local(), &[1u8; 12], 1, &other, false);
        assert_eq!(out, SegmentOutcome::Rejected(DropReason::SessionConflict));
        assert_eq!(h.sar.received(&SessionKey::new(1, 0)), Some(0b01));
        assert_eq!(h.stats.session_conflicts, 1);
    }

    #[test]
    fn reject_new_when_table_full_of_open_sessions() {
        let config = TransportConfig {
            max_sar_sessions: 2,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        let params = |seqzero| SarParams::new(seqzero, 2, 24);

        for src in 1..=2u16 {
            h.feed(&unicast_meta(src, 0), RxAddressing::local(), &[1u8; 12], 0, &params(0), false);
        }
        let out = h.feed(&unicast_meta(3, 0), RxAddressing::local(), &[1u8; 12], 0, &params(0), false);
        assert_eq!(out, SegmentOutcome::Rejected(DropReason::SessionsExhausted));
        assert_eq!(h.stats.sessions_exhausted, 1);
        assert_eq!(h.sar.session_count(), 2);
    }

    #[test]
    fn evict_oldest_when_configured() {
        let config = TransportConfig {
            max_sar_sessions: 2,
            session_exhaustion: SessionExhaustion::EvictOldest,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        let params = SarParams::new(0, 2, 24);

        h.feed(&unicast_meta(1, 0), RxAddressing::friend(), &[1u8; 12], 0, &params, true);
        h.feed(&unicast_meta(2, 0), RxAddressing::local(), &[1u8; 12], 0, &params, false);
        let out = h.feed(&unicast_meta(3, 0), RxAddressing::local(), &[1u8; 12], 0, &params, false);

        assert_eq!(out, SegmentOutcome::Pending);
        assert_eq!(h.sar.received(&SessionKey::new(1, 0)), None);
        assert_eq!(h.stats.sessions_evicted, 1);
        assert_eq!(h.rec.completions.lock().unwrap().clone(), vec![(1, 0, false)]);
    }

    #[test]
    fn completed_sessions_are_reclaimed_before_rejecting() {
        let config = TransportConfig {
            max_sar_sessions: 1,
            ..Default::default()
        };
        let mut h = Harness::new(config);

        let single = SarParams::new(0, 1, 12);
        h.feed(&unicast_meta(1, 0), RxAddressing::local(), &[1u8; 12], 0, &single, false);
        assert_eq!(h.sar.is_complete(&SessionKey::new(1, 0)), Some(true));

        let out = h.feed(&unicast_meta(2, 0), RxAddressing::local(), &[1u8; 12], 0, &single, false);
        assert_eq!(out, SegmentOutcome::Completed(Disposition::Delivered));
        assert_eq!(h.sar.session_count(), 1);
        assert_eq!(h.stats.sessions_exhausted, 0);
    }

    #[test]
    fn retransmit_after_reclaim_is_acked_not_reassembled() {
        let config = TransportConfig {
            max_sar_sessions: 1,
            ..Default::default()
        };
        let mut h = Harness::new(config);
        let single = SarParams::new(0, 1, 12);

        h.feed(&unicast_meta(1, 0), RxAddressing::local(), &[1u8; 12], 0, &single, true);
        h.feed(&unicast_meta(2, 0), RxAddressing::local(), &[2u8; 12], 0, &single, true);
        assert_eq!(h.sar.is_complete(&SessionKey::new(1, 0)), None);

        // Source 1 never saw our ack and repeats its only segment.
        let out = h.feed(&unicast_meta(1, 1), RxAddressing::local(), &[1u8; 12], 0, &single, true);

        assert_eq!(out, SegmentOutcome::Stale);
        assert_eq!(h.rec.delivered.lock().unwrap().len(), 2);
        assert_eq!(h.rec.completions.lock().unwrap().clone(), vec![(1, 0, true), (2, 0, true)]);
        assert_eq!(
            h.rec.acks.lock().unwrap().last(),
            Some(&(1, SegmentAck { seqzero: 0, block_ack: 0b1, obo: false }))
        );
        assert_eq!(h.rec.acks.lock().unwrap().len(), 3);
        assert_eq!(h.stats.stale_segments, 1);
        assert_eq!(h.sar.session_count(), 1);
        assert!(!h.replay.has_elem(1, 1, 0));
    }

    #[test]
    fn retransmit_after_idle_release_is_acked_not_reassembled() {
        let mut h = Harness::new(TransportConfig::default());
        let params = SarParams::new(5, 2, 24);
        let key = SessionKey::new(1, 5);

        h.feed(&unicast_meta(1, 5), RxAddressing::friend(), &[1u8; 12], 0, &params, true);
        h.feed(&unicast_meta(1, 6), RxAddressing::friend(), &[2u8; 12], 1, &params, true);
        h.idle_timeout(key);
        assert_eq!(h.sar.session_count(), 0);

        let out = h.feed(&unicast_meta(1, 7), RxAddressing::friend(), &[2u8; 12], 1, &params, true);

        assert_eq!(out, SegmentOutcome::Stale);
        assert_eq!(h.sar.session_count(), 0);
        assert_eq!(h.rec.completions.lock().unwrap().clone(), vec![(1, 5, true)]);
        assert_eq!(
            h.rec.acks.lock().unwrap().clone(),
            vec![
                (1, SegmentAck { seqzero: 5, block_ack: 0b11, obo: true }),
                (1, SegmentAck { seqzero: 5, block_ack: 0b11, obo: true }),
            ]
        );
    }

    #[test]
    fn reused_seqzero_starts_a_new_message() {
        let mut h = Harness::new(TransportConfig::default());
        let single = SarParams::new(0, 1, 12);

        h.feed(&unicast_meta(1, 0), RxAddressing::local(), &[1u8; 12], 0, &single, false);

        // SeqZero wraps every 8192 sequence numbers.
        let out = h.feed(&unicast_meta(1, 0x2000), RxAddressing::local(), &[2u8; 12], 0, &single, false);
        assert_eq!(out, SegmentOutcome::Completed(Disposition::Delivered));
        assert_eq!(h.rec.delivered.lock().unwrap().len(), 2);

        // A straggler from the first message is dropped without an ack.
        let out = h.feed(&unicast_meta(1, 1), RxAddressing::local(), &[1u8; 12], 0, &single, false);
        assert_eq!(out, SegmentOutcome::Stale);
        assert_eq!(h.rec.delivered.lock().unwrap().len(), 2);
        assert_eq!(h.rec.acks.lock().unwrap().len(), 2);
    }
}
