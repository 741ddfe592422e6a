//! # Async Node API
//!
//! A [`Node`] is the async front end of the inbound transport. It is a cheap,
//! cloneable handle; the state lives in a single actor task.
//!
//! - `Node`: public handle, sends commands and awaits replies
//! - `NodeActor`: owns the [`Transport`] and its [`TokioTimers`], handles one
//!   command or timer expiry at a time
//! - `Command`: messages from handles to the actor
//!
//! Every call fails with an error once the actor has quit.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::messages::{PduMetadata, RxAddressing, SarParams};
use crate::protocols::{AccessLayer, AckSender, FriendQueue, ReplayStore};
use crate::replay::ReplayCache;
use crate::timer::{Expiry, TokioTimers};
use crate::transport::{RxOutcome, Transport, TransportConfig, TransportIo, TransportStats};

const COMMAND_CHANNEL_CAPACITY: usize = 256;


enum Command {
    Unsegmented {
        meta: PduMetadata,
        addressing: RxAddressing,
        pdu: Vec<u8>,
        reply: oneshot::Sender<RxOutcome>,
    },
    Segmented {
        meta: PduMetadata,
        addressing: RxAddressing,
        pdu: Vec<u8>,
        segment_index: u8,
        params: SarParams,
        reply: oneshot::Sender<RxOutcome>,
    },
    AbortSession {
        src: u16,
        seqzero: u16,
        reply: oneshot::Sender<bool>,
    },
    IvIndexUpdated(u32),
    Stats(oneshot::Sender<TransportStats>),
    SessionCount(oneshot::Sender<usize>),
    Quit,
}


// ============================================================================
// Node Handle (public API - cheap to clone)
// ============================================================================

/// Async front end for a [`Transport`].
///
/// PDUs submitted from any number of tasks are processed one at a time, in
/// submission order, by a single actor task that owns the transport and its
/// timers.
#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
}

impl Node {
    pub fn spawn(
        config: TransportConfig,
        access: Arc<dyn AccessLayer>,
        friend: Arc<dyn FriendQueue>,
        acks: Arc<dyn AckSender>,
    ) -> Self {
        let replay = ReplayCache::new(config.replay_cache_capacity, config.replay_eviction);
        Self::spawn_with_replay_store(config, access, friend, acks, replay)
    }

    pub fn spawn_with_replay_store<R>(
        config: TransportConfig,
        access: Arc<dyn AccessLayer>,
        friend: Arc<dyn FriendQueue>,
        acks: Arc<dyn AckSender>,
        replay: R,
    ) -> Self
    where
        R: ReplayStore + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (timers, expiry_rx) = TokioTimers::channel();
        let timers = Arc::new(timers);

        let io = TransportIo {
            access,
            friend,
            timers: timers.clone(),
            acks,
        };
        info!(
            max_sar_sessions = config.max_sar_sessions,
            replay_capacity = config.replay_cache_capacity,
            role = ?config.relay_role,
            "mesh transport actor started"
        );
        let actor = NodeActor {
            transport: Transport::with_replay_store(config, io, replay),
            timers,
        };
        tokio::spawn(actor.run(cmd_rx, expiry_rx));

        Self { cmd_tx }
    }

    pub async fn receive_unsegmented(
        &self,
        meta: PduMetadata,
        addressing: RxAddressing,
        pdu: Vec<u8>,
    ) -> anyhow::Result<RxOutcome> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Unsegmented { meta, addressing, pdu, reply }).await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("transport actor closed"))
    }

    pub async fn receive_segmented(
        &self,
        meta: PduMetadata,
        addressing: RxAddressing,
        pdu: Vec<u8>,
        segment_index: u8,
        params: SarParams,
    ) -> anyhow::Result<RxOutcome> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Segmented { meta, addressing, pdu, segment_index, params, reply })
            .await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("transport actor closed"))
    }

    pub async fn abort_session(&self, src: u16, seqzero: u16) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::AbortSession { src, seqzero, reply }).await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("transport actor closed"))
    }

    pub async fn iv_index_updated(&self, iv_index: u32) -> anyhow::Result<()> {
        self.cmd_tx.send(Command::IvIndexUpdated(iv_index)).await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))
    }

    pub async fn stats(&self) -> anyhow::Result<TransportStats> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Stats(reply)).await
            .map_err(|_| anyhow::anyhow!("transport actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("transport actor closed"))
    }

    pub async fn session_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::SessionCount(reply)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}


// ============================================================================
// Node Actor (owns the transport)
// ============================================================================

struct NodeActor<R: ReplayStore> {
    transport: Transport<R>,
    timers: Arc<TokioTimers>,
}

impl<R: ReplayStore> NodeActor<R> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut expiry_rx: mpsc::UnboundedReceiver<Expiry>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Unsegmented { meta, addressing, pdu, reply }) => {
                            let _ = reply.send(self.transport.receive_unsegmented(&meta, addressing, &pdu));
                        }
                        Some(Command::Segmented { meta, addressing, pdu, segment_index, params, reply }) => {
                            let outcome = self.transport
                                .receive_segmented(&meta, addressing, &pdu, segment_index, &params);
                            let _ = reply.send(outcome);
                        }
                        Some(Command::AbortSession { src, seqzero, reply }) => {
                            let _ = reply.send(self.transport.abort_session(src, seqzero));
                        }
                        Some(Command::IvIndexUpdated(iv_index)) => {
                            self.transport.iv_index_updated(iv_index);
                        }
                        Some(Command::Stats(reply)) => {
                            let _ = reply.send(self.transport.stats());
                        }
                        Some(Command::SessionCount(reply)) => {
                            let _ = reply.send(self.transport.session_count());
                        }
                        Some(Command::Quit) => {
                            debug!("transport actor quitting");
                            break;
                        }
                        None => {
                            debug!("transport handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                Some(expiry) = expiry_rx.recv() => {
                    if let Some(timer) = self.timers.take_expired(expiry) {
                        self.transport.handle_timer(timer);
                    }
                }
            }
        }
    }
}
