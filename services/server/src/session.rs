// Session: one connected peer, from transport attach to close.
//
// Each session runs on its own task.  The task owns all mutable protocol
// state and multiplexes four things: inbound frames, the outbound queue
// (dispatcher replies and tool output), the heartbeat interval, and the
// liveness deadline armed by an outstanding PING.

use crate::config::ServerConfig;
use crate::credit::CreditAccountant;
use crate::dispatch::SessionCore;
use crate::runs::RunTable;
use crate::state::AppState;
use crate::tools::ToolContext;
use crate::transport::{Frame, OutboundItem, OutboundReceiver, SessionTransport};
use haip_protocol::{
    Channel, Envelope, EventType, PingPayload, codec, error_codes, format_seq,
};
use std::collections::HashSet;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingHello,
    Open,
    Closing,
}

pub struct PendingPing {
    pub nonce: String,
    pub sent_at: Instant,
}

/// Per-session mutable state.  Owned exclusively by the session task.
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    pub phase: SessionPhase,
    pub last_activity: Instant,
    pub credits: CreditAccountant,
    pub transactions: crate::transaction::TransactionTable,
    pub runs: RunTable,
    /// Negotiated event set; initialised to the full vocabulary and
    /// intersected during the handshake.
    pub accept_events: HashSet<EventType>,
    pub negotiated_major: Option<u64>,
    pub last_ack: Option<u64>,
    /// Cursor for session-scoped envelopes (those without a transaction).
    pub last_delivered_seq: u64,
    next_outbound_seq: u64,
    pub pending_ping: Option<PendingPing>,
    pub last_latency: Option<Duration>,
    pub binary_frames: bool,
}

impl Session {
    pub fn new(id: String, config: &ServerConfig) -> Self {
        Session {
            id,
            user_id: None,
            phase: SessionPhase::AwaitingHello,
            last_activity: Instant::now(),
            credits: CreditAccountant::new(
                config.initial_credit_messages,
                config.initial_credit_bytes,
            ),
            transactions: crate::transaction::TransactionTable::new(),
            runs: RunTable::new(config.max_concurrent_runs),
            accept_events: EventType::ALL.into_iter().collect(),
            negotiated_major: None,
            last_ack: None,
            last_delivered_seq: 0,
            next_outbound_seq: 1,
            pending_ping: None,
            last_latency: None,
            binary_frames: config.binary_frames,
        }
    }

    pub fn next_session_seq(&mut self) -> u64 {
        let seq = self.next_outbound_seq;
        self.next_outbound_seq += 1;
        seq
    }
}

/// Runs one session to completion over any transport.
pub async fn run_session<T: SessionTransport>(
    mut transport: T,
    state: AppState,
    session_id: String,
) {
    let transport_kind = transport.kind();
    state.register_session(&session_id, transport_kind).await;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let session = Session::new(session_id.clone(), &state.config);
    let mut core = SessionCore::new(state.clone(), session, out_tx);
    info!(session_id = %session_id, transport = transport_kind, "session accepted");

    // Server handshake goes out first, before anything is read.  This is
    // what lets the HTTP-stream adapter write it as the first response line.
    core.push_server_hello();

    let reason = drive(&mut core, &mut out_rx, &mut transport).await;
    core.session.phase = SessionPhase::Closing;

    // Teardown: active tools get their cancellation hook; whatever they emit
    // is discarded along with the pending queues.
    let sink = core.out();
    for (transaction_id, tool_name) in core.session.transactions.open_bindings() {
        if let Some(tool) = core.state.tools.get(&tool_name) {
            let ctx = ToolContext::new(session_id.clone(), transaction_id, sink.clone());
            tool.handle_cancel(&ctx);
        }
    }
    core.session.credits.discard_pending();
    state.unregister_session(&session_id).await;
    transport.close().await;
    info!(session_id = %session_id, reason, "session closed");
}

async fn drive<T: SessionTransport>(
    core: &mut SessionCore,
    out_rx: &mut OutboundReceiver,
    transport: &mut T,
) -> &'static str {
    if !flush_outbound(core, out_rx, transport).await {
        return "transport_error";
    }

    // -- AwaitingHello ------------------------------------------------------
    let deadline = Instant::now() + core.state.config.hello_timeout;
    let hello = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, transport.recv()).await {
            Err(_) => {
                core.protocol_error(
                    error_codes::PROTOCOL_VIOLATION,
                    "timed out waiting for HAI",
                    None,
                );
                flush_outbound(core, out_rx, transport).await;
                return "hello_timeout";
            }
            Ok(None) => return "peer_disconnect",
            Ok(Some(Err(e))) => {
                warn!(session_id = %core.session.id, error = %e, "transport error before handshake");
                return "transport_error";
            }
            Ok(Some(Ok(Frame::Envelope { envelope, .. }))) => break envelope,
            Ok(Some(Ok(Frame::Binary(_)))) => {
                core.protocol_error(
                    error_codes::PROTOCOL_VIOLATION,
                    "binary frame before handshake",
                    None,
                );
                flush_outbound(core, out_rx, transport).await;
                return "binary_before_hello";
            }
            Ok(Some(Ok(Frame::Malformed(error)))) => {
                core.parse_failure(&error);
                flush_outbound(core, out_rx, transport).await;
                return "invalid_hello";
            }
        }
    };

    if let Err(reason) = core.handle_hello(&hello) {
        flush_outbound(core, out_rx, transport).await;
        return reason;
    }
    if let Some(user_id) = core.session.user_id.clone() {
        core.state.set_session_user(&core.session.id, &user_id).await;
    }
    if !flush_outbound(core, out_rx, transport).await {
        return "transport_error";
    }

    // -- Open ---------------------------------------------------------------
    let mut heartbeat = tokio::time::interval(core.state.config.heartbeat_interval);
    heartbeat.tick().await;
    let mut liveness: Option<Pin<Box<Sleep>>> = None;
    let mut pending_binary: Option<(Box<Envelope>, usize)> = None;

    loop {
        tokio::select! {
            inbound = transport.recv() => {
                match inbound {
                    None => return "peer_disconnect",
                    Some(Err(e)) => {
                        warn!(session_id = %core.session.id, error = %e, "transport error");
                        return "transport_error";
                    }
                    Some(Ok(frame)) => {
                        handle_frame(core, frame, &mut pending_binary, transport.binary_capable());
                        if core.session.pending_ping.is_none() {
                            liveness = None;
                        }
                        if !flush_outbound(core, out_rx, transport).await {
                            return "transport_error";
                        }
                    }
                }
            }
            item = out_rx.recv() => {
                // The core holds a sender, so the queue cannot close while
                // the session lives.
                let Some(item) = item else { return "sink_closed" };
                if !send_item(core, item, transport).await {
                    return "transport_error";
                }
            }
            _ = heartbeat.tick() => {
                let nonce = format!("{:016x}", rand::random::<u64>());
                core.session.pending_ping = Some(PendingPing {
                    nonce: nonce.clone(),
                    sent_at: Instant::now(),
                });
                let ping = Envelope::new(EventType::Ping, Channel::System)
                    .with_payload(&PingPayload { nonce });
                if !send_item(core, OutboundItem::new(ping), transport).await {
                    return "transport_error";
                }
                liveness = Some(Box::pin(tokio::time::sleep(
                    core.state.config.heartbeat_timeout,
                )));
            }
            () = armed(&mut liveness) => {
                warn!(session_id = %core.session.id, "heartbeat timeout");
                return "heartbeat_timeout";
            }
        }
    }
}

/// Resolves when the liveness timer is armed and expires; pends forever
/// otherwise.
async fn armed(liveness: &mut Option<Pin<Box<Sleep>>>) {
    match liveness {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn handle_frame(
    core: &mut SessionCore,
    frame: Frame,
    pending_binary: &mut Option<(Box<Envelope>, usize)>,
    binary_capable: bool,
) {
    match frame {
        Frame::Envelope { envelope, wire_len } => {
            if let Some((header, _)) = pending_binary.take() {
                core.protocol_error(
                    error_codes::PROTOCOL_VIOLATION,
                    "announced binary frame never arrived",
                    Some(header.id.clone()),
                );
            }
            if envelope.bin_len.unwrap_or(0) > 0 {
                if binary_capable && core.session.binary_frames {
                    *pending_binary = Some((envelope, wire_len));
                } else {
                    core.protocol_error(
                        error_codes::PROTOCOL_VIOLATION,
                        "bin_len is not supported on this transport",
                        Some(envelope.id.clone()),
                    );
                }
            } else {
                core.handle_envelope(*envelope, None, wire_len);
            }
        }
        Frame::Binary(bytes) => match pending_binary.take() {
            Some((header, wire_len)) => core.handle_envelope(*header, Some(bytes), wire_len),
            None => core.protocol_error(
                error_codes::PROTOCOL_VIOLATION,
                "binary frame without a bin_len header",
                None,
            ),
        },
        Frame::Malformed(error) => core.parse_failure(&error),
    }
}

/// Moves everything currently queued onto the transport.  Returns false on
/// transport failure.
async fn flush_outbound<T: SessionTransport>(
    core: &mut SessionCore,
    out_rx: &mut OutboundReceiver,
    transport: &mut T,
) -> bool {
    while let Ok(item) = out_rx.try_recv() {
        if !send_item(core, item, transport).await {
            return false;
        }
    }
    true
}

/// Finalises envelope metadata, applies the flow-control gate, and emits.
/// Verbatim items (replay redelivery, drained backlog) skip both the stamp
/// and the gate.
async fn send_item<T: SessionTransport>(
    core: &mut SessionCore,
    mut item: OutboundItem,
    transport: &mut T,
) -> bool {
    if !item.preserve_seq {
        item.envelope.session = core.session.id.clone();
        let seq = match item.envelope.transaction.clone() {
            Some(transaction_id) => match core.session.transactions.get_mut(&transaction_id) {
                Some(transaction) => transaction.next_outbound_seq(),
                None => core.session.next_session_seq(),
            },
            None => core.session.next_session_seq(),
        };
        item.envelope.seq = format_seq(seq);
    }

    let wire_len = codec::encode_envelope(&item.envelope).len();
    let size = wire_len as u64 + item.binary.as_ref().map_or(0, |b| b.len() as u64);
    if !item.preserve_seq && !core.session.credits.may_emit(item.envelope.channel, size) {
        core.session
            .credits
            .enqueue(item.envelope.channel, item, size);
        return true;
    }
    transport
        .send(&item.envelope, item.binary.as_ref())
        .await
        .is_ok()
}
