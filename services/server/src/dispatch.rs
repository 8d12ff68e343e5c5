// Dispatcher: the per-envelope pipeline for an Open session.
//
// Order matters: activity/ack bookkeeping, duplicate drop, credit admission,
// replay buffering, then routing by type.  Duplicates are dropped before
// admission so redelivery never burns credit, and the seq cursor only
// advances for envelopes that were actually admitted.

use crate::auth::token_fingerprint;
use crate::credit::{Admission, CreditAccountant};
use crate::runs::{RunEndError, RunStartError, RunTable};
use crate::session::{Session, SessionPhase};
use crate::state::AppState;
use crate::tools::ToolContext;
use crate::transport::{OutboundItem, OutboundSender};
use bytes::Bytes;
use haip_protocol::{
    Capabilities, Channel, ChannelControlPayload, Envelope, ErrorPayload, EventType,
    FlowControlCaps, FlowUpdatePayload, HAIP_VERSION, HandshakePayload, ParseError, PingPayload,
    PongPayload, ReplayRequestPayload, RunCancelPayload, RunErrorPayload, RunFinishedPayload,
    RunStartedPayload, SUPPORTED_MAJORS, ToolListPayload, ToolSchemaPayload,
    ToolSchemaRequestPayload, TransactionAcceptedPayload, TransactionStartPayload, codec,
    error_codes, mint_id, parse_seq,
};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Reason a handshake failure closes the session.  Carried into the
/// disconnect log line.
pub type CloseReason = &'static str;

enum SeqScope {
    Session,
    Transaction(String),
}

/// The session's protocol brain: owns the mutable session state and produces
/// outbound envelopes onto the session's sink.  Transport-agnostic and fully
/// synchronous, which keeps it testable without sockets.
pub struct SessionCore {
    pub state: AppState,
    pub session: Session,
    out: OutboundSender,
}

impl SessionCore {
    pub fn new(state: AppState, session: Session, out: OutboundSender) -> Self {
        SessionCore { state, session, out }
    }

    pub fn out(&self) -> OutboundSender {
        self.out.clone()
    }

    fn push(&self, envelope: Envelope) {
        let _ = self.out.send(OutboundItem::new(envelope));
    }

    pub fn protocol_error(&mut self, code: &str, message: &str, related_id: Option<String>) {
        self.state.stats.record_error();
        warn!(session_id = %self.session.id, code, message, "protocol error");
        self.push(
            Envelope::new(EventType::Error, Channel::System).with_payload(&ErrorPayload {
                code: code.to_owned(),
                message: message.to_owned(),
                related_id,
                detail: None,
            }),
        );
    }

    /// A text unit that failed envelope validation.  Local rejection: an
    /// ERROR goes out, session state is untouched.
    pub fn parse_failure(&mut self, error: &ParseError) {
        self.protocol_error(error.code(), &error.to_string(), None);
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// The server's own HAI, emitted as soon as the transport attaches.
    pub fn push_server_hello(&mut self) {
        let config = &self.state.config;
        let payload = HandshakePayload {
            haip_version: HAIP_VERSION.to_owned(),
            accept_major: SUPPORTED_MAJORS.to_vec(),
            accept_events: EventType::all_names(),
            capabilities: Some(Capabilities {
                binary_frames: config.binary_frames,
                flow_control: Some(FlowControlCaps {
                    initial_credit_messages: Some(config.initial_credit_messages),
                    initial_credit_bytes: Some(config.initial_credit_bytes),
                }),
                max_concurrent_runs: Some(config.max_concurrent_runs),
                signed_envelopes: false,
            }),
            last_rx_seq: None,
            auth: None,
        };
        self.push(Envelope::new(EventType::Hai, Channel::System).with_payload(&payload));
    }

    /// Processes the peer's first envelope.  On success the session is Open;
    /// on failure an ERROR has been pushed and the caller must close.
    pub fn handle_hello(&mut self, envelope: &Envelope) -> Result<(), CloseReason> {
        if envelope.event != EventType::Hai {
            self.protocol_error(
                error_codes::NOT_HAI,
                "first envelope must be HAI",
                Some(envelope.id.clone()),
            );
            return Err("not_hai");
        }
        let hello: HandshakePayload = match envelope.decode_payload() {
            Ok(hello) => hello,
            Err(e) => {
                self.protocol_error(
                    error_codes::INVALID_MESSAGE,
                    &format!("malformed HAI payload: {e}"),
                    Some(envelope.id.clone()),
                );
                return Err("invalid_hello");
            }
        };

        let Some(user_id) = self.state.authenticator.authenticate(hello.auth.as_ref()) else {
            let fingerprint = hello
                .auth
                .as_ref()
                .and_then(|auth| auth.get("token"))
                .and_then(serde_json::Value::as_str)
                .map(token_fingerprint);
            warn!(
                session_id = %self.session.id,
                token_fingerprint = fingerprint.as_deref().unwrap_or("none"),
                "authentication rejected"
            );
            self.protocol_error(
                error_codes::FAILED_AUTH,
                "authentication rejected",
                Some(envelope.id.clone()),
            );
            return Err("failed_auth");
        };

        let Some(major) = hello
            .accept_major
            .iter()
            .copied()
            .filter(|m| SUPPORTED_MAJORS.contains(m))
            .max()
        else {
            self.protocol_error(
                error_codes::VERSION_INCOMPATIBLE,
                &format!("no common major version in {:?}", hello.accept_major),
                Some(envelope.id.clone()),
            );
            return Err("version_incompatible");
        };

        // The intersected event set governs the rest of the session.  An
        // absent advertisement means the peer takes everything; HAI and ERROR
        // always stay in so problems remain reportable.
        let mut accepted: HashSet<EventType> = if hello.accept_events.is_empty() {
            EventType::ALL.into_iter().collect()
        } else {
            hello
                .accept_events
                .iter()
                .filter_map(|name| EventType::from_wire(name))
                .collect()
        };
        accepted.insert(EventType::Hai);
        accepted.insert(EventType::Error);

        if let Some(caps) = &hello.capabilities {
            if let Some(flow) = &caps.flow_control {
                let config = &self.state.config;
                self.session.credits = CreditAccountant::new(
                    flow.initial_credit_messages
                        .unwrap_or(config.initial_credit_messages),
                    flow.initial_credit_bytes
                        .unwrap_or(config.initial_credit_bytes),
                );
            }
            if let Some(max_runs) = caps.max_concurrent_runs {
                let cap = self.state.config.max_concurrent_runs.min(max_runs);
                self.session.runs = RunTable::new(cap);
            }
            self.session.binary_frames = self.state.config.binary_frames && caps.binary_frames;
        }

        if hello.last_rx_seq.is_some() {
            // Sessions are process-owned and replay state lives in the
            // transaction; a fresh connection has nothing to resume from.
            // The peer re-requests gaps per transaction via REPLAY_REQUEST.
            self.protocol_error(
                error_codes::RESUME_FAILED,
                "no prior state to resume; continuing fresh",
                Some(envelope.id.clone()),
            );
        }

        self.session.accept_events = accepted;
        self.session.negotiated_major = Some(major);
        self.session.user_id = Some(user_id.clone());
        self.session.phase = SessionPhase::Open;
        info!(
            session_id = %self.session.id,
            user_id = %user_id,
            major,
            "session open"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Open-state pipeline
    // -----------------------------------------------------------------------

    pub fn handle_envelope(&mut self, envelope: Envelope, binary: Option<Bytes>, wire_len: usize) {
        self.session.last_activity = Instant::now();
        self.state.stats.record_message();

        if let Some(ack) = envelope.ack.as_deref().and_then(parse_seq) {
            self.session.last_ack =
                Some(self.session.last_ack.map_or(ack, |prev| prev.max(ack)));
        }

        let Some(seq) = envelope.seq_number() else {
            self.protocol_error(
                error_codes::SEQ_VIOLATION,
                &format!("unparseable seq `{}`", envelope.seq),
                Some(envelope.id.clone()),
            );
            return;
        };

        // Resolve the seq scope: TRANSACTION_START carries the peer's
        // temporary id, which is session-scoped until the server binds a
        // real transaction.
        let scope = if envelope.event == EventType::TransactionStart {
            SeqScope::Session
        } else if let Some(transaction_id) = envelope.transaction.clone() {
            if !self.session.transactions.contains(&transaction_id) {
                self.protocol_error(
                    error_codes::TRANSACTION_NOT_FOUND,
                    &format!("no open transaction `{transaction_id}`"),
                    Some(envelope.id.clone()),
                );
                return;
            }
            SeqScope::Transaction(transaction_id)
        } else if envelope.event.requires_transaction() {
            self.protocol_error(
                error_codes::INVALID_MESSAGE,
                &format!("{} requires a transaction id", envelope.event),
                Some(envelope.id.clone()),
            );
            return;
        } else {
            SeqScope::Session
        };

        let last_delivered = match &scope {
            SeqScope::Session => self.session.last_delivered_seq,
            SeqScope::Transaction(id) => self
                .session
                .transactions
                .get_mut(id)
                .map_or(0, |t| t.last_delivered_seq),
        };
        if seq <= last_delivered {
            trace!(session_id = %self.session.id, seq, "duplicate seq dropped");
            return;
        }

        if !envelope.event.is_flow_exempt() {
            let size = codec::effective_size(&envelope, wire_len);
            match self.session.credits.admit_inbound(envelope.channel, size) {
                Admission::Granted => {}
                Admission::DeniedMessages | Admission::DeniedBytes => {
                    self.protocol_error(
                        error_codes::INSUFFICIENT_CREDITS,
                        &format!("no credit left on channel {}", envelope.channel),
                        Some(envelope.id.clone()),
                    );
                    return;
                }
            }
        }

        match &scope {
            SeqScope::Session => self.session.last_delivered_seq = seq,
            SeqScope::Transaction(id) => {
                if let Some(transaction) = self.session.transactions.get_mut(id) {
                    transaction.last_delivered_seq = seq;
                    transaction.replay.insert(seq, envelope.clone());
                }
            }
        }

        if !self.session.accept_events.contains(&envelope.event) {
            self.protocol_error(
                error_codes::UNSUPPORTED_TYPE,
                &format!("event {} is outside the negotiated set", envelope.event),
                Some(envelope.id.clone()),
            );
            return;
        }

        match envelope.event {
            EventType::Hai => self.protocol_error(
                error_codes::PROTOCOL_VIOLATION,
                "handshake already complete; HAI ignored",
                Some(envelope.id.clone()),
            ),
            EventType::Ping => self.handle_ping(&envelope),
            EventType::Pong => self.handle_pong(&envelope),
            EventType::TransactionStart => self.handle_transaction_start(&envelope),
            EventType::TransactionEnd => self.handle_transaction_end(&envelope),
            EventType::ReplayRequest => self.handle_replay_request(&envelope),
            EventType::MessageStart
            | EventType::MessagePart
            | EventType::MessageEnd
            | EventType::ToolCall
            | EventType::ToolUpdate => self.route_message_to_tool(&envelope),
            EventType::AudioChunk => self.route_audio_to_tool(&envelope, binary),
            EventType::ToolCancel => self.handle_tool_cancel(&envelope),
            EventType::ToolDone => {
                debug!(session_id = %self.session.id, envelope_id = %envelope.id, "peer tool done")
            }
            EventType::ToolList => self.handle_tool_list(),
            EventType::ToolSchema => self.handle_tool_schema(&envelope),
            EventType::FlowUpdate => self.handle_flow_update(&envelope),
            EventType::PauseChannel | EventType::ResumeChannel => {
                self.handle_channel_control(&envelope)
            }
            EventType::RunStarted => self.handle_run_started(&envelope),
            EventType::RunFinished | EventType::RunCancel | EventType::RunError => {
                self.handle_run_end(&envelope)
            }
            EventType::Error => {
                let code = envelope
                    .decode_payload::<ErrorPayload>()
                    .map(|e| e.code)
                    .unwrap_or_default();
                warn!(session_id = %self.session.id, code = %code, "peer reported error");
            }
            EventType::Info => {
                info!(session_id = %self.session.id, envelope_id = %envelope.id, "peer info");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    fn handle_ping(&mut self, envelope: &Envelope) {
        let Ok(ping) = envelope.decode_payload::<PingPayload>() else {
            self.protocol_error(
                error_codes::INVALID_MESSAGE,
                "PING payload must carry a nonce",
                Some(envelope.id.clone()),
            );
            return;
        };
        self.push(
            Envelope::new(EventType::Pong, Channel::System)
                .with_payload(&PongPayload { nonce: ping.nonce }),
        );
    }

    fn handle_pong(&mut self, envelope: &Envelope) {
        let Ok(pong) = envelope.decode_payload::<PongPayload>() else {
            return;
        };
        match self.session.pending_ping.take() {
            Some(pending) if pending.nonce == pong.nonce => {
                self.session.last_latency = Some(pending.sent_at.elapsed());
            }
            other => {
                // Stale or unsolicited PONG; the liveness timer stays armed.
                self.session.pending_ping = other;
                debug!(session_id = %self.session.id, "unmatched PONG nonce");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    fn handle_transaction_start(&mut self, envelope: &Envelope) {
        let request: TransactionStartPayload = envelope.decode_payload().unwrap_or_default();
        let Some(tool_name) = request.tool_name.filter(|name| !name.is_empty()) else {
            self.protocol_error(
                error_codes::MISSING_TOOL_NAME,
                "TRANSACTION_START payload must name a tool",
                Some(envelope.id.clone()),
            );
            return;
        };
        if self.state.tools.get(&tool_name).is_none() {
            self.protocol_error(
                error_codes::TOOL_NOT_FOUND,
                &format!("no tool named `{tool_name}` is registered"),
                Some(envelope.id.clone()),
            );
            return;
        }

        let transaction_id = self
            .session
            .transactions
            .open(&tool_name, request.params, &self.state.config)
            .id
            .clone();
        // The peer rebinds its temporary id to the server-side one.
        let reference_id = envelope
            .transaction
            .clone()
            .unwrap_or_else(|| envelope.id.clone());
        info!(
            session_id = %self.session.id,
            transaction_id = %transaction_id,
            tool = %tool_name,
            "transaction started"
        );
        self.push(
            Envelope::new(EventType::TransactionStart, Channel::System)
                .with_transaction(transaction_id)
                .with_payload(&TransactionAcceptedPayload {
                    reference_id,
                    tool_name,
                }),
        );
    }

    fn handle_transaction_end(&mut self, envelope: &Envelope) {
        // Presence was checked while resolving the seq scope.
        let transaction_id = envelope.transaction.clone().unwrap_or_default();
        if self.session.transactions.close(&transaction_id).is_some() {
            info!(
                session_id = %self.session.id,
                transaction_id = %transaction_id,
                "transaction ended"
            );
        }
    }

    fn handle_replay_request(&mut self, envelope: &Envelope) {
        let Ok(request) = envelope.decode_payload::<ReplayRequestPayload>() else {
            self.protocol_error(
                error_codes::INVALID_MESSAGE,
                "REPLAY_REQUEST payload must carry from_seq",
                Some(envelope.id.clone()),
            );
            return;
        };
        let Some(from_seq) = parse_seq(&request.from_seq) else {
            self.protocol_error(
                error_codes::INVALID_MESSAGE,
                &format!("unparseable from_seq `{}`", request.from_seq),
                Some(envelope.id.clone()),
            );
            return;
        };
        let to_seq = match &request.to_seq {
            None => None,
            Some(raw) => match parse_seq(raw) {
                Some(seq) => Some(seq),
                None => {
                    self.protocol_error(
                        error_codes::INVALID_MESSAGE,
                        &format!("unparseable to_seq `{raw}`"),
                        Some(envelope.id.clone()),
                    );
                    return;
                }
            },
        };

        let transaction_id = envelope.transaction.clone().unwrap_or_default();
        let replayed = {
            let Some(transaction) = self.session.transactions.get_mut(&transaction_id) else {
                return;
            };
            transaction.replay.range(from_seq, to_seq)
        };
        match replayed {
            Ok(entries) => {
                debug!(
                    session_id = %self.session.id,
                    transaction_id = %transaction_id,
                    count = entries.len(),
                    "replaying window range"
                );
                for stored in entries {
                    // Stored envelopes go out verbatim; redelivery keeps the
                    // original id, seq, and timestamps.
                    let _ = self.out.send(OutboundItem::verbatim(stored));
                }
            }
            Err(_) => self.protocol_error(
                error_codes::REPLAY_TOO_OLD,
                &format!("seq {from_seq} is older than the replay window"),
                Some(envelope.id.clone()),
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Tool routing
    // -----------------------------------------------------------------------

    fn tool_binding(&mut self, envelope: &Envelope) -> Option<(ToolContext, std::sync::Arc<dyn crate::tools::Tool>)> {
        let transaction_id = envelope.transaction.clone()?;
        let tool_name = self
            .session
            .transactions
            .get_mut(&transaction_id)?
            .tool_name
            .clone();
        let Some(tool) = self.state.tools.get(&tool_name) else {
            self.protocol_error(
                error_codes::TOOL_NOT_FOUND,
                &format!("tool `{tool_name}` is no longer registered"),
                Some(envelope.id.clone()),
            );
            return None;
        };
        let ctx = ToolContext::new(self.session.id.clone(), transaction_id, self.out.clone());
        Some((ctx, tool))
    }

    fn route_message_to_tool(&mut self, envelope: &Envelope) {
        if let Some((ctx, tool)) = self.tool_binding(envelope) {
            tool.handle_message(&ctx, envelope);
        }
    }

    fn route_audio_to_tool(&mut self, envelope: &Envelope, binary: Option<Bytes>) {
        if let Some((ctx, tool)) = self.tool_binding(envelope) {
            let data = binary
                .map(|b| b.to_vec())
                .or_else(|| codec::take_binary_payload(envelope))
                .unwrap_or_default();
            tool.handle_audio_chunk(&ctx, envelope, &data);
        }
    }

    fn handle_tool_cancel(&mut self, envelope: &Envelope) {
        if let Some((ctx, tool)) = self.tool_binding(envelope) {
            info!(
                session_id = %self.session.id,
                transaction_id = %ctx.transaction_id,
                "tool cancel requested"
            );
            tool.handle_cancel(&ctx);
        }
    }

    fn handle_tool_list(&mut self) {
        self.push(
            Envelope::new(EventType::ToolList, Channel::System).with_payload(&ToolListPayload {
                tools: self.state.tools.descriptors(),
            }),
        );
    }

    fn handle_tool_schema(&mut self, envelope: &Envelope) {
        let request: ToolSchemaRequestPayload = envelope.decode_payload().unwrap_or_default();
        let Some(tool_name) = request.tool_name.filter(|name| !name.is_empty()) else {
            self.protocol_error(
                error_codes::MISSING_TOOL_NAME,
                "TOOL_SCHEMA payload must name a tool",
                Some(envelope.id.clone()),
            );
            return;
        };
        let Some(tool) = self.state.tools.get(&tool_name) else {
            self.protocol_error(
                error_codes::TOOL_NOT_FOUND,
                &format!("no tool named `{tool_name}` is registered"),
                Some(envelope.id.clone()),
            );
            return;
        };
        self.push(
            Envelope::new(EventType::ToolSchema, Channel::System).with_payload(&ToolSchemaPayload {
                tool_name,
                input_schema: tool.input_schema(),
                output_schema: tool.output_schema(),
            }),
        );
    }

    // -----------------------------------------------------------------------
    // Flow control
    // -----------------------------------------------------------------------

    fn handle_flow_update(&mut self, envelope: &Envelope) {
        let Ok(update) = envelope.decode_payload::<FlowUpdatePayload>() else {
            self.protocol_error(
                error_codes::FLOW_CONTROL_VIOLATION,
                "FLOW_UPDATE payload must name a known channel",
                Some(envelope.id.clone()),
            );
            return;
        };
        let add_messages = update.add_messages.unwrap_or(0);
        let add_bytes = update.add_bytes.unwrap_or(0);
        if add_messages == 0 && add_bytes == 0 {
            self.protocol_error(
                error_codes::FLOW_CONTROL_VIOLATION,
                "FLOW_UPDATE must grant messages or bytes",
                Some(envelope.id.clone()),
            );
            return;
        }
        self.session
            .credits
            .grant(update.channel, add_messages, add_bytes);
        debug!(
            session_id = %self.session.id,
            channel = %update.channel,
            add_messages,
            add_bytes,
            "credits granted"
        );
        self.drain_channel(update.channel);
    }

    fn handle_channel_control(&mut self, envelope: &Envelope) {
        let Ok(control) = envelope.decode_payload::<ChannelControlPayload>() else {
            self.protocol_error(
                error_codes::INVALID_MESSAGE,
                "payload must name a known channel",
                Some(envelope.id.clone()),
            );
            return;
        };
        match envelope.event {
            EventType::PauseChannel => {
                self.session.credits.pause(control.channel);
                debug!(session_id = %self.session.id, channel = %control.channel, "channel paused");
            }
            _ => {
                self.session.credits.resume(control.channel);
                debug!(session_id = %self.session.id, channel = %control.channel, "channel resumed");
                self.drain_channel(control.channel);
            }
        }
    }

    /// Re-emits queued envelopes that the channel can now carry.  They were
    /// finalised before queueing, so they go back out verbatim and in order.
    fn drain_channel(&mut self, channel: Channel) {
        for mut item in self.session.credits.drain(channel) {
            item.preserve_seq = true;
            let _ = self.out.send(item);
        }
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    fn run_id_of(envelope: &Envelope, payload_run_id: Option<String>) -> Option<String> {
        envelope.run_id.clone().or(payload_run_id)
    }

    fn handle_run_started(&mut self, envelope: &Envelope) {
        let payload: RunStartedPayload = envelope.decode_payload().unwrap_or_default();
        let run_id = Self::run_id_of(envelope, payload.run_id).unwrap_or_else(mint_id);
        let thread_id = envelope.thread_id.clone().or(payload.thread_id);
        match self.session.runs.start(&run_id, thread_id) {
            Ok(_) => {
                debug!(session_id = %self.session.id, run_id = %run_id, "run started");
            }
            Err(RunStartError::LimitExceeded) => self.protocol_error(
                error_codes::RUN_LIMIT_EXCEEDED,
                &format!(
                    "already tracking {} concurrent runs",
                    self.session.runs.active_len()
                ),
                Some(envelope.id.clone()),
            ),
        }
    }

    fn handle_run_end(&mut self, envelope: &Envelope) {
        let (run_id, outcome) = match envelope.event {
            EventType::RunFinished => {
                let payload: RunFinishedPayload = envelope.decode_payload().unwrap_or_default();
                let run_id = Self::run_id_of(envelope, payload.run_id);
                (run_id.clone(), run_id.map(|id| self.session.runs.finish(&id, payload.summary)))
            }
            EventType::RunCancel => {
                let payload: RunCancelPayload = envelope.decode_payload().unwrap_or_default();
                let run_id = Self::run_id_of(envelope, payload.run_id);
                (run_id.clone(), run_id.map(|id| self.session.runs.cancel(&id)))
            }
            _ => {
                let payload: RunErrorPayload = envelope.decode_payload().unwrap_or_default();
                let run_id = Self::run_id_of(envelope, payload.run_id);
                (
                    run_id.clone(),
                    run_id.map(|id| self.session.runs.error(&id, payload.message)),
                )
            }
        };
        match (run_id, outcome) {
            (None, _) => self.protocol_error(
                error_codes::MISSING_RUN_ID,
                &format!("{} requires a run_id", envelope.event),
                Some(envelope.id.clone()),
            ),
            (Some(run_id), Some(Err(RunEndError::NotFound))) => self.protocol_error(
                error_codes::RUN_NOT_FOUND,
                &format!("no active run `{run_id}`"),
                Some(envelope.id.clone()),
            ),
            (Some(run_id), _) => {
                debug!(session_id = %self.session.id, run_id = %run_id, event = %envelope.event, "run ended");
            }
        }
    }
}
