// Tool registry and dispatch contract.
//
// Tools are registered process-wide and shared across sessions; the registry
// is read-mostly after startup.  Handlers run on the session task and emit
// through a `ToolContext` sink bound to (session, transaction) -- the session
// stamps `session` and `seq` before serialisation, so tool code never
// fabricates envelope metadata.

use crate::transport::{OutboundItem, OutboundSender};
use haip_protocol::{Channel, Envelope, EventType, ToolDescriptor, ToolDonePayload};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Outbound sink bound to one (session, transaction).
pub struct ToolContext {
    pub session_id: String,
    pub transaction_id: String,
    out: OutboundSender,
}

impl ToolContext {
    pub fn new(session_id: String, transaction_id: String, out: OutboundSender) -> Self {
        ToolContext {
            session_id,
            transaction_id,
            out,
        }
    }

    /// Emits one envelope on this context's transaction.  Envelope identity
    /// and payload come from the tool; session and seq are injected later.
    pub fn emit(&self, event: EventType, channel: Channel, payload: Value) {
        let mut envelope =
            Envelope::new(event, channel).with_transaction(self.transaction_id.clone());
        envelope.payload = payload;
        self.send(OutboundItem::new(envelope));
    }

    /// Emits an envelope announcing a binary continuation.  Binary-capable
    /// transports frame `bytes` natively; text transports fold them into the
    /// payload as base64.
    pub fn emit_binary(&self, channel: Channel, mime: &str, bytes: bytes::Bytes, payload: Value) {
        let mut envelope = Envelope::new(EventType::AudioChunk, channel)
            .with_transaction(self.transaction_id.clone());
        envelope.payload = payload;
        envelope.bin_len = Some(bytes.len() as u64);
        envelope.bin_mime = Some(mime.to_owned());
        let mut item = OutboundItem::new(envelope);
        item.binary = Some(bytes);
        self.send(item);
    }

    fn send(&self, item: OutboundItem) {
        // A failed send means the session is tearing down; the envelope is
        // discarded with the rest of the pending queues.
        let _ = self.out.send(item);
    }
}

/// A registered tool.  `handle_message` and `handle_audio_chunk` run on the
/// session task; long work should be spawned and report progress through the
/// context instead of holding the task.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn output_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn handle_message(&self, ctx: &ToolContext, envelope: &Envelope);

    fn handle_audio_chunk(&self, ctx: &ToolContext, envelope: &Envelope, data: &[u8]) {
        let _ = (ctx, envelope, data);
    }

    /// Invoked for TOOL_CANCEL and on session teardown.  The default emits
    /// the terminal TOOL_DONE the protocol expects from a cancelled call.
    fn handle_cancel(&self, ctx: &ToolContext) {
        ctx.emit(
            EventType::ToolDone,
            Channel::Agent,
            json!(ToolDonePayload {
                status: "CANCELLED".to_owned(),
                result: None,
            }),
        );
    }

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
        }
    }
}

/// Process-wide name -> tool table.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        debug!(tool = %name, "registering tool");
        self.tools
            .write()
            .expect("tool registry poisoned")
            .insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .read()
            .expect("tool registry poisoned")
            .values()
            .map(|tool| tool.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors().into_iter().map(|d| d.name).collect()
    }
}

// ---------------------------------------------------------------------------
// Default tools.  These ship with the server binary and are registered by
// `main`; the engine itself starts with an empty registry.
// ---------------------------------------------------------------------------

/// Mirrors every message event back on the channel it arrived on.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echoes message events back on the originating channel"
    }

    fn handle_message(&self, ctx: &ToolContext, envelope: &Envelope) {
        ctx.emit(envelope.event, envelope.channel, envelope.payload.clone());
    }

    fn handle_audio_chunk(&self, ctx: &ToolContext, envelope: &Envelope, data: &[u8]) {
        let mime = envelope.bin_mime.as_deref().unwrap_or("application/octet-stream");
        ctx.emit_binary(
            Channel::AudioOut,
            mime,
            bytes::Bytes::copy_from_slice(data),
            json!({}),
        );
    }
}

/// Adds `a` and `b` from the message payload and reports the sum in a
/// terminal TOOL_DONE.
pub struct AddTool;

impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "adds payload fields a and b"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"sum": {"type": "number"}}
        })
    }

    fn handle_message(&self, ctx: &ToolContext, envelope: &Envelope) {
        let a = envelope.payload.get("a").and_then(Value::as_f64);
        let b = envelope.payload.get("b").and_then(Value::as_f64);
        let payload = match (a, b) {
            (Some(a), Some(b)) => json!(ToolDonePayload {
                status: "OK".to_owned(),
                result: Some(json!({"sum": a + b})),
            }),
            _ => json!(ToolDonePayload {
                status: "ERROR".to_owned(),
                result: Some(json!({"message": "payload must carry numeric a and b"})),
            }),
        };
        ctx.emit(EventType::ToolDone, Channel::Agent, payload);
    }
}
