//! Inbound frame routing for one connection.

use crate::model::{DeviceId, DeviceUpdate};
use crate::pending::{InvocationIds, InvocationOutcome, PendingInvocations};
use crate::protocol::{self, Completion, Frame, Invocation};
use crate::state::{DeviceDirectory, DeviceStateStore, ReadySignal};
use crate::transport::{TransportHandle, WsError};
use crate::watchdog::HealthClocks;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

/// Outbound port for device-state changes. Called on the read loop, so
/// implementations must return quickly.
pub trait DeviceStateSink: Send + Sync {
    fn on_device_state(&self, update: &DeviceUpdate);
}

impl<F> DeviceStateSink for F
where
    F: Fn(&DeviceUpdate) + Send + Sync,
{
    fn on_device_state(&self, update: &DeviceUpdate) {
        self(update)
    }
}

/// Client-lifetime state the dispatcher feeds.
pub struct DispatchContext {
    pub store: DeviceStateStore,
    pub directory: DeviceDirectory,
    pub pending: PendingInvocations,
    pub clocks: Arc<HealthClocks>,
    pub ready: ReadySignal,
    pub ids: InvocationIds,
    pub sink: Arc<dyn DeviceStateSink>,
}

impl DispatchContext {
    pub fn new(sink: Arc<dyn DeviceStateSink>) -> Self {
        Self {
            store: DeviceStateStore::new(),
            directory: DeviceDirectory::new(),
            pending: PendingInvocations::new(),
            clocks: Arc::new(HealthClocks::new()),
            ready: ReadySignal::new(),
            ids: InvocationIds::new(),
            sink,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    AwaitingHandshakeAck,
    Steady,
}

/// How the read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The handle was closed from our side (watchdog, reconnect, write failure).
    ClosedLocally,
    ClosedByServer(Option<String>),
    StreamEnded,
    SocketError(String),
}

pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    transport: TransportHandle,
    state: DispatchState,
}

impl Dispatcher {
    pub fn new(ctx: Arc<DispatchContext>, transport: TransportHandle) -> Self {
        Self {
            ctx,
            transport,
            state: DispatchState::AwaitingHandshakeAck,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub async fn handle_text(&mut self, text: &str) {
        self.ctx.clocks.touch_message();
        for record in protocol::split_records(text) {
            match protocol::decode_frame(record) {
                Ok(frame) => self.handle_frame(frame).await,
                Err(err) => tracing::debug!(error = %err, "ignoring malformed record"),
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        if let Frame::HandshakeAck { error } = frame {
            self.handle_handshake_ack(error);
            return;
        }
        if self.state == DispatchState::AwaitingHandshakeAck {
            tracing::debug!("traffic before handshake ack, treating handshake as accepted");
            self.state = DispatchState::Steady;
        }

        match frame {
            Frame::Ping => {
                tracing::debug!("ping received, replying");
                if let Err(err) = self.transport.send_ping().await {
                    tracing::debug!(error = %err, "ping reply dropped");
                }
            }
            Frame::Invocation(invocation) => self.handle_invocation(invocation),
            Frame::Completion(completion) => self.handle_completion(completion).await,
            Frame::Other(message_type) => tracing::debug!(message_type, "ignoring frame"),
            Frame::HandshakeAck { .. } => {}
        }
    }

    fn handle_handshake_ack(&mut self, error: Option<String>) {
        match (self.state, error) {
            (DispatchState::AwaitingHandshakeAck, None) => {
                tracing::info!("handshake accepted");
                self.state = DispatchState::Steady;
            }
            (_, Some(error)) => {
                tracing::warn!(error = %error, "handshake rejected, closing transport");
                self.transport.close();
            }
            (DispatchState::Steady, None) => tracing::debug!("ignoring untyped record"),
        }
    }

    fn handle_invocation(&self, invocation: Invocation) {
        if invocation.target != protocol::TARGET_EVENT_OBJECT {
            tracing::debug!(method = %invocation.target, "unhandled invocation");
            return;
        }
        if invocation.arguments.is_empty() {
            return;
        }
        self.ctx.clocks.touch_event();

        let Some((device_id, partial)) = protocol::parse_device_event(&invocation.arguments) else {
            tracing::debug!("event without device_id");
            return;
        };
        let state = self.ctx.store.apply_partial(device_id, &partial);
        log_device_update(device_id, &partial);

        let update = DeviceUpdate {
            device_id,
            partial,
            state,
        };
        let sink = &self.ctx.sink;
        if catch_unwind(AssertUnwindSafe(|| sink.on_device_state(&update))).is_err() {
            tracing::error!(device_id, "device state sink panicked");
        }
    }

    async fn handle_completion(&self, completion: Completion) {
        if let Some(invocation_id) = completion.invocation_id.as_deref() {
            let error = completion.error_message();
            tracing::debug!(invocation_id, error = ?error, "completion received");
            let outcome = match error {
                Some(message) => InvocationOutcome::Failed(message),
                None => InvocationOutcome::Success(completion.result.clone()),
            };
            self.ctx.pending.resolve(invocation_id, outcome);
        }

        let Some(devices) = completion.result.as_ref().and_then(protocol::parse_directory) else {
            return;
        };
        tracing::info!(count = devices.len(), "device directory received");
        for device in &devices {
            tracing::info!(
                device_id = device.device_id,
                label = %device.display_name(),
                model = device.model.as_deref().unwrap_or("unknown"),
                "device"
            );
        }
        let device_ids: Vec<DeviceId> = devices.iter().map(|d| d.device_id).collect();
        self.ctx.directory.replace(devices);

        let watch = Invocation::watch_devices(self.ctx.ids.next(), &device_ids);
        match protocol::encode_invocation(&watch) {
            Ok(frame) => match self.transport.send_text(frame).await {
                Ok(()) => tracing::info!(?device_ids, "subscribed to devices"),
                Err(err) => tracing::warn!(error = %err, "watch request not sent"),
            },
            Err(err) => tracing::error!(error = %err, "failed to encode watch request"),
        }

        if self.ctx.ready.set() {
            tracing::info!("devices ready");
        }
    }
}

fn text_field<'a>(partial: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    partial.get(key).and_then(Value::as_str)
}

fn log_device_update(device_id: DeviceId, partial: &Map<String, Value>) {
    let text = |key| text_field(partial, key);
    tracing::info!(
        device_id,
        serial_no = text("serial_no").unwrap_or("unknown"),
        fields = partial.len(),
        "device update"
    );
    if let Some(connection) = text("connection_state") {
        tracing::info!(device_id, connection, "connection state");
    }
    if let Some(guard) = text("guard") {
        tracing::info!(device_id, guard, "guard state");
    }
    if let Some(alarm) = text("alarm") {
        if alarm != "Unknown" && alarm != "None" {
            tracing::warn!(device_id, alarm, "alarm raised");
        }
    }
}

/// Feeds socket messages into the dispatcher until the connection ends.
pub async fn run_read_loop<St>(mut stream: St, dispatcher: &mut Dispatcher) -> Disconnect
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut closed = dispatcher.transport.closed_signal();
    dispatcher.ctx.clocks.touch_message();
    loop {
        if *closed.borrow_and_update() {
            return Disconnect::ClosedLocally;
        }
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => dispatcher.handle_text(&text).await,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => dispatcher.handle_text(&text).await,
                    Err(_) => tracing::debug!("ignoring non-utf8 binary message"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return Disconnect::ClosedByServer(frame.map(|f| f.reason.to_string()));
                }
                Some(Ok(_)) => dispatcher.ctx.clocks.touch_message(),
                Some(Err(err)) => return Disconnect::SocketError(err.to_string()),
                None => return Disconnect::StreamEnded,
            },
            changed = closed.changed() => {
                if changed.is_err() {
                    return Disconnect::ClosedLocally;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::CONNECTION_LOST;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<DeviceUpdate>>,
    }

    impl DeviceStateSink for RecordingSink {
        fn on_device_state(&self, update: &DeviceUpdate) {
            self.updates.lock().unwrap().push(update.clone());
        }
    }

    struct Harness {
        ctx: Arc<DispatchContext>,
        sink: Arc<RecordingSink>,
        dispatcher: Dispatcher,
        outbound: mpsc::Receiver<String>,
    }

    fn harness() -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let ctx = Arc::new(DispatchContext::new(sink.clone()));
        let (handle, outbound) = crate::transport::TransportHandle::new(16);
        Harness {
            dispatcher: Dispatcher::new(ctx.clone(), handle),
            ctx,
            sink,
            outbound,
        }
    }

    fn record(value: Value) -> String {
        format!("{value}\u{1e}")
    }

    fn sent_frames(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            for record in protocol::split_records(&text) {
                frames.push(serde_json::from_str(record).unwrap());
            }
        }
        frames
    }

    #[tokio::test]
    async fn event_object_merges_into_store_and_notifies_sink() {
        let mut h = harness();
        let push = json!({
            "type": 1,
            "target": "EventObject",
            "arguments": [{ "device_id": 7, "device_state": { "guard": "SafeGuardOn" } }]
        });
        h.dispatcher.handle_text(&record(push)).await;

        let snapshot = h.ctx.store.snapshot(7).unwrap();
        assert_eq!(snapshot.field_str("guard"), Some("SafeGuardOn"));
        assert!(h.ctx.clocks.last_event().is_some());

        let updates = h.sink.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].device_id, 7);
        assert_eq!(updates[0].partial.get("guard"), Some(&json!("SafeGuardOn")));
    }

    #[tokio::test]
    async fn directory_completion_subscribes_once_and_signals_ready() {
        let mut h = harness();
        let directory = json!({
            "type": 3,
            "invocationId": "1",
            "result": { "data": { "devices": [{ "device_id": 1 }, { "device_id": 2 }] } }
        });
        h.dispatcher.handle_text(&record(directory.clone())).await;

        let frames = sent_frames(&mut h.outbound);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["target"], "WatchDevice");
        assert_eq!(frames[0]["arguments"], json!([{ "device_ids": [1, 2] }]));
        assert!(h.ctx.ready.is_set());
        assert_eq!(h.ctx.directory.list().len(), 2);

        // A second directory refreshes the catalog but the ready signal stays set once.
        h.dispatcher.handle_text(&record(directory)).await;
        assert!(!h.ctx.ready.set());
    }

    #[tokio::test]
    async fn completion_resolves_matching_invocation() {
        let mut h = harness();
        let ok = h.ctx.pending.register("4");
        let rejected = h.ctx.pending.register("5");

        let text = format!(
            "{}{}",
            record(json!({ "type": 3, "invocationId": "4", "result": { "status": "done" } })),
            record(json!({ "type": 3, "invocationId": "5", "error": "Device offline" }))
        );
        h.dispatcher.handle_text(&text).await;

        assert_eq!(
            ok.await.unwrap(),
            InvocationOutcome::Success(Some(json!({ "status": "done" })))
        );
        assert_eq!(
            rejected.await.unwrap(),
            InvocationOutcome::Failed("Device offline".to_string())
        );
        assert!(h.ctx.pending.is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered_and_malformed_input_ignored() {
        let mut h = harness();
        h.dispatcher.handle_text("{not json\u{1e}").await;
        h.dispatcher.handle_text(&record(json!({ "type": 6 }))).await;

        let frames = sent_frames(&mut h.outbound);
        assert_eq!(frames, vec![json!({ "type": 6 })]);
        assert!(h.ctx.clocks.last_message().is_some());
        assert!(h.ctx.clocks.last_event().is_none());
    }

    #[tokio::test]
    async fn handshake_ack_moves_to_steady_and_error_closes() {
        let mut h = harness();
        assert_eq!(h.dispatcher.state(), DispatchState::AwaitingHandshakeAck);
        h.dispatcher.handle_text("{}\u{1e}").await;
        assert_eq!(h.dispatcher.state(), DispatchState::Steady);

        let mut rejected = harness();
        rejected
            .dispatcher
            .handle_text(&record(json!({ "error": "Handshake was canceled." })))
            .await;
        assert!(rejected.dispatcher.transport.is_closed());
    }

    #[tokio::test]
    async fn panicking_sink_does_not_break_dispatch() {
        let sink: Arc<dyn DeviceStateSink> = Arc::new(|_: &DeviceUpdate| panic!("consumer bug"));
        let ctx = Arc::new(DispatchContext::new(sink));
        let (handle, _rx) = crate::transport::TransportHandle::new(4);
        let mut dispatcher = Dispatcher::new(ctx.clone(), handle);

        let push = json!({
            "type": 1,
            "target": "EventObject",
            "arguments": [{ "device_id": 3, "device_state": { "speed": 10 } }]
        });
        dispatcher.handle_text(&record(push)).await;
        assert_eq!(ctx.store.snapshot(3).unwrap().field("speed"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn read_loop_reports_how_connection_ended() {
        let mut h = harness();
        let stream = futures_util::stream::iter(vec![
            Ok(Message::Text(record(json!({ "type": 6 })))),
            Ok(Message::Close(None)),
        ]);
        let end = run_read_loop(stream, &mut h.dispatcher).await;
        assert_eq!(end, Disconnect::ClosedByServer(None));

        let stream = futures_util::stream::iter(Vec::<Result<Message, WsError>>::new());
        assert_eq!(run_read_loop(stream, &mut h.dispatcher).await, Disconnect::StreamEnded);

        h.dispatcher.transport.close();
        let pending = futures_util::stream::pending::<Result<Message, WsError>>();
        assert_eq!(run_read_loop(pending, &mut h.dispatcher).await, Disconnect::ClosedLocally);
        assert_eq!(h.ctx.pending.cancel_all(CONNECTION_LOST), 0);
    }
}
