//! One running gate's request/response correlation.
//!
//! A gate owns a single [`crate::traits::GateChannel`] split into a reader
//! and a writer task. The writer serializes outgoing frames (the channel's
//! write half accepts one frame at a time, per spec's "gate writes are
//! serialized per gate"); the reader demultiplexes incoming frames by `id`
//! into whichever call is waiting on them, dispatching `event` frames to
//! that call's event sink and resolving `result` frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::gate::frame::{ControllerFrame, EventKind, GateCodec, GateFrame};
use crate::traits::GateChannel;

/// One `event` frame forwarded to the caller while an `execute` is in flight.
#[derive(Debug, Clone)]
pub struct GateEvent {
    pub kind: EventKind,
    pub payload: Value,
}

/// The outcome of one `execute` call.
#[derive(Debug, Clone)]
pub struct GateResult {
    pub success: bool,
    pub changed: bool,
    pub output: Value,
    pub error: Option<String>,
}

struct PendingCall {
    result_tx: oneshot::Sender<Result<GateResult>>,
    events_tx: mpsc::UnboundedSender<GateEvent>,
}

/// A live connection to one gate process. Cheap to clone; the reader and
/// writer tasks keep running until `shutdown` or a transport failure.
#[derive(Clone)]
pub struct Gate {
    host: String,
    next_id: Arc<AtomicU64>,
    outgoing: mpsc::UnboundedSender<ControllerFrame>,
    pending: Arc<Mutex<HashMap<u64, PendingCall>>>,
    alive: Arc<AtomicBool>,
    closed: Arc<Notify>,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("host", &self.host)
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish()
    }
}

impl Gate {
    /// Take ownership of a freshly launched gate channel and start its
    /// reader/writer tasks. Does not block for `ready`; the caller awaits
    /// the returned channel for the gate's `ready` frame before issuing
    /// calls.
    pub fn spawn(host: String, channel: Box<dyn GateChannel>) -> (Self, mpsc::UnboundedReceiver<Option<String>>) {
        let (read_half, write_half) = tokio::io::split(channel);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();

        let pending: Arc<Mutex<HashMap<u64, PendingCall>>> = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(Notify::new());

        tokio::spawn(run_writer(write_half, outgoing_rx));
        tokio::spawn(run_reader(
            read_half,
            host.clone(),
            pending.clone(),
            alive.clone(),
            closed.clone(),
            ready_tx,
        ));

        (
            Self {
                host,
                next_id: Arc::new(AtomicU64::new(1)),
                outgoing: outgoing_tx,
                pending,
                alive,
                closed,
            },
            ready_rx,
        )
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Send `execute` and await its `result`, forwarding `event` frames to
    /// `events_tx` as they arrive. Exactly one `result` resolves the call.
    pub async fn execute(
        &self,
        module: &str,
        params: Value,
        check_mode: bool,
        events_tx: mpsc::UnboundedSender<GateEvent>,
    ) -> Result<GateResult> {
        self.execute_cancellable(module, params, check_mode, events_tx, &CancellationToken::new())
            .await
    }

    /// Same as [`Self::execute`], but races the result against `cancel`. If
    /// `cancel` fires before a `result` frame arrives, the call's id is
    /// abandoned (a late `result` for it is silently dropped) and this
    /// returns `Err(Error::Cancelled)`.
    pub async fn execute_cancellable(
        &self,
        module: &str,
        params: Value,
        check_mode: bool,
        events_tx: mpsc::UnboundedSender<GateEvent>,
        cancel: &CancellationToken,
    ) -> Result<GateResult> {
        if !self.is_alive() {
            return Err(Error::TransportLost(self.host.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (result_tx, result_rx) = oneshot::channel();
        self.pending.lock().insert(id, PendingCall { result_tx, events_tx });

        let sent = self.outgoing.send(ControllerFrame::Execute {
            id,
            module: module.to_string(),
            params,
            check_mode,
        });
        if sent.is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::TransportLost(self.host.clone()));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.abandon(id);
                Err(Error::Cancelled)
            }
            result = result_rx => match result {
                Ok(result) => result,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    Err(Error::TransportLost(self.host.clone()))
                }
            }
        }
    }

    /// Abandon a call's id so a late `result` is discarded rather than
    /// delivered to a caller that has already stopped waiting.
    pub fn abandon(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Send `shutdown` and wait for the reader task to observe the gate
    /// closing its output stream, up to a grace period.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        let _ = self.outgoing.send(ControllerFrame::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.closed.notified()).await;
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn run_writer(
    write_half: WriteHalf<Box<dyn GateChannel>>,
    mut outgoing_rx: mpsc::UnboundedReceiver<ControllerFrame>,
) {
    let mut sink = FramedWrite::new(write_half, GateCodec::default());
    while let Some(frame) = outgoing_rx.recv().await {
        let is_shutdown = matches!(frame, ControllerFrame::Shutdown);
        if sink.send(frame).await.is_err() {
            break;
        }
        if is_shutdown {
            let _ = sink.close().await;
            break;
        }
    }
}

async fn run_reader(
    read_half: ReadHalf<Box<dyn GateChannel>>,
    host: String,
    pending: Arc<Mutex<HashMap<u64, PendingCall>>>,
    alive: Arc<AtomicBool>,
    closed: Arc<Notify>,
    ready_tx: mpsc::UnboundedSender<Option<String>>,
) {
    let mut stream = FramedRead::new(read_half, GateCodec::default());

    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(%host, error = %e, "malformed gate frame, disconnecting");
                break;
            }
            None => {
                debug!(%host, "gate closed its output stream");
                break;
            }
        };

        match frame {
            GateFrame::Ready { fingerprint } => {
                let _ = ready_tx.send(fingerprint);
            }
            GateFrame::Result {
                id,
                success,
                changed,
                output,
                error,
            } => {
                if let Some(call) = pending.lock().remove(&id) {
                    let _ = call.result_tx.send(Ok(GateResult {
                        success,
                        changed,
                        output,
                        error,
                    }));
                }
            }
            GateFrame::Event { id, kind, payload } => {
                let events_tx = pending.lock().get(&id).map(|call| call.events_tx.clone());
                if let Some(events_tx) = events_tx {
                    let _ = events_tx.send(GateEvent { kind, payload });
                }
            }
            GateFrame::Error { id: Some(id), message } => {
                if let Some(call) = pending.lock().remove(&id) {
                    let _ = call.result_tx.send(Err(Error::ProtocolError(message)));
                }
            }
            GateFrame::Error { id: None, message } => {
                warn!(%host, %message, "gate reported a non-call error");
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    {
        let mut pending = pending.lock();
        for (_, call) in pending.drain() {
            let _ = call.result_tx.send(Err(Error::TransportLost(host.clone())));
        }
    }
    closed.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::frame::ControllerFrame as CF;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn fake_channel() -> (DuplexStream, Box<dyn GateChannel>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (a, Box::new(b))
    }

    async fn write_frame(stream: &mut DuplexStream, value: serde_json::Value) {
        let bytes = serde_json::to_vec(&value).unwrap();
        stream.write_all(&(bytes.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(&bytes).await.unwrap();
    }

    async fn read_controller_frame(stream: &mut DuplexStream) -> CF {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        match value["type"].as_str().unwrap() {
            "execute" => CF::Execute {
                id: value["id"].as_u64().unwrap(),
                module: value["module"].as_str().unwrap().to_string(),
                params: value["params"].clone(),
                check_mode: value["check_mode"].as_bool().unwrap_or(false),
            },
            "shutdown" => CF::Shutdown,
            other => panic!("unexpected frame type {other}"),
        }
    }

    #[tokio::test]
    async fn executes_and_resolves_result() {
        let (mut remote, channel) = fake_channel();
        let (gate, mut ready_rx) = Gate::spawn("h1".to_string(), channel);

        write_frame(&mut remote, serde_json::json!({"type": "ready"})).await;
        ready_rx.recv().await.unwrap();

        let gate_clone = gate.clone();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let call = tokio::spawn(async move {
            gate_clone
                .execute("ftl2.builtin.shell", serde_json::json!({"cmd": "true"}), false, events_tx)
                .await
        });

        let sent = read_controller_frame(&mut remote).await;
        let id = match sent {
            CF::Execute { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };

        write_frame(
            &mut remote,
            serde_json::json!({"type": "result", "id": id, "success": true, "changed": true, "output": {"rc": 0}}),
        )
        .await;

        let result = call.await.unwrap().unwrap();
        assert!(result.success);
        assert!(result.changed);
    }

    #[tokio::test]
    async fn events_before_result_are_forwarded() {
        let (mut remote, channel) = fake_channel();
        let (gate, _ready_rx) = Gate::spawn("h1".to_string(), channel);

        let gate_clone = gate.clone();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let call = tokio::spawn(async move {
            gate_clone
                .execute("ftl2.builtin.shell", serde_json::json!({}), false, events_tx)
                .await
        });

        let id = match read_controller_frame(&mut remote).await {
            CF::Execute { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };

        write_frame(
            &mut remote,
            serde_json::json!({"type": "event", "id": id, "kind": "progress", "payload": {"percent": 50}}),
        )
        .await;
        write_frame(
            &mut remote,
            serde_json::json!({"type": "result", "id": id, "success": true, "changed": false, "output": null}),
        )
        .await;

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Progress);

        let result = call.await.unwrap().unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn cancelling_in_flight_call_abandons_its_id() {
        let (mut remote, channel) = fake_channel();
        let (gate, mut ready_rx) = Gate::spawn("h1".to_string(), channel);

        write_frame(&mut remote, serde_json::json!({"type": "ready"})).await;
        ready_rx.recv().await.unwrap();

        let cancel = CancellationToken::new();
        let gate_clone = gate.clone();
        let cancel_clone = cancel.clone();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let call = tokio::spawn(async move {
            gate_clone
                .execute_cancellable("ftl2.builtin.shell", serde_json::json!({}), false, events_tx, &cancel_clone)
                .await
        });

        let id = match read_controller_frame(&mut remote).await {
            CF::Execute { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };

        cancel.cancel();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!gate.pending.lock().contains_key(&id));

        // A late result for the abandoned id must not panic or resurface.
        write_frame(
            &mut remote,
            serde_json::json!({"type": "result", "id": id, "success": true, "changed": false, "output": null}),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.is_alive());
    }

    #[tokio::test]
    async fn transport_loss_fails_in_flight_call() {
        let (remote, channel) = fake_channel();
        let (gate, _ready_rx) = Gate::spawn("h1".to_string(), channel);

        let gate_clone = gate.clone();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let call = tokio::spawn(async move {
            gate_clone
                .execute("ftl2.builtin.shell", serde_json::json!({}), false, events_tx)
                .await
        });

        drop(remote);

        let result = call.await.unwrap();
        assert!(matches!(result, Err(Error::TransportLost(_))));
        assert!(!gate.is_alive());
    }
}
