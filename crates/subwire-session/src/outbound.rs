//! The single serialized writer of a connection.
//!
//! Every outbound frame funnels through one task that owns the transport
//! sink. It drains two lanes: a bounded data lane and an unbounded control
//! lane for messages queued from synchronous contexts (subscribe and
//! complete on the initiator). Each lane is FIFO; control messages are
//! written ahead of pending data. Operation-scoped messages carry a guard;
//! the writer drops them if their operation generation is no longer live at
//! write time.

use std::sync::Arc;

use futures::{Sink, SinkExt};
use subwire_core::{CloseFrame, Frame, OperationId, ProtocolError, ProtocolMessage, TransportError};
use subwire_protocol::SubProtocol;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::registry::OperationRegistry;

/// Identifies the operation generation a message belongs to.
#[derive(Clone, Debug)]
pub(crate) struct Guard {
    pub id: OperationId,
    pub generation: u64,
}

/// A command for the writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Send {
        message: ProtocolMessage,
        guard: Option<Guard>,
        written: Option<oneshot::Sender<bool>>,
    },
    Close(CloseFrame),
}

/// Failures the writer reports back to the session loop.
#[derive(Debug)]
pub(crate) enum WriterEvent {
    Transport(TransportError),
    Encode(ProtocolError),
}

/// Sending half of the outbound queue.
#[derive(Clone, Debug)]
pub(crate) struct OutboundQueue {
    tx: mpsc::Sender<Outbound>,
    control: mpsc::UnboundedSender<Outbound>,
}

/// Receiving half of the outbound queue, owned by the writer.
#[derive(Debug)]
pub(crate) struct OutboundLanes {
    data: mpsc::Receiver<Outbound>,
    control: mpsc::UnboundedReceiver<Outbound>,
}

impl OutboundLanes {
    /// Next command, control lane first; `None` once both lanes are closed.
    pub(crate) async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            Some(command) = self.control.recv() => Some(command),
            Some(command) = self.data.recv() => Some(command),
            else => None,
        }
    }
}

/// A queue whose data lane holds `capacity` messages.
pub(crate) fn outbound(capacity: usize) -> (OutboundQueue, OutboundLanes) {
    let (tx, data) = mpsc::channel(capacity);
    let (control_tx, control) = mpsc::unbounded_channel();
    (
        OutboundQueue {
            tx,
            control: control_tx,
        },
        OutboundLanes { data, control },
    )
}

impl OutboundQueue {
    /// Queue a connection-level message. Returns `false` once the writer is gone.
    pub(crate) async fn send(&self, message: ProtocolMessage) -> bool {
        self.tx
            .send(Outbound::Send {
                message,
                guard: None,
                written: None,
            })
            .await
            .is_ok()
    }

    /// Queue an operation message and wait until it was written (`true`) or
    /// dropped because its generation is no longer live (`false`).
    pub(crate) async fn send_for(&self, message: ProtocolMessage, guard: Guard) -> bool {
        let (written_tx, written_rx) = oneshot::channel();
        let queued = self
            .tx
            .send(Outbound::Send {
                message,
                guard: Some(guard),
                written: Some(written_tx),
            })
            .await
            .is_ok();
        queued && written_rx.await.unwrap_or(false)
    }

    /// Queue a message on the control lane without waiting.
    ///
    /// Control messages keep their relative order. Returns `false` once the
    /// writer is gone.
    pub(crate) fn send_control(&self, message: ProtocolMessage) -> bool {
        self.control
            .send(Outbound::Send {
                message,
                guard: None,
                written: None,
            })
            .is_ok()
    }

    /// Queue the close frame; the writer flushes everything queued before it.
    pub(crate) async fn close(&self, frame: CloseFrame) -> bool {
        self.tx.send(Outbound::Close(frame)).await.is_ok()
    }
}

/// Drain the queue into `sink` until a close frame is written, the queue
/// closes, or the sink fails.
pub(crate) async fn run_writer<Si>(
    mut sink: Si,
    mut lanes: OutboundLanes,
    protocol: Arc<dyn SubProtocol>,
    registry: Arc<OperationRegistry>,
    events: mpsc::UnboundedSender<WriterEvent>,
) where
    Si: Sink<Frame, Error = TransportError> + Unpin,
{
    while let Some(command) = lanes.recv().await {
        match command {
            Outbound::Send {
                message,
                guard,
                written,
            } => {
                if let Some(guard) = &guard {
                    if !registry.is_live(&guard.id, guard.generation) {
                        trace!(operation_id = %guard.id, kind = %message.kind(), "dropping message for finished operation");
                        ack(written, false);
                        continue;
                    }
                }
                let text = match protocol.encode(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, kind = %message.kind(), "failed to encode outbound message");
                        ack(written, false);
                        let _ = events.send(WriterEvent::Encode(e));
                        continue;
                    }
                };
                if let Err(e) = sink.send(Frame::Text(text)).await {
                    debug!(error = %e, "transport write failed");
                    ack(written, false);
                    let _ = events.send(WriterEvent::Transport(e));
                    return;
                }
                ack(written, true);
            }
            Outbound::Close(frame) => {
                debug!(code = %frame.code, reason = %frame.reason, "writing close frame");
                let _ = sink.send(Frame::Close(Some(frame))).await;
                let _ = sink.close().await;
                return;
            }
        }
    }
    let _ = sink.close().await;
}

fn ack(written: Option<oneshot::Sender<bool>>, ok: bool) {
    if let Some(tx) = written {
        let _ = tx.send(ok);
    }
}
