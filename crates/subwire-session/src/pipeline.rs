//! Result emission: drains one operation's result stream into the writer.
//!
//! At most one value per operation is in flight: the pipeline waits for the
//! writer to confirm each "next" before pulling the following value. The
//! terminal transition is committed to the registry before the terminal
//! message is queued, so exactly one of complete, error or cancel wins.

use std::sync::Arc;

use futures::StreamExt;
use metrics::counter;
use subwire_core::ProtocolMessage;
use subwire_protocol::SubProtocol;
use tracing::{debug, instrument};

use crate::executor::ResultStream;
use crate::metrics::GRAPHQL_OPERATIONS_FINISHED_TOTAL;
use crate::outbound::{Guard, OutboundQueue};
use crate::registry::{OperationRegistry, OperationState, OperationTicket};

/// How a pipeline ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The stream ended and "complete" was queued.
    Completed,
    /// The stream failed terminally and "error" was queued.
    Errored,
    /// The operation was cancelled, or lost the terminal race.
    Cancelled,
}

impl PipelineOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Drain `stream` for the operation described by `ticket`.
#[instrument(skip_all, fields(operation_id = %ticket.id, generation = ticket.generation))]
pub(crate) async fn run_pipeline(
    ticket: OperationTicket,
    mut stream: ResultStream,
    protocol: Arc<dyn SubProtocol>,
    registry: Arc<OperationRegistry>,
    outbound: OutboundQueue,
) -> PipelineOutcome {
    let OperationTicket {
        id,
        generation,
        cancel,
    } = ticket;
    let guard = Guard {
        id: id.clone(),
        generation,
    };
    let _ = registry.mark_streaming(&id, generation);

    let outcome = loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = registry.finish(&id, generation, OperationState::Cancelled);
                break PipelineOutcome::Cancelled;
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(payload)) => {
                let message = ProtocolMessage::Next {
                    id: id.clone(),
                    payload,
                };
                if !outbound.send_for(message, guard.clone()).await {
                    let _ = registry.finish(&id, generation, OperationState::Cancelled);
                    break PipelineOutcome::Cancelled;
                }
            }
            Some(Err(failure)) => {
                let message = ProtocolMessage::Error {
                    id: id.clone(),
                    payload: failure.errors,
                };
                if protocol.is_terminal(&message) {
                    if registry.finish(&id, generation, OperationState::Errored) {
                        let _ = outbound.send(message).await;
                        break PipelineOutcome::Errored;
                    }
                    break PipelineOutcome::Cancelled;
                }
                debug!("non-terminal error, stream continues");
                if !outbound.send_for(message, guard.clone()).await {
                    let _ = registry.finish(&id, generation, OperationState::Cancelled);
                    break PipelineOutcome::Cancelled;
                }
            }
            None => {
                if registry.finish(&id, generation, OperationState::Completed) {
                    let _ = outbound.send(ProtocolMessage::Complete { id: id.clone() }).await;
                    break PipelineOutcome::Completed;
                }
                break PipelineOutcome::Cancelled;
            }
        }
    };

    drop(stream);
    debug!(outcome = outcome.label(), "pipeline finished");
    counter!(
        GRAPHQL_OPERATIONS_FINISHED_TOTAL,
        "outcome" => outcome.label(),
        "protocol" => protocol.name(),
    )
    .increment(1);
    outcome
}
