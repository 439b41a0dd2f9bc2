//! Asynchronous notifications from a verbs device.
//!
//! Where a kernel provider invokes callbacks, devices here push
//! [`VerbsEvent`] messages into an [`EventSink`] handed to them at creation
//! or query time. The consumer drains the matching receiver from its own task.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{CqHandle, PathRecord, QueryId};

/// Sender side of the verbs event channel.
pub type EventSink = mpsc::UnboundedSender<VerbsEvent>;

/// Asynchronous queue-pair event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpEventKind {
    Fatal,
    RequestError,
    AccessError,
    CommEstablished,
    SqDrained,
    LastWqeReached,
}

/// A completion or notification emitted by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbsEvent {
    /// A path-record query finished. `status` is zero on success or a
    /// negative errno; `record` is present only on success.
    PathRecordComplete {
        query: QueryId,
        status: i32,
        record: Option<PathRecord>,
    },

    /// A completion was added to an armed completion queue.
    CompletionNotify { cq: CqHandle },

    /// An asynchronous event was raised on a queue pair.
    QpAsync { qp_num: u32, event: QpEventKind },
}
