use std::time::Duration;

use crate::firestore::remote::messages::{ListenRequest, WriteRequest};

/// Delayed operations the engine schedules. At most one of each kind is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    LruGarbageCollection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

/// Side effect requested by the remote store, executed by whoever drives it.
///
/// Effects are produced in order and must be executed in order.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteEffect {
    /// Open a transport stream and report back with the same generation.
    OpenStream { kind: StreamKind, generation: u64 },
    CloseStream { kind: StreamKind },
    SendListen(ListenRequest),
    SendWrite(WriteRequest),
    ScheduleTimer { timer: TimerId, delay: Duration },
    CancelTimer(TimerId),
    /// The cached auth token was rejected; fetch a fresh one before the next open.
    InvalidateCredentials,
}
