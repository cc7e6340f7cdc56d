use std::time::Duration;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};
use crate::firestore::remote::backoff::{ExponentialBackoff, RetrySettings};
use crate::firestore::remote::effects::{RemoteEffect, StreamKind, TimerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not running. `start` opens immediately.
    Idle,
    /// Open requested, waiting for the transport.
    Starting,
    Open,
    /// Waiting for the backoff timer before reopening.
    Backoff,
    /// Torn down after an error; the next `start` waits out the backoff delay first.
    Closing,
}

/// Lifecycle of one logical stream, independent of the transport that carries it.
///
/// Every open gets a fresh generation; transport callbacks carrying an older generation
/// belong to a stream that was already closed and are dropped.
#[derive(Debug)]
pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    idle_timer_scheduled: bool,
}

impl PersistentStream {
    pub fn new(kind: StreamKind, retry: RetrySettings, idle_timeout: Duration) -> Self {
        Self {
            kind,
            state: StreamState::Idle,
            generation: 0,
            backoff: ExponentialBackoff::new(retry),
            idle_timeout,
            idle_timer_scheduled: false,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while the stream is opening, open or waiting to reopen.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn start(&mut self, effects: &mut Vec<RemoteEffect>) {
        match self.state {
            StreamState::Idle => self.open(effects),
            StreamState::Closing => {
                self.state = StreamState::Backoff;
                let delay = self.backoff.next_delay();
                log::debug!("{:?} stream backing off for {} ms", self.kind, delay.as_millis());
                effects.push(RemoteEffect::ScheduleTimer {
                    timer: self.backoff_timer(),
                    delay,
                });
            }
            StreamState::Starting | StreamState::Open | StreamState::Backoff => {}
        }
    }

    pub fn on_backoff_elapsed(&mut self, effects: &mut Vec<RemoteEffect>) {
        if self.state == StreamState::Backoff {
            self.open(effects);
        }
    }

    /// Returns false for a stale generation.
    pub fn on_open(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.state != StreamState::Starting {
            return false;
        }
        log::debug!("{:?} stream open (generation {generation})", self.kind);
        self.state = StreamState::Open;
        true
    }

    /// The backend answered; the next failure starts backing off from the initial delay.
    pub fn mark_healthy(&mut self) {
        self.backoff.reset();
    }

    /// Transport failure or server-side close. Returns false when the generation is stale.
    pub fn on_transport_closed(
        &mut self,
        generation: u64,
        error: FirestoreError,
        effects: &mut Vec<RemoteEffect>,
    ) -> bool {
        if !self.is_current(generation) || !self.is_started() {
            return false;
        }
        self.close(StreamState::Closing, Some(&error), effects);
        true
    }

    /// Client-initiated shutdown; no backoff on the next start.
    pub fn stop(&mut self, effects: &mut Vec<RemoteEffect>) {
        if self.is_started() {
            self.close(StreamState::Idle, None, effects);
        }
    }

    /// After a permanent error the next start should not wait.
    pub fn inhibit_backoff(&mut self) {
        if self.state == StreamState::Closing {
            self.state = StreamState::Idle;
            self.backoff.reset();
        }
    }

    /// Schedules an idle close unless one is already pending.
    pub fn mark_idle(&mut self, effects: &mut Vec<RemoteEffect>) {
        if self.is_open() && !self.idle_timer_scheduled {
            self.idle_timer_scheduled = true;
            effects.push(RemoteEffect::ScheduleTimer {
                timer: self.idle_timer(),
                delay: self.idle_timeout,
            });
        }
    }

    /// Any send keeps the stream alive.
    pub fn cancel_idle_check(&mut self, effects: &mut Vec<RemoteEffect>) {
        if self.idle_timer_scheduled {
            self.idle_timer_scheduled = false;
            effects.push(RemoteEffect::CancelTimer(self.idle_timer()));
        }
    }

    /// Returns true when the stream was closed for being idle.
    pub fn on_idle_timer(&mut self, effects: &mut Vec<RemoteEffect>) -> bool {
        self.idle_timer_scheduled = false;
        if self.is_open() {
            log::debug!("{:?} stream idle, closing", self.kind);
            self.close(StreamState::Idle, None, effects);
            return true;
        }
        false
    }

    fn open(&mut self, effects: &mut Vec<RemoteEffect>) {
        self.generation += 1;
        self.state = StreamState::Starting;
        log::debug!("{:?} stream starting (generation {})", self.kind, self.generation);
        effects.push(RemoteEffect::OpenStream {
            kind: self.kind,
            generation: self.generation,
        });
    }

    fn close(&mut self, final_state: StreamState, error: Option<&FirestoreError>, effects: &mut Vec<RemoteEffect>) {
        self.cancel_idle_check(effects);
        if self.state == StreamState::Backoff {
            effects.push(RemoteEffect::CancelTimer(self.backoff_timer()));
        }

        match error {
            None => self.backoff.reset(),
            Some(error) => {
                log::warn!("{:?} stream closed with error: {error}", self.kind);
                match error.code {
                    FirestoreErrorCode::ResourceExhausted => self.backoff.reset_to_max(),
                    FirestoreErrorCode::Unauthenticated => {
                        effects.push(RemoteEffect::InvalidateCredentials);
                    }
                    _ => {}
                }
            }
        }

        // Callbacks from the closed transport must not reach the next incarnation.
        self.generation += 1;
        self.state = final_state;
        effects.push(RemoteEffect::CloseStream { kind: self.kind });
    }

    fn idle_timer(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, unauthenticated, unavailable};

    fn stream() -> PersistentStream {
        PersistentStream::new(
            StreamKind::Listen,
            RetrySettings {
                jitter_factor: 0.0,
                ..RetrySettings::default()
            },
            Duration::from_secs(60),
        )
    }

    fn opened(stream: &mut PersistentStream) -> u64 {
        let mut effects = Vec::new();
        stream.start(&mut effects);
        let generation = stream.generation();
        assert!(stream.on_open(generation));
        generation
    }

    #[test]
    fn start_opens_with_new_generation() {
        let mut stream = stream();
        let mut effects = Vec::new();
        stream.start(&mut effects);
        assert_eq!(stream.state(), StreamState::Starting);
        assert_eq!(
            effects,
            vec![RemoteEffect::OpenStream {
                kind: StreamKind::Listen,
                generation: 1
            }]
        );
        assert!(stream.on_open(1));
        assert!(stream.is_open());
    }

    #[test]
    fn error_close_backs_off_before_reopening() {
        let mut stream = stream();
        let generation = opened(&mut stream);
        let mut effects = Vec::new();
        assert!(stream.on_transport_closed(generation, unavailable("dropped"), &mut effects));
        assert_eq!(stream.state(), StreamState::Closing);

        effects.clear();
        stream.start(&mut effects);
        assert_eq!(stream.state(), StreamState::Backoff);
        assert_eq!(
            effects,
            vec![RemoteEffect::ScheduleTimer {
                timer: TimerId::ListenStreamConnectionBackoff,
                delay: Duration::ZERO
            }]
        );

        effects.clear();
        stream.on_backoff_elapsed(&mut effects);
        assert_eq!(stream.state(), StreamState::Starting);
        assert!(matches!(effects[0], RemoteEffect::OpenStream { .. }));
    }

    #[test]
    fn stale_callbacks_are_ignored() {
        let mut stream = stream();
        let old = opened(&mut stream);
        let mut effects = Vec::new();
        stream.stop(&mut effects);
        stream.start(&mut effects);
        assert!(!stream.on_open(old));
        assert!(!stream.on_transport_closed(old, unavailable("late"), &mut effects));
        assert_eq!(stream.state(), StreamState::Starting);
    }

    #[test]
    fn unauthenticated_close_invalidates_credentials() {
        let mut stream = stream();
        let generation = opened(&mut stream);
        let mut effects = Vec::new();
        stream.on_transport_closed(generation, unauthenticated("expired"), &mut effects);
        assert!(effects.contains(&RemoteEffect::InvalidateCredentials));
    }

    #[test]
    fn resource_exhausted_jumps_to_max_delay() {
        let mut stream = stream();
        let generation = opened(&mut stream);
        let mut effects = Vec::new();
        stream.on_transport_closed(generation, resource_exhausted("quota"), &mut effects);
        effects.clear();
        stream.start(&mut effects);
        assert_eq!(
            effects,
            vec![RemoteEffect::ScheduleTimer {
                timer: TimerId::ListenStreamConnectionBackoff,
                delay: Duration::from_secs(60)
            }]
        );
    }

    #[test]
    fn idle_timer_closes_open_stream() {
        let mut stream = stream();
        opened(&mut stream);
        let mut effects = Vec::new();
        stream.mark_idle(&mut effects);
        stream.mark_idle(&mut effects);
        assert_eq!(effects.len(), 1);
        effects.clear();
        assert!(stream.on_idle_timer(&mut effects));
        assert_eq!(stream.state(), StreamState::Idle);
        assert!(effects.contains(&RemoteEffect::CloseStream {
            kind: StreamKind::Listen
        }));
    }

    #[test]
    fn inhibited_backoff_reopens_immediately() {
        let mut stream = stream();
        let generation = opened(&mut stream);
        let mut effects = Vec::new();
        stream.on_transport_closed(generation, unavailable("x"), &mut effects);
        stream.inhibit_backoff();
        effects.clear();
        stream.start(&mut effects);
        assert!(matches!(effects[0], RemoteEffect::OpenStream { .. }));
    }
}
