use std::time::Duration;

use crate::firestore::error::FirestoreError;
use crate::firestore::remote::effects::{RemoteEffect, TimerId};

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OnlineState {
    /// Connecting; listeners still wait for server results.
    #[default]
    Unknown,
    Online,
    /// Listeners get cached results flagged as such.
    Offline,
}

/// Derives the online state from the health of the listen stream.
///
/// A failing stream only reports `Offline` after `max_watch_stream_failures` failures or
/// once the connect timeout elapses, so that a single flaky connect does not flash cached
/// data at listeners.
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timer_scheduled: bool,
    should_warn_offline: bool,
    online_state_timeout: Duration,
    max_watch_stream_failures: u32,
}

impl OnlineStateTracker {
    pub fn new(online_state_timeout: Duration, max_watch_stream_failures: u32) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timer_scheduled: false,
            should_warn_offline: true,
            online_state_timeout,
            max_watch_stream_failures,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Returns the new state when it changed.
    pub fn handle_watch_stream_start(&mut self, effects: &mut Vec<RemoteEffect>) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.transition(OnlineState::Unknown);
        if !self.timer_scheduled {
            self.timer_scheduled = true;
            effects.push(RemoteEffect::ScheduleTimer {
                timer: TimerId::OnlineStateTimeout,
                delay: self.online_state_timeout,
            });
        }
        changed
    }

    pub fn on_timeout(&mut self) -> Option<OnlineState> {
        if !self.timer_scheduled {
            return None;
        }
        self.timer_scheduled = false;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_offline(&format!(
            "Backend didn't respond within {} seconds",
            self.online_state_timeout.as_secs()
        ));
        self.transition(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(
        &mut self,
        error: &FirestoreError,
        effects: &mut Vec<RemoteEffect>,
    ) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // Lost an established connection; give the reconnect a chance first.
            return self.transition(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= self.max_watch_stream_failures {
            self.clear_timer(effects);
            self.log_offline(&format!(
                "Connection failed {} times. Most recent error: {error}",
                self.max_watch_stream_failures
            ));
            return self.transition(OnlineState::Offline);
        }
        None
    }

    /// Explicit state, e.g. `Online` on the first listen response or `Offline` when the
    /// network is disabled.
    pub fn set(&mut self, state: OnlineState, effects: &mut Vec<RemoteEffect>) -> Option<OnlineState> {
        self.clear_timer(effects);
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_offline = false;
        }
        self.transition(state)
    }

    fn transition(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        log::debug!("Online state {:?} -> {state:?}", self.state);
        self.state = state;
        Some(state)
    }

    fn clear_timer(&mut self, effects: &mut Vec<RemoteEffect>) {
        if self.timer_scheduled {
            self.timer_scheduled = false;
            effects.push(RemoteEffect::CancelTimer(TimerId::OnlineStateTimeout));
        }
    }

    fn log_offline(&mut self, details: &str) {
        let message = format!(
            "Could not reach the backend. {details}. The client will operate in offline mode \
             until it can connect."
        );
        if self.should_warn_offline {
            log::warn!("{message}");
            self.should_warn_offline = false;
        } else {
            log::debug!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn tracker() -> OnlineStateTracker {
        OnlineStateTracker::new(Duration::from_secs(10), 1)
    }

    #[test]
    fn timeout_without_response_goes_offline() {
        let mut tracker = tracker();
        let mut effects = Vec::new();
        tracker.handle_watch_stream_start(&mut effects);
        assert_eq!(
            effects,
            vec![RemoteEffect::ScheduleTimer {
                timer: TimerId::OnlineStateTimeout,
                delay: Duration::from_secs(10)
            }]
        );
        assert_eq!(tracker.on_timeout(), Some(OnlineState::Offline));
    }

    #[test]
    fn response_before_timeout_stays_online() {
        let mut tracker = tracker();
        let mut effects = Vec::new();
        tracker.handle_watch_stream_start(&mut effects);
        assert_eq!(tracker.set(OnlineState::Online, &mut effects), Some(OnlineState::Online));
        assert!(effects.contains(&RemoteEffect::CancelTimer(TimerId::OnlineStateTimeout)));
        assert_eq!(tracker.on_timeout(), None);
        assert_eq!(tracker.state(), OnlineState::Online);
    }

    #[test]
    fn failure_while_online_reverts_to_unknown() {
        let mut tracker = tracker();
        let mut effects = Vec::new();
        tracker.set(OnlineState::Online, &mut effects);
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("x"), &mut effects),
            Some(OnlineState::Unknown)
        );
        assert_eq!(
            tracker.handle_watch_stream_failure(&unavailable("x"), &mut effects),
            Some(OnlineState::Offline)
        );
    }
}
