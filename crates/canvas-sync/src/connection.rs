//! User-facing connection indicator.
//!
//! A lost connection shows a persistent, non-blocking banner; getting it
//! back replaces that with a success banner that dismisses itself.

use std::sync::Arc;
use std::time::Duration;

use canvas_common::{Clock, ConnectionStatus};
use web_time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorState {
    Hidden,
    /// Shown until the connection returns. Editing continues meanwhile.
    Disconnected,
    Reconnected,
}

pub struct ConnectionIndicator {
    state: IndicatorState,
    was_disconnected: bool,
    shown_at: Option<Instant>,
    banner: Duration,
    time: Arc<dyn Clock>,
}

impl ConnectionIndicator {
    pub fn new(banner: Duration, time: Arc<dyn Clock>) -> Self {
        Self {
            state: IndicatorState::Hidden,
            was_disconnected: false,
            shown_at: None,
            banner,
            time,
        }
    }

    pub fn state(&self) -> IndicatorState {
        self.state
    }

    pub fn on_status(&mut self, status: ConnectionStatus) -> IndicatorState {
        match status {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                self.was_disconnected = true;
                self.shown_at = None;
                self.state = IndicatorState::Disconnected;
            }
            ConnectionStatus::Connected if self.was_disconnected => {
                self.was_disconnected = false;
                self.shown_at = Some(self.time.now());
                self.state = IndicatorState::Reconnected;
            }
            ConnectionStatus::Connected => {
                self.state = IndicatorState::Hidden;
            }
            ConnectionStatus::Connecting => {
                if self.state == IndicatorState::Disconnected {
                    self.state = IndicatorState::Hidden;
                }
            }
        }
        self.state
    }

    /// Dismiss the reconnected banner once it has been up long enough.
    pub fn tick(&mut self) -> IndicatorState {
        if let (IndicatorState::Reconnected, Some(shown)) = (self.state, self.shown_at) {
            if self.time.now().saturating_duration_since(shown) >= self.banner {
                self.state = IndicatorState::Hidden;
                self.shown_at = None;
            }
        }
        self.state
    }
}
