//! Outbound frame pacing.
//!
//! The hub rate-limits gateways, so every frame bound for it passes
//! through an [`OutboundPacer`] that enforces a minimum gap between sends.
//! The pacer is a plain state machine: callers ask it what to do with
//! [`OutboundPacer::poll`] and act on the answer.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::PacerConfig;
use crate::error::{HubError, HubResult};

/// Action the pacer recommends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacerAction {
    /// Deliver this frame now. The pacer has already stamped the send time.
    SendNow(String),
    /// Wait until the specified instant before polling again.
    WaitUntil(Instant),
    /// Nothing to send.
    Idle,
    /// Frames are pending but delivery is paused.
    Paused,
}

/// FIFO of outbound frames with a minimum inter-send interval.
#[derive(Debug)]
pub struct OutboundPacer {
    queue: VecDeque<String>,
    wait_time: Duration,
    last_sent: Option<Instant>,
    paused: bool,
    max_pending: Option<usize>,
}

impl OutboundPacer {
    /// Create a running pacer.
    #[must_use]
    pub fn new(config: PacerConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            wait_time: config.wait_time(),
            last_sent: None,
            paused: false,
            max_pending: config.max_pending,
        }
    }

    /// Queue a frame.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::BufferFull`] if the pending cap is reached.
    pub fn push(&mut self, frame: String) -> HubResult<()> {
        if let Some(capacity) = self.max_pending
            && self.queue.len() >= capacity
        {
            return Err(HubError::BufferFull { capacity });
        }
        self.queue.push_back(frame);
        Ok(())
    }

    /// Decide what to do at `now`.
    pub fn poll(&mut self, now: Instant) -> PacerAction {
        if self.queue.is_empty() {
            return PacerAction::Idle;
        }
        if self.paused {
            return PacerAction::Paused;
        }

        if let Some(last) = self.last_sent {
            let next_allowed = last + self.wait_time;
            if now < next_allowed {
                return PacerAction::WaitUntil(next_allowed);
            }
        }

        match self.queue.pop_front() {
            Some(frame) => {
                self.last_sent = Some(now);
                PacerAction::SendNow(frame)
            }
            None => PacerAction::Idle,
        }
    }

    /// Stop delivering; frames keep accumulating.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume delivering, oldest frame first.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Check whether delivery is paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Set the minimum gap between frames. Zero is ignored.
    pub fn set_wait_time(&mut self, wait: Duration) {
        if !wait.is_zero() {
            self.wait_time = wait;
        }
    }

    /// Current minimum gap between frames.
    #[must_use]
    pub const fn wait_time(&self) -> Duration {
        self.wait_time
    }

    /// Number of frames waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check whether no frames are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for OutboundPacer {
    fn default() -> Self {
        Self::new(PacerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer_with_wait(ms: u64) -> OutboundPacer {
        OutboundPacer::new(PacerConfig::new().with_wait_time(Duration::from_millis(ms)))
    }

    #[test]
    fn test_idle_when_empty() {
        let mut pacer = OutboundPacer::default();
        assert_eq!(pacer.poll(Instant::now()), PacerAction::Idle);
    }

    #[test]
    fn test_first_frame_sends_immediately() {
        let mut pacer = OutboundPacer::default();
        pacer.push("a".to_string()).unwrap();
        assert_eq!(pacer.poll(Instant::now()), PacerAction::SendNow("a".to_string()));
        assert!(pacer.is_empty());
    }

    #[test]
    fn test_second_frame_waits_for_interval() {
        let mut pacer = pacer_with_wait(100);
        let start = Instant::now();
        pacer.push("a".to_string()).unwrap();
        pacer.push("b".to_string()).unwrap();

        assert_eq!(pacer.poll(start), PacerAction::SendNow("a".to_string()));
        assert_eq!(
            pacer.poll(start + Duration::from_millis(40)),
            PacerAction::WaitUntil(start + Duration::from_millis(100))
        );
        assert_eq!(
            pacer.poll(start + Duration::from_millis(100)),
            PacerAction::SendNow("b".to_string())
        );
    }

    #[test]
    fn test_pause_holds_frames_in_order() {
        let mut pacer = pacer_with_wait(1);
        let start = Instant::now();
        pacer.pause();
        pacer.push("a".to_string()).unwrap();
        pacer.push("b".to_string()).unwrap();

        assert_eq!(pacer.poll(start), PacerAction::Paused);
        assert_eq!(pacer.len(), 2);

        pacer.resume();
        assert_eq!(pacer.poll(start), PacerAction::SendNow("a".to_string()));
        assert_eq!(
            pacer.poll(start + Duration::from_millis(1)),
            PacerAction::SendNow("b".to_string())
        );
    }

    #[test]
    fn test_set_wait_time_ignores_zero() {
        let mut pacer = OutboundPacer::default();
        pacer.set_wait_time(Duration::ZERO);
        assert_eq!(pacer.wait_time(), Duration::from_millis(136));

        pacer.set_wait_time(Duration::from_secs(1));
        assert_eq!(pacer.wait_time(), Duration::from_secs(1));
    }

    #[test]
    fn test_buffer_cap() {
        let mut pacer = OutboundPacer::new(PacerConfig::new().with_max_pending(1));
        pacer.push("a".to_string()).unwrap();
        let err = pacer.push("b".to_string()).unwrap_err();
        assert!(matches!(err, HubError::BufferFull { capacity: 1 }));
    }
}
