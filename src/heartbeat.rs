/// What to do on a heartbeat interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send another heartbeat
    Send,
    /// Too many heartbeats went unanswered: reboot the player and reconnect
    Escalate,
}

/// Counts unanswered heartbeats
#[derive(Debug)]
pub struct HeartbeatMonitor {
    retries: u32,
    threshold: u32,
}

impl HeartbeatMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            retries: 0,
            threshold: threshold.max(1),
        }
    }

    /// Called on every interval while connected
    pub fn tick(&mut self) -> HeartbeatAction {
        self.retries += 1;
        if self.retries >= self.threshold {
            self.retries = 0;
            HeartbeatAction::Escalate
        } else {
            HeartbeatAction::Send
        }
    }

    /// A heartbeat reply arrived
    pub fn reply(&mut self) {
        self.retries = 0;
    }

    #[cfg(test)]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalates_after_threshold_without_reply() {
        let mut monitor = HeartbeatMonitor::new(3);

        assert_eq!(monitor.tick(), HeartbeatAction::Send);
        assert_eq!(monitor.tick(), HeartbeatAction::Send);
        assert_eq!(monitor.tick(), HeartbeatAction::Escalate);
        assert_eq!(monitor.retries(), 0);

        // Counting starts over after the escalation
        assert_eq!(monitor.tick(), HeartbeatAction::Send);
    }

    #[test]
    fn test_reply_resets_counter() {
        let mut monitor = HeartbeatMonitor::new(3);

        monitor.tick();
        monitor.tick();
        monitor.reply();
        assert_eq!(monitor.retries(), 0);

        assert_eq!(monitor.tick(), HeartbeatAction::Send);
        assert_eq!(monitor.tick(), HeartbeatAction::Send);
    }

    #[test]
    fn test_zero_threshold_is_treated_as_one() {
        let mut monitor = HeartbeatMonitor::new(0);
        assert_eq!(monitor.tick(), HeartbeatAction::Escalate);
    }
}
