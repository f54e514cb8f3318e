//! Transfer monitor: connection and stall timers, driven by host ticks.
//!
//! The host calls `tick` at a fixed cadence (the node uses one second). A timer
//! expires once `timeout` ticks have elapsed since it was armed or last reset.

/// Which timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Channel did not open, or no first response arrived, in time.
    Connect,
    /// No chunk traffic within the stall window.
    Stall,
}

/// Two independent timers per session.
#[derive(Debug, Clone)]
pub struct TransferMonitor {
    tick_count: u64,
    connect_timeout_ticks: u64,
    stall_timeout_ticks: u64,
    /// Tick at which the connect timer was armed.
    connect_since: Option<u64>,
    /// Tick of the last chunk activity while streaming.
    stall_since: Option<u64>,
}

impl TransferMonitor {
    pub fn new(connect_timeout_ticks: u64, stall_timeout_ticks: u64) -> Self {
        Self {
            tick_count: 0,
            connect_timeout_ticks,
            stall_timeout_ticks,
            connect_since: None,
            stall_since: None,
        }
    }

    pub fn arm_connect(&mut self) {
        self.connect_since = Some(self.tick_count);
    }

    /// Cancel the connect timer (any incoming message does this).
    pub fn cancel_connect(&mut self) {
        self.connect_since = None;
    }

    /// Arm the stall timer, or restart its window if already armed.
    pub fn reset_stall(&mut self) {
        self.stall_since = Some(self.tick_count);
    }

    pub fn cancel_stall(&mut self) {
        self.stall_since = None;
    }

    pub fn cancel_all(&mut self) {
        self.connect_since = None;
        self.stall_since = None;
    }

    pub fn is_connect_armed(&self) -> bool {
        self.connect_since.is_some()
    }

    pub fn is_stall_armed(&self) -> bool {
        self.stall_since.is_some()
    }

    /// Advance one tick. Returns the timers that expired; expired timers are disarmed.
    pub fn tick(&mut self) -> Vec<Timeout> {
        self.tick_count = self.tick_count.saturating_add(1);
        let mut expired = Vec::new();
        if let Some(since) = self.connect_since {
            if self.tick_count.saturating_sub(since) >= self.connect_timeout_ticks {
                self.connect_since = None;
                expired.push(Timeout::Connect);
            }
        }
        if let Some(since) = self.stall_since {
            if self.tick_count.saturating_sub(since) >= self.stall_timeout_ticks {
                self.stall_since = None;
                expired.push(Timeout::Stall);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_monitor_never_fires() {
        let mut m = TransferMonitor::new(2, 2);
        for _ in 0..10 {
            assert!(m.tick().is_empty());
        }
    }

    #[test]
    fn connect_fires_after_timeout() {
        let mut m = TransferMonitor::new(3, 10);
        m.arm_connect();
        assert!(m.tick().is_empty());
        assert!(m.tick().is_empty());
        assert_eq!(m.tick(), vec![Timeout::Connect]);
        assert!(!m.is_connect_armed());
        assert!(m.tick().is_empty());
    }

    #[test]
    fn cancel_connect_prevents_fire() {
        let mut m = TransferMonitor::new(2, 10);
        m.arm_connect();
        m.tick();
        m.cancel_connect();
        for _ in 0..5 {
            assert!(m.tick().is_empty());
        }
    }

    #[test]
    fn stall_reset_extends_window() {
        let mut m = TransferMonitor::new(10, 3);
        m.reset_stall();
        m.tick();
        m.tick();
        m.reset_stall();
        assert!(m.tick().is_empty());
        assert!(m.tick().is_empty());
        assert_eq!(m.tick(), vec![Timeout::Stall]);
    }

    #[test]
    fn cancel_all_disarms_both() {
        let mut m = TransferMonitor::new(1, 1);
        m.arm_connect();
        m.reset_stall();
        m.cancel_all();
        assert!(m.tick().is_empty());
        assert!(!m.is_connect_armed());
        assert!(!m.is_stall_armed());
    }
}
