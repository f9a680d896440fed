use std::time::Duration;
use tokio::time::Instant;

/// Paces connect requests of a connecting client
#[derive(Debug)]
pub struct ConnectingTracker {
    interval: Duration,
    max_attempts: u32,
    last_attempt: Option<Instant>,
    attempts: u32,
}

impl ConnectingTracker {
    pub fn new(interval: Duration, max_attempts: u32) -> ConnectingTracker {
        ConnectingTracker {
            interval,
            max_attempts,
            last_attempt: None,
            attempts: 0,
        }
    }

    pub fn time_attempt(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => last + self.interval < now,
        }
    }

    pub fn max_attempts(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn on_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
        self.attempts += 1;
    }
}

#[derive(Debug)]
pub struct TimeoutTracker {
    timeout: Duration,
    last_receive: Instant,
}

impl TimeoutTracker {
    pub fn new(timeout: Duration, now: Instant) -> TimeoutTracker {
        TimeoutTracker {
            timeout,
            last_receive: now,
        }
    }

    pub fn on_receive(&mut self, now: Instant) {
        self.last_receive = now;
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        self.last_receive + self.timeout < now
    }
}

#[derive(Debug)]
pub struct KeepAliveTracker {
    interval: Duration,
    last_send: Instant,
}

impl KeepAliveTracker {
    pub fn new(interval: Duration, now: Instant) -> KeepAliveTracker {
        KeepAliveTracker {
            interval,
            last_send: now,
        }
    }

    pub fn on_send(&mut self, now: Instant) {
        self.last_send = now;
    }

    pub fn should_send_keep_alive(&self, now: Instant) -> bool {
        self.last_send + self.interval < now
    }
}

/// Keeps a disconnected connection around for a while, so late packets don't look like a new
///  connection
#[derive(Debug)]
pub struct DisconnectedTracker {
    duration: Duration,
    disconnected_at: Option<Instant>,
}

impl DisconnectedTracker {
    pub fn new(duration: Duration) -> DisconnectedTracker {
        DisconnectedTracker {
            duration,
            disconnected_at: None,
        }
    }

    pub fn on_disconnect(&mut self, now: Instant) {
        self.disconnected_at = Some(now);
    }

    pub fn should_remove(&self, now: Instant) -> bool {
        match self.disconnected_at {
            None => false,
            Some(at) => at + self.duration < now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn millis(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_connecting_first_attempt_is_immediate() {
        let tracker = ConnectingTracker::new(millis(250), 3);
        assert!(tracker.time_attempt(Instant::now()));
        assert!(!tracker.max_attempts());
    }

    #[rstest]
    #[case::same_time(0, false)]
    #[case::before_interval(249, false)]
    #[case::at_interval(250, false)]
    #[case::after_interval(251, true)]
    fn test_connecting_interval(#[case] elapsed_millis: u64, #[case] expected: bool) {
        let now = Instant::now();
        let mut tracker = ConnectingTracker::new(millis(250), 3);
        tracker.on_attempt(now);
        assert_eq!(tracker.time_attempt(now + millis(elapsed_millis)), expected);
    }

    #[test]
    fn test_connecting_max_attempts() {
        let now = Instant::now();
        let mut tracker = ConnectingTracker::new(millis(250), 3);
        for _ in 0..3 {
            assert!(!tracker.max_attempts());
            tracker.on_attempt(now);
        }
        assert!(tracker.max_attempts());
    }

    #[rstest]
    #[case::fresh(None, 5000, false)]
    #[case::at_timeout(None, 10_000, false)]
    #[case::after_timeout(None, 10_001, true)]
    #[case::refreshed(Some(5000), 10_001, false)]
    fn test_timeout(#[case] receive_at_millis: Option<u64>, #[case] check_at_millis: u64, #[case] expected: bool) {
        let now = Instant::now();
        let mut tracker = TimeoutTracker::new(millis(10_000), now);
        if let Some(at) = receive_at_millis {
            tracker.on_receive(now + millis(at));
        }
        assert_eq!(tracker.timed_out(now + millis(check_at_millis)), expected);
    }

    #[rstest]
    #[case::fresh(None, 1000, false)]
    #[case::due(None, 2001, true)]
    #[case::refreshed(Some(1000), 2001, false)]
    fn test_keep_alive(#[case] send_at_millis: Option<u64>, #[case] check_at_millis: u64, #[case] expected: bool) {
        let now = Instant::now();
        let mut tracker = KeepAliveTracker::new(millis(2000), now);
        if let Some(at) = send_at_millis {
            tracker.on_send(now + millis(at));
        }
        assert_eq!(tracker.should_send_keep_alive(now + millis(check_at_millis)), expected);
    }

    #[test]
    fn test_disconnected() {
        let now = Instant::now();
        let mut tracker = DisconnectedTracker::new(millis(1000));
        assert!(!tracker.should_remove(now + millis(5000)));

        tracker.on_disconnect(now);
        assert!(!tracker.should_remove(now + millis(1000)));
        assert!(tracker.should_remove(now + millis(1001)));
    }
}
