//! Connection lifecycle without any I/O.
//!
//! [`Connection`] owns the state, attempt counter, backoff delay and
//! generation of one logical channel. The async transport feeds it socket
//! outcomes tagged with the generation they were started under; anything
//! tagged with an older generation is ignored.

use crate::config::ReconnectConfig;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_backoff(),
            multiplier: config.backoff_multiplier,
            max: config.max_backoff(),
            max_attempts: config.max_attempts,
        }
    }
}

impl BackoffPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        let scaled = Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        scaled.min(self.max)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Reconnect { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct Connection {
    policy: BackoffPolicy,
    state: ConnectionState,
    attempts: u32,
    delay: Duration,
    generation: u64,
    auto_reconnect: bool,
    gave_up: bool,
}

impl Connection {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            delay: policy.initial,
            generation: 0,
            auto_reconnect: false,
            gave_up: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Starts a connect attempt and returns its generation.
    ///
    /// Returns `None` while already connecting or connected. Opening from a
    /// pending reconnect connects immediately and keeps the backoff progress;
    /// opening after a close or give-up starts over from the initial delay.
    pub fn open(&mut self) -> Option<u64> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => return None,
            ConnectionState::Reconnecting => {}
            ConnectionState::Disconnected => {
                self.attempts = 0;
                self.delay = self.policy.initial;
            }
        }
        self.auto_reconnect = true;
        self.gave_up = false;
        Some(self.begin_attempt())
    }

    pub fn on_connected(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.delay = self.policy.initial;
        true
    }

    /// Socket closed, errored or failed to connect.
    ///
    /// `None` when the report is stale, duplicated, or the owner closed the
    /// channel.
    pub fn on_disconnected(&mut self, generation: u64) -> Option<Recovery> {
        if !self.is_current(generation) || !self.auto_reconnect {
            return None;
        }
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return None;
        }

        self.state = ConnectionState::Disconnected;
        if self.policy.exhausted(self.attempts) {
            self.auto_reconnect = false;
            self.gave_up = true;
            return Some(Recovery::GiveUp {
                attempts: self.attempts,
            });
        }

        let delay = self.delay;
        self.attempts += 1;
        self.delay = self.policy.next_delay(delay);
        self.state = ConnectionState::Reconnecting;
        Some(Recovery::Reconnect {
            attempt: self.attempts,
            delay,
        })
    }

    /// Reconnect timer fired; returns the generation for the new attempt.
    pub fn on_reconnect_due(&mut self, generation: u64) -> Option<u64> {
        if !self.is_current(generation) || self.state != ConnectionState::Reconnecting {
            return None;
        }
        Some(self.begin_attempt())
    }

    /// Owner-requested teardown. Every outstanding generation becomes stale.
    pub fn close(&mut self) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.auto_reconnect = false;
        self.gave_up = false;
        self.attempts = 0;
        self.delay = self.policy.initial;
        self.generation
    }

    fn begin_attempt(&mut self) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(1_000),
            max_attempts,
        }
    }

    fn fail_current(conn: &mut Connection) -> Recovery {
        conn.on_disconnected(conn.generation())
            .expect("current generation must recover")
    }

    #[test]
    fn cold_start_connects_with_zero_attempts() {
        let mut conn = Connection::new(policy(5));
        let generation = conn.open().expect("first open");
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.on_connected(generation));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.attempts(), 0);
    }

    #[test]
    fn open_is_idempotent_while_live() {
        let mut conn = Connection::new(policy(5));
        let generation = conn.open().expect("open");
        assert_eq!(conn.open(), None);
        assert!(conn.on_connected(generation));
        assert_eq!(conn.open(), None);
        assert_eq!(conn.generation(), generation);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let mut conn = Connection::new(policy(0));
        conn.open().expect("open");
        let mut previous = Duration::ZERO;
        for _ in 0..12 {
            let Recovery::Reconnect { delay, .. } = fail_current(&mut conn) else {
                panic!("unlimited policy never gives up");
            };
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= Duration::from_millis(1_000));
            previous = delay;
            conn.on_reconnect_due(conn.generation()).expect("timer fires");
        }
        assert_eq!(previous, Duration::from_millis(1_000));
    }

    #[test]
    fn flaky_network_then_success_resets_backoff() {
        let mut conn = Connection::new(policy(10));
        conn.open().expect("open");

        let mut delays = Vec::new();
        for expected_attempt in 1..=3 {
            match fail_current(&mut conn) {
                Recovery::Reconnect { attempt, delay } => {
                    assert_eq!(attempt, expected_attempt);
                    delays.push(delay);
                }
                other => panic!("unexpected recovery: {other:?}"),
            }
            assert_eq!(conn.state(), ConnectionState::Reconnecting);
            conn.on_reconnect_due(conn.generation()).expect("timer fires");
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        assert!(conn.on_connected(conn.generation()));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.attempts(), 0);

        match fail_current(&mut conn) {
            Recovery::Reconnect { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(100));
            }
            other => panic!("unexpected recovery: {other:?}"),
        }
    }

    #[test]
    fn gives_up_after_max_attempts_and_manual_open_resets() {
        let mut conn = Connection::new(policy(2));
        conn.open().expect("open");
        assert!(matches!(fail_current(&mut conn), Recovery::Reconnect { attempt: 1, .. }));
        conn.on_reconnect_due(conn.generation()).expect("retry 1");
        assert!(matches!(fail_current(&mut conn), Recovery::Reconnect { attempt: 2, .. }));
        conn.on_reconnect_due(conn.generation()).expect("retry 2");
        assert_eq!(fail_current(&mut conn), Recovery::GiveUp { attempts: 2 });
        assert!(conn.gave_up());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.on_disconnected(conn.generation()), None);

        conn.open().expect("manual reopen");
        assert_eq!(conn.attempts(), 0);
        assert!(!conn.gave_up());
        assert_eq!(conn.current_delay(), Duration::from_millis(100));
    }

    #[test]
    fn stale_generation_callbacks_are_ignored_after_close() {
        let mut conn = Connection::new(policy(5));
        let stale = conn.open().expect("open");
        assert!(conn.on_connected(stale));
        conn.close();

        assert!(!conn.on_connected(stale));
        assert_eq!(conn.on_disconnected(stale), None);
        assert_eq!(conn.on_reconnect_due(stale), None);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.attempts(), 0);
    }

    #[test]
    fn superseded_attempt_cannot_claim_connection() {
        let mut conn = Connection::new(policy(5));
        let first = conn.open().expect("open");
        fail_current(&mut conn);
        let second = conn.open().expect("manual open preempts the timer");
        assert_ne!(first, second);
        assert_eq!(conn.on_reconnect_due(first), None);
        assert!(!conn.on_connected(first));
        assert!(conn.on_connected(second));
        assert_eq!(conn.attempts(), 0);
    }

    #[test]
    fn next_delay_saturates_at_ceiling() {
        let policy = policy(0);
        assert_eq!(
            policy.next_delay(Duration::from_millis(900)),
            Duration::from_millis(1_000)
        );
        assert_eq!(
            policy.next_delay(Duration::MAX),
            Duration::from_millis(1_000)
        );
    }
}
