use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    circuit_state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Consecutive-failure breaker for one destination.
///
/// Closed until `failure_threshold` failures in a row. Open rejects every
/// attempt for `recovery_timeout`, then admits a single half-open trial whose
/// outcome closes or reopens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    vendor: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(vendor: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            vendor: vendor.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            state: Mutex::new(BreakerState {
                circuit_state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn state(&self) -> CircuitState {
        self.lock().circuit_state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Admit or reject an attempt. `Err` carries the remaining cool-down.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut s = self.lock();
        match s.circuit_state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = s.opened_at.map(|t| t.elapsed()).unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    s.circuit_state = CircuitState::HalfOpen;
                    s.trial_in_flight = true;
                    tracing::info!(vendor = %self.vendor, "Circuit half-open, admitting trial call");
                    crate::metrics::record_circuit_transition(&self.vendor, CircuitState::HalfOpen.as_str());
                    Ok(())
                } else {
                    Err(self.recovery_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    s.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut s = self.lock();
        let was = s.circuit_state;
        s.circuit_state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.opened_at = None;
        s.trial_in_flight = false;

        if was != CircuitState::Closed {
            tracing::info!(vendor = %self.vendor, "Circuit closed after successful trial");
            crate::metrics::record_circuit_transition(&self.vendor, CircuitState::Closed.as_str());
        }
    }

    pub fn record_failure(&self) {
        let mut s = self.lock();
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.trial_in_flight = false;

        let reopen = match s.circuit_state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => s.consecutive_failures >= self.failure_threshold,
            // late failure from a call admitted before the circuit opened
            CircuitState::Open => false,
        };

        if reopen {
            s.circuit_state = CircuitState::Open;
            s.opened_at = Some(Instant::now());
            tracing::warn!(
                vendor = %self.vendor,
                consecutive_failures = s.consecutive_failures,
                recovery_secs = self.recovery_timeout.as_secs_f64(),
                "Circuit opened"
            );
            crate::metrics::record_circuit_transition(&self.vendor, CircuitState::Open.as_str());
        } else {
            tracing::debug!(
                vendor = %self.vendor,
                consecutive_failures = s.consecutive_failures,
                threshold = self.failure_threshold,
                "Failure recorded"
            );
        }
    }
}

/// Process-wide breakers keyed by vendor name
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing breaker for `vendor`, or a new one with the given settings
    pub fn get_or_create(
        &self,
        vendor: &str,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(vendor.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(vendor, failure_threshold, recovery_timeout)))
            .clone()
    }

    pub fn get(&self, vendor: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(vendor).map(|b| b.clone())
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
