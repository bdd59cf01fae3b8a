//! Per-model circuit breakers.
//!
//! Each model gets an independent state machine: `closed` admits traffic,
//! `open` blocks it, `half_open` admits probe traffic after the recovery
//! timeout. Transitions happen inside a short per-model critical section;
//! `can_proceed` is a single lock acquisition.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds governing one model's circuit.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close the circuit.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    config: BreakerConfig,
}

impl Circuit {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            half_open_successes: 0,
            config,
        }
    }
}

/// Serializable view of one circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub seconds_since_last_failure: Option<u64>,
    pub half_open_successes: u32,
}

/// Registry of circuit breakers, one per model id.
pub struct CircuitBreakerRegistry {
    circuits: DashMap<String, Mutex<Circuit>>,
    default_config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            circuits: DashMap::new(),
            default_config: BreakerConfig::default(),
        }
    }

    pub fn add_model(&self, model_id: impl Into<String>, config: Option<BreakerConfig>) {
        self.circuits.insert(
            model_id.into(),
            Mutex::new(Circuit::new(config.unwrap_or(self.default_config))),
        );
    }

    pub fn remove_model(&self, model_id: &str) {
        self.circuits.remove(model_id);
    }

    /// Whether requests may be sent to the model right now. An open circuit
    /// whose recovery timeout has elapsed transitions to half-open here.
    pub fn can_proceed(&self, model_id: &str) -> bool {
        let Some(entry) = self.circuits.get(model_id) else {
            // Untracked models are not gated.
            return true;
        };
        let mut circuit = entry.lock().expect("circuit lock poisoned");

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = circuit
                    .last_failure
                    .map(|at| at.elapsed() >= circuit.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_successes = 0;
                    info!(model_id, "circuit moved to half-open for probing");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self, model_id: &str) {
        let Some(entry) = self.circuits.get(model_id) else {
            return;
        };
        let mut circuit = entry.lock().expect("circuit lock poisoned");

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= circuit.config.half_open_max_calls {
                    circuit.state = CircuitState::Closed;
                    circuit.consecutive_failures = 0;
                    circuit.half_open_successes = 0;
                    info!(model_id, "circuit closed after successful probes");
                }
            }
            CircuitState::Closed => {
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, model_id: &str) {
        let Some(entry) = self.circuits.get(model_id) else {
            return;
        };
        let mut circuit = entry.lock().expect("circuit lock poisoned");
        circuit.consecutive_failures += 1;
        circuit.last_failure = Some(Instant::now());

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.half_open_successes = 0;
                warn!(model_id, "circuit reopened: probe failed");
            }
            CircuitState::Closed => {
                if circuit.consecutive_failures >= circuit.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    warn!(
                        model_id,
                        failures = circuit.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self, model_id: &str) -> Option<CircuitSnapshot> {
        let entry = self.circuits.get(model_id)?;
        let circuit = entry.lock().expect("circuit lock poisoned");
        Some(CircuitSnapshot {
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            seconds_since_last_failure: circuit.last_failure.map(|at| at.elapsed().as_secs()),
            half_open_successes: circuit.half_open_successes,
        })
    }

    pub fn snapshot_all(&self) -> std::collections::HashMap<String, CircuitSnapshot> {
        self.circuits
            .iter()
            .map(|entry| {
                let circuit = entry.value().lock().expect("circuit lock poisoned");
                (
                    entry.key().clone(),
                    CircuitSnapshot {
                        state: circuit.state,
                        consecutive_failures: circuit.consecutive_failures,
                        seconds_since_last_failure: circuit
                            .last_failure
                            .map(|at| at.elapsed().as_secs()),
                        half_open_successes: circuit.half_open_successes,
                    },
                )
            })
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
