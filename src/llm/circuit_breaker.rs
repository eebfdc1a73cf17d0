// src/llm/circuit_breaker.rs
// Per-provider failure gate. A provider that keeps failing inside the
// tracking window is taken out of rotation for a cooldown, after which a
// single probe request decides whether it rejoins.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::provider::Provider;

/// Failures inside the window that open the gate.
const TRIP_AFTER: usize = 5;
/// Failures older than this no longer count toward the threshold.
const WINDOW: Duration = Duration::from_secs(60);
/// How long an open gate rejects calls before one probe is let through.
const COOLDOWN: Duration = Duration::from_secs(60);

/// Outcome of asking the gate whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admit {
    /// Gate closed, normal traffic
    Yes,
    /// Cooldown expired; this caller carries the one probe request
    Probe,
    /// Gate open (or a probe is already in flight)
    No,
}

/// What a recorded failure did to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureEffect {
    Counted,
    Tripped,
    ProbeRejected,
    IgnoredWhileOpen,
}

/// Book-keeping for one provider.
#[derive(Debug, Default)]
struct Gate {
    /// Failure timestamps, oldest first; pruned against WINDOW on access
    recent_failures: VecDeque<Instant>,
    /// Set while the gate is open (or half-open awaiting its probe)
    opened_at: Option<Instant>,
    /// A probe request has been admitted and has not resolved yet
    probing: bool,
}

impl Gate {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.recent_failures.front() {
            if now.duration_since(*oldest) < WINDOW {
                break;
            }
            self.recent_failures.pop_front();
        }
    }

    fn admit(&mut self, now: Instant) -> Admit {
        let Some(opened) = self.opened_at else {
            return Admit::Yes;
        };
        if now.duration_since(opened) < COOLDOWN || self.probing {
            return Admit::No;
        }
        self.probing = true;
        Admit::Probe
    }

    /// Returns true when the gate was open and has now recovered.
    fn note_success(&mut self) -> bool {
        let was_open = self.opened_at.is_some();
        self.opened_at = None;
        self.probing = false;
        self.recent_failures.clear();
        was_open
    }

    fn note_failure(&mut self, now: Instant) -> FailureEffect {
        if self.opened_at.is_some() {
            if !self.probing {
                // A call admitted before the gate opened came back late;
                // the gate is already rejecting traffic
                return FailureEffect::IgnoredWhileOpen;
            }
            self.probing = false;
            self.opened_at = Some(now);
            self.recent_failures.clear();
            return FailureEffect::ProbeRejected;
        }

        self.recent_failures.push_back(now);
        self.prune(now);
        if self.recent_failures.len() >= TRIP_AFTER {
            self.opened_at = Some(now);
            self.recent_failures.clear();
            FailureEffect::Tripped
        } else {
            FailureEffect::Counted
        }
    }
}

/// Thread-safe circuit breaker tracking per-provider health.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    gates: Arc<Mutex<HashMap<Provider, Gate>>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a call to this provider may proceed right now.
    ///
    /// An open gate rejects calls until its cooldown elapses, then admits
    /// exactly one probe; further callers are rejected until the probe
    /// resolves through `record_success` or `record_failure`.
    pub fn is_available(&self, provider: Provider) -> bool {
        let Ok(mut gates) = self.gates.lock() else {
            return true; // poisoned lock: fail open
        };
        match gates.entry(provider).or_default().admit(Instant::now()) {
            Admit::Yes => true,
            Admit::Probe => {
                info!(provider = %provider, "Circuit cooldown over, admitting probe request");
                true
            }
            Admit::No => false,
        }
    }

    /// A successful call closes the gate and forgets tracked failures.
    pub fn record_success(&self, provider: Provider) {
        let Ok(mut gates) = self.gates.lock() else {
            return;
        };
        if gates.entry(provider).or_default().note_success() {
            info!(provider = %provider, "Circuit closed (probe succeeded)");
        }
    }

    /// A failed call counts toward the threshold, trips the gate when the
    /// window fills up, or re-opens it when a probe comes back bad.
    pub fn record_failure(&self, provider: Provider) {
        let Ok(mut gates) = self.gates.lock() else {
            return;
        };
        match gates.entry(provider).or_default().note_failure(Instant::now()) {
            FailureEffect::Tripped => warn!(
                provider = %provider,
                "Circuit opened after {TRIP_AFTER} failures within {}s, cooling down {}s",
                WINDOW.as_secs(),
                COOLDOWN.as_secs()
            ),
            FailureEffect::ProbeRejected => {
                warn!(provider = %provider, "Probe failed, circuit re-opened");
            }
            FailureEffect::Counted | FailureEffect::IgnoredWhileOpen => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail_times(cb: &CircuitBreaker, provider: Provider, times: usize) {
        for _ in 0..times {
            cb.record_failure(provider);
        }
    }

    /// Force a provider's gate into the open state with a given age.
    fn backdate_open(cb: &CircuitBreaker, provider: Provider, age: Duration) {
        let mut gates = cb.gates.lock().unwrap();
        let gate = gates.entry(provider).or_default();
        gate.opened_at = Some(Instant::now() - age);
        gate.probing = false;
    }

    #[test]
    fn fresh_gate_admits_traffic() {
        let cb = CircuitBreaker::new();
        assert!(cb.is_available(Provider::Gemini));
    }

    #[test]
    fn failures_below_threshold_keep_gate_closed() {
        let cb = CircuitBreaker::new();
        fail_times(&cb, Provider::Gemini, TRIP_AFTER - 1);
        assert!(cb.is_available(Provider::Gemini));
    }

    #[test]
    fn gate_opens_at_threshold() {
        let cb = CircuitBreaker::new();
        fail_times(&cb, Provider::Gemini, TRIP_AFTER);
        assert!(!cb.is_available(Provider::Gemini));
    }

    #[test]
    fn stale_failures_fall_out_of_the_window() {
        let cb = CircuitBreaker::new();
        // Seed old failures just outside the window, then add fresh ones:
        // the stale entries must not count toward the threshold
        {
            let mut gates = cb.gates.lock().unwrap();
            let gate = gates.entry(Provider::Gemini).or_default();
            let stale = Instant::now() - WINDOW - Duration::from_secs(1);
            for _ in 0..TRIP_AFTER {
                gate.recent_failures.push_back(stale);
            }
        }
        fail_times(&cb, Provider::Gemini, TRIP_AFTER - 1);
        assert!(cb.is_available(Provider::Gemini));
    }

    #[test]
    fn success_forgets_accumulated_failures() {
        let cb = CircuitBreaker::new();
        fail_times(&cb, Provider::OpenRouter, TRIP_AFTER - 1);
        cb.record_success(Provider::OpenRouter);
        fail_times(&cb, Provider::OpenRouter, TRIP_AFTER - 1);
        assert!(cb.is_available(Provider::OpenRouter));
    }

    #[test]
    fn open_gate_rejects_until_cooldown() {
        let cb = CircuitBreaker::new();
        backdate_open(&cb, Provider::Gemini, COOLDOWN / 2);
        assert!(!cb.is_available(Provider::Gemini));
    }

    #[test]
    fn cooldown_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new();
        backdate_open(&cb, Provider::Gemini, COOLDOWN + Duration::from_secs(1));
        assert!(cb.is_available(Provider::Gemini), "first caller carries the probe");
        assert!(
            !cb.is_available(Provider::Gemini),
            "second caller waits for the probe to resolve"
        );
    }

    #[test]
    fn probe_success_restores_traffic() {
        let cb = CircuitBreaker::new();
        backdate_open(&cb, Provider::SiliconFlow, COOLDOWN + Duration::from_secs(1));
        assert!(cb.is_available(Provider::SiliconFlow));
        cb.record_success(Provider::SiliconFlow);
        assert!(cb.is_available(Provider::SiliconFlow));
        assert!(cb.is_available(Provider::SiliconFlow));
    }

    #[test]
    fn probe_failure_reopens_gate() {
        let cb = CircuitBreaker::new();
        backdate_open(&cb, Provider::SiliconFlow, COOLDOWN + Duration::from_secs(1));
        assert!(cb.is_available(Provider::SiliconFlow));
        cb.record_failure(Provider::SiliconFlow);
        assert!(!cb.is_available(Provider::SiliconFlow));
    }

    #[test]
    fn late_failure_while_open_changes_nothing() {
        let cb = CircuitBreaker::new();
        backdate_open(&cb, Provider::Gemini, Duration::from_secs(1));
        cb.record_failure(Provider::Gemini); // no probe in flight
        assert!(!cb.is_available(Provider::Gemini));
        // The opened_at stamp was not refreshed by the late failure
        let gates = cb.gates.lock().unwrap();
        let age = gates[&Provider::Gemini].opened_at.unwrap().elapsed();
        assert!(age >= Duration::from_secs(1));
    }

    #[test]
    fn gates_are_tracked_per_provider() {
        let cb = CircuitBreaker::new();
        fail_times(&cb, Provider::OpenRouter, TRIP_AFTER);
        assert!(!cb.is_available(Provider::OpenRouter));
        assert!(cb.is_available(Provider::Gemini));
        assert!(cb.is_available(Provider::SiliconFlow));
    }
}
