//! Named boolean gates services wait on before they may run.
//!
//! A condition is a flat string key like `net/eth0/up` or `svc/sbin/sshd`
//! with a tri-state value. `Flux` is the in-between state used while the
//! system is reconfiguring: dependent services are paused (SIGSTOP), not
//! stopped, until the producer settles the condition again.

use std::collections::HashMap;
use std::collections::HashSet;

use log::trace;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum CondState {
    /// Negated or unknown.
    Off,
    /// Transition in progress, dependents should pause.
    Flux,
    /// Asserted.
    On,
}

impl std::fmt::Display for CondState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(match self {
            Self::Off => "off",
            Self::Flux => "flux",
            Self::On => "on",
        })
    }
}

/// One entry of a service's condition list. `negated` inverts On/Off for
/// this service only, Flux stays Flux either way.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CondSpec {
    pub name: String,
    pub negated: bool,
}

#[derive(Default)]
pub struct CondStore {
    states: HashMap<String, CondState>,
    /// One-shot conditions stay On for the rest of the boot once asserted.
    pinned: HashSet<String>,
}

impl CondStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> CondState {
        *self.states.get(key).unwrap_or(&CondState::Off)
    }

    /// Returns true if the stored state actually changed, so the caller
    /// knows whether a step-all tick needs to be queued.
    pub fn assert(&mut self, key: &str) -> bool {
        self.set(key, CondState::On)
    }

    pub fn deassert(&mut self, key: &str) -> bool {
        if self.pinned.contains(key) {
            trace!("Condition {key} is pinned, ignoring deassert");
            return false;
        }
        self.set(key, CondState::Off)
    }

    pub fn set_flux(&mut self, key: &str) -> bool {
        if self.pinned.contains(key) {
            return false;
        }
        self.set(key, CondState::Flux)
    }

    /// Assert a condition and pin it On, e.g. `int/bootstrap`.
    pub fn set_oneshot(&mut self, key: &str) -> bool {
        self.pinned.insert(key.to_string());
        self.set(key, CondState::On)
    }

    fn set(&mut self, key: &str, new: CondState) -> bool {
        let old = self.states.insert(key.to_string(), new);
        if old != Some(new) {
            trace!("Condition {key}: {} -> {new}", old.unwrap_or(CondState::Off));
            true
        } else {
            false
        }
    }

    /// Flip every non-pinned condition to Flux. Called at the start of a
    /// configuration reload so dependent services move to WAITING until
    /// their producers re-assert.
    pub fn reload(&mut self) -> bool {
        let mut changed = false;
        for (key, state) in &mut self.states {
            if self.pinned.contains(key) {
                continue;
            }
            if *state != CondState::Flux {
                trace!("Condition {key}: {state} -> flux (reload)");
                *state = CondState::Flux;
                changed = true;
            }
        }
        changed
    }

    /// Combined state over a service's condition list: the minimum of the
    /// member states ordered Off < Flux < On, with negated members
    /// inverted. An empty list aggregates to On.
    #[must_use]
    pub fn aggregate(&self, list: &[CondSpec]) -> CondState {
        let mut agg = CondState::On;
        for spec in list {
            let mut state = self.get(&spec.name);
            if spec.negated {
                state = match state {
                    CondState::On => CondState::Off,
                    CondState::Off => CondState::On,
                    CondState::Flux => CondState::Flux,
                };
            }
            if state < agg {
                agg = state;
            }
        }
        agg
    }
}
