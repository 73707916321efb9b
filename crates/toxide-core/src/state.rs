//! Per-connection toxic state.
//!
//! Every pump keeps a [`ToxicStates`] table keyed by toxic name. It records
//! whether per-connection toxics rolled active, when they were first seen, and
//! how many bytes `limit_data` has let through. Connection-level effects
//! (resets, timeouts, slow closes) are derived from it with
//! [`ToxicStates::effects`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::toxic::{roll, Sampling, Toxic, ToxicKind};

/// State of one toxic on one connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToxicState {
    /// Whether a per-connection toxic rolled active. Always true for per-chunk toxics.
    pub active: bool,
    /// When this connection first saw the toxic.
    pub since: Instant,
    /// Bytes let through so far (`limit_data`).
    pub passed: u64,
    /// Toxicity the roll was made with.
    toxicity: f32,
    /// Attachment id of the toxic this state belongs to.
    id: u64,
}

impl ToxicState {
    /// Creates a state with an explicit activation decision.
    pub fn new(active: bool, since: Instant) -> Self {
        Self {
            active,
            since,
            passed: 0,
            toxicity: if active { 1.0 } else { 0.0 },
            id: 0,
        }
    }

    fn rolled<R: Rng + ?Sized>(toxic: &Toxic, now: Instant, rng: &mut R) -> Self {
        let active = match toxic.sampling() {
            Sampling::PerConnection => roll(toxic.toxicity, rng),
            Sampling::PerChunk => true,
        };
        Self {
            active,
            since: now,
            passed: 0,
            toxicity: toxic.toxicity,
            id: toxic.id(),
        }
    }
}

/// Connection-level effects of the active toxics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    /// Reset the connection at this instant.
    pub reset_at: Option<Instant>,
    /// All data is held back.
    pub blocked: bool,
    /// Tear the connection down at this instant.
    pub close_at: Option<Instant>,
    /// Wait this long after EOF before closing.
    pub slow_close: Duration,
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

/// Toxic states for one connection direction, keyed by toxic name.
#[derive(Debug, Default)]
pub struct ToxicStates {
    states: HashMap<String, ToxicState>,
}

impl ToxicStates {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state for `toxic`, rolling it on first sight.
    ///
    /// State left behind by an earlier toxic of the same name is replaced.
    pub fn state_for<R: Rng + ?Sized>(
        &mut self,
        toxic: &Toxic,
        now: Instant,
        rng: &mut R,
    ) -> &mut ToxicState {
        match self.states.entry(toxic.name.clone()) {
            Entry::Occupied(entry) => {
                let state = entry.into_mut();
                if state.id != toxic.id() {
                    *state = ToxicState::rolled(toxic, now, rng);
                }
                state
            }
            Entry::Vacant(entry) => entry.insert(ToxicState::rolled(toxic, now, rng)),
        }
    }

    /// Brings the table in line with a new chain snapshot.
    ///
    /// Removed toxics are forgotten, new ones are rolled, and toxics whose
    /// toxicity changed are rolled again.
    pub fn sync<R: Rng + ?Sized>(&mut self, toxics: &[Toxic], now: Instant, rng: &mut R) {
        self.states.retain(|name, state| {
            toxics
                .iter()
                .any(|t| &t.name == name && t.id() == state.id)
        });
        for toxic in toxics {
            let state = self.state_for(toxic, now, rng);
            if state.toxicity != toxic.toxicity {
                *state = ToxicState::rolled(toxic, now, rng);
            }
        }
    }

    /// Returns the state recorded for a toxic name.
    pub fn get(&self, name: &str) -> Option<&ToxicState> {
        self.states.get(name)
    }

    /// Number of tracked toxics.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no toxic is tracked.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Computes the connection-level effects of the active toxics.
    pub fn effects(&self, toxics: &[Toxic]) -> Effects {
        let mut effects = Effects::default();
        for toxic in toxics {
            let Some(state) = self.states.get(&toxic.name) else {
                continue;
            };
            if state.id != toxic.id() || !state.active {
                continue;
            }
            match &toxic.kind {
                ToxicKind::ResetPeer(reset) => {
                    let at = state.since + Duration::from_millis(reset.timeout);
                    effects.reset_at = earliest(effects.reset_at, at);
                }
                ToxicKind::Timeout(timeout) => {
                    effects.blocked = true;
                    if timeout.timeout > 0 {
                        let at = state.since + Duration::from_millis(timeout.timeout);
                        effects.close_at = earliest(effects.close_at, at);
                    }
                }
                ToxicKind::SlowClose(slow) => {
                    effects.slow_close = effects.slow_close.max(Duration::from_millis(slow.delay));
                }
                _ => {}
            }
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ToxicChain;
    use crate::direction::Direction;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn sync_rolls_and_forgets() {
        let now = Instant::now();
        let mut states = ToxicStates::new();
        let toxics = vec![
            Toxic::reset_peer("reset", 0, Direction::Downstream),
            Toxic::latency("lag", 10, 0, Direction::Downstream),
        ];
        states.sync(&toxics, now, &mut rng());
        assert_eq!(states.len(), 2);
        assert!(states.get("reset").unwrap().active);

        states.sync(&toxics[1..], now, &mut rng());
        assert_eq!(states.len(), 1);
        assert!(states.get("reset").is_none());
    }

    #[test]
    fn zero_toxicity_connection_toxic_is_inactive() {
        let now = Instant::now();
        let mut states = ToxicStates::new();
        let toxics = vec![Toxic::reset_peer("reset", 0, Direction::Downstream).with_toxicity(0.0)];
        states.sync(&toxics, now, &mut rng());
        assert!(!states.get("reset").unwrap().active);
        assert_eq!(states.effects(&toxics), Effects::default());
    }

    #[test]
    fn toxicity_change_rolls_again() {
        let now = Instant::now();
        let mut states = ToxicStates::new();
        let off = vec![Toxic::timeout("t", 0, Direction::Upstream).with_toxicity(0.0)];
        states.sync(&off, now, &mut rng());
        assert!(!states.effects(&off).blocked);

        let on = vec![Toxic::timeout("t", 0, Direction::Upstream)];
        states.sync(&on, now, &mut rng());
        assert!(states.effects(&on).blocked);
    }

    #[test]
    fn effects_pick_earliest_deadlines() {
        let now = Instant::now();
        let mut states = ToxicStates::new();
        let toxics = vec![
            Toxic::reset_peer("late", 500, Direction::Downstream),
            Toxic::reset_peer("early", 100, Direction::Downstream),
            Toxic::timeout("hold", 0, Direction::Downstream),
            Toxic::timeout("cut", 250, Direction::Downstream),
            Toxic::slow_close("slow", 30, Direction::Downstream),
        ];
        states.sync(&toxics, now, &mut rng());
        let fx = states.effects(&toxics);
        assert_eq!(fx.reset_at, Some(now + Duration::from_millis(100)));
        assert_eq!(fx.close_at, Some(now + Duration::from_millis(250)));
        assert!(fx.blocked);
        assert_eq!(fx.slow_close, Duration::from_millis(30));
    }

    #[test]
    fn timeout_zero_blocks_without_deadline() {
        let now = Instant::now();
        let mut states = ToxicStates::new();
        let toxics = vec![Toxic::timeout("hold", 0, Direction::Downstream)];
        states.sync(&toxics, now, &mut rng());
        let fx = states.effects(&toxics);
        assert!(fx.blocked);
        assert_eq!(fx.close_at, None);
    }

    // ==================== Replaced toxics ====================

    #[test]
    fn replaced_toxic_with_same_name_rolls_fresh() {
        let now = Instant::now();
        let mut states = ToxicStates::new();
        let chain = ToxicChain::new(Direction::Downstream);
        chain
            .add(Toxic::latency("x", 10, 0, Direction::Downstream).with_toxicity(0.0))
            .unwrap();
        states.sync(&chain.snapshot(), now, &mut rng());
        assert!(states.get("x").unwrap().active);

        chain.remove("x").unwrap();
        chain
            .add(Toxic::reset_peer("x", 0, Direction::Downstream).with_toxicity(0.0))
            .unwrap();
        let replaced = chain.snapshot();
        states.sync(&replaced, now, &mut rng());

        assert!(!states.get("x").unwrap().active);
        assert_eq!(states.effects(&replaced), Effects::default());
    }

    #[test]
    fn replaced_limit_data_starts_counting_again() {
        let now = Instant::now();
        let mut states = ToxicStates::new();
        let chain = ToxicChain::new(Direction::Upstream);
        chain
            .add(Toxic::limit_data("cap", 10, Direction::Upstream))
            .unwrap();
        let first = chain.snapshot();
        states.state_for(&first[0], now, &mut rng()).passed = 10;

        chain.remove("cap").unwrap();
        chain
            .add(Toxic::limit_data("cap", 10, Direction::Upstream))
            .unwrap();
        let second = chain.snapshot();
        assert_ne!(first[0].id(), second[0].id());
        assert_eq!(states.state_for(&second[0], now, &mut rng()).passed, 0);
    }
}
