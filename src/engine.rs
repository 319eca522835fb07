use crate::constants::*;
use crate::tunables::{PolicyBounds, Tunables};

/// Rounding directive handed to the actuation driver with a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Lowest supported frequency at or above the target.
    AtLeast,
    /// Highest supported frequency at or below the target.
    AtMost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub target: u32,
    pub relation: Relation,
}

/// Which rung of the priority ladder handled a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Boost,
    HighSpeed,
    Primary,
    MicroUp,
    /// Decrease-eligible, but held back by `sampling_down_factor`.
    RateLimited,
    Down,
    MicroDown,
    /// No band matched.
    Hold,
}

impl Tier {
    pub fn describe(self) -> &'static str {
        match self {
            Tier::Boost => "input boost",
            Tier::HighSpeed => "high-speed increase",
            Tier::Primary => "increase",
            Tier::MicroUp => "micro increase",
            Tier::RateLimited => "decrease deferred",
            Tier::Down => "decrease",
            Tier::MicroDown => "micro decrease",
            Tier::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Fixed `freq_step` / `micro_freq_step` percentages of the unit maximum.
    Flat,
    /// `delta = max(min_delta, distance * multiplier / resistance)`, where the
    /// multiplier is the load for increases and `(100 + down_bias) - load`
    /// for decreases.
    Proportional { resistance: u32, down_bias: u32 },
}

/// One tuning of the decision ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineProfile {
    pub step: StepMode,
    pub micro_tiers: bool,
    /// The primary increase also requires the previous sample to have
    /// reached `up_threshold`.
    pub confirm_with_previous_load: bool,
}

impl EngineProfile {
    pub const SUBLIME: Self = Self {
        step: StepMode::Flat,
        micro_tiers: true,
        confirm_with_previous_load: false,
    };

    pub const PROPORTIONAL: Self = Self {
        step: StepMode::Proportional {
            resistance: DEF_PROPORTIONAL_RESISTANCE,
            down_bias: DEF_PROPORTIONAL_DOWN_BIAS,
        },
        micro_tiers: true,
        confirm_with_previous_load: false,
    };

    pub const STEADY: Self = Self {
        step: StepMode::Flat,
        micro_tiers: false,
        confirm_with_previous_load: true,
    };

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sublime" => Some(Self::SUBLIME),
            "proportional" => Some(Self::PROPORTIONAL),
            "steady" => Some(Self::STEADY),
            _ => None,
        }
    }
}

impl Default for EngineProfile {
    fn default() -> Self {
        Self::SUBLIME
    }
}

/// Controller memory for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitState {
    /// Last target this controller asked for. May differ from the hardware
    /// frequency when something else moved it.
    pub requested_freq: u32,
    pub down_skip: u32,
    pub enabled: bool,
    pub prev_load: Option<u32>,
}

impl UnitState {
    pub fn new(requested_freq: u32) -> Self {
        Self {
            requested_freq,
            down_skip: 0,
            enabled: true,
            prev_load: None,
        }
    }

    /// Adopts an observed frequency when our own memory has drifted outside
    /// the unit's limits. Returns true when it did.
    pub fn resync(&mut self, observed: u32, bounds: &PolicyBounds) -> bool {
        if !self.enabled || bounds.contains(self.requested_freq) {
            return false;
        }
        self.requested_freq = observed;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub state: UnitState,
    pub decision: Option<Decision>,
    pub tier: Tier,
}

fn percent_of(percent: u32, max: u32, fallback: u32) -> u32 {
    let step = (u64::from(percent) * u64::from(max) / 100) as u32;
    // max frequency cannot be under 100 kHz, but who knows
    if step == 0 { fallback } else { step }
}

fn freq_target(t: &Tunables, bounds: &PolicyBounds) -> u32 {
    percent_of(t.freq_step(), bounds.max(), DEF_FREQ_STEP)
}

fn micro_freq_target(t: &Tunables, bounds: &PolicyBounds) -> u32 {
    percent_of(t.micro_freq_step(), bounds.max(), DEF_MICRO_FREQ_STEP)
}

fn proportional(distance: u32, multiplier: u32, resistance: u32, min_delta: u32) -> u32 {
    let delta = u64::from(distance) * u64::from(multiplier) / u64::from(resistance.max(1));
    (delta.min(u64::from(u32::MAX)) as u32).max(min_delta)
}

/// Load-proportional interpolation used while a boost window is open.
pub fn boost_target(bounds: &PolicyBounds, load: u32, input_event_min_freq: u32) -> u32 {
    let span = u64::from(bounds.max() - bounds.min());
    let target = bounds.min() + (span * u64::from(load.min(100)) / 100) as u32;
    bounds.clamp(target.max(input_event_min_freq))
}

/// Runs one tick of the decision ladder. Pure: the caller owns committing
/// the returned state and issuing the decision.
///
/// Increases round down and decreases round up. `requested_freq` keeps
/// accumulating across ticks, so steps finer than the frequency table
/// still add up to a transition.
pub fn decide(
    profile: &EngineProfile,
    t: &Tunables,
    bounds: &PolicyBounds,
    state: &UnitState,
    load: u32,
    boost_active: bool,
) -> Outcome {
    let mut s = *state;
    let prev_load = s.prev_load.replace(load);
    let req = s.requested_freq;
    let highspeed = bounds.clamp(t.highspeed_freq());

    let hold = |s: UnitState, tier: Tier| Outcome {
        state: s,
        decision: None,
        tier,
    };
    let go = |mut s: UnitState, target: u32, relation: Relation, tier: Tier| {
        let target = bounds.clamp(target);
        s.requested_freq = target;
        Outcome {
            state: s,
            decision: Some(Decision { target, relation }),
            tier,
        }
    };

    if boost_active {
        s.down_skip = 0;
        let target = boost_target(bounds, load, t.input_event_min_freq());
        return go(s, target, Relation::AtLeast, Tier::Boost);
    }

    if load > t.highspeed_up_threshold() {
        s.down_skip = 0;
        if req >= bounds.max() {
            return hold(s, Tier::HighSpeed);
        }
        let target = match profile.step {
            StepMode::Flat if req < highspeed => highspeed,
            StepMode::Flat => req.saturating_add(micro_freq_target(t, bounds)),
            StepMode::Proportional { resistance, .. } => req.saturating_add(proportional(
                bounds.max() - req,
                load,
                resistance,
                micro_freq_target(t, bounds),
            )),
        };
        return go(s, target.min(bounds.max()), Relation::AtMost, Tier::HighSpeed);
    }

    let confirmed = !profile.confirm_with_previous_load
        || prev_load.is_some_and(|p| p >= t.up_threshold());
    if load >= t.up_threshold() && confirmed {
        s.down_skip = 0;
        if req >= highspeed {
            return hold(s, Tier::Primary);
        }
        let delta = match profile.step {
            StepMode::Flat => freq_target(t, bounds),
            StepMode::Proportional { resistance, .. } => proportional(
                highspeed - req,
                load,
                resistance,
                micro_freq_target(t, bounds),
            ),
        };
        let target = req.saturating_add(delta).min(highspeed);
        return go(s, target, Relation::AtMost, Tier::Primary);
    }

    if profile.micro_tiers && load > t.micro_up_threshold() {
        s.down_skip = 0;
        if req >= highspeed {
            return hold(s, Tier::MicroUp);
        }
        let target = req
            .saturating_add(micro_freq_target(t, bounds))
            .min(highspeed);
        return go(s, target, Relation::AtMost, Tier::MicroUp);
    }

    // a zero step is a request to never lower the frequency
    if t.freq_step() == 0 {
        return hold(s, Tier::Hold);
    }

    s.down_skip += 1;
    if s.down_skip < t.sampling_down_factor() {
        return hold(s, Tier::RateLimited);
    }
    s.down_skip = 0;

    let (tier, flat_step) = if load < t.down_threshold() {
        (Tier::Down, freq_target(t, bounds))
    } else if profile.micro_tiers && load < t.micro_down_threshold() {
        (Tier::MicroDown, micro_freq_target(t, bounds))
    } else {
        return hold(s, Tier::Hold);
    };

    if req <= bounds.min() {
        return hold(s, tier);
    }
    let delta = match (profile.step, tier) {
        (StepMode::Proportional { resistance, down_bias }, Tier::Down) => proportional(
            req - bounds.min(),
            (100 + down_bias).saturating_sub(load),
            resistance,
            micro_freq_target(t, bounds),
        ),
        _ => flat_step,
    };
    let target = req.saturating_sub(delta).max(bounds.min());
    go(s, target, Relation::AtLeast, tier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunables::TUNABLE_NAMES;
    use proptest::prelude::*;

    const BOUNDS: PolicyBounds = PolicyBounds::new(300_000, 1_800_000);

    /// Feeds `loads` through the engine and returns every decision.
    fn run(
        profile: &EngineProfile,
        t: &Tunables,
        state: &mut UnitState,
        loads: &[u32],
    ) -> Vec<Option<Decision>> {
        loads
            .iter()
            .map(|&load| {
                let out = decide(profile, t, &BOUNDS, state, load, false);
                *state = out.state;
                out.decision
            })
            .collect()
    }

    #[test]
    fn load_sequence_scenario() {
        let mut t = Tunables::default();
        t.set_highspeed_freq(1_800_000, &BOUNDS);
        let mut state = UnitState::new(1_000_000);

        let decisions = run(&EngineProfile::SUBLIME, &t, &mut state, &[10, 10, 90, 90, 10]);
        let step = 144_000;
        assert_eq!(
            decisions,
            vec![
                Some(Decision { target: 1_000_000 - step, relation: Relation::AtLeast }),
                Some(Decision { target: 1_000_000 - 2 * step, relation: Relation::AtLeast }),
                Some(Decision { target: 1_800_000, relation: Relation::AtMost }),
                None,
                Some(Decision { target: 1_800_000 - step, relation: Relation::AtLeast }),
            ]
        );
    }

    #[test]
    fn high_speed_jumps_then_micro_steps() {
        let t = Tunables::default();
        let mut state = UnitState::new(500_000);
        let decisions = run(&EngineProfile::SUBLIME, &t, &mut state, &[95, 95, 95, 95]);
        let targets: Vec<u32> = decisions.iter().flatten().map(|d| d.target).collect();
        assert_eq!(targets, vec![1_734_000, 1_788_000, 1_800_000]);
        assert_eq!(decisions[3], None);
    }

    #[test]
    fn boost_overrides_thresholds() {
        let mut t = Tunables::default();
        t.set_input_event_min_freq(1_428_000, &BOUNDS);
        let state = UnitState::new(300_000);

        let out = decide(&EngineProfile::SUBLIME, &t, &BOUNDS, &state, 50, true);
        assert_eq!(out.tier, Tier::Boost);
        assert_eq!(
            out.decision,
            Some(Decision { target: 1_428_000, relation: Relation::AtLeast })
        );
        assert_eq!(out.state.requested_freq, 1_428_000);

        // above the floor the interpolation wins
        assert_eq!(boost_target(&BOUNDS, 90, 1_428_000), 1_650_000);
        assert_eq!(boost_target(&BOUNDS, 50, 0), 1_050_000);
    }

    #[test]
    fn boost_depends_only_on_bounds_load_and_floor() {
        let t = Tunables::default();
        let mut other = Tunables::default();
        other.set_freq_step(0);
        other.set_sampling_down_factor(7).unwrap();
        other.set_highspeed_freq(400_000, &BOUNDS);

        for load in [0, 10, 50, 80, 100] {
            for req in [300_000, 900_000, 1_800_000] {
                let mut state = UnitState::new(req);
                state.down_skip = 3;
                let a = decide(&EngineProfile::SUBLIME, &t, &BOUNDS, &state, load, true);
                let b = decide(&EngineProfile::STEADY, &other, &BOUNDS, &state, load, true);
                assert_eq!(a.decision, b.decision);
                assert_eq!(
                    a.decision.map(|d| d.target),
                    Some(boost_target(&BOUNDS, load, t.input_event_min_freq()))
                );
            }
        }
    }

    #[test]
    fn downshifts_wait_for_sampling_down_factor() {
        let mut t = Tunables::default();
        t.set_sampling_down_factor(3).unwrap();
        let mut state = UnitState::new(1_000_000);

        let decisions = run(&EngineProfile::SUBLIME, &t, &mut state, &[10, 10, 10]);
        assert_eq!(decisions[0], None);
        assert_eq!(decisions[1], None);
        assert!(decisions[2].is_some_and(|d| d.target < 1_000_000));

        // an increase-eligible tick restarts the count
        let decisions = run(&EngineProfile::SUBLIME, &t, &mut state, &[10, 10, 82, 10, 10, 10]);
        assert_eq!(&decisions[..2], &[None, None]);
        assert!(decisions[2].is_some_and(|d| d.target > 856_000));
        assert_eq!(&decisions[3..5], &[None, None]);
        assert!(decisions[5].is_some_and(|d| d.target < 1_000_000));
    }

    #[test]
    fn repeated_threshold_loads_converge() {
        let t = Tunables::default();
        for profile in [EngineProfile::SUBLIME, EngineProfile::PROPORTIONAL, EngineProfile::STEADY] {
            for (load, start) in [
                (t.up_threshold(), BOUNDS.min()),
                (t.down_threshold(), BOUNDS.max()),
            ] {
                let mut state = UnitState::new(start);
                let mut settled = None;
                for tick in 0..64 {
                    let out = decide(&profile, &t, &BOUNDS, &state, load, false);
                    state = out.state;
                    if out.decision.is_none() && tick > 0 {
                        settled = Some(state.requested_freq);
                        break;
                    }
                }
                let settled = settled.expect("never reached a fixed point");
                for _ in 0..8 {
                    let out = decide(&profile, &t, &BOUNDS, &state, load, false);
                    assert_eq!(out.decision, None);
                    state = out.state;
                }
                assert_eq!(state.requested_freq, settled);
            }
        }
    }

    #[test]
    fn zero_freq_step_disables_decreases() {
        let mut t = Tunables::default();
        t.set_freq_step(0);
        let mut state = UnitState::new(1_000_000);
        let decisions = run(&EngineProfile::SUBLIME, &t, &mut state, &[0, 5, 30]);
        assert_eq!(decisions, vec![None, None, None]);
        assert_eq!(state.requested_freq, 1_000_000);

        // increases still fall back to the minimum step
        let decisions = run(&EngineProfile::SUBLIME, &t, &mut state, &[82]);
        assert_eq!(decisions[0].map(|d| d.target), Some(1_000_000 + DEF_FREQ_STEP));
    }

    #[test]
    fn decreases_stop_at_min() {
        let t = Tunables::default();
        let mut state = UnitState::new(350_000);
        let decisions = run(&EngineProfile::SUBLIME, &t, &mut state, &[0, 0]);
        assert_eq!(decisions[0].map(|d| d.target), Some(BOUNDS.min()));
        assert_eq!(decisions[1], None);
    }

    #[test]
    fn steady_profile_ignores_single_spikes() {
        let t = Tunables::default();
        let mut state = UnitState::new(600_000);
        let decisions = run(&EngineProfile::STEADY, &t, &mut state, &[82, 50, 82, 82]);
        assert_eq!(&decisions[..3], &[None, None, None]);
        assert_eq!(decisions[3].map(|d| d.target), Some(744_000));

        // micro bands are off in this profile
        let mut state = UnitState::new(600_000);
        assert_eq!(run(&EngineProfile::STEADY, &t, &mut state, &[75, 30]), vec![None, None]);
    }

    #[test]
    fn proportional_steps_scale_with_distance_and_load() {
        let t = Tunables::default();
        let p = EngineProfile::PROPORTIONAL;

        let up = |load| {
            decide(&p, &t, &BOUNDS, &UnitState::new(300_000), load, false)
                .decision
                .map(|d| d.target)
        };
        assert_eq!(up(90), Some(300_000 + 900_000));
        assert_eq!(up(99), Some(300_000 + 990_000));

        let down = |req, load| {
            decide(&p, &t, &BOUNDS, &UnitState::new(req), load, false)
                .decision
                .map(|d| d.target)
        };
        assert_eq!(down(1_500_000, 5), Some(1_500_000 - 840_000));
        assert_eq!(down(1_500_000, 20), Some(1_500_000 - 720_000));
        // near the floor the minimum delta takes over, then the clamp
        assert_eq!(down(310_000, 5), Some(BOUNDS.min()));
    }

    #[test]
    fn resync_only_when_outside_bounds() {
        let mut state = UnitState::new(1_000_000);
        assert!(!state.resync(500_000, &BOUNDS));
        assert_eq!(state.requested_freq, 1_000_000);

        state.requested_freq = 2_200_000;
        assert!(state.resync(1_700_000, &BOUNDS));
        assert_eq!(state.requested_freq, 1_700_000);

        state.requested_freq = 100_000;
        state.enabled = false;
        assert!(!state.resync(1_700_000, &BOUNDS));
    }

    #[test]
    fn micro_up_steps_toward_high_speed_and_holds() {
        let t = Tunables::default();
        let mut state = UnitState::new(1_650_000);
        // between micro_up and up: 3% of max per tick, capped at highspeed_freq
        let mut tiers = Vec::new();
        let mut targets = Vec::new();
        for _ in 0..3 {
            let out = decide(&EngineProfile::SUBLIME, &t, &BOUNDS, &state, 75, false);
            tiers.push(out.tier);
            targets.push(out.decision.map(|d| (d.target, d.relation)));
            state = out.state;
        }
        assert_eq!(tiers, vec![Tier::MicroUp; 3]);
        assert_eq!(
            targets,
            vec![
                Some((1_704_000, Relation::AtMost)),
                Some((DEF_HIGHSPEED_FREQ, Relation::AtMost)),
                None,
            ]
        );
        assert_eq!(state.requested_freq, DEF_HIGHSPEED_FREQ);

        // the steady profile has no micro tiers and just holds
        let out = decide(&EngineProfile::STEADY, &t, &BOUNDS, &UnitState::new(1_650_000), 75, false);
        assert_eq!(out.decision, None);
    }

    proptest! {
        #[test]
        fn targets_always_inside_bounds(
            writes in prop::collection::vec((0..TUNABLE_NAMES.len(), 0u32..3_000_000), 0..6),
            profile in prop_oneof![
                Just(EngineProfile::SUBLIME),
                Just(EngineProfile::PROPORTIONAL),
                Just(EngineProfile::STEADY),
            ],
            start in 0u32..4_000_000,
            ticks in prop::collection::vec((0u32..=100, any::<bool>()), 1..20),
        ) {
            let mut t = Tunables::default();
            for (name, value) in writes {
                let _ = t.store(TUNABLE_NAMES[name], &value.to_string(), &BOUNDS);
            }
            let mut state = UnitState::new(start);
            for (load, boosted) in ticks {
                let out = decide(&profile, &t, &BOUNDS, &state, load, boosted);
                if let Some(d) = out.decision {
                    prop_assert!(BOUNDS.contains(d.target), "{:?} escaped {:?}", d, BOUNDS);
                    prop_assert_eq!(out.state.requested_freq, d.target);
                }
                state = out.state;
            }
        }
    }
}
