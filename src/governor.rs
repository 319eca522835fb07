use crate::boost::InputBoost;
use crate::constants::{
    DEF_TRANSITION_LOG_INTERVAL_SECS, LIMITS_REFRESH_TICKS, SAMPLE_ERROR_LOG_INTERVAL_SECS,
};
use crate::driver::FrequencyDriver;
use crate::engine::{EngineProfile, Relation, Tier, UnitState, decide};
use crate::error::{ActuationError, StartError, TunableError};
use crate::events::{EventBus, FreqTransition, HotplugEvent, Subscription};
use crate::sampler::{IdleSource, LoadSampler};
use crate::store::TunableStore;
use crate::tunables::{PolicyBounds, Tunables};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// At most one log line per `min_interval`.
struct LogThrottle {
    last_log: Option<Instant>,
    min_interval: Duration,
    suppressed: u64,
}

impl LogThrottle {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_log: None,
            min_interval,
            suppressed: 0,
        }
    }

    /// Lines dropped since the last one let through.
    fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }

    fn should_log(&mut self) -> bool {
        let now = Instant::now();
        if self
            .last_log
            .is_none_or(|last| now.duration_since(last) >= self.min_interval)
        {
            self.last_log = Some(now);
            true
        } else {
            self.suppressed += 1;
            false
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything the frequency governor needs besides its collaborators.
pub struct GovernorSettings {
    pub profile: EngineProfile,
    pub tunables: Tunables,
    pub transition_log_interval: Duration,
    /// Accepted runtime writes are saved here when set.
    pub store: Option<TunableStore>,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            profile: EngineProfile::default(),
            tunables: Tunables::default(),
            transition_log_interval: Duration::from_secs(DEF_TRANSITION_LOG_INTERVAL_SECS),
            store: None,
        }
    }
}

struct Unit {
    bounds: PolicyBounds,
    state: UnitState,
    sampler: LoadSampler,
    log: LogThrottle,
    errors: LogThrottle,
    ticks_since_limits: u32,
}

struct Shared {
    profile: EngineProfile,
    tunables: RwLock<Tunables>,
    units: BTreeMap<usize, Mutex<Unit>>,
    driver: Arc<dyn FrequencyDriver>,
    idle: Arc<dyn IdleSource>,
    boost: Arc<InputBoost>,
    bus: EventBus,
    store: Option<TunableStore>,
    stopping: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn tunables(&self) -> Tunables {
        self.tunables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sleeps for `timeout` or until stop is requested. Returns true when
    /// the worker should exit.
    fn sleep(&self, timeout: Duration) -> bool {
        let stopping = lock(&self.stopping);
        let (stopping, _) = self
            .wake
            .wait_timeout_while(stopping, timeout, |stopping| !*stopping)
            .unwrap_or_else(|e| e.into_inner());
        *stopping
    }

    fn request_stop(&self) {
        *lock(&self.stopping) = true;
        self.wake.notify_all();
    }

    fn span(&self) -> PolicyBounds {
        let bounds: Vec<PolicyBounds> = self.units.values().map(|u| lock(u).bounds).collect();
        PolicyBounds::spanning(&bounds).unwrap_or(PolicyBounds::new(0, u32::MAX))
    }

    /// One sample/decide/actuate pass. The unit stays locked for the whole
    /// pass; the resulting transition is published after the lock is gone
    /// so frequency listeners may lock the unit themselves.
    fn tick(&self, cpu: usize) -> Option<FreqTransition> {
        let t = self.tunables();
        let unit = self.units.get(&cpu)?;
        self.refresh_limits(cpu, unit);

        let transition = {
            let mut unit = lock(unit);
            if !unit.state.enabled {
                return None;
            }
            let snapshot = match self.idle.sample_idle(cpu) {
                Ok(s) => s,
                Err(e) => {
                    if unit.errors.should_log() {
                        match unit.errors.take_suppressed() {
                            0 => warn!("cpu{cpu}: idle sample failed: {e}"),
                            n => warn!("cpu{cpu}: idle sample failed: {e} ({n} similar failures not shown)"),
                        }
                    }
                    return None;
                }
            };
            let load = unit.sampler.update(snapshot, t.ignore_nice_load())?;
            let window = Duration::from_millis(u64::from(t.input_event_duration()));
            let boosted = self.boost.is_active(window);

            let outcome = decide(&self.profile, &t, &unit.bounds, &unit.state, load, boosted);
            let before = unit.state.requested_freq;
            unit.state = outcome.state;
            let decision = outcome.decision?;

            match self.driver.actuate(cpu, decision.target, decision.relation) {
                Ok(transition) => {
                    log_transition(&mut unit.log, &transition, load, outcome.tier);
                    transition
                }
                Err(e) => {
                    unit.state.requested_freq = before;
                    warn!(
                        "cpu{cpu}: cannot set {} kHz ({}): {e}",
                        decision.target,
                        outcome.tier.describe()
                    );
                    return None;
                }
            }
        };

        if transition.old == transition.new {
            return None;
        }
        self.bus.frequency.notify(&transition);
        Some(transition)
    }

    /// Re-reads the driver's limits every `LIMITS_REFRESH_TICKS` ticks and
    /// installs them when something else changed them.
    fn refresh_limits(&self, cpu: usize, unit: &Mutex<Unit>) {
        let known = {
            let mut unit = lock(unit);
            if !unit.state.enabled {
                return;
            }
            unit.ticks_since_limits += 1;
            if unit.ticks_since_limits < LIMITS_REFRESH_TICKS {
                return;
            }
            unit.ticks_since_limits = 0;
            unit.bounds
        };
        match self.driver.bounds(cpu) {
            Ok(bounds) if bounds != known => {
                info!(
                    "cpu{cpu}: limits changed to {} - {} kHz",
                    bounds.min(),
                    bounds.max()
                );
                if let Err(e) = self.apply_limits(cpu, bounds) {
                    warn!("cpu{cpu}: cannot move inside the new limits: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => debug!("cpu{cpu}: cannot read limits: {e}"),
        }
    }

    fn apply_limits(&self, cpu: usize, bounds: PolicyBounds) -> Result<(), ActuationError> {
        let unit = self
            .units
            .get(&cpu)
            .ok_or_else(|| ActuationError::Rejected(format!("cpu{cpu} is not governed")))?;

        let transition = {
            let mut unit = lock(unit);
            unit.bounds = bounds;
            let requested = unit.state.requested_freq;
            if !unit.state.enabled || bounds.contains(requested) {
                return Ok(());
            }
            let relation = if requested > bounds.max() {
                Relation::AtMost
            } else {
                Relation::AtLeast
            };
            let target = bounds.clamp(requested);
            let transition = self.driver.actuate(cpu, target, relation)?;
            unit.state.requested_freq = target;
            transition
        };

        if transition.old != transition.new {
            self.bus.frequency.notify(&transition);
        }
        Ok(())
    }

    fn on_transition(&self, transition: &FreqTransition) {
        let Some(unit) = self.units.get(&transition.cpu) else {
            return;
        };
        let mut unit = lock(unit);
        let bounds = unit.bounds;
        if unit.state.resync(transition.new, &bounds) {
            debug!(
                "cpu{}: requested frequency resynced to {} kHz",
                transition.cpu, transition.new
            );
        }
    }

    fn on_hotplug(&self, event: &HotplugEvent) {
        let Some(unit) = self.units.get(&event.cpu) else {
            return;
        };
        let mut unit = lock(unit);
        if !event.online {
            unit.state.enabled = false;
            unit.sampler.reset();
            debug!("cpu{}: offline, governance paused", event.cpu);
            return;
        }

        let bounds = unit.bounds;
        let mut state = UnitState::new(unit.state.requested_freq);
        match self.driver.current(event.cpu) {
            Ok(current) => state.requested_freq = bounds.clamp(current),
            Err(e) => warn!("cpu{}: cannot read current frequency: {e}", event.cpu),
        }
        unit.state = state;
        unit.sampler.reset();
        match self.idle.sample_idle(event.cpu) {
            Ok(snapshot) => unit.sampler.baseline(snapshot),
            Err(e) => warn!("cpu{}: idle sample failed: {e}", event.cpu),
        }
        debug!(
            "cpu{}: online, governing from {} kHz",
            event.cpu, unit.state.requested_freq
        );
    }

    fn rebaseline_all(&self) {
        for (&cpu, unit) in &self.units {
            let mut unit = lock(unit);
            unit.sampler.reset();
            if !unit.state.enabled {
                continue;
            }
            match self.idle.sample_idle(cpu) {
                Ok(snapshot) => unit.sampler.baseline(snapshot),
                Err(e) => warn!("cpu{cpu}: idle sample failed: {e}"),
            }
        }
    }
}

fn log_transition(throttle: &mut LogThrottle, t: &FreqTransition, load: u32, tier: Tier) {
    if t.old == t.new {
        return;
    }
    let arrow = if t.new > t.old { '↑' } else { '↓' };
    debug!(
        "cpu{}: {} {arrow} {} kHz, load {load}%, {}",
        t.cpu,
        t.old,
        t.new,
        tier.describe()
    );
    if throttle.should_log() {
        info!(
            "[FREQ] cpu{}: {} kHz {arrow} {} kHz | Load: {load}% | Reason: {}",
            t.cpu,
            t.old,
            t.new,
            tier.describe()
        );
    }
}

/// Per-core frequency governor: one worker thread per unit, each ticking
/// at `sampling_rate`.
pub struct FrequencyGovernor {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
}

impl FrequencyGovernor {
    /// Starts governing every unit in `units`, or nothing at all.
    pub fn start(
        settings: GovernorSettings,
        units: BTreeMap<usize, PolicyBounds>,
        driver: Arc<dyn FrequencyDriver>,
        idle: Arc<dyn IdleSource>,
        bus: &EventBus,
        boost: Arc<InputBoost>,
    ) -> Result<Self, StartError> {
        let span = PolicyBounds::spanning(units.values()).ok_or(StartError::NoUnits)?;

        let mut tunables = settings.tunables;
        let highspeed = tunables.highspeed_freq();
        tunables.set_highspeed_freq(highspeed, &span);
        let input_min = tunables.input_event_min_freq();
        tunables.set_input_event_min_freq(input_min, &span);

        let mut governed = BTreeMap::new();
        for (cpu, bounds) in units {
            let snapshot = idle
                .sample_idle(cpu)
                .map_err(|source| StartError::Sampling { cpu, source })?;
            let current = driver
                .current(cpu)
                .map_err(|source| StartError::Sampling { cpu, source })?;
            let mut sampler = LoadSampler::new();
            sampler.baseline(snapshot);
            governed.insert(
                cpu,
                Mutex::new(Unit {
                    bounds,
                    state: UnitState::new(bounds.clamp(current)),
                    sampler,
                    log: LogThrottle::new(settings.transition_log_interval),
                    errors: LogThrottle::new(Duration::from_secs(SAMPLE_ERROR_LOG_INTERVAL_SECS)),
                    ticks_since_limits: 0,
                }),
            );
        }

        let shared = Arc::new(Shared {
            profile: settings.profile,
            tunables: RwLock::new(tunables),
            units: governed,
            driver,
            idle,
            boost,
            bus: bus.clone(),
            store: settings.store,
            stopping: Mutex::new(false),
            wake: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(shared.units.len());
        for &cpu in shared.units.keys() {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("freq-cpu{cpu}"))
                .spawn(move || {
                    loop {
                        let rate = worker
                            .tunables
                            .read()
                            .unwrap_or_else(|e| e.into_inner())
                            .sampling_rate();
                        if worker.sleep(Duration::from_micros(u64::from(rate))) {
                            break;
                        }
                        worker.tick(cpu);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.request_stop();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(StartError::Spawn(e));
                }
            }
        }

        let on_freq = Arc::clone(&shared);
        let on_hotplug = Arc::clone(&shared);
        let subscriptions = vec![
            bus.frequency
                .subscribe(move |t: &FreqTransition| on_freq.on_transition(t)),
            bus.hotplug
                .subscribe(move |e: &HotplugEvent| on_hotplug.on_hotplug(e)),
        ];

        info!(
            "frequency governor started on {} cpu(s), sampling every {} us",
            shared.units.len(),
            shared.tunables().sampling_rate()
        );
        Ok(Self {
            shared,
            workers,
            subscriptions,
        })
    }

    /// Governed cpus in ascending order.
    pub fn cpus(&self) -> Vec<usize> {
        self.shared.units.keys().copied().collect()
    }

    pub fn unit_state(&self, cpu: usize) -> Option<UnitState> {
        self.shared.units.get(&cpu).map(|u| lock(u).state)
    }

    pub fn bounds(&self, cpu: usize) -> Option<PolicyBounds> {
        self.shared.units.get(&cpu).map(|u| lock(u).bounds)
    }

    pub fn tunables(&self) -> Tunables {
        self.shared.tunables()
    }

    /// Runs one evaluation of `cpu` right away, serialized with its worker.
    /// Returns the transition when the frequency actually moved.
    pub fn evaluate_now(&self, cpu: usize) -> Option<FreqTransition> {
        self.shared.tick(cpu)
    }

    pub fn show_tunable(&self, name: &str) -> Option<String> {
        self.shared
            .tunables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .show(name)
    }

    /// Validated runtime write. Frequencies are clamped into the span of
    /// all governed units' limits.
    pub fn store_tunable(&self, name: &str, raw: &str) -> Result<(), TunableError> {
        let span = self.shared.span();
        let (nice_changed, snapshot) = {
            let mut t = self
                .shared
                .tunables
                .write()
                .unwrap_or_else(|e| e.into_inner());
            let before = t.ignore_nice_load();
            t.store(name, raw, &span)?;
            (before != t.ignore_nice_load(), t.clone())
        };
        if nice_changed {
            self.shared.rebaseline_all();
        }
        if let Some(store) = &self.shared.store {
            if let Err(e) = store.save(&snapshot) {
                warn!("cannot save tunables to {}: {e}", store.path().display());
            }
        }
        Ok(())
    }

    /// Installs new policy limits for `cpu`. A requested frequency left
    /// outside them is pulled back in immediately.
    pub fn update_limits(&self, cpu: usize, bounds: PolicyBounds) -> Result<(), ActuationError> {
        self.shared.apply_limits(cpu, bounds)
    }

    /// Blocks until every worker has finished its current tick and exited.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.subscriptions.clear();
        self.shared.request_stop();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if !self.shared.units.is_empty() {
            debug!("frequency governor stopped");
        }
    }
}

impl Drop for FrequencyGovernor {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}
