use crate::boost::InputBoost;
use crate::constants::*;
use crate::driver::CoreControl;
use crate::error::StartError;
use crate::events::{EventBus, FreqTransition, HotplugEvent, Subscription};
use crate::sampler::{IdleSource, LoadSampler};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Core-count governor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugState {
    /// Not running, nothing pending.
    Idle,
    /// No boost: looking for a core to offline.
    Disabled,
    /// Boost window open: looking for a core to bring back.
    Enabled,
}

/// What a state change asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCheck {
    Grow,
    Shrink,
}

/// Reaction to a frequency change, given whether a boost window is open.
pub fn next_state(state: HotplugState, boost_active: bool) -> (HotplugState, Option<CoreCheck>) {
    use HotplugState::*;
    match (state, boost_active) {
        (Idle | Disabled, true) => (Enabled, Some(CoreCheck::Grow)),
        (Idle | Enabled, false) => (Disabled, Some(CoreCheck::Shrink)),
        (Disabled, false) => (Disabled, None),
        (Enabled, true) => (Enabled, None),
    }
}

/// True when at least one core runs at or below `balance_level`% of the
/// busiest core's load.
pub fn load_is_skewed(loads: &BTreeMap<usize, u32>, balance_level: u32) -> bool {
    let Some(&highest) = loads.values().max() else {
        return false;
    };
    let limit = u64::from(highest) * u64::from(balance_level) / 100;
    loads.values().any(|&load| u64::from(load) <= limit)
}

/// Least loaded core other than the reserved one. Ties go to the lowest id.
pub fn slowest_cpu(loads: &BTreeMap<usize, u32>) -> Option<usize> {
    loads
        .iter()
        .filter(|&(&cpu, _)| cpu != RESERVED_CPU)
        .min_by_key(|&(&cpu, &load)| (load, cpu))
        .map(|(&cpu, _)| cpu)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreTunables {
    pub up_delay: Duration,
    pub down_delay: Duration,
    pub load_sample_rate: Duration,
    /// Percentage of the busiest core's load at or under which a core
    /// counts as idle enough to offline.
    pub balance_level: u32,
    pub boost_duration: Duration,
}

impl Default for CoreTunables {
    fn default() -> Self {
        Self {
            up_delay: Duration::from_millis(DEF_UP_DELAY_MS),
            down_delay: Duration::from_millis(DEF_DOWN_DELAY_MS),
            load_sample_rate: Duration::from_millis(DEF_LOAD_SAMPLE_MS),
            balance_level: DEF_BALANCE_LEVEL,
            boost_duration: Duration::from_millis(DEF_CORE_BOOST_DURATION_MS),
        }
    }
}

/// State owned by the governor thread. Every method takes the current time
/// so the timing logic stays testable.
struct Controller {
    tunables: CoreTunables,
    state: HotplugState,
    check_at: Option<Instant>,
    load_timer_at: Option<Instant>,
    samplers: BTreeMap<usize, LoadSampler>,
    control: Arc<dyn CoreControl>,
    idle: Arc<dyn IdleSource>,
    bus: EventBus,
}

impl Controller {
    fn new(
        tunables: CoreTunables,
        control: Arc<dyn CoreControl>,
        idle: Arc<dyn IdleSource>,
        bus: EventBus,
    ) -> Self {
        Self {
            tunables,
            state: HotplugState::Idle,
            check_at: None,
            load_timer_at: None,
            samplers: BTreeMap::new(),
            control,
            idle,
            bus,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.check_at, self.load_timer_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn schedule_check(&mut self, at: Instant) {
        self.check_at = Some(self.check_at.map_or(at, |pending| pending.min(at)));
    }

    fn on_frequency_change(&mut self, now: Instant, boost_active: bool) {
        let (next, check) = next_state(self.state, boost_active);
        if next != self.state {
            debug!("core governor: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        match check {
            Some(CoreCheck::Grow) => self.schedule_check(now + self.tunables.up_delay),
            Some(CoreCheck::Shrink) => self.schedule_check(now + self.tunables.down_delay),
            None => {}
        }
        self.start_load_timer(now);
    }

    /// Runs whatever is due at `now`.
    fn on_wake(&mut self, now: Instant) {
        if self.load_timer_at.is_some_and(|at| at <= now) {
            self.sample_loads();
            self.load_timer_at = Some(now + self.tunables.load_sample_rate);
        }
        if self.check_at.is_some_and(|at| at <= now) {
            self.check_at = None;
            self.check_cores(now);
        }
    }

    fn online_cpus(&self) -> Vec<usize> {
        self.control.online_cpus().unwrap_or_else(|e| {
            warn!("core governor: cannot read online cpus: {e}");
            Vec::new()
        })
    }

    fn start_load_timer(&mut self, now: Instant) {
        if self.load_timer_at.is_some() {
            return;
        }
        self.samplers.clear();
        for cpu in self.online_cpus() {
            let mut sampler = LoadSampler::new();
            match self.idle.sample_idle(cpu) {
                Ok(snapshot) => sampler.baseline(snapshot),
                Err(e) => debug!("core governor: cpu{cpu}: idle sample failed: {e}"),
            }
            self.samplers.insert(cpu, sampler);
        }
        self.load_timer_at = Some(now + Duration::from_millis(LOAD_TIMER_FIRST_DELAY_MS));
    }

    fn stop_load_timer(&mut self) {
        self.load_timer_at = None;
    }

    fn sample_loads(&mut self) {
        let online = self.online_cpus();
        self.samplers.retain(|cpu, _| online.contains(cpu));
        for cpu in online {
            let sampler = self.samplers.entry(cpu).or_default();
            match self.idle.sample_idle(cpu) {
                Ok(snapshot) => {
                    sampler.update(snapshot, false);
                }
                Err(e) => debug!("core governor: cpu{cpu}: idle sample failed: {e}"),
            }
        }
    }

    /// Last load of every online core that has completed a sample.
    fn loads(&self) -> BTreeMap<usize, u32> {
        self.samplers
            .iter()
            .filter_map(|(&cpu, s)| s.last_load().map(|load| (cpu, load)))
            .collect()
    }

    fn check_cores(&mut self, now: Instant) {
        match self.state {
            HotplugState::Idle => {}
            HotplugState::Disabled => {
                let loads = self.loads();
                if load_is_skewed(&loads, self.tunables.balance_level) {
                    if let Some(cpu) = slowest_cpu(&loads) {
                        self.set_online(cpu, false);
                    }
                    self.stop_load_timer();
                } else {
                    self.schedule_check(now + self.tunables.down_delay);
                }
            }
            HotplugState::Enabled => {
                if let Some(cpu) = self.first_offline_cpu() {
                    self.set_online(cpu, true);
                }
                self.stop_load_timer();
            }
        }
    }

    fn first_offline_cpu(&self) -> Option<usize> {
        let possible = match self.control.possible_cpus() {
            Ok(cpus) => cpus,
            Err(e) => {
                warn!("core governor: cannot read possible cpus: {e}");
                return None;
            }
        };
        let online = self.online_cpus();
        possible.into_iter().find(|cpu| !online.contains(cpu))
    }

    fn set_online(&mut self, cpu: usize, online: bool) {
        let action = if online { "online" } else { "offline" };
        if let Err(e) = self.control.set_online(cpu, online) {
            warn!("[CORES] cannot bring cpu{cpu} {action}: {e}");
            return;
        }
        if !online {
            self.samplers.remove(&cpu);
        }
        info!("[CORES] cpu{cpu} {action}");
        self.bus.hotplug.notify(&HotplugEvent { cpu, online });
    }

    fn stop(&mut self) {
        self.state = HotplugState::Idle;
        self.check_at = None;
        self.stop_load_timer();
        self.samplers.clear();
    }
}

enum Message {
    FrequencyChanged(Instant),
    Stop,
}

/// Onlines and offlines cores from a single thread, reacting to frequency
/// changes and the input boost window.
pub struct CoreGovernor {
    tx: Sender<Message>,
    worker: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

impl CoreGovernor {
    pub fn start(
        tunables: CoreTunables,
        control: Arc<dyn CoreControl>,
        idle: Arc<dyn IdleSource>,
        bus: &EventBus,
        boost: Arc<InputBoost>,
    ) -> Result<Self, StartError> {
        let (tx, rx) = mpsc::channel();
        let mut controller = Controller::new(tunables, control, idle, bus.clone());

        let worker = thread::Builder::new()
            .name("core-governor".to_string())
            .spawn(move || {
                loop {
                    let received = match controller.next_deadline() {
                        Some(deadline) => {
                            rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                        }
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match received {
                        Ok(Message::FrequencyChanged(at)) => {
                            let boosted = boost.is_active_at(tunables.boost_duration, at);
                            controller.on_frequency_change(at, boosted);
                        }
                        Ok(Message::Stop) | Err(RecvTimeoutError::Disconnected) => {
                            controller.stop();
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    controller.on_wake(Instant::now());
                }
            })
            .map_err(StartError::Spawn)?;

        let events = tx.clone();
        let subscription = bus.frequency.subscribe(move |_: &FreqTransition| {
            let _ = events.send(Message::FrequencyChanged(Instant::now()));
        });

        info!(
            "core governor started (up {} ms, down {} ms)",
            tunables.up_delay.as_millis(),
            tunables.down_delay.as_millis()
        );
        Ok(Self {
            tx,
            worker: Some(worker),
            subscription: Some(subscription),
        })
    }

    /// Unsubscribes, forces the state to idle, then drops pending work.
    /// Blocks until the governor thread has exited.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.subscription.take();
        let _ = self.tx.send(Message::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            debug!("core governor stopped");
        }
    }
}

impl Drop for CoreGovernor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
