use std::{
    collections::BTreeMap,
    io::{Error as IoError, ErrorKind},
    path::PathBuf,
    sync::{Arc, mpsc},
    time::Instant,
};

use evdev::Device;
use log::{error, info, warn};
use sublime_governor::{
    boost::{InputBoost, classify_input},
    config::Config,
    driver::{CoreControl, FrequencyDriver, SysfsCpufreq, SysfsHotplug},
    events::{EventBus, InputEvent},
    governor::{FrequencyGovernor, GovernorSettings},
    hotplug::CoreGovernor,
    sampler::ProcStatIdle,
    store::TunableStore,
    tunables::PolicyBounds,
};

/// Installs the terminal logger at `Info`. `main` lowers or raises the
/// level through `log::set_max_level` once the config is read.
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Trace,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    log::set_max_level(log::LevelFilter::Info);
    Ok(())
}

/// Publishes activity from one input device until reading it fails.
fn spawn_input_reader(path: PathBuf, bus: EventBus) -> Result<(), IoError> {
    let mut device = Device::open(&path)?;
    let name = format!("input-{}", path.display());
    std::thread::Builder::new().name(name).spawn(move || {
        loop {
            let events = match device.fetch_events() {
                Ok(events) => events,
                Err(e) => {
                    warn!("{}: input reader stopped: {e}", path.display());
                    return;
                }
            };
            // one notification per batch
            if let Some(kind) = events.filter_map(|e| classify_input(&e)).last() {
                bus.input.notify(&InputEvent {
                    at: Instant::now(),
                    kind,
                });
            }
        }
    })?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;
    let config = Config::load(std::env::args().nth(1).as_deref())?;
    log::set_max_level(config.log_level);

    let cpufreq = Arc::new(SysfsCpufreq::new());
    let hotplug = Arc::new(SysfsHotplug::new());
    let idle = Arc::new(ProcStatIdle::new());

    let online = hotplug.online_cpus()?;
    let mut units = BTreeMap::new();
    // ns
    let mut latency = 0;
    for &cpu in &online {
        let claimed = cpufreq
            .claim(cpu)
            .and_then(|()| cpufreq.bounds(cpu))
            .map(|bounds| (bounds, cpufreq.transition_latency_ns(cpu).unwrap_or(0)));
        match claimed {
            Ok((bounds, cpu_latency)) => {
                units.insert(cpu, bounds);
                latency = latency.max(cpu_latency);
            }
            Err(e) => warn!("cpu{cpu}: not governed: {e}"),
        }
    }
    let Some(span) = PolicyBounds::spanning(units.values()) else {
        cpufreq.release_all()?;
        return Err(IoError::new(
            ErrorKind::NotFound,
            "no cpu exposes a usable cpufreq policy",
        )
        .into());
    };

    let store = TunableStore::new();
    let mut tunables = config.tunables(latency, &span);
    if let Err(e) = store.restore(&mut tunables, &span) {
        warn!("cannot restore saved tunables: {e}");
    }

    let bus = EventBus::new();
    let boost = Arc::new(InputBoost::new());
    let input_subscription = boost.attach(&bus);

    let settings = GovernorSettings {
        profile: config.profile,
        tunables,
        transition_log_interval: config.transition_log_interval,
        store: Some(store.clone()),
    };
    let frequency = match FrequencyGovernor::start(
        settings,
        units,
        Arc::clone(&cpufreq) as Arc<dyn FrequencyDriver>,
        idle.clone(),
        &bus,
        Arc::clone(&boost),
    ) {
        Ok(governor) => governor,
        Err(e) => {
            cpufreq.release_all()?;
            return Err(e.into());
        }
    };

    let cores = match config.cores {
        Some(tunables) => {
            match CoreGovernor::start(
                tunables,
                Arc::clone(&hotplug) as Arc<dyn CoreControl>,
                idle.clone(),
                &bus,
                Arc::clone(&boost),
            ) {
                Ok(governor) => Some(governor),
                Err(e) => {
                    error!("core governor disabled: {e}");
                    None
                }
            }
        }
        None => None,
    };

    for device in &config.input_devices {
        if let Err(e) = spawn_input_reader(device.clone(), bus.clone()) {
            warn!("{}: cannot read input events: {e}", device.display());
        }
    }

    let (send, recv) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = send.send(());
    })?;
    info!(
        "governing {} cpu(s), press Ctrl-C to stop",
        frequency.cpus().len()
    );
    let _ = recv.recv();

    info!("shutting down");
    drop(input_subscription);
    if let Some(cores) = cores {
        cores.stop();
    }
    let tunables = frequency.tunables();
    frequency.stop();

    // leave every core that was online at start online again
    let now_online = hotplug.online_cpus().unwrap_or_default();
    for cpu in online.into_iter().filter(|cpu| !now_online.contains(cpu)) {
        if let Err(e) = hotplug.set_online(cpu, true) {
            warn!("cpu{cpu}: cannot bring back online: {e}");
        }
    }
    if let Err(e) = cpufreq.release_all() {
        warn!("cannot restore cpufreq governors: {e}");
    }
    if let Err(e) = store.save(&tunables) {
        warn!("cannot save tunables to {}: {e}", store.path().display());
    }
    Ok(())
}
