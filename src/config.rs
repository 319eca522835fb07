use crate::constants::*;
use crate::engine::{EngineProfile, StepMode};
use crate::hotplug::CoreTunables;
use crate::tunables::{PolicyBounds, Tunables, default_sampling_rate, min_sampling_rate_for_hz};
use log::{LevelFilter, debug, warn};
use std::path::PathBuf;
use std::time::Duration;
use toml::Table;

/// Daemon configuration. Every key is optional; invalid values are
/// reported and replaced with their default.
#[derive(Debug, Clone)]
pub struct Config {
    pub profile: EngineProfile,
    /// `[frequency]` tunables in attribute form, applied on top of the
    /// platform defaults by [`Config::tunables`].
    pub frequency: Vec<(&'static str, String)>,
    pub cores: Option<CoreTunables>,
    pub platform_hz: u32,
    pub log_level: LevelFilter,
    pub transition_log_interval: Duration,
    pub input_devices: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: EngineProfile::default(),
            frequency: Vec::new(),
            cores: Some(CoreTunables::default()),
            platform_hz: DEF_PLATFORM_HZ,
            log_level: LevelFilter::Info,
            transition_log_interval: Duration::from_secs(DEF_TRANSITION_LOG_INTERVAL_SECS),
            input_devices: Vec::new(),
        }
    }
}

fn section<'a>(table: Option<&'a Table>, key: &str) -> Option<&'a Table> {
    table.and_then(|t| t.get(key)).and_then(|t| t.as_table())
}

/// `Ok(None)` when the key is absent.
fn unsigned(table: Option<&Table>, key: &str) -> Result<Option<u32>, &'static str> {
    let Some(value) = table.and_then(|t| t.get(key)) else {
        return Ok(None);
    };
    value
        .as_integer()
        .ok_or("must be an integer")
        .and_then(|v| (!v.is_negative()).then_some(v).ok_or("must not be negative"))
        .and_then(|v| {
            u32::try_from(v).map_err(|_| "cannot be greater than 4294967295")
        })
        .map(Some)
}

fn millis(table: Option<&Table>, key: &str, path: &str, default: u64) -> Duration {
    let ms = unsigned(table, key)
        .and_then(|v| v.ok_or("is missing"))
        .map(u64::from)
        .unwrap_or_else(|s| {
            if s == "is missing" {
                debug!("{path} {s}, using the default of {default} ms");
            } else {
                warn!("{path} {s}, replaced with the default of {default} ms");
            }
            default
        });
    Duration::from_millis(ms)
}

// (toml key, tunable name)
const FREQUENCY_KEYS: &[(&str, &str)] = &[
    ("sampling-rate", "sampling_rate"),
    ("sampling-down-factor", "sampling_down_factor"),
    ("highspeed-up-threshold", "highspeed_up_threshold"),
    ("up-threshold", "up_threshold"),
    ("micro-up-threshold", "micro_up_threshold"),
    ("down-threshold", "down_threshold"),
    ("micro-down-threshold", "micro_down_threshold"),
    ("freq-step", "freq_step"),
    ("micro-freq-step", "micro_freq_step"),
    ("highspeed-freq", "highspeed_freq"),
];

// validated as one set
const THRESHOLD_NAMES: &[&str] = &[
    "highspeed_up_threshold",
    "up_threshold",
    "micro_up_threshold",
    "down_threshold",
    "micro_down_threshold",
];

impl Config {
    pub fn parse(config: &Table) -> Self {
        let mut parsed = Config::default();
        let root = Some(config);

        let frequency = section(root, "frequency");
        parsed.profile = frequency
            .and_then(|t| t.get("profile"))
            .map(|v| {
                v.as_str()
                    .ok_or("must be a string")
                    .and_then(|name| {
                        EngineProfile::from_name(name)
                            .ok_or("must be one of \"sublime\", \"proportional\" or \"steady\"")
                    })
                    .unwrap_or_else(|s| {
                        warn!("frequency.profile {s}, replaced with the default of \"sublime\"");
                        EngineProfile::default()
                    })
            })
            .unwrap_or_default();

        for &(key, name) in FREQUENCY_KEYS {
            match unsigned(frequency, key) {
                Ok(Some(v)) => parsed.frequency.push((name, v.to_string())),
                Ok(None) => {}
                Err(s) => warn!("frequency.{key} {s}, replaced with the default value"),
            }
        }
        if let Some(v) = frequency.and_then(|t| t.get("ignore-nice-load")) {
            match v.as_bool() {
                Some(b) => parsed
                    .frequency
                    .push(("ignore_nice_load", u32::from(b).to_string())),
                None => warn!("frequency.ignore-nice-load must be a boolean, replaced with false"),
            }
        }

        let boost = section(frequency, "boost");
        for (key, name) in [("min-freq", "input_event_min_freq"), ("duration-ms", "input_event_duration")] {
            match unsigned(boost, key) {
                Ok(Some(v)) => parsed.frequency.push((name, v.to_string())),
                Ok(None) => {}
                Err(s) => warn!("frequency.boost.{key} {s}, replaced with the default value"),
            }
        }

        if let StepMode::Proportional { .. } = parsed.profile.step {
            let proportional = section(frequency, "proportional");
            let resistance = unsigned(proportional, "resistance")
                .map(|v| v.unwrap_or(DEF_PROPORTIONAL_RESISTANCE))
                .and_then(|v| (v > 0).then_some(v).ok_or("must be positive"))
                .unwrap_or_else(|s| {
                    warn!(
                        "frequency.proportional.resistance {s}, replaced with the default of \
                        {DEF_PROPORTIONAL_RESISTANCE}"
                    );
                    DEF_PROPORTIONAL_RESISTANCE
                });
            let down_bias = unsigned(proportional, "down-bias")
                .map(|v| v.unwrap_or(DEF_PROPORTIONAL_DOWN_BIAS))
                .and_then(|v| (v <= 100).then_some(v).ok_or("cannot be greater than 100"))
                .unwrap_or_else(|s| {
                    warn!(
                        "frequency.proportional.down-bias {s}, replaced with the default of \
                        {DEF_PROPORTIONAL_DOWN_BIAS}"
                    );
                    DEF_PROPORTIONAL_DOWN_BIAS
                });
            parsed.profile.step = StepMode::Proportional {
                resistance,
                down_bias,
            };
        }

        let cores = section(root, "cores");
        let cores_enabled = cores
            .and_then(|t| t.get("enabled"))
            .map(|v| {
                v.as_bool().unwrap_or_else(|| {
                    warn!("cores.enabled must be a boolean, replaced with the default of true");
                    true
                })
            })
            .unwrap_or(true);
        parsed.cores = cores_enabled.then(|| CoreTunables {
            up_delay: millis(cores, "up-delay-ms", "cores.up-delay-ms", DEF_UP_DELAY_MS),
            down_delay: millis(cores, "down-delay-ms", "cores.down-delay-ms", DEF_DOWN_DELAY_MS),
            load_sample_rate: {
                let rate = millis(cores, "load-sample-ms", "cores.load-sample-ms", DEF_LOAD_SAMPLE_MS);
                if rate.is_zero() {
                    warn!("cores.load-sample-ms must be positive, replaced with the default of {DEF_LOAD_SAMPLE_MS} ms");
                    Duration::from_millis(DEF_LOAD_SAMPLE_MS)
                } else {
                    rate
                }
            },
            balance_level: unsigned(cores, "balance-level")
                .map(|v| v.unwrap_or(DEF_BALANCE_LEVEL))
                .and_then(|v| (v <= 100).then_some(v).ok_or("cannot be greater than 100"))
                .unwrap_or_else(|s| {
                    warn!("cores.balance-level {s}, replaced with the default of {DEF_BALANCE_LEVEL}");
                    DEF_BALANCE_LEVEL
                }),
            boost_duration: millis(
                cores,
                "boost-duration-ms",
                "cores.boost-duration-ms",
                DEF_CORE_BOOST_DURATION_MS,
            ),
        });

        parsed.platform_hz = unsigned(section(root, "platform"), "hz")
            .map(|v| v.unwrap_or(DEF_PLATFORM_HZ))
            .and_then(|v| (v > 0).then_some(v).ok_or("must be positive"))
            .unwrap_or_else(|s| {
                warn!("platform.hz {s}, replaced with the default of {DEF_PLATFORM_HZ}");
                DEF_PLATFORM_HZ
            });

        let logging = section(root, "log");
        parsed.log_level = logging
            .and_then(|t| t.get("level"))
            .map(|v| {
                v.as_str()
                    .ok_or("must be a string")
                    .and_then(|s| s.parse::<LevelFilter>().map_err(|_| "is not a log level"))
                    .unwrap_or_else(|s| {
                        warn!("log.level {s}, replaced with the default of \"info\"");
                        LevelFilter::Info
                    })
            })
            .unwrap_or(LevelFilter::Info);
        parsed.transition_log_interval = Duration::from_secs(
            unsigned(logging, "transition-interval-s")
                .map(|v| v.map_or(DEF_TRANSITION_LOG_INTERVAL_SECS, u64::from))
                .unwrap_or_else(|s| {
                    warn!(
                        "log.transition-interval-s {s}, replaced with the default of \
                        {DEF_TRANSITION_LOG_INTERVAL_SECS} second"
                    );
                    DEF_TRANSITION_LOG_INTERVAL_SECS
                }),
        );

        parsed.input_devices = section(root, "input")
            .and_then(|t| t.get("devices"))
            .map(|v| {
                v.as_array()
                    .ok_or("must be an array of paths")
                    .and_then(|devices| {
                        devices
                            .iter()
                            .map(|d| d.as_str().map(PathBuf::from).ok_or("must be an array of paths"))
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .unwrap_or_else(|s| {
                        warn!("input.devices {s}, input boost disabled");
                        Vec::new()
                    })
            })
            .unwrap_or_default();

        parsed
    }

    /// Reads the file at `path`; no path means all defaults.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let table = path
            .map(std::fs::read_to_string)
            .unwrap_or(Ok(String::new()))?
            .parse::<Table>()?;
        Ok(Self::parse(&table))
    }

    /// Builds the frequency tunables for a platform whose slowest
    /// transition takes `transition_latency_ns`, applying the configured
    /// values on top. Rejected values keep their defaults; if the
    /// configured thresholds do not form a consistent set, all of them do.
    pub fn tunables(&self, transition_latency_ns: u32, bounds: &PolicyBounds) -> Tunables {
        let min = min_sampling_rate_for_hz(self.platform_hz);
        let mut tunables = Tunables::new(min, default_sampling_rate(min, transition_latency_ns));

        let (thresholds, others): (Vec<_>, Vec<_>) = self
            .frequency
            .iter()
            .cloned()
            .partition(|(name, _)| THRESHOLD_NAMES.contains(name));
        let mut candidate = tunables.clone();
        let errors = candidate.store_all(&thresholds, bounds);
        if errors.is_empty() {
            tunables = candidate;
        } else {
            let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            warn!(
                "frequency: inconsistent thresholds ({}), using the default thresholds",
                reasons.join("; ")
            );
        }

        for error in tunables.store_all(&others, bounds) {
            warn!("frequency: {error}, keeping the default value");
        }
        tunables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Config {
        Config::parse(&s.parse::<Table>().unwrap())
    }

    const BOUNDS: PolicyBounds = PolicyBounds::new(300_000, 1_800_000);

    #[test]
    fn empty_config_is_all_defaults() {
        let config = parse("");
        assert_eq!(config.profile, EngineProfile::SUBLIME);
        assert!(config.frequency.is_empty());
        assert_eq!(config.cores, Some(CoreTunables::default()));
        assert_eq!(config.platform_hz, DEF_PLATFORM_HZ);
        assert_eq!(config.log_level, LevelFilter::Info);
        assert!(config.input_devices.is_empty());

        let t = config.tunables(0, &BOUNDS);
        assert_eq!(t, Tunables::default());
    }

    #[test]
    fn full_config() {
        let config = parse(
            r#"
            [frequency]
            profile = "proportional"
            sampling-rate = 50000
            up-threshold = 75
            down-threshold = 20
            ignore-nice-load = true
            highspeed-freq = 9000000

            [frequency.boost]
            min-freq = 1200000
            duration-ms = 9000

            [frequency.proportional]
            resistance = 200
            down-bias = 5

            [cores]
            up-delay-ms = 10
            balance-level = 30

            [platform]
            hz = 250

            [log]
            level = "debug"
            transition-interval-s = 0

            [input]
            devices = ["/dev/input/event2"]
            "#,
        );
        assert_eq!(
            config.profile.step,
            StepMode::Proportional {
                resistance: 200,
                down_bias: 5
            }
        );
        let cores = config.cores.unwrap();
        assert_eq!(cores.up_delay, Duration::from_millis(10));
        assert_eq!(cores.down_delay, Duration::from_millis(DEF_DOWN_DELAY_MS));
        assert_eq!(cores.balance_level, 30);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.transition_log_interval, Duration::ZERO);
        assert_eq!(config.input_devices, vec![PathBuf::from("/dev/input/event2")]);

        let t = config.tunables(0, &BOUNDS);
        // 2 * 10 ticks of 4 ms
        assert_eq!(t.min_sampling_rate(), 80_000);
        assert_eq!(t.sampling_rate(), 80_000);
        assert_eq!(t.up_threshold(), 75);
        assert_eq!(t.down_threshold(), 20);
        assert!(t.ignore_nice_load());
        assert_eq!(t.highspeed_freq(), 1_800_000);
        assert_eq!(t.input_event_min_freq(), 1_200_000);
        assert_eq!(t.input_event_duration(), MAX_INPUT_EVENT_DURATION_MS);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = parse(
            r#"
            [frequency]
            profile = "turbo"
            up-threshold = -5
            freq-step = "eight"
            sampling-rate = 5000000000

            [cores]
            load-sample-ms = 0
            balance-level = 400

            [platform]
            hz = 0

            [log]
            level = "loud"
            "#,
        );
        assert_eq!(config.profile, EngineProfile::SUBLIME);
        assert!(config.frequency.is_empty());
        let cores = config.cores.unwrap();
        assert_eq!(cores.load_sample_rate, Duration::from_millis(DEF_LOAD_SAMPLE_MS));
        assert_eq!(cores.balance_level, DEF_BALANCE_LEVEL);
        assert_eq!(config.platform_hz, DEF_PLATFORM_HZ);
        assert_eq!(config.log_level, LevelFilter::Info);

        let table: Table = "big = 5000000000".parse().unwrap();
        assert_eq!(
            unsigned(Some(&table), "big"),
            Err("cannot be greater than 4294967295")
        );
    }

    #[test]
    fn inconsistent_thresholds_keep_defaults() {
        let config = parse(
            r#"
            [frequency]
            up-threshold = 30
            down-threshold = 75
            "#,
        );
        let t = config.tunables(0, &BOUNDS);
        assert_eq!(t.up_threshold(), DEF_UP_THRESHOLD);
        assert_eq!(t.down_threshold(), DEF_DOWN_THRESHOLD);
    }

    #[test]
    fn thresholds_are_applied_as_a_set() {
        // up alone would be accepted, micro-up then cannot fit under it
        let config = parse(
            r#"
            [frequency]
            up-threshold = 75
            micro-up-threshold = 78
            freq-step = 12
            "#,
        );
        let t = config.tunables(0, &BOUNDS);
        assert_eq!(t.up_threshold(), DEF_UP_THRESHOLD);
        assert_eq!(t.micro_up_threshold(), DEF_MICRO_UP_THRESHOLD);
        // unrelated keys still apply
        assert_eq!(t.freq_step(), 12);
    }

    #[test]
    fn cores_can_be_disabled() {
        assert_eq!(parse("[cores]\nenabled = false").cores, None);
    }

    #[test]
    fn transition_latency_raises_the_default_rate() {
        // 40 us worst case transition
        let t = parse("").tunables(40_000, &BOUNDS);
        assert_eq!(t.sampling_rate(), 40_000);
    }
}
