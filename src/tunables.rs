use crate::constants::*;
use crate::error::TunableError;

/// Frequency limits of one governed unit, in kHz. Always `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyBounds {
    min: u32,
    max: u32,
}

impl PolicyBounds {
    /// Reversed limits are swapped rather than rejected.
    pub const fn new(min: u32, max: u32) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn clamp(&self, freq: u32) -> u32 {
        freq.clamp(self.min, self.max)
    }

    pub fn contains(&self, freq: u32) -> bool {
        (self.min..=self.max).contains(&freq)
    }

    /// Smallest bounds covering every unit, `None` when there are none.
    pub fn spanning<'a>(bounds: impl IntoIterator<Item = &'a PolicyBounds>) -> Option<Self> {
        bounds.into_iter().fold(None, |acc, b| match acc {
            None => Some(*b),
            Some(acc) => Some(Self {
                min: acc.min.min(b.min),
                max: acc.max.max(b.max),
            }),
        })
    }
}

/// Every writable tunable, in the order they are shown.
pub const TUNABLE_NAMES: &[&str] = &[
    "sampling_rate",
    "sampling_down_factor",
    "highspeed_up_threshold",
    "up_threshold",
    "micro_up_threshold",
    "down_threshold",
    "micro_down_threshold",
    "ignore_nice_load",
    "freq_step",
    "micro_freq_step",
    "highspeed_freq",
    "input_event_min_freq",
    "input_event_duration",
];

/// Lower bound for `sampling_rate` in µs for a platform ticking at `hz`.
pub fn min_sampling_rate_for_hz(hz: u32) -> u32 {
    let tick_us = 1_000_000 / hz.max(1);
    MIN_SAMPLING_RATE_RATIO * MIN_SAMPLING_RATE_TICKS * tick_us.max(1)
}

/// Default `sampling_rate` from the driver's transition latency (ns).
pub fn default_sampling_rate(min_sampling_rate: u32, transition_latency_ns: u32) -> u32 {
    let latency_us = (transition_latency_ns / 1_000).max(1);
    latency_us
        .saturating_mul(LATENCY_MULTIPLIER)
        .max(min_sampling_rate)
}

/// Frequency governor tunables.
///
/// Values only change through the setters, which keep
/// `down_threshold < micro_up_threshold < up_threshold < highspeed_up_threshold`
/// and `micro_down_threshold < up_threshold`. A refused write leaves the
/// set untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    sampling_rate: u32,
    sampling_down_factor: u32,
    highspeed_up_threshold: u32,
    up_threshold: u32,
    micro_up_threshold: u32,
    down_threshold: u32,
    micro_down_threshold: u32,
    ignore_nice_load: bool,
    freq_step: u32,
    micro_freq_step: u32,
    highspeed_freq: u32,
    input_event_min_freq: u32,
    input_event_duration: u32,
    min_sampling_rate: u32,
}

impl Tunables {
    pub fn new(min_sampling_rate: u32, sampling_rate: u32) -> Self {
        Self {
            sampling_rate: sampling_rate.max(min_sampling_rate),
            sampling_down_factor: DEF_SAMPLING_DOWN_FACTOR,
            highspeed_up_threshold: DEF_HIGHSPEED_UP_THRESHOLD,
            up_threshold: DEF_UP_THRESHOLD,
            micro_up_threshold: DEF_MICRO_UP_THRESHOLD,
            down_threshold: DEF_DOWN_THRESHOLD,
            micro_down_threshold: DEF_MICRO_DOWN_THRESHOLD,
            ignore_nice_load: false,
            freq_step: DEF_FREQ_STEP,
            micro_freq_step: DEF_MICRO_FREQ_STEP,
            highspeed_freq: DEF_HIGHSPEED_FREQ,
            input_event_min_freq: DEF_INPUT_EVENT_MIN_FREQ,
            input_event_duration: DEF_INPUT_EVENT_DURATION_MS,
            min_sampling_rate,
        }
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    pub fn min_sampling_rate(&self) -> u32 {
        self.min_sampling_rate
    }

    pub fn sampling_down_factor(&self) -> u32 {
        self.sampling_down_factor
    }

    pub fn highspeed_up_threshold(&self) -> u32 {
        self.highspeed_up_threshold
    }

    pub fn up_threshold(&self) -> u32 {
        self.up_threshold
    }

    pub fn micro_up_threshold(&self) -> u32 {
        self.micro_up_threshold
    }

    pub fn down_threshold(&self) -> u32 {
        self.down_threshold
    }

    pub fn micro_down_threshold(&self) -> u32 {
        self.micro_down_threshold
    }

    pub fn ignore_nice_load(&self) -> bool {
        self.ignore_nice_load
    }

    pub fn freq_step(&self) -> u32 {
        self.freq_step
    }

    pub fn micro_freq_step(&self) -> u32 {
        self.micro_freq_step
    }

    pub fn highspeed_freq(&self) -> u32 {
        self.highspeed_freq
    }

    pub fn input_event_min_freq(&self) -> u32 {
        self.input_event_min_freq
    }

    /// Boost window length in ms.
    pub fn input_event_duration(&self) -> u32 {
        self.input_event_duration
    }

    pub fn set_sampling_rate(&mut self, us: u32) {
        self.sampling_rate = us.max(self.min_sampling_rate);
    }

    pub fn set_sampling_down_factor(&mut self, factor: u32) -> Result<(), TunableError> {
        if !(1..=MAX_SAMPLING_DOWN_FACTOR).contains(&factor) {
            return Err(TunableError::OutOfRange {
                name: "sampling_down_factor",
                value: factor,
            });
        }
        self.sampling_down_factor = factor;
        Ok(())
    }

    pub fn set_highspeed_up_threshold(&mut self, value: u32) -> Result<(), TunableError> {
        let name = "highspeed_up_threshold";
        check_percent(name, value)?;
        if value <= self.up_threshold {
            return Err(TunableError::Ordering { name, value });
        }
        self.highspeed_up_threshold = value;
        Ok(())
    }

    pub fn set_up_threshold(&mut self, value: u32) -> Result<(), TunableError> {
        let name = "up_threshold";
        check_percent(name, value)?;
        if value <= self.micro_up_threshold
            || value <= self.micro_down_threshold
            || value >= self.highspeed_up_threshold
        {
            return Err(TunableError::Ordering { name, value });
        }
        self.up_threshold = value;
        Ok(())
    }

    pub fn set_micro_up_threshold(&mut self, value: u32) -> Result<(), TunableError> {
        let name = "micro_up_threshold";
        check_percent(name, value)?;
        if value <= self.down_threshold || value >= self.up_threshold {
            return Err(TunableError::Ordering { name, value });
        }
        self.micro_up_threshold = value;
        Ok(())
    }

    pub fn set_down_threshold(&mut self, value: u32) -> Result<(), TunableError> {
        let name = "down_threshold";
        // below 11 the frequency would never fall
        if !(MIN_DOWN_THRESHOLD..=100).contains(&value) {
            return Err(TunableError::OutOfRange { name, value });
        }
        if value >= self.micro_up_threshold {
            return Err(TunableError::Ordering { name, value });
        }
        self.down_threshold = value;
        Ok(())
    }

    pub fn set_micro_down_threshold(&mut self, value: u32) -> Result<(), TunableError> {
        let name = "micro_down_threshold";
        check_percent(name, value)?;
        if value >= self.up_threshold {
            return Err(TunableError::Ordering { name, value });
        }
        self.micro_down_threshold = value;
        Ok(())
    }

    /// Returns true when the value actually changed.
    pub fn set_ignore_nice_load(&mut self, value: u32) -> bool {
        let value = value > 0;
        let changed = value != self.ignore_nice_load;
        self.ignore_nice_load = value;
        changed
    }

    /// Zero is accepted and turns decreases off.
    pub fn set_freq_step(&mut self, percent: u32) {
        self.freq_step = percent.min(100);
    }

    pub fn set_micro_freq_step(&mut self, percent: u32) {
        self.micro_freq_step = percent.clamp(1, MAX_MICRO_FREQ_STEP);
    }

    pub fn set_highspeed_freq(&mut self, khz: u32, bounds: &PolicyBounds) {
        self.highspeed_freq = bounds.clamp(khz);
    }

    pub fn set_input_event_min_freq(&mut self, khz: u32, bounds: &PolicyBounds) {
        self.input_event_min_freq = bounds.clamp(khz);
    }

    pub fn set_input_event_duration(&mut self, ms: u32) {
        self.input_event_duration = ms.min(MAX_INPUT_EVENT_DURATION_MS);
    }

    /// Attribute-style read. `sampling_rate_min` is readable but not writable.
    pub fn show(&self, name: &str) -> Option<String> {
        let value = match name {
            "sampling_rate" => self.sampling_rate,
            "sampling_rate_min" => self.min_sampling_rate,
            "sampling_down_factor" => self.sampling_down_factor,
            "highspeed_up_threshold" => self.highspeed_up_threshold,
            "up_threshold" => self.up_threshold,
            "micro_up_threshold" => self.micro_up_threshold,
            "down_threshold" => self.down_threshold,
            "micro_down_threshold" => self.micro_down_threshold,
            "ignore_nice_load" => u32::from(self.ignore_nice_load),
            "freq_step" => self.freq_step,
            "micro_freq_step" => self.micro_freq_step,
            "highspeed_freq" => self.highspeed_freq,
            "input_event_min_freq" => self.input_event_min_freq,
            "input_event_duration" => self.input_event_duration,
            _ => return None,
        };
        Some(value.to_string())
    }

    /// Attribute-style write of a raw string. Frequencies are clamped into
    /// `bounds`, which the caller must supply.
    pub fn store(&mut self, name: &str, raw: &str, bounds: &PolicyBounds) -> Result<(), TunableError> {
        let Some(&name) = TUNABLE_NAMES.iter().find(|&&n| n == name) else {
            return Err(TunableError::Unknown(name.to_string()));
        };
        let value = raw
            .trim()
            .parse::<u32>()
            .map_err(|_| TunableError::Malformed {
                name,
                raw: raw.to_string(),
            })?;

        match name {
            "sampling_rate" => self.set_sampling_rate(value),
            "sampling_down_factor" => self.set_sampling_down_factor(value)?,
            "highspeed_up_threshold" => self.set_highspeed_up_threshold(value)?,
            "up_threshold" => self.set_up_threshold(value)?,
            "micro_up_threshold" => self.set_micro_up_threshold(value)?,
            "down_threshold" => self.set_down_threshold(value)?,
            "micro_down_threshold" => self.set_micro_down_threshold(value)?,
            "ignore_nice_load" => {
                self.set_ignore_nice_load(value);
            }
            "freq_step" => self.set_freq_step(value),
            "micro_freq_step" => self.set_micro_freq_step(value),
            "highspeed_freq" => self.set_highspeed_freq(value, bounds),
            "input_event_min_freq" => self.set_input_event_min_freq(value, bounds),
            "input_event_duration" => self.set_input_event_duration(value),
            _ => return Err(TunableError::Unknown(name.to_string())),
        }
        Ok(())
    }

    /// Applies a batch of writes. Threshold writes that conflict with each
    /// other only because of their order are retried until nothing more
    /// can be applied; the errors left over are returned.
    pub fn store_all(
        &mut self,
        entries: &[(&str, String)],
        bounds: &PolicyBounds,
    ) -> Vec<TunableError> {
        let mut pending: Vec<&(&str, String)> = entries.iter().collect();
        loop {
            let mut errors = Vec::new();
            let mut left = Vec::new();
            for entry in &pending {
                if let Err(e) = self.store(entry.0, &entry.1, bounds) {
                    errors.push(e);
                    left.push(*entry);
                }
            }
            if left.is_empty() || left.len() == pending.len() {
                return errors;
            }
            pending = left;
        }
    }

    /// Every writable tunable with its current value.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        TUNABLE_NAMES
            .iter()
            .filter_map(|&name| self.show(name).map(|v| (name, v)))
            .collect()
    }
}

impl Default for Tunables {
    fn default() -> Self {
        let min = min_sampling_rate_for_hz(DEF_PLATFORM_HZ);
        Self::new(min, min)
    }
}

fn check_percent(name: &'static str, value: u32) -> Result<(), TunableError> {
    if value > 100 {
        return Err(TunableError::OutOfRange { name, value });
    }
    Ok(())
}
