use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;

/// Cumulative time counters of one CPU, in µs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleSnapshot {
    pub idle_us: u64,
    pub nice_us: u64,
    pub wall_us: u64,
}

/// Supplies monotonic idle/wall counters per CPU. May be called
/// concurrently for different CPUs.
pub trait IdleSource: Send + Sync {
    fn sample_idle(&self, cpu: usize) -> Result<IdleSnapshot, IoError>;
}

/// Busy percentage over an interval, `None` when the interval is empty or
/// the counters are inconsistent.
pub fn load_percent(idle_delta: u64, wall_delta: u64) -> Option<u32> {
    if wall_delta == 0 || wall_delta < idle_delta {
        return None;
    }
    Some((100 * (wall_delta - idle_delta) / wall_delta) as u32)
}

/// Turns successive counter snapshots of one CPU into load percentages.
#[derive(Debug, Default, Clone)]
pub struct LoadSampler {
    prev: Option<IdleSnapshot>,
    last_load: Option<u32>,
}

impl LoadSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts accounting from `snapshot`; the next update measures from here.
    pub fn baseline(&mut self, snapshot: IdleSnapshot) {
        self.prev = Some(snapshot);
    }

    /// Forgets everything, including the last computed load.
    pub fn reset(&mut self) {
        self.prev = None;
        self.last_load = None;
    }

    pub fn has_baseline(&self) -> bool {
        self.prev.is_some()
    }

    pub fn last_load(&self) -> Option<u32> {
        self.last_load
    }

    /// Load since the previous snapshot. Nice time counts as idle when
    /// `ignore_nice` is set.
    pub fn update(&mut self, snapshot: IdleSnapshot, ignore_nice: bool) -> Option<u32> {
        let prev = self.prev.replace(snapshot)?;

        let wall = snapshot.wall_us.saturating_sub(prev.wall_us);
        let mut idle = snapshot.idle_us.saturating_sub(prev.idle_us);
        if ignore_nice {
            idle += snapshot.nice_us.saturating_sub(prev.nice_us);
        }

        let load = load_percent(idle, wall)?;
        self.last_load = Some(load);
        Some(load)
    }
}

// USER_HZ is 100 on every architecture Linux exports /proc/stat for
const USEC_PER_USER_TICK: u64 = 10_000;

/// Idle counters read from `/proc/stat`.
pub struct ProcStatIdle {
    path: PathBuf,
}

impl ProcStatIdle {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcStatIdle {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleSource for ProcStatIdle {
    fn sample_idle(&self, cpu: usize) -> Result<IdleSnapshot, IoError> {
        let stat = std::fs::read_to_string(&self.path)?;
        parse_cpu_line(&stat, cpu)
    }
}

/// Extracts the counters of `cpu` from `/proc/stat` content.
///
/// Line format: `cpuN user nice system idle iowait irq softirq steal guest guest_nice`.
/// Idle includes iowait; guest time is already part of user time and is
/// left out of the wall total.
pub fn parse_cpu_line(stat: &str, cpu: usize) -> Result<IdleSnapshot, IoError> {
    let label = format!("cpu{cpu}");
    let line = stat
        .lines()
        .find(|line| line.split_whitespace().next() == Some(label.as_str()))
        .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("{label} missing from /proc/stat")))?;

    let nums: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|s| s.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("{label}: {e}")))?;

    if nums.len() < 5 {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("{label}: invalid /proc/stat format"),
        ));
    }

    let wall: u64 = nums.iter().take(8).sum();
    Ok(IdleSnapshot {
        idle_us: (nums[3] + nums[4]) * USEC_PER_USER_TICK,
        nice_us: nums[1] * USEC_PER_USER_TICK,
        wall_us: wall * USEC_PER_USER_TICK,
    })
}
