use crate::constants::RESERVED_CPU;
use crate::engine::Relation;
use crate::error::ActuationError;
use crate::events::FreqTransition;
use crate::tunables::PolicyBounds;
use std::collections::BTreeMap;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Platform frequency-transition driver.
pub trait FrequencyDriver: Send + Sync {
    fn bounds(&self, cpu: usize) -> Result<PolicyBounds, IoError>;

    /// Frequency the hardware currently runs at (kHz).
    fn current(&self, cpu: usize) -> Result<u32, IoError>;

    /// Moves `cpu` to `target`, rounding by `relation` when the exact value
    /// is unsupported. The returned transition is authoritative; `old ==
    /// new` means nothing changed.
    fn actuate(
        &self,
        cpu: usize,
        target: u32,
        relation: Relation,
    ) -> Result<FreqTransition, ActuationError>;
}

/// CPU online/offline control.
pub trait CoreControl: Send + Sync {
    fn possible_cpus(&self) -> Result<Vec<usize>, IoError>;
    fn online_cpus(&self) -> Result<Vec<usize>, IoError>;
    fn set_online(&self, cpu: usize, online: bool) -> Result<(), IoError>;
}

/// Picks a supported frequency from an ascending `table`. Targets beyond
/// either end fall back to the nearest edge.
pub fn resolve_frequency(table: &[u32], target: u32, relation: Relation) -> Option<u32> {
    let (first, last) = (*table.first()?, *table.last()?);
    let resolved = match relation {
        Relation::AtLeast => table.iter().copied().find(|&f| f >= target).unwrap_or(last),
        Relation::AtMost => table
            .iter()
            .rev()
            .copied()
            .find(|&f| f <= target)
            .unwrap_or(first),
    };
    Some(resolved)
}

/// Parses kernel cpu lists such as `0-3,5`.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, IoError> {
    let invalid =
        |part: &str| IoError::new(ErrorKind::InvalidData, format!("invalid cpu list entry {part:?}"));
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().map_err(|_| invalid(part))?;
                let hi: usize = hi.parse().map_err(|_| invalid(part))?;
                if lo > hi {
                    return Err(invalid(part));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| invalid(part))?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

fn read_trimmed(path: &Path) -> Result<String, IoError> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

fn read_u32(path: &Path) -> Result<u32, IoError> {
    let raw = read_trimmed(path)?;
    raw.parse().map_err(|_| {
        IoError::new(
            ErrorKind::InvalidData,
            format!("{}: {raw:?} is not an integer", path.display()),
        )
    })
}

/// cpufreq through sysfs, driving each CPU with the `userspace` governor.
pub struct SysfsCpufreq {
    root: PathBuf,
    // previous scaling_governor of every claimed cpu
    claimed: Mutex<BTreeMap<usize, String>>,
    tables: Mutex<BTreeMap<usize, Vec<u32>>>,
}

impl SysfsCpufreq {
    pub fn new() -> Self {
        Self::with_root(SYSFS_CPU_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            claimed: Mutex::new(BTreeMap::new()),
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    fn attr(&self, cpu: usize, name: &str) -> PathBuf {
        self.root.join(format!("cpu{cpu}")).join("cpufreq").join(name)
    }

    /// Switches `cpu` to the `userspace` governor so `scaling_setspeed`
    /// becomes writable. The previous governor is restored by [`release`].
    ///
    /// [`release`]: SysfsCpufreq::release
    pub fn claim(&self, cpu: usize) -> Result<(), IoError> {
        let path = self.attr(cpu, "scaling_governor");
        let previous = read_trimmed(&path)?;
        if previous != "userspace" {
            std::fs::write(&path, "userspace")?;
        }
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(cpu)
            .or_insert(previous);
        Ok(())
    }

    pub fn release(&self, cpu: usize) -> Result<(), IoError> {
        let previous = self
            .claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&cpu);
        match previous {
            Some(governor) if governor != "userspace" => {
                std::fs::write(self.attr(cpu, "scaling_governor"), governor)
            }
            _ => Ok(()),
        }
    }

    /// Restores every claimed cpu, returning the first failure.
    pub fn release_all(&self) -> Result<(), IoError> {
        let cpus: Vec<usize> = self
            .claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        let mut result = Ok(());
        for cpu in cpus {
            if let Err(e) = self.release(cpu) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Ascending supported frequencies; empty when the driver accepts any
    /// value inside the policy limits.
    pub fn available_frequencies(&self, cpu: usize) -> Result<Vec<u32>, IoError> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = tables.get(&cpu) {
            return Ok(table.clone());
        }
        let path = self.attr(cpu, "scaling_available_frequencies");
        let mut table = match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .split_whitespace()
                .map(|f| {
                    f.parse::<u32>().map_err(|_| {
                        IoError::new(ErrorKind::InvalidData, format!("{}: bad entry {f:?}", path.display()))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        table.sort_unstable();
        table.dedup();
        tables.insert(cpu, table.clone());
        Ok(table)
    }

    /// Worst-case transition latency in ns.
    pub fn transition_latency_ns(&self, cpu: usize) -> Result<u32, IoError> {
        read_u32(&self.attr(cpu, "cpuinfo_transition_latency"))
    }
}

impl Default for SysfsCpufreq {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyDriver for SysfsCpufreq {
    fn bounds(&self, cpu: usize) -> Result<PolicyBounds, IoError> {
        let min = read_u32(&self.attr(cpu, "scaling_min_freq"))?;
        let max = read_u32(&self.attr(cpu, "scaling_max_freq"))?;
        Ok(PolicyBounds::new(min, max))
    }

    fn current(&self, cpu: usize) -> Result<u32, IoError> {
        read_u32(&self.attr(cpu, "scaling_cur_freq"))
    }

    fn actuate(
        &self,
        cpu: usize,
        target: u32,
        relation: Relation,
    ) -> Result<FreqTransition, ActuationError> {
        let claimed = self
            .claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&cpu);
        if !claimed {
            return Err(ActuationError::Rejected(format!("cpu{cpu} is not claimed")));
        }

        let bounds = self.bounds(cpu)?;
        let table: Vec<u32> = self
            .available_frequencies(cpu)?
            .into_iter()
            .filter(|f| bounds.contains(*f))
            .collect();
        let new = if table.is_empty() {
            bounds.clamp(target)
        } else {
            resolve_frequency(&table, target, relation)
                .ok_or(ActuationError::Unsupported { cpu, target })?
        };

        let old = self.current(cpu)?;
        if new != old {
            std::fs::write(self.attr(cpu, "scaling_setspeed"), new.to_string())?;
        }
        Ok(FreqTransition { cpu, old, new })
    }
}

/// CPU hotplug through sysfs.
pub struct SysfsHotplug {
    root: PathBuf,
}

impl SysfsHotplug {
    pub fn new() -> Self {
        Self::with_root(SYSFS_CPU_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsHotplug {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreControl for SysfsHotplug {
    fn possible_cpus(&self) -> Result<Vec<usize>, IoError> {
        parse_cpu_list(&read_trimmed(&self.root.join("possible"))?)
    }

    fn online_cpus(&self) -> Result<Vec<usize>, IoError> {
        parse_cpu_list(&read_trimmed(&self.root.join("online"))?)
    }

    fn set_online(&self, cpu: usize, online: bool) -> Result<(), IoError> {
        if cpu == RESERVED_CPU && !online {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("cpu{cpu} is reserved and stays online"),
            ));
        }
        let value = if online { "1" } else { "0" };
        std::fs::write(self.root.join(format!("cpu{cpu}")).join("online"), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Throwaway sysfs-like tree, removed on drop.
    struct FakeSysfs {
        dir: TempDir,
    }

    impl FakeSysfs {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.root().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }

        fn read(&self, rel: &str) -> String {
            std::fs::read_to_string(self.root().join(rel)).unwrap().trim().to_string()
        }

        fn cpufreq(&self, cpu: usize, table: &str) {
            let dir = format!("cpu{cpu}/cpufreq");
            self.write(&format!("{dir}/scaling_governor"), "schedutil\n");
            self.write(&format!("{dir}/scaling_min_freq"), "300000\n");
            self.write(&format!("{dir}/scaling_max_freq"), "1800000\n");
            self.write(&format!("{dir}/scaling_cur_freq"), "1000000\n");
            self.write(&format!("{dir}/scaling_setspeed"), "<unsupported>\n");
            self.write(&format!("{dir}/cpuinfo_transition_latency"), "40000\n");
            if !table.is_empty() {
                self.write(&format!("{dir}/scaling_available_frequencies"), table);
            }
        }
    }

    const TABLE: [u32; 5] = [300_000, 600_000, 1_000_000, 1_400_000, 1_800_000];

    #[test]
    fn resolves_by_relation() {
        assert_eq!(resolve_frequency(&TABLE, 700_000, Relation::AtLeast), Some(1_000_000));
        assert_eq!(resolve_frequency(&TABLE, 700_000, Relation::AtMost), Some(600_000));
        assert_eq!(resolve_frequency(&TABLE, 600_000, Relation::AtLeast), Some(600_000));
        assert_eq!(resolve_frequency(&TABLE, 600_000, Relation::AtMost), Some(600_000));
        assert_eq!(resolve_frequency(&TABLE, 2_000_000, Relation::AtLeast), Some(1_800_000));
        assert_eq!(resolve_frequency(&TABLE, 100_000, Relation::AtMost), Some(300_000));
        assert_eq!(resolve_frequency(&[], 100_000, Relation::AtMost), None);
    }

    #[test]
    fn parses_cpu_lists() {
        assert_eq!(parse_cpu_list("0-3,5\n").unwrap(), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_cpu_list("0").unwrap(), vec![0]);
        assert_eq!(parse_cpu_list("").unwrap(), Vec::<usize>::new());
        assert_eq!(parse_cpu_list("2,0-1,1").unwrap(), vec![0, 1, 2]);
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a-b").is_err());
    }

    #[test]
    fn sysfs_cpufreq_claims_actuates_and_releases() {
        let fs = FakeSysfs::new();
        fs.cpufreq(0, "1800000 300000 1000000 600000 1400000\n");
        let driver = SysfsCpufreq::with_root(fs.root());

        assert!(matches!(
            driver.actuate(0, 700_000, Relation::AtLeast),
            Err(ActuationError::Rejected(_))
        ));

        driver.claim(0).unwrap();
        assert_eq!(fs.read("cpu0/cpufreq/scaling_governor"), "userspace");
        assert_eq!(driver.bounds(0).unwrap(), PolicyBounds::new(300_000, 1_800_000));
        assert_eq!(driver.available_frequencies(0).unwrap(), TABLE.to_vec());
        assert_eq!(driver.transition_latency_ns(0).unwrap(), 40_000);

        let t = driver.actuate(0, 700_000, Relation::AtMost).unwrap();
        assert_eq!(t, FreqTransition { cpu: 0, old: 1_000_000, new: 600_000 });
        assert_eq!(fs.read("cpu0/cpufreq/scaling_setspeed"), "600000");

        driver.release_all().unwrap();
        assert_eq!(fs.read("cpu0/cpufreq/scaling_governor"), "schedutil");
    }

    #[test]
    fn sysfs_cpufreq_without_table_clamps() {
        let fs = FakeSysfs::new();
        fs.cpufreq(2, "");
        let driver = SysfsCpufreq::with_root(fs.root());
        driver.claim(2).unwrap();

        let t = driver.actuate(2, 5_000_000, Relation::AtLeast).unwrap();
        assert_eq!(t.new, 1_800_000);
        let t = driver.actuate(2, 1_000_000, Relation::AtLeast).unwrap();
        assert_eq!(t.old, t.new);
    }

    #[test]
    fn sysfs_hotplug() {
        let fs = FakeSysfs::new();
        fs.write("possible", "0-3\n");
        fs.write("online", "0-1,3\n");
        fs.write("cpu2/online", "0\n");
        let hp = SysfsHotplug::with_root(fs.root());

        assert_eq!(hp.possible_cpus().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(hp.online_cpus().unwrap(), vec![0, 1, 3]);
        hp.set_online(2, true).unwrap();
        assert_eq!(fs.read("cpu2/online"), "1");
        let err = hp.set_online(0, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
