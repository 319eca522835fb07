use std::io::{Error as IoError, ErrorKind};

use sublime_governor::driver::{FrequencyDriver, SysfsCpufreq};
use sublime_governor::engine::Relation;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments: program <cpu> <frequency_khz> [at-least|at-most]
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} <cpu> <frequency_khz> [at-least|at-most]", args[0]);
        eprintln!("  cpu: CPU number as listed in /sys/devices/system/cpu");
        eprintln!("  frequency_khz: Target frequency in kHz");
        eprintln!("  at-least: round up to a supported frequency (default)");
        eprintln!("  at-most: round down to a supported frequency");
        eprintln!();
        eprintln!("Example: sudo {} 2 1400000 at-most", args[0]);
        std::process::exit(1);
    }

    let cpu: usize = args[1]
        .parse()
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, "cpu must be a valid number"))?;
    let target: u32 = args[2]
        .parse()
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, "frequency must be a valid number"))?;
    let relation = match args.get(3).map(|s| s.as_str()) {
        None | Some("at-least") => Relation::AtLeast,
        Some("at-most") => Relation::AtMost,
        Some(other) => Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("unknown relation {other:?}, expected at-least or at-most"),
        ))?,
    };

    let cpufreq = SysfsCpufreq::new();
    let bounds = cpufreq.bounds(cpu)?;
    if !bounds.contains(target) {
        eprintln!(
            "Warning: {} kHz is outside the policy limits [{} - {}] kHz, it will be clamped",
            target, bounds.min(), bounds.max()
        );
    }

    // stays on the userspace governor afterwards, or the setting would not stick
    cpufreq.claim(cpu)?;
    let transition = cpufreq.actuate(cpu, target, relation)?;

    if transition.old == transition.new {
        println!("cpu{} already runs at {} kHz", cpu, transition.new);
    } else {
        println!(
            "✓ cpu{} frequency set from {} kHz to {} kHz",
            cpu, transition.old, transition.new
        );
    }

    Ok(())
}
