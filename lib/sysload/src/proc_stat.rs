use crate::Error;

const PROC_STAT: &str = "/proc/stat";
const USER_HZ: u64 = 100;
// user, nice, system, idle, iowait, irq, softirq
const CPU_FIELDS: usize = 7;

/// Total CPU time spent by the whole machine, in nanoseconds.
pub(crate) fn system_cpu_nanos() -> Result<u64, Error> {
    let content = std::fs::read_to_string(PROC_STAT).map_err(|source| Error::Read {
        path: PROC_STAT.to_string(),
        source,
    })?;

    parse_system_cpu(&content).ok_or_else(|| Error::Format {
        path: PROC_STAT.to_string(),
        line: content.lines().next().unwrap_or_default().to_string(),
    })
}

pub(crate) fn parse_system_cpu(content: &str) -> Option<u64> {
    for line in content.lines() {
        let mut fields = line.split_ascii_whitespace();
        if fields.next() != Some("cpu") {
            continue;
        }

        let mut ticks = 0u64;
        let mut seen = 0;
        for field in fields.take(CPU_FIELDS) {
            ticks += field.parse::<u64>().ok()?;
            seen += 1;
        }
        if seen < CPU_FIELDS {
            return None;
        }

        return Some(ticks * (1_000_000_000 / USER_HZ));
    }

    None
}
