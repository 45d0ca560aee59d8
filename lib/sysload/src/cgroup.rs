use std::path::{Path, PathBuf};

use crate::Error;

const V2_ROOT: &str = "/sys/fs/cgroup";
const V1_CPU_ROOT: &str = "/sys/fs/cgroup/cpu";
const V1_CPUACCT_ROOT: &str = "/sys/fs/cgroup/cpuacct";

/// The subset of the cgroup hierarchy the probe needs: the CFS quota and
/// the accumulated CPU time of this process's group.
pub(crate) enum CGroup {
    V2 { root: PathBuf },
    V1 { cpu: PathBuf, cpuacct: PathBuf },
}

impl CGroup {
    pub(crate) fn detect() -> Result<Self, Error> {
        let v2 = Path::new(V2_ROOT).join("cgroup.controllers");
        if v2.exists() {
            return Ok(CGroup::V2 {
                root: PathBuf::from(V2_ROOT),
            });
        }

        let v1 = Path::new(V1_CPU_ROOT);
        if v1.exists() {
            return Ok(CGroup::V1 {
                cpu: v1.to_path_buf(),
                cpuacct: PathBuf::from(V1_CPUACCT_ROOT),
            });
        }

        Err(Error::NoCgroup)
    }

    /// The CFS limit expressed in cores, `None` when unrestricted.
    pub(crate) fn cpu_limit(&self) -> Result<Option<f64>, Error> {
        match self {
            CGroup::V2 { root } => {
                let content = read_file(&root.join("cpu.max"))?;
                Ok(parse_cpu_max(&content))
            }
            CGroup::V1 { cpu, .. } => {
                let quota: i64 = read_number(&cpu.join("cpu.cfs_quota_us"))?;
                if quota <= 0 {
                    return Ok(None);
                }
                let period: u64 = read_number(&cpu.join("cpu.cfs_period_us"))?;
                if period == 0 {
                    return Ok(None);
                }

                Ok(Some(quota as f64 / period as f64))
            }
        }
    }

    /// Accumulated CPU time of the group in nanoseconds.
    pub(crate) fn usage_nanos(&self) -> Result<u64, Error> {
        match self {
            CGroup::V2 { root } => {
                let path = root.join("cpu.stat");
                let content = read_file(&path)?;
                parse_usage_usec(&content)
                    .map(|usec| usec * 1_000)
                    .ok_or_else(|| Error::Format {
                        path: path.display().to_string(),
                        line: "usage_usec".to_string(),
                    })
            }
            CGroup::V1 { cpuacct, .. } => read_number(&cpuacct.join("cpuacct.usage")),
        }
    }
}

/// `cpu.max` holds `max 100000` (unrestricted) or `<quota> <period>` in
/// microseconds.
pub(crate) fn parse_cpu_max(content: &str) -> Option<f64> {
    let mut fields = content.split_ascii_whitespace();
    let quota = fields.next()?;
    if quota == "max" {
        return None;
    }

    let quota: f64 = quota.parse().ok()?;
    let period: f64 = fields.next()?.parse().ok()?;
    if period <= 0.0 {
        return None;
    }

    Some(quota / period)
}

pub(crate) fn parse_usage_usec(content: &str) -> Option<u64> {
    for line in content.lines() {
        let mut fields = line.split_ascii_whitespace();
        if fields.next() == Some("usage_usec") {
            return fields.next()?.parse().ok();
        }
    }

    None
}

fn read_file(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Result<T, Error> {
    let content = read_file(path)?;
    content.trim().parse().map_err(|_| Error::Format {
        path: path.display().to_string(),
        line: content.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_max_unrestricted() {
        assert_eq!(parse_cpu_max("max 100000\n"), None);
    }

    #[test]
    fn cpu_max_half_core() {
        let limit = parse_cpu_max("50000 100000\n").unwrap();
        assert!((limit - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_max_two_cores() {
        let limit = parse_cpu_max("200000 100000\n").unwrap();
        assert!((limit - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn usage_usec_extracted() {
        let content = "usage_usec 4731\nuser_usec 3921\nsystem_usec 810\n";
        assert_eq!(parse_usage_usec(content), Some(4731));
    }

    #[test]
    fn usage_usec_missing() {
        assert_eq!(parse_usage_usec("user_usec 12\n"), None);
    }
}
