//! Worker thread sizing for the tokio runtime.
//!
//! tokio defaults to the host CPU count, which over-provisions threads inside
//! a container limited to a few cores. Runs before tracing is installed, so
//! the chosen value is returned together with where it came from and logged
//! later by bootstrap.

/// Where the worker thread count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSource {
    Flag,
    Env,
    CgroupV2,
    CgroupV1,
    Host,
}

impl std::fmt::Display for CpuSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CpuSource::Flag => "--worker-threads",
            CpuSource::Env => "HERMES_MESH_CPU_LIMIT",
            CpuSource::CgroupV2 => "cgroup v2",
            CpuSource::CgroupV1 => "cgroup v1",
            CpuSource::Host => "host cpu count",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerThreads {
    pub threads: usize,
    pub source: CpuSource,
}

/// Detection order:
/// 1. explicit `--worker-threads`
/// 2. `HERMES_MESH_CPU_LIMIT` ("4" or "4000m")
/// 3. cgroup v2 `/sys/fs/cgroup/cpu.max`
/// 4. cgroup v1 `cpu.cfs_quota_us` / `cpu.cfs_period_us`
/// 5. `std::thread::available_parallelism()`
pub fn worker_threads(explicit: Option<usize>) -> WorkerThreads {
    let pick = |cores: usize, source| WorkerThreads {
        threads: cores.max(1),
        source,
    };

    if let Some(n) = explicit {
        return pick(n, CpuSource::Flag);
    }

    if let Some(cores) = std::env::var("HERMES_MESH_CPU_LIMIT")
        .ok()
        .and_then(|v| parse_cpu_value(&v))
    {
        return pick(cores, CpuSource::Env);
    }

    if let Some(cores) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .and_then(|max| parse_cgroup_v2_cpu(&max))
    {
        return pick(cores, CpuSource::CgroupV2);
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_v1_cpu(&quota, &period) {
            return pick(cores, CpuSource::CgroupV1);
        }
    }

    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    pick(host, CpuSource::Host)
}

/// "4" is cores, "4000m" is millicores. Fractions round down.
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// `cpu.max` is "quota period", or "max period" when unlimited.
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    cores_from_quota(quota.parse().ok()?, period.parse().ok()?)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    cores_from_quota(quota.trim().parse().ok()?, period.trim().parse().ok()?)
}

fn cores_from_quota(quota: i64, period: i64) -> Option<usize> {
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}
