/// Container-aware CPU limit for sizing the tokio worker pool.
///
/// A headless-browser fleet usually runs this proxy as a sidecar with a
/// small CPU quota; sizing the pool from the host CPU count would
/// over-provision threads badly on large nodes. Detection order:
/// `HEADLESS_PROXY_CPU_LIMIT` env var, cgroup v2 `cpu.max`, cgroup v1 cfs
/// quota, then the host CPU count.
pub fn get_container_cpu_limit() -> usize {
    if let Some(cores) = std::env::var("HEADLESS_PROXY_CPU_LIMIT")
        .ok()
        .and_then(|v| parse_cpu_value(&v))
    {
        return cores.max(1);
    }

    if let Some(cores) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .and_then(|max| parse_cgroup_v2_cpu(&max))
    {
        return cores.max(1);
    }

    let v1 = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    );
    if let (Ok(quota), Ok(period)) = v1 {
        if let Some(cores) = parse_quota(&quota, &period) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Accepts "4" (cores) or "4000m" (kubernetes millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millicores) => millicores.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max` holds "quota period", or "max period" for unlimited.
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    parse_quota(quota, period)
}

fn parse_quota(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value(" 8 "), Some(8));
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("500m"), Some(0));
        assert_eq!(parse_cpu_value("x"), None);
    }

    #[test]
    fn test_parse_cgroup_v2() {
        assert_eq!(parse_cgroup_v2_cpu("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2_cpu("max 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu(""), None);
    }

    #[test]
    fn test_parse_quota() {
        assert_eq!(parse_quota("200000", "100000"), Some(2));
        assert_eq!(parse_quota("-1", "100000"), None);
        assert_eq!(parse_quota("0", "100000"), None);
    }
}
