//! Host report: load, memory, disk, uptime, temperature, address.
//! Every field is best-effort and simply absent when unreadable.

use std::{net::Ipv4Addr, path::Path};

use serde::Serialize;

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageBytes {
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

impl UsageBytes {
    fn new(total: u64, used: u64) -> Self {
        Self {
            total,
            used,
            percent: percent(used, total),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostReport {
    pub cpu_cores: usize,
    pub load_avg: Option<[f64; 3]>,
    /// 1-minute load relative to core count.
    pub cpu_percent: Option<f64>,
    pub memory: Option<UsageBytes>,
    pub disk: Option<UsageBytes>,
    pub uptime_secs: Option<u64>,
    pub temperature_c: Option<f64>,
    pub local_ipv4: Option<Ipv4Addr>,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let p = part as f64 / whole as f64 * 100.0;
    (p * 10.0).round() / 10.0
}

pub(crate) fn parse_loadavg(s: &str) -> Option<[f64; 3]> {
    let mut it = s.split_whitespace();
    let a = it.next()?.parse().ok()?;
    let b = it.next()?.parse().ok()?;
    let c = it.next()?.parse().ok()?;
    Some([a, b, c])
}

/// Returns `(total, used)` in bytes, where used excludes reclaimable memory.
pub(crate) fn parse_meminfo(s: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        s.lines().find_map(|line| {
            line.strip_prefix(name)
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|v| v.parse::<u64>().ok())
        })
    };
    let total_kb = field("MemTotal:")?;
    let available_kb = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    let total = total_kb.saturating_mul(1024);
    let used = total_kb.saturating_sub(available_kb).saturating_mul(1024);
    Some((total, used))
}

pub(crate) fn parse_uptime(s: &str) -> Option<u64> {
    let secs: f64 = s.split_whitespace().next()?.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(secs as u64)
}

pub(crate) fn parse_thermal_millidegrees(s: &str) -> Option<f64> {
    let milli: i64 = s.trim().parse().ok()?;
    let c = milli as f64 / 1000.0;
    Some((c * 10.0).round() / 10.0)
}

#[cfg(unix)]
fn disk_usage(p: &Path) -> Option<UsageBytes> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).ok()?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return None;
    }
    let frsize = s.f_frsize as u64;
    let total = (s.f_blocks as u64).saturating_mul(frsize);
    let free = (s.f_bfree as u64).saturating_mul(frsize);
    Some(UsageBytes::new(total, total.saturating_sub(free)))
}

#[cfg(not(unix))]
fn disk_usage(_p: &Path) -> Option<UsageBytes> {
    None
}

/// First IPv4 address on a non-loopback interface.
#[cfg(unix)]
fn local_ipv4() -> Option<Ipv4Addr> {
    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return None;
    }

    let mut found = None;
    let mut cur = addrs;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_addr.is_null() || ifa.ifa_flags & (libc::IFF_LOOPBACK as libc::c_uint) != 0 {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
        if family != libc::AF_INET {
            continue;
        }
        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        break;
    }

    unsafe { libc::freeifaddrs(addrs) };
    found
}

#[cfg(not(unix))]
fn local_ipv4() -> Option<Ipv4Addr> {
    None
}

async fn read(path: &str) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

pub async fn collect(disk_path: &Path) -> HostReport {
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let load_avg = read("/proc/loadavg").await.as_deref().and_then(parse_loadavg);
    let cpu_percent = load_avg.map(|l| {
        let p = l[0] / cpu_cores as f64 * 100.0;
        (p * 10.0).round() / 10.0
    });

    let memory = read("/proc/meminfo")
        .await
        .as_deref()
        .and_then(parse_meminfo)
        .map(|(total, used)| UsageBytes::new(total, used));

    HostReport {
        cpu_cores,
        load_avg,
        cpu_percent,
        memory,
        disk: disk_usage(disk_path),
        uptime_secs: read("/proc/uptime").await.as_deref().and_then(parse_uptime),
        temperature_c: read(THERMAL_ZONE)
            .await
            .as_deref()
            .and_then(parse_thermal_millidegrees),
        local_ipv4: local_ipv4(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loadavg_takes_first_three_fields() {
        let l = parse_loadavg("0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert_eq!(l, [0.52, 0.58, 0.59]);
        assert!(parse_loadavg("0.5").is_none());
    }

    #[test]
    fn meminfo_prefers_mem_available() {
        let s = "MemTotal:        3884128 kB\nMemFree:          211124 kB\nMemAvailable:    1942064 kB\n";
        let (total, used) = parse_meminfo(s).unwrap();
        assert_eq!(total, 3884128 * 1024);
        assert_eq!(used, (3884128 - 1942064) * 1024);
    }

    #[test]
    fn meminfo_falls_back_to_mem_free() {
        let s = "MemTotal: 1000 kB\nMemFree: 250 kB\n";
        assert_eq!(parse_meminfo(s), Some((1000 * 1024, 750 * 1024)));
        assert!(parse_meminfo("MemFree: 250 kB\n").is_none());
    }

    #[test]
    fn uptime_truncates_fraction() {
        assert_eq!(parse_uptime("35094.33 130045.20\n"), Some(35094));
        assert_eq!(parse_uptime("garbage"), None);
    }

    #[test]
    fn thermal_zone_is_millidegrees() {
        assert_eq!(parse_thermal_millidegrees("48312\n"), Some(48.3));
        assert_eq!(parse_thermal_millidegrees(""), None);
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 3), 33.3);
    }

    #[tokio::test]
    async fn collect_never_fails() {
        let report = collect(Path::new("/")).await;
        assert!(report.cpu_cores >= 1);
        if let Some(disk) = report.disk {
            assert!(disk.used <= disk.total);
        }
    }
}
