//! Resource quantity parsing for usage and request figures
//!
//! Usage comes from the metrics API (`123456789n` CPU, `1048576Ki` memory).
//! Requests come from workload specs (`500m`/`2` CPU, `2Gi`/`512Mi` memory).

/// Split a quantity into its numeric part and suffix
fn split_quantity(raw: &str) -> (f64, &str) {
    let raw = raw.trim();
    let idx = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(idx);
    (number.parse().unwrap_or(0.0), suffix)
}

/// CPU usage in nanocores
pub fn cpu_usage_nanos(raw: &str) -> f64 {
    let (value, suffix) = split_quantity(raw);
    match suffix {
        "n" => value,
        "u" => value * 1_000.0,
        "m" => value * 1_000_000.0,
        _ => value * 1_000_000_000.0,
    }
}

/// Memory usage in KiB
pub fn memory_usage_kib(raw: &str) -> f64 {
    let (value, suffix) = split_quantity(raw);
    match suffix {
        "Ki" => value,
        "Mi" => value * 1024.0,
        "Gi" => value * 1024.0 * 1024.0,
        "" => value / 1024.0,
        _ => 0.0,
    }
}

/// CPU request in millicores. A milli suffix is taken at face value,
/// anything else is whole cores.
pub fn cpu_request_millis(raw: &str) -> f64 {
    let (value, suffix) = split_quantity(raw);
    if suffix == "m" {
        value
    } else {
        value * 1000.0
    }
}

/// Memory request in MiB
pub fn memory_request_mib(raw: &str) -> f64 {
    let (value, suffix) = split_quantity(raw);
    match suffix {
        "Gi" => value * 1024.0,
        "Mi" => value,
        "Ki" => value / 1024.0,
        "" => value / (1024.0 * 1024.0),
        _ => 0.0,
    }
}

/// Percentage of `used` over `requested`; zero when nothing is requested
pub fn usage_percent(used: f64, requested: f64) -> f64 {
    if requested <= 0.0 {
        return 0.0;
    }
    used / requested * 100.0
}

/// CPU usage percentage from summed nanocore usage and millicore requests
pub fn cpu_usage_percent(usage_nanos: f64, request_millis: f64) -> f64 {
    usage_percent(usage_nanos, request_millis * 1_000_000.0)
}

/// Memory usage percentage from summed KiB usage and MiB requests
pub fn memory_usage_percent(usage_kib: f64, request_mib: f64) -> f64 {
    usage_percent(usage_kib, request_mib * 1024.0)
}
