// Linux-specific helpers: GPU busy percent from DRM sysfs.

/// Highest `gpu_busy_percent` across /sys/class/drm/card*/device (amdgpu, i915 via xe).
/// Returns None when no card exposes it.
pub(super) fn read_gpu_busy_percent_linux() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let entries = std::fs::read_dir("/sys/class/drm").ok()?;
        let mut best: Option<f64> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // card0, card1 ... (skip connectors like card0-DP-1)
            if !name.starts_with("card") || name.contains('-') {
                continue;
            }
            let path = entry.path().join("device/gpu_busy_percent");
            if let Ok(content) = std::fs::read_to_string(&path)
                && let Some(pct) = parse_percent(&content)
            {
                best = Some(best.map_or(pct, |b: f64| b.max(pct)));
            }
        }
        best
    }
    #[cfg(not(target_os = "linux"))]
    None
}

pub(super) fn parse_percent(content: &str) -> Option<f64> {
    let v = content.trim().parse::<f64>().ok()?;
    v.is_finite().then_some(v)
}
