// Host metrics via sysinfo

use super::{MetricsSource, SamplerError, linux};
use crate::models::RawMetrics;
use std::sync::Mutex;
use std::time::Instant;
use sysinfo::{Disks, Networks, System};
use tracing::instrument;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct SysinfoSource {
    sys: Mutex<System>,
    disks: Mutex<Disks>,
    networks: Mutex<Networks>,
    /// (when, cpu usage) of the last real CPU refresh.
    last_cpu_refresh: Mutex<Option<(Instant, f64)>>,
    /// When disk and network counters were last refreshed (rates are deltas over this).
    last_io_refresh: Mutex<Instant>,
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        let disks = Disks::new_with_refreshed_list();
        let networks = Networks::new_with_refreshed_list();
        Self {
            sys: Mutex::new(sys),
            disks: Mutex::new(disks),
            networks: Mutex::new(networks),
            last_cpu_refresh: Mutex::new(None),
            last_io_refresh: Mutex::new(Instant::now()),
        }
    }

    fn cpu_and_memory(&self) -> Result<(f64, f64), SamplerError> {
        let mut sys = self.sys.lock().map_err(poisoned)?;
        let mut last = self.last_cpu_refresh.lock().map_err(poisoned)?;

        let now = Instant::now();
        let cpu = match *last {
            Some((prev_ts, prev_usage))
                if now.duration_since(prev_ts) < sysinfo::MINIMUM_CPU_UPDATE_INTERVAL =>
            {
                // Too soon for a meaningful delta; reuse without blocking
                prev_usage
            }
            _ => {
                sys.refresh_cpu_all();
                let usage = sys.global_cpu_usage() as f64;
                *last = Some((now, usage));
                usage
            }
        };

        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return Err(SamplerError::MetricsUnavailable(
                "total memory reported as 0".into(),
            ));
        }
        let used = total.saturating_sub(sys.available_memory());
        Ok((cpu, (used as f64 / total as f64) * 100.0))
    }

    /// (usage %, read MB/s, write MB/s, download MB/s, upload MB/s)
    fn disk_and_network(&self) -> Result<(f64, f64, f64, f64, f64), SamplerError> {
        let mut disks = self.disks.lock().map_err(poisoned)?;
        let mut networks = self.networks.lock().map_err(poisoned)?;
        let mut last_io = self.last_io_refresh.lock().map_err(poisoned)?;

        disks.refresh(false);
        networks.refresh(true);
        let now = Instant::now();
        let dt_secs = now.duration_since(*last_io).as_secs_f64();
        *last_io = now;

        let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
            (t + d.total_space(), a + d.available_space())
        });
        let disk_usage = if total > 0 {
            (total.saturating_sub(available) as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let (read_bytes, written_bytes) = disks.list().iter().fold((0u64, 0u64), |(r, w), d| {
            let u = d.usage();
            (r + u.read_bytes, w + u.written_bytes)
        });
        let (rx, tx) = networks
            .list()
            .values()
            .fold((0u64, 0u64), |(r, t), data| {
                (r + data.received(), t + data.transmitted())
            });

        let rate = |bytes: u64| {
            if dt_secs > 0.0 {
                bytes as f64 / BYTES_PER_MB / dt_secs
            } else {
                0.0
            }
        };
        Ok((
            disk_usage,
            rate(read_bytes),
            rate(written_bytes),
            rate(rx),
            rate(tx),
        ))
    }
}

impl MetricsSource for SysinfoSource {
    #[instrument(skip(self), fields(source = "sysinfo", operation = "read"))]
    fn read(&self, _device_id: &str) -> Result<RawMetrics, SamplerError> {
        let (cpu_usage, memory_usage) = self.cpu_and_memory()?;
        let (disk_usage, disk_read_speed, disk_write_speed, network_download, network_upload) =
            self.disk_and_network()?;
        Ok(RawMetrics {
            cpu_usage,
            memory_usage,
            gpu_usage: linux::read_gpu_busy_percent_linux().unwrap_or(0.0),
            disk_usage,
            disk_read_speed,
            disk_write_speed,
            network_download,
            network_upload,
        })
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> SamplerError {
    SamplerError::MetricsUnavailable(format!("sysinfo lock poisoned: {e}"))
}
