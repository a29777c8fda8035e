//! Local resource sampling for announces.

use std::time::Duration;

use sysinfo::{Disks, Networks, System};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use shoal_core::record::Capacity;

pub struct CapacitySampler {
    system: System,
    disks: Disks,
    networks: Networks,
    last_sample: Instant,
}

impl CapacitySampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            last_sample: Instant::now(),
        }
    }

    pub fn sample(&mut self) -> Capacity {
        self.system.refresh_memory();
        self.system.refresh_cpu();
        self.disks.refresh();
        self.networks.refresh();

        let elapsed = self.last_sample.elapsed().as_secs_f64().max(0.001);
        self.last_sample = Instant::now();

        let (disk_free, disk_total) = self
            .disks
            .iter()
            .fold((0u64, 0u64), |(free, total), d| {
                (free + d.available_space(), total + d.total_space())
            });
        let (rx_bytes, tx_bytes) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.received(), tx + data.transmitted())
            });

        Capacity {
            disk_free,
            disk_total,
            cpu_used: self.system.global_cpu_info().cpu_usage(),
            cpu_count: self.system.cpus().len() as u32,
            memory_free: self.system.available_memory(),
            memory_total: self.system.total_memory(),
            net_speed: 0,
            net_in_bps: (rx_bytes as f64 * 8.0 / elapsed) as u64,
            net_out_bps: (tx_bytes as f64 * 8.0 / elapsed) as u64,
        }
    }
}

/// Sample every `every` and publish to `tx` until shutdown.
pub async fn sample_loop(
    mut sampler: CapacitySampler,
    tx: watch::Sender<Capacity>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let capacity = sampler.sample();
                tracing::trace!(
                    available = capacity.available_capacity(),
                    cpu = capacity.cpu_used,
                    "capacity sampled"
                );
                tx.send_replace(capacity);
            }
            _ = shutdown.recv() => return,
        }
    }
}
