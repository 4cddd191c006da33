//! Connection throughput probe.

use crate::transfer::client::RemoteClient;
use crate::transfer::progress::format_speed;
use crate::transfer::strategy::ConnectionQuality;
use futures_util::StreamExt;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of one probe download.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSample {
    pub path: String,
    pub bytes: u64,
    pub seconds: f64,
}

impl ProbeSample {
    pub fn mbps(&self) -> f64 {
        if self.seconds > 0.0 {
            self.bytes as f64 * 8.0 / 1_000_000.0 / self.seconds
        } else {
            0.0
        }
    }
}

/// Average of the successful samples, in Mbit/s.
pub fn average_mbps(samples: &[ProbeSample]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().map(ProbeSample::mbps).sum::<f64>() / samples.len() as f64)
}

async fn probe(client: &RemoteClient, path: &str) -> crate::Result<ProbeSample> {
    let started = Instant::now();
    let resp = client.get_path(path).await?;
    let mut stream = resp.bytes_stream();
    let mut bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        bytes += chunk?.len() as u64;
    }
    Ok(ProbeSample {
        path: path.to_string(),
        bytes,
        seconds: started.elapsed().as_secs_f64(),
    })
}

/// Time a GET of each probe resource and classify the average throughput.
/// Falls back to [`ConnectionQuality::Medium`] when nothing could be measured.
pub async fn measure_connection(
    client: &RemoteClient,
    probe_paths: &[String],
) -> ConnectionQuality {
    let mut samples = Vec::new();
    for path in probe_paths {
        match probe(client, path).await {
            Ok(sample) => {
                debug!("Probe {}: {} bytes in {:.3}s", path, sample.bytes, sample.seconds);
                samples.push(sample);
            }
            Err(e) => warn!("Speed probe {} failed: {}", path, e),
        }
    }

    match average_mbps(&samples) {
        Some(mbps) => {
            let quality = ConnectionQuality::from_mbps(mbps);
            let bytes_per_second = (mbps * 1_000_000.0 / 8.0) as u64;
            info!(
                "Measured {:.2} Mbit/s ({}): {:?}",
                mbps,
                format_speed(bytes_per_second),
                quality
            );
            quality
        }
        None => {
            info!("No speed measurement available, assuming medium connection");
            ConnectionQuality::Medium
        }
    }
}
