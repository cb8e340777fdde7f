//! Test Segmentation Client
//!
//! Generates synthetic volumes, posts them to a running service and checks
//! that the returned label volume lines up with the input.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ndarray::Array3;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use volseg_service::codec;
use volseg_service::types::{Envelope, Geometry, Volume, VoxelBuffer};

/// Synthetic volume generator: a bright noisy sphere on a dark background
struct VolumeGenerator {
    rng: rand::rngs::ThreadRng,
}

impl VolumeGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
        }
    }

    fn generate(&mut self, size: [usize; 3], spacing: [f64; 3]) -> anyhow::Result<Volume> {
        let geometry = Geometry::new(size, spacing);
        let centre = size.map(|s| s as f64 / 2.0);
        let radius = size.iter().copied().min().unwrap_or(1) as f64 / 3.0;

        let rng = &mut self.rng;
        let data = Array3::from_shape_fn(geometry.array_shape(), |(z, y, x)| {
            let d = ((x as f64 - centre[0]).powi(2)
                + (y as f64 - centre[1]).powi(2)
                + (z as f64 - centre[2]).powi(2))
            .sqrt();
            let base: i16 = if d < radius { 200 } else { -800 };
            base + rng.gen_range(-40..40)
        });
        Ok(Volume::new(geometry, VoxelBuffer::Int16(data))?)
    }
}

async fn predict(
    client: &reqwest::Client,
    url: &str,
    volume_bytes: Vec<u8>,
    threshold: f64,
) -> anyhow::Result<Envelope> {
    let form = reqwest::multipart::Form::new()
        .part(
            "input",
            reqwest::multipart::Part::bytes(volume_bytes).file_name("volume.mha"),
        )
        .text("threshold", threshold.to_string());

    let response = client.post(url).multipart(form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("service returned {status}: {body}");
    }
    Ok(response.json::<Envelope>().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_client=info".parse()?),
        )
        .init();

    info!("Starting Test Segmentation Client");

    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let url = args
        .get(1)
        .map(|s| s.as_str())
        .unwrap_or("http://localhost:9000/predict");
    let count: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(5);
    let threshold: f64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0.5);
    let edge: usize = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(64);
    let delay_ms: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(500);

    info!(
        url = %url,
        count = count,
        threshold = threshold,
        edge = edge,
        delay_ms = delay_ms,
        "Configuration loaded"
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()?;
    let mut generator = VolumeGenerator::new();
    let mut rng = rand::thread_rng();

    let mut succeeded = 0;
    let mut failed = 0;

    for i in 0..count {
        let spacing = [
            rng.gen_range(0.7..1.3),
            rng.gen_range(0.7..1.3),
            rng.gen_range(1.0..3.0),
        ];
        let size = [edge, edge, (edge / 2).max(1)];
        let volume = generator.generate(size, spacing)?;
        let bytes = codec::encode(&volume, true)?;

        let start = Instant::now();
        match predict(&client, url, bytes, threshold).await {
            Ok(envelope) => {
                let labels = codec::decode(&STANDARD.decode(envelope.label_volume())?)?;
                let aligned = labels.geometry().is_congruent(volume.geometry(), 1e-6);
                let voxels = labels.voxels().to_f32();
                let foreground = voxels.iter().filter(|&&v| v > 0.0).count();

                succeeded += 1;
                info!(
                    request = i + 1,
                    round_trip_ms = start.elapsed().as_millis() as u64,
                    inference_secs = %envelope.elapsed_time(),
                    aligned = aligned,
                    foreground_fraction = foreground as f64 / voxels.len() as f64,
                    "Segmentation received"
                );
                if !aligned {
                    warn!(
                        sent = ?volume.geometry(),
                        received = ?labels.geometry(),
                        "Label volume geometry differs from input"
                    );
                }
            }
            Err(e) => {
                failed += 1;
                warn!(request = i + 1, error = %e, "Request failed");
            }
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    info!("Completed! {} succeeded, {} failed", succeeded, failed);

    Ok(())
}
