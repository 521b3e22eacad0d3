//! gpu-probe: report the GPU backend this host would use.
//!
//! Prints the detected library, devices and memory, plus the VRAM left for
//! allocation after the overhead reserve.

use clap::Parser;
use serde::Serialize;
use tracing::info;

use gpu_probe::config::{Cli, ProbeConfig};
use gpu_probe::gpu::{self, GpuInfo, VramError};

#[derive(Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    info: &'a GpuInfo,
    available_vram: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    visible_devices: Option<(&'static str, String)>,
}

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "gpu_probe=debug"
    } else {
        "gpu_probe=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("gpu-probe v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = match &cli.config {
        Some(path) => ProbeConfig::load(path)?,
        None => ProbeConfig::from_env(),
    };
    if cli.verbose {
        config.verbose = true;
    }
    let user_visible = config.rocr_visible_devices.clone();

    let detector = gpu::init(config);
    let info = detector.probe();

    let available_vram = match detector.available_vram() {
        Ok(bytes) => Some(bytes),
        Err(VramError::NoGpu) => None,
        Err(e @ VramError::Config(_)) => return Err(e.into()),
    };
    let visible_devices = info.visible_devices_env(user_visible.as_deref());

    if cli.json {
        let report = Report {
            info: &info,
            available_vram,
            visible_devices,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("library:        {}", info.library);
    if !info.variant.is_empty() {
        println!("variant:        {}", info.variant);
    }
    println!("devices:        {}", info.device_count);
    println!("total memory:   {}", format_bytes(info.total_memory));
    println!("free memory:    {}", format_bytes(info.free_memory));
    if let Some(cc) = info.compute_capability {
        println!("compute:        {cc}");
    }
    if !info.excluded_devices.is_empty() {
        println!("excluded:       {:?}", info.excluded_devices);
    }
    match available_vram {
        Some(bytes) => println!("available VRAM: {}", format_bytes(bytes)),
        None => println!("available VRAM: none (no GPU detected)"),
    }
    if let Some((var, value)) = visible_devices {
        println!("launch with:    {var}={value}");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    let b = bytes as f64;
    if b >= GIB {
        format!("{:.1} GiB", b / GIB)
    } else {
        format!("{:.0} MiB", b / MIB)
    }
}
