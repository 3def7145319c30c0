//! strata-offload: run a quantized matrix multiply on simulated devices.
//!
//! Reports the deviation from an f32 host reference, the kernel strategy each
//! device selected, and the state of the device buffer pools.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use strata_offload::cli::{self, ErrorStats};
use strata_offload::{
    DeviceStatus, GgmlType, Location, MatMulStrategy, Op, PoolStats, Runtime, RuntimeConfig,
    SimDriver, Tensor,
};

#[derive(Parser)]
#[command(
    name = "strata-offload",
    about = "Run a quantized matmul through the multi-device runtime"
)]
struct Args {
    /// Weight type (f32, f16, bf16, q4_0, q4_1, q5_0, q5_1, q8_0, q2_k .. q6_k)
    #[arg(short = 't', long = "type", default_value = "q4_0", value_parser = cli::parse_type)]
    ty: GgmlType,

    /// Weight rows (output features)
    #[arg(long, default_value_t = 256)]
    rows: usize,

    /// Row length (input features); a multiple of the type's block size
    #[arg(long, default_value_t = 512)]
    cols: usize,

    /// Activation columns (batch size)
    #[arg(short = 'b', long, default_value_t = 1)]
    batch: usize,

    /// Capability tier of each simulated device, comma separated
    #[arg(long, default_value = "860")]
    devices: String,

    /// Memory per simulated device (e.g. 512M, 8G)
    #[arg(long, default_value = "1G", value_parser = cli::parse_size)]
    memory: usize,

    /// Where the weights live: host, device or split
    #[arg(long, default_value = "device", value_parser = cli::parse_location)]
    location: Location,

    /// Row split proportions, comma separated (default: by device memory)
    #[arg(long)]
    split: Option<String>,

    /// Force a matmul strategy: mmvq, mmq, dmmv, dense-f32, dense-f16, dense-bf16
    #[arg(long)]
    strategy: Option<MatMulStrategy>,

    /// JSON runtime configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Seed for weights and activations
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output)]
    output: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_output(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

#[derive(Serialize)]
struct DeviceReport {
    #[serde(flatten)]
    status: DeviceStatus,
    strategy: Option<String>,
    pool: PoolStats,
}

#[derive(Serialize)]
struct Report {
    weight_type: String,
    rows: usize,
    cols: usize,
    batch: usize,
    location: String,
    offloaded: bool,
    error: ErrorStats,
    devices: Vec<DeviceReport>,
    upload_ms: f64,
    compute_ms: f64,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RuntimeConfig::load(args.config.as_deref())?;
    if let Some(split) = &args.split {
        config.tensor_split = cli::parse_split(split)?;
    }
    if args.strategy.is_some() {
        config.force_strategy = args.strategy;
    }

    let specs = cli::parse_devices(&args.devices, args.memory)?;
    let driver = Arc::new(SimDriver::new(specs));
    let mut runtime = Runtime::new(driver, config)?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut values = |n: usize| -> Vec<f32> { (0..n).map(|_| rng.gen_range(-1.0f32..=1.0)).collect() };
    let w_values = values(args.rows * args.cols);
    let x_values = values(args.cols * args.batch);

    let mut weights = Tensor::from_f32("weights", args.ty, &[args.cols, args.rows], &w_values)?;
    let decoded = weights.to_f32()?;
    let activations = Tensor::from_f32("activations", GgmlType::F32, &[args.cols, args.batch], &x_values)?;
    let mut output = Tensor::zeros("output", &[args.rows, args.batch])?;

    let upload_start = Instant::now();
    if args.location != Location::Host {
        runtime.transform_tensor(&mut weights, args.location)?;
    }
    runtime.synchronize()?;
    let upload_ms = upload_start.elapsed().as_secs_f64() * 1000.0;

    let compute_start = Instant::now();
    let offloaded = runtime.try_compute(&Op::MulMat, &weights, Some(&activations), &mut output);
    runtime.synchronize()?;
    let compute_ms = compute_start.elapsed().as_secs_f64() * 1000.0;

    let reference = cli::reference_matmul(&decoded, &x_values, args.rows, args.cols, args.batch);
    let got = if offloaded {
        output.to_f32()?
    } else {
        reference.clone()
    };
    let error = cli::error_stats(&got, &reference);

    let strategies = runtime.last_matmul_strategies().to_vec();
    let devices: Vec<DeviceReport> = runtime
        .devices()
        .iter()
        .zip(strategies)
        .map(|(status, strategy)| DeviceReport {
            status: status.clone(),
            strategy: strategy.map(|s| s.to_string()),
            pool: runtime.pool_stats(status.index),
        })
        .collect();

    let report = Report {
        weight_type: args.ty.to_string(),
        rows: args.rows,
        cols: args.cols,
        batch: args.batch,
        location: args.location.to_string(),
        offloaded,
        error,
        devices,
        upload_ms,
        compute_ms,
    };

    runtime.free_data(&mut weights);
    runtime.shutdown();

    if args.output == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} x [{} x {}] weights ({}), batch {}",
        report.weight_type, report.rows, report.cols, report.location, report.batch
    );
    if !report.offloaded {
        println!("not offloaded: product left to the host");
    }
    println!(
        "error vs f32 reference: max {:.6}, rms {:.6}",
        report.error.max_abs, report.error.rms
    );
    for d in &report.devices {
        println!(
            "  device {} ({}, cc {}, split from {:.3}): {}, pool {} in use / {} free / {} empty",
            d.status.index,
            d.status.name,
            d.status.capability,
            d.status.split_start,
            d.strategy.as_deref().unwrap_or("idle"),
            d.pool.in_use_slots,
            d.pool.free_slots,
            d.pool.empty_slots,
        );
    }
    println!(
        "upload {:.2} ms, compute {:.2} ms",
        report.upload_ms, report.compute_ms
    );
    Ok(())
}
