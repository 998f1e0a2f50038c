#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use kmem_harness::{AllocWorkload, CacheWorkload, run_alloc_workload, run_cache_workload};
use std::env;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("cache-stress") => {
            let mut workload = CacheWorkload::default();
            if let Some(threads) = args.get(1) {
                workload.threads = threads.parse().context("threads must be a number")?;
            }
            if let Some(ops) = args.get(2) {
                workload.ops_per_thread = ops.parse().context("ops must be a number")?;
            }
            let report = run_cache_workload(workload)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some("alloc-stress") => {
            let mut workload = AllocWorkload::default();
            if let Some(threads) = args.get(1) {
                workload.threads = threads.parse().context("threads must be a number")?;
            }
            if let Some(ops) = args.get(2) {
                workload.ops_per_thread = ops.parse().context("ops must be a number")?;
            }
            let report = run_alloc_workload(workload)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn print_usage() {
    println!("kmem-harness — stress drivers for the kmem cores");
    println!();
    println!("Usage:");
    println!("  kmem-harness cache-stress [threads] [ops-per-thread]");
    println!("  kmem-harness alloc-stress [threads] [ops-per-thread]");
    println!();
    println!("Reports are printed as JSON. Set RUST_LOG for tracing output.");
}
