//! Diagnostic probe for capability detection and kernel dispatch.
//!
//! Prints what the loader would do on this host: the effective capability
//! set, every variant attempt in order, and the variant that ends up bound.
//! `RUST_LOG=debug` surfaces the detection side channel.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use next_maxsim::{
    apply_disable_list, default_table, dispatch, supported_instruction_sets, KERNEL_DIR_ENV,
};

#[derive(Parser)]
#[command(
    name = "maxsim-probe",
    about = "Inspect CPU capability detection and kernel variant dispatch"
)]
struct Args {
    /// Emit the dispatch report as JSON
    #[arg(long)]
    json: bool,

    /// Additional capability names to disable, same syntax as
    /// NEXT_MAXSIM_DISABLE_CPU_FEATURES
    #[arg(long)]
    disable: Option<String>,

    /// Directory searched for kernel artifacts before the executable
    /// directory
    #[arg(long)]
    kernel_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Some(dir) = &args.kernel_dir {
        env::set_var(KERNEL_DIR_ENV, dir);
    }

    let mut caps = supported_instruction_sets();
    if let Some(extra) = &args.disable {
        apply_disable_list(&mut caps, extra);
    }

    let (kernels, report) =
        dispatch(&default_table(), &caps).context("no kernel variant could be bound")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let names: Vec<&str> = report.capabilities.iter().map(String::as_str).collect();
    println!("capabilities : {}", names.join(" "));
    println!("attempts     :");
    for attempt in &report.attempts {
        println!("  {:<10} {:?}", attempt.variant.to_string(), attempt.outcome);
    }
    println!("bound        : {}", report.bound);
    println!(
        "sanity       : dot([1,2,3],[4,5,6]) = {}",
        kernels.dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0])
    );
    Ok(())
}
