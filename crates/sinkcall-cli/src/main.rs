//! SinkCall CLI: invoke functions in a sink execution domain.
//!
//! This is the command-line front end for the dispatch runtime.

mod args;
mod config;
mod output;
mod runner;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lib_dispatch::{ArgList, LibraryFormat, SinkLibrary, SymbolTable};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sinkcall")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a runtime and invoke a sink function
    Invoke {
        /// Path to the runtime configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Function name
        function: String,

        /// Arguments as type:value (u64, i64, f64, f32, bool, addr)
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,

        /// Stream as device/index
        #[arg(short, long, default_value = "0/0")]
        stream: String,

        /// Result fields to decode, in order (u64, i64, f64, u32)
        #[arg(short, long, value_delimiter = ',')]
        result: Vec<String>,

        /// Result capacity in bytes (defaults to the size of --result)
        #[arg(long)]
        result_size: Option<u16>,

        /// Number of times to invoke
        #[arg(long, default_value = "1")]
        repeat: u32,

        /// Per-call completion timeout (ms)
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,
    },

    /// Load and validate a runtime configuration file
    CheckConfig {
        /// Path to the configuration file
        file: PathBuf,
    },

    /// Load a sink library and check which symbols resolve
    Probe {
        /// Path to the shared library
        library: PathBuf,

        /// Symbols to look up
        symbols: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Invoke {
            config,
            function,
            args,
            stream,
            result,
            result_size,
            repeat,
            timeout_ms,
        } => {
            let plan = build_plan(function, &args, &stream, &result, result_size, repeat, timeout_ms)?;
            run_invoke(&config, &plan, cli.format)?;
        }
        Commands::CheckConfig { file } => {
            check_config(&file)?;
        }
        Commands::Probe { library, symbols } => {
            probe(&library, &symbols)?;
        }
    }

    Ok(())
}

fn build_plan(
    function: String,
    args: &[String],
    stream: &str,
    result: &[String],
    result_size: Option<u16>,
    repeat: u32,
    timeout_ms: u64,
) -> Result<runner::InvokePlan> {
    let args = args
        .iter()
        .map(|a| args::parse_arg(a))
        .collect::<Result<ArgList>>()?;
    let layout = result
        .iter()
        .map(|f| f.parse())
        .collect::<Result<Vec<args::FieldKind>>>()?;

    Ok(runner::InvokePlan {
        function,
        stream: runner::parse_stream(stream)?,
        args,
        layout,
        result_size,
        repeat,
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn run_invoke(config_path: &PathBuf, plan: &runner::InvokePlan, format: OutputFormat) -> Result<()> {
    tracing::info!("Loading configuration from {:?}", config_path);
    let config = config::load_config(config_path)?;

    let invoker = runner::Invoker::start(&config)?;
    let outcome = invoker.run(plan);
    // Tear down even when the call failed.
    let finished = invoker.finish();
    let report = outcome?;
    finished?;

    let stdout = std::io::stdout();
    output::write_report(&mut stdout.lock(), &report, format)?;
    Ok(())
}

fn check_config(file: &PathBuf) -> Result<()> {
    let config = config::load_config(file)?;

    println!("Configuration: {:?}", file);
    println!("  Max result size: {} bytes", config.max_result_size);
    println!("  Drain timeout:   {} ms", config.drain_timeout_ms);
    println!("  Devices:         {}", config.devices.len());
    for (i, device) in config.devices.iter().enumerate() {
        println!("\n  Device {}: {}", i, device.name);
        println!("    Streams:   {}", device.streams);
        for library in &device.libraries {
            println!("    Library:   {:?} ({:?})", library, LibraryFormat::from_path(library));
        }
    }
    println!("\nOK");
    Ok(())
}

fn probe(library: &PathBuf, symbols: &[String]) -> Result<()> {
    let lib = SinkLibrary::load(library)
        .with_context(|| format!("Failed to load {:?}", library))?;
    let table = SymbolTable::with_libraries(vec![lib]);

    for lib in table.libraries() {
        println!("Library: {}", lib.path);
        println!("  Format: {:?} (native: {:?})", lib.format, LibraryFormat::native());
    }

    let mut missing = 0;
    for symbol in symbols {
        let found = table.contains(symbol);
        println!("  {:<32} {}", symbol, if found { "found" } else { "missing" });
        if !found {
            missing += 1;
        }
    }

    if missing > 0 {
        anyhow::bail!("{} of {} symbols missing", missing, symbols.len());
    }
    Ok(())
}
