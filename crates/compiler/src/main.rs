//! Mica compiler CLI.
//!
//! Thin driver over the `micac` library: reads sources, runs the pipeline,
//! prints diagnostics or a textual IR dump.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;

use micac::{analyze_sources, compile_sources, CompilerConfig};

#[derive(ClapParser)]
#[command(name = "micac")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mica compiler - analyze and lower .mica programs to SSA IR", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile .mica files to in-memory IR
    Build {
        /// Input .mica source files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Print the IR of every generated function
        #[arg(long)]
        dump_ir: bool,

        /// Enable a built-in #version identifier (windows, linux, macos)
        #[arg(long = "target-version", value_name = "ID")]
        versions: Vec<String>,

        /// Path to a TOML target manifest
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run semantic analysis only
    Check {
        /// Input .mica source files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Enable a built-in #version identifier (windows, linux, macos)
        #[arg(long = "target-version", value_name = "ID")]
        versions: Vec<String>,

        /// Path to a TOML target manifest
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build { inputs, dump_ir, versions, config } => {
            run_build(&inputs, dump_ir, &versions, config.as_deref());
        }
        Commands::Check { inputs, versions, config } => {
            run_check(&inputs, &versions, config.as_deref());
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "micac", &mut io::stdout());
        }
    }
}

fn load_config(versions: &[String], config_path: Option<&std::path::Path>) -> CompilerConfig {
    let mut config = match config_path {
        Some(path) => {
            let content = match fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error reading {}: {}", path.display(), e);
                    process::exit(1);
                }
            };
            match CompilerConfig::from_toml(&content) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            }
        }
        None => CompilerConfig::default(),
    };
    for version in versions {
        if let Err(e) = config.enable_version(version) {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
    config
}

fn read_sources(inputs: &[PathBuf]) -> Vec<(String, String)> {
    let mut sources = Vec::new();
    for input in inputs {
        match fs::read_to_string(input) {
            Ok(content) => sources.push((input.display().to_string(), content)),
            Err(e) => {
                eprintln!("Error reading {}: {}", input.display(), e);
                process::exit(1);
            }
        }
    }
    sources
}

fn run_build(
    inputs: &[PathBuf],
    dump_ir: bool,
    versions: &[String],
    config_path: Option<&std::path::Path>,
) {
    let config = load_config(versions, config_path);
    let sources = read_sources(inputs);
    let borrowed: Vec<(&str, &str)> =
        sources.iter().map(|(n, s)| (n.as_str(), s.as_str())).collect();

    match compile_sources(config, &borrowed) {
        Ok(ctx) => {
            if dump_ir {
                for func in &ctx.ir.functions {
                    print!("{}", micac::ir::print::print_function(&ctx.interner, &ctx.ir, func));
                    println!();
                }
            }
            println!(
                "Compiled {} module(s), {} function(s)",
                ctx.modules.len(),
                ctx.ir.functions.len()
            );
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn run_check(inputs: &[PathBuf], versions: &[String], config_path: Option<&std::path::Path>) {
    let config = load_config(versions, config_path);
    let sources = read_sources(inputs);
    let borrowed: Vec<(&str, &str)> =
        sources.iter().map(|(n, s)| (n.as_str(), s.as_str())).collect();

    match analyze_sources(config, &borrowed) {
        Ok(ctx) => {
            println!("Checked {} module(s): no errors", ctx.modules.len());
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}
