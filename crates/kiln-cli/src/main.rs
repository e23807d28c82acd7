mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::BuildArgs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Constraint-preserving Debian package and rootfs builds"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse and validate a spec.
    Check {
        /// Path to the spec TOML file.
        #[arg(default_value = "kiln.toml")]
        spec: PathBuf,
    },
    /// List the targets a spec can build and what each resolves to.
    Targets {
        /// Path to the spec TOML file.
        #[arg(default_value = "kiln.toml")]
        spec: PathBuf,
    },
    /// Show the worker and the build stages for a target.
    Plan {
        /// Path to the spec TOML file.
        #[arg(default_value = "kiln.toml")]
        spec: PathBuf,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Print the build graph definition as JSON.
    Graph {
        /// Path to the spec TOML file.
        #[arg(default_value = "kiln.toml")]
        spec: PathBuf,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Check { spec } => commands::check::run(&spec, json_output),
        Commands::Targets { spec } => commands::targets::run(&spec, json_output),
        Commands::Plan { spec, build } => commands::plan::run(&spec, &build, json_output),
        Commands::Graph { spec, build } => commands::graph::run(&spec, &build),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {}", err.message);
            ExitCode::from(err.code)
        }
    }
}
