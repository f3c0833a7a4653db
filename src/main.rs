use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "thucydides")]
#[command(about = "Reconstruct an importable changeset history from a legacy version graph")]
struct Cli {
    /// Raise the log level (-v: debug, -vv: trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconstruct the history and write the import plan
    Build {
        /// Version graph document (JSON) produced by the adapter
        #[arg(long)]
        graph: PathBuf,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Snapshot to resume from and update (JSON)
        #[arg(long)]
        state: Option<PathBuf>,

        /// Where to write the import plan (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the inferred branch hierarchy
    Branches {
        /// Version graph document (JSON) produced by the adapter
        #[arg(long)]
        graph: PathBuf,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::Build {
            graph,
            config,
            state,
            output,
        } => {
            let print = output.is_none();
            let options = thucydides::RunOptions {
                graph,
                config,
                state,
                output,
            };
            let reconstruction = thucydides::run(&options).context("reconstruction failed")?;
            if print {
                println!("{}", reconstruction.plan.to_json()?);
            }
        }
        Command::Branches { graph, config } => {
            let config = match config {
                Some(path) => thucydides::Config::load(&path)?,
                None => thucydides::Config::default(),
            };
            let graph = thucydides::load_graph(&graph, &config.load_options())?;
            let hierarchy = thucydides::infer_hierarchy(&graph, &config)?;
            for branch in hierarchy.branches() {
                match hierarchy.parent(branch) {
                    Some(parent) => println!("{branch} <- {parent}"),
                    None => println!("{branch}"),
                }
            }
            for (branch, renamed) in hierarchy.case_collision_renames() {
                println!("{branch} -> {renamed} (case collision)");
            }
        }
    }

    Ok(())
}
