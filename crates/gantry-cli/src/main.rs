//! Gantry CLI entrypoint.

use clap::Parser;

mod commands;
mod handlers;

#[cfg(test)]
mod handlers_tests;

use commands::Commands;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Gantry job graph generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { root } => handlers::init(&root)?,
        Commands::Validate { root } => handlers::validate(&root)?,
        Commands::Show {
            phase,
            root,
            parameters,
            format,
            jobs_regex,
        } => handlers::show(&phase, &root, &parameters, format, jobs_regex.as_deref())?,
        Commands::Decision {
            root,
            parameters,
            output_dir,
        } => handlers::decision(&root, &parameters, &output_dir)?,
    }

    Ok(())
}
