use clap::Parser;
use colored::Colorize;

use studysync::cli::args::{Cli, Commands};
use studysync::cli::commands;
use studysync::config::Paths;
use studysync::logging;

fn main() {
    logging::init();

    if let Err(e) = run() {
        eprintln!("{}: {:#}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = cli.output;

    let output = match cli.command {
        Commands::Sync(args) => {
            let paths = match cli.data_dir {
                Some(root) => Paths::with_root(root),
                None => Paths::new()?,
            };
            commands::sync(&paths, args.command, format)?
        },
        Commands::Completions { shell } => commands::completions(shell)?,
    };

    if !output.is_empty() {
        println!("{output}");
    }

    Ok(())
}
