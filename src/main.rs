use std::process::ExitCode;

use clap::Parser;
use fundstore::{
    bootstrap::{BootstrapConfigReader, BootstrapError},
    config::{CliArgs, Command, Config},
    logging, report,
    wiring::Environment,
};
use fundstore_core::{StorageError, ValidationOptions};

#[derive(Debug, thiserror::Error)]
enum ToolError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.logging);

    match run(&cli.command, &config) {
        Ok(message) => {
            println!("{}", message);
            ExitCode::SUCCESS
        }
        Err(ToolError::Storage(StorageError::SchemaValidation(discrepancies))) => {
            eprintln!("Schema validation failed:");
            eprintln!("{}", report::validation_table(&discrepancies));
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: &Command, config: &Config) -> Result<&'static str, ToolError> {
    let env = Environment::open(config)?;
    match command {
        Command::Validate(args) => {
            let options = ValidationOptions {
                flag_extra: args.flag_extra,
            };
            env.validator(options).validate_schema()?;
            Ok("** Schema validated successfully. **")
        }
        Command::Deploy => {
            let (changes, remaining) = env.deployment().update_schema()?;
            println!("{}", report::deployment_table(&changes));
            if !remaining.is_clean() {
                return Err(StorageError::SchemaValidation(remaining).into());
            }
            Ok("** Schema updated successfully. **")
        }
        Command::Bootstrap(args) => {
            let tasks = BootstrapConfigReader::read(&args.file)?;
            let summary = env.bootstrapper().bootstrap(tasks)?;
            println!("{}", report::bootstrap_table(&summary));
            Ok("** Bootstrapping completed successfully. **")
        }
    }
}
