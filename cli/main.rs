#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;

use resilience::pipeline::{
    run_clean, run_extract, run_icc, run_impute, run_label, run_metadata, run_missing,
    run_model, run_reduce, run_validate,
};
use resilience::shared::config::PipelineConfig;

#[derive(Parser)]
#[command(
    name = "resilience",
    about = "Academic-resilience analysis of large-scale assessment microdata",
    long_about = "Batch stages that turn raw SPSS survey microdata into imputed, reduced \
                 analysis files and fit pooled multilevel models of academic resilience. \
                 Run the stages in order; each reads the previous stage's output."
)]
struct Cli {
    /// TOML file overriding any subset of the built-in paths and parameters
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the variable label catalogue and codebook descriptions
    Metadata,
    /// Keep students at or below their country's ESCS cutoff
    Extract,
    /// Add the academic-resilience outcome to the extracted file
    Label,
    /// Keep codebook variables and set invalid survey codes to missing
    Clean,
    /// Report missingness by country and draw the heatmap
    Missing,
    /// Multiple imputation and standardisation of the cleaned file
    Impute,
    /// Intraclass correlations from null models at school and country level
    Icc,
    /// Principal components of the psychological and environmental blocks
    Reduce,
    /// Pooled model and nested model sequences with likelihood-ratio tests
    Model,
    /// Random-forest validation and feature importance
    Validate,
    /// Run every stage in order
    All,
    /// Print the effective configuration as TOML
    Config,
    /// Show version information
    Version,
}

fn run(command: Commands, config: &PipelineConfig) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Metadata => run_metadata(config)?,
        Commands::Extract => run_extract(config)?,
        Commands::Label => run_label(config)?,
        Commands::Clean => run_clean(config)?,
        Commands::Missing => run_missing(config)?,
        Commands::Impute => run_impute(config)?,
        Commands::Icc => run_icc(config)?,
        Commands::Reduce => run_reduce(config)?,
        Commands::Model => run_model(config)?,
        Commands::Validate => run_validate(config)?,
        Commands::All => {
            let stages: [(&str, fn(&PipelineConfig) -> _); 10] = [
                ("metadata", run_metadata),
                ("extract", run_extract),
                ("label", run_label),
                ("clean", run_clean),
                ("missing", run_missing),
                ("impute", run_impute),
                ("icc", run_icc),
                ("reduce", run_reduce),
                ("model", run_model),
                ("validate", run_validate),
            ];
            for (name, stage) in stages {
                log::info!("=== Stage: {name} ===");
                stage(config)?;
            }
        }
        Commands::Config => print!("{}", config.to_toml()?),
        Commands::Version => println!("resilience {}", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { config, command } = Cli::parse();
    let Some(command) = command else {
        if Cli::command().print_help().is_err() {
            process::exit(1);
        }
        println!();
        return;
    };

    let result = PipelineConfig::load(config.as_deref())
        .map_err(Box::<dyn Error>::from)
        .and_then(|config| run(command, &config));

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
