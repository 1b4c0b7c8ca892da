use clap::Parser;
use migrant_cohorts::{dummy, load_study};
use qu::ick_use::*;
use std::path::PathBuf;

/// Write a synthetic extract directory.
#[derive(Parser)]
struct Opt {
    /// Study configuration (TOML). The study defaults are used when missing.
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// Directory to write the extract tables to.
    #[clap(long, short, default_value = "output/dummy_extract")]
    output: PathBuf,
    /// Override the configured population size.
    #[clap(long, short = 'n')]
    population_size: Option<usize>,
    /// Override the configured seed.
    #[clap(long, short)]
    seed: Option<u64>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let (mut config, codelists) = load_study(opt.config.as_deref())?;
    if let Some(population_size) = opt.population_size {
        config.dummy_data.population_size = population_size;
    }
    if let Some(seed) = opt.seed {
        config.dummy_data.seed = seed;
    }
    let extract = dummy::generate(&config, &codelists)?;
    extract.write_csv(&opt.output)?;
    event!(
        Level::INFO,
        "wrote {} patients to \"{}\"",
        extract.len(),
        opt.output.display()
    );
    Ok(())
}
