use clap::Parser;
use migrant_cohorts::{cohorts::Study, load_study, write_csv, Extract};
use qu::ick_use::*;
use std::path::PathBuf;

/// One row per migrant per year they were alive and registered on 1 January.
#[derive(Parser)]
struct Opt {
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(long, short, default_value = "output/extract.bin")]
    extract: PathBuf,
    #[clap(long, short, default_value = "output/annual_cohort.csv")]
    output: PathBuf,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let (config, codelists) = load_study(opt.config.as_deref())?;
    let extract = Extract::open(&opt.extract)?;
    let rows = Study::new(&config, &codelists).annual_cohort(&extract)?;
    write_csv(&rows, &opt.output)
}
