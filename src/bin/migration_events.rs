use clap::Parser;
use migrant_cohorts::{cohorts::Study, load_study, write_csv, Extract};
use qu::ick_use::*;
use std::path::PathBuf;

/// Every migration code recorded for the full study cohort.
#[derive(Parser)]
struct Opt {
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(long, short, default_value = "output/extract.bin")]
    extract: PathBuf,
    #[clap(long, short, default_value = "output/migration_events.csv")]
    output: PathBuf,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let (config, codelists) = load_study(opt.config.as_deref())?;
    let extract = Extract::open(&opt.extract)?;
    let rows = Study::new(&config, &codelists).migration_events(&extract)?;
    write_csv(&rows, &opt.output)
}
