use clap::Parser;
use migrant_cohorts::{cohorts::Study, load_study, write_csv, Extract};
use qu::ick_use::*;
use std::path::PathBuf;

/// Everyone with a migration code who was registered during the study period.
#[derive(Parser)]
struct Opt {
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// A cached extract (`.bin`) or an extract directory.
    #[clap(long, short, default_value = "output/extract.bin")]
    extract: PathBuf,
    #[clap(long, short, default_value = "output/full_study_cohort.csv")]
    output: PathBuf,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let (config, codelists) = load_study(opt.config.as_deref())?;
    let extract = Extract::open(&opt.extract)?;
    let rows = Study::new(&config, &codelists).full_study_cohort(&extract)?;
    write_csv(&rows, &opt.output)
}
