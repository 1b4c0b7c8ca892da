use clap::Parser;
use migrant_cohorts::{cohorts::Study, load_study, write_csv, Extract};
use qu::ick_use::*;
use std::path::PathBuf;

/// Time from first registration to first migration code, for survival analysis.
#[derive(Parser)]
struct Opt {
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(long, short, default_value = "output/extract.bin")]
    extract: PathBuf,
    #[clap(long, short, default_value = "output/time_to_first_migration_code.csv")]
    output: PathBuf,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let (config, codelists) = load_study(opt.config.as_deref())?;
    let extract = Extract::open(&opt.extract)?;
    let rows = Study::new(&config, &codelists).time_to_first_code_cohort(&extract)?;
    let with_code = rows.iter().filter(|row| row.has_a_migration_code).count();
    event!(
        Level::INFO,
        "{} of {} patients have a migration code",
        with_code,
        rows.len()
    );
    write_csv(&rows, &opt.output)
}
