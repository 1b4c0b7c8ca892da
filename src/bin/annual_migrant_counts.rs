use clap::Parser;
use migrant_cohorts::{
    load_study,
    measures::{disclose, MeasureSet},
    write_csv, Extract,
};
use qu::ick_use::*;
use std::path::PathBuf;

/// Yearly counts of migrants, overall and by age, sex, ethnicity, IMD and region.
#[derive(Parser)]
struct Opt {
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(long, short, default_value = "output/extract.bin")]
    extract: PathBuf,
    #[clap(long, short, default_value = "output/annual_migrant_counts.csv")]
    output: PathBuf,
    /// Use the first definition of the counts.
    #[clap(long)]
    legacy: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let (config, codelists) = load_study(opt.config.as_deref())?;
    let extract = Extract::open(&opt.extract)?;
    let measures = if opt.legacy {
        MeasureSet::legacy(&config, &codelists)
    } else {
        MeasureSet::from_config(&config, &codelists)
    };
    // no disclosure control ships with the crate
    let rows = disclose(measures.run(&extract)?, &config.disclosure_control, None)?;
    write_csv(&rows, &opt.output)
}
