use clap::Parser;
use migrant_cohorts::Extract;
use qu::ick_use::*;
use std::path::PathBuf;

/// Load an extract directory of CSV tables and cache it for the other tools.
#[derive(Parser)]
struct Opt {
    /// Directory holding patients.csv, practice_registrations.csv, clinical_events.csv,
    /// addresses.csv and ons_deaths.csv.
    input: PathBuf,
    #[clap(long, short, default_value = "output/extract.bin")]
    output: PathBuf,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let extract = Extract::load_csv(&opt.input)?;
    extract.save(&opt.output)?;
    let events: usize = extract.iter().map(|record| record.events.len()).sum();
    println!("patients: {}", extract.len());
    println!("clinical events: {}", events);
    Ok(())
}
