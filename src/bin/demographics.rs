use clap::Parser;
use migrant_cohorts::{
    banding::year_of_birth_bands, cohorts::Study, header, load_study, Extract, Sex,
};
use qu::ick_use::*;
use std::{collections::BTreeMap, path::PathBuf};
use term_data_table::{Cell, Row, Table};

/// Print a summary of the full study cohort.
#[derive(Parser)]
struct Opt {
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(long, short, default_value = "output/extract.bin")]
    extract: PathBuf,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let (config, codelists) = load_study(opt.config.as_deref())?;
    let extract = Extract::open(&opt.extract)?;
    let rows = Study::new(&config, &codelists).full_study_cohort(&extract)?;
    let total = rows.len();

    header("Data stats");
    println!("patients in extract: {}", extract.len());
    println!("patients in full study cohort: {}", total);
    if let Some(date) = rows.iter().filter_map(|row| row.date_of_first_migration_code).min() {
        println!("earliest migration code: {}", date);
    }
    if let Some(date) = rows.iter().filter_map(|row| row.date_of_first_migration_code).max() {
        println!("latest first migration code: {}", date);
    }

    header("Sexes");
    let sexes = [Sex::Male, Sex::Female]
        .into_iter()
        .map(|sex| (sex.to_string(), rows.iter().filter(|row| row.sex == sex).count()));
    println!("{}", table("Sex", sexes, total));

    header("Year of birth");
    let years = year_of_birth_bands()
        .count(rows.iter().map(|row| row.year_of_birth))
        .into_iter()
        .map(|(label, count)| (label.to_string(), count));
    println!("{}", table("Year of birth", years, total));

    header("IMD decile");
    let mut deciles = BTreeMap::new();
    for row in &rows {
        *deciles.entry(row.imd_decile).or_insert(0usize) += 1;
    }
    let deciles = (1..=10)
        .map(|decile| (decile.to_string(), deciles.get(&Some(decile)).copied().unwrap_or(0)))
        .chain([("missing".to_string(), deciles.get(&None).copied().unwrap_or(0))]);
    println!("{}", table("IMD decile", deciles, total));

    header("Ethnicity");
    let mut groups: BTreeMap<_, usize> = BTreeMap::new();
    for row in &rows {
        *groups.entry(row.latest_ethnicity_group.to_string()).or_default() += 1;
    }
    println!("{}", table("Ethnicity", groups, total));

    header("Migrant categories");
    let categories = [
        (
            "country of birth",
            rows.iter().filter(|row| row.has_cob_migrant_code).count(),
        ),
        (
            "asylum seeker or refugee",
            rows.iter()
                .filter(|row| row.has_asylum_or_refugee_migrant_code)
                .count(),
        ),
        (
            "interpreter required",
            rows.iter().filter(|row| row.has_interpreter_migrant_code).count(),
        ),
    ]
    .into_iter()
    .map(|(label, count)| (label.to_string(), count));
    println!("{}", table("Category", categories, total));

    Ok(())
}

fn table(label: &str, counts: impl IntoIterator<Item = (String, usize)>, total: usize) -> Table {
    let mut table = Table::new().with_row(
        Row::new()
            .with_cell(Cell::from(label))
            .with_cell(Cell::from("Count"))
            .with_cell(Cell::from("Percentage")),
    );
    for (label, count) in counts {
        let percentage = if total == 0 {
            0.
        } else {
            count as f64 / total as f64 * 100.
        };
        table.add_row(
            Row::new()
                .with_cell(Cell::from(label))
                .with_cell(Cell::from(count.to_string()))
                .with_cell(Cell::from(format!("{:.1}%", percentage))),
        );
    }
    table
}
