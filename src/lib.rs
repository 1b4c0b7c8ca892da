//! Cohort extraction for a population study of migrants in primary care records.
//!
//! The pieces, bottom up: [`codelist`]s of SNOMED CT codes, an [`extract`] of patient records,
//! [`eligibility`] criteria deciding who is in a population, [`derive`]d per-patient variables
//! (with [`banding`]), the study's [`cohorts`] and the interval [`measures`].
pub mod banding;
pub mod codelist;
pub mod cohorts;
pub mod config;
pub mod derive;
pub mod dummy;
pub mod eligibility;
pub mod extract;
mod interval;
pub mod measures;
mod snomed;
mod util;

pub use anyhow::{Context, Error};
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Serialize};
use std::{fs, io, path::Path, sync::Arc};

pub use crate::{
    codelist::{Codelist, CodelistError, CodelistRegistry, MigrantCategory},
    config::StudyConfig,
    extract::{Extract, PatientRecord, Sex},
    interval::Interval,
    snomed::{CodeError, SnomedCode},
    util::header,
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
pub type PatientId = u64;

/// Load the configuration (or the defaults) and every codelist it names.
///
/// Anything wrong here is a configuration error, so it is reported before any patient is looked
/// at.
pub fn load_study(config_path: Option<&Path>) -> Result<(StudyConfig, CodelistRegistry)> {
    let config = StudyConfig::load_or_default(config_path)?;
    let codelists = CodelistRegistry::load(&config.codelists).context("loading codelists")?;
    Ok((config, codelists))
}

/// Load data into memory.
fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let reader = io::BufReader::new(fs::File::open(path)?);
        bincode::deserialize_from(reader).map_err(Into::into)
    }
    let path = path.as_ref();
    check_extension(path, "bin")?;

    inner(path).with_context(|| format!("unable to load data from \"{}\"", path.display()))
}

/// Save data to disk.
fn save<T: Serialize>(contents: &[T], path: impl AsRef<Path>) -> Result {
    fn inner<T: Serialize>(contents: &[T], path: &Path) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        if util::path_exists(path)? {
            event!(
                Level::WARN,
                "overwriting existing file at \"{}\"",
                path.display()
            );
        }
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        bincode::serialize_into(&mut out, contents)?;
        Ok(())
    }
    let path = path.as_ref();
    check_extension(path, "bin")?;

    inner(contents, path).with_context(|| format!("unable to save data to \"{}\"", path.display()))
}

/// Read the rows of a CSV file with a header row.
///
/// A row that can't be deserialized (a bad date, a blank required number, a short row) is skipped
/// with a warning. The file fails to load if it can't be read or if no row can be deserialized.
pub fn read_csv<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    fn inner<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut rows = vec![];
        let mut skipped = 0;
        let mut first_error = None;
        for row in reader.into_deserialize() {
            match row {
                Ok(row) => rows.push(row),
                Err(e) if is_row_error(&e) => {
                    skipped += 1;
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(e) = first_error {
            ensure!(!rows.is_empty(), "no readable rows: {}", e);
            event!(
                Level::WARN,
                "skipped {} unreadable rows of \"{}\" (first: {})",
                skipped,
                path.display(),
                e
            );
        }
        Ok(rows)
    }
    let path = path.as_ref();
    inner(path).with_context(|| format!("while loading \"{}\"", path.display()))
}

fn is_row_error(e: &csv::Error) -> bool {
    matches!(
        e.kind(),
        csv::ErrorKind::Deserialize { .. } | csv::ErrorKind::UnequalLengths { .. }
    )
}

/// Write rows to a CSV file, with a header row taken from the field names.
pub fn write_csv<T: Serialize>(
    rows: impl IntoIterator<Item = T>,
    path: impl AsRef<Path>,
) -> Result {
    fn inner<T: Serialize>(rows: impl IntoIterator<Item = T>, path: &Path) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
    let path = path.as_ref();
    check_extension(path, "csv")?;

    inner(rows, path).with_context(|| format!("unable to write \"{}\"", path.display()))
}

pub fn check_extension(path: &Path, ext: &str) -> Result<()> {
    ensure!(
        matches!(path.extension(), Some(p) if p == ext),
        "filename should end with `.{}`",
        ext
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{cohorts::Study, dummy, load_study, measures::MeasureSet};
    use std::path::Path;

    #[test]
    fn shipped_study_runs_end_to_end() {
        let (mut config, codelists) = load_study(Some(Path::new("study.toml"))).unwrap();
        assert_eq!(codelists.ethnicity.categories().len(), 5);
        assert_eq!(codelists.all_migrant.len(), 4);

        config.dummy_data.population_size = 300;
        let extract = dummy::generate(&config, &codelists).unwrap();
        let study = Study::new(&config, &codelists);
        let cohort = study.full_study_cohort(&extract).unwrap();
        assert!(!cohort.is_empty());
        assert_eq!(
            study.migration_events(&extract).unwrap().len(),
            cohort.iter().map(|row| row.number_of_migration_codes).sum::<usize>()
        );

        let rows = MeasureSet::from_config(&config, &codelists).run(&extract).unwrap();
        let overall: Vec<_> = rows.iter().filter(|row| &*row.measure == "any_migrant").collect();
        assert_eq!(overall.len(), 16);
        assert!(overall.iter().any(|row| row.numerator > 0));
    }
}
