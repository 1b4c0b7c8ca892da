//! Study configuration.
//!
//! Everything that was a module-level constant in the study protocol lives here, in one value
//! built at the start of a run and then only borrowed.
use crate::{codelist::CodelistSpec, derive::ImdPolicy, Interval};

use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Immutable settings for one run.
///
/// Dates are ISO strings in the TOML file (`study_start_date = "2009-01-01"`). Every field has a
/// default, so a file only needs to mention what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudyConfig {
    pub study_start_date: NaiveDate,
    pub study_end_date: NaiveDate,
    /// 2021 Census day.
    pub census_date: NaiveDate,
    /// Patients older than this (in whole years) are excluded.
    pub max_age: u32,
    /// The largest `imd_rounded` value an address can have.
    pub max_imd: u32,
    pub intervals: IntervalsConfig,
    pub datasets: DatasetsConfig,
    pub measures: MeasuresConfig,
    pub dummy_data: DummyDataConfig,
    pub disclosure_control: DisclosureControlConfig,
    pub codelists: CodelistsConfig,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            study_start_date: ymd(2009, 1, 1),
            study_end_date: ymd(2024, 12, 31),
            census_date: ymd(2021, 3, 21),
            max_age: 100,
            max_imd: 32844,
            intervals: IntervalsConfig::default(),
            datasets: DatasetsConfig::default(),
            measures: MeasuresConfig::default(),
            dummy_data: DummyDataConfig::default(),
            disclosure_control: DisclosureControlConfig::default(),
            codelists: CodelistsConfig::default(),
        }
    }
}

/// The sequence of yearly intervals measures are computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntervalsConfig {
    pub start: NaiveDate,
    /// Number of consecutive one-year intervals.
    pub count: u32,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            start: ymd(2009, 1, 1),
            count: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetsConfig {
    /// How per-patient datasets derive the IMD quintile.
    pub imd_policy: ImdPolicy,
}

impl Default for DatasetsConfig {
    fn default() -> Self {
        Self {
            imd_policy: ImdPolicy::Precomputed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeasuresConfig {
    /// How the `imd` subgroup derives the IMD quintile.
    pub imd_policy: ImdPolicy,
    /// Use the first version of the annual counts (wider age bands, IMD quintile from the
    /// rounded score, no `unknown` ethnicity group).
    pub legacy: bool,
}

impl Default for MeasuresConfig {
    fn default() -> Self {
        Self {
            imd_policy: ImdPolicy::Precomputed,
            legacy: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DummyDataConfig {
    pub population_size: usize,
    pub seed: u64,
}

impl Default for DummyDataConfig {
    fn default() -> Self {
        Self {
            population_size: 1000,
            seed: 2025,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisclosureControlConfig {
    /// Must be enabled when running against real data.
    pub enabled: bool,
}

/// Codelist sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodelistsConfig {
    pub all_migrant: CodelistSpec,
    pub cob_migrant: CodelistSpec,
    pub asylum_refugee_migrant: CodelistSpec,
    pub interpreter_migrant: CodelistSpec,
    /// Must name a category column.
    pub ethnicity: CodelistSpec,
}

impl Default for CodelistsConfig {
    fn default() -> Self {
        Self {
            all_migrant: CodelistSpec::new("codelists/user-YaminaB-migration-status.csv"),
            cob_migrant: CodelistSpec::new("codelists/user-YaminaB-born-outside-the-uk.csv"),
            asylum_refugee_migrant: CodelistSpec::new(
                "codelists/user-YaminaB-asylum-seeker-or-refugee.csv",
            ),
            interpreter_migrant: CodelistSpec::new(
                "codelists/user-YaminaB-interpreter-required.csv",
            ),
            ethnicity: CodelistSpec::new("codelists/opensafely-ethnicity-snomed-0removed.csv")
                .with_category_column("Label_6"),
        }
    }
}

impl StudyConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<StudyConfig> {
            let text = fs::read_to_string(path)?;
            let config: StudyConfig = toml::from_str(&text)?;
            config.validate()?;
            Ok(config)
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("loading configuration from \"{}\"", path.display()))
    }

    /// Load the given file, or fall back to the study defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Check the settings are internally consistent.
    pub fn validate(&self) -> Result {
        ensure!(
            self.study_start_date <= self.study_end_date,
            "study start date {} is after study end date {}",
            self.study_start_date,
            self.study_end_date
        );
        ensure!(self.max_age > 0, "maximum age must be positive");
        ensure!(
            self.max_imd >= 5,
            "maximum IMD value {} is too small to split into quintiles",
            self.max_imd
        );
        ensure!(self.intervals.count > 0, "at least one interval is required");
        ensure!(
            self.interval_list().len() == self.intervals.count as usize,
            "interval sequence starting {} overflows the calendar",
            self.intervals.start
        );
        ensure!(
            self.codelists.ethnicity.category_column.is_some(),
            "the ethnicity codelist needs a category column"
        );
        Ok(())
    }

    /// The whole study period as one interval.
    pub fn study_period(&self) -> Interval {
        Interval::new(self.study_start_date, self.study_end_date)
    }

    /// The yearly intervals measures are computed over.
    pub fn interval_list(&self) -> Vec<Interval> {
        Interval::years(self.intervals.count, self.intervals.start)
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid calendar date")
}

#[cfg(test)]
mod test {
    use super::StudyConfig;
    use crate::derive::ImdPolicy;
    use chrono::NaiveDate;

    #[test]
    fn defaults_match_the_protocol() {
        let config = StudyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_age, 100);
        assert_eq!(config.max_imd, 32844);
        assert_eq!(config.census_date, NaiveDate::from_ymd_opt(2021, 3, 21).unwrap());
        let intervals = config.interval_list();
        assert_eq!(intervals.len(), 16);
        assert_eq!(
            intervals[15].end_date,
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
        );
        assert!(!config.disclosure_control.enabled);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: StudyConfig = toml::from_str(
            r#"
            census_date = "2021-03-22"

            [measures]
            imd_policy = "from_rounded_score"

            [dummy_data]
            population_size = 50
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.census_date, NaiveDate::from_ymd_opt(2021, 3, 22).unwrap());
        assert_eq!(config.measures.imd_policy, ImdPolicy::FromRoundedScore);
        assert_eq!(config.dummy_data.population_size, 50);
        assert_eq!(config.dummy_data.seed, 2025);
        assert_eq!(config.intervals.count, 16);
    }

    #[test]
    fn shipped_file_is_the_defaults() {
        let config: StudyConfig = toml::from_str(include_str!("../study.toml")).unwrap();
        assert_eq!(config, StudyConfig::default());
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let mut config = StudyConfig::default();
        config.study_end_date = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        assert!(config.validate().is_err());

        let mut config = StudyConfig::default();
        config.codelists.ethnicity.category_column = None;
        assert!(config.validate().is_err());

        assert!(toml::from_str::<StudyConfig>("max_agee = 3").is_err());
    }
}
