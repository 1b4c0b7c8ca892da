//! Synthetic extracts for trying the pipeline without real patient data.
//!
//! Shares of sex and ethnicity follow Pathak et al.'s CPRD GOLD migrant cohort. Everything else
//! is uniform over plausible ranges. The same seed always gives the same extract.
use crate::{
    extract::{Address, PatientRecord, Sex},
    CodelistRegistry, Extract, MigrantCategory, PatientId, SnomedCode, StudyConfig,
};

use chrono::{Duration, NaiveDate};
use qu::ick_use::*;
use rand::{
    distr::{weighted::WeightedIndex, Distribution},
    rngs::StdRng,
    seq::IndexedRandom,
    Rng, SeedableRng,
};

/// Ethnic groups of the migrant cohort, the words that pick out matching ethnicity codelist
/// categories, and their (unnormalised) shares.
const ETHNICITIES: [(&str, &[&str], f64); 7] = [
    ("White British", &["white"], 0.0152),
    ("White Non-British", &["white"], 0.343),
    ("Mixed", &["mixed"], 0.0273),
    ("Asian/Asian British", &["asian"], 0.267),
    ("Black/African/Caribbean/Black British", &["black"], 0.0919),
    ("Other", &["other", "chinese"], 0.0779),
    ("Unknown", &[], 0.178),
];

const MALE_SHARE: f64 = 0.463;
/// Intersex or unknown sex, so the sex filter has something to remove.
const DISCLOSIVE_SEX_SHARE: f64 = 0.02;

const NUTS1_REGIONS: [&str; 9] = [
    "North East",
    "North West",
    "Yorkshire and The Humber",
    "East Midlands",
    "West Midlands",
    "East",
    "London",
    "South East",
    "South West",
];

const MIGRANT_SHARE: f64 = 0.5;
const MAX_MIGRATION_CODES: usize = 4;

/// Generate `config.dummy_data.population_size` patients from `config.dummy_data.seed`.
pub fn generate(config: &StudyConfig, codelists: &CodelistRegistry) -> Result<Extract> {
    let rng = StdRng::seed_from_u64(config.dummy_data.seed);
    let mut generator = Generator::new(config, codelists, rng)?;
    let records = (1..=config.dummy_data.population_size as PatientId)
        .map(|id| generator.patient(id))
        .collect();
    let extract = Extract::from_records(records);
    event!(
        Level::INFO,
        "generated {} dummy patients (seed {})",
        extract.len(),
        config.dummy_data.seed
    );
    Ok(extract)
}

struct Generator<'a> {
    config: &'a StudyConfig,
    rng: StdRng,
    ethnicity_dist: WeightedIndex<f64>,
    /// Ethnicity codes for each entry of `ETHNICITIES`.
    ethnicity_codes: Vec<Vec<SnomedCode>>,
    category_dist: WeightedIndex<f64>,
    /// Migration codes for each migrant category, in `MigrantCategory::ALL` order.
    migration_codes: Vec<Vec<SnomedCode>>,
}

impl<'a> Generator<'a> {
    fn new(config: &'a StudyConfig, codelists: &CodelistRegistry, rng: StdRng) -> Result<Self> {
        config.validate()?;
        let ethnicity_dist = WeightedIndex::new(ETHNICITIES.iter().map(|(_, _, share)| *share))
            .context("bad ethnicity shares")?;
        let ethnicity_codes: Vec<Vec<SnomedCode>> = ETHNICITIES
            .iter()
            .map(|(_, words, _)| {
                codelists
                    .ethnicity
                    .iter()
                    .filter(|(_, category)| {
                        category.map_or(false, |category| {
                            let category = category.to_lowercase();
                            words.iter().any(|word| category.contains(word))
                        })
                    })
                    .map(|(code, _)| code)
                    .collect()
            })
            .collect();
        for ((name, _, _), codes) in ETHNICITIES.iter().zip(&ethnicity_codes) {
            if codes.is_empty() && *name != "Unknown" {
                event!(
                    Level::WARN,
                    "no ethnicity codes match \"{}\", those patients get no ethnicity code",
                    name
                );
            }
        }

        let migration_codes: Vec<Vec<SnomedCode>> = MigrantCategory::ALL
            .iter()
            .map(|category| {
                codelists
                    .migrant(*category)
                    .iter()
                    .map(|(code, _)| code)
                    .collect()
            })
            .collect();
        ensure!(
            !migration_codes[0].is_empty(),
            "the migration codelist \"{}\" is empty",
            codelists.all_migrant.name()
        );
        // any, country of birth, asylum or refugee, interpreter
        let category_dist =
            WeightedIndex::new([0.5, 0.3, 0.1, 0.1]).context("bad migrant category shares")?;

        Ok(Self {
            config,
            rng,
            ethnicity_dist,
            ethnicity_codes,
            category_dist,
            migration_codes,
        })
    }

    fn patient(&mut self, id: PatientId) -> PatientRecord {
        let study_start = self.config.study_start_date;
        let study_end = self.config.study_end_date;
        let earliest_birth = study_start - Duration::days(365 * i64::from(self.config.max_age));

        let sex = self.sex();
        let date_of_birth = self.date_between(earliest_birth, study_end);
        let mut record = PatientRecord::new(
            id,
            (!self.rng.random_bool(0.02)).then_some(date_of_birth),
            sex,
        );

        let reg_start = self.date_between(date_of_birth.max(earliest_birth), study_end);
        let reg_end = self
            .rng
            .random_bool(0.3)
            .then(|| self.date_between(reg_start, study_end + Duration::days(365)));
        record = self.registration(record, reg_start, reg_end);
        if let Some(end) = reg_end {
            if end < study_end && self.rng.random_bool(0.5) {
                let next_start = self.date_between(end, study_end);
                record = self.registration(record, next_start, None);
            }
        }

        if !self.rng.random_bool(0.05) {
            record = record.address(self.address(reg_start));
        }

        let ethnicity = self.ethnicity_dist.sample(&mut self.rng);
        if let Some(code) = self.ethnicity_codes[ethnicity].choose(&mut self.rng).copied() {
            let date = self.date_between(reg_start, study_end);
            record = record.event(date, code);
        }

        if self.rng.random_bool(MIGRANT_SHARE) {
            for _ in 0..self.rng.random_range(1..=MAX_MIGRATION_CODES) {
                let category = self.category_dist.sample(&mut self.rng);
                let codes = match &self.migration_codes[category] {
                    codes if codes.is_empty() => &self.migration_codes[0],
                    codes => codes,
                };
                if let Some(code) = codes.choose(&mut self.rng).copied() {
                    let date = self.date_between(reg_start, study_end);
                    record = record.event(date, code);
                }
            }
        }

        if self.rng.random_bool(0.05) {
            let date = self.date_between(reg_start, study_end);
            // one of the two sources may not have recorded it
            match self.rng.random_range(0..10) {
                0 => record = record.died(date),
                1 => record = record.ons_death(date),
                _ => record = record.died(date).ons_death(date),
            }
        }
        record
    }

    fn sex(&mut self) -> Sex {
        if self.rng.random_bool(DISCLOSIVE_SEX_SHARE) {
            if self.rng.random_bool(0.5) {
                Sex::Intersex
            } else {
                Sex::Unknown
            }
        } else if self.rng.random_bool(MALE_SHARE) {
            Sex::Male
        } else {
            Sex::Female
        }
    }

    fn registration(
        &mut self,
        record: PatientRecord,
        start: NaiveDate,
        end: Option<NaiveDate>,
    ) -> PatientRecord {
        let practice = self.rng.random_range(1..=200u64);
        let region = (!self.rng.random_bool(0.05))
            .then(|| NUTS1_REGIONS.choose(&mut self.rng).copied())
            .flatten();
        record.registered_at(start, end, practice, region)
    }

    fn address(&mut self, start: NaiveDate) -> Address {
        let max_imd = self.config.max_imd;
        let imd_rounded = self.rng.random_range(0..=max_imd / 100) * 100;
        let imd_decile = (u64::from(imd_rounded) * 10 / (u64::from(max_imd) + 1)) as u32 + 1;
        Address {
            patient_id: 0,
            start_date: start,
            end_date: None,
            imd_rounded: Some(imd_rounded),
            imd_decile: Some(imd_decile),
            imd_quintile: Some((imd_decile + 1) / 2),
            msoa_code: Some(format!("E02{:06}", self.rng.random_range(1..=7201)).into()),
        }
    }

    /// A uniformly random date in `from..=to`, or `from` if the range is empty.
    fn date_between(&mut self, from: NaiveDate, to: NaiveDate) -> NaiveDate {
        let span = (to - from).num_days();
        if span <= 0 {
            return from;
        }
        from + Duration::days(self.rng.random_range(0..=span))
    }
}
