//! The study's per-patient datasets.
//!
//! Each cohort is a [`Population`] plus a row type. Rows are built in parallel but come out in
//! patient id order (and date order within a patient), so output files are reproducible.
use crate::{
    banding::{age_bands, year_of_birth_bands, Banding},
    derive::{
        address_on, age_on, count_events, days_between, first_event, first_registration_date,
        imd_quintile_on, latest_ethnicity, qualifying_events, region_on, year_of_birth,
    },
    eligibility::{has_qualifying_code, Criterion, DateRef, Population, RegistrationRule},
    util::ser_opt_display,
    ArcStr, CodelistRegistry, Extract, Interval, PatientId, PatientRecord, Sex, SnomedCode,
    StudyConfig,
};

use chrono::{Datelike, NaiveDate};
use qu::ick_use::*;
use rayon::prelude::*;
use serde::Serialize;

/// Whole-study migrant cohort: anyone ever given a migration code who was registered at some
/// point in the study period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullStudyRow {
    pub patient_id: PatientId,
    pub date_of_first_migration_code: Option<NaiveDate>,
    #[serde(serialize_with = "ser_opt_display")]
    pub first_migration_code: Option<SnomedCode>,
    pub number_of_migration_codes: usize,
    pub sex: Sex,
    pub has_cob_migrant_code: bool,
    pub has_asylum_or_refugee_migrant_code: bool,
    pub has_interpreter_migrant_code: bool,
    pub date_of_first_practice_registration: Option<NaiveDate>,
    /// Days from first registration to first migration code.
    pub time_to_first_migration_code: Option<i64>,
    #[serde(serialize_with = "ser_opt_display")]
    pub latest_ethnicity_code: Option<SnomedCode>,
    pub latest_ethnicity_group: ArcStr,
    pub year_of_birth: Option<i32>,
    /// Address fields are taken on census day.
    pub msoa_code: Option<ArcStr>,
    pub imd_decile: Option<u32>,
    pub imd_quintile: Option<u32>,
    #[serde(rename = "TPP_death_date")]
    pub tpp_death_date: Option<NaiveDate>,
    pub ons_death_date: Option<NaiveDate>,
}

/// Migrants registered and alive on census day 2021.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Census2021Row {
    pub patient_id: PatientId,
    pub age: i32,
    pub age_band: &'static str,
    pub sex: Sex,
    pub latest_ethnicity_group: ArcStr,
    pub region: ArcStr,
    pub imd_quintile: Option<u32>,
    pub has_cob_migrant_code: bool,
    pub has_asylum_or_refugee_migrant_code: bool,
    pub has_interpreter_migrant_code: bool,
}

/// One row per patient per year they were a registered migrant on 1 January.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnualCohortRow {
    pub patient_id: PatientId,
    pub year: i32,
    pub age: i32,
    pub age_band: &'static str,
    pub sex: Sex,
    pub ethnicity: ArcStr,
    pub region: ArcStr,
    pub imd_quintile: Option<u32>,
    pub has_cob_migrant_code: bool,
    pub has_asylum_or_refugee_migrant_code: bool,
    pub has_interpreter_migrant_code: bool,
}

/// Everyone registered during the study, for time from registration to first migration code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeToFirstCodeRow {
    pub patient_id: PatientId,
    pub date_of_first_practice_registration: Option<NaiveDate>,
    pub has_a_migration_code: bool,
    pub date_of_first_migration_code: Option<NaiveDate>,
    pub number_of_migration_codes: usize,
    pub sex: Sex,
    pub year_of_birth: Option<i32>,
    pub year_of_birth_band: &'static str,
}

/// A migration code given to a member of the full study cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationEventRow {
    pub patient_id: PatientId,
    pub date: NaiveDate,
    pub snomedct_code: SnomedCode,
}

/// Which kinds of migration code a patient has.
struct CategoryFlags {
    cob: bool,
    asylum_refugee: bool,
    interpreter: bool,
}

/// The study's settings and codelists, from which every cohort is built.
#[derive(Debug, Clone, Copy)]
pub struct Study<'a> {
    pub config: &'a StudyConfig,
    pub codelists: &'a CodelistRegistry,
}

impl<'a> Study<'a> {
    pub fn new(config: &'a StudyConfig, codelists: &'a CodelistRegistry) -> Self {
        Self { config, codelists }
    }

    fn registered_during_study(&self) -> Criterion {
        let study = self.config.study_period();
        Criterion::Registered(RegistrationRule::OverlapsWindow {
            start: DateRef::Fixed(study.start_date),
            end: DateRef::Fixed(study.end_date),
        })
    }

    fn has_migrant_code(&self, on_or_before: Option<DateRef>) -> Criterion {
        Criterion::HasCode {
            codelist: self.codelists.all_migrant.clone(),
            on_or_before,
        }
    }

    pub fn full_study_population(&self) -> Population {
        Population::new("full study cohort")
            .and(self.has_migrant_code(None))
            .and(self.registered_during_study())
            .and(Criterion::NonDisclosiveSex)
    }

    pub fn census_2021_population(&self) -> Population {
        let census = DateRef::Fixed(self.config.census_date);
        Population::new("census 2021 cohort")
            .and(self.has_migrant_code(Some(census)))
            .and(Criterion::Registered(RegistrationRule::ActiveOn(census)))
            .and(Criterion::NonDisclosiveSex)
            .and(Criterion::AliveOn(census))
            .and(Criterion::AgeAtMost {
                on: census,
                max_age: self.config.max_age,
            })
    }

    /// Evaluated per interval, on the interval's first day.
    pub fn annual_population(&self) -> Population {
        let jan_1 = DateRef::IntervalStart;
        Population::new("annual cohort")
            .and(Criterion::AliveOn(jan_1))
            .and(Criterion::Registered(RegistrationRule::ActiveOn(jan_1)))
            .and(self.has_migrant_code(Some(jan_1)))
            .and(Criterion::NonDisclosiveSex)
            .and(Criterion::AgeAtMost {
                on: jan_1,
                max_age: self.config.max_age,
            })
    }

    pub fn time_to_first_code_population(&self) -> Population {
        let start = DateRef::Fixed(self.config.study_start_date);
        Population::new("time to first migration code cohort")
            .and(self.registered_during_study())
            .and(Criterion::NonDisclosiveSex)
            .and(Criterion::AliveOn(start))
            .and(Criterion::AgeAtMost {
                on: start,
                max_age: self.config.max_age,
            })
    }

    pub fn full_study_cohort(&self, extract: &Extract) -> Result<Vec<FullStudyRow>> {
        let population = self.full_study_population();
        population.validate(false)?;
        let rows: Vec<_> = extract
            .par_iter()
            .filter(|record| population.contains(record, None))
            .map(|record| self.full_study_row(record))
            .collect();
        log_size(&population, rows.len(), extract.len());
        Ok(rows)
    }

    pub fn full_study_row(&self, record: &PatientRecord) -> FullStudyRow {
        let migrants = &self.codelists.all_migrant;
        let first = first_event(record, migrants, None);
        let date_of_first_migration_code = first.map(|evt| evt.date);
        let date_of_first_practice_registration = first_registration_date(record);
        let ethnicity = latest_ethnicity(record, &self.codelists.ethnicity, None);
        let address = address_on(record, self.config.census_date);
        let flags = self.category_flags(record, None);
        FullStudyRow {
            patient_id: record.patient_id(),
            date_of_first_migration_code,
            first_migration_code: first.map(|evt| evt.snomedct_code),
            number_of_migration_codes: count_events(record, migrants, None),
            sex: record.patient.sex,
            has_cob_migrant_code: flags.cob,
            has_asylum_or_refugee_migrant_code: flags.asylum_refugee,
            has_interpreter_migrant_code: flags.interpreter,
            date_of_first_practice_registration,
            time_to_first_migration_code: days_between(
                date_of_first_practice_registration,
                date_of_first_migration_code,
            ),
            latest_ethnicity_code: ethnicity.code,
            latest_ethnicity_group: ethnicity.group,
            year_of_birth: year_of_birth(&record.patient),
            msoa_code: address.and_then(|addr| addr.msoa_code.clone()),
            imd_decile: address.and_then(|addr| addr.imd_decile),
            imd_quintile: address.and_then(|addr| {
                self.config
                    .datasets
                    .imd_policy
                    .quintile(addr, self.config.max_imd)
            }),
            tpp_death_date: record.patient.date_of_death,
            ons_death_date: record.ons_death_date,
        }
    }

    pub fn census_2021_cohort(&self, extract: &Extract) -> Result<Vec<Census2021Row>> {
        let population = self.census_2021_population();
        population.validate(false)?;
        let census = self.config.census_date;
        let bands = age_bands();
        let rows: Vec<_> = extract
            .par_iter()
            .filter(|record| population.contains(record, None))
            .filter_map(|record| {
                let age = age_on(&record.patient, census)?;
                let flags = self.category_flags(record, Some(census));
                Some(Census2021Row {
                    patient_id: record.patient_id(),
                    age,
                    age_band: bands.band(Some(age)),
                    sex: record.patient.sex,
                    latest_ethnicity_group: latest_ethnicity(
                        record,
                        &self.codelists.ethnicity,
                        Some(census),
                    )
                    .group,
                    region: region_on(record, census).into(),
                    imd_quintile: imd_quintile_on(
                        record,
                        census,
                        self.config.datasets.imd_policy,
                        self.config.max_imd,
                    ),
                    has_cob_migrant_code: flags.cob,
                    has_asylum_or_refugee_migrant_code: flags.asylum_refugee,
                    has_interpreter_migrant_code: flags.interpreter,
                })
            })
            .collect();
        log_size(&population, rows.len(), extract.len());
        Ok(rows)
    }

    /// Rows are ordered by patient, then year.
    pub fn annual_cohort(&self, extract: &Extract) -> Result<Vec<AnnualCohortRow>> {
        let population = self.annual_population();
        population.validate(true)?;
        let intervals = self.config.interval_list();
        let bands = age_bands();
        let rows: Vec<_> = extract
            .par_iter()
            .flat_map_iter(|record| {
                intervals
                    .iter()
                    .filter(|interval| population.contains(record, Some(interval)))
                    .filter_map(|interval| self.annual_row(record, interval, &bands))
                    .collect::<Vec<_>>()
            })
            .collect();
        event!(
            Level::INFO,
            "{}: {} patient-years over {} intervals",
            population.name(),
            rows.len(),
            intervals.len()
        );
        Ok(rows)
    }

    fn annual_row(
        &self,
        record: &PatientRecord,
        interval: &Interval,
        bands: &Banding<i32>,
    ) -> Option<AnnualCohortRow> {
        let jan_1 = interval.start_date;
        let age = age_on(&record.patient, jan_1)?;
        let flags = self.category_flags(record, Some(jan_1));
        Some(AnnualCohortRow {
            patient_id: record.patient_id(),
            year: jan_1.year(),
            age,
            age_band: bands.band(Some(age)),
            sex: record.patient.sex,
            ethnicity: latest_ethnicity(record, &self.codelists.ethnicity, Some(jan_1)).group,
            region: region_on(record, jan_1).into(),
            imd_quintile: imd_quintile_on(
                record,
                jan_1,
                self.config.datasets.imd_policy,
                self.config.max_imd,
            ),
            has_cob_migrant_code: flags.cob,
            has_asylum_or_refugee_migrant_code: flags.asylum_refugee,
            has_interpreter_migrant_code: flags.interpreter,
        })
    }

    pub fn time_to_first_code_cohort(
        &self,
        extract: &Extract,
    ) -> Result<Vec<TimeToFirstCodeRow>> {
        let population = self.time_to_first_code_population();
        population.validate(false)?;
        let migrants = &self.codelists.all_migrant;
        let bands = year_of_birth_bands();
        let rows: Vec<_> = extract
            .par_iter()
            .filter(|record| population.contains(record, None))
            .map(|record| {
                let year_of_birth = year_of_birth(&record.patient);
                TimeToFirstCodeRow {
                    patient_id: record.patient_id(),
                    date_of_first_practice_registration: first_registration_date(record),
                    has_a_migration_code: has_qualifying_code(record, migrants, None),
                    date_of_first_migration_code: first_event(record, migrants, None)
                        .map(|evt| evt.date),
                    number_of_migration_codes: count_events(record, migrants, None),
                    sex: record.patient.sex,
                    year_of_birth,
                    year_of_birth_band: bands.band(year_of_birth),
                }
            })
            .collect();
        log_size(&population, rows.len(), extract.len());
        Ok(rows)
    }

    /// Every migration code of every full-study-cohort member, in date order per patient.
    pub fn migration_events(&self, extract: &Extract) -> Result<Vec<MigrationEventRow>> {
        let population = self.full_study_population();
        population.validate(false)?;
        let migrants = &self.codelists.all_migrant;
        let rows: Vec<_> = extract
            .par_iter()
            .filter(|record| population.contains(record, None))
            .flat_map_iter(|record| {
                let mut events: Vec<_> = qualifying_events(record, migrants, None).collect();
                events.sort_by_key(|(idx, evt)| (evt.date, *idx));
                events
                    .into_iter()
                    .map(|(_, evt)| MigrationEventRow {
                        patient_id: evt.patient_id,
                        date: evt.date,
                        snomedct_code: evt.snomedct_code,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        event!(
            Level::INFO,
            "{}: {} migration events",
            population.name(),
            rows.len()
        );
        Ok(rows)
    }

    fn category_flags(
        &self,
        record: &PatientRecord,
        on_or_before: Option<NaiveDate>,
    ) -> CategoryFlags {
        let has = |codelist| has_qualifying_code(record, codelist, on_or_before);
        CategoryFlags {
            cob: has(&self.codelists.cob_migrant),
            asylum_refugee: has(&self.codelists.asylum_refugee_migrant),
            interpreter: has(&self.codelists.interpreter_migrant),
        }
    }
}

fn log_size(population: &Population, size: usize, total: usize) {
    event!(
        Level::INFO,
        "{}: {} of {} patients",
        population.name(),
        size,
        total
    );
}
