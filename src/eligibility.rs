//! Population membership.
//!
//! A [`Population`] is a list of [`Criterion`]s that must all hold. Each criterion is one of the
//! predicates below, with its dates given as [`DateRef`]s so the same population can be evaluated
//! on a fixed day or against each of a run of intervals.
use crate::{
    derive::age_on,
    extract::{Patient, PatientRecord},
    Codelist, Interval,
};

use chrono::NaiveDate;
use qu::ick_use::*;

/// False once either the practice or the ONS register records a death on or before `date`.
pub fn is_alive(record: &PatientRecord, date: NaiveDate) -> bool {
    let died_by = |death: Option<NaiveDate>| death.map_or(false, |death| death <= date);
    !died_by(record.patient.date_of_death) && !died_by(record.ons_death_date)
}

/// Some registration covers `date`. Both ends of a registration are inclusive.
pub fn is_registered(record: &PatientRecord, date: NaiveDate) -> bool {
    record
        .registrations
        .iter()
        .any(|reg| reg.start_date <= date && reg.end_date.map_or(true, |end| end >= date))
}

/// Some registration overlaps `window`.
///
/// A registration ending on the first day of the window does not count. One starting on the
/// last day does.
pub fn registered_during(record: &PatientRecord, window: &Interval) -> bool {
    record.registrations.iter().any(|reg| {
        reg.end_date.map_or(true, |end| end > window.start_date)
            && reg.start_date <= window.end_date
    })
}

pub fn has_non_disclosive_sex(patient: &Patient) -> bool {
    !patient.sex.is_disclosive()
}

/// Patients without a date of birth have no age and fail.
pub fn age_at_most(patient: &Patient, date: NaiveDate, max_age: u32) -> bool {
    age_on(patient, date).map_or(false, |age| age <= max_age as i32)
}

/// Any event in `codelist`, optionally only those on or before a date.
pub fn has_qualifying_code(
    record: &PatientRecord,
    codelist: &Codelist,
    on_or_before: Option<NaiveDate>,
) -> bool {
    record.events.iter().any(|evt| {
        codelist.contains(evt.snomedct_code) && on_or_before.map_or(true, |d| evt.date <= d)
    })
}

/// A date used by a criterion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DateRef {
    Fixed(NaiveDate),
    /// The first day of the interval being evaluated.
    IntervalStart,
    /// The last day of the interval being evaluated.
    IntervalEnd,
}

impl DateRef {
    pub fn resolve(self, interval: Option<&Interval>) -> Option<NaiveDate> {
        match self {
            DateRef::Fixed(date) => Some(date),
            DateRef::IntervalStart => interval.map(|i| i.start_date),
            DateRef::IntervalEnd => interval.map(|i| i.end_date),
        }
    }

    fn needs_interval(self) -> bool {
        !matches!(self, DateRef::Fixed(_))
    }
}

/// The two meanings of "registered" used by the study.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegistrationRule {
    /// Registered on the day ([`is_registered`]).
    ActiveOn(DateRef),
    /// Registered at some point in the window ([`registered_during`]).
    OverlapsWindow { start: DateRef, end: DateRef },
}

#[derive(Debug, Clone)]
pub enum Criterion {
    AliveOn(DateRef),
    Registered(RegistrationRule),
    NonDisclosiveSex,
    AgeAtMost {
        on: DateRef,
        max_age: u32,
    },
    HasCode {
        codelist: Codelist,
        /// `None` means at any time.
        on_or_before: Option<DateRef>,
    },
}

impl Criterion {
    fn date_refs(&self) -> Vec<DateRef> {
        match self {
            Criterion::AliveOn(date) => vec![*date],
            Criterion::Registered(RegistrationRule::ActiveOn(date)) => vec![*date],
            Criterion::Registered(RegistrationRule::OverlapsWindow { start, end }) => {
                vec![*start, *end]
            }
            Criterion::NonDisclosiveSex => vec![],
            Criterion::AgeAtMost { on, .. } => vec![*on],
            Criterion::HasCode { on_or_before, .. } => on_or_before.iter().copied().collect(),
        }
    }

    /// Whether the criterion holds. A date that can't be resolved fails the criterion;
    /// [`Population::validate`] rules that out up front.
    pub fn is_met(&self, record: &PatientRecord, interval: Option<&Interval>) -> bool {
        match self {
            Criterion::AliveOn(date) => date
                .resolve(interval)
                .map_or(false, |date| is_alive(record, date)),
            Criterion::Registered(RegistrationRule::ActiveOn(date)) => date
                .resolve(interval)
                .map_or(false, |date| is_registered(record, date)),
            Criterion::Registered(RegistrationRule::OverlapsWindow { start, end }) => {
                match (start.resolve(interval), end.resolve(interval)) {
                    (Some(start), Some(end)) if start <= end => {
                        registered_during(record, &Interval::new(start, end))
                    }
                    _ => false,
                }
            }
            Criterion::NonDisclosiveSex => has_non_disclosive_sex(&record.patient),
            Criterion::AgeAtMost { on, max_age } => on
                .resolve(interval)
                .map_or(false, |date| age_at_most(&record.patient, date, *max_age)),
            Criterion::HasCode {
                codelist,
                on_or_before,
            } => match on_or_before {
                Some(date) => date.resolve(interval).map_or(false, |date| {
                    has_qualifying_code(record, codelist, Some(date))
                }),
                None => has_qualifying_code(record, codelist, None),
            },
        }
    }
}

/// A named conjunction of criteria.
#[derive(Debug, Clone)]
pub struct Population {
    name: &'static str,
    criteria: Vec<Criterion>,
}

impl Population {
    /// An empty population matches everyone.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            criteria: vec![],
        }
    }

    pub fn and(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Check every date can be resolved before evaluating anyone.
    pub fn validate(&self, has_interval: bool) -> Result {
        for criterion in &self.criteria {
            let refs = criterion.date_refs();
            if !has_interval {
                ensure!(
                    refs.iter().all(|date| !date.needs_interval()),
                    "population \"{}\" has a criterion relative to an interval ({:?}) but is \
                     not evaluated over intervals",
                    self.name,
                    criterion
                );
            }
            if let Criterion::Registered(RegistrationRule::OverlapsWindow {
                start: DateRef::Fixed(start),
                end: DateRef::Fixed(end),
            }) = criterion
            {
                ensure!(
                    start <= end,
                    "population \"{}\" has a registration window ending ({}) before it starts ({})",
                    self.name,
                    end,
                    start
                );
            }
        }
        Ok(())
    }

    pub fn contains(&self, record: &PatientRecord, interval: Option<&Interval>) -> bool {
        self.criteria
            .iter()
            .all(|criterion| criterion.is_met(record, interval))
    }

    /// Evaluate with every interval-relative date set to `reference_date`.
    pub fn is_eligible(&self, record: &PatientRecord, reference_date: NaiveDate) -> bool {
        self.contains(record, Some(&Interval::new(reference_date, reference_date)))
    }

    /// The members of the population among `records`.
    pub fn select<'a>(
        &self,
        records: impl IntoIterator<Item = &'a PatientRecord>,
        interval: Option<&Interval>,
    ) -> Vec<&'a PatientRecord> {
        records
            .into_iter()
            .filter(|record| self.contains(record, interval))
            .collect()
    }
}
