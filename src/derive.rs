//! Per-patient derived variables.
//!
//! Everything here is a pure function of one patient record. Missing inputs give `None`, never a
//! panic, and `None` propagates through anything computed from it.
use crate::{
    extract::{Address, ClinicalEvent, Patient, PatientRecord, Registration},
    ArcStr, Codelist, SnomedCode,
};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Group given to patients with no categorised ethnicity code.
pub const UNKNOWN_ETHNICITY: &str = "unknown";
/// Region given to patients whose practice has no recorded region.
pub const UNKNOWN_REGION: &str = "unknown";

/// Events in `codelist` dated on or before `on_or_before` (all of them when `None`), paired with
/// their position in the record.
pub fn qualifying_events<'a>(
    record: &'a PatientRecord,
    codelist: &'a Codelist,
    on_or_before: Option<NaiveDate>,
) -> impl Iterator<Item = (usize, &'a ClinicalEvent)> + 'a {
    record.events.iter().enumerate().filter(move |(_, evt)| {
        codelist.contains(evt.snomedct_code) && on_or_before.map_or(true, |d| evt.date <= d)
    })
}

/// Which end of a patient's qualifying events to take.
///
/// Events are ordered by date, then by their position in the extract, so there is never a tie.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventSelection {
    First,
    Last,
}

impl EventSelection {
    pub fn select<'a>(
        self,
        record: &'a PatientRecord,
        codelist: &'a Codelist,
        on_or_before: Option<NaiveDate>,
    ) -> Option<&'a ClinicalEvent> {
        let events = qualifying_events(record, codelist, on_or_before);
        let key = |(idx, evt): &(usize, &ClinicalEvent)| (evt.date, *idx);
        match self {
            EventSelection::First => events.min_by_key(key),
            EventSelection::Last => events.max_by_key(key),
        }
        .map(|(_, evt)| evt)
    }
}

/// The earliest qualifying event. Events on the same date are ordered as in the extract.
pub fn first_event<'a>(
    record: &'a PatientRecord,
    codelist: &'a Codelist,
    on_or_before: Option<NaiveDate>,
) -> Option<&'a ClinicalEvent> {
    EventSelection::First.select(record, codelist, on_or_before)
}

/// The latest qualifying event. Of events on the same date, the last one in the extract wins.
pub fn last_event<'a>(
    record: &'a PatientRecord,
    codelist: &'a Codelist,
    on_or_before: Option<NaiveDate>,
) -> Option<&'a ClinicalEvent> {
    EventSelection::Last.select(record, codelist, on_or_before)
}

pub fn count_events(
    record: &PatientRecord,
    codelist: &Codelist,
    on_or_before: Option<NaiveDate>,
) -> usize {
    qualifying_events(record, codelist, on_or_before).count()
}

/// Days from `from` to `to`, negative if `to` is earlier.
pub fn days_between(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<i64> {
    Some((to? - from?).num_days())
}

/// Age in whole years on `date`. Negative before the date of birth.
pub fn age_on(patient: &Patient, date: NaiveDate) -> Option<i32> {
    let dob = patient.date_of_birth?;
    let mut age = date.year() - dob.year();
    if (date.month(), date.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    Some(age)
}

pub fn year_of_birth(patient: &Patient) -> Option<i32> {
    patient.date_of_birth.map(|dob| dob.year())
}

/// The start of the patient's earliest registration.
pub fn first_registration_date(record: &PatientRecord) -> Option<NaiveDate> {
    record.registrations.iter().map(|reg| reg.start_date).min()
}

/// A patient's most recent ethnicity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ethnicity {
    /// The code of the latest ethnicity event, if any.
    pub code: Option<SnomedCode>,
    /// Its group, or [`UNKNOWN_ETHNICITY`].
    pub group: ArcStr,
}

/// Map the latest ethnicity code to its group.
pub fn latest_ethnicity(
    record: &PatientRecord,
    ethnicity: &Codelist,
    on_or_before: Option<NaiveDate>,
) -> Ethnicity {
    let code = last_event(record, ethnicity, on_or_before).map(|evt| evt.snomedct_code);
    let group = code
        .and_then(|code| ethnicity.category_of(code))
        .cloned()
        .unwrap_or_else(|| UNKNOWN_ETHNICITY.into());
    Ethnicity { code, group }
}

/// The address the patient lived at on `date`.
///
/// An address counts from its start date up to but not including its end date. If more than one
/// matches, prefer the latest start, then an open end (or the latest end), then the last row.
pub fn address_on(record: &PatientRecord, date: NaiveDate) -> Option<&Address> {
    record
        .addresses
        .iter()
        .enumerate()
        .filter(|(_, addr)| {
            addr.start_date <= date && addr.end_date.map_or(true, |end| end > date)
        })
        .max_by_key(|(idx, addr)| {
            (
                addr.start_date,
                addr.end_date.is_none(),
                addr.end_date,
                *idx,
            )
        })
        .map(|(_, addr)| addr)
}

/// The practice registration active on `date`, preferring the latest start, then the last row.
pub fn registration_on(record: &PatientRecord, date: NaiveDate) -> Option<&Registration> {
    record
        .registrations
        .iter()
        .enumerate()
        .filter(|(_, reg)| reg.start_date <= date && reg.end_date.map_or(true, |end| end >= date))
        .max_by_key(|(idx, reg)| (reg.start_date, *idx))
        .map(|(_, reg)| reg)
}

/// NUTS1 region of the practice on `date`.
pub fn region_on(record: &PatientRecord, date: NaiveDate) -> &str {
    registration_on(record, date)
        .and_then(|reg| reg.practice_nuts1_region_name.as_deref())
        .unwrap_or(UNKNOWN_REGION)
}

/// How to get an IMD quintile from an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImdPolicy {
    /// Use the `imd_quintile` field of the address.
    Precomputed,
    /// Split `imd_rounded` into five equal bands of `0..=max_imd`.
    FromRoundedScore,
}

impl ImdPolicy {
    /// 1 is the most deprived fifth.
    pub fn quintile(self, address: &Address, max_imd: u32) -> Option<u32> {
        match self {
            ImdPolicy::Precomputed => address.imd_quintile,
            ImdPolicy::FromRoundedScore => quintile_from_rounded(address.imd_rounded?, max_imd),
        }
    }
}

/// Quintile `k` covers `[floor(max * (k - 1) / 5), floor(max * k / 5))`, with the last quintile
/// closed at `max`. Values above `max` have no quintile.
pub fn quintile_from_rounded(imd_rounded: u32, max_imd: u32) -> Option<u32> {
    let max = u64::from(max_imd);
    let value = u64::from(imd_rounded);
    (1..5u32)
        .find(|k| value < max * u64::from(*k) / 5)
        .or_else(|| (value <= max).then_some(5))
}

/// IMD quintile of the address on `date`.
pub fn imd_quintile_on(
    record: &PatientRecord,
    date: NaiveDate,
    policy: ImdPolicy,
    max_imd: u32,
) -> Option<u32> {
    policy.quintile(address_on(record, date)?, max_imd)
}
