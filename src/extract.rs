//! The EHR extract: five plain tables, grouped into one record per patient.
//!
//! An extract directory holds `patients.csv`, `practice_registrations.csv`,
//! `clinical_events.csv`, `addresses.csv` and `ons_deaths.csv`. Dates are ISO 8601 and an empty
//! cell is null. Rows that can't be used (no start date, malformed code, unknown patient) are
//! reported and skipped.
use crate::{
    load, read_csv, save,
    util::{maybe_snomed, opt_date, optional_string, optional_u32, path_exists, sex},
    write_csv, ArcStr, PatientId, SnomedCode,
};

use chrono::NaiveDate;
use qu::ick_use::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, ops::Deref, path::Path, sync::Arc};

pub const PATIENTS_FILE: &str = "patients.csv";
pub const REGISTRATIONS_FILE: &str = "practice_registrations.csv";
pub const EVENTS_FILE: &str = "clinical_events.csv";
pub const ADDRESSES_FILE: &str = "addresses.csv";
pub const ONS_DEATHS_FILE: &str = "ons_deaths.csv";

/// Sex as recorded in the patients table.
///
/// Ordering is arbitrary.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
    Intersex,
    Unknown,
}

impl Sex {
    /// Only `Male` and `Female` can be reported. Everything else is too rare to publish safely.
    pub fn is_disclosive(self) -> bool {
        !matches!(self, Sex::Male | Sex::Female)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
            Sex::Intersex => "intersex",
            Sex::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PatientRaw {
    patient_id: PatientId,
    #[serde(deserialize_with = "opt_date")]
    date_of_birth: Option<NaiveDate>,
    #[serde(deserialize_with = "sex")]
    sex: Sex,
    #[serde(deserialize_with = "opt_date")]
    date_of_death: Option<NaiveDate>,
}

/// A row in the patients table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: PatientId,
    pub date_of_birth: Option<NaiveDate>,
    pub sex: Sex,
    /// Date of death as recorded by the practice.
    pub date_of_death: Option<NaiveDate>,
}

impl From<PatientRaw> for Patient {
    fn from(from: PatientRaw) -> Self {
        Self {
            patient_id: from.patient_id,
            date_of_birth: from.date_of_birth,
            sex: from.sex,
            date_of_death: from.date_of_death,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegistrationRaw {
    patient_id: PatientId,
    #[serde(deserialize_with = "opt_date")]
    start_date: Option<NaiveDate>,
    #[serde(deserialize_with = "opt_date")]
    end_date: Option<NaiveDate>,
    practice_pseudo_id: u64,
    #[serde(deserialize_with = "optional_string")]
    practice_nuts1_region_name: Option<ArcStr>,
}

/// A period of registration with a practice. A null end date means the registration is ongoing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub patient_id: PatientId,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub practice_pseudo_id: u64,
    pub practice_nuts1_region_name: Option<ArcStr>,
}

impl Registration {
    fn from_raw(raw: RegistrationRaw) -> Option<Self> {
        let start_date = raw.start_date?;
        if matches!(raw.end_date, Some(end) if end < start_date) {
            return None;
        }
        Some(Registration {
            patient_id: raw.patient_id,
            start_date,
            end_date: raw.end_date,
            practice_pseudo_id: raw.practice_pseudo_id,
            practice_nuts1_region_name: raw.practice_nuts1_region_name,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EventRaw {
    patient_id: PatientId,
    #[serde(deserialize_with = "opt_date")]
    date: Option<NaiveDate>,
    #[serde(deserialize_with = "maybe_snomed")]
    snomedct_code: Option<SnomedCode>,
}

/// A coded observation in a patient's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalEvent {
    pub patient_id: PatientId,
    pub date: NaiveDate,
    pub snomedct_code: SnomedCode,
}

impl ClinicalEvent {
    fn from_raw(raw: EventRaw) -> Option<Self> {
        Some(ClinicalEvent {
            patient_id: raw.patient_id,
            date: raw.date?,
            snomedct_code: raw.snomedct_code?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AddressRaw {
    patient_id: PatientId,
    #[serde(deserialize_with = "opt_date")]
    start_date: Option<NaiveDate>,
    #[serde(deserialize_with = "opt_date")]
    end_date: Option<NaiveDate>,
    #[serde(deserialize_with = "optional_u32")]
    imd_rounded: Option<u32>,
    #[serde(deserialize_with = "optional_u32")]
    imd_decile: Option<u32>,
    #[serde(deserialize_with = "optional_u32")]
    imd_quintile: Option<u32>,
    #[serde(deserialize_with = "optional_string")]
    msoa_code: Option<ArcStr>,
}

/// A period at one address, with the deprivation fields of its area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub patient_id: PatientId,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    /// IMD rank rounded to the nearest 100.
    pub imd_rounded: Option<u32>,
    pub imd_decile: Option<u32>,
    pub imd_quintile: Option<u32>,
    pub msoa_code: Option<ArcStr>,
}

impl Address {
    fn from_raw(raw: AddressRaw) -> Option<Self> {
        let start_date = raw.start_date?;
        if matches!(raw.end_date, Some(end) if end < start_date) {
            return None;
        }
        Some(Address {
            patient_id: raw.patient_id,
            start_date,
            end_date: raw.end_date,
            imd_rounded: raw.imd_rounded,
            imd_decile: raw.imd_decile.filter(|v| (1..=10).contains(v)),
            imd_quintile: raw.imd_quintile.filter(|v| (1..=5).contains(v)),
            msoa_code: raw.msoa_code,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OnsDeathRaw {
    patient_id: PatientId,
    #[serde(deserialize_with = "opt_date")]
    date: Option<NaiveDate>,
}

/// A row in the ONS death register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnsDeath {
    pub patient_id: PatientId,
    pub date: Option<NaiveDate>,
}

impl From<OnsDeathRaw> for OnsDeath {
    fn from(from: OnsDeathRaw) -> Self {
        Self {
            patient_id: from.patient_id,
            date: from.date,
        }
    }
}

/// Everything the extract holds about one patient.
///
/// Registrations, events and addresses keep the order they had in the extract. That order is
/// the tie-break whenever two rows share a date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient: Patient,
    pub registrations: Vec<Registration>,
    pub events: Vec<ClinicalEvent>,
    pub addresses: Vec<Address>,
    /// Earliest death date in the ONS register.
    pub ons_death_date: Option<NaiveDate>,
}

impl PatientRecord {
    pub fn new(patient_id: PatientId, date_of_birth: Option<NaiveDate>, sex: Sex) -> Self {
        Self {
            patient: Patient {
                patient_id,
                date_of_birth,
                sex,
                date_of_death: None,
            },
            registrations: vec![],
            events: vec![],
            addresses: vec![],
            ons_death_date: None,
        }
    }

    pub fn patient_id(&self) -> PatientId {
        self.patient.patient_id
    }

    pub fn registered(self, start_date: NaiveDate, end_date: Option<NaiveDate>) -> Self {
        self.registered_at(start_date, end_date, 1, None)
    }

    pub fn registered_at(
        mut self,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        practice_pseudo_id: u64,
        region: Option<&str>,
    ) -> Self {
        self.registrations.push(Registration {
            patient_id: self.patient_id(),
            start_date,
            end_date,
            practice_pseudo_id,
            practice_nuts1_region_name: region.map(Into::into),
        });
        self
    }

    pub fn event(mut self, date: NaiveDate, snomedct_code: SnomedCode) -> Self {
        self.events.push(ClinicalEvent {
            patient_id: self.patient_id(),
            date,
            snomedct_code,
        });
        self
    }

    /// Add an address. The patient id is overwritten with this record's.
    pub fn address(mut self, mut address: Address) -> Self {
        address.patient_id = self.patient_id();
        self.addresses.push(address);
        self
    }

    pub fn died(mut self, date: NaiveDate) -> Self {
        self.patient.date_of_death = Some(date);
        self
    }

    pub fn ons_death(mut self, date: NaiveDate) -> Self {
        self.ons_death_date = Some(date);
        self
    }
}

/// The loaded extract: one record per patient, sorted by patient id, with an id index.
#[derive(Clone)]
pub struct Extract {
    els: Arc<Vec<PatientRecord>>,
    id_idx: BTreeMap<PatientId, usize>,
}

impl Extract {
    /// Group the five tables into patient records.
    ///
    /// Rows for patients not in `patients` are dropped, as are duplicate patients (the first row
    /// is kept).
    pub fn from_tables(
        patients: Vec<Patient>,
        registrations: Vec<Registration>,
        events: Vec<ClinicalEvent>,
        addresses: Vec<Address>,
        ons_deaths: Vec<OnsDeath>,
    ) -> Self {
        let mut records: BTreeMap<PatientId, PatientRecord> = BTreeMap::new();
        for patient in patients {
            let id = patient.patient_id;
            if records.contains_key(&id) {
                event!(Level::WARN, "duplicate patient with ID {}, skipping", id);
                continue;
            }
            records.insert(
                id,
                PatientRecord {
                    patient,
                    registrations: vec![],
                    events: vec![],
                    addresses: vec![],
                    ons_death_date: None,
                },
            );
        }

        let mut orphans = Orphans::default();
        for reg in registrations {
            match records.get_mut(&reg.patient_id) {
                Some(record) => record.registrations.push(reg),
                None => orphans.registrations += 1,
            }
        }
        for evt in events {
            match records.get_mut(&evt.patient_id) {
                Some(record) => record.events.push(evt),
                None => orphans.events += 1,
            }
        }
        for address in addresses {
            match records.get_mut(&address.patient_id) {
                Some(record) => record.addresses.push(address),
                None => orphans.addresses += 1,
            }
        }
        for death in ons_deaths {
            let Some(record) = records.get_mut(&death.patient_id) else {
                orphans.ons_deaths += 1;
                continue
            };
            record.ons_death_date = match (record.ons_death_date, death.date) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        orphans.report();

        Self::new(records.into_values().collect())
    }

    /// Build an extract from whole records.
    pub fn from_records(records: Vec<PatientRecord>) -> Self {
        let mut by_id = BTreeMap::new();
        for record in records {
            let id = record.patient_id();
            if by_id.contains_key(&id) {
                event!(Level::WARN, "duplicate patient with ID {}, skipping", id);
                continue;
            }
            by_id.insert(id, record);
        }
        Self::new(by_id.into_values().collect())
    }

    /// Load the CSV tables of an extract directory.
    pub fn load_csv(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let patients: Vec<PatientRaw> = read_csv(dir.join(PATIENTS_FILE))?;
        let registrations: Vec<RegistrationRaw> = read_csv(dir.join(REGISTRATIONS_FILE))?;
        let events: Vec<EventRaw> = read_csv(dir.join(EVENTS_FILE))?;
        let addresses: Vec<AddressRaw> = read_csv(dir.join(ADDRESSES_FILE))?;
        let ons_deaths: Vec<OnsDeathRaw> = read_csv(dir.join(ONS_DEATHS_FILE))?;

        let registrations = keep_valid(registrations, Registration::from_raw, REGISTRATIONS_FILE);
        let events = keep_valid(events, ClinicalEvent::from_raw, EVENTS_FILE);
        let addresses = keep_valid(addresses, Address::from_raw, ADDRESSES_FILE);

        let extract = Self::from_tables(
            patients.into_iter().map(Into::into).collect(),
            registrations,
            events,
            addresses,
            ons_deaths.into_iter().map(Into::into).collect(),
        );
        event!(
            Level::INFO,
            "loaded {} patients from \"{}\"",
            extract.len(),
            dir.display()
        );
        Ok(extract)
    }

    /// Write the extract back out as CSV tables.
    pub fn write_csv(&self, dir: impl AsRef<Path>) -> Result {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create \"{}\"", dir.display()))?;
        write_csv(self.iter().map(|r| &r.patient), dir.join(PATIENTS_FILE))?;
        write_csv(
            self.iter().flat_map(|r| r.registrations.iter()),
            dir.join(REGISTRATIONS_FILE),
        )?;
        write_csv(self.iter().flat_map(|r| r.events.iter()), dir.join(EVENTS_FILE))?;
        write_csv(
            self.iter().flat_map(|r| r.addresses.iter()),
            dir.join(ADDRESSES_FILE),
        )?;
        write_csv(
            self.iter().filter_map(|r| {
                r.ons_death_date.map(|date| OnsDeath {
                    patient_id: r.patient_id(),
                    date: Some(date),
                })
            }),
            dir.join(ONS_DEATHS_FILE),
        )?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(self.els.as_slice(), path)
    }

    /// Open either a bincode cache (`*.bin`) or an extract directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            path_exists(path)?,
            "no extract found at \"{}\"",
            path.display()
        );
        if path.is_dir() {
            Self::load_csv(path)
        } else {
            Self::load(path)
        }
    }

    pub fn find_by_id(&self, id: PatientId) -> Option<&PatientRecord> {
        let idx = self.id_idx.get(&id)?;
        self.els.get(*idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatientRecord> + '_ {
        self.els.iter()
    }

    fn new(els: Vec<PatientRecord>) -> Self {
        let mut this = Extract {
            els: Arc::new(els),
            id_idx: BTreeMap::new(),
        };
        this.rebuild_index();
        this
    }

    fn rebuild_index(&mut self) {
        self.id_idx = self
            .els
            .iter()
            .enumerate()
            .map(|(idx, el)| (el.patient_id(), idx))
            .collect();
    }
}

impl Deref for Extract {
    type Target = [PatientRecord];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl<'a> IntoParallelIterator for &'a Extract {
    type Item = &'a PatientRecord;
    type Iter = rayon::slice::Iter<'a, PatientRecord>;
    fn into_par_iter(self) -> Self::Iter {
        self.els.par_iter()
    }
}

impl PartialEq for Extract {
    fn eq(&self, other: &Self) -> bool {
        self.els == other.els
    }
}

impl fmt::Debug for Extract {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Extract")
            .field("patients", &self.els.len())
            .finish()
    }
}

#[derive(Default)]
struct Orphans {
    registrations: usize,
    events: usize,
    addresses: usize,
    ons_deaths: usize,
}

impl Orphans {
    fn report(&self) {
        for (count, table) in [
            (self.registrations, REGISTRATIONS_FILE),
            (self.events, EVENTS_FILE),
            (self.addresses, ADDRESSES_FILE),
            (self.ons_deaths, ONS_DEATHS_FILE),
        ] {
            if count > 0 {
                event!(
                    Level::WARN,
                    "skipped {} rows of {} for unknown patients",
                    count,
                    table
                );
            }
        }
    }
}

fn keep_valid<R, T>(rows: Vec<R>, f: impl Fn(R) -> Option<T>, table: &str) -> Vec<T> {
    let total = rows.len();
    let kept: Vec<T> = rows.into_iter().filter_map(f).collect();
    if kept.len() < total {
        event!(
            Level::WARN,
            "skipped {} rows of {} with missing dates or malformed values",
            total - kept.len(),
            table
        );
    }
    kept
}

#[cfg(test)]
pub(crate) mod test {
    use super::{
        Address, Extract, PatientRecord, Sex, ADDRESSES_FILE, EVENTS_FILE, PATIENTS_FILE,
        REGISTRATIONS_FILE,
    };
    use crate::{eligibility::registered_during, Interval, SnomedCode};
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub(crate) fn code(s: &str) -> SnomedCode {
        s.parse().unwrap()
    }

    pub(crate) fn address(
        start: NaiveDate,
        end: Option<NaiveDate>,
        imd_rounded: Option<u32>,
        imd_quintile: Option<u32>,
    ) -> Address {
        Address {
            patient_id: 0,
            start_date: start,
            end_date: end,
            imd_rounded,
            imd_decile: None,
            imd_quintile,
            msoa_code: None,
        }
    }

    fn sample() -> Extract {
        Extract::from_records(vec![
            PatientRecord::new(2, Some(ymd(1980, 5, 1)), Sex::Female)
                .registered_at(ymd(2005, 1, 1), None, 7, Some("London"))
                .event(ymd(2012, 3, 4), code("1047291000000109"))
                .address(address(ymd(2005, 1, 1), None, Some(12300), Some(2)))
                .ons_death(ymd(2022, 2, 2)),
            PatientRecord::new(1, None, Sex::Unknown)
                .registered(ymd(2010, 1, 1), Some(ymd(2011, 1, 1))),
        ])
    }

    #[test]
    fn records_are_sorted_and_indexed() {
        let extract = sample();
        assert_eq!(extract.len(), 2);
        assert_eq!(extract[0].patient_id(), 1);
        assert_eq!(
            extract.find_by_id(2).unwrap().events[0].snomedct_code,
            code("1047291000000109")
        );
        assert!(extract.find_by_id(3).is_none());
    }

    #[test]
    fn csv_directory_round_trip() {
        let dir = TempDir::new().unwrap();
        let extract = sample();
        extract.write_csv(dir.path()).unwrap();
        let loaded = Extract::open(dir.path()).unwrap();
        assert_eq!(loaded, extract);
    }

    #[test]
    fn bincode_cache_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extract.bin");
        let extract = sample();
        extract.save(&path).unwrap();
        assert_eq!(Extract::open(&path).unwrap(), extract);
        assert!(extract.save(dir.path().join("extract.csv")).is_err());
    }

    #[test]
    fn unusable_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let dir = dir.path();
        sample().write_csv(dir).unwrap();
        fs::write(
            dir.join(EVENTS_FILE),
            "patient_id,date,snomedct_code\n\
             2,2012-03-04,1047291000000109\n\
             2,,1047291000000109\n\
             2,2013-01-01,not-a-code\n\
             99,2013-01-01,1047291000000109\n",
        )
        .unwrap();
        fs::write(
            dir.join(PATIENTS_FILE),
            "patient_id,date_of_birth,sex,date_of_death\n\
             1,,,\n\
             2,1980-05-01,F,\n",
        )
        .unwrap();
        let extract = Extract::load_csv(dir).unwrap();
        let record = extract.find_by_id(2).unwrap();
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.patient.sex, Sex::Female);
        assert_eq!(extract.find_by_id(1).unwrap().patient.sex, Sex::Unknown);
    }

    #[test]
    fn malformed_cells_skip_only_their_row() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        sample().write_csv(dir).unwrap();
        fs::write(
            dir.join(PATIENTS_FILE),
            "patient_id,date_of_birth,sex,date_of_death\n\
             1,,,\n\
             2,1980-05-01,female,\n\
             3,1980-02-30,female,\n",
        )
        .unwrap();
        fs::write(
            dir.join(REGISTRATIONS_FILE),
            "patient_id,start_date,end_date,practice_pseudo_id,practice_nuts1_region_name\n\
             1,2010-01-01,2011-01-01,1,\n\
             2,2010-01-01,,7,London\n\
             2,2006-01-01,,,London\n\
             2,2010-01-01,2009-06-01,7,London\n\
             3,2005-01-01,,7,London\n",
        )
        .unwrap();
        let extract = Extract::load_csv(dir).unwrap();
        assert_eq!(extract.len(), 2);
        assert!(extract.find_by_id(3).is_none());
        let record = extract.find_by_id(2).unwrap();
        assert_eq!(record.registrations.len(), 1);
        assert_eq!(record.registrations[0].start_date, ymd(2010, 1, 1));
        // the inverted registration would otherwise overlap 2009
        let window = Interval::new(ymd(2009, 1, 1), ymd(2009, 12, 31));
        assert!(!registered_during(record, &window));

        fs::write(dir.join(ADDRESSES_FILE), "patient_id,start\n2,2005-01-01\n").unwrap();
        assert!(Extract::load_csv(dir).is_err());
    }

    #[test]
    fn earliest_ons_death_wins() {
        let extract = Extract::from_tables(
            vec![PatientRecord::new(1, None, Sex::Male).patient],
            vec![],
            vec![],
            vec![],
            vec![
                super::OnsDeath {
                    patient_id: 1,
                    date: Some(ymd(2020, 1, 1)),
                },
                super::OnsDeath {
                    patient_id: 1,
                    date: Some(ymd(2019, 1, 1)),
                },
                super::OnsDeath {
                    patient_id: 1,
                    date: None,
                },
            ],
        );
        assert_eq!(extract[0].ons_death_date, Some(ymd(2019, 1, 1)));
    }

    #[test]
    fn disclosive_sexes() {
        assert!(!Sex::Male.is_disclosive());
        assert!(!Sex::Female.is_disclosive());
        assert!(Sex::Intersex.is_disclosive());
        assert!(Sex::Unknown.is_disclosive());
    }
}
