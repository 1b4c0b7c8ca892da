//! Counts of migrants per year, overall and by subgroup.
//!
//! For every interval the denominator is everyone alive, registered, of non-disclosive sex and
//! at most `max_age` on the interval's first day. Each numerator is the part of the denominator
//! with a code from one of the migrant codelists on or before the interval's last day, so a
//! patient's numerator flag never turns off once it is on.
//!
//! Counts are exact. Anything that hides small numbers is a [`DisclosureControl`] applied
//! afterwards.
use crate::{
    banding::{age_bands, legacy_age_bands, Banding},
    config::DisclosureControlConfig,
    derive::{age_on, imd_quintile_on, last_event, registration_on, ImdPolicy, UNKNOWN_ETHNICITY,
        UNKNOWN_REGION},
    eligibility::{Criterion, DateRef, Population, RegistrationRule},
    ArcStr, CodelistRegistry, Extract, Interval, MigrantCategory, PatientRecord, StudyConfig,
};

use chrono::NaiveDate;
use qu::ick_use::*;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

const MISSING: &str = "missing";

/// What a measure is grouped by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    None,
    Age,
    Sex,
    Ethnicity,
    Imd,
    Region,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Dimension::None,
        Dimension::Age,
        Dimension::Sex,
        Dimension::Ethnicity,
        Dimension::Imd,
        Dimension::Region,
    ];

    /// Appended to the numerator's name to name the measure.
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            Dimension::None => None,
            Dimension::Age => Some("age"),
            Dimension::Sex => Some("sex"),
            Dimension::Ethnicity => Some("ethnicity"),
            Dimension::Imd => Some("imd"),
            Dimension::Region => Some("region"),
        }
    }

    /// Name of the grouping variable in the output.
    pub fn column(self) -> &'static str {
        match self {
            Dimension::None => "",
            Dimension::Age => "age_band",
            Dimension::Sex => "sex",
            Dimension::Ethnicity => "ethnicity",
            Dimension::Imd => "imd_quintile",
            Dimension::Region => "region",
        }
    }
}

/// One numerator counted by one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measure {
    pub name: ArcStr,
    pub numerator: MigrantCategory,
    pub dimension: Dimension,
}

/// A row of the measures table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasureRow {
    pub measure: ArcStr,
    pub interval_start: NaiveDate,
    pub interval_end: NaiveDate,
    pub group_by: &'static str,
    pub group: ArcStr,
    pub numerator: u64,
    pub denominator: u64,
    /// `None` when the denominator is 0.
    pub ratio: Option<f64>,
    /// Filled in by [`apply_disclosure_control`].
    pub controlled_numerator: Option<u64>,
    pub controlled_denominator: Option<u64>,
}

/// Suppression or rounding of small counts. Returning `None` suppresses the count.
pub trait DisclosureControl: Sync {
    fn control(&self, count: u64) -> Option<u64>;
}

/// Fill in the controlled counts of every row.
pub fn apply_disclosure_control(rows: &mut [MeasureRow], control: &dyn DisclosureControl) {
    rows.par_iter_mut().for_each(|row| {
        row.controlled_numerator = control.control(row.numerator);
        row.controlled_denominator = control.control(row.denominator);
    });
}

/// Apply `control` if disclosure control is enabled. Enabling it without a control to apply is
/// an error, so uncontrolled counts are never written by mistake.
pub fn disclose(
    mut rows: Vec<MeasureRow>,
    config: &DisclosureControlConfig,
    control: Option<&dyn DisclosureControl>,
) -> Result<Vec<MeasureRow>> {
    if config.enabled {
        let Some(control) = control else {
            bail!("disclosure control is enabled but no disclosure control was supplied");
        };
        apply_disclosure_control(&mut rows, control);
    }
    Ok(rows)
}

/// Numerator and denominator counts for one group in one interval.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct Counts {
    numerators: [u64; MigrantCategory::ALL.len()],
    denominator: u64,
}

type Tally = BTreeMap<(Dimension, ArcStr), Counts>;

/// Every measure of the annual counts, with the settings that define its subgroups.
pub struct MeasureSet<'a> {
    codelists: &'a CodelistRegistry,
    intervals: Vec<Interval>,
    max_imd: u32,
    denominator: Population,
    numerators: Vec<(MigrantCategory, Criterion)>,
    measures: Vec<Measure>,
    age_bands: Banding<i32>,
    imd_policy: ImdPolicy,
    /// Groups given to patients with no ethnicity or no practice region.
    ethnicity_fallback: &'static str,
    region_fallback: &'static str,
}

impl<'a> MeasureSet<'a> {
    /// The current definition of the annual counts.
    pub fn annual_migrant_counts(config: &StudyConfig, codelists: &'a CodelistRegistry) -> Self {
        Self::new(
            config,
            codelists,
            age_bands(),
            config.measures.imd_policy,
            UNKNOWN_ETHNICITY,
            UNKNOWN_REGION,
        )
    }

    /// The first definition of the annual counts: 20-year age bands, IMD quintile from the
    /// rounded score, and no `unknown` group for ethnicity or region.
    pub fn legacy(config: &StudyConfig, codelists: &'a CodelistRegistry) -> Self {
        Self::new(
            config,
            codelists,
            legacy_age_bands(),
            ImdPolicy::FromRoundedScore,
            MISSING,
            MISSING,
        )
    }

    /// Whichever definition the configuration asks for.
    pub fn from_config(config: &StudyConfig, codelists: &'a CodelistRegistry) -> Self {
        if config.measures.legacy {
            Self::legacy(config, codelists)
        } else {
            Self::annual_migrant_counts(config, codelists)
        }
    }

    fn new(
        config: &StudyConfig,
        codelists: &'a CodelistRegistry,
        age_bands: Banding<i32>,
        imd_policy: ImdPolicy,
        ethnicity_fallback: &'static str,
        region_fallback: &'static str,
    ) -> Self {
        let jan_1 = DateRef::IntervalStart;
        let denominator = Population::new("annual denominator")
            .and(Criterion::AliveOn(jan_1))
            .and(Criterion::Registered(RegistrationRule::ActiveOn(jan_1)))
            .and(Criterion::NonDisclosiveSex)
            .and(Criterion::AgeAtMost {
                on: jan_1,
                max_age: config.max_age,
            });
        let numerators = MigrantCategory::ALL
            .into_iter()
            .map(|category| {
                let criterion = Criterion::HasCode {
                    codelist: codelists.migrant(category).clone(),
                    on_or_before: Some(DateRef::IntervalEnd),
                };
                (category, criterion)
            })
            .collect();
        let measures = MigrantCategory::ALL
            .into_iter()
            .flat_map(|numerator| {
                Dimension::ALL.into_iter().map(move |dimension| Measure {
                    name: match dimension.suffix() {
                        Some(suffix) => format!("{}_{}", numerator.key(), suffix).into(),
                        None => numerator.key().into(),
                    },
                    numerator,
                    dimension,
                })
            })
            .collect();
        Self {
            codelists,
            intervals: config.interval_list(),
            max_imd: config.max_imd,
            denominator,
            numerators,
            measures,
            age_bands,
            imd_policy,
            ethnicity_fallback,
            region_fallback,
        }
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn measure_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.measures.iter().map(|measure| &*measure.name)
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Count every measure over every interval.
    ///
    /// Rows come out in measure order, then interval, then group. Every group a dimension can
    /// take appears in every interval, with zero counts where nobody is in it.
    pub fn run(&self, extract: &Extract) -> Result<Vec<MeasureRow>> {
        self.denominator.validate(true)?;

        let tallies: Vec<Tally> = self
            .intervals
            .par_iter()
            .map(|interval| self.tally(extract, interval))
            .collect();

        let groups = self.all_groups(&tallies);
        let mut rows = Vec::new();
        for measure in &self.measures {
            let numerator_idx = MigrantCategory::ALL
                .iter()
                .position(|c| *c == measure.numerator)
                .unwrap_or(0);
            for (interval, tally) in self.intervals.iter().zip(&tallies) {
                for group in groups.get(&measure.dimension).into_iter().flatten() {
                    let counts = tally
                        .get(&(measure.dimension, group.clone()))
                        .copied()
                        .unwrap_or_default();
                    let numerator = counts.numerators[numerator_idx];
                    rows.push(MeasureRow {
                        measure: measure.name.clone(),
                        interval_start: interval.start_date,
                        interval_end: interval.end_date,
                        group_by: measure.dimension.column(),
                        group: group.clone(),
                        numerator,
                        denominator: counts.denominator,
                        ratio: (counts.denominator > 0)
                            .then(|| numerator as f64 / counts.denominator as f64),
                        controlled_numerator: None,
                        controlled_denominator: None,
                    });
                }
            }
        }
        event!(
            Level::INFO,
            "{} measures over {} intervals: {} rows",
            self.measures.len(),
            self.intervals.len(),
            rows.len()
        );
        Ok(rows)
    }

    fn tally(&self, extract: &Extract, interval: &Interval) -> Tally {
        let mut tally = Tally::new();
        for record in extract.iter() {
            if !self.denominator.contains(record, Some(interval)) {
                continue;
            }
            let mut flags = [false; MigrantCategory::ALL.len()];
            for (flag, (_, numerator)) in flags.iter_mut().zip(&self.numerators) {
                *flag = numerator.is_met(record, Some(interval));
            }
            for dimension in Dimension::ALL {
                let group = self.group(record, dimension, interval.start_date);
                let counts = tally.entry((dimension, group)).or_default();
                counts.denominator += 1;
                for (count, flag) in counts.numerators.iter_mut().zip(flags) {
                    *count += u64::from(flag);
                }
            }
        }
        event!(
            Level::DEBUG,
            "interval {}: {} in denominator",
            interval,
            tally
                .get(&(Dimension::None, ArcStr::from("")))
                .map_or(0, |counts| counts.denominator)
        );
        tally
    }

    /// The subgroup of a patient on `date`.
    fn group(&self, record: &PatientRecord, dimension: Dimension, date: NaiveDate) -> ArcStr {
        match dimension {
            Dimension::None => "".into(),
            Dimension::Age => self.age_bands.band(age_on(&record.patient, date)).into(),
            Dimension::Sex => record.patient.sex.as_str().into(),
            Dimension::Ethnicity => {
                let ethnicity = &self.codelists.ethnicity;
                last_event(record, ethnicity, Some(date))
                    .and_then(|evt| ethnicity.category_of(evt.snomedct_code))
                    .cloned()
                    .unwrap_or_else(|| self.ethnicity_fallback.into())
            }
            Dimension::Imd => imd_quintile_on(record, date, self.imd_policy, self.max_imd)
                .map_or_else(|| MISSING.into(), |quintile| quintile.to_string().into()),
            Dimension::Region => registration_on(record, date)
                .and_then(|reg| reg.practice_nuts1_region_name.clone())
                .unwrap_or_else(|| self.region_fallback.into()),
        }
    }

    /// The groups reported for each dimension: every value it can take, plus any value seen in
    /// the data.
    fn all_groups(&self, tallies: &[Tally]) -> BTreeMap<Dimension, BTreeSet<ArcStr>> {
        let mut groups: BTreeMap<Dimension, BTreeSet<ArcStr>> = BTreeMap::new();
        let mut add = |dimension, group: ArcStr| {
            groups.entry(dimension).or_default().insert(group);
        };
        add(Dimension::None, "".into());
        for label in self.age_bands.labels() {
            add(Dimension::Age, label.into());
        }
        for sex in ["female", "male"] {
            add(Dimension::Sex, sex.into());
        }
        for category in self.codelists.ethnicity.categories() {
            add(Dimension::Ethnicity, category);
        }
        add(Dimension::Ethnicity, self.ethnicity_fallback.into());
        for quintile in ["1", "2", "3", "4", "5", MISSING] {
            add(Dimension::Imd, quintile.into());
        }
        for tally in tallies {
            for (dimension, group) in tally.keys() {
                add(*dimension, group.clone());
            }
        }
        groups
    }
}

#[cfg(test)]
mod test {
    use super::{
        apply_disclosure_control, disclose, Dimension, DisclosureControl, MeasureRow, MeasureSet,
    };
    use crate::{
        codelist::test::{registry, BORN_ABROAD, MIGRANT},
        extract::{
            test::{address, code, ymd},
            PatientRecord, Sex,
        },
        Extract, MigrantCategory, StudyConfig,
    };

    fn rows_for<'a>(
        rows: &'a [MeasureRow],
        measure: &'a str,
    ) -> impl Iterator<Item = &'a MeasureRow> + 'a {
        rows.iter().filter(move |row| &*row.measure == measure)
    }

    fn migrant() -> PatientRecord {
        PatientRecord::new(1, Some(ymd(1980, 7, 1)), Sex::Female)
            .registered_at(ymd(2000, 1, 1), None, 1, Some("London"))
            .event(ymd(2014, 6, 30), code(MIGRANT))
            .event(ymd(2016, 1, 1), code("10292001"))
            .address(address(ymd(2000, 1, 1), None, Some(30000), Some(3)))
    }

    #[test]
    fn measure_names() {
        let (config, codelists) = (StudyConfig::default(), registry());
        let set = MeasureSet::annual_migrant_counts(&config, &codelists);
        let names: Vec<_> = set.measure_names().collect();
        assert_eq!(names.len(), 24);
        assert_eq!(&names[..6], &[
            "any_migrant",
            "any_migrant_age",
            "any_migrant_sex",
            "any_migrant_ethnicity",
            "any_migrant_imd",
            "any_migrant_region"
        ]);
        assert!(names.contains(&"interpreter_migrant_region"));
        assert!(names.contains(&"cob_migrant"));
        let by_region = &set.measures()[5];
        assert_eq!(
            (by_region.numerator, by_region.dimension),
            (MigrantCategory::Any, Dimension::Region)
        );
    }

    #[test]
    fn numerator_is_cumulative() {
        let (config, codelists) = (StudyConfig::default(), registry());
        let extract = Extract::from_records(vec![migrant()]);
        let set = MeasureSet::annual_migrant_counts(&config, &codelists);
        let rows = set.run(&extract).unwrap();
        let overall: Vec<_> = rows_for(&rows, "any_migrant").collect();
        assert_eq!(overall.len(), set.intervals().len());
        for row in overall {
            assert_eq!(row.denominator, 1);
            let expected = u64::from(row.interval_end >= ymd(2014, 6, 30));
            assert_eq!(row.numerator, expected, "{}", row.interval_start);
        }
        assert!(rows_for(&rows, "cob_migrant").all(|row| row.numerator == 0));
    }

    #[test]
    fn every_group_appears_every_interval() {
        let (config, codelists) = (StudyConfig::default(), registry());
        let extract = Extract::from_records(vec![migrant()]);
        let rows = MeasureSet::annual_migrant_counts(&config, &codelists)
            .run(&extract)
            .unwrap();
        let age: Vec<_> = rows_for(&rows, "any_migrant_age").collect();
        assert_eq!(age.len(), 16 * 9);
        let in_2015: Vec<_> = age
            .iter()
            .filter(|row| row.interval_start == ymd(2015, 1, 1))
            .map(|row| (&*row.group, row.numerator, row.denominator, row.ratio))
            .collect();
        assert_eq!(in_2015[0], ("0-15", 0, 0, None));
        assert!(in_2015.contains(&("25-34", 1, 1, Some(1.0))));
        assert_eq!(in_2015.len(), 9);

        let ethnicity: Vec<_> = rows_for(&rows, "any_migrant_ethnicity")
            .filter(|row| row.denominator > 0)
            .map(|row| (row.interval_start, &*row.group))
            .collect();
        assert!(ethnicity.contains(&(ymd(2015, 1, 1), "unknown")));
        assert!(ethnicity.contains(&(ymd(2016, 1, 1), "Chinese or Other Ethnic Groups")));

        let imd: Vec<_> = rows_for(&rows, "any_migrant_imd")
            .filter(|row| row.denominator > 0)
            .map(|row| &*row.group)
            .collect();
        assert!(imd.iter().all(|group| *group == "3"));
        assert!(rows_for(&rows, "any_migrant_region")
            .all(|row| &*row.group == "London" && row.group_by == "region"));
    }

    #[test]
    fn denominator_excludes_ineligible_patients() {
        let (config, codelists) = (StudyConfig::default(), registry());
        let extract = Extract::from_records(vec![
            migrant(),
            PatientRecord::new(2, Some(ymd(1980, 1, 1)), Sex::Intersex)
                .registered(ymd(2000, 1, 1), None)
                .event(ymd(2010, 1, 1), code(MIGRANT)),
            PatientRecord::new(3, Some(ymd(1980, 1, 1)), Sex::Male)
                .registered(ymd(2000, 1, 1), None)
                .event(ymd(2010, 1, 1), code(BORN_ABROAD))
                .died(ymd(2020, 1, 1)),
            PatientRecord::new(4, Some(ymd(1900, 1, 1)), Sex::Male)
                .registered(ymd(2000, 1, 1), None),
            PatientRecord::new(5, Some(ymd(1980, 1, 1)), Sex::Male),
        ]);
        let rows = MeasureSet::annual_migrant_counts(&config, &codelists)
            .run(&extract)
            .unwrap();
        let count = |measure: &str, year: i32| {
            rows_for(&rows, measure)
                .find(|row| row.interval_start == ymd(year, 1, 1))
                .map(|row| (row.numerator, row.denominator))
                .unwrap()
        };
        // 2 is intersex, 3 dies on 1 January 2020, 4 is over 100 and 5 was never registered
        assert_eq!(count("any_migrant", 2015), (2, 2));
        assert_eq!(count("cob_migrant", 2015), (1, 2));
        assert_eq!(count("any_migrant", 2020), (1, 1));
        assert_eq!(count("any_migrant", 2009), (0, 2));
    }

    #[test]
    fn legacy_definition() {
        let (config, codelists) = (StudyConfig::default(), registry());
        let extract = Extract::from_records(vec![PatientRecord::new(
            1,
            Some(ymd(1980, 7, 1)),
            Sex::Female,
        )
        .registered(ymd(2000, 1, 1), None)
        .event(ymd(2014, 6, 30), code(MIGRANT))
        .address(address(ymd(2000, 1, 1), None, Some(30000), Some(3)))]);
        let rows = MeasureSet::legacy(&config, &codelists).run(&extract).unwrap();
        let seen = |measure: &str| -> Vec<String> {
            rows_for(&rows, measure)
                .filter(|row| row.denominator > 0 && row.interval_start == ymd(2015, 1, 1))
                .map(|row| row.group.to_string())
                .collect()
        };
        assert_eq!(seen("any_migrant_age"), vec!["20-39"]);
        assert_eq!(seen("any_migrant_imd"), vec!["5"]);
        assert_eq!(seen("any_migrant_ethnicity"), vec!["missing"]);
        assert_eq!(seen("any_migrant_region"), vec!["missing"]);
        assert_eq!(rows_for(&rows, "any_migrant_age").count(), 16 * 6);
    }

    #[test]
    fn runs_are_deterministic() {
        let (config, codelists) = (StudyConfig::default(), registry());
        let extract = Extract::from_records(vec![
            migrant(),
            PatientRecord::new(2, Some(ymd(1950, 1, 1)), Sex::Male)
                .registered_at(ymd(2000, 1, 1), None, 2, Some("North West"))
                .event(ymd(2011, 1, 1), code(BORN_ABROAD)),
        ]);
        let set = MeasureSet::annual_migrant_counts(&config, &codelists);
        assert_eq!(set.run(&extract).unwrap(), set.run(&extract).unwrap());
    }

    struct RoundToFive;

    impl DisclosureControl for RoundToFive {
        fn control(&self, count: u64) -> Option<u64> {
            (count > 7).then(|| (count + 2) / 5 * 5)
        }
    }

    #[test]
    fn disclosure_control_is_applied_afterwards() {
        let (config, codelists) = (StudyConfig::default(), registry());
        let records = (0..9)
            .map(|id| {
                PatientRecord::new(id, Some(ymd(1980, 1, 1)), Sex::Male)
                    .registered(ymd(2000, 1, 1), None)
                    .event(ymd(2000, 1, 1), code(MIGRANT))
            })
            .collect();
        let mut rows = MeasureSet::annual_migrant_counts(&config, &codelists)
            .run(&Extract::from_records(records))
            .unwrap();
        assert!(rows.iter().all(|row| row.controlled_numerator.is_none()));
        apply_disclosure_control(&mut rows, &RoundToFive);
        let row = rows_for(&rows, "any_migrant").next().unwrap();
        assert_eq!((row.numerator, row.denominator), (9, 9));
        assert_eq!(row.controlled_numerator, Some(10));
        let empty = rows_for(&rows, "any_migrant_sex")
            .find(|row| &*row.group == "female")
            .unwrap();
        assert_eq!(empty.controlled_denominator, None);
    }

    #[test]
    fn enabled_disclosure_control_needs_a_control() {
        let (mut config, codelists) = (StudyConfig::default(), registry());
        let extract = Extract::from_records(vec![migrant()]);
        let rows = MeasureSet::annual_migrant_counts(&config, &codelists)
            .run(&extract)
            .unwrap();

        let unchanged = disclose(rows.clone(), &config.disclosure_control, None).unwrap();
        assert_eq!(unchanged, rows);

        config.disclosure_control.enabled = true;
        assert!(disclose(rows.clone(), &config.disclosure_control, None).is_err());
        let control: &dyn DisclosureControl = &RoundToFive;
        let controlled = disclose(rows, &config.disclosure_control, Some(control)).unwrap();
        // every count is 0 or 1, so all are suppressed
        assert!(controlled
            .iter()
            .all(|row| row.controlled_numerator.is_none() && row.controlled_denominator.is_none()));
    }
}
