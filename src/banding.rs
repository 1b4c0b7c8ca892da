use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt};

/// Range where the lower bound is inclusive and the upper bound exclusive. Either bound may be
/// open.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range<T> {
    from: Option<T>,
    to: Option<T>,
}

impl<T> Range<T>
where
    T: Ord,
{
    pub fn new(from: Option<T>, to: Option<T>) -> Self {
        if let (Some(from), Some(to)) = (&from, &to) {
            if from >= to {
                panic!("ranges must go from low to high")
            }
        }
        Range { from, to }
    }

    /// `[from, to)`
    pub fn between(from: T, to: T) -> Self {
        Self::new(Some(from), Some(to))
    }

    /// `[from, ∞)`
    pub fn at_least(from: T) -> Self {
        Self::new(Some(from), None)
    }

    /// `(-∞, to)`
    pub fn below(to: T) -> Self {
        Self::new(None, Some(to))
    }

    pub fn contains(&self, val: &T) -> bool {
        let above_start = self.from.as_ref().map_or(true, |from| val >= from);
        let below_end = self.to.as_ref().map_or(true, |to| val < to);
        above_start && below_end
    }
}

impl<T> fmt::Display for Range<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.from, &self.to) {
            (Some(from), Some(to)) => write!(f, "{} - {}", from, to),
            (Some(from), None) => write!(f, "{}+", from),
            (None, Some(to)) => write!(f, "< {}", to),
            (None, None) => f.write_str("any"),
        }
    }
}

/// Maps values onto labelled bands.
///
/// Bands are ordered and never overlap, and anything outside every band (or a missing value)
/// gets the fallback label, so each input has exactly one label.
#[derive(Clone, Debug)]
pub struct Banding<T> {
    bands: Vec<(Range<T>, &'static str)>,
    missing: &'static str,
}

impl<T> Banding<T>
where
    T: Ord,
{
    /// # Panics
    ///
    /// Panics if the bands are out of order or overlap, or if a label is repeated.
    pub fn new(bands: Vec<(Range<T>, &'static str)>, missing: &'static str) -> Self {
        for ((lower, _), (upper, _)) in bands.iter().tuple_windows() {
            match (&lower.to, &upper.from) {
                (Some(end), Some(start)) if end <= start => (),
                _ => panic!("bands must be in order and must not overlap"),
            }
        }
        let labels = bands.iter().map(|(_, label)| *label).chain([missing]);
        if labels.clone().count() != labels.unique().count() {
            panic!("band labels must be distinct")
        }
        Self { bands, missing }
    }

    /// The label for `value`.
    pub fn band<B>(&self, value: Option<B>) -> &'static str
    where
        B: Borrow<T>,
    {
        value
            .and_then(|value| {
                self.bands
                    .iter()
                    .find(|(range, _)| range.contains(value.borrow()))
            })
            .map_or(self.missing, |(_, label)| *label)
    }

    /// Every label this banding can produce, with the fallback last.
    pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.bands
            .iter()
            .map(|(_, label)| *label)
            .chain([self.missing])
    }

    pub fn ranges(&self) -> impl Iterator<Item = (&Range<T>, &'static str)> + '_ {
        self.bands.iter().map(|(range, label)| (range, *label))
    }

    pub fn missing_label(&self) -> &'static str {
        self.missing
    }

    /// Count values per band, including bands with no values.
    pub fn count<I, B>(&self, values: I) -> Vec<(&'static str, usize)>
    where
        I: IntoIterator<Item = Option<B>>,
        B: Borrow<T>,
    {
        let mut counts = self.labels().map(|label| (label, 0)).collect::<Vec<_>>();
        for value in values {
            let label = self.band(value);
            if let Some((_, count)) = counts.iter_mut().find(|(l, _)| *l == label) {
                *count += 1;
            }
        }
        counts
    }
}

/// Age bands used by the census and annual counts.
pub fn age_bands() -> Banding<i32> {
    Banding::new(
        vec![
            (Range::below(16), "0-15"),
            (Range::between(16, 25), "16-24"),
            (Range::between(25, 35), "25-34"),
            (Range::between(35, 50), "35-49"),
            (Range::between(50, 65), "50-64"),
            (Range::between(65, 75), "65-74"),
            (Range::between(75, 85), "75-84"),
            (Range::at_least(85), "85 plus"),
        ],
        "missing",
    )
}

/// Age bands from the first version of the annual counts.
pub fn legacy_age_bands() -> Banding<i32> {
    Banding::new(
        vec![
            (Range::between(0, 20), "0-19"),
            (Range::between(20, 40), "20-39"),
            (Range::between(40, 60), "40-59"),
            (Range::between(60, 80), "60-79"),
            (Range::at_least(80), "80+"),
        ],
        "missing",
    )
}

/// Bands of year of birth, each covering the stated years inclusively.
pub fn year_of_birth_bands() -> Banding<i32> {
    Banding::new(
        vec![
            (Range::between(1900, 1926), "1900-1925"),
            (Range::between(1926, 1946), "1926-1945"),
            (Range::between(1946, 1966), "1946-1965"),
            (Range::between(1966, 1986), "1966-1985"),
            (Range::between(1986, 2006), "1986-2005"),
            (Range::between(2006, 2026), "2006-2025"),
        ],
        "missing",
    )
}

#[cfg(test)]
mod test {
    use super::{age_bands, legacy_age_bands, year_of_birth_bands, Banding, Range};

    /// Every value gets exactly one label.
    fn assert_total(banding: &Banding<i32>, values: impl Iterator<Item = i32>) {
        for value in values {
            let hits = banding
                .ranges()
                .filter(|(range, _)| range.contains(&value))
                .count();
            assert!(hits <= 1, "{} is in {} bands", value, hits);
            let label = banding.band(Some(value));
            if hits == 0 {
                assert_eq!(label, banding.missing_label());
            }
        }
        assert_eq!(banding.band(None::<i32>), banding.missing_label());
    }

    #[test]
    fn age_bands_are_total() {
        assert_total(&age_bands(), -5..=150);
        assert_total(&legacy_age_bands(), -5..=150);
        for age in 0..=150 {
            assert_ne!(age_bands().band(Some(age)), "missing");
            assert_ne!(legacy_age_bands().band(Some(age)), "missing");
        }
    }

    #[test]
    fn age_band_edges() {
        let bands = age_bands();
        assert_eq!(bands.band(Some(15)), "0-15");
        assert_eq!(bands.band(Some(16)), "16-24");
        assert_eq!(bands.band(Some(45)), "35-49");
        assert_eq!(bands.band(Some(49)), "35-49");
        assert_eq!(bands.band(Some(50)), "50-64");
        assert_eq!(bands.band(Some(100)), "85 plus");
        assert_eq!(legacy_age_bands().band(Some(-1)), "missing");
        assert_eq!(legacy_age_bands().band(Some(80)), "80+");
    }

    #[test]
    fn year_of_birth_bands_include_both_ends() {
        let bands = year_of_birth_bands();
        assert_total(&bands, 1800..=2100);
        assert_eq!(bands.band(Some(1925)), "1900-1925");
        assert_eq!(bands.band(Some(1926)), "1926-1945");
        assert_eq!(bands.band(Some(1999)), "1986-2005");
        assert_eq!(bands.band(Some(2025)), "2006-2025");
        assert_eq!(bands.band(Some(1899)), "missing");
        assert_eq!(bands.band(Some(2026)), "missing");
    }

    #[test]
    fn counts_include_empty_bands() {
        let counts = legacy_age_bands().count([Some(3), Some(19), Some(85), None]);
        assert_eq!(
            counts,
            vec![
                ("0-19", 2),
                ("20-39", 0),
                ("40-59", 0),
                ("60-79", 0),
                ("80+", 1),
                ("missing", 1)
            ]
        );
    }

    #[test]
    #[should_panic]
    fn overlapping_bands_are_rejected() {
        Banding::new(
            vec![(Range::between(0, 10), "a"), (Range::between(5, 20), "b")],
            "missing",
        );
    }

    #[test]
    fn range_display() {
        assert_eq!(Range::between(0, 18).to_string(), "0 - 18");
        assert_eq!(Range::at_least(80).to_string(), "80+");
        assert_eq!(Range::below(16).to_string(), "< 16");
    }
}
