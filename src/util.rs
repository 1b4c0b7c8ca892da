use crate::{extract::Sex, ArcStr, SnomedCode};
use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serializer};
use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

// Helpers for serde to parse fields with quirks.

fn is_null(s: &str) -> bool {
    s.is_empty() || s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("na")
}

/// Parse an ISO date, mapping "", "null" and "NA" to `None`.
pub fn opt_date<'de, D>(d: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(d)?;
    let s = s.trim();
    if is_null(s) {
        return Ok(None);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| de::Error::custom(format!("invalid date \"{}\": {}", s, e)))
}

/// Parse a string, but map "null" and "NA" to `None` (in addition to the default "" -> None
/// mapping)
pub fn optional_string<'de, D>(d: D) -> Result<Option<ArcStr>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(d)?;
    if is_null(s.trim()) {
        Ok(None)
    } else {
        Ok(Some(s.into()))
    }
}

/// Parse a number, mapping the null spellings to `None`.
pub fn optional_u32<'de, D>(d: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(d)?;
    let s = s.trim();
    if is_null(s) {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|e| de::Error::custom(format!("invalid number \"{}\": {}", s, e)))
}

/// Malformed codes become `None` so the row can be reported and skipped.
pub fn maybe_snomed<'de, D>(d: D) -> Result<Option<SnomedCode>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(d)?;
    Ok(SnomedCode::from_str(&s).ok())
}

/// Sex as recorded. Anything we don't recognise (including blank) is `Unknown`.
pub fn sex<'de, D>(d: D) -> Result<Sex, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(d)?;
    Ok(match s.trim().to_ascii_lowercase().as_str() {
        "male" | "m" => Sex::Male,
        "female" | "f" => Sex::Female,
        "intersex" | "i" => Sex::Intersex,
        _ => Sex::Unknown,
    })
}

/// Write `None` as an empty cell.
pub fn ser_opt_display<S, T>(value: &Option<T>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: std::fmt::Display,
{
    match value {
        Some(value) => s.collect_str(value),
        None => s.serialize_str(""),
    }
}

pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}

#[cfg(test)]
mod test {
    use crate::extract::Sex;
    use chrono::NaiveDate;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Row {
        #[serde(deserialize_with = "super::opt_date")]
        date: Option<NaiveDate>,
        #[serde(deserialize_with = "super::sex")]
        sex: Sex,
        #[serde(deserialize_with = "super::optional_u32")]
        imd: Option<u32>,
    }

    fn parse(csv: &str) -> Vec<Row> {
        csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(csv.as_bytes())
            .into_deserialize()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn nullable_cells() {
        let rows = parse("date,sex,imd\n2010-01-01,male,300\n,,NA\nnull,Intersex,\n");
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2010, 1, 1));
        assert_eq!(rows[0].sex, Sex::Male);
        assert_eq!(rows[0].imd, Some(300));
        assert_eq!(rows[1].date, None);
        assert_eq!(rows[1].sex, Sex::Unknown);
        assert_eq!(rows[1].imd, None);
        assert_eq!(rows[2].date, None);
        assert_eq!(rows[2].sex, Sex::Intersex);
    }

    #[test]
    fn bad_dates_are_errors() {
        let result = csv::ReaderBuilder::new()
            .from_reader("date,sex,imd\n21/03/2021,male,\n".as_bytes())
            .into_deserialize::<Row>()
            .next()
            .unwrap();
        assert!(result.is_err());
    }
}
