//! SNOMED CT concept identifiers, as recorded against clinical events.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// A SNOMED CT concept id.
///
/// Concept ids are between 6 and 18 decimal digits long and never start with `0`, so they always
/// fit in a `u64` and the numeric form displays back to exactly the recorded text.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SnomedCode(u64);

/// Why a string was not accepted as a SNOMED CT code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("expected a SNOMED CT code of 6 to 18 digits, found {0} characters")]
    Length(usize),
    #[error("SNOMED CT codes contain only the digits 0-9")]
    NonDigit,
    #[error("SNOMED CT codes never start with 0")]
    LeadingZero,
}

impl SnomedCode {
    pub fn from_bytes(v: &[u8]) -> Result<Self, CodeError> {
        if !(6..=18).contains(&v.len()) {
            return Err(CodeError::Length(v.len()));
        }
        if !v.iter().all(u8::is_ascii_digit) {
            return Err(CodeError::NonDigit);
        }
        if v[0] == b'0' {
            return Err(CodeError::LeadingZero);
        }
        Ok(SnomedCode(
            v.iter()
                .fold(0u64, |acc, digit| acc * 10 + u64::from(digit - b'0')),
        ))
    }

    pub fn from_str(v: &str) -> Result<Self, CodeError> {
        Self::from_bytes(v.trim().as_bytes())
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SnomedCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for SnomedCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<'a> TryFrom<&'a str> for SnomedCode {
    type Error = CodeError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::from_str(s)
    }
}

impl FromStr for SnomedCode {
    type Err = CodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str(s)
    }
}

// Text in CSV, a plain integer in the bincode cache.
impl Serialize for SnomedCode {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if s.is_human_readable() {
            s.collect_str(self)
        } else {
            s.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for SnomedCode {
    fn deserialize<D>(deserializer: D) -> Result<SnomedCode, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(SnomedCodeVisitor)
        } else {
            deserializer.deserialize_u64(SnomedCodeVisitor)
        }
    }
}

struct SnomedCodeVisitor;

impl<'de> serde::de::Visitor<'de> for SnomedCodeVisitor {
    type Value = SnomedCode;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a SNOMED CT code (either as digits in a string or as an integer)")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        SnomedCode::from_str(v).map_err(serde::de::Error::custom)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        SnomedCode::from_str(&v.to_string()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::{CodeError, SnomedCode};

    #[test]
    fn parses_concept_ids() {
        let code = SnomedCode::from_str("1047291000000109").unwrap();
        assert_eq!(code.as_u64(), 1047291000000109);
        assert_eq!(code.to_string(), "1047291000000109");
        assert_eq!(SnomedCode::from_str(" 10292001 ").unwrap().to_string(), "10292001");
    }

    #[test]
    fn rejects_malformed_codes() {
        assert_eq!(SnomedCode::from_str("12345"), Err(CodeError::Length(5)));
        assert_eq!(SnomedCode::from_str("1234X678"), Err(CodeError::NonDigit));
        assert_eq!(SnomedCode::from_str("01234567"), Err(CodeError::LeadingZero));
        assert_eq!(
            SnomedCode::from_str("1234567890123456789"),
            Err(CodeError::Length(19))
        );
    }

    #[test]
    fn orders_numerically() {
        let short: SnomedCode = "999999".parse().unwrap();
        let long: SnomedCode = "1000000".parse().unwrap();
        assert!(short < long);
    }
}
