//! Named sets of clinical codes, loaded from opensafely-style codelist CSVs.
use crate::{config::CodelistsConfig, snomed::CodeError, ArcStr, SnomedCode};

use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map, BTreeMap, BTreeSet},
    fmt, fs, io,
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;

/// Where a codelist lives and which columns to read from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodelistSpec {
    pub path: PathBuf,
    /// Header of the column holding the codes.
    #[serde(default = "default_code_column")]
    pub column: String,
    /// Header of the column holding the category of each code, for codelists that group codes.
    #[serde(default)]
    pub category_column: Option<String>,
}

fn default_code_column() -> String {
    "code".into()
}

impl CodelistSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            column: default_code_column(),
            category_column: None,
        }
    }

    pub fn with_category_column(mut self, column: impl Into<String>) -> Self {
        self.category_column = Some(column.into());
        self
    }
}

/// Problems with a codelist source. These are configuration errors: the run should stop before
/// any patient is evaluated.
#[derive(Debug, Error)]
pub enum CodelistError {
    #[error("could not open codelist \"{}\"", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not read codelist \"{name}\"")]
    Csv {
        name: ArcStr,
        #[source]
        source: csv::Error,
    },
    #[error("codelist \"{name}\" has no column named \"{column}\"")]
    MissingColumn { name: ArcStr, column: String },
    #[error("codelist \"{name}\" has an invalid code \"{code}\" on line {line}")]
    InvalidCode {
        name: ArcStr,
        line: u64,
        code: String,
        #[source]
        source: CodeError,
    },
    #[error(
        "codelist \"{name}\" lists {code} with conflicting categories {first:?} and {second:?}"
    )]
    ConflictingCategory {
        name: ArcStr,
        code: SnomedCode,
        first: Option<ArcStr>,
        second: Option<ArcStr>,
    },
    #[error("codelist \"{name}\" contains no codes")]
    Empty { name: ArcStr },
}

/// An immutable set of codes, optionally mapping each code to a category.
///
/// Cloning is cheap: the codes are shared.
#[derive(Clone)]
pub struct Codelist {
    name: ArcStr,
    codes: Arc<BTreeMap<SnomedCode, Option<ArcStr>>>,
}

impl Codelist {
    /// Build a codelist from `(code, category)` pairs.
    ///
    /// The same code may appear more than once as long as the category agrees.
    pub fn from_pairs(
        name: impl Into<ArcStr>,
        pairs: impl IntoIterator<Item = (SnomedCode, Option<ArcStr>)>,
    ) -> Result<Self, CodelistError> {
        let name = name.into();
        let mut codes = BTreeMap::new();
        for (code, category) in pairs {
            match codes.entry(code) {
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(category);
                }
                btree_map::Entry::Occupied(entry) => {
                    if *entry.get() != category {
                        return Err(CodelistError::ConflictingCategory {
                            name,
                            code,
                            first: entry.get().clone(),
                            second: category,
                        });
                    }
                }
            }
        }
        if codes.is_empty() {
            return Err(CodelistError::Empty { name });
        }
        Ok(Self {
            name,
            codes: Arc::new(codes),
        })
    }

    /// Read a codelist from CSV data with a header row.
    pub fn from_reader(
        name: impl Into<ArcStr>,
        reader: impl io::Read,
        spec: &CodelistSpec,
    ) -> Result<Self, CodelistError> {
        let name = name.into();
        let csv_err = |source| CodelistError::Csv {
            name: name.clone(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader.headers().map_err(csv_err)?.clone();
        let column_idx = |column: &str| {
            headers
                .iter()
                .position(|header| header == column)
                .ok_or_else(|| CodelistError::MissingColumn {
                    name: name.clone(),
                    column: column.to_owned(),
                })
        };
        let code_idx = column_idx(&spec.column)?;
        let category_idx = spec
            .category_column
            .as_deref()
            .map(column_idx)
            .transpose()?;

        let mut pairs = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            let line = record.position().map(|pos| pos.line()).unwrap_or(0);
            let raw = record.get(code_idx).unwrap_or("");
            let code = SnomedCode::from_str(raw).map_err(|source| CodelistError::InvalidCode {
                name: name.clone(),
                line,
                code: raw.to_owned(),
                source,
            })?;
            let category = category_idx
                .and_then(|idx| record.get(idx))
                .filter(|category| !category.is_empty())
                .map(ArcStr::from);
            pairs.push((code, category));
        }
        Self::from_pairs(name, pairs)
    }

    /// Load a codelist file.
    pub fn load(name: impl Into<ArcStr>, spec: &CodelistSpec) -> Result<Self, CodelistError> {
        let file = fs::File::open(&spec.path).map_err(|source| CodelistError::Open {
            path: spec.path.clone(),
            source,
        })?;
        Self::from_reader(name, io::BufReader::new(file), spec)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, code: SnomedCode) -> bool {
        self.codes.contains_key(&code)
    }

    /// The category of a code, or `None` if the code is not in the list or has no category.
    pub fn category_of(&self, code: SnomedCode) -> Option<&ArcStr> {
        self.codes.get(&code)?.as_ref()
    }

    /// The distinct categories used by this codelist, in lexical order.
    pub fn categories(&self) -> BTreeSet<ArcStr> {
        self.codes.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Always `false`: construction rejects empty codelists.
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SnomedCode, Option<&ArcStr>)> + '_ {
        self.codes.iter().map(|(code, cat)| (*code, cat.as_ref()))
    }
}

impl fmt::Debug for Codelist {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Codelist")
            .field("name", &self.name)
            .field("len", &self.codes.len())
            .finish()
    }
}

impl fmt::Display for Codelist {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({} codes)", self.name, self.codes.len())
    }
}

/// The kinds of migration-related code we count separately.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MigrantCategory {
    /// Any migration-related code.
    Any,
    /// Born outside the UK.
    CountryOfBirth,
    AsylumRefugee,
    InterpreterRequired,
}

impl MigrantCategory {
    pub const ALL: [MigrantCategory; 4] = [
        MigrantCategory::Any,
        MigrantCategory::CountryOfBirth,
        MigrantCategory::AsylumRefugee,
        MigrantCategory::InterpreterRequired,
    ];

    /// Name used for measures counting this category.
    pub fn key(self) -> &'static str {
        match self {
            MigrantCategory::Any => "any_migrant",
            MigrantCategory::CountryOfBirth => "cob_migrant",
            MigrantCategory::AsylumRefugee => "asylum_refugee_migrant",
            MigrantCategory::InterpreterRequired => "interpreter_migrant",
        }
    }
}

/// Every codelist the study uses, loaded once at the start of a run.
#[derive(Debug, Clone)]
pub struct CodelistRegistry {
    pub all_migrant: Codelist,
    pub cob_migrant: Codelist,
    pub asylum_refugee_migrant: Codelist,
    pub interpreter_migrant: Codelist,
    /// Maps each code to its ethnicity group.
    pub ethnicity: Codelist,
}

impl CodelistRegistry {
    pub fn load(config: &CodelistsConfig) -> Result<Self, CodelistError> {
        let registry = Self {
            all_migrant: Codelist::load("all_migrant", &config.all_migrant)?,
            cob_migrant: Codelist::load("cob_migrant", &config.cob_migrant)?,
            asylum_refugee_migrant: Codelist::load(
                "asylum_refugee_migrant",
                &config.asylum_refugee_migrant,
            )?,
            interpreter_migrant: Codelist::load(
                "interpreter_migrant",
                &config.interpreter_migrant,
            )?,
            ethnicity: Codelist::load("ethnicity", &config.ethnicity)?,
        };
        for codelist in registry.iter() {
            event!(Level::INFO, "loaded codelist {}", codelist);
        }
        Ok(registry)
    }

    pub fn migrant(&self, category: MigrantCategory) -> &Codelist {
        match category {
            MigrantCategory::Any => &self.all_migrant,
            MigrantCategory::CountryOfBirth => &self.cob_migrant,
            MigrantCategory::AsylumRefugee => &self.asylum_refugee_migrant,
            MigrantCategory::InterpreterRequired => &self.interpreter_migrant,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Codelist> + '_ {
        [
            &self.all_migrant,
            &self.cob_migrant,
            &self.asylum_refugee_migrant,
            &self.interpreter_migrant,
            &self.ethnicity,
        ]
        .into_iter()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{Codelist, CodelistError, CodelistRegistry, CodelistSpec, MigrantCategory};
    use crate::SnomedCode;
    use std::io;

    pub(crate) const MIGRANT: &str = "1047291000000109";
    pub(crate) const BORN_ABROAD: &str = "161137008";
    pub(crate) const REFUGEE: &str = "446654005";
    pub(crate) const NEEDS_INTERPRETER: &str = "315591000000100";

    pub(crate) fn registry() -> CodelistRegistry {
        CodelistRegistry {
            all_migrant: codelist(
                "all_migrant",
                &[MIGRANT, BORN_ABROAD, REFUGEE, NEEDS_INTERPRETER],
            ),
            cob_migrant: codelist("cob_migrant", &[BORN_ABROAD]),
            asylum_refugee_migrant: codelist("asylum_refugee_migrant", &[REFUGEE]),
            interpreter_migrant: codelist("interpreter_migrant", &[NEEDS_INTERPRETER]),
            ethnicity: ethnicity_codelist(),
        }
    }

    pub(crate) fn codelist(name: &str, codes: &[&str]) -> Codelist {
        let csv = format!("code,term\n{}", codes.join(",x\n") + ",x\n");
        Codelist::from_reader(name, io::Cursor::new(csv), &CodelistSpec::new("test.csv")).unwrap()
    }

    pub(crate) fn ethnicity_codelist() -> Codelist {
        let csv = "code,term,Grouping_6\n\
                   10292001,Chinese,\"Chinese or Other Ethnic Groups\"\n\
                   976631000000101,British,White\n\
                   92491000000104,Indian,Asian or Asian British\n";
        let spec = CodelistSpec::new("ethnicity.csv").with_category_column("Grouping_6");
        Codelist::from_reader("ethnicity", io::Cursor::new(csv), &spec).unwrap()
    }

    fn code(s: &str) -> SnomedCode {
        s.parse().unwrap()
    }

    #[test]
    fn membership_and_categories() {
        let ethnicity = ethnicity_codelist();
        assert_eq!(ethnicity.len(), 3);
        assert!(ethnicity.contains(code("10292001")));
        assert!(!ethnicity.contains(code("1047291000000109")));
        assert_eq!(
            ethnicity.category_of(code("10292001")).map(|c| &**c),
            Some("Chinese or Other Ethnic Groups")
        );
        assert_eq!(ethnicity.category_of(code("1047291000000109")), None);
        assert_eq!(ethnicity.categories().len(), 3);
    }

    #[test]
    fn registry_lookup_by_category() {
        let registry = registry();
        assert_eq!(registry.iter().count(), 5);
        assert_eq!(registry.migrant(MigrantCategory::Any).len(), 4);
        assert!(registry
            .migrant(MigrantCategory::AsylumRefugee)
            .contains(code(REFUGEE)));
        assert!(!registry
            .migrant(MigrantCategory::CountryOfBirth)
            .contains(code(REFUGEE)));
    }

    #[test]
    fn uncategorised_codelists_have_no_categories() {
        let migrant = codelist("all_migrant", &["1047291000000109", "161137008"]);
        assert!(migrant.contains(code("161137008")));
        assert_eq!(migrant.category_of(code("161137008")), None);
        assert!(migrant.categories().is_empty());
    }

    #[test]
    fn missing_file_is_an_error() {
        let spec = CodelistSpec::new("does/not/exist.csv");
        assert!(matches!(
            Codelist::load("missing", &spec),
            Err(CodelistError::Open { .. })
        ));
    }

    #[test]
    fn missing_category_column_is_an_error() {
        let spec = CodelistSpec::new("x.csv").with_category_column("Label_6");
        let err = Codelist::from_reader("ethnicity", io::Cursor::new("code\n10292001\n"), &spec)
            .unwrap_err();
        assert!(
            matches!(err, CodelistError::MissingColumn { ref column, .. } if column == "Label_6")
        );
    }

    #[test]
    fn conflicting_duplicates_are_an_error() {
        let spec = CodelistSpec::new("x.csv").with_category_column("group");
        let agree = "code,group\n10292001,Other\n10292001,Other\n";
        assert_eq!(
            Codelist::from_reader("agree", io::Cursor::new(agree), &spec)
                .unwrap()
                .len(),
            1
        );
        let conflict = "code,group\n10292001,Other\n10292001,White\n";
        assert!(matches!(
            Codelist::from_reader("conflict", io::Cursor::new(conflict), &spec),
            Err(CodelistError::ConflictingCategory { .. })
        ));
    }

    #[test]
    fn empty_and_malformed_codelists_are_errors() {
        let spec = CodelistSpec::new("x.csv");
        assert!(matches!(
            Codelist::from_reader("empty", io::Cursor::new("code\n"), &spec),
            Err(CodelistError::Empty { .. })
        ));
        assert!(matches!(
            Codelist::from_reader("bad", io::Cursor::new("code\nabc123\n"), &spec),
            Err(CodelistError::InvalidCode { line: 2, .. })
        ));
    }
}
