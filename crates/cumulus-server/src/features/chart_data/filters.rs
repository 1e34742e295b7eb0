//! Dashboard filter expressions compiled to SQL predicates.
//!
//! A filter is a list of groups; each group is a comma separated list of
//! atoms `column:operator[:value]`. Groups are OR'd together, atoms within a
//! group are AND'd. Operator tokens are a wire contract with the dashboard.
//!
//! Two predicate blocks are produced. The inline block compares raw values.
//! The none-safe block is identical except that an atom on the chart column
//! whose value is the literal `none` compares against [`NONE_SENTINEL`],
//! the string exports use for a missing value.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use cumulus_common::metadata::ColumnTypes;
use cumulus_common::CumulusError;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::catalog::postgres::quote_ident;
use crate::catalog::SqlDialect;

/// Stored form of a `none` value in exported data.
pub const NONE_SENTINEL: &str = "cumulus__none";

const NONE_LITERAL: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMatch {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn sql(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    fn as_str(self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    const ALL: [Granularity; 4] = [
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
    ];

    fn title(self) -> &'static str {
        match self {
            Granularity::Day => "Day",
            Granularity::Week => "Week",
            Granularity::Month => "Month",
            Granularity::Year => "Year",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    IsTrue,
    IsNotTrue,
    IsFalse,
    IsNotFalse,
    IsNull,
    IsNotNull,
}

/// A filter operator as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Text {
        kind: StringMatch,
        case_insensitive: bool,
        negated: bool,
    },
    Numeric(Comparison),
    Flag(Flag),
    Date {
        granularity: Granularity,
        comparison: Comparison,
    },
}

impl Operator {
    fn takes_value(self) -> bool {
        !matches!(self, Operator::Flag(_))
    }
}

impl FromStr for Operator {
    type Err = CumulusError;

    fn from_str(token: &str) -> Result<Self, CumulusError> {
        let flag = match token {
            "isTrue" => Some(Flag::IsTrue),
            "isNotTrue" => Some(Flag::IsNotTrue),
            "isFalse" => Some(Flag::IsFalse),
            "isNotFalse" => Some(Flag::IsNotFalse),
            "isNull" => Some(Flag::IsNull),
            "isNotNull" => Some(Flag::IsNotNull),
            _ => None,
        };
        if let Some(flag) = flag {
            return Ok(Operator::Flag(flag));
        }

        let numeric = match token {
            "eq" => Some(Comparison::Eq),
            "ne" => Some(Comparison::Ne),
            "gt" => Some(Comparison::Gt),
            "gte" => Some(Comparison::Gte),
            "lt" => Some(Comparison::Lt),
            "lte" => Some(Comparison::Lte),
            _ => None,
        };
        if let Some(comparison) = numeric {
            return Ok(Operator::Numeric(comparison));
        }

        if let Some(op) = parse_date_token(token) {
            return Ok(op);
        }
        parse_text_token(token)
            .ok_or_else(|| CumulusError::InvalidFilter(format!("unknown operator '{token}'")))
    }
}

fn parse_date_token(token: &str) -> Option<Operator> {
    Granularity::ALL.into_iter().find_map(|g| {
        let t = g.title();
        let comparison = if token == format!("same{t}") {
            Comparison::Eq
        } else if token == format!("same{t}OrBefore") {
            Comparison::Lte
        } else if token == format!("same{t}OrAfter") {
            Comparison::Gte
        } else if token == format!("before{t}") {
            Comparison::Lt
        } else if token == format!("after{t}") {
            Comparison::Gt
        } else {
            return None;
        };
        Some(Operator::Date {
            granularity: g,
            comparison,
        })
    })
}

/// `str[Not]Eq|Contains|StartsWith|EndsWith[CI]`, `[not]Matches`/`matches[CI]`.
fn parse_text_token(token: &str) -> Option<Operator> {
    let (rest, case_insensitive) = match token.strip_suffix("CI") {
        Some(rest) => (rest, true),
        None => (token, false),
    };
    let (kind, negated) = match rest {
        "matches" => (StringMatch::Regex, false),
        "notMatches" => (StringMatch::Regex, true),
        _ => {
            let body = rest.strip_prefix("str")?;
            let (body, negated) = match body.strip_prefix("Not") {
                Some(b) => (b, true),
                None => (body, false),
            };
            let kind = match body {
                "Eq" => StringMatch::Equals,
                "Contains" => StringMatch::Contains,
                "StartsWith" => StringMatch::StartsWith,
                "EndsWith" => StringMatch::EndsWith,
                _ => return None,
            };
            (kind, negated)
        }
    };
    Some(Operator::Text {
        kind,
        case_insensitive,
        negated,
    })
}

/// One parsed `column:operator[:value]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterAtom {
    pub column: String,
    pub operator: Operator,
    pub value: Option<String>,
}

impl FilterAtom {
    pub fn parse(raw: &str) -> Result<Self, CumulusError> {
        let mut parts = raw.splitn(3, ':');
        let column = parts.next().unwrap_or_default().trim();
        let operator = parts
            .next()
            .ok_or_else(|| CumulusError::InvalidFilter(format!("'{raw}' has no operator")))?
            .trim()
            .parse::<Operator>()?;
        let value = parts.next().map(str::to_string);
        if column.is_empty() {
            return Err(CumulusError::InvalidFilter(format!("'{raw}' has no column")));
        }
        if operator.takes_value() && value.as_deref().map_or(true, str::is_empty) {
            return Err(CumulusError::InvalidFilter(format!("'{raw}' needs a value")));
        }
        Ok(Self {
            column: column.to_string(),
            operator,
            value: value.filter(|_| operator.takes_value()),
        })
    }
}

/// Table facts the compiler checks atoms against.
#[derive(Debug, Clone, Copy)]
pub struct FilterTarget<'a> {
    pub dialect: SqlDialect,
    /// Every column of the table.
    pub columns: &'a [String],
    /// Dashboard type tags, when known.
    pub column_types: Option<&'a ColumnTypes>,
    /// The chart column; `none` literals on it get the none-safe rewrite.
    pub selected: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledFilter {
    pub inline: String,
    pub none_safe: String,
    /// Columns referenced by any atom.
    pub columns: BTreeSet<String>,
}

impl CompiledFilter {
    pub fn is_empty(&self) -> bool {
        self.inline.is_empty()
    }

    /// WHERE fragment combining both blocks, `None` without filters.
    pub fn predicate(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else if self.none_safe == self.inline {
            Some(format!("({})", self.inline))
        } else {
            Some(format!("(({}) OR ({}))", self.inline, self.none_safe))
        }
    }
}

impl fmt::Display for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.predicate().as_deref().unwrap_or(""))
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn cast_text(column: &str) -> String {
    format!("CAST({} AS VARCHAR)", quote_ident(column))
}

fn timestamp_literal(dialect: SqlDialect, value: &str) -> String {
    match dialect {
        SqlDialect::Athena => format!("from_iso8601_timestamp({})", quote_literal(value)),
        SqlDialect::Postgres => format!("CAST({} AS TIMESTAMP)", quote_literal(value)),
    }
}

fn is_iso_date(value: &str) -> bool {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || DateTime::parse_from_rfc3339(value).is_ok()
}

fn text_predicate(
    dialect: SqlDialect,
    column: &str,
    kind: StringMatch,
    case_insensitive: bool,
    value: &str,
) -> String {
    let target = cast_text(column);
    if kind == StringMatch::Regex {
        return match (dialect, case_insensitive) {
            (SqlDialect::Athena, false) => format!("regexp_like({target}, {})", quote_literal(value)),
            (SqlDialect::Athena, true) => {
                format!("regexp_like({target}, {})", quote_literal(&format!("(?i){value}")))
            }
            (SqlDialect::Postgres, false) => format!("{target} ~ {}", quote_literal(value)),
            (SqlDialect::Postgres, true) => format!("{target} ~* {}", quote_literal(value)),
        };
    }
    let pattern = match kind {
        StringMatch::Contains => format!("%{value}%"),
        StringMatch::StartsWith => format!("{value}%"),
        StringMatch::EndsWith => format!("%{value}"),
        _ => value.to_string(),
    };
    if case_insensitive {
        format!("LOWER({target}) LIKE LOWER({})", quote_literal(&pattern))
    } else {
        format!("{target} LIKE {}", quote_literal(&pattern))
    }
}

fn atom_predicate(dialect: SqlDialect, atom: &FilterAtom, value: Option<&str>) -> String {
    let column = quote_ident(&atom.column);
    let value = value.unwrap_or_default();
    match atom.operator {
        Operator::Text {
            kind,
            case_insensitive,
            negated,
        } => {
            let predicate = text_predicate(dialect, &atom.column, kind, case_insensitive, value);
            if negated {
                format!("NOT ({predicate})")
            } else {
                predicate
            }
        }
        Operator::Numeric(comparison) => format!("{column} {} {value}", comparison.sql()),
        Operator::Flag(flag) => match flag {
            Flag::IsTrue => format!("{column} = TRUE"),
            Flag::IsNotTrue => format!("{column} IS NOT TRUE"),
            Flag::IsFalse => format!("{column} = FALSE"),
            Flag::IsNotFalse => format!("{column} IS NOT FALSE"),
            Flag::IsNull => format!("{column} IS NULL"),
            Flag::IsNotNull => format!("{column} IS NOT NULL"),
        },
        Operator::Date {
            granularity,
            comparison,
        } => {
            let unit = granularity.as_str();
            format!(
                "date_trunc('{unit}', {column}) {} date_trunc('{unit}', {})",
                comparison.sql(),
                timestamp_literal(dialect, value)
            )
        }
    }
}

fn preflight(atom: &FilterAtom, target: &FilterTarget<'_>) -> Result<(), CumulusError> {
    if !target.columns.iter().any(|c| *c == atom.column) {
        return Err(CumulusError::InvalidFilter(format!(
            "unknown column '{}'",
            atom.column
        )));
    }
    let value = atom.value.as_deref().unwrap_or_default();
    match atom.operator {
        Operator::Numeric(_) if !value.parse::<f64>().is_ok_and(f64::is_finite) => Err(
            CumulusError::InvalidFilter(format!("'{value}' is not a number")),
        ),
        Operator::Date { .. } => {
            let tag = target.column_types.and_then(|t| t.get(&atom.column));
            if tag.is_some_and(|t| !t.is_date()) {
                return Err(CumulusError::InvalidFilter(format!(
                    "'{}' is not a date column",
                    atom.column
                )));
            }
            if !is_iso_date(value) {
                return Err(CumulusError::InvalidFilter(format!(
                    "'{value}' is not an ISO-8601 date"
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Compile every group into the inline and none-safe predicate blocks.
pub fn compile(groups: &[String], target: &FilterTarget<'_>) -> Result<CompiledFilter, CumulusError> {
    let mut inline_groups = Vec::new();
    let mut none_safe_groups = Vec::new();
    let mut columns = BTreeSet::new();

    for group in groups.iter().filter(|g| !g.trim().is_empty()) {
        let mut inline = Vec::new();
        let mut none_safe = Vec::new();
        for raw in group.split(',') {
            let atom = FilterAtom::parse(raw)?;
            preflight(&atom, target)?;

            let value = atom.value.as_deref();
            inline.push(atom_predicate(target.dialect, &atom, value));
            let safe_value = match value {
                Some(v) if atom.column == target.selected && v.eq_ignore_ascii_case(NONE_LITERAL) => {
                    Some(NONE_SENTINEL)
                }
                other => other,
            };
            none_safe.push(atom_predicate(target.dialect, &atom, safe_value));
            columns.insert(atom.column);
        }
        inline_groups.push(format!("({})", inline.join(" AND ")));
        none_safe_groups.push(format!("({})", none_safe.join(" AND ")));
    }

    Ok(CompiledFilter {
        inline: inline_groups.join(" OR "),
        none_safe: none_safe_groups.join(" OR "),
        columns,
    })
}
