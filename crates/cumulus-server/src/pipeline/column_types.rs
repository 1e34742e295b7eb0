//! Column type tags for the dashboard.
//!
//! The classifier is name-biased and must stay stable: changing a rule is a
//! breaking change for dashboard consumers and requires bumping
//! `COLUMN_TYPES_FORMAT_VERSION`.

use cumulus_common::metadata::ColumnTypes;
use cumulus_common::ColumnType;

use super::frame::{Column, ColumnKind};

const DOUBLE_COLUMNS: &[&str] = &["median", "average", "std_dev", "percentage"];

pub fn infer(columns: &[Column]) -> ColumnTypes {
    ColumnTypes(
        columns
            .iter()
            .map(|c| (c.name.clone(), tag(&c.name, c.kind)))
            .collect(),
    )
}

fn tag(name: &str, kind: ColumnKind) -> ColumnType {
    if name.ends_with("year") {
        ColumnType::Year
    } else if name.ends_with("month") {
        ColumnType::Month
    } else if name.ends_with("week") {
        ColumnType::Week
    } else if name.ends_with("day") {
        ColumnType::Day
    } else if matches!(kind, ColumnKind::Date | ColumnKind::Timestamp) {
        ColumnType::Day
    } else if name.starts_with("cnt") || kind == ColumnKind::Int {
        ColumnType::Integer
    } else if kind == ColumnKind::Float {
        ColumnType::Float
    } else if kind == ColumnKind::Bool {
        ColumnType::Boolean
    } else if DOUBLE_COLUMNS.contains(&name) {
        ColumnType::Double
    } else {
        ColumnType::String
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_suffix_beats_dtype() {
        assert_eq!(tag("admit_month", ColumnKind::Str), ColumnType::Month);
        assert_eq!(tag("birth_year", ColumnKind::Int), ColumnType::Year);
        assert_eq!(tag("visit_date", ColumnKind::Timestamp), ColumnType::Day);
    }

    #[test]
    fn test_dtype_rules_in_order() {
        assert_eq!(tag("cnt_total", ColumnKind::Str), ColumnType::Integer);
        assert_eq!(tag("age", ColumnKind::Int), ColumnType::Integer);
        assert_eq!(tag("ratio", ColumnKind::Float), ColumnType::Float);
        assert_eq!(tag("deceased", ColumnKind::Bool), ColumnType::Boolean);
        assert_eq!(tag("median", ColumnKind::Str), ColumnType::Double);
        assert_eq!(tag("median", ColumnKind::Float), ColumnType::Float);
        assert_eq!(tag("sex", ColumnKind::Str), ColumnType::String);
    }

    #[test]
    fn test_infer_keeps_column_order() {
        let types = infer(&[
            Column::new("cnt", ColumnKind::Int),
            Column::new("sex", ColumnKind::Str),
            Column::new("site", ColumnKind::Str),
        ]);
        assert_eq!(types.names().collect::<Vec<_>>(), vec!["cnt", "sex", "site"]);
        assert_eq!(types.get("cnt"), Some(ColumnType::Integer));
    }
}
