pub mod column_types;
pub mod convert;
pub mod list_artifacts;

pub use column_types::column_types_for;
pub use convert::{convert, is_convertible, ExportFormat, CONVERTIBLE};
pub use list_artifacts::list_artifacts;
