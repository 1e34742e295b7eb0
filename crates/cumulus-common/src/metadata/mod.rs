//! Metadata documents and their merge policy.
//!
//! The three canonical documents (transactions, study periods, column types)
//! are only ever written by the metadata coalescer. Every other worker builds a
//! [`MetadataDelta`] and enqueues it; the coalescer folds deltas into the
//! stored document with [`coalesce`].

pub mod documents;
pub mod merge;

pub use documents::{
    lookup, upload_transaction_key, ColumnType, ColumnTypes, ColumnTypesEntry, DataPackageRecord,
    MetadataDelta, StudyPeriodEntry, TransactionEntry, UploadTransaction, COLUMN_TYPES_KEY,
    DATA_PACKAGES_KEY, STUDY_PERIODS_KEY, TRANSACTIONS_KEY, UPLOAD_TRANSACTIONS_PREFIX,
};
pub use merge::{apply_all, coalesce};
