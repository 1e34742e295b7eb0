//! API response types shared by the HTTP features.

pub mod response;

pub use response::ErrorResponse;
