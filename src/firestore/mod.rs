pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
