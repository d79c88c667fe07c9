//! Data models shared by the storage layer, the catalog and the asset pipeline.
//!
//! Storage rows (`Bucket`, `Object`) and catalog rows (`Client`, `Album`) map
//! to SQLite tables via `sqlx::FromRow`; `ObjectEntry` is the bucket-relative
//! view handed to the pipeline by the object store gateway.

pub mod album;
pub mod bucket;
pub mod client;
pub mod object;
