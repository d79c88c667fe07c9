pub mod archive_janitor;
pub mod archive_service;
pub mod cache_builder;
pub mod catalog_service;
pub mod layout;
pub mod notification;
pub mod object_store;
pub mod storage_service;
pub mod transcoder;
pub mod worker_pool;
