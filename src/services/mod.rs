pub mod cache;
pub mod cdn;
pub mod chunks;
pub mod deleter;
pub mod fetch;
pub mod ids;
pub mod ingest;
pub mod paths;
pub mod query;
pub mod retention;
pub mod scan;
pub mod store;
pub mod sweeper;
pub mod thumbs;
pub mod zips;
