pub mod export;
pub mod merge;
pub mod store;
