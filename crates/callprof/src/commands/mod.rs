pub mod export;
pub mod list;
pub mod query;
pub mod record;
