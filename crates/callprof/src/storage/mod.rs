pub mod schema;
mod writer;

pub use writer::Storage;
