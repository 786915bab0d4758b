pub mod scan;
pub mod store;
