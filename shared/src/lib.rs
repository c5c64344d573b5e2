pub mod address;
pub mod protocol;
pub mod types;
