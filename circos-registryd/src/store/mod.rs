pub mod hash;
pub mod merge;
pub mod registry;

pub use registry::{EntryMap, Registry};
