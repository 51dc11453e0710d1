pub mod defs;
pub mod report;
pub mod state;

pub use defs::*;
pub use report::*;
pub use state::MemoryStore;
