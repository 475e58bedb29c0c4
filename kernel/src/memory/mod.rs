//! Memory translation structures
//!
//! The architecture-neutral hardware mapping tree built by the page-fault
//! handler from GPTs.

pub mod mapping;

pub use mapping::{MapRoot, MapTable, MapTables, Pte, PteLoc, TableRef};
