//! Per-record-type table configuration.
//!
//! Column names and table identity are declared explicitly by each record
//! type and resolved once when a store is built; nothing is discovered by
//! inspecting values at runtime.

pub mod columns;
pub mod descriptor;

pub use columns::{ColumnResolver, NamingConvention};
pub use descriptor::{PhysicalTable, Record, TableDescriptor};
