//! Protocol implementations

pub mod propar;
