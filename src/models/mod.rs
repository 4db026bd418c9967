//! Domain model module declarations.

pub mod session;
pub mod signal;
pub mod unit;
