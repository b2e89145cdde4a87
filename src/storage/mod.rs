//! Object-store backends.
//!
//! [`backend`] defines the connector, client and database contract the
//! adapter writes through; [`memory`] is an in-process implementation of it.

pub mod backend;
pub mod memory;
