//! attrindex - transactional secondary attribute indexes
//!
//! Unique, filter, sort and predecessor-chain indexes over record
//! attributes, readable and writable inside isolated transactions.

pub mod cli;
pub mod index;
pub mod observability;
pub mod transaction;
