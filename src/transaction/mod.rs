//! Transactional layers shared by every index structure
//!
//! A structure is written either directly (no transaction, single writer)
//! or through a layer owned by a [`Transaction`]. Layered writes overlay the
//! base without touching it; commit merges base and layer into a new
//! structure, rollback drops the layer.
//!
//! This module provides:
//! - `Transaction` - Owner of all layers of one unit of work
//! - `TransactionalLayerProducer` - Structure/layer contract
//! - `TransactionalMap`, `TransactionalArray`, `TransactionalBitmap` -
//!   Collections recording sparse diffs
//! - `IdGenerator` - Caller-supplied source of structure identities

mod array;
mod bitmap;
mod id;
mod map;
mod producer;
#[allow(clippy::module_inception)]
mod transaction;

pub use array::{ArrayAccess, ArrayLayer, ArrayView, TransactionalArray};
pub use bitmap::{BitmapAccess, BitmapLayer, BitmapView, TransactionalBitmap};
pub use id::{IdGenerator, SequenceIdGenerator, StructureId, TransactionId};
pub use map::{MapAccess, MapLayer, MapView, TransactionalMap};
pub use producer::TransactionalLayerProducer;
pub use transaction::Transaction;
