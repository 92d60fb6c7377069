//! Transaction: the owner of every layer created during one unit of work
//!
//! A transaction is passed explicitly to the structures it writes to.
//! Exclusive borrowing (`&mut Transaction`) makes "one writer per
//! transaction" a compile-time fact; dropping a transaction without
//! committing is a rollback.

use std::any::{type_name, Any};
use std::collections::HashMap;

use super::id::{StructureId, TransactionId};
use crate::index::{IndexError, IndexResult};
use crate::observability::{trace_event, Event};

/// Per-transaction registry of layers keyed by structure id
pub struct Transaction {
    id: TransactionId,
    layers: HashMap<StructureId, Box<dyn Any + Send>>,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            layers: HashMap::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Layer of the structure, if this transaction has written to it
    pub fn layer<L: 'static>(&self, structure: StructureId) -> Option<&L> {
        self.layers
            .get(&structure)
            .and_then(|layer| layer.downcast_ref::<L>())
    }

    /// Layer of the structure, created on first access
    pub fn layer_or_insert_with<L, F>(&mut self, structure: StructureId, create: F) -> IndexResult<&mut L>
    where
        L: Send + 'static,
        F: FnOnce() -> L,
    {
        let tx = self.id;
        let layer = self.layers.entry(structure).or_insert_with(|| {
            trace_event(
                Event::LayerCreated,
                &[
                    ("structure", &structure.to_string()),
                    ("transaction", &tx.to_string()),
                ],
            );
            Box::new(create())
        });
        layer.downcast_mut::<L>().ok_or_else(|| {
            IndexError::internal(format!(
                "layer of structure {} is not a {}",
                structure,
                type_name::<L>()
            ))
        })
    }

    /// Detach the layer of the structure; `None` if it was never written
    pub fn take_layer<L: Send + 'static>(&mut self, structure: StructureId) -> IndexResult<Option<L>> {
        match self.layers.remove(&structure) {
            None => Ok(None),
            Some(layer) => layer.downcast::<L>().map(|layer| Some(*layer)).map_err(|_| {
                IndexError::internal(format!(
                    "layer of structure {} is not a {}",
                    structure,
                    type_name::<L>()
                ))
            }),
        }
    }

    /// Throw the layer of the structure away
    pub fn discard_layer(&mut self, structure: StructureId) -> bool {
        let removed = self.layers.remove(&structure).is_some();
        if removed {
            trace_event(
                Event::LayerDiscarded,
                &[
                    ("structure", &structure.to_string()),
                    ("transaction", &self.id.to_string()),
                ],
            );
        }
        removed
    }

    pub fn has_layer(&self, structure: StructureId) -> bool {
        self.layers.contains_key(&structure)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut structures: Vec<u64> = self.layers.keys().map(|s| s.value()).collect();
        structures.sort_unstable();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("layers", &structures)
            .finish()
    }
}
