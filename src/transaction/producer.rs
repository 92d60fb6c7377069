//! Contract between a transactional structure and its layer

use super::id::StructureId;
use super::transaction::Transaction;
use crate::index::IndexResult;
use crate::observability::{trace_event, Event};

/// A structure whose transactional writes are collected in a layer of
/// type `Layer` and merged into a fresh `Committed` copy on commit.
///
/// The base structure is never mutated by a transaction. Readers that do
/// not hold the transaction keep seeing the base until the committed copy
/// replaces it.
pub trait TransactionalLayerProducer {
    /// Diff type kept in the transaction
    type Layer: Send + 'static;

    /// Result of merging the base with a layer
    type Committed;

    /// Identity under which the layer is registered
    fn structure_id(&self) -> StructureId;

    /// An empty layer
    fn create_layer(&self) -> Self::Layer;

    /// Merge the base with `layer` into a new structure.
    ///
    /// `layer` is `None` when the transaction never wrote to this
    /// structure. Composite structures take their children's layers out of
    /// `tx`.
    fn create_copy_with_merged_layer(
        &self,
        layer: Option<Self::Layer>,
        tx: &mut Transaction,
    ) -> IndexResult<Self::Committed>;

    /// Layer of this structure in `tx`, created on first access
    fn begin_layer<'t>(&self, tx: &'t mut Transaction) -> IndexResult<&'t mut Self::Layer> {
        tx.layer_or_insert_with(self.structure_id(), || self.create_layer())
    }

    /// Take the layer out of `tx` and merge it
    fn commit(&self, tx: &mut Transaction) -> IndexResult<Self::Committed> {
        let layer = tx.take_layer::<Self::Layer>(self.structure_id())?;
        if layer.is_some() {
            trace_event(
                Event::LayerCommitted,
                &[
                    ("structure", &self.structure_id().to_string()),
                    ("transaction", &tx.id().to_string()),
                ],
            );
        }
        self.create_copy_with_merged_layer(layer, tx)
    }

    /// Drop the layer of this structure from `tx`
    fn discard(&self, tx: &mut Transaction) {
        tx.discard_layer(self.structure_id());
    }
}
