//! Range index: records keyed by the intervals they are valid in
//!
//! Every interval contributes a start point and an end point. A record's
//! intervals never overlap nor share an end point (they are consolidated
//! first), so its start and end events strictly alternate along the axis.
//! A record is valid at `p` exactly when an odd number of its events lies
//! at or before `p` (counting ends strictly before `p`), which is the
//! symmetric difference of the collected bitmaps.

use std::ops::Bound;

use serde::{Deserialize, Serialize};

use super::bitmap::{RecordBitmap, RecordSet};
use super::errors::{ensure, IndexResult};
use super::key::RecordId;
use super::storage::RangePayload;
use super::value::Range;
use crate::transaction::{
    IdGenerator, MapAccess, MapLayer, MapView, StructureId, Transaction, TransactionalLayerProducer,
    TransactionalMap,
};

/// Records starting and ending at one threshold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangePoint {
    pub starts: RecordBitmap,
    pub ends: RecordBitmap,
}

impl RangePoint {
    fn is_empty(&self) -> bool {
        self.starts.is_empty() && self.ends.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RangeIndex {
    id: StructureId,
    points: TransactionalMap<i64, RangePoint>,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct RangeIndexLayer {
    points: MapLayer<i64, RangePoint>,
    dirty: bool,
}

impl RangeIndexLayer {
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl RangeIndex {
    pub fn new(ids: &dyn IdGenerator) -> Self {
        Self {
            id: ids.next_id(),
            points: TransactionalMap::new(),
            dirty: false,
        }
    }

    pub fn read<'a>(&'a self, tx: Option<&'a Transaction>) -> RangeIndexView<'a> {
        self.view(tx.and_then(|tx| tx.layer::<RangeIndexLayer>(self.id)))
    }

    pub fn write(&mut self) -> RangeIndexWriter<'_> {
        RangeIndexWriter {
            points: self.points.access(),
            dirty: &mut self.dirty,
        }
    }

    pub fn write_in<'a>(&'a self, tx: &'a mut Transaction) -> IndexResult<RangeIndexWriter<'a>> {
        let layer = self.begin_layer(tx)?;
        Ok(self.overlay(layer))
    }

    pub(crate) fn view<'a>(&'a self, layer: Option<&'a RangeIndexLayer>) -> RangeIndexView<'a> {
        RangeIndexView {
            points: self.points.view(layer.map(|l| &l.points)),
        }
    }

    pub(crate) fn overlay<'a>(&'a self, layer: &'a mut RangeIndexLayer) -> RangeIndexWriter<'a> {
        RangeIndexWriter {
            points: self.points.access_layered(&mut layer.points),
            dirty: &mut layer.dirty,
        }
    }

    pub(crate) fn merged(&self, layer: Option<RangeIndexLayer>) -> RangeIndex {
        match layer {
            None => self.clone(),
            Some(layer) => RangeIndex {
                id: self.id,
                points: self.points.merged(Some(layer.points)),
                dirty: self.dirty || layer.dirty,
            },
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn to_payload(&self) -> RangePayload {
        RangePayload {
            points: self
                .points
                .base()
                .iter()
                .map(|(threshold, point)| (*threshold, point.clone()))
                .collect(),
        }
    }

    pub(crate) fn from_payload(ids: &dyn IdGenerator, payload: RangePayload) -> Self {
        Self {
            id: ids.next_id(),
            points: TransactionalMap::from_map(payload.points.into_iter().collect()),
            dirty: false,
        }
    }
}

impl TransactionalLayerProducer for RangeIndex {
    type Layer = RangeIndexLayer;
    type Committed = RangeIndex;

    fn structure_id(&self) -> StructureId {
        self.id
    }

    fn create_layer(&self) -> RangeIndexLayer {
        RangeIndexLayer::default()
    }

    fn create_copy_with_merged_layer(
        &self,
        layer: Option<RangeIndexLayer>,
        _tx: &mut Transaction,
    ) -> IndexResult<RangeIndex> {
        Ok(self.merged(layer))
    }
}

#[derive(Clone, Copy)]
pub struct RangeIndexView<'a> {
    points: MapView<'a, i64, RangePoint>,
}

impl RangeIndexView<'_> {
    /// Records whose interval contains `point`
    pub fn valid_at(&self, point: i64) -> RecordSet {
        let mut result = RecordBitmap::new();
        for (threshold, range_point) in self.points.range(Bound::Unbounded, Bound::Included(&point)) {
            result.symmetric_difference_with(&range_point.starts);
            if *threshold < point {
                result.symmetric_difference_with(&range_point.ends);
            }
        }
        RecordSet::constant(result)
    }

    /// Records with an interval sharing at least one point with `[from, to]`
    pub fn overlapping(&self, from: i64, to: i64) -> IndexResult<RecordSet> {
        ensure(from <= to, || format!("range start {} is after its end {}", from, to))?;
        let mut started = RecordBitmap::new();
        for (_, range_point) in self.points.range(Bound::Excluded(&from), Bound::Included(&to)) {
            started.union_with(&range_point.starts);
        }
        Ok(RecordSet::or(vec![self.valid_at(from), RecordSet::constant(started)]))
    }

    pub fn contains(&self, record: RecordId) -> bool {
        self.points
            .values()
            .any(|point| point.starts.contains(record) || point.ends.contains(record))
    }

    /// Intervals currently registered for `record`, ascending
    pub fn ranges_of(&self, record: RecordId) -> Vec<Range> {
        let mut result = Vec::new();
        let mut open: Option<i64> = None;
        for (threshold, point) in self.points.iter() {
            if point.starts.contains(record) {
                open = Some(*threshold);
            }
            if point.ends.contains(record) {
                if let Some(from) = open.take() {
                    result.push(Range::new(from, *threshold).unwrap_or_else(|_| Range::since(from)));
                }
            }
        }
        result
    }

    pub fn all_records(&self) -> RecordBitmap {
        let mut result = RecordBitmap::new();
        for point in self.points.values() {
            result.union_with(&point.starts);
        }
        result
    }

    pub fn size(&self) -> usize {
        self.all_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

pub struct RangeIndexWriter<'a> {
    points: MapAccess<'a, i64, RangePoint>,
    dirty: &'a mut bool,
}

impl RangeIndexWriter<'_> {
    pub fn add_record(&mut self, range: Range, record: RecordId) {
        self.points
            .get_or_insert_with(range.from(), RangePoint::default)
            .starts
            .add(record);
        self.points
            .get_or_insert_with(range.to(), RangePoint::default)
            .ends
            .add(record);
        *self.dirty = true;
    }

    pub fn remove_record(&mut self, range: Range, record: RecordId) -> IndexResult<()> {
        let view = self.points.view();
        let registered = view.get(&range.from()).is_some_and(|p| p.starts.contains(record))
            && view.get(&range.to()).is_some_and(|p| p.ends.contains(record));
        ensure(registered, || {
            format!("record {} is not registered with range {}", record, range)
        })?;

        self.update_point(range.from(), |point| point.starts.remove(record));
        self.update_point(range.to(), |point| point.ends.remove(record));
        *self.dirty = true;
        Ok(())
    }

    fn update_point(&mut self, threshold: i64, update: impl FnOnce(&mut RangePoint) -> bool) {
        let now_empty = match self.points.get_mut(&threshold) {
            Some(point) => {
                update(point);
                point.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.points.remove(&threshold);
        }
    }

    pub fn view(&self) -> RangeIndexView<'_> {
        RangeIndexView {
            points: self.points.view(),
        }
    }
}
