//! Chain index: total order reconstructed from predecessor facts
//!
//! Every record declares either that it starts the chain or which record
//! directly precedes it. Facts arrive one by one in any order, so the index
//! keeps a set of *fragments*: runs of records believed to be contiguous,
//! each keyed by the record at its front. A per-record state tells which
//! fragment the record sits in, the predecessor it declared and how the
//! record is classified:
//!
//! - `Head`: declared no predecessor; always the front of its fragment
//! - `Successor`: declared a predecessor; fronts its fragment only while
//!   the predecessor's fragment cannot absorb it (missing predecessor, fork)
//! - `Circular`: fronts a fragment that contains the very record it
//!   declared as predecessor, so the fragment can never be appended anywhere
//!
//! After every change fragments are glued together whenever the tail of one
//! is the declared predecessor of the front of another. When all facts form
//! one unbroken chain, exactly one fragment remains and it is the order.
//! Otherwise [`ChainIndexView::resolve`] concatenates the fragments (heads
//! first, then successors, then circular ones; longer ones first).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::{ensure, premise, IndexError, IndexResult};
use super::key::{AttributeKey, Predecessor, RecordId};
use super::storage::{ChainPayload, Payload, StoragePart};
use super::supplier::{SortedRecordsSupplier, SupplierMemo};
use crate::transaction::{
    IdGenerator, MapAccess, MapLayer, MapView, StructureId, Transaction, TransactionalLayerProducer,
    TransactionalMap,
};

/// Classification of a chained record; the order is the resolve priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementState {
    Head,
    Successor,
    Circular,
}

impl ElementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementState::Head => "HEAD",
            ElementState::Successor => "SUCCESSOR",
            ElementState::Circular => "CIRCULAR",
        }
    }
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement and declared predecessor of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainElementState {
    /// Front record of the fragment holding this record
    pub fragment: RecordId,
    pub predecessor: Predecessor,
    pub state: ElementState,
}

impl ChainElementState {
    pub fn new(fragment: RecordId, predecessor: Predecessor, state: ElementState) -> Self {
        Self {
            fragment,
            predecessor,
            state,
        }
    }

    fn in_fragment(self, fragment: RecordId) -> Self {
        Self { fragment, ..self }
    }

    fn with_state(self, state: ElementState) -> Self {
        Self { state, ..self }
    }
}

impl fmt::Display for ChainElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            ElementState::Head => write!(f, "HEAD \u{1F517} {}", self.fragment),
            state => write!(
                f,
                "{} of {} \u{1F517} {}",
                state, self.predecessor, self.fragment
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyState {
    /// One fragment holds every record
    Consistent,
    /// Several fragments, structurally sound
    Inconsistent,
    /// Structural invariants are violated
    Broken,
}

/// Result of [`ChainIndexView::consistency_report`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub state: ConsistencyState,
    /// Markdown listing of fragments and detected violations
    pub report: String,
}

/// Characters of one fragment listing before it is cut short
const LISTING_WIDTH: usize = 80;

#[derive(Debug, Clone)]
pub struct ChainIndex {
    id: StructureId,
    elements: TransactionalMap<RecordId, ChainElementState>,
    fragments: TransactionalMap<RecordId, Vec<RecordId>>,
    memoize: bool,
    memo: SupplierMemo,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct ChainIndexLayer {
    elements: MapLayer<RecordId, ChainElementState>,
    fragments: MapLayer<RecordId, Vec<RecordId>>,
    dirty: bool,
}

impl ChainIndex {
    pub fn new(ids: &dyn IdGenerator) -> Self {
        Self {
            id: ids.next_id(),
            elements: TransactionalMap::new(),
            fragments: TransactionalMap::new(),
            memoize: true,
            memo: SupplierMemo::default(),
            dirty: false,
        }
    }

    /// Whether the resolved order of the committed state is cached
    pub fn memoizing(mut self, memoize: bool) -> Self {
        self.memoize = memoize;
        self
    }

    pub fn read<'a>(&'a self, tx: Option<&'a Transaction>) -> ChainIndexView<'a> {
        let layer = tx.and_then(|tx| tx.layer::<ChainIndexLayer>(self.id));
        let memo = match layer {
            Some(layer) if layer.dirty => None,
            _ if self.memoize => Some(&self.memo),
            _ => None,
        };
        ChainIndexView {
            elements: self.elements.view(layer.map(|l| &l.elements)),
            fragments: self.fragments.view(layer.map(|l| &l.fragments)),
            memo,
        }
    }

    pub fn write(&mut self) -> ChainIndexWriter<'_> {
        ChainIndexWriter {
            elements: self.elements.access(),
            fragments: self.fragments.access(),
            memo: Some(&mut self.memo),
            dirty: &mut self.dirty,
        }
    }

    pub fn write_in<'a>(&'a self, tx: &'a mut Transaction) -> IndexResult<ChainIndexWriter<'a>> {
        let ChainIndexLayer {
            elements,
            fragments,
            dirty,
        } = self.begin_layer(tx)?;
        Ok(ChainIndexWriter {
            elements: self.elements.access_layered(elements),
            fragments: self.fragments.access_layered(fragments),
            memo: None,
            dirty,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn create_storage_part(&self, container: u32, attribute: &AttributeKey) -> Option<StoragePart> {
        if !self.dirty {
            return None;
        }
        Some(StoragePart::new(
            container,
            attribute.clone(),
            Payload::Chain(ChainPayload {
                elements: self
                    .elements
                    .base()
                    .iter()
                    .map(|(record, state)| (*record, *state))
                    .collect(),
                fragments: self
                    .fragments
                    .base()
                    .iter()
                    .map(|(head, fragment)| (*head, fragment.clone()))
                    .collect(),
            }),
        ))
    }

    pub fn from_payload(ids: &dyn IdGenerator, payload: ChainPayload) -> IndexResult<Self> {
        for (head, fragment) in &payload.fragments {
            ensure(fragment.first() == Some(head), || {
                format!("chain payload fragment keyed by {} starts elsewhere", head)
            })?;
        }
        let counted: usize = payload.fragments.iter().map(|(_, f)| f.len()).sum();
        ensure(counted == payload.elements.len(), || {
            format!(
                "chain payload fragments hold {} records but {} states are stored",
                counted,
                payload.elements.len()
            )
        })?;
        Ok(Self {
            id: ids.next_id(),
            elements: TransactionalMap::from_map(payload.elements.into_iter().collect()),
            fragments: TransactionalMap::from_map(payload.fragments.into_iter().collect()),
            memoize: true,
            memo: SupplierMemo::default(),
            dirty: false,
        })
    }
}

impl TransactionalLayerProducer for ChainIndex {
    type Layer = ChainIndexLayer;
    type Committed = ChainIndex;

    fn structure_id(&self) -> StructureId {
        self.id
    }

    fn create_layer(&self) -> ChainIndexLayer {
        ChainIndexLayer::default()
    }

    fn create_copy_with_merged_layer(
        &self,
        layer: Option<ChainIndexLayer>,
        _tx: &mut Transaction,
    ) -> IndexResult<ChainIndex> {
        let Some(layer) = layer else {
            return Ok(self.clone());
        };
        let memo = if layer.dirty {
            SupplierMemo::default()
        } else {
            self.memo.clone()
        };
        Ok(ChainIndex {
            id: self.id,
            elements: self.elements.merged(Some(layer.elements)),
            fragments: self.fragments.merged(Some(layer.fragments)),
            memoize: self.memoize,
            memo,
            dirty: self.dirty || layer.dirty,
        })
    }
}

impl fmt::Display for ChainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.read(None), f)
    }
}

fn contains_predecessor(fragment: &[RecordId], predecessor: Predecessor) -> bool {
    predecessor
        .predecessor_id()
        .is_some_and(|id| fragment.contains(&id))
}

pub struct ChainIndexView<'a> {
    elements: MapView<'a, RecordId, ChainElementState>,
    fragments: MapView<'a, RecordId, Vec<RecordId>>,
    memo: Option<&'a SupplierMemo>,
}

impl ChainIndexView<'_> {
    /// True when a single fragment holds every record
    pub fn is_consistent(&self) -> bool {
        self.fragments.len() <= 1
    }

    /// Number of chained records
    pub fn size(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, record: RecordId) -> bool {
        self.elements.contains_key(&record)
    }

    pub fn state_of(&self, record: RecordId) -> Option<ChainElementState> {
        self.elements.get(&record).copied()
    }

    /// Fragments keyed by their front record
    pub fn fragments(&self) -> Vec<(RecordId, Vec<RecordId>)> {
        self.fragments
            .iter()
            .map(|(head, fragment)| (*head, fragment.clone()))
            .collect()
    }

    fn compute_order(&self) -> Vec<RecordId> {
        let mut ordered: Vec<(ElementState, &Vec<RecordId>)> = self
            .fragments
            .iter()
            .map(|(head, fragment)| {
                let state = self
                    .elements
                    .get(head)
                    .map_or(ElementState::Circular, |s| s.state);
                (state, fragment)
            })
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.len().cmp(&a.1.len())));
        ordered
            .into_iter()
            .flat_map(|(_, fragment)| fragment.iter().copied())
            .collect()
    }

    /// Best-effort global order of all records
    pub fn resolve(&self) -> Vec<RecordId> {
        self.ascending_supplier().sorted_record_ids().to_vec()
    }

    pub fn ascending_supplier(&self) -> Arc<SortedRecordsSupplier> {
        let compute = || SortedRecordsSupplier::new(self.compute_order());
        match self.memo {
            Some(memo) => memo.ascending(compute),
            None => Arc::new(compute()),
        }
    }

    pub fn descending_supplier(&self) -> Arc<SortedRecordsSupplier> {
        let compute = || self.ascending_supplier().reversed();
        match self.memo {
            Some(memo) => memo.descending(compute),
            None => Arc::new(compute()),
        }
    }

    /// Front of another fragment ending with `predecessor`, if the fragment of `head` could be glued to it
    fn mergeable_into(&self, head: RecordId, predecessor: Predecessor) -> Option<RecordId> {
        let predecessor_id = predecessor.predecessor_id()?;
        let target = self.elements.get(&predecessor_id)?.fragment;
        let tail = self.fragments.get(&target)?.last().copied();
        (target != head && tail == Some(predecessor_id)).then_some(target)
    }

    /// Verifies every structural invariant and lists the fragments
    pub fn consistency_report(&self) -> ConsistencyReport {
        let mut errors = String::new();
        let mut overall = 0;

        for (head, fragment) in self.fragments.iter() {
            overall += fragment.len();
            let Some(first) = fragment.first().copied() else {
                errors.push_str(&format!("\nThe chain with head `{}` is empty!", head));
                continue;
            };
            if first != *head {
                errors.push_str(&format!(
                    "\nThe head of the chain `{}` doesn't match the chain head `{}`!",
                    first, head
                ));
            }

            let mut previous = first;
            for (i, record) in fragment.iter().copied().enumerate() {
                match self.elements.get(&record) {
                    None => errors.push_str(&format!(
                        "\nThe element `{}` is not present in the element states!",
                        record
                    )),
                    Some(state) if i > 0 => {
                        if state.state == ElementState::Head {
                            errors.push_str(&format!(
                                "\nThe element `{}` must not be a head of the chain!",
                                record
                            ));
                        }
                        if state.fragment != first {
                            errors.push_str(&format!(
                                "\nThe element `{}` is not in the chain with head `{}`!",
                                record, first
                            ));
                        }
                        if state.predecessor != Predecessor::Of(previous) {
                            errors.push_str(&format!(
                                "\nThe predecessor of the element `{}` doesn't match the previous element!",
                                record
                            ));
                        }
                    }
                    Some(_) => {}
                }
                previous = record;
            }

            if let Some(head_state) = self.elements.get(head) {
                let closes_cycle = contains_predecessor(fragment, head_state.predecessor);
                if head_state.state == ElementState::Circular && !closes_cycle {
                    errors.push_str(&format!(
                        "\nThe chain with CIRCULAR head `{}` doesn't contain element `{}` the head refers to!",
                        head, head_state.predecessor
                    ));
                } else if head_state.state != ElementState::Circular && closes_cycle {
                    errors.push_str(&format!(
                        "\nThe chain with head `{}` contain element `{}` the head refers to and is not marked as CIRCULAR!",
                        head, head_state.predecessor
                    ));
                }
                if let Some(target) = self.mergeable_into(*head, head_state.predecessor) {
                    errors.push_str(&format!(
                        "\nThe chain with head `{}` refers to the tail `{}` of the chain with head `{}` and should have been merged with it!",
                        head, head_state.predecessor, target
                    ));
                }
            }
        }

        for (record, state) in self.elements.iter() {
            if state.state == ElementState::Successor {
                match self.fragments.get(&state.fragment) {
                    None => errors.push_str(&format!(
                        "\nThe referenced chain with head `{}` referenced by `{}` element `{}` doesn't exist!",
                        state.fragment, state.state, record
                    )),
                    Some(fragment) if !fragment.contains(record) => errors.push_str(&format!(
                        "\nThe `{}` element `{}` is not in the chain with head `{}`!",
                        state.state, record, state.fragment
                    )),
                    Some(_) => {}
                }
            } else if state.fragment != *record {
                errors.push_str(&format!(
                    "\nThe `{}` element `{}` is not in the chain with head `{}`!",
                    state.state, record, state.fragment
                ));
            }
        }

        if overall != self.elements.len() {
            errors.push_str(
                "\nThe number of elements in chains doesn't match the number of elements in element states!",
            );
        }

        let state = if !errors.is_empty() {
            ConsistencyState::Broken
        } else if self.is_consistent() {
            ConsistencyState::Consistent
        } else {
            ConsistencyState::Inconsistent
        };

        let listing: Vec<String> = self.fragments.values().map(|f| list_fragment(f)).collect();
        let verdict = if errors.is_empty() {
            "## No errors detected.".to_string()
        } else {
            format!("## Errors detected\n\n{}", errors)
        };
        ConsistencyReport {
            state,
            report: format!("## Chains\n\n{}\n\n{}", listing.join("\n"), verdict),
        }
    }
}

fn list_fragment(fragment: &[RecordId]) -> String {
    let mut line = String::from("\t- ");
    let mut listed = 0;
    for record in fragment {
        if line.len() >= LISTING_WIDTH {
            break;
        }
        if listed > 0 {
            line.push_str(", ");
        }
        line.push_str(&record.to_string());
        listed += 1;
    }
    if listed < fragment.len() {
        line.push_str(&format!("... ({} more)", fragment.len() - listed));
    }
    line
}

impl fmt::Display for ChainIndexView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ChainIndex:")?;
        writeln!(f, "   - fragments:")?;
        for fragment in self.fragments.values() {
            let items: Vec<String> = fragment.iter().map(|r| r.to_string()).collect();
            writeln!(f, "      - [{}]", items.join(", "))?;
        }
        write!(f, "   - elements:")?;
        for (record, state) in self.elements.iter() {
            write!(f, "\n      - {}: {}", record, state)?;
        }
        Ok(())
    }
}

/// Where an updated record sat before its predecessor changed
#[derive(Debug, Clone, Copy)]
struct Placement {
    head: RecordId,
    index: usize,
    head_state: ChainElementState,
}

pub struct ChainIndexWriter<'a> {
    elements: MapAccess<'a, RecordId, ChainElementState>,
    fragments: MapAccess<'a, RecordId, Vec<RecordId>>,
    memo: Option<&'a mut SupplierMemo>,
    dirty: &'a mut bool,
}

impl ChainIndexWriter<'_> {
    pub fn view(&self) -> ChainIndexView<'_> {
        ChainIndexView {
            elements: self.elements.view(),
            fragments: self.fragments.view(),
            memo: None,
        }
    }

    /// Insert or change the predecessor fact of `record`
    pub fn upsert_predecessor(&mut self, predecessor: Predecessor, record: RecordId) -> IndexResult<()> {
        ensure(predecessor.predecessor_id() != Some(record), || {
            format!("Record `{}` cannot be its own predecessor!", record)
        })?;
        match self.elements.get(&record).copied() {
            None => self.insert(record, predecessor)?,
            Some(existing) if existing.predecessor == predecessor => return Ok(()),
            Some(existing) => self.update(record, predecessor, existing)?,
        }
        self.touch();
        Ok(())
    }

    /// Forget the predecessor fact of `record`
    pub fn remove_predecessor(&mut self, record: RecordId) -> IndexResult<()> {
        let existing = self.elements.remove(&record).ok_or_else(|| {
            IndexError::invalid_usage(format!(
                "Value `{}` is not present in the chain element index!",
                record
            ))
        })?;
        let new_head = match existing.state {
            ElementState::Head => self.remove_head(record)?,
            ElementState::Successor | ElementState::Circular => {
                self.remove_successor(record, existing.fragment)?
            }
        };
        if let Some(head) = new_head {
            self.collapse(head)?;
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        if let Some(memo) = self.memo.as_deref_mut() {
            memo.clear();
        }
        *self.dirty = true;
    }

    fn state(&self, record: RecordId) -> IndexResult<ChainElementState> {
        self.elements.get(&record).copied().ok_or_else(|| {
            IndexError::internal(format!(
                "Index damaged! The record `{}` has no chain element state!",
                record
            ))
        })
    }

    fn fragment(&self, head: RecordId) -> IndexResult<&Vec<RecordId>> {
        self.fragments.get(&head).ok_or_else(|| {
            IndexError::internal(format!("Index damaged! The chain with head `{}` is missing!", head))
        })
    }

    fn fragment_mut(&mut self, head: RecordId) -> IndexResult<&mut Vec<RecordId>> {
        self.fragments.get_mut(&head).ok_or_else(|| {
            IndexError::internal(format!("Index damaged! The chain with head `{}` is missing!", head))
        })
    }

    fn take_fragment(&mut self, head: RecordId) -> IndexResult<Vec<RecordId>> {
        self.fragments.remove(&head).ok_or_else(|| {
            IndexError::internal(format!("Index damaged! The chain with head `{}` is missing!", head))
        })
    }

    fn tail(&self, head: RecordId) -> IndexResult<RecordId> {
        self.fragment(head)?.last().copied().ok_or_else(|| {
            IndexError::internal(format!("Index damaged! The chain with head `{}` is empty!", head))
        })
    }

    fn position(&self, head: RecordId, record: RecordId) -> IndexResult<usize> {
        self.fragment(head)?
            .iter()
            .position(|r| *r == record)
            .ok_or_else(|| {
                IndexError::internal(format!(
                    "Index damaged! The record `{}` must be present in the chain `{}` according to the state information!",
                    record, head
                ))
            })
    }

    /// Detach the part of fragment `head` starting at `index`
    fn split_off(&mut self, head: RecordId, index: usize) -> IndexResult<Vec<RecordId>> {
        Ok(self.fragment_mut(head)?.split_off(index))
    }

    /// Move `records` under the fragment fronted by `head`
    fn reclassify(&mut self, head: RecordId, records: &[RecordId]) -> IndexResult<()> {
        for record in records {
            let state = self.state(*record)?;
            self.elements.insert(*record, state.in_fragment(head));
        }
        Ok(())
    }

    fn new_successor_fragment(&mut self, record: RecordId, predecessor: Predecessor) {
        self.fragments.insert(record, vec![record]);
        self.elements.insert(
            record,
            ChainElementState::new(record, predecessor, ElementState::Successor),
        );
    }

    fn insert(&mut self, record: RecordId, predecessor: Predecessor) -> IndexResult<()> {
        match predecessor.predecessor_id() {
            None => {
                self.fragments.insert(record, vec![record]);
                self.elements
                    .insert(record, ChainElementState::new(record, predecessor, ElementState::Head));
            }
            Some(predecessor_id) => match self.elements.get(&predecessor_id).copied() {
                None => self.new_successor_fragment(record, predecessor),
                Some(predecessor_state) => {
                    let head = predecessor_state.fragment;
                    if self.tail(head)? == predecessor_id {
                        self.fragment_mut(head)?.push(record);
                        self.elements.insert(
                            record,
                            ChainElementState::new(head, predecessor, ElementState::Successor),
                        );
                        let head_state = self.state(head)?;
                        if head_state.predecessor == Predecessor::Of(record) {
                            self.elements
                                .insert(head, head_state.with_state(ElementState::Circular));
                        }
                    } else {
                        self.new_successor_fragment(record, predecessor);
                    }
                }
            },
        }
        self.collapse(record)
    }

    fn update(
        &mut self,
        record: RecordId,
        predecessor: Predecessor,
        existing: ChainElementState,
    ) -> IndexResult<()> {
        let head = existing.fragment;
        let placement = Placement {
            head,
            index: self.position(head, record)?,
            head_state: self.state(head)?,
        };
        match predecessor.predecessor_id() {
            None => self.become_head(record, predecessor, placement),
            Some(predecessor_id) => {
                let cycles = self
                    .fragment(head)?
                    .iter()
                    .position(|r| *r == predecessor_id)
                    .is_some_and(|p| p >= placement.index);
                if cycles {
                    self.close_cycle(record, predecessor, placement)
                } else {
                    self.relocate(record, predecessor_id, predecessor, placement)
                }
            }
        }
    }

    /// Move the part of the fragment starting at `record` under its own front
    fn detach(&mut self, record: RecordId, placement: Placement) -> IndexResult<()> {
        let detached = self.split_off(placement.head, placement.index)?;
        self.reclassify(record, &detached)?;
        self.fragments.insert(record, detached);
        self.verify_cycle_still_closed(placement.head, placement.head_state)
    }

    fn become_head(&mut self, record: RecordId, predecessor: Predecessor, placement: Placement) -> IndexResult<()> {
        if placement.index > 0 {
            self.detach(record, placement)?;
        }
        self.elements
            .insert(record, ChainElementState::new(record, predecessor, ElementState::Head));
        self.collapse(record)?;
        if placement.index > 0 {
            self.collapse(placement.head)?;
        }
        Ok(())
    }

    fn close_cycle(&mut self, record: RecordId, predecessor: Predecessor, placement: Placement) -> IndexResult<()> {
        self.elements
            .insert(record, ChainElementState::new(record, predecessor, ElementState::Circular));
        if placement.head != record {
            premise(placement.index > 0, || {
                format!(
                    "record `{}` does not front its chain, so it cannot sit at its start",
                    record
                )
            })?;
            self.detach(record, placement)?;
            self.collapse(placement.head)?;
        }
        self.collapse(record)
    }

    fn relocate(
        &mut self,
        record: RecordId,
        predecessor_id: RecordId,
        predecessor: Predecessor,
        placement: Placement,
    ) -> IndexResult<()> {
        let Placement { head, index, head_state } = placement;
        let moved: Option<Vec<RecordId>>;
        let moved_head: RecordId;

        match self.elements.get(&predecessor_id).copied() {
            None => {
                moved_head = record;
                if index > 0 {
                    let detached = self.split_off(head, index)?;
                    self.fragments.insert(record, detached.clone());
                    moved = Some(detached);
                } else {
                    moved = None;
                }
            }
            Some(predecessor_state) if self.tail(predecessor_state.fragment)? == predecessor_id => {
                let target = predecessor_state.fragment;
                moved_head = target;
                let detached = if index > 0 {
                    self.split_off(head, index)?
                } else {
                    self.take_fragment(head)?
                };
                self.fragment_mut(target)?.extend_from_slice(&detached);
                moved = Some(detached);
            }
            Some(_) => {
                if index > 0 && self.fragment(head)?.get(index - 1) == Some(&predecessor_id) {
                    return Ok(());
                }
                if index > 0 {
                    let detached = self.split_off(head, index)?;
                    self.fragments.insert(record, detached.clone());
                    moved = Some(detached);
                    moved_head = record;
                } else {
                    moved = None;
                    moved_head = head;
                }
            }
        }

        self.elements.insert(
            record,
            ChainElementState::new(moved_head, predecessor, ElementState::Successor),
        );
        if let Some(moved) = moved {
            self.mark_cycle_if_closed(moved_head, &moved)?;
            self.reclassify(moved_head, moved.get(1..).unwrap_or_default())?;
        }
        self.verify_cycle_still_closed(head, head_state)?;

        self.collapse(moved_head)?;
        if moved_head != head {
            self.collapse(head)?;
        }
        Ok(())
    }

    /// Mark `head` circular when `appended` contains its declared predecessor
    fn mark_cycle_if_closed(&mut self, head: RecordId, appended: &[RecordId]) -> IndexResult<()> {
        let head_state = self.state(head)?;
        if contains_predecessor(appended, head_state.predecessor) {
            self.elements
                .insert(head, head_state.with_state(ElementState::Circular));
        }
        Ok(())
    }

    /// Demote a formerly circular head whose cycle no longer closes
    fn verify_cycle_still_closed(&mut self, head: RecordId, original: ChainElementState) -> IndexResult<()> {
        if original.state != ElementState::Circular {
            return Ok(());
        }
        premise(head == original.fragment, || {
            format!(
                "circular record `{}` is expected to front its chain, but sits in `{}`",
                head, original.fragment
            )
        })?;
        let current = self.state(head)?;
        if current.state != ElementState::Circular {
            return Ok(());
        }
        let closed = current.fragment == head
            && self
                .fragments
                .get(&head)
                .is_some_and(|fragment| contains_predecessor(fragment, current.predecessor));
        if !closed {
            self.elements
                .insert(head, current.with_state(ElementState::Successor));
        }
        Ok(())
    }

    fn remove_head(&mut self, record: RecordId) -> IndexResult<Option<RecordId>> {
        let mut fragment = self.take_fragment(record)?;
        premise(fragment.first() == Some(&record), || {
            format!(
                "The head of the chain is expected to be single element with primary key `{}`!",
                record
            )
        })?;
        fragment.remove(0);
        match fragment.first().copied() {
            Some(new_head) => {
                self.reclassify(new_head, &fragment)?;
                self.fragments.insert(new_head, fragment);
                Ok(Some(new_head))
            }
            None => Ok(None),
        }
    }

    fn remove_successor(&mut self, record: RecordId, head: RecordId) -> IndexResult<Option<RecordId>> {
        if !self.fragments.contains_key(&head) {
            return Err(IndexError::invalid_usage(format!(
                "Chain with head `{}` is not present in the index!",
                head
            )));
        }
        let head_state = self.elements.get(&head).copied();
        let index = self.position(head, record)?;
        if index == 0 {
            return self.remove_head(record);
        }

        let length = self.fragment(head)?.len();
        if index < length - 1 {
            let mut detached = self.split_off(head, index)?;
            detached.remove(0);
            let new_head = detached[0];
            self.reclassify(new_head, &detached)?;
            self.fragments.insert(new_head, detached);
            if let Some(head_state) = head_state {
                self.verify_cycle_still_closed(head, head_state)?;
            }
            self.collapse(new_head)?;
        } else {
            self.fragment_mut(head)?.truncate(index);
            if let Some(head_state) = head_state {
                if head_state.state == ElementState::Circular
                    && head_state.predecessor == Predecessor::Of(record)
                {
                    self.elements
                        .insert(head, head_state.with_state(ElementState::Successor));
                }
            }
        }
        Ok(Some(head))
    }

    /// Glue fragments around `record` until nothing more can be glued
    fn collapse(&mut self, record: RecordId) -> IndexResult<()> {
        let mut next = Some(record);
        while let Some(record) = next {
            next = self.attempt_collapse(record)?;
        }
        Ok(())
    }

    fn attempt_collapse(&mut self, record: RecordId) -> IndexResult<Option<RecordId>> {
        let state = self.state(record)?;
        match state.state {
            ElementState::Successor => self.append_to_predecessor(state),
            ElementState::Head | ElementState::Circular => self.absorb_successor(state.fragment),
        }
    }

    /// Append the fragment of `state` to the fragment ending with its predecessor
    fn append_to_predecessor(&mut self, state: ChainElementState) -> IndexResult<Option<RecordId>> {
        if let Some(predecessor_id) = state.predecessor.predecessor_id() {
            if let Some(predecessor_state) = self.elements.get(&predecessor_id).copied() {
                let target = predecessor_state.fragment;
                if target != state.fragment && self.tail(target)? == predecessor_id {
                    let moved = self.take_fragment(state.fragment)?;
                    self.fragment_mut(target)?.extend_from_slice(&moved);
                    self.reclassify(target, &moved)?;
                    self.mark_cycle_if_closed(target, &moved)?;
                    return Ok(Some(target));
                }
            }
        }
        self.absorb_successor(state.fragment)
    }

    /// Append the first fragment whose front declares the tail of `head` as predecessor
    fn absorb_successor(&mut self, head: RecordId) -> IndexResult<Option<RecordId>> {
        let tail = self.tail(head)?;
        let head_state = self.state(head)?;
        if head_state.predecessor == Predecessor::Of(tail) && head_state.state != ElementState::Circular {
            self.elements
                .insert(head, head_state.with_state(ElementState::Circular));
        }

        let candidate = self.fragments.view().keys().copied().find(|front| {
            *front != head
                && self
                    .elements
                    .get(front)
                    .is_some_and(|s| s.predecessor == Predecessor::Of(tail))
        });
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let moved = self.take_fragment(candidate)?;
        self.fragment_mut(head)?.extend_from_slice(&moved);
        self.reclassify(head, &moved)?;
        self.mark_cycle_if_closed(head, &moved)?;
        let candidate_state = self.state(candidate)?;
        if candidate_state.state == ElementState::Circular {
            self.elements
                .insert(candidate, candidate_state.with_state(ElementState::Successor));
        }
        Ok(Some(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{SequenceIdGenerator, TransactionId};

    const EXPECTED_CHAIN: [RecordId; 5] = [1, 2, 3, 4, 5];

    fn fact(record: RecordId) -> Predecessor {
        if record == 1 {
            Predecessor::Head
        } else {
            Predecessor::Of(record - 1)
        }
    }

    fn index() -> ChainIndex {
        ChainIndex::new(&SequenceIdGenerator::new())
    }

    fn chain_of(index: &mut ChainIndex, order: &[RecordId]) {
        for (i, record) in order.iter().enumerate() {
            let predecessor = if i == 0 {
                Predecessor::Head
            } else {
                Predecessor::Of(order[i - 1])
            };
            index.write().upsert_predecessor(predecessor, *record).unwrap();
        }
    }

    fn permutations(items: &[RecordId]) -> Vec<Vec<RecordId>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut result = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let item = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, item);
                result.push(tail);
            }
        }
        result
    }

    fn assert_sound(index: &ChainIndex) {
        let report = index.read(None).consistency_report();
        assert_ne!(report.state, ConsistencyState::Broken, "{}", report.report);
    }

    #[test]
    fn test_any_insertion_order_converges() {
        for order in permutations(&EXPECTED_CHAIN) {
            let mut index = index();
            for record in &order {
                index.write().upsert_predecessor(fact(*record), *record).unwrap();
                assert_sound(&index);
            }
            let view = index.read(None);
            assert!(view.is_consistent(), "order {:?}", order);
            assert_eq!(view.resolve(), EXPECTED_CHAIN.to_vec(), "order {:?}", order);
        }
    }

    #[test]
    fn test_reordering_converges() {
        for order in permutations(&EXPECTED_CHAIN) {
            let mut index = index();
            chain_of(&mut index, &EXPECTED_CHAIN);
            chain_of(&mut index, &order);
            assert_sound(&index);
            let view = index.read(None);
            assert!(view.is_consistent(), "order {:?}", order);
            assert_eq!(view.resolve(), order);
        }
    }

    #[test]
    fn test_removing_and_returning_elements() {
        for order in permutations(&EXPECTED_CHAIN) {
            let mut index = index();
            chain_of(&mut index, &EXPECTED_CHAIN);
            for count in 1..=order.len() {
                for record in &order[..count] {
                    index.write().remove_predecessor(*record).unwrap();
                    assert_sound(&index);
                }
                for record in &order[..count] {
                    index.write().upsert_predecessor(fact(*record), *record).unwrap();
                    assert_sound(&index);
                }
                let view = index.read(None);
                assert!(view.is_consistent(), "order {:?}, count {}", order, count);
                assert_eq!(view.resolve(), EXPECTED_CHAIN.to_vec());
            }
        }
    }

    #[test]
    fn test_circular_dependency_is_broken() {
        let mut index = index();
        chain_of(&mut index, &EXPECTED_CHAIN);
        {
            let mut writer = index.write();
            writer.upsert_predecessor(Predecessor::Of(3), 1).unwrap();
            writer.upsert_predecessor(Predecessor::Of(4), 2).unwrap();
            writer.upsert_predecessor(Predecessor::Of(2), 5).unwrap();
            writer.upsert_predecessor(Predecessor::Of(1), 4).unwrap();
        }
        assert!(!index.read(None).is_consistent());
        assert_eq!(index.read(None).resolve(), vec![5, 2, 3, 1, 4]);
        assert_eq!(
            index.to_string(),
            "ChainIndex:\n   - fragments:\n      - [2, 3, 1, 4]\n      - [5]\n   - elements:\n      \
             - 1: SUCCESSOR of 3 \u{1F517} 2\n      - 2: CIRCULAR of 4 \u{1F517} 2\n      \
             - 3: SUCCESSOR of 2 \u{1F517} 2\n      - 4: SUCCESSOR of 1 \u{1F517} 2\n      \
             - 5: SUCCESSOR of 2 \u{1F517} 5"
        );
        assert_eq!(
            index.read(None).consistency_report().state,
            ConsistencyState::Inconsistent
        );

        index.write().upsert_predecessor(Predecessor::Head, 3).unwrap();
        assert!(index.read(None).is_consistent());
        assert_eq!(index.read(None).resolve(), vec![3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_split_fragment_is_corrected() {
        let mut index = index();
        chain_of(&mut index, &EXPECTED_CHAIN);
        index.write().upsert_predecessor(Predecessor::Of(3), 6).unwrap();
        index.write().upsert_predecessor(Predecessor::Of(6), 4).unwrap();

        assert!(index.read(None).is_consistent());
        assert_eq!(index.read(None).resolve(), vec![1, 2, 3, 6, 4, 5]);
        assert_eq!(
            index.to_string(),
            "ChainIndex:\n   - fragments:\n      - [1, 2, 3, 6, 4, 5]\n   - elements:\n      \
             - 1: HEAD \u{1F517} 1\n      - 2: SUCCESSOR of 1 \u{1F517} 1\n      \
             - 3: SUCCESSOR of 2 \u{1F517} 1\n      - 4: SUCCESSOR of 6 \u{1F517} 1\n      \
             - 5: SUCCESSOR of 4 \u{1F517} 1\n      - 6: SUCCESSOR of 3 \u{1F517} 1"
        );
    }

    #[test]
    fn test_longer_forks_come_first() {
        let mut index = index();
        chain_of(&mut index, &EXPECTED_CHAIN);
        index.write().upsert_predecessor(Predecessor::Of(3), 6).unwrap();
        index.write().upsert_predecessor(Predecessor::Of(3), 7).unwrap();
        index.write().upsert_predecessor(Predecessor::Of(7), 8).unwrap();

        assert!(!index.read(None).is_consistent());
        assert_eq!(index.read(None).resolve(), vec![1, 2, 3, 4, 5, 7, 8, 6]);
        assert_eq!(
            index.read(None).fragments(),
            vec![(1, vec![1, 2, 3, 4, 5]), (6, vec![6]), (7, vec![7, 8])]
        );
        assert_eq!(
            index.read(None).state_of(8),
            Some(ChainElementState::new(7, Predecessor::Of(7), ElementState::Successor))
        );
    }

    #[test]
    fn test_fragments_collapse_on_removal() {
        let mut index = index();
        chain_of(&mut index, &[12, 7, 6, 2, 13, 5, 17, 1, 9]);
        assert!(index.read(None).is_consistent());
        {
            let mut writer = index.write();
            writer.upsert_predecessor(Predecessor::Of(12), 6).unwrap();
            writer.upsert_predecessor(Predecessor::Of(6), 5).unwrap();
            writer.remove_predecessor(1).unwrap();
            writer.upsert_predecessor(Predecessor::Of(5), 13).unwrap();
            writer.upsert_predecessor(Predecessor::Of(13), 7).unwrap();
            writer.remove_predecessor(17).unwrap();
            writer.upsert_predecessor(Predecessor::Of(7), 9).unwrap();
            writer.upsert_predecessor(Predecessor::Of(9), 19).unwrap();
            writer.upsert_predecessor(Predecessor::Of(19), 3).unwrap();
            writer.upsert_predecessor(Predecessor::Of(3), 21).unwrap();
            writer.remove_predecessor(2).unwrap();
        }
        assert_sound(&index);
        assert!(index.read(None).is_consistent());
    }

    #[test]
    fn test_transaction_keeps_both_states_consistent() {
        let mut index = index();
        let initial = [23, 26, 8, 3, 2, 4, 7, 6, 9, 10, 5, 11];
        chain_of(&mut index, &initial);

        let mut tx = Transaction::new(TransactionId::new(1));
        {
            let mut writer = index.write_in(&mut tx).unwrap();
            writer.upsert_predecessor(Predecessor::Head, 8).unwrap();
            writer.upsert_predecessor(Predecessor::Of(8), 2).unwrap();
            writer.upsert_predecessor(Predecessor::Of(2), 23).unwrap();
            writer.remove_predecessor(11).unwrap();
            writer.upsert_predecessor(Predecessor::Of(23), 4).unwrap();
            writer.upsert_predecessor(Predecessor::Of(4), 26).unwrap();
            writer.remove_predecessor(9).unwrap();
            writer.upsert_predecessor(Predecessor::Of(26), 3).unwrap();
            writer.upsert_predecessor(Predecessor::Of(3), 7).unwrap();
            writer.upsert_predecessor(Predecessor::Of(7), 10).unwrap();
            writer.remove_predecessor(6).unwrap();
            writer.upsert_predecessor(Predecessor::Of(10), 5).unwrap();
            writer.upsert_predecessor(Predecessor::Of(5), 24).unwrap();
            writer.upsert_predecessor(Predecessor::Of(24), 19).unwrap();
            assert!(writer.view().is_consistent());
        }

        assert!(index.read(Some(&tx)).is_consistent());
        assert_eq!(index.read(None).resolve(), initial.to_vec());

        let committed = index.commit(&mut tx).unwrap();
        assert!(index.read(None).is_consistent());
        assert!(committed.read(None).is_consistent());
        assert_eq!(
            committed.read(None).resolve(),
            vec![8, 2, 23, 4, 26, 3, 7, 10, 5, 24, 19]
        );
        assert_eq!(
            committed.read(None).consistency_report().state,
            ConsistencyState::Consistent
        );

        assert_eq!(
            index.read(None).consistency_report().report,
            "## Chains\n\n\t- 23, 26, 8, 3, 2, 4, 7, 6, 9, 10, 5, 11\n\n## No errors detected."
        );
    }

    #[test]
    fn test_shortened_fragment_collapses_after_cycle_split() {
        let mut index = index();
        {
            let mut writer = index.write();
            writer.upsert_predecessor(Predecessor::Head, 3).unwrap();
            writer.upsert_predecessor(Predecessor::Of(3), 4).unwrap();
            writer.upsert_predecessor(Predecessor::Of(4), 7).unwrap();
            writer.upsert_predecessor(Predecessor::Of(7), 2).unwrap();
            writer.upsert_predecessor(Predecessor::Of(4), 5).unwrap();
            writer.upsert_predecessor(Predecessor::Of(2), 7).unwrap();
        }
        assert_sound(&index);
        assert_eq!(
            index.read(None).fragments(),
            vec![(3, vec![3, 4, 5]), (7, vec![7, 2])]
        );
        assert_eq!(
            index.read(None).state_of(7).map(|s| s.state),
            Some(ElementState::Circular)
        );
    }

    #[test]
    fn test_circular_fragment_absorbs_successor() {
        let mut index = index();
        {
            let mut writer = index.write();
            writer.upsert_predecessor(Predecessor::Head, 3).unwrap();
            writer.upsert_predecessor(Predecessor::Of(3), 4).unwrap();
            writer.upsert_predecessor(Predecessor::Of(4), 7).unwrap();
            writer.upsert_predecessor(Predecessor::Of(7), 2).unwrap();
            writer.upsert_predecessor(Predecessor::Of(2), 8).unwrap();
            writer.upsert_predecessor(Predecessor::Of(2), 5).unwrap();
            writer.upsert_predecessor(Predecessor::Of(2), 7).unwrap();
        }
        assert_eq!(
            index.read(None).fragments(),
            vec![(3, vec![3, 4]), (5, vec![5]), (7, vec![7, 2, 8])]
        );

        index.write().remove_predecessor(8).unwrap();
        assert_sound(&index);
        assert_eq!(
            index.read(None).fragments(),
            vec![(3, vec![3, 4]), (7, vec![7, 2, 5])]
        );
        assert_eq!(
            index.read(None).state_of(5),
            Some(ChainElementState::new(7, Predecessor::Of(2), ElementState::Successor))
        );
    }

    #[test]
    fn test_report_flags_unmerged_fragments() {
        let elements = [
            (1, ChainElementState::new(1, Predecessor::Head, ElementState::Head)),
            (2, ChainElementState::new(2, Predecessor::Of(1), ElementState::Successor)),
        ];
        let payload = ChainPayload {
            elements: elements.into_iter().collect(),
            fragments: vec![(1, vec![1]), (2, vec![2])],
        };
        let index = ChainIndex::from_payload(&SequenceIdGenerator::new(), payload).unwrap();
        let report = index.read(None).consistency_report();
        assert_eq!(report.state, ConsistencyState::Broken);
        assert!(report.report.contains("should have been merged"), "{}", report.report);
    }

    #[test]
    fn test_cycle_never_loops() {
        let mut index = index();
        index.write().upsert_predecessor(Predecessor::Of(3), 1).unwrap();
        index.write().upsert_predecessor(Predecessor::Of(1), 3).unwrap();
        let view = index.read(None);
        let mut resolved = view.resolve();
        resolved.sort();
        assert_eq!(resolved, vec![1, 3]);
        let circular = [1, 3]
            .iter()
            .filter(|r| view.state_of(**r).map(|s| s.state) == Some(ElementState::Circular))
            .count();
        assert_eq!(circular, 1);
        assert_sound(&index);
    }

    #[test]
    fn test_own_predecessor_rejected() {
        let mut index = index();
        let err = index
            .write()
            .upsert_predecessor(Predecessor::Of(4), 4)
            .unwrap_err();
        assert_eq!(err.code(), "IDX_INVALID_USAGE");
        assert!(index.read(None).is_empty());
    }

    #[test]
    fn test_remove_unknown_record() {
        let mut index = index();
        let err = index.write().remove_predecessor(4).unwrap_err();
        assert_eq!(
            err.to_string(),
            "[IDX_INVALID_USAGE] Value `4` is not present in the chain element index!"
        );
    }

    #[test]
    fn test_report_truncates_long_fragments() {
        let mut index = index();
        let order: Vec<RecordId> = (1000..1040).collect();
        chain_of(&mut index, &order);
        let report = index.read(None).consistency_report().report;
        let line = report.lines().nth(2).unwrap();
        assert!(line.ends_with("more)"), "{}", line);
        assert!(line.starts_with("\t- 1000, 1001"));
    }

    #[test]
    fn test_suppliers_memoized_until_write() {
        let mut index = index();
        chain_of(&mut index, &[4, 2, 9]);
        let first = index.read(None).ascending_supplier();
        assert!(Arc::ptr_eq(&first, &index.read(None).ascending_supplier()));
        assert_eq!(index.read(None).descending_supplier().sorted_record_ids(), &[9, 2, 4]);
        assert_eq!(first.position_of(9), Some(2));

        index.write().remove_predecessor(2).unwrap();
        assert_eq!(index.read(None).resolve(), vec![4, 9]);
    }

    #[test]
    fn test_storage_part_round_trip() {
        let mut index = index();
        chain_of(&mut index, &[4, 2, 9]);
        index.write().upsert_predecessor(Predecessor::Of(4), 7).unwrap();
        let part = index
            .create_storage_part(3, &AttributeKey::new("order"))
            .unwrap();
        index.reset_dirty();
        assert!(index.create_storage_part(3, &AttributeKey::new("order")).is_none());

        let Payload::Chain(payload) = part.payload else {
            panic!("unexpected payload kind");
        };
        let restored = ChainIndex::from_payload(&SequenceIdGenerator::starting_at(50), payload).unwrap();
        assert_eq!(restored.read(None).resolve(), index.read(None).resolve());
        assert_eq!(restored.to_string(), index.to_string());
    }
}
