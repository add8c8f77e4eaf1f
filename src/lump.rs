//! Edit list ("lumps") for in-place message rewriting
//!
//! Every edit is anchored to an offset in the *original* buffer, so
//! independent passes compose without tracking shifted offsets. Records
//! live in an arena (`Vec` of slots plus a free list of indices); handles
//! carry a generation so a handle to a removed record is detected instead
//! of silently aliasing a reused slot.
//!
//! Output is produced once by [`EditList::linearize`], which consumes the
//! list.

use crate::error::{ResourceType, TextopsError, TextopsResult};
use crate::limits::RewriteLimits;
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error};

/// Bytes charged against the arena budget for every record
const RECORD_OVERHEAD: usize = mem::size_of::<Lump>();

/// Inserted bytes, owned by the list or shared with the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Owned(Vec<u8>),
    Borrowed(Arc<[u8]>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Owned(bytes) => bytes,
            Payload::Borrowed(bytes) => bytes,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Payload::Owned(_))
    }

    /// Bytes this payload costs the arena
    fn charge(&self) -> usize {
        match self {
            Payload::Owned(bytes) => bytes.len(),
            Payload::Borrowed(_) => 0,
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Owned(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Owned(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Owned(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Owned(text.into_bytes())
    }
}

impl From<Arc<[u8]>> for Payload {
    fn from(bytes: Arc<[u8]>) -> Self {
        Payload::Borrowed(bytes)
    }
}

/// Stable reference to a record in an [`EditList`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EditHandle {
    index: usize,
    generation: u32,
}

/// Where an insertion goes: an existing record or a bare offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum At {
    Edit(EditHandle),
    Offset(usize),
}

impl From<EditHandle> for At {
    fn from(handle: EditHandle) -> Self {
        At::Edit(handle)
    }
}

impl From<usize> for At {
    fn from(offset: usize) -> Self {
        At::Offset(offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LumpOp {
    /// Elide `len` original bytes starting at the record offset
    Delete(usize),
    /// Zero-length insertion point
    Anchor,
}

/// Which sub-list a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LumpScope {
    #[default]
    Message,
    Body,
}

#[derive(Debug, Clone)]
struct Insert {
    seq: u64,
    payload: Payload,
}

/// One edit record with its before/after insertion chains
#[derive(Debug, Clone)]
pub struct Lump {
    offset: usize,
    op: LumpOp,
    scope: LumpScope,
    seq: u64,
    before: Vec<Insert>,
    after: Vec<Insert>,
}

impl Lump {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn op(&self) -> LumpOp {
        self.op
    }

    pub fn scope(&self) -> LumpScope {
        self.scope
    }

    /// End of the original range this record covers
    pub fn end(&self) -> usize {
        match self.op {
            LumpOp::Delete(len) => self.offset + len,
            LumpOp::Anchor => self.offset,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.op, LumpOp::Delete(_))
    }

    pub fn before(&self) -> impl Iterator<Item = &Payload> {
        self.before.iter().map(|i| &i.payload)
    }

    pub fn after(&self) -> impl Iterator<Item = &Payload> {
        self.after.iter().map(|i| &i.payload)
    }

    fn charge(&self) -> usize {
        RECORD_OVERHEAD
            + self.before.iter().map(|i| i.payload.charge()).sum::<usize>()
            + self.after.iter().map(|i| i.payload.charge()).sum::<usize>()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    lump: Option<Lump>,
}

/// Rollback point for a multi-edit operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(u64);

/// Per-message list of pending edits against an immutable buffer
#[derive(Debug)]
pub struct EditList {
    buffer_len: usize,
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    /// Live deletes by offset: (len, slot index)
    deletes: BTreeMap<usize, (usize, usize)>,
    next_seq: u64,
    live: usize,
    used_bytes: usize,
    arena_budget: usize,
    max_lumps: usize,
}

impl EditList {
    /// Create an empty edit list for a buffer of `buffer_len` bytes
    pub fn new(buffer_len: usize) -> Self {
        Self::with_limits(buffer_len, &RewriteLimits::default())
    }

    pub fn with_limits(buffer_len: usize, limits: &RewriteLimits) -> Self {
        EditList {
            buffer_len,
            slots: Vec::new(),
            free: VecDeque::new(),
            deletes: BTreeMap::new(),
            next_seq: 0,
            live: 0,
            used_bytes: 0,
            arena_budget: limits.arena_budget,
            max_lumps: limits.max_lumps,
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Bytes currently charged against the arena budget
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Record removal of `[offset, offset + length)`
    pub fn delete(&mut self, offset: usize, length: usize) -> TextopsResult<EditHandle> {
        self.delete_in(offset, length, LumpScope::Message)
    }

    pub fn delete_in(&mut self, offset: usize, length: usize, scope: LumpScope) -> TextopsResult<EditHandle> {
        let end = offset.checked_add(length).filter(|end| *end <= self.buffer_len);
        if end.is_none() {
            error!(offset, length, buffer_len = self.buffer_len, "delete outside buffer");
            return Err(TextopsError::InvalidRange { offset, length, buffer_len: self.buffer_len });
        }
        if length == 0 {
            return self.anchor_in(offset, scope);
        }
        if let Some(existing) = self.overlapping_delete(offset, length) {
            error!(offset, length, ?existing, "overlapping delete");
            return Err(TextopsError::OverlappingEdit { offset, length, existing });
        }
        let handle = self.link(offset, LumpOp::Delete(length), scope)?;
        self.deletes.insert(offset, (length, handle.index));
        debug!(offset, length, "delete lump");
        Ok(handle)
    }

    /// Create a zero-length insertion point at `offset`
    pub fn anchor(&mut self, offset: usize) -> TextopsResult<EditHandle> {
        self.anchor_in(offset, LumpScope::Message)
    }

    pub fn anchor_in(&mut self, offset: usize, scope: LumpScope) -> TextopsResult<EditHandle> {
        if offset > self.buffer_len {
            return Err(TextopsError::InvalidRange { offset, length: 0, buffer_len: self.buffer_len });
        }
        self.link(offset, LumpOp::Anchor, scope)
    }

    /// Emit `payload` right after the anchor point (after a delete's end).
    /// Several inserts on one record are emitted in call order.
    pub fn insert_after(&mut self, at: impl Into<At>, payload: impl Into<Payload>) -> TextopsResult<EditHandle> {
        self.insert(at.into(), payload.into(), false)
    }

    /// Emit `payload` right before the anchor point
    pub fn insert_before(&mut self, at: impl Into<At>, payload: impl Into<Payload>) -> TextopsResult<EditHandle> {
        self.insert(at.into(), payload.into(), true)
    }

    /// Access a live record
    pub fn get(&self, handle: EditHandle) -> Option<&Lump> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.lump.as_ref())
    }

    /// Live records in arena order
    pub fn iter(&self) -> impl Iterator<Item = &Lump> {
        self.slots.iter().filter_map(|slot| slot.lump.as_ref())
    }

    /// Drop a single record and its payloads
    pub fn remove(&mut self, handle: EditHandle) -> Option<Lump> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation || slot.lump.is_none() {
            return None;
        }
        self.release(handle.index)
    }

    /// Remove every record matching `predicate`, returning how many went
    pub fn clear_subset<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&Lump) -> bool,
    {
        let doomed: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.lump.as_ref().filter(|l| predicate(*l)).map(|_| i))
            .collect();
        for index in &doomed {
            self.release(*index);
        }
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "cleared lumps");
        }
        doomed.len()
    }

    /// Remove every record of one sub-list
    pub fn clear_scope(&mut self, scope: LumpScope) -> usize {
        self.clear_subset(|lump| lump.scope == scope)
    }

    /// Current rollback point
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.next_seq)
    }

    /// Undo every record and insert made since `checkpoint`
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        let Checkpoint(mark) = checkpoint;
        self.clear_subset(|lump| lump.seq >= mark);
        let mut reclaimed = 0;
        for slot in self.slots.iter_mut() {
            if let Some(lump) = slot.lump.as_mut() {
                for chain in [&mut lump.before, &mut lump.after] {
                    chain.retain(|insert| {
                        let keep = insert.seq < mark;
                        if !keep {
                            reclaimed += insert.payload.charge();
                        }
                        keep
                    });
                }
            }
        }
        self.used_bytes -= reclaimed;
    }

    /// Check whether `[offset, offset + length)` lies inside one live delete
    pub fn is_deleted(&self, offset: usize, length: usize) -> bool {
        self.deletes
            .range(..=offset)
            .next_back()
            .map(|(start, (len, _))| offset + length <= start + len && (length > 0 || offset < start + len))
            .unwrap_or(false)
    }

    /// Bytes `linearize` would emit for the original `range`: surviving
    /// original bytes plus inserts anchored inside it. Inserts anchored at
    /// `range.end` count only when the range reaches the buffer end.
    pub fn output_len(&self, range: Range<usize>) -> usize {
        let mut len = range.len();
        for lump in self.iter() {
            let cut_start = lump.offset.max(range.start);
            let cut_end = lump.end().min(range.end);
            if cut_end > cut_start {
                len -= cut_end - cut_start;
            }
            let inside = range.contains(&lump.offset)
                || (lump.offset == range.end && range.end == self.buffer_len);
            if inside {
                len += lump.before().chain(lump.after()).map(|p| p.as_bytes().len()).sum::<usize>();
            }
        }
        len
    }

    /// Compute output bytes. Consumes the list: lumps are emitted once.
    pub fn linearize(self, buf: &[u8]) -> Vec<u8> {
        let EditList { slots, used_bytes, .. } = self;
        let mut lumps: Vec<Lump> = slots.into_iter().filter_map(|slot| slot.lump).collect();
        lumps.sort_by_key(|lump| (lump.offset, lump.seq));

        let mut out = Vec::with_capacity(buf.len() + used_bytes);
        let mut pos = 0;
        for lump in &lumps {
            if lump.offset > pos {
                out.extend_from_slice(&buf[pos..lump.offset]);
                pos = lump.offset;
            }
            for insert in &lump.before {
                out.extend_from_slice(insert.payload.as_bytes());
            }
            // a record inside an already deleted range only contributes inserts
            if lump.end() > pos {
                pos = lump.end();
            }
            for insert in &lump.after {
                out.extend_from_slice(insert.payload.as_bytes());
            }
        }
        if pos < buf.len() {
            out.extend_from_slice(&buf[pos..]);
        }
        out
    }

    fn overlapping_delete(&self, offset: usize, length: usize) -> Option<(usize, usize)> {
        let end = offset + length;
        // nearest delete starting at or before us, then anything starting inside us
        if let Some((start, (len, _))) = self.deletes.range(..=offset).next_back() {
            if start + len > offset {
                return Some((*start, start + len));
            }
        }
        self.deletes
            .range(offset..end)
            .next()
            .map(|(start, (len, _))| (*start, start + len))
    }

    fn reserve(&mut self, bytes: usize) -> TextopsResult<()> {
        let wanted = self.used_bytes + bytes;
        if wanted > self.arena_budget {
            error!(wanted, budget = self.arena_budget, "lump arena exhausted");
            return Err(TextopsError::resource_error(
                ResourceType::Memory,
                wanted as u64,
                self.arena_budget as u64,
            ));
        }
        self.used_bytes = wanted;
        Ok(())
    }

    fn link(&mut self, offset: usize, op: LumpOp, scope: LumpScope) -> TextopsResult<EditHandle> {
        if self.live >= self.max_lumps {
            return Err(TextopsError::resource_error(
                ResourceType::Lumps,
                self.live as u64 + 1,
                self.max_lumps as u64,
            ));
        }
        self.reserve(RECORD_OVERHEAD)?;
        let lump = Lump {
            offset,
            op,
            scope,
            seq: self.bump_seq(),
            before: Vec::new(),
            after: Vec::new(),
        };
        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.lump = Some(lump);
        self.live += 1;
        Ok(EditHandle { index, generation: slot.generation })
    }

    fn insert(&mut self, at: At, payload: Payload, before: bool) -> TextopsResult<EditHandle> {
        // validate the target before reserving anything
        if let At::Edit(handle) = at {
            if self.get(handle).is_none() {
                return Err(TextopsError::state_error(
                    "insert",
                    "stale edit handle",
                    Some(format!("slot {}", handle.index)),
                ));
            }
        }
        self.reserve(payload.charge())?;
        let handle = match at {
            At::Edit(handle) => handle,
            At::Offset(offset) => match self.anchor(offset) {
                Ok(handle) => handle,
                Err(err) => {
                    self.used_bytes -= payload.charge();
                    return Err(err);
                }
            },
        };
        let insert = Insert { seq: self.bump_seq(), payload };
        if let Some(lump) = self.slots[handle.index].lump.as_mut() {
            if before {
                lump.before.push(insert);
            } else {
                lump.after.push(insert);
            }
        }
        Ok(handle)
    }

    fn release(&mut self, index: usize) -> Option<Lump> {
        let slot = &mut self.slots[index];
        let lump = slot.lump.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(index);
        self.live -= 1;
        self.used_bytes -= lump.charge();
        if lump.is_delete() {
            self.deletes.remove(&lump.offset);
        }
        Some(lump)
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUF: &[u8] = b"0123456789";

    #[test]
    fn test_empty_list_is_identity() {
        let list = EditList::new(BUF.len());
        assert_eq!(list.linearize(BUF), BUF);
    }

    #[test]
    fn test_delete_and_replace() {
        let mut list = EditList::new(BUF.len());
        let del = list.delete(2, 3).unwrap();
        list.insert_after(del, "abc").unwrap();
        list.delete(8, 2).unwrap();
        assert_eq!(list.linearize(BUF), b"01abc567");
    }

    #[test]
    fn test_insert_before_and_after_order() {
        let mut list = EditList::new(BUF.len());
        let anchor = list.anchor(5).unwrap();
        list.insert_after(anchor, "A1").unwrap();
        list.insert_after(anchor, "A2").unwrap();
        list.insert_before(anchor, "B").unwrap();
        assert_eq!(list.linearize(BUF), b"01234BA1A256789");
    }

    #[test]
    fn test_insert_at_bare_offset() {
        let mut list = EditList::new(BUF.len());
        list.insert_before(0usize, "<").unwrap();
        list.insert_after(10usize, ">").unwrap();
        assert_eq!(list.linearize(BUF), b"<0123456789>");
    }

    #[test]
    fn test_delete_out_of_range() {
        let mut list = EditList::new(BUF.len());
        let err = list.delete(8, 5).unwrap_err();
        assert!(matches!(err, TextopsError::InvalidRange { .. }));
        assert!(list.is_empty());
    }

    #[test]
    fn test_overlapping_delete_rejected() {
        let mut list = EditList::new(BUF.len());
        list.delete(2, 4).unwrap();
        assert!(matches!(list.delete(5, 2), Err(TextopsError::OverlappingEdit { .. })));
        assert!(matches!(list.delete(0, 3), Err(TextopsError::OverlappingEdit { .. })));
        assert!(matches!(list.delete(3, 1), Err(TextopsError::OverlappingEdit { .. })));
        // adjacent is fine
        list.delete(6, 2).unwrap();
        list.delete(0, 2).unwrap();
        assert_eq!(list.linearize(BUF), b"89");
    }

    #[test]
    fn test_anchor_inside_deleted_range_emits_inserts_only() {
        let mut list = EditList::new(BUF.len());
        list.delete(2, 5).unwrap();
        list.insert_after(4usize, "X").unwrap();
        assert_eq!(list.linearize(BUF), b"01X789");
    }

    #[test]
    fn test_arena_budget() {
        let limits = RewriteLimits::with_arena_budget(RECORD_OVERHEAD + 4);
        let mut list = EditList::with_limits(BUF.len(), &limits);
        let anchor = list.anchor(0).unwrap();
        list.insert_after(anchor, "abcd").unwrap();
        let err = list.insert_after(anchor, "e").unwrap_err();
        assert_eq!(err.category(), "resource");
        // failed insert left the chain intact
        assert_eq!(list.linearize(BUF), b"abcd0123456789");
    }

    #[test]
    fn test_borrowed_payload_not_charged() {
        let limits = RewriteLimits::with_arena_budget(RECORD_OVERHEAD);
        let mut list = EditList::with_limits(BUF.len(), &limits);
        let shared: Arc<[u8]> = Arc::from(&b"shared"[..]);
        let anchor = list.anchor(10).unwrap();
        list.insert_after(anchor, Payload::Borrowed(shared.clone())).unwrap();
        assert!(!list.get(anchor).unwrap().after().next().unwrap().is_owned());
        assert_eq!(list.linearize(BUF), b"0123456789shared");
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut list = EditList::new(BUF.len());
        let handle = list.anchor(3).unwrap();
        assert!(list.remove(handle).is_some());
        let reused = list.anchor(4).unwrap();
        assert_ne!(handle, reused);
        assert!(list.insert_after(handle, "x").is_err());
        assert!(list.get(handle).is_none());
    }

    #[test]
    fn test_clear_scope_only_drops_body_lumps() {
        let mut list = EditList::new(BUF.len());
        list.delete(0, 1).unwrap();
        let body = list.delete_in(5, 5, LumpScope::Body).unwrap();
        list.insert_after(body, "new").unwrap();
        assert_eq!(list.clear_scope(LumpScope::Body), 1);
        assert_eq!(list.len(), 1);
        // range is free again after the clear
        list.delete(5, 5).unwrap();
        assert_eq!(list.linearize(BUF), b"1234");
    }

    #[test]
    fn test_clear_subset_predicate() {
        let mut list = EditList::new(BUF.len());
        list.delete(1, 1).unwrap();
        list.delete(6, 1).unwrap();
        list.anchor(7).unwrap();
        let removed = list.clear_subset(|lump| lump.offset() >= 5);
        assert_eq!(removed, 2);
        assert_eq!(list.linearize(BUF), b"023456789");
    }

    #[test]
    fn test_rollback_restores_prior_state() {
        let mut list = EditList::new(BUF.len());
        let keep = list.anchor(0).unwrap();
        list.insert_after(keep, "k").unwrap();
        let used = list.used_bytes();
        let cp = list.checkpoint();
        list.insert_after(keep, "zz").unwrap();
        list.delete(3, 2).unwrap();
        list.rollback(cp);
        assert_eq!(list.used_bytes(), used);
        assert_eq!(list.len(), 1);
        assert_eq!(list.linearize(BUF), b"k0123456789");
    }

    #[test]
    fn test_is_deleted() {
        let mut list = EditList::new(BUF.len());
        list.delete(2, 4).unwrap();
        assert!(list.is_deleted(2, 4));
        assert!(list.is_deleted(3, 1));
        assert!(!list.is_deleted(5, 2));
        assert!(!list.is_deleted(0, 1));
    }

    #[test]
    fn test_output_len_matches_linearized_region() {
        let mut list = EditList::new(BUF.len());
        let del = list.delete(6, 2).unwrap();
        list.insert_after(del, "abc").unwrap();
        list.insert_before(2usize, "zz").unwrap();
        list.insert_after(10usize, "!").unwrap();
        // region 5..10: "5" + "abc" + "89" + "!"
        assert_eq!(list.output_len(5..10), 7);
        assert_eq!(list.output_len(0..5), 7);
    }

    #[test]
    fn test_max_lumps() {
        let limits = RewriteLimits { max_lumps: 2, ..Default::default() };
        let mut list = EditList::with_limits(BUF.len(), &limits);
        list.anchor(0).unwrap();
        list.anchor(1).unwrap();
        let err = list.anchor(2).unwrap_err();
        assert!(matches!(err, TextopsError::ResourceError { resource_type: ResourceType::Lumps, .. }));
    }
}
