//! Per-program-point snapshots of virtual heap objects.
//!
//! A [`VirtualObject`] records the known contents of one tracked allocation;
//! a [`VirtualState`] maps every alias to its object at one effect node.
//! Both are shared by id between effect nodes whenever no path-local
//! modification is needed. Sharing is governed by the owner id plus the
//! `COPY_REQUIRED` flag: a mutator that finds an object it does not own, or
//! one flagged after initialization, must clone before writing.

use bitflags::bitflags;

use crate::graph::{Arena, Id, NodeId};

/// Dense index identifying one tracked allocation across all states.
pub type Alias = u32;

pub type VirtId = Id<VirtualObject>;
pub type StateId = Id<VirtualState>;

bitflags! {
    /// Status of a [`VirtualObject`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VirtStatus: u8 {
        /// Snapshot tracking is active (constant-size allocation).
        const TRACKED = 1 << 0;
        /// The construction region has finished; fields are observable.
        const INITIALIZED = 1 << 1;
        /// Mutations must clone first once the object is initialized.
        const COPY_REQUIRED = 1 << 2;
    }
}

/// Snapshot of one heap object's fields at a program point.
pub struct VirtualObject {
    id: NodeId,
    status: VirtStatus,
    fields: Vec<Option<NodeId>>,
    /// `true` at slot `i` iff `fields[i]` is a phi this pass synthesized.
    phis: Vec<bool>,
    object_state: Option<NodeId>,
    owner: StateId,
}

impl VirtualObject {
    /// An object whose size is not compile-time known. Field tracking stays
    /// off; the status pass will escape the allocation.
    pub fn untracked(id: NodeId, owner: StateId) -> Self {
        VirtualObject {
            id,
            status: VirtStatus::empty(),
            fields: Vec::new(),
            phis: Vec::new(),
            object_state: None,
            owner,
        }
    }

    pub fn tracked(id: NodeId, owner: StateId, field_count: usize, initialized: bool) -> Self {
        let mut status = VirtStatus::TRACKED;
        if initialized {
            status |= VirtStatus::INITIALIZED;
        }
        VirtualObject {
            id,
            status,
            fields: vec![None; field_count],
            phis: vec![false; field_count],
            object_state: None,
            owner,
        }
    }

    /// Clone for a new owning state. The clone starts without
    /// `COPY_REQUIRED`: it is private to `owner` until shared again.
    pub fn clone_for(&self, owner: StateId) -> Self {
        VirtualObject {
            id: self.id,
            status: self.status - VirtStatus::COPY_REQUIRED,
            fields: self.fields.clone(),
            phis: self.phis.clone(),
            object_state: self.object_state,
            owner,
        }
    }

    /// The originating allocation.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn owner(&self) -> StateId {
        self.owner
    }

    pub fn is_tracked(&self) -> bool {
        self.status.contains(VirtStatus::TRACKED)
    }

    pub fn is_initialized(&self) -> bool {
        self.status.contains(VirtStatus::INITIALIZED)
    }

    pub fn set_initialized(&mut self) {
        self.status |= VirtStatus::INITIALIZED;
    }

    pub fn set_copy_required(&mut self) {
        self.status |= VirtStatus::COPY_REQUIRED;
    }

    /// Whether a mutation must clone this object first.
    pub fn needs_copy_for_modification(&self) -> bool {
        self.status
            .contains(VirtStatus::COPY_REQUIRED | VirtStatus::INITIALIZED)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// The value at `offset`; `None` means unknown.
    pub fn field(&self, offset: usize) -> Option<NodeId> {
        self.fields[offset]
    }

    /// Like [`VirtualObject::field`], but out-of-range offsets read as
    /// unknown.
    pub fn field_or_none(&self, offset: usize) -> Option<NodeId> {
        self.fields.get(offset).copied().flatten()
    }

    pub fn is_synthesized_phi(&self, offset: usize) -> bool {
        self.phis[offset]
    }

    pub fn set_field(&mut self, offset: usize, value: Option<NodeId>, synthesized_phi: bool) {
        self.fields[offset] = value;
        self.phis[offset] = synthesized_phi;
    }

    /// Grow the field vector. Returns whether it grew; never shrinks.
    pub fn resize_fields(&mut self, field_count: usize) -> bool {
        if field_count > self.fields.len() {
            self.fields.resize(field_count, None);
            self.phis.resize(field_count, false);
            return true;
        }
        false
    }

    pub fn clear_all_fields(&mut self) {
        for field in &mut self.fields {
            *field = None;
        }
        for phi in &mut self.phis {
            *phi = false;
        }
    }

    pub fn all_fields_clear(&self) -> bool {
        self.fields.iter().all(|f| f.is_none())
    }

    /// Overwrite this snapshot from `other`, reporting whether anything
    /// differed.
    pub fn update_from(&mut self, other: &VirtualObject) -> bool {
        let mut changed = self.status != other.status;
        self.status = other.status;
        self.phis = other.phis.clone();
        if self.fields.len() != other.fields.len() {
            self.fields = other.fields.clone();
            return true;
        }
        for (field, other_field) in self.fields.iter_mut().zip(&other.fields) {
            if field != other_field {
                changed = true;
                *field = *other_field;
            }
        }
        changed
    }

    pub fn object_state(&self) -> Option<NodeId> {
        self.object_state
    }

    pub fn set_object_state(&mut self, node: NodeId) {
        self.object_state = Some(node);
    }
}

/// Alias-indexed table of virtual objects at one effect node. A `None` slot
/// means the alias is not live here.
pub struct VirtualState {
    owner: NodeId,
    info: Vec<Option<VirtId>>,
}

impl VirtualState {
    pub fn new(owner: NodeId, alias_count: usize) -> Self {
        VirtualState {
            owner,
            info: vec![None; alias_count],
        }
    }

    /// Clone for a new owning node. Objects are shared with the source
    /// state; their owners keep pointing at it, so mutations through the
    /// clone go through copy-on-write.
    pub fn clone_for(&self, owner: NodeId) -> Self {
        VirtualState {
            owner,
            info: self.info.clone(),
        }
    }

    /// The effect node whose out-state this is.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn alias_count(&self) -> usize {
        self.info.len()
    }

    pub fn object_at(&self, alias: Alias) -> Option<VirtId> {
        self.info.get(alias as usize).copied().flatten()
    }

    pub fn set_object(&mut self, alias: Alias, object: Option<VirtId>) {
        self.info[alias as usize] = object;
    }

    pub fn objects(&self) -> impl Iterator<Item = VirtId> + '_ {
        self.info.iter().filter_map(|slot| *slot)
    }

    /// Flag every contained object so the next mutation on any path clones.
    pub fn mark_copy_required(&self, objects: &mut Arena<VirtualObject>) {
        for vid in self.objects() {
            objects[vid].set_copy_required();
        }
    }
}

/// Scratch space reused across effect-phi merges and phi-replacement
/// synthesis.
#[derive(Default)]
pub struct MergeCache {
    pub states: Vec<StateId>,
    pub objects: Vec<VirtId>,
    pub fields: Vec<NodeId>,
}

impl MergeCache {
    pub fn clear(&mut self) {
        self.states.clear();
        self.objects.clear();
        self.fields.clear();
    }

    /// Collect the contributors' values for field slot `pos` into `fields`
    /// and return the common value if every contributor agrees on one.
    pub fn collect_field(
        &mut self,
        pos: usize,
        objects: &Arena<VirtualObject>,
    ) -> Option<NodeId> {
        self.fields.clear();
        let mut rep = objects[self.objects[0]].field_or_none(pos);
        for &vid in &self.objects {
            let obj = &objects[vid];
            if pos >= obj.field_count() {
                continue;
            }
            let field = obj.field(pos);
            if let Some(field) = field {
                self.fields.push(field);
            }
            if field != rep {
                rep = None;
            }
        }
        rep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Arena;

    fn node(i: u32) -> NodeId {
        NodeId::new(i)
    }

    #[test]
    fn copy_required_only_bites_after_initialization() {
        let mut objects: Arena<VirtualObject> = Arena::new();
        let owner = StateId::new(0);
        let vid = objects.push(VirtualObject::tracked(node(1), owner, 2, false));

        objects[vid].set_copy_required();
        assert!(!objects[vid].needs_copy_for_modification());

        objects[vid].set_initialized();
        assert!(objects[vid].needs_copy_for_modification());

        let clone = objects[vid].clone_for(StateId::new(1));
        assert!(!clone.needs_copy_for_modification());
        assert!(clone.is_initialized());
    }

    #[test]
    fn update_from_reports_field_changes() {
        let owner = StateId::new(0);
        let mut a = VirtualObject::tracked(node(1), owner, 2, true);
        let mut b = VirtualObject::tracked(node(1), owner, 2, true);
        b.set_field(0, Some(node(7)), false);

        assert!(a.update_from(&b));
        assert!(!a.update_from(&b));
        assert_eq!(a.field(0), Some(node(7)));
    }

    #[test]
    fn collect_field_detects_agreement_and_conflict() {
        let mut objects: Arena<VirtualObject> = Arena::new();
        let owner = StateId::new(0);
        let a = objects.push(VirtualObject::tracked(node(1), owner, 1, true));
        let b = objects.push(VirtualObject::tracked(node(2), owner, 1, true));
        objects[a].set_field(0, Some(node(7)), false);
        objects[b].set_field(0, Some(node(7)), false);

        let mut cache = MergeCache::default();
        cache.objects.extend([a, b]);
        assert_eq!(cache.collect_field(0, &objects), Some(node(7)));

        objects[b].set_field(0, Some(node(11)), false);
        assert_eq!(cache.collect_field(0, &objects), None);
        // Both branch values were gathered for phi synthesis.
        assert_eq!(cache.fields, vec![node(7), node(11)]);
    }
}
