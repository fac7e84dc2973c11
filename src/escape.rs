//! Escape analysis over the sea-of-nodes graph.
//!
//! The analysis decides, for every heap allocation, whether the object's
//! identity and contents can outlive the surrounding function. Allocations
//! that provably cannot are *virtual*: their field contents are tracked as
//! per-effect-node snapshots, loads against them receive replacement nodes,
//! and a downstream reducer may delete them outright. Everything else is
//! *escaped*.
//!
//! Three phases run inside [`EscapeAnalysis::run`]:
//!
//! 1. Alias assignment: a reverse reachability walk from the graph end
//!    numbers every trackable allocation with a dense alias.
//! 2. State propagation: a fixed-point worklist over effect edges threads
//!    [`VirtualState`] snapshots through the graph, merging at effect phis
//!    and resolving loads to replacements as it goes.
//! 3. Status propagation: a second fixed point inspects every use of every
//!    tracked node and escalates allocations whose uses are incompatible
//!    with virtualization.
//!
//! States and objects are shared by id between effect nodes and forked lazily
//! through the owner/`COPY_REQUIRED` copy-on-write protocol in
//! [`crate::state`].

use std::collections::VecDeque;
use std::mem;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::graph::{
    Arena, FieldAccess, ElementAccess, Graph, MachineRep, NodeId, Operator, Use,
    POINTER_SIZE, POINTER_SIZE_LOG2,
};
use crate::state::{Alias, MergeCache, StateId, VirtId, VirtualObject, VirtualState};
use crate::trace;

/// Alias of a reachable node that is not a trackable allocation.
pub const UNTRACKABLE: Alias = Alias::MAX - 1;
/// Alias of a node never seen from the graph end.
pub const NOT_REACHABLE: Alias = Alias::MAX;

bitflags! {
    /// Per-node bookkeeping for both fixed points.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct NodeStatus: u16 {
        const TRACKED               = 1 << 0;
        const ESCAPED               = 1 << 1;
        const IN_QUEUE              = 1 << 2;
        const ON_STACK              = 1 << 3;
        const VISITED               = 1 << 4;
        const DANGLING_COMPUTED     = 1 << 5;
        const DANGLING              = 1 << 6;
        const BRANCH_POINT_COMPUTED = 1 << 7;
        const BRANCH_POINT          = 1 << 8;
    }
}

/// The escape analysis engine. Borrows the graph mutably for its lifetime:
/// it inserts synthesized phis and object-state nodes.
pub struct EscapeAnalysis<'g> {
    graph: &'g mut Graph,
    /// Alias per node id; sized once during alias assignment. Later node ids
    /// read as untrackable.
    aliases: Vec<Alias>,
    next_free_alias: Alias,
    status: Vec<NodeStatus>,
    status_stack: Vec<NodeId>,
    virtual_states: Vec<Option<StateId>>,
    replacements: Vec<Option<NodeId>>,
    states: Arena<VirtualState>,
    objects: Arena<VirtualObject>,
    cache: MergeCache,
    ran: bool,
}

impl<'g> EscapeAnalysis<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        EscapeAnalysis {
            graph,
            aliases: Vec::new(),
            next_free_alias: 0,
            status: Vec::new(),
            status_stack: Vec::new(),
            virtual_states: Vec::new(),
            replacements: Vec::new(),
            states: Arena::new(),
            objects: Arena::new(),
            cache: MergeCache::default(),
            ran: false,
        }
    }

    /// Compute everything. Idempotent: repeated calls keep the first run's
    /// results.
    pub fn run(&mut self) {
        if self.ran {
            return;
        }
        self.ran = true;
        self.assign_aliases();
        if self.alias_count() > 0 {
            if self.replacements.len() < self.graph.node_count() {
                self.replacements.resize(self.graph.node_count(), None);
            }
            self.resize_status_vector();
            self.run_object_analysis();
            self.run_status_analysis();
        }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Number of aliases assigned: tracked allocations are `0..alias_count`.
    pub fn alias_count(&self) -> Alias {
        self.next_free_alias
    }

    // ── Public queries ──────────────────────────────────────────────

    /// Tracked and not escaped: eligible for elimination.
    pub fn is_virtual(&self, node: NodeId) -> bool {
        match self.status.get(node.index()) {
            Some(st) => st.contains(NodeStatus::TRACKED) && !st.contains(NodeStatus::ESCAPED),
            None => false,
        }
    }

    pub fn is_escaped(&self, node: NodeId) -> bool {
        self.status_of(node).contains(NodeStatus::ESCAPED)
    }

    /// The transitive replacement for `node`, if any was recorded.
    pub fn get_replacement(&self, node: NodeId) -> Option<NodeId> {
        let resolved = self.resolve_replacement(node);
        (resolved != node).then_some(resolved)
    }

    /// Follow the replacement chain to its fixed point.
    pub fn resolve_replacement(&self, mut node: NodeId) -> NodeId {
        while let Some(rep) = self.replacement_step(node) {
            node = rep;
        }
        node
    }

    /// Whether `a` and `b` denote the same virtual object: identical after
    /// resolution, or structurally equivalent synthesized phis.
    pub fn compare_virtual_objects(&self, a: NodeId, b: NodeId) -> bool {
        debug_assert!(self.is_virtual(a) && self.is_virtual(b));
        self.is_equivalent_phi(self.resolve_replacement(a), self.resolve_replacement(b))
    }

    /// Fast check for downstream pass scheduling: does any virtual
    /// allocation exist at all?
    pub fn exists_virtual_allocate(&self) -> bool {
        self.aliases.iter().enumerate().any(|(idx, &alias)| {
            alias < UNTRACKABLE && self.is_virtual(NodeId::new(idx as u32))
        })
    }

    /// Materialize (or fetch the cached) `ObjectState` node describing the
    /// virtual object `node` as observed at effect node `effect`, for use in
    /// deoptimization frame states. Fields that are themselves virtual
    /// objects are recursively materialized.
    pub fn get_or_create_object_state(&mut self, effect: NodeId, node: NodeId) -> Option<NodeId> {
        if !self.is_allocation(node) || !self.is_virtual(node) {
            return None;
        }
        let state = self.state_at(effect)?;
        let resolved = self.resolve_replacement(node);
        let vobj = self.get_virtual_object(state, resolved)?;
        if let Some(object_state) = self.objects[vobj].object_state() {
            return Some(object_state);
        }
        let mut inputs: Vec<NodeId> = Vec::new();
        for pos in 0..self.objects[vobj].field_count() {
            if let Some(field) = self.objects[vobj].field(pos) {
                inputs.push(field);
            }
        }
        let object_state = self.graph.new_node(
            Operator::ObjectState {
                value_count: inputs.len() as u32,
                object: self.objects[vobj].id(),
            },
            &inputs,
        );
        // Cache before recursing so nested self references terminate.
        self.objects[vobj].set_object_state(object_state);
        self.resize_status_vector();
        trace!(
            "created object state n{} for allocation n{} at effect n{}",
            object_state.index(),
            node.index(),
            effect.index()
        );
        for (input_pos, field) in inputs.into_iter().enumerate() {
            if let Some(nested) = self.get_or_create_object_state(effect, field) {
                self.graph.replace_value_input(object_state, input_pos, nested);
            }
        }
        Some(object_state)
    }

    // ── Alias assignment ────────────────────────────────────────────

    fn assign_aliases(&mut self) {
        let node_count = self.graph.node_count();
        assert!(
            (node_count as u64) < UNTRACKABLE as u64,
            "graph too large for alias numbering"
        );
        let stack_size = (node_count / 5)
            .min(node_count / 20 + 128)
            .clamp(32, 1024);
        let mut stack: Vec<NodeId> = Vec::with_capacity(stack_size);
        self.resize_status_vector();
        self.aliases = vec![NOT_REACHABLE; node_count];
        let end = self.graph.end();
        self.aliases[end.index()] = UNTRACKABLE;
        stack.push(end);
        trace!("discovering trackable allocations");
        while let Some(node) = stack.pop() {
            match self.graph.node(node).op {
                Operator::Allocate => {
                    if self.aliases[node.index()] >= UNTRACKABLE {
                        let alias = self.next_alias();
                        self.aliases[node.index()] = alias;
                        trace!("  @{alias}: Allocate n{}", node.index());
                        self.enqueue_for_status_analysis(node);
                    }
                }
                Operator::FinishRegion => {
                    let allocate = self.graph.value_input(node, 0);
                    if matches!(self.graph.node(allocate).op, Operator::Allocate) {
                        if self.aliases[allocate.index()] >= UNTRACKABLE {
                            if self.aliases[allocate.index()] == NOT_REACHABLE {
                                stack.push(allocate);
                            }
                            let alias = self.next_alias();
                            self.aliases[allocate.index()] = alias;
                            trace!("  @{alias}: Allocate n{}", allocate.index());
                            self.enqueue_for_status_analysis(allocate);
                        }
                        self.aliases[node.index()] = self.aliases[allocate.index()];
                        trace!(
                            "  @{}: FinishRegion n{}",
                            self.aliases[node.index()],
                            node.index()
                        );
                    }
                }
                _ => {}
            }
            for i in 0..self.graph.node(node).inputs().len() {
                let input = self.graph.node(node).inputs()[i];
                if self.aliases[input.index()] == NOT_REACHABLE {
                    stack.push(input);
                    self.aliases[input.index()] = UNTRACKABLE;
                }
            }
        }
    }

    fn next_alias(&mut self) -> Alias {
        let alias = self.next_free_alias;
        self.next_free_alias += 1;
        alias
    }

    fn alias_of(&self, node: NodeId) -> Alias {
        self.aliases
            .get(node.index())
            .copied()
            .unwrap_or(UNTRACKABLE)
    }

    fn is_not_reachable(&self, node: NodeId) -> bool {
        self.aliases
            .get(node.index())
            .is_some_and(|&alias| alias == NOT_REACHABLE)
    }

    fn is_allocation(&self, node: NodeId) -> bool {
        matches!(
            self.graph.node(node).op,
            Operator::Allocate | Operator::FinishRegion
        )
    }

    // ── Status bookkeeping ──────────────────────────────────────────

    fn status_of(&self, node: NodeId) -> NodeStatus {
        self.status
            .get(node.index())
            .copied()
            .unwrap_or(NodeStatus::empty())
    }

    fn status_mut(&mut self, node: NodeId) -> &mut NodeStatus {
        let idx = node.index();
        if idx >= self.status.len() {
            self.status.resize(idx + 1, NodeStatus::empty());
        }
        &mut self.status[idx]
    }

    fn resize_status_vector(&mut self) {
        if self.status.len() <= self.graph.node_count() {
            let target = (self.graph.node_count() as f64 * 1.1) as usize + 1;
            self.status.resize(target, NodeStatus::empty());
        }
    }

    fn has_entry(&self, node: NodeId) -> bool {
        self.status_of(node)
            .intersects(NodeStatus::TRACKED | NodeStatus::ESCAPED)
    }

    fn set_escaped(&mut self, node: NodeId) -> bool {
        let changed = !self.status_of(node).contains(NodeStatus::ESCAPED);
        *self.status_mut(node) |= NodeStatus::ESCAPED | NodeStatus::TRACKED;
        changed
    }

    fn is_in_queue(&self, node: NodeId) -> bool {
        self.status_of(node).contains(NodeStatus::IN_QUEUE)
    }

    fn set_in_queue(&mut self, node: NodeId, in_queue: bool) {
        if in_queue {
            *self.status_mut(node) |= NodeStatus::IN_QUEUE;
        } else {
            *self.status_mut(node) -= NodeStatus::IN_QUEUE;
        }
    }

    /// An effect-consuming node whose effect output has no reachable
    /// consumer. Such nodes never re-enter the worklist through successors,
    /// so the propagation handles them inline. Cached per node.
    fn is_dangling_effect_node(&mut self, node: NodeId) -> bool {
        let st = self.status_of(node);
        if st.contains(NodeStatus::DANGLING_COMPUTED) {
            return st.contains(NodeStatus::DANGLING);
        }
        let op = self.graph.node(node).op;
        // An effect chain rooted directly at start marks a node that is
        // effectful in general but produces no effects in this instance.
        if op.effect_input_count() == 0
            || op.effect_output_count() == 0
            || (op.effect_input_count() == 1
                && matches!(
                    self.graph.node(self.graph.effect_input(node, 0)).op,
                    Operator::Start
                ))
        {
            *self.status_mut(node) |= NodeStatus::DANGLING_COMPUTED;
            return false;
        }
        let mut dangling = true;
        for u in self.graph.node(node).uses() {
            if self.is_not_reachable(u.user) {
                continue;
            }
            if self.graph.node(u.user).op.is_effect_input(u.index) {
                dangling = false;
                break;
            }
        }
        *self.status_mut(node) |= if dangling {
            NodeStatus::DANGLING_COMPUTED | NodeStatus::DANGLING
        } else {
            NodeStatus::DANGLING_COMPUTED
        };
        dangling
    }

    /// An effect producer with more than one non-dangling effect consumer.
    /// States forwarded past a branch point must copy before mutation.
    /// Cached per node.
    fn is_effect_branch_point(&mut self, node: NodeId) -> bool {
        let st = self.status_of(node);
        if st.contains(NodeStatus::BRANCH_POINT_COMPUTED) {
            return st.contains(NodeStatus::BRANCH_POINT);
        }
        let uses: SmallVec<[Use; 8]> = SmallVec::from_slice(self.graph.node(node).uses());
        let mut count = 0;
        let mut branch_point = false;
        for u in uses {
            if self.is_not_reachable(u.user) {
                continue;
            }
            let uop = self.graph.node(u.user).op;
            if !uop.is_effect_input(u.index) {
                continue;
            }
            if matches!(uop, Operator::LoadField(_) | Operator::LoadElement(_))
                && self.is_dangling_effect_node(u.user)
            {
                continue;
            }
            count += 1;
            if count > 1 {
                branch_point = true;
                break;
            }
        }
        *self.status_mut(node) |= if branch_point {
            NodeStatus::BRANCH_POINT_COMPUTED | NodeStatus::BRANCH_POINT
        } else {
            NodeStatus::BRANCH_POINT_COMPUTED
        };
        branch_point
    }

    // ── Replacements ────────────────────────────────────────────────

    fn replacement_step(&self, node: NodeId) -> Option<NodeId> {
        self.replacements.get(node.index()).copied().flatten()
    }

    fn set_replacement(&mut self, node: NodeId, rep: Option<NodeId>) -> bool {
        let idx = node.index();
        if idx >= self.replacements.len() {
            if rep.is_none() {
                return false;
            }
            self.replacements.resize(idx + 1, None);
        }
        let changed = self.replacements[idx] != rep;
        self.replacements[idx] = rep;
        changed
    }

    fn update_replacement(&mut self, node: NodeId, rep: Option<NodeId>) -> bool {
        if self.set_replacement(node, rep) {
            match rep {
                Some(rep) => trace!(
                    "replacement of n{} is n{}",
                    node.index(),
                    rep.index()
                ),
                None => trace!("replacement of n{} cleared", node.index()),
            }
            true
        } else {
            false
        }
    }

    // ── Virtual state lookup ────────────────────────────────────────

    fn state_at(&self, node: NodeId) -> Option<StateId> {
        self.virtual_states.get(node.index()).copied().flatten()
    }

    fn set_state(&mut self, node: NodeId, state: StateId) {
        let idx = node.index();
        if idx >= self.virtual_states.len() {
            self.virtual_states.resize(idx + 1, None);
        }
        self.virtual_states[idx] = Some(state);
    }

    fn get_virtual_object(&self, state: StateId, node: NodeId) -> Option<VirtId> {
        let alias = self.alias_of(node);
        if alias as usize >= self.states[state].alias_count() {
            return None;
        }
        self.states[state].object_at(alias)
    }

    fn resolve_virtual_object(&self, state: StateId, node: NodeId) -> Option<VirtId> {
        self.get_virtual_object(state, self.resolve_replacement(node))
    }

    // ── State propagation (effect worklist) ─────────────────────────

    fn run_object_analysis(&mut self) {
        if self.virtual_states.len() < self.graph.node_count() {
            self.virtual_states.resize(self.graph.node_count(), None);
        }
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        queue.push_back(self.graph.start());
        let mut danglers: Vec<NodeId> = Vec::new();
        while let Some(node) = queue.pop_back() {
            self.set_in_queue(node, false);
            if self.process(node) {
                let uses: SmallVec<[Use; 8]> = SmallVec::from_slice(self.graph.node(node).uses());
                for u in uses {
                    let user = u.user;
                    if self.is_not_reachable(user) {
                        continue;
                    }
                    let uop = self.graph.node(user).op;
                    if !uop.is_effect_input(u.index) {
                        continue;
                    }
                    if matches!(uop, Operator::EffectPhi { .. }) {
                        // Depth first, but delay phis: they converge faster
                        // once their other inputs have settled.
                        if !self.is_in_queue(user) {
                            queue.push_front(user);
                        }
                    } else if !matches!(uop, Operator::LoadField(_) | Operator::LoadElement(_))
                        || !self.is_dangling_effect_node(user)
                    {
                        if !self.is_in_queue(user) {
                            self.set_in_queue(user, true);
                            queue.push_back(user);
                        }
                    } else {
                        danglers.push(user);
                    }
                }
                // Danglers run immediately, even when already queued: they
                // have no effect successors to retrigger them.
                for dangler in danglers.drain(..) {
                    queue.push_back(dangler);
                }
            }
        }
        if crate::trace_enabled() {
            self.dump_states();
        }
    }

    /// Returns whether effect successors should be (re-)enqueued.
    fn process(&mut self, node: NodeId) -> bool {
        match self.graph.node(node).op {
            Operator::Allocate => self.process_allocation(node),
            Operator::BeginRegion => self.forward_virtual_state(node),
            Operator::FinishRegion => self.process_finish_region(node),
            Operator::StoreField(_) => self.process_store_field(node),
            Operator::LoadField(_) => self.process_load_field(node),
            Operator::StoreElement(_) => self.process_store_element(node),
            Operator::LoadElement(_) => self.process_load_element(node),
            Operator::Start => self.process_start(node),
            Operator::EffectPhi { .. } => return self.process_effect_phi(node),
            op => {
                if op.effect_input_count() > 0 {
                    self.forward_virtual_state(node);
                }
                self.process_allocation_users(node);
            }
        }
        true
    }

    fn process_start(&mut self, node: NodeId) {
        let state = self
            .states
            .push(VirtualState::new(node, self.alias_count() as usize));
        self.set_state(node, state);
    }

    /// Attach the effect input's out-state to `node`, sharing it by id.
    /// The state is poisoned with `COPY_REQUIRED` when sharing would be
    /// observable: past an effect branch point, or into a node that carries
    /// a deoptimization frame state.
    fn forward_virtual_state(&mut self, node: NodeId) {
        let op = self.graph.node(node).op;
        debug_assert_eq!(op.effect_input_count(), 1);
        if cfg!(debug_assertions)
            && !matches!(op, Operator::LoadField(_) | Operator::LoadElement(_))
            && self.is_dangling_effect_node(node)
        {
            panic!(
                "dangling effect node n{} ({}) reached state forwarding",
                node.index(),
                op.mnemonic()
            );
        }
        let effect = self.graph.effect_input(node, 0);
        let in_state = self.state_at(effect).unwrap_or_else(|| {
            panic!(
                "effect input n{} of n{} has no virtual state",
                effect.index(),
                node.index()
            )
        });
        match self.state_at(node) {
            Some(existing) => {
                self.state_update_from(existing, in_state);
            }
            None => {
                self.set_state(node, in_state);
                trace!(
                    "forwarding state s{} from n{} to n{}",
                    in_state.index(),
                    effect.index(),
                    node.index()
                );
                if self.is_effect_branch_point(effect) || op.frame_state_input_count() > 0 {
                    trace!("  effect input n{} is a branch point", effect.index());
                    self.states[in_state].mark_copy_required(&mut self.objects);
                }
            }
        }
    }

    /// Fold `from` into `this` slot by slot. The return value is
    /// deliberately damped to `false`: in-place forwarding alone never
    /// re-enqueues successors, only the effect-phi merge reports change.
    fn state_update_from(&mut self, this: StateId, from: StateId) -> bool {
        if this == from {
            return false;
        }
        for alias in 0..self.states[this].alias_count() as Alias {
            let Some(rhs) = self.states[from].object_at(alias) else {
                continue;
            };
            match self.states[this].object_at(alias) {
                Some(lhs) if lhs == rhs => {}
                Some(lhs) => {
                    trace!("  updating fields of @{alias}");
                    let (dst, src) = self.objects.pair_mut(lhs, rhs);
                    dst.update_from(src);
                }
                None => {
                    let clone = self.objects[rhs].clone_for(this);
                    let vid = self.objects.push(clone);
                    self.states[this].set_object(alias, Some(vid));
                }
            }
        }
        false
    }

    fn copy_state_for_modification(&mut self, state: StateId, node: NodeId) -> StateId {
        if self.states[state].owner() != node {
            let clone = self.states[state].clone_for(node);
            let new_state = self.states.push(clone);
            self.set_state(node, new_state);
            trace!(
                "copying state s{} to s{} at n{}",
                state.index(),
                new_state.index(),
                node.index()
            );
            new_state
        } else {
            state
        }
    }

    fn copy_object_for_modification(
        &mut self,
        obj: VirtId,
        state: StateId,
        node: NodeId,
    ) -> VirtId {
        if !self.objects[obj].needs_copy_for_modification() {
            return obj;
        }
        let state = self.copy_state_for_modification(state, node);
        if self.objects[obj].owner() == state {
            return obj;
        }
        let alias = self.alias_of(self.objects[obj].id());
        let clone = self.objects[obj].clone_for(state);
        let vid = self.objects.push(clone);
        self.states[state].set_object(alias, Some(vid));
        trace!(
            "  copied object @{alias} for modification at n{}",
            node.index()
        );
        vid
    }

    fn process_allocation(&mut self, node: NodeId) {
        self.forward_virtual_state(node);
        let alias = self.alias_of(node);
        debug_assert!(alias < UNTRACKABLE);
        let mut state = self
            .state_at(node)
            .expect("allocation was forwarded a state");
        // Already processed on this path.
        if self.states[state].object_at(alias).is_some() {
            return;
        }
        let owner = self.states[state].owner();
        if matches!(self.graph.node(owner).op, Operator::EffectPhi { .. }) {
            state = self.copy_state_for_modification(state, node);
        }
        let size_op = self.graph.node(self.graph.value_input(node, 0)).op;
        assert!(
            !size_op.is_machine_constant(),
            "allocation size of n{} is a machine-word literal",
            node.index()
        );
        let vobj = match size_op.number_value() {
            Some(size) => VirtualObject::tracked(
                node,
                state,
                size.max(0) as usize / POINTER_SIZE as usize,
                false,
            ),
            // Dynamic size: keep a placeholder; the status pass escapes it.
            None => VirtualObject::untracked(node, state),
        };
        let vid = self.objects.push(vobj);
        self.states[state].set_object(alias, Some(vid));
        trace!("allocation n{} tracked as @{alias}", node.index());
    }

    fn process_finish_region(&mut self, node: NodeId) {
        self.forward_virtual_state(node);
        let allocation = self.graph.value_input(node, 0);
        if matches!(self.graph.node(allocation).op, Operator::Allocate) {
            let state = self
                .state_at(node)
                .expect("finish region was forwarded a state");
            let obj = self
                .states[state]
                .object_at(self.alias_of(node))
                .expect("finish region closes a tracked allocation");
            self.objects[obj].set_initialized();
        }
    }

    fn field_access(&self, node: NodeId) -> FieldAccess {
        match self.graph.node(node).op {
            Operator::StoreField(access) | Operator::LoadField(access) => access,
            op => panic!("expected a field access operator, got {}", op.mnemonic()),
        }
    }

    fn element_access(&self, node: NodeId) -> ElementAccess {
        match self.graph.node(node).op {
            Operator::StoreElement(access) | Operator::LoadElement(access) => access,
            op => panic!("expected an element access operator, got {}", op.mnemonic()),
        }
    }

    fn field_offset(&self, node: NodeId) -> usize {
        let access = self.field_access(node);
        assert_eq!(
            access.offset % POINTER_SIZE,
            0,
            "field offset {} of n{} is not pointer-aligned",
            access.offset,
            node.index()
        );
        (access.offset / POINTER_SIZE) as usize
    }

    /// Element accesses narrower than a pointer or with unaligned headers
    /// cannot map onto pointer-sized field slots.
    fn check_element_access(&self, access: ElementAccess, node: NodeId) {
        assert!(
            access.rep.element_size_log2() >= POINTER_SIZE_LOG2,
            "element representation of n{} is narrower than a pointer",
            node.index()
        );
        assert_eq!(
            access.header_size % POINTER_SIZE,
            0,
            "element header size {} of n{} is not pointer-aligned",
            access.header_size,
            node.index()
        );
    }

    fn process_store_field(&mut self, node: NodeId) {
        self.forward_virtual_state(node);
        let to = self.resolve_replacement(self.graph.value_input(node, 0));
        let state = self.state_at(node).expect("store was forwarded a state");
        let offset = self.field_offset(node);
        if let Some(obj) = self.get_virtual_object(state, to) {
            if self.objects[obj].is_tracked() && offset < self.objects[obj].field_count() {
                let val = self.resolve_replacement(self.graph.value_input(node, 1));
                if self.objects[obj].field(offset) != Some(val) {
                    let obj = self.copy_object_for_modification(obj, state, node);
                    self.objects[obj].set_field(offset, Some(val), false);
                }
            }
        }
    }

    fn process_load_field(&mut self, node: NodeId) {
        self.forward_virtual_state(node);
        let from = self.resolve_replacement(self.graph.value_input(node, 0));
        let state = self.state_at(node).expect("load was forwarded a state");
        if let Some(obj) = self.get_virtual_object(state, from) {
            let offset = self.field_offset(node);
            if !self.objects[obj].is_tracked() || offset >= self.objects[obj].field_count() {
                return;
            }
            let value = self.objects[obj]
                .field(offset)
                .map(|v| self.resolve_replacement(v));
            self.update_replacement(node, value);
        } else if matches!(self.graph.node(from).op, Operator::Phi { .. })
            && self.field_access(node).offset % POINTER_SIZE == 0
        {
            let offset = (self.field_access(node).offset / POINTER_SIZE) as usize;
            self.process_load_from_phi(offset, from, node, state);
        } else {
            self.update_replacement(node, None);
        }
    }

    fn process_load_element(&mut self, node: NodeId) {
        self.forward_virtual_state(node);
        let from = self.resolve_replacement(self.graph.value_input(node, 0));
        let state = self.state_at(node).expect("load was forwarded a state");
        let index_node = self.graph.value_input(node, 1);
        let index_op = self.graph.node(index_node).op;
        assert!(
            !index_op.is_machine_constant(),
            "element index of n{} is a machine-word literal",
            node.index()
        );
        let access = self.element_access(node);
        if let Some(index) = index_op.number_value() {
            let offset = index.max(0) as usize + (access.header_size / POINTER_SIZE) as usize;
            if let Some(obj) = self.get_virtual_object(state, from) {
                self.check_element_access(access, node);
                if !self.objects[obj].is_tracked() || offset >= self.objects[obj].field_count() {
                    return;
                }
                let value = self.objects[obj]
                    .field(offset)
                    .map(|v| self.resolve_replacement(v));
                self.update_replacement(node, value);
            } else if matches!(self.graph.node(from).op, Operator::Phi { .. }) {
                self.process_load_from_phi(offset, from, node, state);
            } else {
                self.update_replacement(node, None);
            }
        } else {
            // A load from a non-constant index observes the whole object.
            if self.set_escaped(from) {
                trace!(
                    "n{} escapes: load element n{} from non-constant index n{}",
                    from.index(),
                    node.index(),
                    index_node.index()
                );
            }
        }
    }

    fn process_store_element(&mut self, node: NodeId) {
        self.forward_virtual_state(node);
        let to = self.resolve_replacement(self.graph.value_input(node, 0));
        let state = self.state_at(node).expect("store was forwarded a state");
        let index_node = self.graph.value_input(node, 1);
        let index_op = self.graph.node(index_node).op;
        assert!(
            !index_op.is_machine_constant(),
            "element index of n{} is a machine-word literal",
            node.index()
        );
        let access = self.element_access(node);
        let obj = self.get_virtual_object(state, to);
        if let Some(index) = index_op.number_value() {
            let offset = index.max(0) as usize + (access.header_size / POINTER_SIZE) as usize;
            if let Some(obj) = obj {
                if self.objects[obj].is_tracked() && offset < self.objects[obj].field_count() {
                    self.check_element_access(access, node);
                    let val = self.resolve_replacement(self.graph.value_input(node, 2));
                    if self.objects[obj].field(offset) != Some(val) {
                        let obj = self.copy_object_for_modification(obj, state, node);
                        self.objects[obj].set_field(offset, Some(val), false);
                    }
                }
            }
        } else {
            // A store to a non-constant index may hit any slot: the object
            // escapes and the whole snapshot is clobbered.
            if self.set_escaped(to) {
                trace!(
                    "n{} escapes: store element n{} to non-constant index n{}",
                    to.index(),
                    node.index(),
                    index_node.index()
                );
            }
            if let Some(obj) = obj {
                if self.objects[obj].is_tracked() && !self.objects[obj].all_fields_clear() {
                    let obj = self.copy_object_for_modification(obj, state, node);
                    self.objects[obj].clear_all_fields();
                    trace!("cleared all fields of @{}", self.alias_of(to));
                }
            }
        }
    }

    /// Conservative handler for operators outside the analyzed set: any
    /// value input that resolves to a tracked object loses its snapshot,
    /// because the object is visible to code the analysis cannot see into.
    fn process_allocation_users(&mut self, node: NodeId) {
        let op = self.graph.node(node).op;
        if matches!(
            op,
            Operator::StoreField(_)
                | Operator::LoadField(_)
                | Operator::StoreElement(_)
                | Operator::LoadElement(_)
                | Operator::FrameState { .. }
                | Operator::StateValues { .. }
                | Operator::ReferenceEqual
                | Operator::FinishRegion
                | Operator::ObjectIsSmi
        ) {
            return;
        }
        let value_inputs = op.value_input_count() + op.context_input_count();
        for i in 0..value_inputs {
            let Some(state) = self.state_at(node) else {
                return;
            };
            let input = self.graph.value_input(node, i);
            if let Some(obj) = self.resolve_virtual_object(state, input) {
                if !self.objects[obj].all_fields_clear() {
                    let alias = self.alias_of(self.objects[obj].id());
                    let obj = self.copy_object_for_modification(obj, state, node);
                    self.objects[obj].clear_all_fields();
                    trace!(
                        "cleared all fields of @{alias} at opaque use n{}",
                        node.index()
                    );
                }
            }
        }
    }

    // ── Effect-phi merging ──────────────────────────────────────────

    fn process_effect_phi(&mut self, node: NodeId) -> bool {
        let mut changed = false;
        let alias_count = self.alias_count() as usize;
        let mut merge_state = match self.state_at(node) {
            Some(state) => state,
            None => {
                let state = self.states.push(VirtualState::new(node, alias_count));
                self.set_state(node, state);
                changed = true;
                state
            }
        };
        let mut cache = mem::take(&mut self.cache);
        cache.clear();
        let effect_count = self.graph.node(node).op.effect_input_count();
        for i in 0..effect_count {
            let input = self.graph.effect_input(node, i);
            if let Some(state) = self.state_at(input) {
                cache.states.push(state);
                // Merging a state into itself would fold all inputs into
                // whatever got written first: fork a fresh target.
                if state == merge_state {
                    let fresh = self.states.push(VirtualState::new(node, alias_count));
                    self.set_state(node, fresh);
                    merge_state = fresh;
                    changed = true;
                }
            }
        }
        if cache.states.is_empty() {
            self.cache = cache;
            return changed;
        }
        let control = self.graph.control_input(node);
        changed = self.merge_state_from(merge_state, &mut cache, control, effect_count) || changed;
        trace!(
            "merge at effect phi n{} {}",
            node.index(),
            if changed { "changed" } else { "did not change" }
        );
        self.cache = cache;
        if changed {
            self.resize_status_vector();
        }
        changed
    }

    /// Merge the cached predecessor states into `target`. An alias survives
    /// only if every predecessor carries an object for it; surviving objects
    /// take the minimum field count and get value phis for disagreeing
    /// slots. Phis synthesized by an earlier merge are updated in place, so
    /// repeated merges converge.
    fn merge_state_from(
        &mut self,
        target: StateId,
        cache: &mut MergeCache,
        control: NodeId,
        arity: usize,
    ) -> bool {
        let mut changed = false;
        for alias in 0..self.alias_count() {
            let merge_object = self.states[target].object_at(alias);
            let mut copy_merge_object = false;
            let mut field_count = usize::MAX;
            {
                let MergeCache {
                    states, objects, ..
                } = &mut *cache;
                objects.clear();
                for &sid in states.iter() {
                    if let Some(obj) = self.states[sid].object_at(alias) {
                        objects.push(obj);
                        if merge_object == Some(obj) {
                            copy_merge_object = true;
                            changed = true;
                        }
                        field_count = field_count.min(self.objects[obj].field_count());
                    }
                }
            }
            if cache.objects.len() != cache.states.len() {
                // Not live on every path: drop the alias here.
                if merge_object.is_some() {
                    trace!("  alias @{alias} dropped at merge");
                    changed = true;
                }
                self.states[target].set_object(alias, None);
                continue;
            }
            let front = cache.objects[0];
            let front_id = self.objects[front].id();
            let initialized = self.objects[front].is_initialized();
            let mobj = self.get_or_create_tracked_object(
                target,
                alias,
                front_id,
                initialized,
                copy_merge_object,
            );
            changed = self.objects[mobj].resize_fields(field_count) || changed;
            for pos in 0..field_count {
                if let Some(field) = cache.collect_field(pos, &self.objects) {
                    changed = changed || self.objects[mobj].field(pos) != Some(field);
                    self.objects[mobj].set_field(pos, Some(field), false);
                    trace!("  field {pos} of @{alias} agrees on n{}", field.index());
                } else if cache.fields.len() == arity {
                    let existing = self.objects[mobj].field(pos);
                    if existing.is_none() || !self.objects[mobj].is_synthesized_phi(pos) {
                        let value_count = cache.fields.len();
                        cache.fields.push(control);
                        let phi = self.graph.new_node(
                            Operator::Phi {
                                rep: MachineRep::Tagged,
                                value_count: value_count as u32,
                            },
                            &cache.fields,
                        );
                        self.resize_status_vector();
                        self.objects[mobj].set_field(pos, Some(phi), true);
                        trace!(
                            "  created phi n{} for field {pos} of @{alias}",
                            phi.index()
                        );
                        changed = true;
                    } else {
                        // Update the earlier phi in place; allocating a new
                        // one every round would never converge.
                        let phi = existing.expect("synthesized phi is present");
                        debug_assert!(matches!(self.graph.node(phi).op, Operator::Phi { .. }));
                        for n in 0..arity {
                            let old = self.graph.value_input(phi, n);
                            if old != cache.fields[n] {
                                changed = true;
                                self.graph.replace_value_input(phi, n, cache.fields[n]);
                            }
                        }
                    }
                } else {
                    // Some predecessor has no value for this slot.
                    if self.objects[mobj].field(pos).is_some() {
                        trace!("  field {pos} of @{alias} cleared");
                        changed = true;
                    }
                    self.objects[mobj].set_field(pos, None, false);
                }
            }
        }
        changed
    }

    fn get_or_create_tracked_object(
        &mut self,
        target: StateId,
        alias: Alias,
        id: NodeId,
        initialized: bool,
        force_copy: bool,
    ) -> VirtId {
        if !force_copy {
            if let Some(obj) = self.states[target].object_at(alias) {
                return obj;
            }
        }
        let vid = self
            .objects
            .push(VirtualObject::tracked(id, target, 0, initialized));
        self.states[target].set_object(alias, Some(vid));
        vid
    }

    // ── Load-from-phi replacement synthesis ─────────────────────────

    /// A load whose base is a value phi over virtual objects folds to a phi
    /// over the per-branch stored values, controlled by the base phi's
    /// merge. Aborts (leaving any prior replacement) when a branch object or
    /// field value is unknown.
    fn process_load_from_phi(
        &mut self,
        offset: usize,
        from: NodeId,
        node: NodeId,
        state: StateId,
    ) {
        trace!("load n{} from phi n{}", node.index(), from.index());
        let value_count = self.graph.node(from).op.value_input_count();
        let mut cache = mem::take(&mut self.cache);
        cache.objects.clear();
        let mut complete = true;
        for i in 0..value_count {
            let input = self.resolve_replacement(self.graph.value_input(from, i));
            match self.get_virtual_object(state, input) {
                Some(obj) if self.objects[obj].is_tracked() => cache.objects.push(obj),
                _ => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            let MergeCache {
                objects: branch_objects,
                fields,
                ..
            } = &mut cache;
            fields.clear();
            for &vid in branch_objects.iter() {
                match self.objects[vid].field_or_none(offset) {
                    Some(field) => fields.push(field),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                for field in fields.iter_mut() {
                    *field = self.resolve_replacement(*field);
                }
            }
        }
        if complete {
            let existing = self.replacement_step(node);
            let equivalent =
                existing.is_some_and(|rep| self.is_equivalent_phi_to_inputs(rep, &cache.fields));
            if equivalent {
                trace!("  already has an equivalent phi");
            } else {
                let value_count = cache.fields.len();
                let control = self.graph.control_input(from);
                cache.fields.push(control);
                let phi = self.graph.new_node(
                    Operator::Phi {
                        rep: MachineRep::Tagged,
                        value_count: value_count as u32,
                    },
                    &cache.fields,
                );
                self.resize_status_vector();
                self.set_replacement(node, Some(phi));
                trace!("  created phi n{} as replacement", phi.index());
            }
        } else {
            trace!("  incomplete branch object info");
        }
        self.cache = cache;
    }

    /// Structural congruence on phis: identical nodes, or phis of equal
    /// arity with pairwise-equivalent value inputs.
    fn is_equivalent_phi(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        let (Operator::Phi { value_count: ca, .. }, Operator::Phi { value_count: cb, .. }) =
            (self.graph.node(a).op, self.graph.node(b).op)
        else {
            return false;
        };
        if ca != cb {
            return false;
        }
        (0..ca as usize).all(|i| {
            self.is_equivalent_phi(self.graph.value_input(a, i), self.graph.value_input(b, i))
        })
    }

    fn is_equivalent_phi_to_inputs(&self, phi: NodeId, inputs: &[NodeId]) -> bool {
        let Operator::Phi { value_count, .. } = self.graph.node(phi).op else {
            return false;
        };
        if value_count as usize != inputs.len() {
            return false;
        }
        inputs
            .iter()
            .enumerate()
            .all(|(i, &input)| self.is_equivalent_phi(self.graph.value_input(phi, i), input))
    }

    // ── Status propagation (escape worklist) ────────────────────────

    fn run_status_analysis(&mut self) {
        self.resize_status_vector();
        while let Some(node) = self.status_stack.pop() {
            *self.status_mut(node) -= NodeStatus::ON_STACK;
            self.process_status(node);
            *self.status_mut(node) |= NodeStatus::VISITED;
        }
    }

    fn enqueue_for_status_analysis(&mut self, node: NodeId) {
        if !self.status_of(node).contains(NodeStatus::ON_STACK) {
            self.status_stack.push(node);
            *self.status_mut(node) |= NodeStatus::ON_STACK;
        }
    }

    fn revisit_uses(&mut self, node: NodeId) {
        let uses: SmallVec<[Use; 8]> = SmallVec::from_slice(self.graph.node(node).uses());
        for u in uses {
            if !self.status_of(u.user).contains(NodeStatus::ON_STACK)
                && !self.is_not_reachable(u.user)
            {
                self.status_stack.push(u.user);
                *self.status_mut(u.user) |= NodeStatus::ON_STACK;
            }
        }
    }

    fn revisit_inputs(&mut self, node: NodeId) {
        let inputs: SmallVec<[NodeId; 4]> = SmallVec::from_slice(self.graph.node(node).inputs());
        for input in inputs {
            if !self.status_of(input).contains(NodeStatus::ON_STACK) {
                self.status_stack.push(input);
                *self.status_mut(input) |= NodeStatus::ON_STACK;
            }
        }
    }

    fn process_status(&mut self, node: NodeId) {
        match self.graph.node(node).op {
            Operator::Allocate => self.process_allocate_status(node),
            Operator::FinishRegion => self.process_finish_region_status(node),
            Operator::StoreField(_) => {
                let to = self.graph.value_input(node, 0);
                let val = self.graph.value_input(node, 1);
                self.escape_stored_value(node, to, val);
            }
            Operator::StoreElement(_) => {
                let to = self.graph.value_input(node, 0);
                let val = self.graph.value_input(node, 2);
                self.escape_stored_value(node, to, val);
            }
            Operator::LoadField(_) | Operator::LoadElement(_) => {
                // Uses of a load that folds to an allocation act on the
                // allocation itself.
                if let Some(rep) = self.get_replacement(node) {
                    if self.is_allocation(rep) && self.check_uses_for_escape(node, rep, false) {
                        self.revisit_inputs(rep);
                        self.revisit_uses(rep);
                    }
                }
                self.revisit_uses(node);
            }
            Operator::Phi { .. } => {
                if !self.has_entry(node) {
                    *self.status_mut(node) |= NodeStatus::TRACKED;
                    self.revisit_uses(node);
                }
                if !self.is_allocation_phi(node) && self.set_escaped(node) {
                    trace!("n{} escapes: phi over non-allocation inputs", node.index());
                    self.revisit_inputs(node);
                    self.revisit_uses(node);
                }
                self.check_uses_for_escape(node, node, false);
            }
            _ => {}
        }
    }

    fn process_allocate_status(&mut self, node: NodeId) {
        if !self.has_entry(node) {
            *self.status_mut(node) |= NodeStatus::TRACKED;
            trace!("allocation n{} enters status tracking", node.index());
            let size_op = self.graph.node(self.graph.value_input(node, 0)).op;
            assert!(
                !size_op.is_machine_constant(),
                "allocation size of n{} is a machine-word literal",
                node.index()
            );
            self.revisit_uses(node);
            if size_op.number_value().is_none() && self.set_escaped(node) {
                trace!("n{} escapes: non-constant allocation size", node.index());
                // Already escaped for good; uses cannot make it worse.
                return;
            }
        }
        if self.check_uses_for_escape(node, node, false) {
            self.revisit_uses(node);
        }
    }

    fn process_finish_region_status(&mut self, node: NodeId) {
        if !self.has_entry(node) {
            *self.status_mut(node) |= NodeStatus::TRACKED;
            self.revisit_uses(node);
        }
        if self.check_uses_for_escape(node, node, false) {
            self.revisit_inputs(node);
        }
    }

    /// A value stored into an escaped object, or into something that is not
    /// an allocation at all, escapes with it.
    fn escape_stored_value(&mut self, node: NodeId, to: NodeId, val: NodeId) {
        if (self.is_escaped(to) || !self.is_allocation(to)) && self.set_escaped(val) {
            trace!(
                "n{} escapes: stored into n{} by n{}",
                val.index(),
                to.index(),
                node.index()
            );
            self.revisit_uses(val);
            self.revisit_inputs(val);
        }
    }

    /// A phi whose value inputs are all allocations (or non-escaped phis of
    /// allocations) still denotes a trackable object.
    fn is_allocation_phi(&self, node: NodeId) -> bool {
        let count = self.graph.node(node).op.value_input_count();
        for i in 0..count {
            let input = self.graph.value_input(node, i);
            if matches!(self.graph.node(input).op, Operator::Phi { .. })
                && !self.is_escaped(input)
            {
                continue;
            }
            if self.is_allocation(input) {
                continue;
            }
            return false;
        }
        true
    }

    /// Inspect each value use of `producer`; escape `rep` on the first use
    /// that is incompatible with virtualization. Returns whether an escape
    /// transition happened.
    fn check_uses_for_escape(&mut self, producer: NodeId, rep: NodeId, phi_escaping: bool) -> bool {
        let uses: SmallVec<[Use; 8]> = SmallVec::from_slice(self.graph.node(producer).uses());
        for u in uses {
            if self.is_not_reachable(u.user) {
                continue;
            }
            let uop = self.graph.node(u.user).op;
            if !uop.is_value_input(u.index) {
                continue;
            }
            match uop {
                Operator::Phi { .. } => {
                    if phi_escaping && self.set_escaped(rep) {
                        trace!(
                            "n{} escapes: phi-merged at n{}",
                            rep.index(),
                            u.user.index()
                        );
                        return true;
                    }
                    if self.is_escaped(u.user) && self.set_escaped(rep) {
                        trace!(
                            "n{} escapes: used by escaped n{} ({})",
                            rep.index(),
                            u.user.index(),
                            uop.mnemonic()
                        );
                        return true;
                    }
                }
                Operator::StoreField(_)
                | Operator::LoadField(_)
                | Operator::StoreElement(_)
                | Operator::LoadElement(_)
                | Operator::FrameState { .. }
                | Operator::StateValues { .. }
                | Operator::ReferenceEqual
                | Operator::FinishRegion => {
                    if self.is_escaped(u.user) && self.set_escaped(rep) {
                        trace!(
                            "n{} escapes: used by escaped n{} ({})",
                            rep.index(),
                            u.user.index(),
                            uop.mnemonic()
                        );
                        return true;
                    }
                }
                Operator::ObjectIsSmi => {
                    // Allocations are never immediate integers: the test
                    // folds away. Anything else flowing in here escapes.
                    if !self.is_allocation(rep) && self.set_escaped(rep) {
                        trace!(
                            "n{} escapes: smi test at n{}",
                            rep.index(),
                            u.user.index()
                        );
                        return true;
                    }
                }
                Operator::Select => {
                    if self.set_escaped(rep) {
                        trace!(
                            "n{} escapes: selected at n{}",
                            rep.index(),
                            u.user.index()
                        );
                        return true;
                    }
                }
                _ => {
                    if uop.effect_input_count() == 0
                        && self.graph.node(producer).op.effect_input_count() > 0
                    {
                        panic!(
                            "cannot analyze use n{} ({}) of effectful node n{} ({})",
                            u.user.index(),
                            uop.mnemonic(),
                            producer.index(),
                            self.graph.node(producer).op.mnemonic()
                        );
                    }
                    if self.set_escaped(rep) {
                        trace!(
                            "n{} escapes: opaque use at n{} ({})",
                            rep.index(),
                            u.user.index(),
                            uop.mnemonic()
                        );
                        return true;
                    }
                }
            }
        }
        false
    }

    // ── Diagnostics ─────────────────────────────────────────────────

    fn dump_states(&self) {
        let mut seen: Vec<StateId> = Vec::new();
        for slot in &self.virtual_states {
            let Some(sid) = *slot else { continue };
            if seen.contains(&sid) {
                continue;
            }
            seen.push(sid);
            eprintln!(
                "state s{} (owner n{})",
                sid.index(),
                self.states[sid].owner().index()
            );
            for alias in 0..self.alias_count() {
                let Some(vid) = self.states[sid].object_at(alias) else {
                    continue;
                };
                let obj = &self.objects[vid];
                eprintln!(
                    "  alias @{alias}: object n{} with {} fields",
                    obj.id().index(),
                    obj.field_count()
                );
                for pos in 0..obj.field_count() {
                    if let Some(field) = obj.field(pos) {
                        eprintln!("    field {pos} = n{}", field.index());
                    }
                }
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;

    #[test]
    fn finish_region_shares_its_allocation_alias() {
        let mut b = GraphBuilder::new();
        let size = b.number_constant(16);
        b.begin_region();
        let alloc = b.allocate(size);
        let finish = b.finish_region(alloc);
        let ret = b.return_(finish);
        let mut graph = b.finish(ret);

        let mut analysis = EscapeAnalysis::new(&mut graph);
        analysis.run();

        assert_eq!(analysis.alias_count(), 1);
        assert_eq!(analysis.alias_of(alloc), 0);
        assert_eq!(analysis.alias_of(finish), 0);
    }

    #[test]
    fn unreachable_nodes_are_ignored() {
        let mut b = GraphBuilder::new();
        let size = b.number_constant(8);
        // Never wired into the graph end.
        let orphan = b.number_constant(99);
        b.begin_region();
        let alloc = b.allocate(size);
        let finish = b.finish_region(alloc);
        let ret = b.return_(finish);
        let mut graph = b.finish(ret);

        let mut analysis = EscapeAnalysis::new(&mut graph);
        analysis.run();

        assert!(analysis.is_not_reachable(orphan));
        assert!(!analysis.is_not_reachable(alloc));
    }

    #[test]
    fn dangling_load_still_receives_a_replacement() {
        let mut b = GraphBuilder::new();
        let size = b.number_constant(8);
        b.begin_region();
        let alloc = b.allocate(size);
        let finish = b.finish_region(alloc);
        let val = b.number_constant(5);
        let store = b.store_field(finish, 0, val);
        let load = b.load_field(finish, 0);
        // The return takes the loaded value but the store's effect: the
        // load's effect output dangles.
        b.set_effect(store);
        let ret = b.return_(load);
        let mut graph = b.finish(ret);

        let mut analysis = EscapeAnalysis::new(&mut graph);
        analysis.run();

        assert!(analysis.is_virtual(alloc));
        assert_eq!(analysis.get_replacement(load), Some(val));
    }

    #[test]
    fn store_into_escaped_object_escapes_the_value() {
        let mut b = GraphBuilder::new();
        let size = b.number_constant(16);

        b.begin_region();
        let escaping = b.allocate(size);
        let escaping_finish = b.finish_region(escaping);

        b.begin_region();
        let inner = b.allocate(size);
        let inner_finish = b.finish_region(inner);

        // The outer object escapes through a call; the inner object is
        // stored into it and must escape too.
        b.store_field(escaping_finish, 0, inner_finish);
        b.call(&[escaping_finish]);
        let ret = b.return_(size);
        let mut graph = b.finish(ret);

        let mut analysis = EscapeAnalysis::new(&mut graph);
        analysis.run();

        assert!(analysis.is_escaped(escaping));
        assert!(analysis.is_escaped(inner_finish));
        assert!(analysis.is_escaped(inner));
    }

    #[test]
    fn run_is_idempotent() {
        let mut b = GraphBuilder::new();
        let size = b.number_constant(8);
        b.begin_region();
        let alloc = b.allocate(size);
        let finish = b.finish_region(alloc);
        let val = b.number_constant(42);
        b.store_field(finish, 0, val);
        let load = b.load_field(finish, 0);
        let ret = b.return_(load);
        let mut graph = b.finish(ret);

        let mut analysis = EscapeAnalysis::new(&mut graph);
        analysis.run();
        let virtual_before = analysis.is_virtual(alloc);
        let rep_before = analysis.get_replacement(load);
        let nodes_before = analysis.graph().node_count();

        analysis.run();
        assert_eq!(analysis.is_virtual(alloc), virtual_before);
        assert_eq!(analysis.get_replacement(load), rep_before);
        assert_eq!(analysis.graph().node_count(), nodes_before);
    }
}
