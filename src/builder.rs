//! Construction API for sea-of-nodes graphs.
//!
//! [`GraphBuilder`] tracks the current effect and control tokens and threads
//! them through effectful operations, so callers construct graphs without
//! manually wiring effect chains. Diamonds are built by saving the tokens,
//! emitting each arm, and joining with [`GraphBuilder::merge2`] /
//! [`GraphBuilder::effect_phi2`].

use crate::graph::{
    ElementAccess, FieldAccess, Graph, MachineRep, NodeId, Operator,
};

/// Builder over a [`Graph`], auto-threading effect and control.
pub struct GraphBuilder {
    graph: Graph,
    effect: NodeId,
    control: NodeId,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// Create a builder with a fresh graph and its start node. The start
    /// node seeds both the effect and the control chain.
    pub fn new() -> Self {
        let mut graph = Graph::new();
        let start = graph.new_node(Operator::Start, &[]);
        graph.set_start(start);
        GraphBuilder {
            graph,
            effect: start,
            control: start,
        }
    }

    pub fn graph(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn start(&self) -> NodeId {
        self.graph.start()
    }

    /// Current effect token.
    pub fn effect(&self) -> NodeId {
        self.effect
    }

    /// Current control token.
    pub fn control(&self) -> NodeId {
        self.control
    }

    pub fn set_effect(&mut self, effect: NodeId) {
        self.effect = effect;
    }

    pub fn set_control(&mut self, control: NodeId) {
        self.control = control;
    }

    // ── Pure operations ─────────────────────────────────────────────

    pub fn number_constant(&mut self, value: i64) -> NodeId {
        self.graph
            .new_node(Operator::NumberConstant { value }, &[])
    }

    pub fn word32_constant(&mut self, value: i32) -> NodeId {
        self.graph
            .new_node(Operator::Word32Constant { value }, &[])
    }

    pub fn word64_constant(&mut self, value: i64) -> NodeId {
        self.graph
            .new_node(Operator::Word64Constant { value }, &[])
    }

    pub fn parameter(&mut self, index: u32) -> NodeId {
        self.graph.new_node(Operator::Parameter { index }, &[])
    }

    pub fn reference_equal(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.graph
            .new_node(Operator::ReferenceEqual, &[left, right])
    }

    pub fn object_is_smi(&mut self, value: NodeId) -> NodeId {
        self.graph.new_node(Operator::ObjectIsSmi, &[value])
    }

    pub fn select(&mut self, cond: NodeId, vtrue: NodeId, vfalse: NodeId) -> NodeId {
        self.graph
            .new_node(Operator::Select, &[cond, vtrue, vfalse])
    }

    pub fn state_values(&mut self, values: &[NodeId]) -> NodeId {
        self.graph.new_node(
            Operator::StateValues {
                value_count: values.len() as u32,
            },
            values,
        )
    }

    pub fn frame_state(&mut self, values: &[NodeId]) -> NodeId {
        self.graph.new_node(
            Operator::FrameState {
                value_count: values.len() as u32,
            },
            values,
        )
    }

    // ── Allocation and memory (effect-threaded) ─────────────────────

    pub fn begin_region(&mut self) -> NodeId {
        let node = self.graph.new_node(Operator::BeginRegion, &[self.effect]);
        self.effect = node;
        node
    }

    pub fn finish_region(&mut self, object: NodeId) -> NodeId {
        let node = self
            .graph
            .new_node(Operator::FinishRegion, &[object, self.effect]);
        self.effect = node;
        node
    }

    pub fn allocate(&mut self, size: NodeId) -> NodeId {
        let node = self
            .graph
            .new_node(Operator::Allocate, &[size, self.effect, self.control]);
        self.effect = node;
        node
    }

    pub fn store_field(&mut self, object: NodeId, offset: u32, value: NodeId) -> NodeId {
        let node = self.graph.new_node(
            Operator::StoreField(FieldAccess { offset }),
            &[object, value, self.effect, self.control],
        );
        self.effect = node;
        node
    }

    pub fn load_field(&mut self, object: NodeId, offset: u32) -> NodeId {
        let node = self.graph.new_node(
            Operator::LoadField(FieldAccess { offset }),
            &[object, self.effect, self.control],
        );
        self.effect = node;
        node
    }

    pub fn store_element(
        &mut self,
        object: NodeId,
        index: NodeId,
        value: NodeId,
        access: ElementAccess,
    ) -> NodeId {
        let node = self.graph.new_node(
            Operator::StoreElement(access),
            &[object, index, value, self.effect, self.control],
        );
        self.effect = node;
        node
    }

    pub fn load_element(&mut self, object: NodeId, index: NodeId, access: ElementAccess) -> NodeId {
        let node = self.graph.new_node(
            Operator::LoadElement(access),
            &[object, index, self.effect, self.control],
        );
        self.effect = node;
        node
    }

    pub fn call(&mut self, args: &[NodeId]) -> NodeId {
        let mut inputs = args.to_vec();
        inputs.push(self.effect);
        inputs.push(self.control);
        let node = self.graph.new_node(
            Operator::Call {
                value_count: args.len() as u32,
                frame_state_count: 0,
            },
            &inputs,
        );
        self.effect = node;
        node
    }

    /// A call carrying a deoptimization frame state.
    pub fn call_with_frame_state(&mut self, args: &[NodeId], frame_state: NodeId) -> NodeId {
        let mut inputs = args.to_vec();
        inputs.push(frame_state);
        inputs.push(self.effect);
        inputs.push(self.control);
        let node = self.graph.new_node(
            Operator::Call {
                value_count: args.len() as u32,
                frame_state_count: 1,
            },
            &inputs,
        );
        self.effect = node;
        node
    }

    // ── Control flow ────────────────────────────────────────────────

    /// Split control on `cond`. Returns the `(if_true, if_false)`
    /// projections; the caller picks one as the current control per arm.
    pub fn branch(&mut self, cond: NodeId) -> (NodeId, NodeId) {
        let branch = self
            .graph
            .new_node(Operator::Branch, &[cond, self.control]);
        let if_true = self.graph.new_node(Operator::IfTrue, &[branch]);
        let if_false = self.graph.new_node(Operator::IfFalse, &[branch]);
        (if_true, if_false)
    }

    /// Join two controls. Becomes the current control.
    pub fn merge2(&mut self, c0: NodeId, c1: NodeId) -> NodeId {
        let node = self
            .graph
            .new_node(Operator::Merge { control_count: 2 }, &[c0, c1]);
        self.control = node;
        node
    }

    /// Join two effects at `merge`. Becomes the current effect.
    pub fn effect_phi2(&mut self, e0: NodeId, e1: NodeId, merge: NodeId) -> NodeId {
        let node = self
            .graph
            .new_node(Operator::EffectPhi { effect_count: 2 }, &[e0, e1, merge]);
        self.effect = node;
        node
    }

    /// Join two values at `merge`.
    pub fn phi2(&mut self, v0: NodeId, v1: NodeId, merge: NodeId) -> NodeId {
        self.graph.new_node(
            Operator::Phi {
                rep: MachineRep::Tagged,
                value_count: 2,
            },
            &[v0, v1, merge],
        )
    }

    pub fn return_(&mut self, value: NodeId) -> NodeId {
        self.graph
            .new_node(Operator::Return, &[value, self.effect, self.control])
    }

    /// Seal the graph with an end node whose control input is `terminator`
    /// (typically a return) and hand the graph back.
    pub fn finish(mut self, terminator: NodeId) -> Graph {
        let end = self.graph.new_node(Operator::End, &[terminator]);
        self.graph.set_end(end);
        self.graph
    }
}
