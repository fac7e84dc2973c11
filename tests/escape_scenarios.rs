//! End-to-end escape analysis scenarios through the public API.

use sonir::builder::GraphBuilder;
use sonir::escape::EscapeAnalysis;
use sonir::graph::{ElementAccess, Graph, MachineRep, NodeId, Operator};
use sonir::graph_parse::parse_graph;

/// The node created `index`-th in `graph` (parse order for parsed graphs).
fn nth_node(graph: &Graph, index: usize) -> NodeId {
    graph.node_ids().nth(index).expect("node index in range")
}

/// Straight-line allocation with one field store and load: the allocation
/// stays virtual and the load folds to the stored constant.
#[test]
fn straight_line_allocation_is_virtual() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(8);
    b.begin_region();
    let alloc = b.allocate(size);
    let object = b.finish_region(alloc);
    let value = b.number_constant(42);
    b.store_field(object, 0, value);
    let load = b.load_field(object, 0);
    let ret = b.return_(load);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_virtual(alloc));
    assert!(!analysis.is_escaped(alloc));
    assert_eq!(analysis.get_replacement(load), Some(value));
    assert!(analysis.exists_virtual_allocate());
}

/// The allocation flows into an opaque call: it escapes, but the load
/// replacement recorded before the call still stands.
#[test]
fn allocation_escapes_into_call() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(8);
    b.begin_region();
    let alloc = b.allocate(size);
    let object = b.finish_region(alloc);
    let value = b.number_constant(42);
    b.store_field(object, 0, value);
    let load = b.load_field(object, 0);
    let call = b.call(&[object]);
    let ret = b.return_(call);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_escaped(alloc));
    assert!(!analysis.is_virtual(alloc));
    assert_eq!(analysis.get_replacement(load), Some(value));
    assert!(!analysis.exists_virtual_allocate());
}

/// A dynamically sized allocation is tracked but escapes immediately.
#[test]
fn dynamic_size_escapes() {
    let mut b = GraphBuilder::new();
    let size = b.parameter(0);
    b.begin_region();
    let alloc = b.allocate(size);
    let object = b.finish_region(alloc);
    let ret = b.return_(object);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_escaped(alloc));
    assert!(!analysis.is_virtual(alloc));
}

/// Each branch allocates and stores a different constant; the load after
/// the merge folds to a synthesized phi over the stored values, controlled
/// by the merge, and both allocations stay virtual.
#[test]
fn merge_synthesizes_phi_replacement() {
    let mut b = GraphBuilder::new();
    let start = b.start();
    let cond = b.parameter(0);
    let size = b.number_constant(8);
    let (if_true, if_false) = b.branch(cond);

    b.set_control(if_true);
    b.begin_region();
    let alloc0 = b.allocate(size);
    let object0 = b.finish_region(alloc0);
    let seven = b.number_constant(7);
    b.store_field(object0, 0, seven);
    let effect0 = b.effect();

    b.set_control(if_false);
    b.set_effect(start);
    b.begin_region();
    let alloc1 = b.allocate(size);
    let object1 = b.finish_region(alloc1);
    let eleven = b.number_constant(11);
    b.store_field(object1, 0, eleven);
    let effect1 = b.effect();

    let merge = b.merge2(if_true, if_false);
    b.effect_phi2(effect0, effect1, merge);
    let object_phi = b.phi2(object0, object1, merge);
    let load = b.load_field(object_phi, 0);
    let ret = b.return_(load);
    let mut graph = b.finish(ret);

    let nodes_before = graph.node_count();
    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_virtual(alloc0));
    assert!(analysis.is_virtual(alloc1));

    let rep = analysis
        .get_replacement(load)
        .expect("load over a phi of virtual objects folds");
    assert!(rep.index() >= nodes_before, "replacement is a new node");
    let graph = analysis.graph();
    match graph.node(rep).op {
        Operator::Phi { rep: mrep, value_count } => {
            assert_eq!(mrep, MachineRep::Tagged);
            assert_eq!(value_count, 2);
        }
        other => panic!("expected a synthesized phi, got {other:?}"),
    }
    assert_eq!(graph.value_input(rep, 0), seven);
    assert_eq!(graph.value_input(rep, 1), eleven);
    assert_eq!(graph.control_input(rep), merge);
}

/// A store at a non-constant index escapes the object and clobbers its
/// snapshot: later loads get no replacement.
#[test]
fn dynamic_index_store_escapes_and_clears() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(16);
    let access = ElementAccess {
        header_size: 0,
        rep: MachineRep::Tagged,
    };
    b.begin_region();
    let alloc = b.allocate(size);
    let object = b.finish_region(alloc);
    let value = b.number_constant(42);
    let zero = b.number_constant(0);
    b.store_element(object, zero, value, access);
    let index = b.parameter(0);
    b.store_element(object, index, value, access);
    let load = b.load_element(object, zero, access);
    let ret = b.return_(load);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_escaped(alloc));
    assert_eq!(analysis.get_replacement(load), None);
}

/// A virtual allocation flowing into a select escapes.
#[test]
fn select_use_escapes() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(8);
    let cond = b.parameter(0);
    let other = b.parameter(1);
    b.begin_region();
    let alloc = b.allocate(size);
    let object = b.finish_region(alloc);
    let select = b.select(cond, object, other);
    let ret = b.return_(select);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_escaped(alloc));
}

/// An allocation only observed by a reference equality and a smi check
/// stays virtual: both operators fold against virtual objects. The
/// observers are kept live through a deoptimization frame state.
#[test]
fn foldable_observers_do_not_escape() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(8);
    b.begin_region();
    let alloc = b.allocate(size);
    let object = b.finish_region(alloc);
    let eq = b.reference_equal(object, object);
    let smi = b.object_is_smi(object);
    let values = b.state_values(&[eq, smi]);
    let frame_state = b.frame_state(&[values]);
    let call = b.call_with_frame_state(&[], frame_state);
    let ret = b.return_(call);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_virtual(alloc));
}

/// Materializing an object state captures the current field snapshot and
/// is cached per object.
#[test]
fn object_state_materialization() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(16);
    b.begin_region();
    let alloc = b.allocate(size);
    let object = b.finish_region(alloc);
    let seven = b.number_constant(7);
    let eleven = b.number_constant(11);
    b.store_field(object, 0, seven);
    let store = b.store_field(object, 8, eleven);
    let load = b.load_field(object, 0);
    let ret = b.return_(load);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();
    assert!(analysis.is_virtual(alloc));

    let object_state = analysis
        .get_or_create_object_state(store, object)
        .expect("virtual object materializes");
    let again = analysis.get_or_create_object_state(store, object);
    assert_eq!(again, Some(object_state));

    let graph = analysis.graph();
    match graph.node(object_state).op {
        Operator::ObjectState { value_count, object } => {
            assert_eq!(value_count, 2);
            assert_eq!(object, alloc);
        }
        other => panic!("expected ObjectState, got {other:?}"),
    }
    assert_eq!(graph.value_input(object_state, 0), seven);
    assert_eq!(graph.value_input(object_state, 1), eleven);
}

/// A nested virtual object stored in a field shows up in the outer object
/// state as its own recursively materialized object state.
#[test]
fn object_state_materializes_nested_objects() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(8);

    b.begin_region();
    let inner_alloc = b.allocate(size);
    let inner = b.finish_region(inner_alloc);

    b.begin_region();
    let outer_alloc = b.allocate(size);
    let outer = b.finish_region(outer_alloc);

    let store = b.store_field(outer, 0, inner);
    let zero = b.number_constant(0);
    let ret = b.return_(zero);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();
    assert!(analysis.is_virtual(inner_alloc));
    assert!(analysis.is_virtual(outer_alloc));

    let outer_state = analysis
        .get_or_create_object_state(store, outer)
        .expect("outer object materializes");
    let graph = analysis.graph();
    let field = graph.value_input(outer_state, 0);
    match graph.node(field).op {
        Operator::ObjectState { object, .. } => assert_eq!(object, inner_alloc),
        other => panic!("expected nested ObjectState, got {other:?}"),
    }
}

/// Replacement resolution is a fixed point and results are stable across
/// a second run.
#[test]
fn replacements_resolve_to_fixed_point() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(16);
    b.begin_region();
    let alloc = b.allocate(size);
    let object = b.finish_region(alloc);
    let value = b.number_constant(42);
    b.store_field(object, 0, value);
    // The second field holds the first load; loading it chains
    // replacements: load2 -> load1 -> 42.
    let load1 = b.load_field(object, 0);
    b.store_field(object, 8, load1);
    let load2 = b.load_field(object, 8);
    let ret = b.return_(load2);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert_eq!(analysis.get_replacement(load1), Some(value));
    assert_eq!(analysis.get_replacement(load2), Some(value));
    assert_eq!(
        analysis.resolve_replacement(analysis.resolve_replacement(load2)),
        analysis.resolve_replacement(load2)
    );

    let virtual_before = analysis.is_virtual(alloc);
    analysis.run();
    assert_eq!(analysis.is_virtual(alloc), virtual_before);
    assert_eq!(analysis.get_replacement(load2), Some(value));
}

/// Object comparison resolves replacements and distinguishes distinct
/// allocations from identical ones.
#[test]
fn compare_virtual_objects_distinguishes_allocations() {
    let mut b = GraphBuilder::new();
    let size = b.number_constant(8);
    b.begin_region();
    let alloc0 = b.allocate(size);
    let object0 = b.finish_region(alloc0);
    b.begin_region();
    let alloc1 = b.allocate(size);
    let object1 = b.finish_region(alloc1);
    b.store_field(object0, 0, object1);
    let ret = b.return_(size);
    let mut graph = b.finish(ret);

    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_virtual(alloc0));
    assert!(analysis.is_virtual(alloc1));
    assert!(analysis.compare_virtual_objects(alloc0, alloc0));
    assert!(!analysis.compare_virtual_objects(alloc0, alloc1));
}

/// The same analysis drives graphs that came in through the textual format.
#[test]
fn parsed_graph_analyzes_like_built_graph() {
    let input = r#"
graph {
  n0 = Start
  n1 = NumberConstant(8)
  n2 = BeginRegion fx=[n0]
  n3 = Allocate [n1] fx=[n2] ctl=[n0]
  n4 = FinishRegion [n3] fx=[n3]
  n5 = NumberConstant(42)
  n6 = StoreField(offset=0) [n4, n5] fx=[n4] ctl=[n0]
  n7 = LoadField(offset=0) [n4] fx=[n6] ctl=[n0]
  n8 = Return [n7] fx=[n7] ctl=[n0]
  n9 = End ctl=[n8]
}
"#;
    let mut graph: Graph = parse_graph(input).unwrap();
    let alloc = nth_node(&graph, 3);
    let load = nth_node(&graph, 7);
    let value = nth_node(&graph, 5);
    let mut analysis = EscapeAnalysis::new(&mut graph);
    analysis.run();

    assert!(analysis.is_virtual(alloc));
    assert_eq!(analysis.get_replacement(load), Some(value));
}
