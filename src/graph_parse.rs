//! Textual parser for sea-of-nodes graphs.
//!
//! Parses the format produced by [`Graph`]'s `Display` impl back into a
//! [`Graph`]. Two passes: parse text → AST, then resolve node references →
//! graph. Operands must be defined before use; exactly one `Start` and one
//! `End` node are required.

use chumsky::prelude::*;
use rustc_hash::FxHashMap;

use crate::graph::{ElementAccess, FieldAccess, Graph, MachineRep, NodeId, Operator};

// ─── AST types (first pass) ─────────────────────────────────────────────────

/// A parsed operator, with node references still unresolved.
#[derive(Debug, Clone)]
enum AstOp {
    Start,
    End,
    Merge,
    Branch,
    IfTrue,
    IfFalse,
    Phi(MachineRep),
    EffectPhi,
    BeginRegion,
    FinishRegion,
    Allocate,
    StoreField(u32),
    LoadField(u32),
    StoreElement(u32, MachineRep),
    LoadElement(u32, MachineRep),
    FrameState,
    StateValues,
    ReferenceEqual,
    ObjectIsSmi,
    Select,
    ObjectState(u32),
    NumberConstant(i64),
    Word32Constant(i32),
    Word64Constant(i64),
    Parameter(u32),
    Call,
    Return,
}

/// A parsed node definition.
#[derive(Debug, Clone)]
struct AstNode {
    id: u32,
    op: AstOp,
    values: Vec<u32>,
    frame_states: Vec<u32>,
    effects: Vec<u32>,
    controls: Vec<u32>,
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "graph parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .ignored()
}

/// Parse a u32 decimal number.
fn uint32<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u32>().unwrap())
}

/// Parse an i64 decimal number with optional sign.
fn int64<'src>() -> impl Parser<'src, &'src str, i64, Extra<'src>> + Clone {
    just("-")
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .map(|(neg, s): (Option<&str>, &str)| {
            let value = s.parse::<i64>().unwrap();
            if neg.is_some() { -value } else { value }
        })
}

/// Parse a node reference: `n42`.
fn node_ref<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    just("n").ignore_then(uint32())
}

/// Parse a machine representation name.
fn machine_rep<'src>() -> impl Parser<'src, &'src str, MachineRep, Extra<'src>> + Clone {
    choice((
        just("Tagged").to(MachineRep::Tagged),
        just("Word8").to(MachineRep::Word8),
        just("Word16").to(MachineRep::Word16),
        just("Word32").to(MachineRep::Word32),
        just("Word64").to(MachineRep::Word64),
        just("Float64").to(MachineRep::Float64),
    ))
}

/// Parse a comma-separated list inside brackets.
fn bracketed_list<'src, T: 'src>(
    inner: impl Parser<'src, &'src str, T, Extra<'src>> + Clone,
) -> impl Parser<'src, &'src str, Vec<T>, Extra<'src>> + Clone {
    inner
        .separated_by(just(",").padded_by(ws()))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just("[").then(ws()), ws().then(just("]")))
}

/// Parse an operator name with its parameters.
fn op<'src>() -> impl Parser<'src, &'src str, AstOp, Extra<'src>> + Clone {
    let control_ops = choice((
        just("Start").to(AstOp::Start),
        just("EffectPhi").to(AstOp::EffectPhi),
        just("End").to(AstOp::End),
        just("Merge").to(AstOp::Merge),
        just("Branch").to(AstOp::Branch),
        just("IfTrue").to(AstOp::IfTrue),
        just("IfFalse").to(AstOp::IfFalse),
        just("Phi(")
            .ignore_then(machine_rep())
            .then_ignore(just(")"))
            .map(AstOp::Phi),
        just("Return").to(AstOp::Return),
    ));

    let memory_ops = choice((
        just("BeginRegion").to(AstOp::BeginRegion),
        just("FinishRegion").to(AstOp::FinishRegion),
        just("Allocate").to(AstOp::Allocate),
        just("StoreField(offset=")
            .ignore_then(uint32())
            .then_ignore(just(")"))
            .map(AstOp::StoreField),
        just("LoadField(offset=")
            .ignore_then(uint32())
            .then_ignore(just(")"))
            .map(AstOp::LoadField),
        just("StoreElement(header=")
            .ignore_then(uint32())
            .then_ignore(just(",").then(ws()).then(just("rep=")))
            .then(machine_rep())
            .then_ignore(just(")"))
            .map(|(header, rep)| AstOp::StoreElement(header, rep)),
        just("LoadElement(header=")
            .ignore_then(uint32())
            .then_ignore(just(",").then(ws()).then(just("rep=")))
            .then(machine_rep())
            .then_ignore(just(")"))
            .map(|(header, rep)| AstOp::LoadElement(header, rep)),
    ));

    let deopt_ops = choice((
        just("FrameState").to(AstOp::FrameState),
        just("StateValues").to(AstOp::StateValues),
        just("ObjectState(object=")
            .ignore_then(node_ref())
            .then_ignore(just(")"))
            .map(AstOp::ObjectState),
    ));

    let value_ops = choice((
        just("ReferenceEqual").to(AstOp::ReferenceEqual),
        just("ObjectIsSmi").to(AstOp::ObjectIsSmi),
        just("Select").to(AstOp::Select),
        just("NumberConstant(")
            .ignore_then(int64())
            .then_ignore(just(")"))
            .map(AstOp::NumberConstant),
        just("Word32Constant(")
            .ignore_then(int64())
            .then_ignore(just(")"))
            .map(|value| AstOp::Word32Constant(value as i32)),
        just("Word64Constant(")
            .ignore_then(int64())
            .then_ignore(just(")"))
            .map(AstOp::Word64Constant),
        just("Parameter(")
            .ignore_then(uint32())
            .then_ignore(just(")"))
            .map(AstOp::Parameter),
        just("Call").to(AstOp::Call),
    ));

    choice((memory_ops, deopt_ops, value_ops, control_ops))
}

/// Parse one node definition:
/// `n3 = LoadField(offset=0) [n2] fs=[..] fx=[n2] ctl=[n0]`.
fn node<'src>() -> impl Parser<'src, &'src str, AstNode, Extra<'src>> + Clone {
    let tagged_list = |tag: &'static str| {
        just(tag)
            .ignore_then(bracketed_list(node_ref()))
            .or_not()
            .map(Option::unwrap_or_default)
    };

    node_ref()
        .then_ignore(ws().then(just("=")).then(ws()))
        .then(op())
        .then(ws().ignore_then(bracketed_list(node_ref())).or_not())
        .then(ws().ignore_then(tagged_list("fs=")))
        .then(ws().ignore_then(tagged_list("fx=")))
        .then(ws().ignore_then(tagged_list("ctl=")))
        .map(
            |(((((id, op), values), frame_states), effects), controls)| AstNode {
                id,
                op,
                values: values.unwrap_or_default(),
                frame_states,
                effects,
                controls,
            },
        )
}

fn program<'src>() -> impl Parser<'src, &'src str, Vec<AstNode>, Extra<'src>> {
    just("graph")
        .then(ws())
        .then(just("{"))
        .ignore_then(node().padded_by(ws()).repeated().collect::<Vec<_>>())
        .then_ignore(just("}").then(ws()))
        .padded_by(ws())
}

// ─── Resolution (second pass) ───────────────────────────────────────────────

pub fn parse_graph(input: &str) -> Result<Graph, ParseError> {
    let ast = program().parse(input).into_result().map_err(|errs| {
        let messages: Vec<String> = errs.into_iter().map(|e| format!("{e}")).collect();
        ParseError {
            message: messages.join("\n"),
        }
    })?;
    resolve(ast)
}

fn resolve(nodes: Vec<AstNode>) -> Result<Graph, ParseError> {
    let mut graph = Graph::new();
    let mut by_name: FxHashMap<u32, NodeId> = FxHashMap::default();
    let mut start = None;
    let mut end = None;

    for ast in &nodes {
        if by_name.contains_key(&ast.id) {
            return Err(ParseError {
                message: format!("node n{} is defined twice", ast.id),
            });
        }
        let mut inputs = Vec::new();
        for list in [&ast.values, &ast.frame_states, &ast.effects, &ast.controls] {
            for &name in list {
                let id = *by_name.get(&name).ok_or_else(|| ParseError {
                    message: format!("operand n{name} of n{} is not defined yet", ast.id),
                })?;
                inputs.push(id);
            }
        }
        let op = resolve_op(ast, &by_name)?;
        let node = graph.new_node(op, &inputs);
        by_name.insert(ast.id, node);
        match ast.op {
            AstOp::Start => {
                if start.replace(node).is_some() {
                    return Err(ParseError {
                        message: "graph has more than one start node".into(),
                    });
                }
            }
            AstOp::End => {
                if end.replace(node).is_some() {
                    return Err(ParseError {
                        message: "graph has more than one end node".into(),
                    });
                }
            }
            _ => {}
        }
    }

    let start = start.ok_or_else(|| ParseError {
        message: "graph has no start node".into(),
    })?;
    let end = end.ok_or_else(|| ParseError {
        message: "graph has no end node".into(),
    })?;
    graph.set_start(start);
    graph.set_end(end);
    Ok(graph)
}

fn resolve_op(ast: &AstNode, by_name: &FxHashMap<u32, NodeId>) -> Result<Operator, ParseError> {
    Ok(match ast.op {
        AstOp::Start => Operator::Start,
        AstOp::End => Operator::End,
        AstOp::Merge => Operator::Merge {
            control_count: ast.controls.len() as u32,
        },
        AstOp::Branch => Operator::Branch,
        AstOp::IfTrue => Operator::IfTrue,
        AstOp::IfFalse => Operator::IfFalse,
        AstOp::Phi(rep) => Operator::Phi {
            rep,
            value_count: ast.values.len() as u32,
        },
        AstOp::EffectPhi => Operator::EffectPhi {
            effect_count: ast.effects.len() as u32,
        },
        AstOp::BeginRegion => Operator::BeginRegion,
        AstOp::FinishRegion => Operator::FinishRegion,
        AstOp::Allocate => Operator::Allocate,
        AstOp::StoreField(offset) => Operator::StoreField(FieldAccess { offset }),
        AstOp::LoadField(offset) => Operator::LoadField(FieldAccess { offset }),
        AstOp::StoreElement(header_size, rep) => {
            Operator::StoreElement(ElementAccess { header_size, rep })
        }
        AstOp::LoadElement(header_size, rep) => {
            Operator::LoadElement(ElementAccess { header_size, rep })
        }
        AstOp::FrameState => Operator::FrameState {
            value_count: ast.values.len() as u32,
        },
        AstOp::StateValues => Operator::StateValues {
            value_count: ast.values.len() as u32,
        },
        AstOp::ReferenceEqual => Operator::ReferenceEqual,
        AstOp::ObjectIsSmi => Operator::ObjectIsSmi,
        AstOp::Select => Operator::Select,
        AstOp::ObjectState(object) => Operator::ObjectState {
            value_count: ast.values.len() as u32,
            object: *by_name.get(&object).ok_or_else(|| ParseError {
                message: format!("object n{object} of n{} is not defined yet", ast.id),
            })?,
        },
        AstOp::NumberConstant(value) => Operator::NumberConstant { value },
        AstOp::Word32Constant(value) => Operator::Word32Constant { value },
        AstOp::Word64Constant(value) => Operator::Word64Constant { value },
        AstOp::Parameter(index) => Operator::Parameter { index },
        AstOp::Call => Operator::Call {
            value_count: ast.values.len() as u32,
            frame_state_count: ast.frame_states.len() as u32,
        },
        AstOp::Return => Operator::Return,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_allocation_with_store_and_load() {
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
        let graph = parse_graph(input).unwrap();
        assert_eq!(graph.node_count(), 10);

        let alloc = NodeId::new(3);
        assert!(matches!(graph.node(alloc).op, Operator::Allocate));
        assert_eq!(graph.value_input(alloc, 0), NodeId::new(1));
        assert_eq!(graph.effect_input(alloc, 0), NodeId::new(2));

        let load = NodeId::new(7);
        match graph.node(load).op {
            Operator::LoadField(access) => assert_eq!(access.offset, 0),
            other => panic!("expected LoadField, got {other:?}"),
        }
        assert_eq!(graph.end(), NodeId::new(9));
    }

    #[test]
    fn parse_diamond_with_phis() {
        let input = r#"
graph {
  n0 = Start
  n1 = Parameter(0)
  n2 = Branch [n1] ctl=[n0]
  n3 = IfTrue ctl=[n2]
  n4 = IfFalse ctl=[n2]
  n5 = NumberConstant(7)
  n6 = NumberConstant(11)
  n7 = Merge ctl=[n3, n4]
  n8 = EffectPhi fx=[n0, n0] ctl=[n7]
  n9 = Phi(Tagged) [n5, n6] ctl=[n7]
  n10 = Return [n9] fx=[n8] ctl=[n7]
  n11 = End ctl=[n10]
}
"#;
        let graph = parse_graph(input).unwrap();
        match graph.node(NodeId::new(9)).op {
            Operator::Phi { rep, value_count } => {
                assert_eq!(rep, MachineRep::Tagged);
                assert_eq!(value_count, 2);
            }
            other => panic!("expected Phi, got {other:?}"),
        }
        match graph.node(NodeId::new(8)).op {
            Operator::EffectPhi { effect_count } => assert_eq!(effect_count, 2),
            other => panic!("expected EffectPhi, got {other:?}"),
        }
        match graph.node(NodeId::new(7)).op {
            Operator::Merge { control_count } => assert_eq!(control_count, 2),
            other => panic!("expected Merge, got {other:?}"),
        }
    }

    #[test]
    fn display_round_trips() {
        let input = r#"
graph {
  n0 = Start
  n1 = NumberConstant(16)
  n2 = BeginRegion fx=[n0]
  n3 = Allocate [n1] fx=[n2] ctl=[n0]
  n4 = FinishRegion [n3] fx=[n3]
  n5 = Return [n4] fx=[n4] ctl=[n0]
  n6 = End ctl=[n5]
}
"#;
        let graph = parse_graph(input).unwrap();
        let printed = graph.to_string();
        let reparsed = parse_graph(&printed).unwrap();
        assert_eq!(printed, reparsed.to_string());
    }

    #[test]
    fn forward_reference_is_an_error() {
        let input = r#"
graph {
  n0 = Start
  n1 = Return [n2] fx=[n0] ctl=[n0]
  n2 = NumberConstant(1)
  n3 = End ctl=[n1]
}
"#;
        let err = parse_graph(input).unwrap_err();
        assert!(err.message.contains("not defined yet"), "{}", err.message);
    }

    #[test]
    fn missing_end_is_an_error() {
        let err = parse_graph("graph {\n  n0 = Start\n}\n").unwrap_err();
        assert!(err.message.contains("no end node"), "{}", err.message);
    }
}
