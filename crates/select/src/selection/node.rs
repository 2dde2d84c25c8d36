//! Selection tree nodes.
//!
//! A compiled selection is a tree of tagged nodes held in a [`NodeArena`] and
//! linked first-child/next-sibling. Each node couples a kind-specific payload
//! with a typed value, per-frame flags, and a dispatch slot naming the
//! evaluator that runs it. Subexpression references share their target by id:
//! the `child` of a [`NodeKind::SubExprRef`] node *is* the shared subexpression
//! node.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::selection::group::IndexGroup;
use crate::selection::method::{PosCalc, SelMethod};
use crate::selection::value::{PosSet, SelValue, ValueKind};

/// Identifier of a node within a [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-frame and static node flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// The value is a single scalar, not one element per atom.
    pub single_val: bool,
    /// The value must be re-evaluated for every evaluation group.
    pub atom_val: bool,
    /// The method needs its first-touch callback this frame.
    pub init_frame: bool,
    /// The parameter node has already been evaluated this frame.
    pub eval_frame: bool,
}

/// Boolean operator payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    Not,
    And,
    Or,
}

/// Arithmetic operator payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Plus,
    Minus,
    Neg,
    Mult,
    Div,
    Exp,
}

/// Outbound parameter slot; a subexpression reference mirrors its produced
/// element count here so the owning method sees it.
#[derive(Debug, Clone, Default)]
pub struct ParamSlot(Rc<Cell<usize>>);

impl ParamSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, nr: usize) {
        self.0.set(nr);
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

/// Payload of method and modifier nodes.
pub struct ExprPayload {
    pub method: Box<dyn SelMethod>,
    /// Reference-position calculator, if the method takes positions.
    pub pc: Option<Box<dyn PosCalc>>,
    /// Scratch positions filled by `pc` before each update.
    pub pos: PosSet,
}

impl ExprPayload {
    pub fn new(method: Box<dyn SelMethod>) -> Self {
        Self {
            method,
            pc: None,
            pos: PosSet::default(),
        }
    }

    pub fn with_poscalc(mut self, pc: Box<dyn PosCalc>) -> Self {
        self.pc = Some(pc);
        self
    }
}

impl fmt::Debug for ExprPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExprPayload")
            .field("method", &self.method.name())
            .field("pc", &self.pc.is_some())
            .finish()
    }
}

/// Kind tag plus per-kind payload.
#[derive(Debug)]
pub enum NodeKind {
    /// Root of one compiled tree. `cgrp` is the group the tree is evaluated
    /// over: `None` means the whole universe, an empty group means there is
    /// nothing to evaluate this frame.
    Root { cgrp: Option<IndexGroup> },
    /// Constant group known at compile time.
    Const { group: IndexGroup },
    /// Method expression.
    Expression(ExprPayload),
    /// Shared subexpression; `cgrp` caches the union of groups the child has
    /// been evaluated over this frame.
    SubExpr { cgrp: IndexGroup },
    /// Reference to a shared subexpression (the node's `child`).
    SubExprRef { param: Option<ParamSlot> },
    Boolean(BoolOp),
    Arithmetic(ArithOp),
    /// Modifier expression consuming positions from its child.
    Modifier(ExprPayload),
}

impl NodeKind {
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Root { .. } => "root",
            NodeKind::Const { .. } => "const",
            NodeKind::Expression(_) => "expression",
            NodeKind::SubExpr { .. } => "subexpr",
            NodeKind::SubExprRef { .. } => "subexprref",
            NodeKind::Boolean(_) => "boolean",
            NodeKind::Arithmetic(_) => "arithmetic",
            NodeKind::Modifier(_) => "modifier",
        }
    }
}

/// Dispatch slot: which evaluator runs a node.
///
/// The slot is data, not behavior, so a tree can be inspected and printed;
/// the evaluator matches on it per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalFn {
    Root,
    Static,
    SubExprSimple,
    SubExprStaticEval,
    SubExpr,
    SubExprRefSimple,
    SubExprRef,
    Method,
    Modifier,
    Not,
    And,
    Or,
    Arithmetic,
}

impl EvalFn {
    /// Short name used when printing compiled trees.
    pub fn name(self) -> &'static str {
        match self {
            EvalFn::Root => "root",
            EvalFn::Static => "static",
            EvalFn::SubExprSimple => "subexpr_simple",
            EvalFn::SubExprStaticEval => "subexpr_staticeval",
            EvalFn::SubExpr => "subexpr",
            EvalFn::SubExprRefSimple => "ref_simple",
            EvalFn::SubExprRef => "ref",
            EvalFn::Method => "method",
            EvalFn::Modifier => "mod",
            EvalFn::Not => "not",
            EvalFn::And => "and",
            EvalFn::Or => "or",
            EvalFn::Arithmetic => "arithmetic",
        }
    }

    /// Reverse of [`name`]; used by debugging aids.
    ///
    /// [`name`]: EvalFn::name
    pub fn from_name(name: &str) -> Option<EvalFn> {
        Some(match name {
            "root" => EvalFn::Root,
            "static" => EvalFn::Static,
            "subexpr_simple" => EvalFn::SubExprSimple,
            "subexpr_staticeval" => EvalFn::SubExprStaticEval,
            "subexpr" => EvalFn::SubExpr,
            "ref_simple" => EvalFn::SubExprRefSimple,
            "ref" => EvalFn::SubExprRef,
            "method" => EvalFn::Method,
            "mod" => EvalFn::Modifier,
            "not" => EvalFn::Not,
            "and" => EvalFn::And,
            "or" => EvalFn::Or,
            "arithmetic" => EvalFn::Arithmetic,
            _ => return None,
        })
    }
}

/// Name of an optional dispatch slot.
pub fn evalfunc_name(func: Option<EvalFn>) -> &'static str {
    func.map_or("none", EvalFn::name)
}

/// One node of a compiled selection tree.
pub struct SelNode {
    pub kind: NodeKind,
    pub value: SelValue,
    pub flags: NodeFlags,
    /// First child, or for a subexpression reference the shared target.
    pub child: Option<NodeId>,
    /// Next sibling.
    pub next: Option<NodeId>,
    /// Evaluator dispatch slot; `None` for nodes whose value is already
    /// final (compile-time constants).
    pub eval: Option<EvalFn>,
    /// Scratch value storage is reserved from the evaluation pool rather
    /// than owned by the node.
    pub mempool: bool,
    /// An evaluation pool reservation is currently live on this node.
    pub(crate) reserved: bool,
}

impl SelNode {
    pub fn new(kind: NodeKind, value_kind: ValueKind) -> Self {
        Self {
            kind,
            value: SelValue::new(value_kind),
            flags: NodeFlags::default(),
            child: None,
            next: None,
            eval: None,
            mempool: false,
            reserved: false,
        }
    }

    pub fn with_eval(mut self, func: EvalFn) -> Self {
        self.eval = Some(func);
        self
    }

    pub fn with_flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_mempool(mut self) -> Self {
        self.mempool = true;
        self
    }
}

impl fmt::Debug for SelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelNode")
            .field("kind", &self.kind.tag())
            .field("value", &self.value.kind().name())
            .field("eval", &evalfunc_name(self.eval))
            .field("child", &self.child)
            .field("next", &self.next)
            .finish()
    }
}

/// Flat storage for the nodes of a selection collection.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<SelNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: SelNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mutable access to two distinct nodes at once.
    pub(crate) fn get_two_mut(&mut self, a: NodeId, b: NodeId) -> (&mut SelNode, &mut SelNode) {
        let [na, nb] = self
            .nodes
            .get_disjoint_mut([a.0, b.0])
            .expect("aliased node access");
        (na, nb)
    }

    /// Mutable access to three distinct nodes at once.
    pub(crate) fn get_three_mut(
        &mut self,
        a: NodeId,
        b: NodeId,
        c: NodeId,
    ) -> (&mut SelNode, &mut SelNode, &mut SelNode) {
        let [na, nb, nc] = self
            .nodes
            .get_disjoint_mut([a.0, b.0, c.0])
            .expect("aliased node access");
        (na, nb, nc)
    }
}

impl std::ops::Index<NodeId> for NodeArena {
    type Output = SelNode;

    fn index(&self, id: NodeId) -> &SelNode {
        &self.nodes[id.0]
    }
}

impl std::ops::IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut SelNode {
        &mut self.nodes[id.0]
    }
}
