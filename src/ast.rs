pub mod dump;
pub mod fold;
pub mod serial;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::sym::SymId;
use crate::types::Prim;

/// AST operations. The `Assign..=Mod` block lines up one-for-one with
/// the binary-operator tokens so the parser can map between them by
/// discriminant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, IntoPrimitive, Serialize,
)]
#[repr(u8)]
pub enum Op {
    Assign = 1,
    AsPlus,
    AsMinus,
    AsStar,
    AsSlash,
    AsMod,
    Ternary,
    LogOr,
    LogAnd,
    Or,
    Xor,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LShift,
    RShift,
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    IntLit,
    StrLit,
    Ident,
    Glue,
    If,
    While,
    Function,
    Widen,
    Return,
    FuncCall,
    Deref,
    Addr,
    Scale,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Negate,
    Invert,
    LogNot,
    ToBool,
    Break,
    Continue,
    Switch,
    Case,
    Default,
    Cast,
}

impl Op {
    /// True for the six comparison operations.
    pub fn is_comparison(self) -> bool {
        matches!(self, Op::Eq | Op::Ne | Op::Lt | Op::Gt | Op::Le | Op::Ge)
    }
}

/// Identifier of an AST node; ids start at 1 and are the keys of the
/// AST file and its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(pub u32);

/// One AST node. The parser builds trees with owned children and the
/// matching child ids filled in; the loader reproduces nodes with the
/// ids only, and children are fetched lazily by id as the generator
/// descends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub op: Op,
    pub prim: Prim,
    pub ctype: Option<SymId>,
    pub rvalue: bool,
    pub id: NodeId,
    pub left: Option<Box<Node>>,
    pub mid: Option<Box<Node>>,
    pub right: Option<Box<Node>>,
    pub left_id: Option<NodeId>,
    pub mid_id: Option<NodeId>,
    pub right_id: Option<NodeId>,
    pub sym: Option<SymId>,
    pub name: Option<String>,
    /// Literal value, case value, scale factor or expression count,
    /// depending on the operation.
    pub value: i64,
    pub line: i32,
}

impl Node {
    pub fn left_ref(&self) -> Option<&Node> {
        self.left.as_deref()
    }

    pub fn right_ref(&self) -> Option<&Node> {
        self.right.as_deref()
    }
}

/// Builds AST nodes, handing out the globally unique ids used as
/// serialisation keys.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    next_id: u32,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self { next_id: 0 }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn node(
        &mut self,
        op: Op,
        prim: Prim,
        ctype: Option<SymId>,
        left: Option<Node>,
        mid: Option<Node>,
        right: Option<Node>,
        sym: Option<(SymId, &str)>,
        value: i64,
        line: i32,
    ) -> Node {
        self.next_id += 1;
        Node {
            op,
            prim,
            ctype,
            rvalue: false,
            id: NodeId(self.next_id),
            left_id: left.as_ref().map(|n| n.id),
            mid_id: mid.as_ref().map(|n| n.id),
            right_id: right.as_ref().map(|n| n.id),
            left: left.map(Box::new),
            mid: mid.map(Box::new),
            right: right.map(Box::new),
            sym: sym.map(|(id, _)| id),
            name: sym.map(|(_, name)| name.to_owned()),
            value,
            line,
        }
    }

    pub fn leaf(
        &mut self,
        op: Op,
        prim: Prim,
        ctype: Option<SymId>,
        sym: Option<(SymId, &str)>,
        value: i64,
        line: i32,
    ) -> Node {
        self.node(op, prim, ctype, None, None, None, sym, value, line)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn unary(
        &mut self,
        op: Op,
        prim: Prim,
        ctype: Option<SymId>,
        left: Node,
        sym: Option<(SymId, &str)>,
        value: i64,
        line: i32,
    ) -> Node {
        self.node(op, prim, ctype, Some(left), None, None, sym, value, line)
    }
}
