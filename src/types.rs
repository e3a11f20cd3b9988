use anyhow::{bail, Result};
use serde::Serialize;

use crate::ast::{Node, Op, TreeBuilder};
use crate::sym::Sym;
use crate::target::Target;

/// A primitive type. The low 4 bits are the indirection count (0 = not
/// a pointer, 1 = pointer, and so on, at most 15); the remaining bits
/// select the base type. `NONE` doubles as the separator marker in the
/// symbol file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Prim(u16);

impl Prim {
    pub const NONE: Prim = Prim(0);
    pub const VOID: Prim = Prim(16);
    pub const CHAR: Prim = Prim(32);
    pub const INT: Prim = Prim(48);
    pub const LONG: Prim = Prim(64);
    pub const STRUCT: Prim = Prim(80);
    pub const UNION: Prim = Prim(96);

    const INDIR_MASK: u16 = 0xf;
    const MAX_INDIR: u16 = 15;

    pub fn from_raw(value: u16) -> Result<Prim> {
        let base = value & !Self::INDIR_MASK;
        if base > Self::UNION.0 {
            bail!("Invalid primitive type value {value}");
        }
        Ok(Prim(value))
    }

    pub fn into_raw(self) -> u16 {
        self.0
    }

    /// The base type with the indirection stripped.
    pub fn base(self) -> Prim {
        Prim(self.0 & !Self::INDIR_MASK)
    }

    pub fn indirection(self) -> u16 {
        self.0 & Self::INDIR_MASK
    }

    /// The type of a pointer to this type.
    pub fn pointer_to(self) -> Result<Prim> {
        if self.indirection() == Self::MAX_INDIR {
            bail!("Too many levels of indirection");
        }
        Ok(Prim(self.0 + 1))
    }

    /// The type this pointer type points at.
    pub fn value_at(self) -> Result<Prim> {
        if self.indirection() == 0 {
            bail!("Cannot dereference a non-pointer type");
        }
        Ok(Prim(self.0 - 1))
    }

    pub fn is_ptr(self) -> bool {
        self.indirection() > 0
    }

    /// True for the char, int and long scalar types.
    pub fn is_int(self) -> bool {
        !self.is_ptr() && matches!(self.base(), Prim::CHAR | Prim::INT | Prim::LONG)
    }

    pub fn is_composite(self) -> bool {
        !self.is_ptr() && matches!(self.base(), Prim::STRUCT | Prim::UNION)
    }
}

impl std::fmt::Display for Prim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.base() {
            Prim::NONE => "none",
            Prim::VOID => "void",
            Prim::CHAR => "char",
            Prim::INT => "int",
            Prim::LONG => "long",
            Prim::STRUCT => "struct",
            Prim::UNION => "union",
            _ => "?",
        };
        write!(f, "{}", name)?;
        for _ in 0..self.indirection() {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// Total size in bytes of one value of the given type: scalar and
/// pointer sizes come from the target manifest, composite sizes from
/// the composite type's symbol.
pub fn type_size(prim: Prim, ctype: Option<&Sym>, target: Target) -> Result<i64> {
    if prim.is_composite() {
        let Some(ctype) = ctype else {
            bail!("Composite type {prim} with no type symbol");
        };
        return Ok(ctype.size);
    }
    target.prim_size(prim)
}

/// Given an expression subtree, a wanted type and the operation that
/// will consume the result, return the tree possibly wrapped in a
/// conversion. The second element of the pair is false when the types
/// are incompatible, in which case the tree comes back untouched for
/// the caller to diagnose or retry the other way around:
///
/// - both integer types: equal sizes pass through, a narrower tree is
///   wrapped in `Widen`, a wider one is rejected;
/// - both pointers: comparisons always pass, assignment passes only
///   between identical pointer types;
/// - integer added to or subtracted from a pointer: the integer is
///   wrapped in `Scale` by the size of the pointee.
///
/// `op` is `None` in assignment context.
pub fn modify_type(
    tree: Node,
    rtype: Prim,
    rctype: Option<crate::sym::SymId>,
    op: Option<Op>,
    tb: &mut TreeBuilder,
    target: Target,
) -> Result<(Node, bool)> {
    let ltype = tree.prim;

    // Logical operations accept any integer or pointer operand.
    if matches!(op, Some(Op::LogOr) | Some(Op::LogAnd)) {
        let ok = (ltype.is_int() || ltype.is_ptr()) && (rtype.is_int() || rtype.is_ptr());
        return Ok((tree, ok));
    }

    if ltype.is_int() && rtype.is_int() {
        if ltype == rtype {
            return Ok((tree, true));
        }
        let lsize = target.prim_size(ltype)?;
        let rsize = target.prim_size(rtype)?;
        if lsize > rsize {
            return Ok((tree, false));
        }
        if rsize > lsize {
            let line = tree.line;
            return Ok((tb.unary(Op::Widen, rtype, None, tree, None, 0, line), true));
        }
        return Ok((tree, true));
    }

    if ltype.is_ptr() && rtype.is_ptr() {
        // Pointers always compare
        if op.is_some_and(Op::is_comparison) {
            return Ok((tree, true));
        }
        // Assignment between identical pointer types
        if op.is_none() && ltype == rtype {
            return Ok((tree, true));
        }
    }

    // An integer operand of pointer +/- is scaled by the pointee size
    if matches!(
        op,
        Some(Op::Add) | Some(Op::Subtract) | Some(Op::AsPlus) | Some(Op::AsMinus)
    ) && ltype.is_int()
        && rtype.is_ptr()
    {
        let rsize = target.prim_size(rtype.value_at()?)?;
        if rsize > 1 {
            let line = tree.line;
            return Ok((
                tb.unary(Op::Scale, rtype, rctype, tree, None, rsize, line),
                true,
            ));
        }
        return Ok((tree, true));
    }

    Ok((tree, false))
}
