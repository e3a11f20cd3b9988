use crate::ast::{Node, Op, TreeBuilder};

/// Fold a node with a unary operator and an integer-literal child.
/// Returns the original node for any operator it can't fold.
fn fold1(n: Node, tb: &mut TreeBuilder) -> Node {
    let val = n.left_ref().map(|l| l.value).unwrap_or(0);
    let val = match n.op {
        Op::Widen => val,
        Op::Invert => !val,
        Op::LogNot => (val == 0) as i64,
        Op::Scale => val.wrapping_mul(n.value),
        _ => return n,
    };
    tb.leaf(Op::IntLit, n.prim, None, None, val, n.line)
}

/// Fold a node with a binary operator and two integer-literal
/// children. Division by zero is left unfolded.
fn fold2(n: Node, tb: &mut TreeBuilder) -> Node {
    let leftval = n.left_ref().map(|l| l.value).unwrap_or(0);
    let rightval = n.right_ref().map(|r| r.value).unwrap_or(0);

    let val = match n.op {
        Op::Add => leftval.wrapping_add(rightval),
        Op::Subtract => leftval.wrapping_sub(rightval),
        Op::Multiply => leftval.wrapping_mul(rightval),
        Op::Divide => {
            if rightval == 0 {
                return n;
            }
            leftval.wrapping_div(rightval)
        }
        Op::And => leftval & rightval,
        Op::Or => leftval | rightval,
        Op::Xor => leftval ^ rightval,
        Op::LShift => leftval.wrapping_shl(rightval as u32),
        Op::RShift => leftval.wrapping_shr(rightval as u32),
        _ => return n,
    };
    tb.leaf(Op::IntLit, n.prim, None, None, val, n.line)
}

/// Constant-fold a tree with a depth-first traversal: children first,
/// then any node whose operands became integer literals.
pub fn optimise(mut n: Node, tb: &mut TreeBuilder) -> Node {
    if let Some(left) = n.left.take() {
        let left = optimise(*left, tb);
        n.left_id = Some(left.id);
        n.left = Some(Box::new(left));
    }
    if let Some(right) = n.right.take() {
        let right = optimise(*right, tb);
        n.right_id = Some(right.id);
        n.right = Some(Box::new(right));
    }

    if n.left_ref().map(|l| l.op) == Some(Op::IntLit) {
        if n.right_ref().map(|r| r.op) == Some(Op::IntLit) {
            n = fold2(n, tb);
        } else {
            n = fold1(n, tb);
        }
    }
    n
}
