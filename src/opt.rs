//! Peephole passes over the postfix form of a rate expression.
//!
//! Mass-action rates are long chains of loads and multiplications, and the
//! Jacobian entries derived from them carry constant subterms such as
//! stoichiometric factors. Two passes run to a fixed point:
//!
//! * constant folding on a shadow stack of known values;
//! * fusing `load load Mul load Add|Sub` into a single `Fma`/`Fmsub`.
//!
//! Nothing here touches Cranelift, so the passes are tested on op vectors.

use crate::expr::{FlattenedExpr, LinearOp};

/// Runs both passes until the op count stops shrinking.
pub fn optimize(flattened: FlattenedExpr) -> FlattenedExpr {
    let mut ops = flattened.ops;
    loop {
        let len_before = ops.len();
        ops = fold_consts(ops);
        ops = fuse_fma(ops);
        if ops.len() == len_before {
            break;
        }
    }

    FlattenedExpr { ops, ..flattened }
}

fn fold_consts(ops: Vec<LinearOp>) -> Vec<LinearOp> {
    use LinearOp::*;

    // Mirror the instruction stream on a stack of `Option<f64>`: Some when the
    // slot is a compile-time constant produced by the last emitted load.
    let mut out: Vec<LinearOp> = Vec::with_capacity(ops.len());
    let mut cstk: Vec<Option<f64>> = Vec::with_capacity(8);

    let push_const = |c: f64, out: &mut Vec<LinearOp>, cstk: &mut Vec<Option<f64>>| {
        out.push(LoadConst(c));
        cstk.push(Some(c));
    };

    for op in ops {
        match op {
            LoadConst(c) => push_const(c, &mut out, &mut cstk),
            LoadVar(idx) => {
                out.push(LoadVar(idx));
                cstk.push(None);
            }

            Abs | Neg | Exp | Sqrt | Sin | Cos | PowConst(_) | PowFloat(_) | Ln => {
                let folded = cstk.pop().flatten().and_then(|cv| match op {
                    Abs => Some(cv.abs()),
                    Neg => Some(-cv),
                    Exp => Some(cv.exp()),
                    Sin => Some(cv.sin()),
                    Cos => Some(cv.cos()),
                    PowConst(e) => Some(cv.powi(e as i32)),
                    PowFloat(e) => Some(cv.powf(e)),
                    Sqrt if cv >= 0.0 => Some(cv.sqrt()),
                    Ln if cv > 0.0 => Some(cv.ln()),
                    _ => None,
                });
                match folded {
                    Some(res) => {
                        // erase the load that introduced the operand
                        out.pop();
                        push_const(res, &mut out, &mut cstk);
                    }
                    None => {
                        out.push(op);
                        cstk.push(None);
                    }
                }
            }

            Add | Sub | Mul | Div | PowExpr => {
                let rhs = cstk.pop().flatten();
                let lhs = cstk.pop().flatten();

                let folded = match (lhs, rhs) {
                    (Some(_), Some(b)) if matches!(op, Div) && b == 0.0 => None,
                    (Some(a), Some(b)) => Some(match op {
                        Add => a + b,
                        Sub => a - b,
                        Mul => a * b,
                        Div => a / b,
                        _ => a.powf(b),
                    }),
                    _ => None,
                };
                match folded {
                    Some(res) => {
                        // drop the two producing loads
                        out.truncate(out.len() - 2);
                        push_const(res, &mut out, &mut cstk);
                    }
                    None => {
                        out.push(op);
                        cstk.push(None);
                    }
                }
            }

            Fma | Fmsub => {
                let c = cstk.pop().flatten();
                let b = cstk.pop().flatten();
                let a = cstk.pop().flatten();
                if let (Some(aa), Some(bb), Some(cc)) = (a, b, c) {
                    let res = if matches!(op, Fma) {
                        aa.mul_add(bb, cc)
                    } else {
                        aa.mul_add(bb, -cc)
                    };
                    out.truncate(out.len() - 3);
                    push_const(res, &mut out, &mut cstk);
                } else {
                    out.push(op);
                    cstk.push(None);
                }
            }
        }
    }
    out
}

fn is_load(op: &LinearOp) -> bool {
    matches!(op, LinearOp::LoadVar(_) | LinearOp::LoadConst(_))
}

/// Rewrites `a b Mul c Add` to `a b c Fma`, and the `Sub` form to `Fmsub`.
fn fuse_fma(ops: Vec<LinearOp>) -> Vec<LinearOp> {
    let mut out = Vec::with_capacity(ops.len());
    let mut rest = ops.as_slice();

    while let Some((first, after)) = rest.split_first() {
        if let [a, b, LinearOp::Mul, c, last, tail @ ..] = rest {
            let fused = match last {
                LinearOp::Add => Some(LinearOp::Fma),
                LinearOp::Sub => Some(LinearOp::Fmsub),
                _ => None,
            };
            if let Some(fused) = fused.filter(|_| [a, b, c].into_iter().all(is_load)) {
                out.extend([a.clone(), b.clone(), c.clone(), fused]);
                rest = tail;
                continue;
            }
        }
        out.push(first.clone());
        rest = after;
    }
    out
}
