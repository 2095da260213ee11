//! Expression module for representing the symbolic right-hand side of a kinetic model.
//!
//! This module defines the core expression types used to represent rate laws and their
//! derivatives in a form that supports interpretation, JIT compilation and C code
//! generation. The main types are:
//!
//! - `Expr`: An enum representing different kinds of mathematical expressions
//! - `VarRef`: A struct containing metadata about variables in expressions
//! - `LinearOp` / `FlattenedExpr`: a stack byte-code form used by the JIT builder
//!
//! The expression tree is built recursively using `Box<Expr>` for nested expressions and can be:
//! - Evaluated directly by walking the tree
//! - Flattened and JIT compiled into machine code using Cranelift
//! - Rendered as a C expression
//! - Symbolically differentiated to compute Jacobian entries
//! - Simplified using algebraic rules
//!
//! # Variable layout
//! Every `VarRef` carries an index into a flat input array. Species come first, followed
//! by the model parameters, so a model with `n` states reads `y_i` at index `i` and
//! parameter `p_k` at index `n + k`.
//!
//! # Symbolic Differentiation
//! The derivative method implements symbolic differentiation by recursively applying
//! calculus rules like:
//! - Product rule
//! - Quotient rule
//! - Chain rule
//! - Power rule
//! - Special function derivatives (exp, ln, sqrt, sin, cos)
//!
//! # Expression Simplification
//! The simplify method only applies rewrites that hold for every input, so a Jacobian
//! entry that is identically zero always collapses to `Const(0.0)`:
//! - Constant folding (e.g. 2 + 3 → 5)
//! - Identity rules (e.g. x + 0 → x, x * 1 → x, x * 0 → 0)
//! - Exponent rules (e.g. x^0 → 1, x^1 → x)

use std::fmt::Write as _;

use cranelift::prelude::*;
use cranelift_module::Module;

use crate::errors::{BuilderError, CodegenError};
use crate::{operators, opt};

/// Represents a reference to a variable in an expression.
///
/// Contains the variable's symbol and its index in the flat input array.
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub index: u32,
}

/// Node of a symbolic rate expression.
///
/// Children are boxed; the tree owns its subexpressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    Var(VarRef),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    /// Integer power, e.g. a stoichiometric coefficient
    Pow(Box<Expr>, i64),
    /// Power with a constant real exponent
    PowFloat(Box<Expr>, f64),
    /// Power with a variable exponent
    PowExpr(Box<Expr>, Box<Expr>),
    Abs(Box<Expr>),
    Neg(Box<Expr>),
    Exp(Box<Expr>),
    /// Natural logarithm
    Ln(Box<Expr>),
    Sqrt(Box<Expr>),
    /// Radians
    Sin(Box<Expr>),
    Cos(Box<Expr>),
}

/// Instruction of the postfix form the JIT lowers.
///
/// Operands are taken from a value stack; results are pushed back.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearOp {
    LoadConst(f64),
    /// Reads `inputs[index]`
    LoadVar(u32),
    Add,
    Sub,
    Mul,
    Div,
    Abs,
    Neg,
    /// `x^n`, lowered to multiplications
    PowConst(i64),
    /// `x^c` through the `pow` shim
    PowFloat(f64),
    /// `x^y` with both operands on the stack
    PowExpr,
    Exp,
    Ln,
    Sqrt,
    Sin,
    Cos,
    /// `a * b + c` with a single rounding
    Fma,
    /// `a * b - c` with a single rounding
    Fmsub,
}

/// An expression in postfix order.
#[derive(Debug, Clone)]
pub struct FlattenedExpr {
    pub ops: Vec<LinearOp>,
    /// Highest input index read, `None` for constant expressions
    pub max_var_index: Option<u32>,
}

impl Expr {
    /// Creates a variable node.
    pub fn var(name: impl Into<String>, index: u32) -> Box<Expr> {
        Box::new(Expr::Var(VarRef {
            name: name.into(),
            index,
        }))
    }

    /// Returns true if the expression is the literal zero.
    ///
    /// Only exact structural zeros count; call `simplify` first to fold things like `x * 0`.
    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    /// Evaluates the expression by walking the tree.
    ///
    /// `vars` is the flat input array addressed by `VarRef::index`.
    ///
    /// # Panics
    /// Panics if a variable index is out of bounds for `vars`.
    pub fn eval(&self, vars: &[f64]) -> f64 {
        match self {
            Expr::Const(c) => *c,
            Expr::Var(var_ref) => vars[var_ref.index as usize],
            Expr::Add(left, right) => left.eval(vars) + right.eval(vars),
            Expr::Sub(left, right) => left.eval(vars) - right.eval(vars),
            Expr::Mul(left, right) => left.eval(vars) * right.eval(vars),
            Expr::Div(left, right) => left.eval(vars) / right.eval(vars),
            Expr::Abs(expr) => expr.eval(vars).abs(),
            Expr::Pow(base, exp) => base.eval(vars).powi(*exp as i32),
            Expr::PowFloat(base, exp) => base.eval(vars).powf(*exp),
            Expr::PowExpr(base, exponent) => base.eval(vars).powf(exponent.eval(vars)),
            Expr::Exp(expr) => expr.eval(vars).exp(),
            Expr::Ln(expr) => expr.eval(vars).ln(),
            Expr::Sqrt(expr) => expr.eval(vars).sqrt(),
            Expr::Sin(expr) => expr.eval(vars).sin(),
            Expr::Cos(expr) => expr.eval(vars).cos(),
            Expr::Neg(expr) => -expr.eval(vars),
        }
    }

    /// Differentiates with respect to the variable called `with_respect_to`.
    ///
    /// Product, quotient and chain rules are applied literally, so the result carries
    /// plenty of `* 0` and `+ 0` terms. Run it through [`Expr::simplify`] before use.
    ///
    /// For `f^g` with a non-constant exponent the logarithmic form
    /// `f^g * (g' ln f + g f'/f)` is used, which is only defined for `f > 0`.
    pub fn derivative(&self, with_respect_to: &str) -> Box<Expr> {
        let d = |e: &Box<Expr>| e.derivative(with_respect_to);
        match self {
            Expr::Const(_) => constant(0.0),
            Expr::Var(var_ref) if var_ref.name == with_respect_to => constant(1.0),
            Expr::Var(_) => constant(0.0),
            Expr::Add(f, g) => Box::new(Expr::Add(d(f), d(g))),
            Expr::Sub(f, g) => Box::new(Expr::Sub(d(f), d(g))),
            Expr::Neg(f) => Box::new(Expr::Neg(d(f))),
            Expr::Mul(f, g) => Box::new(Expr::Add(
                product(f.clone(), d(g)),
                product(g.clone(), d(f)),
            )),
            Expr::Div(f, g) => Box::new(Expr::Div(
                Box::new(Expr::Sub(product(g.clone(), d(f)), product(f.clone(), d(g)))),
                Box::new(Expr::Pow(g.clone(), 2)),
            )),
            Expr::PowExpr(f, g) => {
                let log_term = product(d(g), Box::new(Expr::Ln(f.clone())));
                let ratio_term = product(g.clone(), Box::new(Expr::Div(d(f), f.clone())));
                product(
                    Box::new(self.clone()),
                    Box::new(Expr::Add(log_term, ratio_term)),
                )
            }
            // outer'(f) * f'
            Expr::Abs(f) => product(
                Box::new(Expr::Div(f.clone(), Box::new(self.clone()))),
                d(f),
            ),
            Expr::Pow(f, n) => product(
                product(constant(*n as f64), Box::new(Expr::Pow(f.clone(), n - 1))),
                d(f),
            ),
            Expr::PowFloat(f, x) => product(
                product(constant(*x), Box::new(Expr::PowFloat(f.clone(), x - 1.0))),
                d(f),
            ),
            Expr::Exp(f) => product(Box::new(self.clone()), d(f)),
            Expr::Ln(f) => product(Box::new(Expr::Div(constant(1.0), f.clone())), d(f)),
            Expr::Sqrt(f) => product(
                Box::new(Expr::Div(
                    constant(1.0),
                    product(constant(2.0), Box::new(self.clone())),
                )),
                d(f),
            ),
            Expr::Sin(f) => product(Box::new(Expr::Cos(f.clone())), d(f)),
            Expr::Cos(f) => product(Box::new(Expr::Neg(Box::new(Expr::Sin(f.clone())))), d(f)),
        }
    }

    /// Simplifies bottom-up with rewrites that agree with the original expression at
    /// every finite input where it is defined.
    ///
    /// Constants are folded, additive and multiplicative identities removed, products
    /// with zero annihilated, and powers of powers merged. A term that does not depend
    /// on any variable it is differentiated against therefore ends up as `Const(0.0)`,
    /// never `-0.0`, which is what the Jacobian sparsity relies on.
    pub fn simplify(&self) -> Box<Expr> {
        let node = match self {
            Expr::Const(_) | Expr::Var(_) => self.clone(),
            Expr::Add(l, r) => Expr::Add(l.simplify(), r.simplify()),
            Expr::Sub(l, r) => Expr::Sub(l.simplify(), r.simplify()),
            Expr::Mul(l, r) => Expr::Mul(l.simplify(), r.simplify()),
            Expr::Div(l, r) => Expr::Div(l.simplify(), r.simplify()),
            Expr::PowExpr(b, x) => Expr::PowExpr(b.simplify(), x.simplify()),
            Expr::Pow(b, n) => Expr::Pow(b.simplify(), *n),
            Expr::PowFloat(b, x) => Expr::PowFloat(b.simplify(), *x),
            Expr::Abs(e) => Expr::Abs(e.simplify()),
            Expr::Neg(e) => Expr::Neg(e.simplify()),
            Expr::Exp(e) => Expr::Exp(e.simplify()),
            Expr::Ln(e) => Expr::Ln(e.simplify()),
            Expr::Sqrt(e) => Expr::Sqrt(e.simplify()),
            Expr::Sin(e) => Expr::Sin(e.simplify()),
            Expr::Cos(e) => Expr::Cos(e.simplify()),
        };
        Box::new(node.rewrite())
    }

    /// Applies the local rules to a node whose children are already simplified.
    fn rewrite(self) -> Expr {
        match self {
            Expr::Add(l, r) => match (*l, *r) {
                (Expr::Const(a), Expr::Const(b)) => Expr::Const(a + b),
                (e, Expr::Const(z)) | (Expr::Const(z), e) if z == 0.0 => e,
                (x, Expr::Neg(y)) => Expr::Sub(Box::new(x), y),
                (l, r) => Expr::Add(Box::new(l), Box::new(r)),
            },
            Expr::Sub(l, r) => match (*l, *r) {
                (Expr::Const(a), Expr::Const(b)) => Expr::Const(a - b),
                (e, Expr::Const(z)) if z == 0.0 => e,
                (Expr::Const(z), e) if z == 0.0 => Expr::Neg(Box::new(e)).rewrite(),
                (a, b) if a == b => Expr::Const(0.0),
                (x, Expr::Neg(y)) => Expr::Add(Box::new(x), y),
                (l, r) => Expr::Sub(Box::new(l), Box::new(r)),
            },
            Expr::Mul(l, r) => match (*l, *r) {
                (Expr::Const(a), Expr::Const(b)) => Expr::Const(a * b),
                (Expr::Const(z), _) | (_, Expr::Const(z)) if z == 0.0 => Expr::Const(0.0),
                (e, Expr::Const(one)) | (Expr::Const(one), e) if one == 1.0 => e,
                (e, Expr::Const(m)) | (Expr::Const(m), e) if m == -1.0 => {
                    Expr::Neg(Box::new(e)).rewrite()
                }
                (Expr::Pow(b1, n1), Expr::Pow(b2, n2)) if b1 == b2 => {
                    Expr::Pow(b1, n1 + n2).rewrite()
                }
                // -x * y -> -(x * y)
                (Expr::Neg(x), y) | (y, Expr::Neg(x)) => {
                    Expr::Neg(Box::new(Expr::Mul(x, Box::new(y))))
                }
                // (c1 * x) * c2 -> (c1 * c2) * x
                (Expr::Mul(c1, x), Expr::Const(c2)) if matches!(*c1, Expr::Const(_)) => {
                    Expr::Mul(constant(c1.eval(&[]) * c2), x).rewrite()
                }
                (l, r) => Expr::Mul(Box::new(l), Box::new(r)),
            },
            Expr::Div(l, r) => match (*l, *r) {
                (Expr::Const(a), Expr::Const(b)) if b != 0.0 => Expr::Const(a / b),
                (Expr::Const(z), _) if z == 0.0 => Expr::Const(0.0),
                (e, Expr::Const(one)) if one == 1.0 => e,
                (e, Expr::Const(m)) if m == -1.0 => Expr::Neg(Box::new(e)).rewrite(),
                (l, r) => Expr::Div(Box::new(l), Box::new(r)),
            },
            Expr::Pow(b, n) => match (*b, n) {
                (_, 0) => Expr::Const(1.0),
                (Expr::Const(a), n) => Expr::Const(a.powi(n as i32)),
                (e, 1) => e,
                (Expr::Pow(inner, m), n) => Expr::Pow(inner, m * n),
                (b, n) => Expr::Pow(Box::new(b), n),
            },
            Expr::PowFloat(b, x) => match *b {
                _ if x == 0.0 => Expr::Const(1.0),
                Expr::Const(a) => Expr::Const(a.powf(x)),
                e if x == 1.0 => e,
                e if x.fract() == 0.0 && x.abs() <= i32::MAX as f64 => {
                    Expr::Pow(Box::new(e), x as i64).rewrite()
                }
                e => Expr::PowFloat(Box::new(e), x),
            },
            Expr::PowExpr(b, x) => match (*b, *x) {
                (Expr::Const(a), Expr::Const(x)) => Expr::Const(a.powf(x)),
                (b, Expr::Const(x)) => Expr::PowFloat(Box::new(b), x).rewrite(),
                (b, x) => Expr::PowExpr(Box::new(b), Box::new(x)),
            },
            Expr::Abs(e) => match *e {
                Expr::Const(a) => Expr::Const(a.abs()),
                Expr::Abs(inner) | Expr::Neg(inner) => Expr::Abs(inner).rewrite(),
                e => Expr::Abs(Box::new(e)),
            },
            Expr::Neg(e) => match *e {
                // keep structural zeros positive
                Expr::Const(a) if a == 0.0 => Expr::Const(0.0),
                Expr::Const(a) => Expr::Const(-a),
                Expr::Neg(inner) => *inner,
                e => Expr::Neg(Box::new(e)),
            },
            Expr::Exp(e) => match *e {
                Expr::Const(a) => Expr::Const(a.exp()),
                e => Expr::Exp(Box::new(e)),
            },
            Expr::Ln(e) => match *e {
                Expr::Const(a) if a > 0.0 => Expr::Const(a.ln()),
                e => Expr::Ln(Box::new(e)),
            },
            Expr::Sqrt(e) => match *e {
                Expr::Const(a) if a >= 0.0 => Expr::Const(a.sqrt()),
                e => Expr::Sqrt(Box::new(e)),
            },
            Expr::Sin(e) => match *e {
                Expr::Const(a) => Expr::Const(a.sin()),
                e => Expr::Sin(Box::new(e)),
            },
            Expr::Cos(e) => match *e {
                Expr::Const(a) => Expr::Const(a.cos()),
                e => Expr::Cos(Box::new(e)),
            },
            leaf => leaf,
        }
    }

    /// Lowers the tree to postfix order.
    ///
    /// No folding happens here; `opt::optimize` takes care of constant subtrees.
    pub fn flatten(&self) -> FlattenedExpr {
        let mut ops = Vec::new();
        self.push_ops(&mut ops);
        let max_var_index = ops
            .iter()
            .filter_map(|op| match op {
                LinearOp::LoadVar(index) => Some(*index),
                _ => None,
            })
            .max();
        FlattenedExpr { ops, max_var_index }
    }

    fn push_ops(&self, ops: &mut Vec<LinearOp>) {
        let (first, second, op) = match self {
            Expr::Const(c) => return ops.push(LinearOp::LoadConst(*c)),
            Expr::Var(var_ref) => return ops.push(LinearOp::LoadVar(var_ref.index)),
            Expr::Add(l, r) => (l, Some(r), LinearOp::Add),
            Expr::Sub(l, r) => (l, Some(r), LinearOp::Sub),
            Expr::Mul(l, r) => (l, Some(r), LinearOp::Mul),
            Expr::Div(l, r) => (l, Some(r), LinearOp::Div),
            Expr::PowExpr(l, r) => (l, Some(r), LinearOp::PowExpr),
            Expr::Pow(e, n) => (e, None, LinearOp::PowConst(*n)),
            Expr::PowFloat(e, x) => (e, None, LinearOp::PowFloat(*x)),
            Expr::Abs(e) => (e, None, LinearOp::Abs),
            Expr::Neg(e) => (e, None, LinearOp::Neg),
            Expr::Exp(e) => (e, None, LinearOp::Exp),
            Expr::Ln(e) => (e, None, LinearOp::Ln),
            Expr::Sqrt(e) => (e, None, LinearOp::Sqrt),
            Expr::Sin(e) => (e, None, LinearOp::Sin),
            Expr::Cos(e) => (e, None, LinearOp::Cos),
        };
        first.push_ops(ops);
        if let Some(second) = second {
            second.push_ops(ops);
        }
        ops.push(op);
    }

    /// Generates Cranelift IR for this expression, reading variables from `input_ptr`.
    ///
    /// The expression is flattened and run through the peephole optimiser first, then
    /// lowered with an explicit value stack. Each variable is loaded from memory at most
    /// once per expression.
    pub fn codegen(
        &self,
        builder: &mut FunctionBuilder,
        module: &mut dyn Module,
        input_ptr: Value,
    ) -> Result<Value, BuilderError> {
        let flattened = opt::optimize(self.flatten());
        let mut value_stack: Vec<Value> = Vec::with_capacity(flattened.ops.len());
        let mut var_cache: std::collections::HashMap<u32, Value> = std::collections::HashMap::new();

        for op in &flattened.ops {
            match op {
                LinearOp::LoadConst(v) => value_stack.push(builder.ins().f64const(*v)),
                LinearOp::LoadVar(idx) => {
                    let val = *var_cache.entry(*idx).or_insert_with(|| {
                        let offset = (*idx as i32) * 8;
                        builder
                            .ins()
                            .load(types::F64, MemFlags::trusted(), input_ptr, offset)
                    });
                    value_stack.push(val);
                }
                LinearOp::Add => {
                    let (l, r) = pop2(&mut value_stack)?;
                    value_stack.push(builder.ins().fadd(l, r));
                }
                LinearOp::Sub => {
                    let (l, r) = pop2(&mut value_stack)?;
                    value_stack.push(builder.ins().fsub(l, r));
                }
                LinearOp::Mul => {
                    let (l, r) = pop2(&mut value_stack)?;
                    value_stack.push(builder.ins().fmul(l, r));
                }
                LinearOp::Div => {
                    let (l, r) = pop2(&mut value_stack)?;
                    value_stack.push(builder.ins().fdiv(l, r));
                }
                LinearOp::Abs => {
                    let v = pop1(&mut value_stack)?;
                    value_stack.push(builder.ins().fabs(v));
                }
                LinearOp::Neg => {
                    let v = pop1(&mut value_stack)?;
                    value_stack.push(builder.ins().fneg(v));
                }
                LinearOp::Sqrt => {
                    let v = pop1(&mut value_stack)?;
                    value_stack.push(builder.ins().sqrt(v));
                }
                LinearOp::PowConst(e) => {
                    let base = pop1(&mut value_stack)?;
                    value_stack.push(emit_powi(builder, base, *e));
                }
                LinearOp::PowFloat(e) => {
                    let base = pop1(&mut value_stack)?;
                    let expv = builder.ins().f64const(*e);
                    let fid = operators::link_binary(module, operators::POW)?;
                    value_stack.push(operators::call(builder, module, fid, &[base, expv]));
                }
                LinearOp::PowExpr => {
                    let (base, expv) = pop2(&mut value_stack)?;
                    let fid = operators::link_binary(module, operators::POW)?;
                    value_stack.push(operators::call(builder, module, fid, &[base, expv]));
                }
                LinearOp::Exp | LinearOp::Ln | LinearOp::Sin | LinearOp::Cos => {
                    let v = pop1(&mut value_stack)?;
                    let name = match op {
                        LinearOp::Exp => operators::EXP,
                        LinearOp::Ln => operators::LN,
                        LinearOp::Sin => operators::SIN,
                        _ => operators::COS,
                    };
                    let fid = operators::link_unary(module, name)?;
                    value_stack.push(operators::call(builder, module, fid, &[v]));
                }
                LinearOp::Fma => {
                    let c = pop1(&mut value_stack)?;
                    let (a, b) = pop2(&mut value_stack)?;
                    value_stack.push(builder.ins().fma(a, b, c));
                }
                LinearOp::Fmsub => {
                    let c = pop1(&mut value_stack)?;
                    let (a, b) = pop2(&mut value_stack)?;
                    // a*b - c  ==  fma(a, b, -c)
                    let neg_c = builder.ins().fneg(c);
                    value_stack.push(builder.ins().fma(a, b, neg_c));
                }
            }
        }

        match (value_stack.pop(), value_stack.is_empty()) {
            (Some(result), true) => Ok(result),
            _ => Err(BuilderError::FunctionError(format!(
                "unbalanced value stack while lowering {self}"
            ))),
        }
    }

    /// Renders the expression as a C expression.
    ///
    /// Variables with an index below `n_states` are written as `y[i]`, the remaining
    /// ones as `p[i - n_states]`. Every binary operation is parenthesized so the output
    /// does not depend on C operator precedence.
    ///
    /// # Errors
    /// Returns `CodegenError::NonFiniteConstant` if the tree contains NaN or infinity,
    /// which has no portable C literal.
    pub fn to_c(&self, n_states: usize) -> Result<String, CodegenError> {
        let mut out = String::new();
        self.write_c(n_states, &mut out)?;
        Ok(out)
    }

    fn write_c(&self, n_states: usize, out: &mut String) -> Result<(), CodegenError> {
        // Writing into a String cannot fail, the fmt::Result is discarded.
        match self {
            Expr::Const(c) => {
                if !c.is_finite() {
                    return Err(CodegenError::NonFiniteConstant {
                        value: *c,
                        location: self.to_string(),
                    });
                }
                if *c < 0.0 {
                    let _ = write!(out, "({c:e})");
                } else {
                    let _ = write!(out, "{c:e}");
                }
            }
            Expr::Var(var_ref) => {
                let index = var_ref.index as usize;
                if index < n_states {
                    let _ = write!(out, "y[{index}]");
                } else {
                    let _ = write!(out, "p[{}]", index - n_states);
                }
            }
            Expr::Add(l, r) => write_c_binary(out, n_states, l, " + ", r)?,
            Expr::Sub(l, r) => write_c_binary(out, n_states, l, " - ", r)?,
            Expr::Mul(l, r) => write_c_binary(out, n_states, l, "*", r)?,
            Expr::Div(l, r) => write_c_binary(out, n_states, l, "/", r)?,
            Expr::Pow(base, 2) => write_c_binary(out, n_states, base, "*", base)?,
            Expr::Pow(base, -1) => {
                out.push_str("(1.0/");
                base.write_c(n_states, out)?;
                out.push(')');
            }
            Expr::Pow(base, exp) => {
                out.push_str("pow(");
                base.write_c(n_states, out)?;
                let _ = write!(out, ", {exp})");
            }
            Expr::PowFloat(base, exp) => {
                out.push_str("pow(");
                base.write_c(n_states, out)?;
                out.push_str(", ");
                Expr::Const(*exp).write_c(n_states, out)?;
                out.push(')');
            }
            Expr::PowExpr(base, exponent) => {
                out.push_str("pow(");
                base.write_c(n_states, out)?;
                out.push_str(", ");
                exponent.write_c(n_states, out)?;
                out.push(')');
            }
            Expr::Abs(e) => write_c_call(out, n_states, "fabs", e)?,
            Expr::Exp(e) => write_c_call(out, n_states, "exp", e)?,
            Expr::Ln(e) => write_c_call(out, n_states, "log", e)?,
            Expr::Sqrt(e) => write_c_call(out, n_states, "sqrt", e)?,
            Expr::Sin(e) => write_c_call(out, n_states, "sin", e)?,
            Expr::Cos(e) => write_c_call(out, n_states, "cos", e)?,
            Expr::Neg(e) => {
                out.push_str("(-");
                e.write_c(n_states, out)?;
                out.push(')');
            }
        }
        Ok(())
    }
}

fn write_c_binary(
    out: &mut String,
    n_states: usize,
    left: &Expr,
    op: &str,
    right: &Expr,
) -> Result<(), CodegenError> {
    out.push('(');
    left.write_c(n_states, out)?;
    out.push_str(op);
    right.write_c(n_states, out)?;
    out.push(')');
    Ok(())
}

fn write_c_call(
    out: &mut String,
    n_states: usize,
    function: &str,
    arg: &Expr,
) -> Result<(), CodegenError> {
    out.push_str(function);
    out.push('(');
    arg.write_c(n_states, out)?;
    out.push(')');
    Ok(())
}

fn pop1(stack: &mut Vec<Value>) -> Result<Value, BuilderError> {
    stack
        .pop()
        .ok_or_else(|| BuilderError::FunctionError("value stack underflow".to_string()))
}

fn pop2(stack: &mut Vec<Value>) -> Result<(Value, Value), BuilderError> {
    let r = pop1(stack)?;
    let l = pop1(stack)?;
    Ok((l, r))
}

/// `base^exp` by square-and-multiply; negative exponents divide once at the end.
fn emit_powi(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    if exp == 0 {
        return builder.ins().f64const(1.0);
    }
    let mut acc: Option<Value> = None;
    let mut square = base;
    let mut n = exp.unsigned_abs();
    loop {
        if n & 1 == 1 {
            acc = Some(match acc {
                Some(a) => builder.ins().fmul(a, square),
                None => square,
            });
        }
        n >>= 1;
        if n == 0 {
            break;
        }
        square = builder.ins().fmul(square, square);
    }
    let value = acc.unwrap_or(base);
    if exp < 0 {
        let one = builder.ins().f64const(1.0);
        builder.ins().fdiv(one, value)
    } else {
        value
    }
}

/// Fully parenthesized infix form, `|x|` for absolute values.
impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Var(var_ref) => f.write_str(&var_ref.name),
            Expr::Add(l, r) => write!(f, "({l} + {r})"),
            Expr::Sub(l, r) => write!(f, "({l} - {r})"),
            Expr::Mul(l, r) => write!(f, "({l} * {r})"),
            Expr::Div(l, r) => write!(f, "({l} / {r})"),
            Expr::Pow(b, n) => write!(f, "({b}^{n})"),
            Expr::PowFloat(b, x) => write!(f, "({b}^{x})"),
            Expr::PowExpr(b, e) => write!(f, "({b}^{e})"),
            Expr::Abs(e) => write!(f, "|{e}|"),
            Expr::Neg(e) => write!(f, "-({e})"),
            Expr::Exp(e) => write!(f, "exp({e})"),
            Expr::Ln(e) => write!(f, "ln({e})"),
            Expr::Sqrt(e) => write!(f, "sqrt({e})"),
            Expr::Sin(e) => write!(f, "sin({e})"),
            Expr::Cos(e) => write!(f, "cos({e})"),
        }
    }
}

fn constant(value: f64) -> Box<Expr> {
    Box::new(Expr::Const(value))
}

fn product(left: Box<Expr>, right: Box<Expr>) -> Box<Expr> {
    Box::new(Expr::Mul(left, right))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn species(name: &str) -> Box<Expr> {
        Expr::var(name, 0)
    }

    fn simplified(expr: Expr) -> Expr {
        *expr.simplify()
    }

    #[test]
    fn test_simplify() {
        let a = species("A");
        let c = |v| Box::new(Expr::Const(v));

        assert_eq!(simplified(Expr::Mul(c(4.0), c(0.5))), Expr::Const(2.0));
        assert_eq!(simplified(Expr::Sub(c(0.0), a.clone())), Expr::Neg(a.clone()));
        assert_eq!(simplified(Expr::Add(c(0.0), a.clone())), *a);
        assert_eq!(simplified(Expr::Mul(c(1.0), a.clone())), *a);
        assert_eq!(simplified(Expr::Mul(a.clone(), c(-1.0))), Expr::Neg(a.clone()));
        assert_eq!(simplified(Expr::Mul(c(0.0), a.clone())), Expr::Const(0.0));
        assert_eq!(simplified(Expr::Div(c(0.0), a.clone())), Expr::Const(0.0));
        assert_eq!(simplified(Expr::Div(a.clone(), c(1.0))), *a);
        assert_eq!(simplified(Expr::Sub(a.clone(), a.clone())), Expr::Const(0.0));

        assert_eq!(simplified(Expr::Pow(a.clone(), 0)), Expr::Const(1.0));
        assert_eq!(simplified(Expr::Pow(a.clone(), 1)), *a);
        assert_eq!(
            simplified(Expr::Mul(
                Box::new(Expr::Pow(a.clone(), 2)),
                Box::new(Expr::Pow(a.clone(), 3))
            )),
            Expr::Pow(a.clone(), 5)
        );
        assert_eq!(
            simplified(Expr::PowExpr(a.clone(), c(2.0))),
            Expr::Pow(a.clone(), 2)
        );

        assert_eq!(simplified(Expr::Abs(c(-0.25))), Expr::Const(0.25));
        assert_eq!(
            simplified(Expr::Abs(Box::new(Expr::Neg(a.clone())))),
            Expr::Abs(a.clone())
        );
        // exp(ln(A)) is NaN for A < 0, so it stays
        assert_eq!(
            simplified(Expr::Exp(Box::new(Expr::Ln(a.clone())))),
            Expr::Exp(Box::new(Expr::Ln(a.clone())))
        );
        assert_eq!(simplified(Expr::Neg(Box::new(Expr::Neg(a.clone())))), *a);
        // undefined constants stay symbolic
        assert_eq!(simplified(Expr::Ln(c(-1.0))), Expr::Ln(c(-1.0)));
    }

    #[test]
    fn test_scaled_product_is_simplified_again() {
        let a = species("A");
        // (4 * A) * 0.25 -> 1 * A -> A
        let unit = Expr::Mul(
            Box::new(Expr::Mul(Box::new(Expr::Const(4.0)), a.clone())),
            Box::new(Expr::Const(0.25)),
        );
        assert_eq!(simplified(unit), *a);

        // the folded factor underflows to zero
        let tiny = Expr::Mul(
            Box::new(Expr::Mul(Box::new(Expr::Const(1e-200)), a.clone())),
            Box::new(Expr::Const(1e-200)),
        );
        assert!(tiny.simplify().is_zero());
    }

    #[test]
    fn test_negated_zero_stays_zero() {
        let expr = Expr::Neg(Box::new(Expr::Mul(species("x"), Box::new(Expr::Const(0.0)))));
        let simplified = expr.simplify();
        assert!(simplified.is_zero());
        assert!(Expr::Const(-0.0).is_zero());
    }

    #[test]
    fn test_derivative() {
        let a = species("A");
        let b = species("B");
        assert_eq!(*Expr::Const(1.4e8).derivative("A"), Expr::Const(0.0));
        assert_eq!(*a.derivative("A"), Expr::Const(1.0));
        assert_eq!(*b.derivative("A"), Expr::Const(0.0));

        // mass action k * A * B: product rule, unsimplified
        let collision = Expr::Mul(a.clone(), b.clone());
        assert_eq!(
            *collision.derivative("A"),
            Expr::Add(
                Box::new(Expr::Mul(a.clone(), Box::new(Expr::Const(0.0)))),
                Box::new(Expr::Mul(b.clone(), Box::new(Expr::Const(1.0)))),
            )
        );
        assert_eq!(*collision.derivative("A").simplify(), *b);

        // second order in A: 2 * A^1 * 1
        let dimer = Expr::Pow(a.clone(), 2);
        assert_eq!(
            *dimer.derivative("A"),
            Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(2.0)),
                    Box::new(Expr::Pow(a.clone(), 1)),
                )),
                Box::new(Expr::Const(1.0)),
            )
        );
        assert_eq!(
            *dimer.derivative("A").simplify(),
            Expr::Mul(Box::new(Expr::Const(2.0)), a.clone())
        );
    }

    #[test]
    fn test_derivative_of_independent_term_simplifies_to_zero() {
        // d/dz (k * x^2 * y) == 0 exactly
        let x = Expr::var("x", 0);
        let y = Expr::var("y", 1);
        let k = Expr::var("k", 3);
        let rate = Expr::Mul(Box::new(Expr::Mul(k, Box::new(Expr::Pow(x, 2)))), y);
        assert!(rate.derivative("z").simplify().is_zero());
        assert!(!rate.derivative("x").simplify().is_zero());
    }

    #[test]
    fn test_eval_matches_derivative_numerically() {
        // f = exp(x) * sqrt(y) / x, check df/dx against a central difference
        let x = Expr::var("x", 0);
        let y = Expr::var("y", 1);
        let f = Expr::Div(
            Box::new(Expr::Mul(Box::new(Expr::Exp(x.clone())), Box::new(Expr::Sqrt(y)))),
            x,
        );
        let df = f.derivative("x").simplify();
        let h = 1e-6;
        let fd = (f.eval(&[1.5 + h, 2.0]) - f.eval(&[1.5 - h, 2.0])) / (2.0 * h);
        assert!((df.eval(&[1.5, 2.0]) - fd).abs() < 1e-6);
    }

    #[test]
    fn test_sqrt_derivative() {
        let x = Expr::var("x", 0);
        let df = Expr::Sqrt(x).derivative("x").simplify();
        assert!((df.eval(&[4.0]) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_to_c() {
        let y0 = Expr::var("A", 0);
        let y1 = Expr::var("B", 1);
        let k = Expr::var("k", 2);
        let rate = Expr::Mul(Box::new(Expr::Mul(k, Box::new(Expr::Pow(y0, 2)))), y1);
        assert_eq!(rate.to_c(2).unwrap(), "((p[0]*(y[0]*y[0]))*y[1])");

        let neg = Expr::Neg(Box::new(Expr::Const(-2.5e-5)));
        assert_eq!(neg.to_c(2).unwrap(), "(-(-2.5e-5))");

        let ln = Expr::Ln(Expr::var("A", 0));
        assert_eq!(ln.to_c(1).unwrap(), "log(y[0])");
    }

    #[test]
    fn test_to_c_rejects_non_finite() {
        let bad = Expr::Add(Expr::var("A", 0), Box::new(Expr::Const(f64::INFINITY)));
        assert!(matches!(
            bad.to_c(1),
            Err(CodegenError::NonFiniteConstant { .. })
        ));
    }

    #[test]
    fn test_flatten() {
        let expr = Expr::Add(Expr::var("x", 0), Box::new(Expr::Const(2.0)));
        let flat = expr.flatten();
        assert_eq!(
            flat.ops,
            vec![LinearOp::LoadVar(0), LinearOp::LoadConst(2.0), LinearOp::Add]
        );
        assert_eq!(flat.max_var_index, Some(0));

        let constant = Expr::Mul(Box::new(Expr::Const(2.0)), Box::new(Expr::Const(3.0)));
        let flat = opt::optimize(constant.flatten());
        assert_eq!(flat.ops, vec![LinearOp::LoadConst(6.0)]);
        assert_eq!(flat.max_var_index, None);
    }

    #[test]
    fn test_display() {
        let a = species("A");
        let b = species("B");
        assert_eq!(Expr::Const(0.5).to_string(), "0.5");
        assert_eq!(a.to_string(), "A");
        assert_eq!(Expr::Sub(a.clone(), b.clone()).to_string(), "(A - B)");
        assert_eq!(Expr::Neg(a.clone()).to_string(), "-(A)");

        let michaelis_menten = Expr::Div(
            Box::new(Expr::Mul(Expr::var("vmax", 1), a.clone())),
            Box::new(Expr::Add(Expr::var("km", 2), a)),
        );
        assert_eq!(michaelis_menten.to_string(), "((vmax * A) / (km + A))");
    }
}
