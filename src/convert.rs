//! Conversion module for transforming evalexpr AST nodes into our internal expression representation.
//!
//! Explicit rate laws in a reaction network are written in evalexpr syntax. This module
//! parses them and maps variables, operators, and function calls onto `Expr`, resolving
//! every identifier against the model's variable layout.
//!
//! The main entry points are `parse_expression`, which parses a string, and `build_ast`,
//! which recursively traverses an already parsed evalexpr tree.

use std::collections::HashMap;

use crate::{
    errors::ConvertError,
    expr::{Expr, VarRef},
};
use evalexpr::{DefaultNumericTypes, Node, Operator};

/// Parses an evalexpr expression string and converts it into an `Expr`.
///
/// # Arguments
/// * `text` - The expression, e.g. `"kf * H2O - kb * H_plus * OH_minus"`
/// * `var_map` - A mapping of symbol names to their indices in the input array
pub fn parse_expression(text: &str, var_map: &HashMap<String, u32>) -> Result<Expr, ConvertError> {
    let node = evalexpr::build_operator_tree::<DefaultNumericTypes>(text)?;
    build_ast(&node, var_map)
}

/// Converts an evalexpr AST node into our internal expression representation.
///
/// # Supported syntax
/// * Basic arithmetic: +, -, *, /, unary minus
/// * Variables: any identifier present in `var_map`
/// * Constants: integer and floating point literals
/// * Functions: abs, exp, ln/log, sqrt, sin, cos (also under the `math::` prefix)
/// * Exponentiation: `x^n`; constant integer exponents become `Pow`, other constant
///   exponents `PowFloat`, everything else `PowExpr`
pub fn build_ast(
    node: &Node<DefaultNumericTypes>,
    var_map: &HashMap<String, u32>,
) -> Result<Expr, ConvertError> {
    let children = node.children();
    match node.operator() {
        // Addition and multiplication fold any number of children left to right
        Operator::Add | Operator::Mul => {
            let is_add = matches!(node.operator(), Operator::Add);
            let (first, rest) = children.split_first().ok_or_else(|| ConvertError::Arity {
                operator: format!("{:?}", node.operator()),
                expected: 2,
                got: 0,
            })?;
            rest.iter().try_fold(build_ast(first, var_map)?, |acc, child| {
                let rhs = Box::new(build_ast(child, var_map)?);
                Ok(if is_add {
                    Expr::Add(Box::new(acc), rhs)
                } else {
                    Expr::Mul(Box::new(acc), rhs)
                })
            })
        }
        Operator::Div => {
            let (l, r) = binary(node, var_map)?;
            Ok(Expr::Div(l, r))
        }
        Operator::Sub => {
            let (l, r) = binary(node, var_map)?;
            Ok(Expr::Sub(l, r))
        }
        Operator::Exp => {
            let (base, exponent) = binary(node, var_map)?;
            Ok(match *exponent.simplify() {
                Expr::Const(c) if c.fract() == 0.0 && c.abs() <= i32::MAX as f64 => {
                    Expr::Pow(base, c as i64)
                }
                Expr::Const(c) => Expr::PowFloat(base, c),
                _ => Expr::PowExpr(base, exponent),
            })
        }
        Operator::Neg => Ok(Expr::Neg(unary(node, var_map)?)),
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::Const(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => {
            let index = var_map
                .get(identifier.as_str())
                .ok_or_else(|| ConvertError::VariableNotFound(identifier.to_string()))?;
            Ok(Expr::Var(VarRef {
                name: identifier.to_string(),
                index: *index,
            }))
        }
        Operator::FunctionIdentifier { identifier } => {
            let name = identifier.strip_prefix("math::").unwrap_or(identifier);
            let arg = unary(node, var_map)?;
            match name {
                "abs" => Ok(Expr::Abs(arg)),
                "ln" | "log" => Ok(Expr::Ln(arg)),
                "sqrt" => Ok(Expr::Sqrt(arg)),
                "exp" => Ok(Expr::Exp(arg)),
                "sin" => Ok(Expr::Sin(arg)),
                "cos" => Ok(Expr::Cos(arg)),
                _ => Err(ConvertError::UnsupportedFunction(identifier.to_string())),
            }
        }
        // Root node - should have exactly one child
        Operator::RootNode => {
            if children.len() == 1 {
                build_ast(&children[0], var_map)
            } else {
                Err(ConvertError::RootNode(format!("{children:?}")))
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

fn unary(
    node: &Node<DefaultNumericTypes>,
    var_map: &HashMap<String, u32>,
) -> Result<Box<Expr>, ConvertError> {
    match node.children() {
        [child] => Ok(Box::new(build_ast(child, var_map)?)),
        children => Err(ConvertError::Arity {
            operator: format!("{:?}", node.operator()),
            expected: 1,
            got: children.len(),
        }),
    }
}

fn binary(
    node: &Node<DefaultNumericTypes>,
    var_map: &HashMap<String, u32>,
) -> Result<(Box<Expr>, Box<Expr>), ConvertError> {
    match node.children() {
        [l, r] => Ok((
            Box::new(build_ast(l, var_map)?),
            Box::new(build_ast(r, var_map)?),
        )),
        children => Err(ConvertError::Arity {
            operator: format!("{:?}", node.operator()),
            expected: 2,
            got: children.len(),
        }),
    }
}
