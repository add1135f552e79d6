//! Compile-time expression evaluation.
//!
//! The oracle behind `#if`, `#assert`, enum member values, static-array
//! lengths and the `$size_of` family: a small constant folder over resolved
//! AST. It is re-entrant through the analysis driver, so evaluating a
//! condition may trigger name resolution or type checks elsewhere; the
//! driver's cycle stack bounds the recursion.

use crate::analysis;
use crate::ast::{AstData, AstIndex, AstKind, BinOp, UnOp};
use crate::context::CompilationContext;
use crate::errors::{DiagKind, Fallible};

/// Evaluate an expression to an integer constant. Non-constant expressions
/// report a diagnostic and fold to zero so expansion can continue.
pub fn eval_static_expr(ctx: &mut CompilationContext, expr: AstIndex) -> Fallible<i64> {
    analysis::require_name_resolve(ctx, expr)?;
    eval_resolved(ctx, expr)
}

fn eval_resolved(ctx: &mut CompilationContext, expr: AstIndex) -> Fallible<i64> {
    match ctx.node(expr).data {
        AstData::IntLiteral { value } => Ok(value as i64),
        AstData::BoolLiteral { value } => Ok(value as i64),
        AstData::NullLiteral => Ok(0),
        AstData::ErrorNode => Ok(0),
        AstData::UnaryExpr { op, operand } => {
            let v = eval_resolved(ctx, operand)?;
            Ok(match op {
                UnOp::Neg => v.wrapping_neg(),
                UnOp::Not => (v == 0) as i64,
                UnOp::BitNot => !v,
                UnOp::AddrOf | UnOp::Deref => {
                    return Err(not_constant(ctx, expr));
                }
            })
        }
        AstData::BinaryExpr { op, left, right } => eval_binary(ctx, expr, op, left, right),
        AstData::CastExpr { expr: inner, .. } => eval_resolved(ctx, inner),
        AstData::NameUse { entity, .. } => eval_entity(ctx, expr, entity),
        AstData::MemberExpr { object, member, .. } => {
            // scoped enum member access: Color.red
            if let AstData::NameUse { entity, .. } = ctx.node(object).data {
                if entity.is_defined() && ctx.kind_of(entity) == AstKind::EnumDecl {
                    if let AstData::EnumDecl { scope, .. } = ctx.node(entity).data {
                        if let Some(&m) = ctx.scope(scope).symbols.get(&member) {
                            return member_value(ctx, m);
                        }
                    }
                }
            }
            Err(not_constant(ctx, expr))
        }
        _ => Err(not_constant(ctx, expr)),
    }
}

fn eval_binary(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    op: BinOp,
    left: AstIndex,
    right: AstIndex,
) -> Fallible<i64> {
    // logic operators short-circuit even at compile time
    if op == BinOp::LogicAnd {
        let l = eval_resolved(ctx, left)?;
        if l == 0 {
            return Ok(0);
        }
        return Ok((eval_resolved(ctx, right)? != 0) as i64);
    }
    if op == BinOp::LogicOr {
        let l = eval_resolved(ctx, left)?;
        if l != 0 {
            return Ok(1);
        }
        return Ok((eval_resolved(ctx, right)? != 0) as i64);
    }

    let l = eval_resolved(ctx, left)?;
    let r = eval_resolved(ctx, right)?;
    let value = match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::Div | BinOp::Rem => {
            if r == 0 {
                let loc = ctx.node(expr).loc;
                ctx.error(DiagKind::StaticExpansion, loc, "division by zero in constant expression".to_string());
                return Ok(0);
            }
            if op == BinOp::Div { l.wrapping_div(r) } else { l.wrapping_rem(r) }
        }
        BinOp::BitAnd => l & r,
        BinOp::BitOr => l | r,
        BinOp::BitXor => l ^ r,
        BinOp::Shl => l.wrapping_shl(r as u32),
        BinOp::Shr => l.wrapping_shr(r as u32),
        BinOp::Lt => (l < r) as i64,
        BinOp::Gt => (l > r) as i64,
        BinOp::Le => (l <= r) as i64,
        BinOp::Ge => (l >= r) as i64,
        BinOp::Eq => (l == r) as i64,
        BinOp::Ne => (l != r) as i64,
        BinOp::Assign | BinOp::LogicAnd | BinOp::LogicOr => {
            return Err(not_constant(ctx, expr));
        }
    };
    Ok(value)
}

fn eval_entity(
    ctx: &mut CompilationContext,
    use_node: AstIndex,
    entity: AstIndex,
) -> Fallible<i64> {
    if entity.is_undef() {
        return Ok(0);
    }
    match ctx.node(entity).kind() {
        AstKind::EnumMember => member_value(ctx, entity),
        AstKind::ErrorNode => Ok(0),
        _ => Err(not_constant(ctx, use_node)),
    }
}

/// The value of an enum member or manifest constant. Auto-valued members of
/// a scoped enum are filled in by the owning enum's type check.
pub fn member_value(ctx: &mut CompilationContext, member: AstIndex) -> Fallible<i64> {
    if let Some(&v) = ctx.enum_values.get(&member) {
        return Ok(v);
    }
    analysis::require_type_check(ctx, member)?;
    if let Some(&v) = ctx.enum_values.get(&member) {
        return Ok(v);
    }
    let loc = ctx.node(member).loc;
    Err(ctx.fatal(
        DiagKind::StaticExpansion,
        loc,
        "enum member has no computable value".to_string(),
    ))
}

fn not_constant(ctx: &mut CompilationContext, expr: AstIndex) -> crate::errors::Fatal {
    let loc = ctx.node(expr).loc;
    ctx.fatal(
        DiagKind::StaticExpansion,
        loc,
        "expression is not a compile-time constant".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;

    fn eval_in_module(source: &str, decl_name: &str) -> (CompilationContext, i64) {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let file = ctx.add_file("test.mica", source);
        let module = crate::parser::parse_module_file(&mut ctx, file);
        ctx.add_module(module, file);
        analysis::require_register_nested(&mut ctx, module).unwrap();

        let AstData::Module { scope, .. } = ctx.node(module).data else { panic!() };
        let id = ctx.intern(decl_name);
        let member = *ctx.scope(scope).symbols.get(&id).expect("declared");
        let value = member_value(&mut ctx, member).unwrap();
        (ctx, value)
    }

    #[test]
    fn test_arithmetic_folding() {
        let (_, v) = eval_in_module("module m;\nenum X = 2 * 3 + (10 >> 1);\n", "X");
        assert_eq!(v, 11);
    }

    #[test]
    fn test_references_other_constants() {
        let (ctx, v) = eval_in_module(
            "module m;\nenum A = 4;\nenum B = A * A;\n",
            "B",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        assert_eq!(v, 16);
    }

    #[test]
    fn test_comparison_and_logic() {
        let (_, v) = eval_in_module("module m;\nenum X = 3 < 4 && 2 == 2;\n", "X");
        assert_eq!(v, 1);
        let (_, v) = eval_in_module("module m;\nenum Y = 0 || 5 > 9;\n", "Y");
        assert_eq!(v, 0);
    }

    #[test]
    fn test_division_by_zero_reports() {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let file = ctx.add_file("test.mica", "module m;\nenum X = 1 / 0;\n");
        let module = crate::parser::parse_module_file(&mut ctx, file);
        ctx.add_module(module, file);
        analysis::require_register_nested(&mut ctx, module).unwrap();
        let AstData::Module { scope, .. } = ctx.node(module).data else { panic!() };
        let id = ctx.intern("X");
        let member = *ctx.scope(scope).symbols.get(&id).unwrap();
        let v = member_value(&mut ctx, member).unwrap();
        assert_eq!(v, 0);
        assert_eq!(ctx.diagnostics.count_of(DiagKind::StaticExpansion), 1);
    }
}
