//! Type checking.
//!
//! Bottom-up type synthesis with a contextual parent type that biases
//! integer literals toward the expected type in assignments, calls and
//! returns. Several lowerings happen here rather than in IR generation:
//! paren-free calls, synthesized `length`/`ptr` members on slices and
//! arrays, implicit receiver insertion for method calls, and `cast`
//! legality. The checker is strict: no implicit signed/unsigned mixing
//! beyond literals with a known value, and no pointer-to-integer promotion.
//!
//! Struct layout (sizes, alignment, field offsets) lives here too; the IR
//! generator consumes it for the pass-by-pointer rule.

use crate::analysis;
use crate::ast::{
    builtin_member, flags, AstData, AstIndex, AstKind, BasicType, BinOp, BuiltinFn, UnOp,
};
use crate::context::CompilationContext;
use crate::errors::{DiagKind, Fallible, SourceLoc};
use crate::eval;

/// Per-function statement context.
struct FuncCtx {
    return_type: AstIndex,
    loop_depth: u32,
}

pub fn check_node(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    match ctx.node(node).data {
        AstData::Module { items, .. } => {
            for item in ctx.list(items) {
                analysis::require_type_check(ctx, item)?;
            }
            Ok(())
        }
        AstData::Import { .. } => Ok(()),
        AstData::Alias { .. } => {
            let alias_meta = ctx.basic_type(BasicType::Alias);
            ctx.set_type(node, alias_meta);
            Ok(())
        }
        AstData::VarDecl { .. } => check_var_decl(ctx, node),
        AstData::FunctionDecl { .. } => check_function(ctx, node),
        AstData::StructDecl { members, .. } => {
            for member in ctx.list(members) {
                analysis::require_type_check(ctx, member)?;
            }
            Ok(())
        }
        AstData::EnumDecl { .. } => check_enum(ctx, node),
        AstData::EnumMember { .. } => check_enum_member(ctx, node),
        // statements are checked from their function; a bare require on one
        // has nothing to do
        _ => Ok(()),
    }
}

fn check_var_decl(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    let AstData::VarDecl { ty, initializer, name, .. } = ctx.node(node).data else {
        return Ok(());
    };
    let loc = ctx.node(node).loc;
    let ty_n = type_of_type_expr(ctx, ty)?;
    if let Some(BasicType::Void | BasicType::Noreturn) = basic_of(ctx, ty_n) {
        let message = format!("variable '{}' cannot have type {}", ctx.name(name), type_name(ctx, ty_n));
        ctx.error(DiagKind::Type, loc, message);
    }
    if let AstData::VarDecl { ty: slot, .. } = &mut ctx.node_mut(node).data {
        *slot = ty_n;
    }
    ctx.set_type(node, ty_n);

    if initializer.is_defined() {
        let init_t = check_expr(ctx, initializer, ty_n, false)?;
        check_assignable(ctx, ty_n, init_t, initializer);
    }
    Ok(())
}

fn check_function(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    let signature = ensure_signature(ctx, node)?;
    let AstData::FunctionDecl { body, name, .. } = ctx.node(node).data else { return Ok(()) };
    let loc = ctx.node(node).loc;

    if body.is_undef() {
        let has_extern = ctx.attr_info(node).is_some_and(|a| a.flags != 0);
        if !has_extern {
            let message = format!(
                "function '{}' has no body and no @extern attribute",
                ctx.name(name)
            );
            ctx.error(DiagKind::Type, loc, message);
        }
        return Ok(());
    }

    let AstData::FunctionSignature { return_type, .. } = ctx.node(signature).data else {
        return Ok(());
    };
    let mut fctx = FuncCtx { return_type, loop_depth: 0 };
    check_stmt(ctx, body, &mut fctx)
}

/// Normalize a function's signature without checking its body, so recursive
/// and mutually recursive calls do not cycle through the full check.
pub fn ensure_signature(ctx: &mut CompilationContext, decl: AstIndex) -> Fallible<AstIndex> {
    let AstData::FunctionDecl { signature, .. } = ctx.node(decl).data else {
        return Ok(AstIndex::UNDEF);
    };
    if ctx.get_type(decl).is_defined() {
        return Ok(signature);
    }
    let AstData::FunctionSignature { return_type, params } = ctx.node(signature).data else {
        return Ok(AstIndex::UNDEF);
    };
    let ret_n = type_of_type_expr(ctx, return_type)?;
    if let AstData::FunctionSignature { return_type: slot, .. } =
        &mut ctx.node_mut(signature).data
    {
        *slot = ret_n;
    }

    let mut saw_default = false;
    for param in ctx.list(params) {
        analysis::require_type_check(ctx, param)?;
        let AstData::VarDecl { initializer, .. } = ctx.node(param).data else { continue };
        if initializer.is_defined() {
            saw_default = true;
        } else if saw_default && !ctx.node(param).has_flag(flags::IS_VARIADIC_PARAM) {
            let loc = ctx.node(param).loc;
            ctx.error(
                DiagKind::Type,
                loc,
                "parameter without default follows a parameter with one".to_string(),
            );
        }
    }

    ctx.set_type(decl, signature);
    Ok(signature)
}

fn check_enum(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    let AstData::EnumDecl { base_type, members, .. } = ctx.node(node).data else {
        return Ok(());
    };
    let base_n = type_of_type_expr(ctx, base_type)?;
    match basic_of(ctx, base_n) {
        Some(b) if b.is_integer() => {}
        _ => {
            let loc = ctx.node(node).loc;
            ctx.error(
                DiagKind::Type,
                loc,
                format!("enum base type must be an integer type, not {}", type_name(ctx, base_n)),
            );
        }
    }
    if let AstData::EnumDecl { base_type: slot, .. } = &mut ctx.node_mut(node).data {
        *slot = base_n;
    }

    let mut prev: i64 = -1;
    for member in ctx.list(members) {
        let AstData::EnumMember { value, .. } = ctx.node(member).data else { continue };
        let v = if value.is_defined() { eval::eval_static_expr(ctx, value)? } else { prev + 1 };
        ctx.enum_values.insert(member, v);
        ctx.set_type(member, node);
        prev = v;
    }
    Ok(())
}

fn check_enum_member(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    if ctx.enum_values.contains_key(&node) {
        return Ok(());
    }
    let AstData::EnumMember { ty, value, parent_scope, .. } = ctx.node(node).data else {
        return Ok(());
    };

    if value.is_undef() {
        // auto-valued member of a scoped enum: the owning enum assigns it
        let owner = ctx.scope(parent_scope).owner;
        if owner.is_defined() && ctx.kind_of(owner) == AstKind::EnumDecl {
            return analysis::require_type_check(ctx, owner);
        }
        let loc = ctx.node(node).loc;
        ctx.error(DiagKind::Type, loc, "constant has no value".to_string());
        return Ok(());
    }

    let ty_n = if ty.is_defined() {
        type_of_type_expr(ctx, ty)?
    } else {
        ctx.basic_type(BasicType::I64)
    };
    let v = eval::eval_static_expr(ctx, value)?;
    ctx.enum_values.insert(node, v);
    ctx.set_type(node, ty_n);
    Ok(())
}

// ---- statements ----

fn check_stmt(ctx: &mut CompilationContext, stmt: AstIndex, fctx: &mut FuncCtx) -> Fallible<()> {
    if stmt.is_undef() {
        return Ok(());
    }
    let loc = ctx.node(stmt).loc;
    match ctx.node(stmt).data {
        AstData::Block { items, .. } => {
            for item in ctx.list(items) {
                match ctx.node(item).kind() {
                    AstKind::VarDecl
                    | AstKind::Alias
                    | AstKind::EnumDecl
                    | AstKind::EnumMember
                    | AstKind::StructDecl => analysis::require_type_check(ctx, item)?,
                    _ => check_stmt(ctx, item, fctx)?,
                }
            }
            Ok(())
        }
        AstData::IfStmt { condition, then_stmt, else_stmt } => {
            check_condition(ctx, condition)?;
            check_stmt(ctx, then_stmt, fctx)?;
            check_stmt(ctx, else_stmt, fctx)
        }
        AstData::WhileStmt { condition, body } => {
            check_condition(ctx, condition)?;
            fctx.loop_depth += 1;
            let result = check_stmt(ctx, body, fctx);
            fctx.loop_depth -= 1;
            result
        }
        AstData::ForStmt { init, condition, increment, body, .. } => {
            if init.is_defined() {
                if ctx.kind_of(init) == AstKind::VarDecl {
                    analysis::require_type_check(ctx, init)?;
                } else {
                    check_expr(ctx, init, AstIndex::UNDEF, false)?;
                }
            }
            if condition.is_defined() {
                check_condition(ctx, condition)?;
            }
            if increment.is_defined() {
                check_expr(ctx, increment, AstIndex::UNDEF, false)?;
            }
            fctx.loop_depth += 1;
            let result = check_stmt(ctx, body, fctx);
            fctx.loop_depth -= 1;
            result
        }
        AstData::ReturnStmt { value } => {
            let ret = fctx.return_type;
            let ret_is_void = basic_of(ctx, ret).is_some_and(|b| b.is_noreturn_or_void());
            if ret_is_void {
                if value.is_defined() {
                    ctx.error(
                        DiagKind::Type,
                        loc,
                        "cannot return a value from a void function".to_string(),
                    );
                }
                return Ok(());
            }
            if value.is_undef() {
                ctx.error(
                    DiagKind::Type,
                    loc,
                    format!("missing return value of type {}", type_name(ctx, ret)),
                );
                return Ok(());
            }
            let t = check_expr(ctx, value, ret, false)?;
            check_assignable(ctx, ret, t, value);
            Ok(())
        }
        AstData::BreakStmt | AstData::ContinueStmt => {
            if fctx.loop_depth == 0 {
                ctx.error(DiagKind::Type, loc, "break/continue outside of a loop".to_string());
            }
            Ok(())
        }
        AstData::VarDecl { .. }
        | AstData::Alias { .. }
        | AstData::EnumDecl { .. }
        | AstData::EnumMember { .. }
        | AstData::StructDecl { .. } => analysis::require_type_check(ctx, stmt),
        AstData::StaticIf { .. }
        | AstData::StaticVersion { .. }
        | AstData::StaticForeach { .. }
        | AstData::StaticAssert { .. } => Ok(()),
        _ => {
            check_expr(ctx, stmt, AstIndex::UNDEF, false)?;
            Ok(())
        }
    }
}

fn check_condition(ctx: &mut CompilationContext, condition: AstIndex) -> Fallible<()> {
    let bool_t = ctx.basic_type(BasicType::Bool);
    let t = check_expr(ctx, condition, bool_t, false)?;
    match basic_of(ctx, t) {
        Some(b) if b == BasicType::Bool || b.is_integer() => {}
        _ if is_error_type(ctx, t) => {}
        _ => {
            let loc = ctx.node(condition).loc;
            let message =
                format!("condition must be bool or integer, not {}", type_name(ctx, t));
            ctx.error(DiagKind::Type, loc, message);
        }
    }
    Ok(())
}

// ---- expressions ----

fn check_expr(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    parent_type: AstIndex,
    wants_callable: bool,
) -> Fallible<AstIndex> {
    if expr.is_undef() {
        return Ok(ctx.common.error_node);
    }
    let memo = ctx.get_type(expr);
    if memo.is_defined() {
        return Ok(memo);
    }
    let loc = ctx.node(expr).loc;

    let ty = match ctx.node(expr).data {
        AstData::ErrorNode => ctx.common.error_node,
        AstData::IntLiteral { value } => int_literal_type(ctx, value, parent_type),
        AstData::StringLiteral { .. } => ctx.common.u8_slice,
        AstData::BoolLiteral { .. } => ctx.basic_type(BasicType::Bool),
        AstData::NullLiteral => ctx.basic_type(BasicType::Null),
        AstData::NameUse { entity, .. } => {
            return check_name_use(ctx, expr, entity, parent_type, wants_callable);
        }
        AstData::MemberExpr { .. } => return check_member_expr(ctx, expr, parent_type),
        AstData::UnaryExpr { op, operand } => {
            return check_unary(ctx, expr, op, operand, parent_type);
        }
        AstData::BinaryExpr { op, left, right } => {
            return check_binary(ctx, expr, op, left, right, parent_type);
        }
        AstData::CallExpr { .. } => return check_call(ctx, expr, parent_type),
        AstData::IndexExpr { .. } => return check_index(ctx, expr, parent_type),
        AstData::CastExpr { ty, expr: inner } => {
            let target = type_of_type_expr(ctx, ty)?;
            let source = check_expr(ctx, inner, AstIndex::UNDEF, false)?;
            check_cast(ctx, loc, target, source);
            target
        }
        AstData::LiteralArray { .. } => {
            if ctx.node(expr).has_flag(flags::IS_ALIAS_ARRAY) {
                ctx.basic_type(BasicType::Alias)
            } else {
                ctx.error(
                    DiagKind::Type,
                    loc,
                    "array literal is only valid as an alias initializer".to_string(),
                );
                ctx.common.error_node
            }
        }
        AstData::TypeBasic { .. }
        | AstData::TypePtr { .. }
        | AstData::TypeSlice { .. }
        | AstData::TypeStaticArray { .. }
        | AstData::FunctionSignature { .. } => {
            type_of_type_expr(ctx, expr)?;
            ctx.node_mut(expr).set_flag(flags::IS_TYPE);
            ctx.basic_type(BasicType::Type)
        }
        _ => {
            ctx.error(DiagKind::Type, loc, "expression expected".to_string());
            ctx.common.error_node
        }
    };
    ctx.set_type(expr, ty);
    Ok(ty)
}

fn int_literal_type(ctx: &CompilationContext, value: u64, parent_type: AstIndex) -> AstIndex {
    if let Some(b) = basic_of(ctx, parent_type) {
        if b.is_integer() && int_fits(value, b) {
            return ctx.basic_type(b);
        }
    }
    if value > i64::MAX as u64 {
        ctx.basic_type(BasicType::U64)
    } else {
        ctx.basic_type(BasicType::I64)
    }
}

fn int_fits(value: u64, basic: BasicType) -> bool {
    match basic {
        BasicType::I8 => value <= i8::MAX as u64,
        BasicType::I16 => value <= i16::MAX as u64,
        BasicType::I32 => value <= i32::MAX as u64,
        BasicType::I64 => value <= i64::MAX as u64,
        BasicType::U8 => value <= u8::MAX as u64,
        BasicType::U16 => value <= u16::MAX as u64,
        BasicType::U32 => value <= u32::MAX as u64,
        BasicType::U64 => true,
        _ => false,
    }
}

fn check_name_use(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    entity: AstIndex,
    parent_type: AstIndex,
    wants_callable: bool,
) -> Fallible<AstIndex> {
    let loc = ctx.node(expr).loc;
    if entity.is_undef() || entity == ctx.common.error_node {
        ctx.set_type(expr, ctx.common.error_node);
        return Ok(ctx.common.error_node);
    }
    match ctx.node(entity).kind() {
        AstKind::VarDecl => {
            analysis::require_type_check(ctx, entity)?;
            let t = ctx.get_type(entity);
            ctx.node_mut(expr).set_flag(flags::IS_LVALUE);
            ctx.set_type(expr, t);
            Ok(t)
        }
        AstKind::EnumMember => {
            analysis::require_type_check(ctx, entity)?;
            let t = ctx.get_type(entity);
            ctx.set_type(expr, t);
            Ok(t)
        }
        AstKind::FunctionDecl => {
            if is_template(ctx, entity) {
                ctx.error(
                    DiagKind::Type,
                    loc,
                    "templated function requires explicit template arguments".to_string(),
                );
                ctx.set_type(expr, ctx.common.error_node);
                return Ok(ctx.common.error_node);
            }
            let signature = ensure_signature(ctx, entity)?;
            if wants_callable {
                ctx.set_type(expr, signature);
                return Ok(signature);
            }
            // a function name with no '(' becomes a paren-free call
            let data = ctx.node(expr).data;
            let callee = ctx.add_node(loc, data);
            ctx.set_type(callee, signature);
            ctx.node_mut(expr).data =
                AstData::CallExpr { callee, args: crate::arena::PoolSlice::EMPTY };
            check_expr(ctx, expr, parent_type, false)
        }
        AstKind::StructDecl | AstKind::EnumDecl => {
            ctx.node_mut(expr).set_flag(flags::IS_TYPE);
            let meta = ctx.basic_type(BasicType::Type);
            ctx.set_type(expr, meta);
            Ok(meta)
        }
        AstKind::BuiltinFunc => {
            ctx.error(
                DiagKind::Type,
                loc,
                "built-in function requires an argument list".to_string(),
            );
            ctx.set_type(expr, ctx.common.error_node);
            Ok(ctx.common.error_node)
        }
        _ => {
            ctx.error(DiagKind::Type, loc, "name does not denote a value".to_string());
            ctx.set_type(expr, ctx.common.error_node);
            Ok(ctx.common.error_node)
        }
    }
}

fn check_member_expr(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    _parent_type: AstIndex,
) -> Fallible<AstIndex> {
    let AstData::MemberExpr { object, member, .. } = ctx.node(expr).data else {
        return Ok(ctx.common.error_node);
    };
    let loc = ctx.node(expr).loc;

    // scoped enum member access: Color.red
    if let AstData::NameUse { entity, .. } = ctx.node(object).data {
        if entity.is_defined() && ctx.kind_of(entity) == AstKind::EnumDecl {
            analysis::require_type_check(ctx, entity)?;
            let AstData::EnumDecl { scope, .. } = ctx.node(entity).data else { unreachable!() };
            let Some(&member_node) = ctx.scope(scope).symbols.get(&member) else {
                let message = format!(
                    "enum '{}' has no member '{}'",
                    describe_decl(ctx, entity),
                    ctx.name(member)
                );
                ctx.error(DiagKind::Type, loc, message);
                ctx.set_type(expr, ctx.common.error_node);
                return Ok(ctx.common.error_node);
            };
            let position = ctx
                .scope(scope)
                .symbols
                .get_index_of(&member)
                .unwrap_or(0) as u32;
            if let AstData::MemberExpr { entity: slot, member_index, .. } =
                &mut ctx.node_mut(expr).data
            {
                *slot = member_node;
                *member_index = position;
            }
            ctx.set_type(expr, entity);
            return Ok(entity);
        }
    }

    let object_t = check_expr(ctx, object, AstIndex::UNDEF, false)?;
    if is_error_type(ctx, object_t) {
        ctx.set_type(expr, ctx.common.error_node);
        return Ok(ctx.common.error_node);
    }

    // auto-deref through a pointer receiver
    let (base_t, derefed) = match ctx.node(object_t).data {
        AstData::TypePtr { target } => (target, true),
        _ => (object_t, false),
    };
    if derefed {
        ctx.node_mut(expr).set_flag(flags::NEEDS_DEREF);
    }

    match ctx.node(base_t).data {
        AstData::StructDecl { scope, .. } => {
            let Some(&member_node) = ctx.scope(scope).symbols.get(&member) else {
                let message = format!(
                    "struct '{}' has no member '{}'",
                    describe_decl(ctx, base_t),
                    ctx.name(member)
                );
                ctx.error(DiagKind::Type, loc, message);
                ctx.set_type(expr, ctx.common.error_node);
                return Ok(ctx.common.error_node);
            };
            match ctx.node(member_node).kind() {
                AstKind::VarDecl => {
                    analysis::require_type_check(ctx, member_node)?;
                    let field_index = struct_fields(ctx, base_t)
                        .iter()
                        .position(|&f| f == member_node)
                        .unwrap_or(0) as u32;
                    let t = ctx.get_type(member_node);
                    if let AstData::MemberExpr { entity: slot, member_index, .. } =
                        &mut ctx.node_mut(expr).data
                    {
                        *slot = member_node;
                        *member_index = field_index;
                    }
                    ctx.node_mut(expr).set_flag(flags::IS_LVALUE);
                    ctx.set_type(expr, t);
                    Ok(t)
                }
                AstKind::FunctionDecl => {
                    let signature = ensure_signature(ctx, member_node)?;
                    if let AstData::MemberExpr { entity: slot, .. } = &mut ctx.node_mut(expr).data
                    {
                        *slot = member_node;
                    }
                    ctx.set_type(expr, signature);
                    Ok(signature)
                }
                _ => {
                    ctx.error(DiagKind::Type, loc, "member is not accessible".to_string());
                    ctx.set_type(expr, ctx.common.error_node);
                    Ok(ctx.common.error_node)
                }
            }
        }
        AstData::TypeSlice { element } => {
            synth_seq_member(ctx, expr, loc, member, element, false)
        }
        AstData::TypeStaticArray { element, .. } => {
            synth_seq_member(ctx, expr, loc, member, element, true)
        }
        _ => {
            let message =
                format!("type {} has no members", type_name(ctx, base_t));
            ctx.error(DiagKind::Type, loc, message);
            ctx.set_type(expr, ctx.common.error_node);
            Ok(ctx.common.error_node)
        }
    }
}

/// Synthesized `length` / `ptr` members on slices and static arrays.
fn synth_seq_member(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    loc: SourceLoc,
    member: crate::interner::Ident,
    element: AstIndex,
    _is_array: bool,
) -> Fallible<AstIndex> {
    use crate::interner::known;
    let (index, t) = if member == known::LENGTH {
        (builtin_member::LENGTH, ctx.basic_type(BasicType::U64))
    } else if member == known::PTR {
        (builtin_member::PTR, ptr_type(ctx, element))
    } else {
        let message = format!("no member '{}' on slices or arrays", ctx.name(member));
        ctx.error(DiagKind::Type, loc, message);
        ctx.set_type(expr, ctx.common.error_node);
        return Ok(ctx.common.error_node);
    };
    if let AstData::MemberExpr { member_index, .. } = &mut ctx.node_mut(expr).data {
        *member_index = index;
    }
    ctx.set_type(expr, t);
    Ok(t)
}

fn check_unary(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    op: UnOp,
    operand: AstIndex,
    parent_type: AstIndex,
) -> Fallible<AstIndex> {
    let loc = ctx.node(expr).loc;
    let ty = match op {
        UnOp::AddrOf => {
            let t = check_expr(ctx, operand, AstIndex::UNDEF, true)?;
            if !ctx.node(operand).has_flag(flags::IS_LVALUE)
                && ctx.kind_of(operand) != AstKind::CallExpr
            {
                // function designators are not lvalues but may be addressed
                let is_function = matches!(ctx.node(t).data, AstData::FunctionSignature { .. });
                if !is_function && !is_error_type(ctx, t) {
                    ctx.error(
                        DiagKind::Type,
                        loc,
                        "cannot take the address of a non-lvalue".to_string(),
                    );
                }
            }
            mark_address_taken(ctx, operand);
            ptr_type(ctx, t)
        }
        UnOp::Deref => {
            let t = check_expr(ctx, operand, AstIndex::UNDEF, false)?;
            match ctx.node(t).data {
                AstData::TypePtr { target } => {
                    ctx.node_mut(expr).set_flag(flags::IS_LVALUE);
                    target
                }
                _ if is_error_type(ctx, t) => ctx.common.error_node,
                _ => {
                    let message =
                        format!("cannot dereference a value of type {}", type_name(ctx, t));
                    ctx.error(DiagKind::Type, loc, message);
                    ctx.common.error_node
                }
            }
        }
        UnOp::Neg => {
            let t = check_expr(ctx, operand, parent_type, false)?;
            expect_integer(ctx, loc, t, "negation")
        }
        UnOp::BitNot => {
            let t = check_expr(ctx, operand, parent_type, false)?;
            expect_integer(ctx, loc, t, "bitwise not")
        }
        UnOp::Not => {
            let bool_t = ctx.basic_type(BasicType::Bool);
            let t = check_expr(ctx, operand, bool_t, false)?;
            match basic_of(ctx, t) {
                Some(BasicType::Bool) => bool_t,
                _ if is_error_type(ctx, t) => ctx.common.error_node,
                _ => {
                    let message =
                        format!("logical not expects bool, not {}", type_name(ctx, t));
                    ctx.error(DiagKind::Type, loc, message);
                    ctx.common.error_node
                }
            }
        }
    };
    ctx.set_type(expr, ty);
    Ok(ty)
}

fn check_binary(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    op: BinOp,
    left: AstIndex,
    right: AstIndex,
    parent_type: AstIndex,
) -> Fallible<AstIndex> {
    let loc = ctx.node(expr).loc;

    if op == BinOp::Assign {
        let lt = check_expr(ctx, left, AstIndex::UNDEF, false)?;
        if !ctx.node(left).has_flag(flags::IS_LVALUE) && !is_error_type(ctx, lt) {
            ctx.error(DiagKind::Type, loc, "left side of assignment is not an lvalue".to_string());
        }
        let rt = check_expr(ctx, right, lt, false)?;
        check_assignable(ctx, lt, rt, right);
        let void_t = ctx.basic_type(BasicType::Void);
        ctx.set_type(expr, void_t);
        return Ok(void_t);
    }

    if op.is_logic() {
        let bool_t = ctx.basic_type(BasicType::Bool);
        for side in [left, right] {
            let t = check_expr(ctx, side, bool_t, false)?;
            if basic_of(ctx, t) != Some(BasicType::Bool) && !is_error_type(ctx, t) {
                let message = format!(
                    "operands of '{}' must be bool, not {}",
                    op.symbol(),
                    type_name(ctx, t)
                );
                let sloc = ctx.node(side).loc;
                ctx.error(DiagKind::Type, sloc, message);
            }
        }
        ctx.set_type(expr, bool_t);
        return Ok(bool_t);
    }

    // bias literal operands toward the other side's type
    let (lt, rt) = if ctx.kind_of(left) == AstKind::IntLiteral
        && ctx.kind_of(right) != AstKind::IntLiteral
    {
        let rt = check_expr(ctx, right, parent_type, false)?;
        let lt = check_expr(ctx, left, rt, false)?;
        (lt, rt)
    } else {
        let lt = check_expr(ctx, left, parent_type, false)?;
        let rt = check_expr(ctx, right, lt, false)?;
        (lt, rt)
    };
    if is_error_type(ctx, lt) || is_error_type(ctx, rt) {
        ctx.set_type(expr, ctx.common.error_node);
        return Ok(ctx.common.error_node);
    }

    if op.is_comparison() {
        let ok = unify_operands(ctx, lt, rt).is_some()
            || (is_pointer(ctx, lt) && is_pointer(ctx, rt))
            || (is_pointer(ctx, lt) && is_null(ctx, rt))
            || (is_null(ctx, lt) && is_pointer(ctx, rt));
        if !ok {
            let message = format!(
                "cannot compare {} with {}",
                type_name(ctx, lt),
                type_name(ctx, rt)
            );
            ctx.error(DiagKind::Type, loc, message);
        }
        let bool_t = ctx.basic_type(BasicType::Bool);
        ctx.set_type(expr, bool_t);
        return Ok(bool_t);
    }

    // pointer arithmetic: ptr ± integer
    if is_pointer(ctx, lt)
        && matches!(op, BinOp::Add | BinOp::Sub)
        && basic_of(ctx, rt).is_some_and(|b| b.is_integer())
    {
        ctx.set_type(expr, lt);
        return Ok(lt);
    }

    if matches!(op, BinOp::Shl | BinOp::Shr) {
        let lt_ok = expect_integer(ctx, loc, lt, op.symbol());
        expect_integer(ctx, loc, rt, op.symbol());
        ctx.set_type(expr, lt_ok);
        return Ok(lt_ok);
    }

    let ty = match unify_operands(ctx, lt, rt) {
        Some(t) if basic_of(ctx, t).is_some_and(|b| b.is_integer()) => t,
        _ => {
            let message = format!(
                "incompatible types {} and {} in '{}'",
                type_name(ctx, lt),
                type_name(ctx, rt),
                op.symbol()
            );
            ctx.error(DiagKind::Type, loc, message);
            ctx.common.error_node
        }
    };
    ctx.set_type(expr, ty);
    Ok(ty)
}

/// Unify two operand types for arithmetic or comparison: identical types,
/// or integer widening within the same signedness.
fn unify_operands(ctx: &CompilationContext, lt: AstIndex, rt: AstIndex) -> Option<AstIndex> {
    if same_type(ctx, lt, rt) {
        return Some(lt);
    }
    let (lb, rb) = (basic_of(ctx, lt)?, basic_of(ctx, rt)?);
    if lb.is_integer() && rb.is_integer() && lb.is_signed() == rb.is_signed() {
        return Some(if lb.size() >= rb.size() { lt } else { rt });
    }
    None
}

fn check_call(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    _parent_type: AstIndex,
) -> Fallible<AstIndex> {
    let AstData::CallExpr { callee, args } = ctx.node(expr).data else {
        return Ok(ctx.common.error_node);
    };
    let loc = ctx.node(expr).loc;

    // built-in $functions fold to constants here
    if let AstData::NameUse { entity, .. } = ctx.node(callee).data {
        if entity.is_defined() {
            if let AstData::BuiltinFunc { func } = ctx.node(entity).data {
                return fold_builtin_call(ctx, expr, func, args);
            }
        }
    }

    // a method call carries its receiver as the hidden first argument; the
    // member entity is only known once the callee has been checked
    let mut receiver = AstIndex::UNDEF;
    if ctx.kind_of(callee) == AstKind::MemberExpr {
        check_expr(ctx, callee, AstIndex::UNDEF, true)?;
        if let AstData::MemberExpr { object, entity, .. } = ctx.node(callee).data {
            if entity.is_defined() && ctx.kind_of(entity) == AstKind::FunctionDecl {
                receiver = object;
            }
        }
    }

    let callee_t = check_expr(ctx, callee, AstIndex::UNDEF, true)?;
    if is_error_type(ctx, callee_t) {
        ctx.set_type(expr, ctx.common.error_node);
        return Ok(ctx.common.error_node);
    }
    let signature = match ctx.node(callee_t).data {
        AstData::FunctionSignature { .. } => callee_t,
        AstData::TypePtr { target }
            if matches!(ctx.node(target).data, AstData::FunctionSignature { .. }) =>
        {
            target
        }
        _ => {
            let message =
                format!("expression of type {} is not callable", type_name(ctx, callee_t));
            ctx.error(DiagKind::Type, loc, message);
            ctx.set_type(expr, ctx.common.error_node);
            return Ok(ctx.common.error_node);
        }
    };

    let AstData::FunctionSignature { return_type, params } = ctx.node(signature).data else {
        unreachable!()
    };
    let params: Vec<AstIndex> = ctx.list(params);
    let args: Vec<AstIndex> = ctx.list(args);

    // hidden `this` occupies the first parameter slot of a method
    let fixed: Vec<AstIndex> = if receiver.is_defined() {
        params.get(1..).unwrap_or(&[]).to_vec()
    } else {
        params.clone()
    };

    let variadic = fixed
        .last()
        .is_some_and(|&p| ctx.node(p).has_flag(flags::IS_VARIADIC_PARAM));

    let max_args = if variadic { usize::MAX } else { fixed.len() };
    if args.len() > max_args {
        let message = format!(
            "wrong argument count: expected at most {}, got {}",
            fixed.len(),
            args.len()
        );
        ctx.error(DiagKind::Type, loc, message);
    }

    for (i, &param) in fixed.iter().enumerate() {
        analysis::require_type_check(ctx, param)?;
        let param_t = ctx.get_type(param);
        if i < args.len() {
            let arg_t = check_expr(ctx, args[i], param_t, false)?;
            check_assignable(ctx, param_t, arg_t, args[i]);
        } else {
            let AstData::VarDecl { initializer, .. } = ctx.node(param).data else { continue };
            let is_variadic = ctx.node(param).has_flag(flags::IS_VARIADIC_PARAM);
            if initializer.is_undef() && !is_variadic {
                let message = format!(
                    "wrong argument count: expected {}, got {} and parameter {} has no default",
                    fixed.len(),
                    args.len(),
                    i + 1
                );
                ctx.error(DiagKind::Type, loc, message);
                break;
            }
        }
    }
    // extra variadic arguments are checked as-is
    if variadic {
        for &arg in args.iter().skip(fixed.len()) {
            check_expr(ctx, arg, AstIndex::UNDEF, false)?;
        }
    }

    if receiver.is_defined() {
        // the receiver is spilled to memory if needed by IR gen; here it
        // only must be addressable
        mark_address_taken(ctx, receiver);
    }

    ctx.set_type(expr, return_type);
    Ok(return_type)
}

fn fold_builtin_call(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    func: BuiltinFn,
    args: crate::arena::PoolSlice,
) -> Fallible<AstIndex> {
    let loc = ctx.node(expr).loc;
    let args = ctx.list(args);
    if args.len() != 1 {
        ctx.error(
            DiagKind::Type,
            loc,
            "built-in function expects exactly one type argument".to_string(),
        );
        ctx.set_type(expr, ctx.common.error_node);
        return Ok(ctx.common.error_node);
    }
    let ty = type_of_type_expr(ctx, args[0])?;
    let value = match func {
        BuiltinFn::SizeOf => size_of(ctx, ty),
        BuiltinFn::AlignOf => align_of(ctx, ty),
    };
    ctx.node_mut(expr).data = AstData::IntLiteral { value };
    let u64_t = ctx.basic_type(BasicType::U64);
    ctx.set_type(expr, u64_t);
    Ok(u64_t)
}

fn check_index(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    _parent_type: AstIndex,
) -> Fallible<AstIndex> {
    let AstData::IndexExpr { base, indices } = ctx.node(expr).data else {
        return Ok(ctx.common.error_node);
    };
    let loc = ctx.node(expr).loc;

    // `T[N]` — a static array type written in expression position
    if ctx.node(base).is_type_expr() || is_type_name_use(ctx, base) {
        return Ok(rewrite_static_array(ctx, expr, base, indices)?);
    }

    let base_t = check_expr(ctx, base, AstIndex::UNDEF, false)?;
    let indices = ctx.list(indices);
    if indices.len() != 1 {
        ctx.error(DiagKind::Type, loc, "indexing expects exactly one index".to_string());
        ctx.set_type(expr, ctx.common.error_node);
        return Ok(ctx.common.error_node);
    }
    let u64_t = ctx.basic_type(BasicType::U64);
    let it = check_expr(ctx, indices[0], u64_t, false)?;
    if !basic_of(ctx, it).is_some_and(|b| b.is_integer()) && !is_error_type(ctx, it) {
        let message = format!("index must be an integer, not {}", type_name(ctx, it));
        let iloc = ctx.node(indices[0]).loc;
        ctx.error(DiagKind::Type, iloc, message);
    }

    let elem = match ctx.node(base_t).data {
        AstData::TypeSlice { element } => element,
        AstData::TypeStaticArray { element, .. } => element,
        AstData::TypePtr { target } => target,
        _ if is_error_type(ctx, base_t) => ctx.common.error_node,
        _ => {
            let message = format!("type {} cannot be indexed", type_name(ctx, base_t));
            ctx.error(DiagKind::Type, loc, message);
            ctx.common.error_node
        }
    };
    ctx.node_mut(expr).set_flag(flags::IS_LVALUE);
    ctx.set_type(expr, elem);
    Ok(elem)
}

fn is_type_name_use(ctx: &CompilationContext, node: AstIndex) -> bool {
    match ctx.node(node).data {
        AstData::NameUse { entity, .. } if entity.is_defined() => {
            matches!(ctx.node(entity).kind(), AstKind::StructDecl | AstKind::EnumDecl)
        }
        _ => false,
    }
}

fn rewrite_static_array(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    base: AstIndex,
    indices: crate::arena::PoolSlice,
) -> Fallible<AstIndex> {
    let loc = ctx.node(expr).loc;
    let indices = ctx.list(indices);
    if indices.len() != 1 {
        ctx.error(DiagKind::Type, loc, "a static array type takes one length".to_string());
        ctx.set_type(expr, ctx.common.error_node);
        return Ok(ctx.common.error_node);
    }
    let element = type_of_type_expr(ctx, base)?;
    let length = eval::eval_static_expr(ctx, indices[0])? as u64;
    ctx.node_mut(expr).data =
        AstData::TypeStaticArray { element, length_expr: indices[0], length };
    ctx.node_mut(expr).set_flag(flags::IS_TYPE);
    let meta = ctx.basic_type(BasicType::Type);
    ctx.set_type(expr, meta);
    Ok(meta)
}

fn check_cast(ctx: &mut CompilationContext, loc: SourceLoc, target: AstIndex, source: AstIndex) {
    if is_error_type(ctx, target) || is_error_type(ctx, source) {
        return;
    }
    let ok = {
        let tb = basic_of(ctx, target);
        let sb = basic_of(ctx, source);
        let t_int = tb.is_some_and(|b| b.is_integer());
        let s_int = sb.is_some_and(|b| b.is_integer());
        let t_ptr = is_pointer(ctx, target);
        let s_ptr = is_pointer(ctx, source);
        let t_enum = ctx.kind_of(target) == AstKind::EnumDecl;
        let s_enum = ctx.kind_of(source) == AstKind::EnumDecl;
        let s_slice = matches!(ctx.node(source).data, AstData::TypeSlice { .. });
        let s_bool = sb == Some(BasicType::Bool);

        (t_int && (s_int || s_ptr || s_enum || s_bool))
            || (t_ptr && (s_ptr || s_int || s_slice))
            || (t_enum && s_int)
            || same_type(ctx, target, source)
    };
    if !ok {
        let message = format!(
            "invalid cast from {} to {}",
            type_name(ctx, source),
            type_name(ctx, target)
        );
        ctx.error(DiagKind::Type, loc, message);
    }
}

fn expect_integer(
    ctx: &mut CompilationContext,
    loc: SourceLoc,
    t: AstIndex,
    what: &str,
) -> AstIndex {
    match basic_of(ctx, t) {
        Some(b) if b.is_integer() => t,
        _ if is_error_type(ctx, t) => ctx.common.error_node,
        _ => {
            let message = format!("'{}' expects an integer, not {}", what, type_name(ctx, t));
            ctx.error(DiagKind::Type, loc, message);
            ctx.common.error_node
        }
    }
}

/// Record on the underlying declaration that its address escapes, so IR
/// generation gives it a stack slot instead of an SSA variable.
fn mark_address_taken(ctx: &mut CompilationContext, expr: AstIndex) {
    match ctx.node(expr).data {
        AstData::NameUse { entity, .. } if entity.is_defined() => {
            if ctx.kind_of(entity) == AstKind::VarDecl {
                ctx.node_mut(entity).set_flag(flags::IS_ADDRESS_TAKEN);
            }
        }
        AstData::MemberExpr { object, .. } => mark_address_taken(ctx, object),
        AstData::IndexExpr { base, .. } => mark_address_taken(ctx, base),
        AstData::UnaryExpr { op: UnOp::Deref, .. } => {}
        _ => {}
    }
}

// ---- assignability ----

pub fn check_assignable(
    ctx: &mut CompilationContext,
    to: AstIndex,
    from: AstIndex,
    from_node: AstIndex,
) {
    if assignable(ctx, to, from, from_node) {
        return;
    }
    let loc = ctx.node(from_node).loc;
    let message = format!(
        "incompatible types: cannot use {} where {} is expected",
        type_name(ctx, from),
        type_name(ctx, to)
    );
    ctx.error(DiagKind::Type, loc, message);
}

fn assignable(
    ctx: &CompilationContext,
    to: AstIndex,
    from: AstIndex,
    from_node: AstIndex,
) -> bool {
    if is_error_type(ctx, to) || is_error_type(ctx, from) {
        return true;
    }
    if same_type(ctx, to, from) {
        return true;
    }
    // null into any pointer or slice
    if is_null(ctx, from)
        && (is_pointer(ctx, to) || matches!(ctx.node(to).data, AstData::TypeSlice { .. }))
    {
        return true;
    }
    if let (Some(tb), Some(fb)) = (basic_of(ctx, to), basic_of(ctx, from)) {
        if tb.is_integer() && fb.is_integer() {
            // a literal with a known value converts when it fits
            if let AstData::IntLiteral { value } = ctx.node(from_node).data {
                if int_fits(value, tb) {
                    return true;
                }
            }
            // implicit widening within one signedness
            if tb.is_signed() == fb.is_signed() && tb.size() >= fb.size() {
                return true;
            }
        }
    }
    // an enum value converts to its base type implicitly
    if let AstData::EnumDecl { base_type, .. } = ctx.node(from).data {
        if same_type(ctx, to, base_type) {
            return true;
        }
    }
    false
}

// ---- type algebra ----

/// Normalize a type expression to its canonical node, validating that it
/// denotes a type at all.
pub fn type_of_type_expr(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<AstIndex> {
    if node.is_undef() {
        return Ok(ctx.common.error_node);
    }
    let loc = ctx.node(node).loc;
    match ctx.node(node).data {
        AstData::ErrorNode => Ok(ctx.common.error_node),
        AstData::TypeBasic { basic } => Ok(ctx.basic_type(basic)),
        AstData::TypePtr { target } => {
            let t = type_of_type_expr(ctx, target)?;
            if let AstData::TypePtr { target: slot } = &mut ctx.node_mut(node).data {
                *slot = t;
            }
            Ok(node)
        }
        AstData::TypeSlice { element } => {
            let t = type_of_type_expr(ctx, element)?;
            if let AstData::TypeSlice { element: slot } = &mut ctx.node_mut(node).data {
                *slot = t;
            }
            Ok(node)
        }
        AstData::TypeStaticArray { element, length_expr, length } => {
            let t = type_of_type_expr(ctx, element)?;
            let len = if length == 0 && length_expr.is_defined() {
                eval::eval_static_expr(ctx, length_expr)? as u64
            } else {
                length
            };
            if let AstData::TypeStaticArray { element: slot, length: lslot, .. } =
                &mut ctx.node_mut(node).data
            {
                *slot = t;
                *lslot = len;
            }
            Ok(node)
        }
        AstData::FunctionSignature { return_type, params } => {
            let ret = type_of_type_expr(ctx, return_type)?;
            if let AstData::FunctionSignature { return_type: slot, .. } =
                &mut ctx.node_mut(node).data
            {
                *slot = ret;
            }
            for param in ctx.list(params) {
                analysis::require_type_check(ctx, param)?;
            }
            Ok(node)
        }
        AstData::StructDecl { .. } | AstData::EnumDecl { .. } => Ok(node),
        AstData::NameUse { entity, .. } => {
            if entity.is_undef() {
                analysis::require_name_resolve(ctx, node)?;
            }
            match ctx.node(node).data {
                AstData::NameUse { entity, .. } => match ctx.node(entity).kind() {
                    AstKind::StructDecl if is_template(ctx, entity) => {
                        ctx.error(
                            DiagKind::Type,
                            loc,
                            "templated struct requires explicit template arguments".to_string(),
                        );
                        Ok(ctx.common.error_node)
                    }
                    AstKind::StructDecl | AstKind::EnumDecl => Ok(entity),
                    AstKind::ErrorNode => Ok(ctx.common.error_node),
                    _ => {
                        ctx.error(
                            DiagKind::Type,
                            loc,
                            "name does not denote a type".to_string(),
                        );
                        Ok(ctx.common.error_node)
                    }
                },
                // resolution substituted the use by a type node
                _ => type_of_type_expr(ctx, node),
            }
        }
        AstData::IndexExpr { base, indices } => {
            rewrite_static_array(ctx, node, base, indices)?;
            if matches!(ctx.node(node).data, AstData::TypeStaticArray { .. }) {
                Ok(node)
            } else {
                Ok(ctx.common.error_node)
            }
        }
        _ => {
            ctx.error(DiagKind::Type, loc, "expression is not a type".to_string());
            Ok(ctx.common.error_node)
        }
    }
}

/// Structural type equality after normalization and alias folding.
pub fn same_type(ctx: &CompilationContext, a: AstIndex, b: AstIndex) -> bool {
    if a == b {
        return true;
    }
    if a.is_undef() || b.is_undef() {
        return false;
    }
    match (&ctx.node(a).data, &ctx.node(b).data) {
        (AstData::TypeBasic { basic: x }, AstData::TypeBasic { basic: y }) => x == y,
        (AstData::TypePtr { target: x }, AstData::TypePtr { target: y }) => {
            same_type(ctx, *x, *y)
        }
        (AstData::TypeSlice { element: x }, AstData::TypeSlice { element: y }) => {
            same_type(ctx, *x, *y)
        }
        (
            AstData::TypeStaticArray { element: x, length: lx, .. },
            AstData::TypeStaticArray { element: y, length: ly, .. },
        ) => lx == ly && same_type(ctx, *x, *y),
        (
            AstData::FunctionSignature { return_type: rx, params: px },
            AstData::FunctionSignature { return_type: ry, params: py },
        ) => {
            if !same_type(ctx, *rx, *ry) || px.len != py.len {
                return false;
            }
            let px = ctx.arrays.get(*px).to_vec();
            let py = ctx.arrays.get(*py).to_vec();
            px.iter().zip(py.iter()).all(|(&p, &q)| {
                same_type(ctx, ctx.get_type(p), ctx.get_type(q))
            })
        }
        _ => false,
    }
}

fn is_template(ctx: &CompilationContext, decl: AstIndex) -> bool {
    match ctx.node(decl).data {
        AstData::StructDecl { template_params, .. }
        | AstData::FunctionDecl { template_params, .. } => !template_params.is_empty(),
        _ => false,
    }
}

pub fn is_error_type(ctx: &CompilationContext, t: AstIndex) -> bool {
    t.is_undef() || t == ctx.common.error_node || ctx.kind_of(t) == AstKind::ErrorNode
}

pub fn basic_of(ctx: &CompilationContext, t: AstIndex) -> Option<BasicType> {
    if t.is_undef() {
        return None;
    }
    match ctx.node(t).data {
        AstData::TypeBasic { basic } => Some(basic),
        _ => None,
    }
}

pub fn is_pointer(ctx: &CompilationContext, t: AstIndex) -> bool {
    t.is_defined() && matches!(ctx.node(t).data, AstData::TypePtr { .. })
}

fn is_null(ctx: &CompilationContext, t: AstIndex) -> bool {
    basic_of(ctx, t) == Some(BasicType::Null)
}

/// Fresh pointer-type node. Created during checking, shared thereafter via
/// the node's computed type.
pub fn ptr_type(ctx: &mut CompilationContext, target: AstIndex) -> AstIndex {
    let node = ctx.add_node(SourceLoc::default(), AstData::TypePtr { target });
    ctx.node_mut(node).set_flag(flags::IS_TYPE);
    node
}

pub fn type_name(ctx: &CompilationContext, t: AstIndex) -> String {
    if t.is_undef() {
        return "<undefined>".to_string();
    }
    match ctx.node(t).data {
        AstData::ErrorNode => "<error>".to_string(),
        AstData::TypeBasic { basic } => basic.name().to_string(),
        AstData::TypePtr { target } => format!("{}*", type_name(ctx, target)),
        AstData::TypeSlice { element } => format!("{}[]", type_name(ctx, element)),
        AstData::TypeStaticArray { element, length, .. } => {
            format!("{}[{}]", type_name(ctx, element), length)
        }
        AstData::FunctionSignature { return_type, .. } => {
            format!("{} function(...)", type_name(ctx, return_type))
        }
        AstData::StructDecl { name, .. } | AstData::EnumDecl { name, .. } => {
            if name.is_defined() {
                ctx.name(name).to_string()
            } else {
                "<anonymous>".to_string()
            }
        }
        _ => "<not a type>".to_string(),
    }
}

fn describe_decl(ctx: &CompilationContext, decl: AstIndex) -> String {
    ctx.node(decl)
        .decl_name()
        .map(|id| ctx.name(id).to_string())
        .unwrap_or_else(|| "<anonymous>".to_string())
}

// ---- layout ----

pub fn size_of(ctx: &mut CompilationContext, t: AstIndex) -> u64 {
    let mut active = Vec::new();
    size_of_inner(ctx, t, &mut active)
}

fn size_of_inner(ctx: &mut CompilationContext, t: AstIndex, active: &mut Vec<AstIndex>) -> u64 {
    if t.is_undef() {
        return 0;
    }
    match ctx.node(t).data {
        AstData::TypeBasic { basic } => basic.size() as u64,
        AstData::TypePtr { .. } | AstData::FunctionSignature { .. } => 8,
        AstData::TypeSlice { .. } => 16,
        AstData::TypeStaticArray { element, length, .. } => {
            length * size_of_inner(ctx, element, active)
        }
        AstData::EnumDecl { base_type, .. } => size_of_inner(ctx, base_type, active),
        AstData::StructDecl { .. } => struct_layout(ctx, t, active).0,
        _ => 0,
    }
}

pub fn align_of(ctx: &mut CompilationContext, t: AstIndex) -> u64 {
    if t.is_undef() {
        return 1;
    }
    match ctx.node(t).data {
        AstData::TypeBasic { basic } => (basic.size() as u64).max(1),
        AstData::TypePtr { .. } | AstData::TypeSlice { .. } | AstData::FunctionSignature { .. } => 8,
        AstData::TypeStaticArray { element, .. } => align_of(ctx, element),
        AstData::EnumDecl { base_type, .. } => align_of(ctx, base_type),
        AstData::StructDecl { .. } => {
            let mut active = Vec::new();
            struct_layout(ctx, t, &mut active).1
        }
        _ => 1,
    }
}

/// The field declarations of a struct, in order.
pub fn struct_fields(ctx: &CompilationContext, decl: AstIndex) -> Vec<AstIndex> {
    let AstData::StructDecl { members, .. } = ctx.node(decl).data else { return Vec::new() };
    ctx.arrays
        .get(members)
        .iter()
        .copied()
        .filter(|&m| ctx.kind_of(m) == AstKind::VarDecl)
        .collect()
}

/// (size, align, per-field offsets). Union members all sit at offset zero.
pub fn struct_layout_full(
    ctx: &mut CompilationContext,
    decl: AstIndex,
) -> (u64, u64, Vec<u64>) {
    let mut active = Vec::new();
    let fields = struct_fields(ctx, decl);
    let is_union = ctx.node(decl).has_flag(flags::IS_UNION);
    let mut offsets = Vec::with_capacity(fields.len());
    let mut offset = 0u64;
    let mut align = 1u64;
    let mut max_size = 0u64;
    for field in fields {
        let ft = ctx.get_type(field);
        let fsize = size_of_inner(ctx, ft, &mut active);
        let falign = align_of(ctx, ft).max(1);
        align = align.max(falign);
        if is_union {
            offsets.push(0);
            max_size = max_size.max(fsize);
        } else {
            offset = offset.next_multiple_of(falign);
            offsets.push(offset);
            offset += fsize;
        }
    }
    let raw = if is_union { max_size } else { offset };
    let size = raw.next_multiple_of(align);
    (size, align, offsets)
}

fn struct_layout(
    ctx: &mut CompilationContext,
    decl: AstIndex,
    active: &mut Vec<AstIndex>,
) -> (u64, u64) {
    if active.contains(&decl) {
        let loc = ctx.node(decl).loc;
        let message = format!("struct '{}' has infinite size", describe_decl(ctx, decl));
        ctx.error(DiagKind::Type, loc, message);
        return (0, 1);
    }
    active.push(decl);
    let fields = struct_fields(ctx, decl);
    let is_union = ctx.node(decl).has_flag(flags::IS_UNION);
    let mut offset = 0u64;
    let mut align = 1u64;
    let mut max_size = 0u64;
    for field in fields {
        let ft = ctx.get_type(field);
        let fsize = size_of_inner(ctx, ft, active);
        let falign = align_of(ctx, ft).max(1);
        align = align.max(falign);
        if is_union {
            max_size = max_size.max(fsize);
        } else {
            offset = offset.next_multiple_of(falign) + fsize;
        }
    }
    active.pop();
    let raw = if is_union { max_size } else { offset };
    ((raw.next_multiple_of(align)), align)
}

/// Aggregates: structs, unions, slices and static arrays.
pub fn is_aggregate(ctx: &CompilationContext, t: AstIndex) -> bool {
    t.is_defined()
        && matches!(
            ctx.node(t).data,
            AstData::StructDecl { .. }
                | AstData::TypeSlice { .. }
                | AstData::TypeStaticArray { .. }
        )
}

/// Aggregates above eight bytes are passed by pointer.
pub fn is_pass_by_ptr(ctx: &mut CompilationContext, t: AstIndex) -> bool {
    is_aggregate(ctx, t) && size_of(ctx, t) > 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;

    fn check(source: &str) -> CompilationContext {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let file = ctx.add_file("test.mica", source);
        let module = crate::parser::parse_module_file(&mut ctx, file);
        ctx.add_module(module, file);
        let _ = analysis::require_type_check(&mut ctx, module);
        ctx
    }

    fn type_errors(ctx: &CompilationContext) -> Vec<String> {
        ctx.diagnostics
            .iter()
            .filter(|d| d.kind == DiagKind::Type)
            .map(|d| d.message.clone())
            .collect()
    }

    #[test]
    fn test_literal_coerces_to_declared_type() {
        let ctx = check("module m;\ni32 x = 3;\nu8 y = 200;\n");
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
    }

    #[test]
    fn test_literal_too_large_rejected() {
        let ctx = check("module m;\nu8 y = 300;\n");
        let errors = type_errors(&ctx);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("u8"));
    }

    #[test]
    fn test_signed_unsigned_mixing_rejected() {
        let ctx = check(
            "module m;\n\
             void f(i32 a, u32 b) { i32 c = a; u32 d = b; i64 e = a + b; }\n",
        );
        let errors = type_errors(&ctx);
        assert_eq!(errors.len(), 1, "{:?}", errors);
        assert!(errors[0].contains("incompatible"));
    }

    #[test]
    fn test_widening_same_signedness_ok() {
        let ctx = check("module m;\nvoid f(i8 a) { i64 wide = a; }\n");
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
    }

    #[test]
    fn test_assignment_requires_lvalue() {
        let ctx = check("module m;\nvoid f() { 3 = 4; }\n");
        let errors = type_errors(&ctx);
        assert!(errors.iter().any(|e| e.contains("lvalue")), "{:?}", errors);
    }

    #[test]
    fn test_address_of_non_lvalue_rejected() {
        let ctx = check("module m;\nvoid f() { u8* p = cast(u8*) &5; }\n");
        let errors = type_errors(&ctx);
        assert!(errors.iter().any(|e| e.contains("address")), "{:?}", errors);
    }

    #[test]
    fn test_invalid_cast_rejected() {
        let ctx = check("module m;\nvoid f(u8[] s) { bool b = cast(bool) s; }\n");
        let errors = type_errors(&ctx);
        assert!(errors.iter().any(|e| e.contains("invalid cast")), "{:?}", errors);
    }

    #[test]
    fn test_valid_casts_accepted() {
        let ctx = check(
            "module m;\n\
             enum Color : u8 { red, green }\n\
             void f(i64 x, u8* p, u8[] s) {\n\
               u8 a = cast(u8) x;\n\
               i64 b = cast(i64) p;\n\
               u8* c = cast(u8*) b;\n\
               u8* d = s.ptr;\n\
               u8 e = cast(u8) Color.green;\n\
             }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
    }

    #[test]
    fn test_paren_free_call() {
        let ctx = check(
            "module m;\n\
             i32 answer() { return 42; }\n\
             i32 x = answer;\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
    }

    #[test]
    fn test_wrong_argument_count() {
        let ctx = check(
            "module m;\n\
             i32 add(i32 a, i32 b) { return a + b; }\n\
             i32 x = add(1);\n",
        );
        let errors = type_errors(&ctx);
        assert!(errors.iter().any(|e| e.contains("argument count")), "{:?}", errors);
    }

    #[test]
    fn test_default_arguments_fill_missing() {
        let ctx = check(
            "module m;\n\
             i32 scale(i32 v, i32 by = 2) { return v * by; }\n\
             i32 x = scale(10);\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
    }

    #[test]
    fn test_slice_members() {
        let ctx = check(
            "module m;\n\
             u64 len(u8[] s) { return s.length; }\n\
             u8* first(u8[] s) { return s.ptr; }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
    }

    #[test]
    fn test_enum_auto_values() {
        let mut ctx = check(
            "module m;\n\
             enum Color : u8 { red, green = 5, blue }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let id = ctx.intern("Color");
        let module = ctx.modules[0];
        let AstData::Module { scope, .. } = ctx.node(module).data else { panic!() };
        let color = *ctx.scope(scope).symbols.get(&id).unwrap();
        let AstData::EnumDecl { members, .. } = ctx.node(color).data else { panic!() };
        let values: Vec<i64> =
            ctx.list(members).iter().map(|m| ctx.enum_values[m]).collect();
        assert_eq!(values, vec![0, 5, 6]);
    }

    #[test]
    fn test_struct_layout_offsets() {
        let mut ctx = check(
            "module m;\n\
             struct Mixed { u8 a; i32 b; u8 c; i64 d; }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let id = ctx.intern("Mixed");
        let module = ctx.modules[0];
        let AstData::Module { scope, .. } = ctx.node(module).data else { panic!() };
        let decl = *ctx.scope(scope).symbols.get(&id).unwrap();
        let (size, align, offsets) = struct_layout_full(&mut ctx, decl);
        assert_eq!(offsets, vec![0, 4, 8, 16]);
        assert_eq!(align, 8);
        assert_eq!(size, 24);
    }

    #[test]
    fn test_size_of_builtin_folds() {
        let mut ctx = check(
            "module m;\n\
             struct Pair { i64 a; i64 b; }\n\
             enum u64 PAIR_SIZE = $size_of(Pair);\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let id = ctx.intern("PAIR_SIZE");
        let module = ctx.modules[0];
        let AstData::Module { scope, .. } = ctx.node(module).data else { panic!() };
        let decl = *ctx.scope(scope).symbols.get(&id).unwrap();
        assert_eq!(ctx.enum_values.get(&decl), Some(&16));
    }

    #[test]
    fn test_recursive_struct_by_value_rejected() {
        let mut ctx = check("module m;\nstruct S { S inner; }\n");
        let id = ctx.intern("S");
        let module = ctx.modules[0];
        let AstData::Module { scope, .. } = ctx.node(module).data else { panic!() };
        let decl = *ctx.scope(scope).symbols.get(&id).unwrap();
        let _ = size_of(&mut ctx, decl);
        let errors = type_errors(&ctx);
        assert!(errors.iter().any(|e| e.contains("infinite size")), "{:?}", errors);
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let ctx = check("module m;\nvoid f() { break; }\n");
        let errors = type_errors(&ctx);
        assert!(errors.iter().any(|e| e.contains("outside")), "{:?}", errors);
    }

    #[test]
    fn test_method_call_with_implicit_this() {
        let ctx = check(
            "module m;\n\
             struct Counter {\n\
               i64 count;\n\
               void bump() { count = count + 1; }\n\
               i64 get() { return count; }\n\
             }\n\
             i64 use_counter() {\n\
               Counter c;\n\
               c.bump();\n\
               return c.get();\n\
             }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
    }
}
