//! Name resolution.
//!
//! Resolves identifier uses to entities by walking the lexical scope chain
//! upward. Three rewrites happen in place on the use node once its target is
//! known:
//!
//! - an alias target substitutes its (resolved) initializer into the use,
//!   leaving other holders of the alias untouched;
//! - basic types, pointer/slice/static-array type nodes and alias arrays
//!   replace the use by the entity directly;
//! - a struct member used without a receiver inside a member function is
//!   rewritten to `this.<member>`.
//!
//! Undefined identifiers report a diagnostic and attach the error-sentinel
//! entity so downstream passes do not cascade.

use crate::analysis;
use crate::ast::{flags, AstData, AstIndex, AstKind};
use crate::context::CompilationContext;
use crate::errors::{DiagKind, Fallible};
use crate::interner::{known, Ident};
use crate::register;
use crate::scope::{ScopeId, ScopeKind};

pub fn resolve_node(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    match ctx.node(node).data {
        AstData::Module { items, .. } => {
            for item in ctx.list(items) {
                analysis::require_name_resolve(ctx, item)?;
            }
            Ok(())
        }
        AstData::Import { .. } => Ok(()),
        AstData::Alias { expr, .. } => {
            resolve_expr(ctx, expr)?;
            if expr.is_defined() && ctx.kind_of(expr) == AstKind::LiteralArray {
                ctx.node_mut(expr).set_flag(flags::IS_ALIAS_ARRAY);
            }
            Ok(())
        }
        AstData::StructDecl { members, .. } => {
            for member in ctx.list(members) {
                analysis::require_name_resolve(ctx, member)?;
            }
            Ok(())
        }
        AstData::EnumDecl { base_type, members, .. } => {
            resolve_expr(ctx, base_type)?;
            for member in ctx.list(members) {
                analysis::require_name_resolve(ctx, member)?;
            }
            Ok(())
        }
        AstData::EnumMember { ty, value, .. } => {
            resolve_expr(ctx, ty)?;
            resolve_expr(ctx, value)
        }
        AstData::FunctionDecl { signature, body, .. } => {
            let AstData::FunctionSignature { return_type, params } = ctx.node(signature).data
            else {
                return Ok(());
            };
            resolve_expr(ctx, return_type)?;
            for param in ctx.list(params) {
                analysis::require_name_resolve(ctx, param)?;
            }
            resolve_child(ctx, body)
        }
        AstData::VarDecl { ty, initializer, .. } => {
            resolve_expr(ctx, ty)?;
            resolve_expr(ctx, initializer)
        }
        AstData::Block { items, .. } => {
            for item in ctx.list(items) {
                analysis::require_name_resolve(ctx, item)?;
            }
            Ok(())
        }
        AstData::IfStmt { condition, then_stmt, else_stmt } => {
            resolve_expr(ctx, condition)?;
            resolve_child(ctx, then_stmt)?;
            resolve_child(ctx, else_stmt)
        }
        AstData::WhileStmt { condition, body } => {
            resolve_expr(ctx, condition)?;
            resolve_child(ctx, body)
        }
        AstData::ForStmt { init, condition, increment, body, .. } => {
            resolve_child(ctx, init)?;
            resolve_expr(ctx, condition)?;
            resolve_expr(ctx, increment)?;
            resolve_child(ctx, body)
        }
        AstData::ReturnStmt { value } => resolve_expr(ctx, value),
        AstData::BreakStmt | AstData::ContinueStmt => Ok(()),
        AstData::StaticIf { .. }
        | AstData::StaticVersion { .. }
        | AstData::StaticForeach { .. }
        | AstData::StaticAssert { .. } => Ok(()),
        _ => resolve_expr(ctx, node),
    }
}

fn resolve_child(ctx: &mut CompilationContext, stmt: AstIndex) -> Fallible<()> {
    if stmt.is_undef() {
        return Ok(());
    }
    analysis::require_name_resolve(ctx, stmt)
}

pub fn resolve_expr(ctx: &mut CompilationContext, expr: AstIndex) -> Fallible<()> {
    if expr.is_undef() {
        return Ok(());
    }
    match ctx.node(expr).data {
        AstData::NameUse { name, scope, entity } => {
            if entity.is_defined() {
                return Ok(());
            }
            resolve_name_use(ctx, expr, name, scope)
        }
        AstData::MemberExpr { object, .. } => resolve_expr(ctx, object),
        AstData::UnaryExpr { operand, .. } => resolve_expr(ctx, operand),
        AstData::BinaryExpr { left, right, .. } => {
            resolve_expr(ctx, left)?;
            resolve_expr(ctx, right)
        }
        AstData::CallExpr { callee, args } => {
            resolve_expr(ctx, callee)?;
            for arg in ctx.list(args) {
                resolve_expr(ctx, arg)?;
            }
            Ok(())
        }
        AstData::IndexExpr { base, indices } => {
            resolve_expr(ctx, base)?;
            for index in ctx.list(indices) {
                resolve_expr(ctx, index)?;
            }
            maybe_instantiate_template(ctx, expr, base, indices)
        }
        AstData::CastExpr { ty, expr: inner } => {
            resolve_expr(ctx, ty)?;
            resolve_expr(ctx, inner)
        }
        AstData::LiteralArray { items } => {
            for item in ctx.list(items) {
                resolve_expr(ctx, item)?;
            }
            Ok(())
        }
        AstData::TypePtr { target } => resolve_expr(ctx, target),
        AstData::TypeSlice { element } => resolve_expr(ctx, element),
        AstData::TypeStaticArray { element, length_expr, .. } => {
            resolve_expr(ctx, element)?;
            resolve_expr(ctx, length_expr)
        }
        AstData::FunctionSignature { return_type, params } => {
            resolve_expr(ctx, return_type)?;
            for param in ctx.list(params) {
                analysis::require_name_resolve(ctx, param)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn resolve_name_use(
    ctx: &mut CompilationContext,
    use_node: AstIndex,
    name: Ident,
    scope: ScopeId,
) -> Fallible<()> {
    let Some((found, found_scope)) = lookup_with_scope(ctx, scope, name) else {
        let loc = ctx.node(use_node).loc;
        let message = format!("undefined identifier '{}'", ctx.name(name));
        ctx.error(DiagKind::Name, loc, message);
        set_entity(ctx, use_node, ctx.common.error_node);
        return Ok(());
    };

    match ctx.node(found).kind() {
        AstKind::Alias => {
            let AstData::Alias { expr, .. } = ctx.node(found).data else { unreachable!() };
            if expr.is_undef() {
                // an unbound template parameter; only reachable when a
                // template body is analyzed outside an instance
                set_entity(ctx, use_node, ctx.common.error_node);
                return Ok(());
            }
            analysis::require_name_resolve(ctx, found)?;
            substitute(ctx, use_node, expr);
            Ok(())
        }
        // entities that replace the use index directly
        AstKind::TypeBasic
        | AstKind::TypePtr
        | AstKind::TypeSlice
        | AstKind::TypeStaticArray
        | AstKind::LiteralArray
        | AstKind::IntLiteral
        | AstKind::NameUse => {
            substitute(ctx, use_node, found);
            Ok(())
        }
        _ => {
            // member used without a receiver inside a member function:
            // lower to this.<member>
            if ctx.scope(found_scope).kind == ScopeKind::Member {
                let struct_owner = ctx.scope(found_scope).owner;
                if struct_owner.is_defined()
                    && ctx.kind_of(struct_owner) == AstKind::StructDecl
                    && enclosing_member_struct(ctx, scope) == Some(struct_owner)
                {
                    return rewrite_to_this_member(ctx, use_node, name, scope, found);
                }
            }
            set_entity(ctx, use_node, found);
            Ok(())
        }
    }
}

/// Copy the resolved target node into the use node: the use index now IS the
/// entity, without mutating other holders of the same target.
fn substitute(ctx: &mut CompilationContext, use_node: AstIndex, target: AstIndex) {
    let data = ctx.node(target).data;
    let target_flags = ctx.node(target).flags;
    let ty = ctx.get_type(target);
    let n = ctx.node_mut(use_node);
    n.data = data;
    n.flags |= target_flags;
    if ty.is_defined() {
        ctx.set_type(use_node, ty);
    }
}

fn set_entity(ctx: &mut CompilationContext, use_node: AstIndex, entity: AstIndex) {
    if let AstData::NameUse { entity: slot, .. } = &mut ctx.node_mut(use_node).data {
        *slot = entity;
    }
}

fn rewrite_to_this_member(
    ctx: &mut CompilationContext,
    use_node: AstIndex,
    member: Ident,
    scope: ScopeId,
    entity: AstIndex,
) -> Fallible<()> {
    let loc = ctx.node(use_node).loc;
    let this_use = ctx.add_node(
        loc,
        AstData::NameUse { name: known::THIS, scope, entity: AstIndex::UNDEF },
    );
    resolve_expr(ctx, this_use)?;
    let n = ctx.node_mut(use_node);
    n.data = AstData::MemberExpr { object: this_use, member, entity, member_index: 0 };
    n.set_flag(flags::NEEDS_DEREF);
    Ok(())
}

/// The struct owning the member function that lexically encloses `scope`,
/// if any.
fn enclosing_member_struct(ctx: &CompilationContext, scope: ScopeId) -> Option<AstIndex> {
    let mut current = scope;
    while !current.is_none() {
        let s = ctx.scope(current);
        let owner = s.owner;
        if owner.is_defined() && ctx.kind_of(owner) == AstKind::FunctionDecl {
            if ctx.node(owner).has_flag(flags::IS_MEMBER) {
                if let AstData::FunctionDecl { parent_scope, .. } = ctx.node(owner).data {
                    let struct_owner = ctx.scope(parent_scope).owner;
                    if struct_owner.is_defined()
                        && ctx.kind_of(struct_owner) == AstKind::StructDecl
                    {
                        return Some(struct_owner);
                    }
                }
            }
            return None;
        }
        current = s.parent;
    }
    None
}

fn lookup_with_scope(
    ctx: &CompilationContext,
    from: ScopeId,
    name: Ident,
) -> Option<(AstIndex, ScopeId)> {
    let mut current = from;
    while !current.is_none() {
        let scope = ctx.scope(current);
        if let Some(&entity) = scope.symbols.get(&name) {
            return Some((entity, current));
        }
        for &import in &scope.imports {
            if let Some(&entity) = ctx.scope(import).symbols.get(&name) {
                return Some((entity, import));
            }
        }
        current = scope.parent;
    }
    None
}

fn maybe_instantiate_template(
    ctx: &mut CompilationContext,
    expr: AstIndex,
    base: AstIndex,
    indices: crate::arena::PoolSlice,
) -> Fallible<()> {
    let AstData::NameUse { name, entity, .. } = ctx.node(base).data else { return Ok(()) };
    if !entity.is_defined() {
        return Ok(());
    }
    let is_template = match ctx.node(entity).data {
        AstData::StructDecl { template_params, .. }
        | AstData::FunctionDecl { template_params, .. } => !template_params.is_empty(),
        _ => false,
    };
    if !is_template {
        return Ok(());
    }

    let loc = ctx.node(expr).loc;
    let args = ctx.list(indices);
    let instance = register::instantiate_template(ctx, entity, &args, loc)?;
    if instance == ctx.common.error_node {
        let n = ctx.node_mut(expr);
        n.data = AstData::NameUse { name, scope: ScopeId::NONE, entity: instance };
        return Ok(());
    }
    analysis::require_name_resolve(ctx, instance)?;

    let is_type = ctx.kind_of(instance) == AstKind::StructDecl;
    let n = ctx.node_mut(expr);
    n.data = AstData::NameUse { name, scope: ScopeId::NONE, entity: instance };
    if is_type {
        n.set_flag(flags::IS_TYPE);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;

    fn setup(source: &str) -> (CompilationContext, AstIndex) {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let file = ctx.add_file("test.mica", source);
        let module = crate::parser::parse_module_file(&mut ctx, file);
        ctx.add_module(module, file);
        (ctx, module)
    }

    fn find_decl(ctx: &CompilationContext, module: AstIndex, name: &str) -> AstIndex {
        let AstData::Module { items, .. } = ctx.node(module).data else { panic!() };
        ctx.list(items)
            .into_iter()
            .find(|&i| {
                ctx.node(i)
                    .decl_name()
                    .is_some_and(|id| ctx.interner.resolve(id) == name)
            })
            .unwrap_or_else(|| panic!("no declaration named {}", name))
    }

    #[test]
    fn test_forward_alias_chain_resolves() {
        let (mut ctx, module) = setup(
            "module m;\n\
             alias A = B;\n\
             alias B = i32;\n\
             A x = 3;\n",
        );
        let x = find_decl(&ctx, module, "x");
        analysis::require_name_resolve(&mut ctx, module).unwrap();
        analysis::require_name_resolve(&mut ctx, x).unwrap();
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        // the use of A was substituted down to the basic type
        let AstData::VarDecl { ty, .. } = ctx.node(x).data else { panic!() };
        assert_eq!(ctx.kind_of(ty), AstKind::TypeBasic);
    }

    #[test]
    fn test_alias_cycle_reports_once() {
        let (mut ctx, module) = setup(
            "module m;\n\
             alias X = Y;\n\
             alias Y = X;\n",
        );
        let result = analysis::require_name_resolve(&mut ctx, module);
        assert!(result.is_err());
        assert_eq!(ctx.diagnostics.count_of(DiagKind::Cycle), 1);
        let cycle = ctx.diagnostics.iter().find(|d| d.kind == DiagKind::Cycle).unwrap();
        assert!(cycle.message.contains("circular dependency"));
    }

    #[test]
    fn test_undefined_identifier_attaches_error_node() {
        let (mut ctx, module) = setup("module m;\ni32 x = missing;\n");
        analysis::require_name_resolve(&mut ctx, module).unwrap();
        assert_eq!(ctx.diagnostics.count_of(DiagKind::Name), 1);
        let x = find_decl(&ctx, module, "x");
        let AstData::VarDecl { initializer, .. } = ctx.node(x).data else { panic!() };
        let AstData::NameUse { entity, .. } = ctx.node(initializer).data else { panic!() };
        assert_eq!(entity, ctx.common.error_node);
    }

    #[test]
    fn test_member_use_rewrites_to_this() {
        let (mut ctx, module) = setup(
            "module m;\n\
             struct Counter {\n\
               i64 count;\n\
               void bump() { count = count + 1; }\n\
             }\n",
        );
        analysis::require_name_resolve(&mut ctx, module).unwrap();
        let counter = find_decl(&ctx, module, "Counter");
        analysis::require_name_resolve(&mut ctx, counter).unwrap();
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());

        let AstData::StructDecl { members, .. } = ctx.node(counter).data else { panic!() };
        let members = ctx.list(members);
        let bump = members[1];
        let AstData::FunctionDecl { body, .. } = ctx.node(bump).data else { panic!() };
        let AstData::Block { items, .. } = ctx.node(body).data else { panic!() };
        let stmts = ctx.list(items);
        let AstData::BinaryExpr { left, .. } = ctx.node(stmts[0]).data else { panic!() };
        // `count = ...` became `this.count = ...`
        assert_eq!(ctx.kind_of(left), AstKind::MemberExpr);
        assert!(ctx.node(left).has_flag(flags::NEEDS_DEREF));
    }

    #[test]
    fn test_struct_template_instantiates_once() {
        let (mut ctx, module) = setup(
            "module m;\n\
             struct Box[T] { T* item; }\n\
             Box[i32] a;\n\
             Box[i32] b;\n\
             Box[u8] c;\n",
        );
        analysis::require_name_resolve(&mut ctx, module).unwrap();
        for name in ["a", "b", "c"] {
            let decl = find_decl(&ctx, module, name);
            analysis::require_name_resolve(&mut ctx, decl).unwrap();
        }
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        // two distinct instances: Box[i32] (shared) and Box[u8]
        assert_eq!(ctx.template_instances.len(), 2);

        let a = find_decl(&ctx, module, "a");
        let b = find_decl(&ctx, module, "b");
        let AstData::VarDecl { ty: ty_a, .. } = ctx.node(a).data else { panic!() };
        let AstData::VarDecl { ty: ty_b, .. } = ctx.node(b).data else { panic!() };
        let AstData::NameUse { entity: ea, .. } = ctx.node(ty_a).data else { panic!() };
        let AstData::NameUse { entity: eb, .. } = ctx.node(ty_b).data else { panic!() };
        assert_eq!(ea, eb);
    }
}
