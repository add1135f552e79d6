//! Name registration and static expansion.
//!
//! `register_self` puts a declaration's name into its enclosing scope;
//! `register_nested` recurses into children. Between the two, each array of
//! items (module declarations, struct members, block statements) is swept
//! for static conditionals: `#if`/`#version` are replaced in place by their
//! selected branch, `#assert` is evaluated and removed, and `#foreach`
//! clones its body once per element of a compile-time alias array. The
//! replacement is a `replace_at` on the shared item pool, so expansion keeps
//! source order without copying whole arrays; newly inserted ranges are
//! re-swept for nested conditionals.
//!
//! The subtree cloner used by `#foreach` lives here too and is shared with
//! template instantiation: a clone is a bulk node copy plus a relocation
//! table for intra-subtree handles and scopes.

use std::collections::HashMap;

use crate::analysis;
use crate::arena::PoolSlice;
use crate::ast::{
    flags, AstData, AstIndex, AstKind, AstState, BasicType, Prop, PropState,
};
use crate::context::CompilationContext;
use crate::errors::{DiagKind, Fallible, SourceLoc};
use crate::eval;
use crate::interner::{known, Ident};
use crate::scope::{ScopeId, ScopeKind};
use tracing::debug;

/// Register this node's declared name into its enclosing scope.
pub fn register_self(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    match ctx.node(node).data {
        AstData::Alias { name, parent_scope, .. }
        | AstData::StructDecl { name, parent_scope, .. }
        | AstData::EnumDecl { name, parent_scope, .. }
        | AstData::EnumMember { name, parent_scope, .. }
        | AstData::FunctionDecl { name, parent_scope, .. }
        | AstData::VarDecl { name, parent_scope, .. } => {
            if name.is_defined() {
                ctx.insert_symbol(parent_scope, name, node);
            }
            Ok(())
        }
        // modules register through the package tree; everything else has no
        // name of its own
        _ => Ok(()),
    }
}

/// Register the names declared inside this node, running the static
/// expansion sweep over each item array first.
pub fn register_nested(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    match ctx.node(node).data {
        AstData::Module { items, .. } => {
            resolve_imports(ctx, items);
            let items = sweep_items(ctx, items)?;
            if let AstData::Module { items: slot, .. } = &mut ctx.node_mut(node).data {
                *slot = items;
            }
            for item in ctx.list(items) {
                analysis::require_register_self(ctx, item)?;
                analysis::require_register_nested(ctx, item)?;
            }
            Ok(())
        }
        AstData::StructDecl { members, .. } => {
            let members = sweep_items(ctx, members)?;
            if let AstData::StructDecl { members: slot, .. } = &mut ctx.node_mut(node).data {
                *slot = members;
            }
            for member in ctx.list(members) {
                analysis::require_register_self(ctx, member)?;
                analysis::require_register_nested(ctx, member)?;
            }
            Ok(())
        }
        AstData::EnumDecl { name, parent_scope, members, .. } => {
            for member in ctx.list(members) {
                analysis::require_register_self(ctx, member)?;
                // anonymous enums spill their members into the surrounding
                // scope
                if !name.is_defined() {
                    if let Some(member_name) = ctx.node(member).decl_name() {
                        ctx.insert_symbol(parent_scope, member_name, member);
                    }
                }
            }
            Ok(())
        }
        AstData::FunctionDecl { scope, signature, body, .. } => {
            register_function(ctx, node, scope, signature, body)
        }
        AstData::Block { items, .. } => {
            let items = sweep_items(ctx, items)?;
            if let AstData::Block { items: slot, .. } = &mut ctx.node_mut(node).data {
                *slot = items;
            }
            for item in ctx.list(items) {
                analysis::require_register_self(ctx, item)?;
                analysis::require_register_nested(ctx, item)?;
            }
            Ok(())
        }
        AstData::IfStmt { then_stmt, else_stmt, .. } => {
            register_child_stmt(ctx, then_stmt)?;
            register_child_stmt(ctx, else_stmt)
        }
        AstData::WhileStmt { body, .. } => register_child_stmt(ctx, body),
        AstData::ForStmt { init, body, .. } => {
            register_child_stmt(ctx, init)?;
            register_child_stmt(ctx, body)
        }
        _ => Ok(()),
    }
}

fn register_child_stmt(ctx: &mut CompilationContext, stmt: AstIndex) -> Fallible<()> {
    if stmt.is_undef() {
        return Ok(());
    }
    analysis::require_register_self(ctx, stmt)?;
    analysis::require_register_nested(ctx, stmt)
}

fn resolve_imports(ctx: &mut CompilationContext, items: PoolSlice) {
    for item in ctx.list(items) {
        let AstData::Import { path, parent_scope } = ctx.node(item).data else { continue };
        match ctx.module_paths.get(&path).copied() {
            Some(module) => {
                if let AstData::Module { scope, .. } = ctx.node(module).data {
                    ctx.scope_mut(parent_scope).imports.push(scope);
                }
            }
            None => {
                let loc = ctx.node(item).loc;
                let message = format!("imported module '{}' does not exist", ctx.name(path));
                ctx.error(DiagKind::Name, loc, message);
            }
        }
    }
}

fn register_function(
    ctx: &mut CompilationContext,
    decl: AstIndex,
    scope: ScopeId,
    signature: AstIndex,
    body: AstIndex,
) -> Fallible<()> {
    // member functions get a hidden `this` pointer as their first parameter
    if ctx.node(decl).has_flag(flags::IS_MEMBER) {
        add_this_parameter(ctx, decl, scope, signature);
    }

    let AstData::FunctionSignature { params, .. } = ctx.node(signature).data else {
        return Ok(());
    };
    let mut seen_variadic = false;
    for param in ctx.list(params) {
        if let Some(name) = ctx.node(param).decl_name() {
            if name.is_defined() {
                ctx.insert_symbol(scope, name, param);
            }
        }
        if ctx.node(param).has_flag(flags::IS_VARIADIC_PARAM) {
            if seen_variadic {
                let loc = ctx.node(param).loc;
                ctx.error(
                    DiagKind::StaticExpansion,
                    loc,
                    "duplicate variadic parameter".to_string(),
                );
            }
            seen_variadic = true;
        }
    }

    register_child_stmt(ctx, body)
}

fn add_this_parameter(
    ctx: &mut CompilationContext,
    decl: AstIndex,
    scope: ScopeId,
    signature: AstIndex,
) {
    let parent_scope = match ctx.node(decl).data {
        AstData::FunctionDecl { parent_scope, .. } => parent_scope,
        _ => return,
    };
    let owner = ctx.scope(parent_scope).owner;
    if owner.is_undef() || ctx.kind_of(owner) != AstKind::StructDecl {
        return;
    }
    let loc = ctx.node(decl).loc;
    let this_type = ctx.add_node(loc, AstData::TypePtr { target: owner });
    ctx.node_mut(this_type).set_flag(flags::IS_TYPE);
    let this_param = ctx.add_node(
        loc,
        AstData::VarDecl {
            name: known::THIS,
            parent_scope: scope,
            ty: this_type,
            initializer: AstIndex::UNDEF,
        },
    );
    ctx.node_mut(this_param).set_flag(flags::IS_PARAMETER);

    let AstData::FunctionSignature { params, .. } = ctx.node(signature).data else { return };
    let params = ctx.arrays.replace_at(params, 0, 0, &[this_param]);
    if let AstData::FunctionSignature { params: slot, .. } = &mut ctx.node_mut(signature).data {
        *slot = params;
    }
}

/// The static expansion sweep. Non-static items are registered first so
/// conditions can reference names declared anywhere in the same array; then
/// each static item is replaced in place by its expansion. The index is not
/// advanced past a replacement, so inserted ranges are swept recursively.
pub fn sweep_items(ctx: &mut CompilationContext, slice: PoolSlice) -> Fallible<PoolSlice> {
    for item in ctx.list(slice) {
        if !ctx.node(item).is_static_item() {
            analysis::require_register_self(ctx, item)?;
        }
    }

    let mut slice = slice;
    let mut i = 0u32;
    while i < slice.len {
        let item = ctx.arrays.at(slice, i);
        if !ctx.node(item).is_static_item() {
            i += 1;
            continue;
        }
        let replacement = expand_static(ctx, item)?;
        debug!(
            kind = ?ctx.node(item).kind(),
            inserted = replacement.len(),
            "static expansion"
        );
        slice = ctx.arrays.replace_at(slice, i, 1, &replacement);
        for &inserted in &replacement {
            if !ctx.node(inserted).is_static_item() {
                analysis::require_register_self(ctx, inserted)?;
            }
        }
    }
    Ok(slice)
}

fn expand_static(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<Vec<AstIndex>> {
    let loc = ctx.node(node).loc;
    match ctx.node(node).data {
        AstData::StaticVersion { name, then_items, else_items } => {
            if !known::is_version(name) {
                let message = format!(
                    "'{}' is not a built-in version identifier",
                    if name.is_defined() { ctx.name(name) } else { "<missing>" }
                );
                ctx.error(DiagKind::StaticExpansion, loc, message);
                return Ok(Vec::new());
            }
            let selected = if ctx.config.version_enabled(known::version_bit(name)) {
                then_items
            } else {
                else_items
            };
            Ok(ctx.list(selected))
        }
        AstData::StaticIf { condition, then_items, else_items } => {
            let value = eval::eval_static_expr(ctx, condition)?;
            let selected = if value != 0 { then_items } else { else_items };
            Ok(ctx.list(selected))
        }
        AstData::StaticAssert { condition, message } => {
            let value = eval::eval_static_expr(ctx, condition)?;
            if value == 0 {
                let text = if message.is_defined() {
                    match ctx.node(message).data {
                        AstData::StringLiteral { index } => {
                            format!("static assert failed: {}", ctx.strings[index as usize])
                        }
                        _ => "static assert condition is zero".to_string(),
                    }
                } else {
                    "static assert condition is zero".to_string()
                };
                ctx.error(DiagKind::StaticAssert, loc, text);
            }
            Ok(Vec::new())
        }
        AstData::StaticForeach { key, value, iterable, body_scope, body } => {
            expand_foreach(ctx, loc, key, value, iterable, body_scope, body)
        }
        _ => Ok(vec![node]),
    }
}

fn expand_foreach(
    ctx: &mut CompilationContext,
    loc: SourceLoc,
    key: Ident,
    value: Ident,
    iterable: AstIndex,
    body_scope: ScopeId,
    body: PoolSlice,
) -> Fallible<Vec<AstIndex>> {
    analysis::require_name_resolve(ctx, iterable)?;

    let elements = match ctx.node(iterable).data {
        AstData::LiteralArray { items } => ctx.list(items),
        _ => {
            ctx.error(
                DiagKind::StaticExpansion,
                loc,
                "'#foreach' source is not a compile-time alias array".to_string(),
            );
            return Ok(Vec::new());
        }
    };

    let surrounding = ctx.scope(body_scope).parent;
    let mut expanded = Vec::new();
    for (index, element) in elements.into_iter().enumerate() {
        let instance_scope =
            ctx.new_scope(ScopeKind::NoScope, surrounding, AstIndex::UNDEF, "#foreach-instance");

        // bind keyId -> index as a u64 enum member, valueId -> the element
        let u64_type = ctx.basic_type(BasicType::U64);
        let key_value = ctx.add_node(loc, AstData::IntLiteral { value: index as u64 });
        ctx.set_type(key_value, u64_type);
        mark_analyzed(ctx, key_value);
        let key_member = ctx.add_node(
            loc,
            AstData::EnumMember {
                name: key,
                parent_scope: instance_scope,
                ty: u64_type,
                value: key_value,
            },
        );
        ctx.set_type(key_member, u64_type);
        mark_analyzed(ctx, key_member);
        ctx.enum_values.insert(key_member, index as i64);
        ctx.bind_symbol(instance_scope, key, key_member);
        ctx.bind_symbol(instance_scope, value, element);

        let mut cloner = Cloner::new();
        cloner.scope_map.insert(body_scope, instance_scope);
        for item in ctx.list(body) {
            expanded.push(clone_node(ctx, &mut cloner, item));
        }
    }
    Ok(expanded)
}

fn mark_analyzed(ctx: &mut CompilationContext, node: AstIndex) {
    let n = ctx.node_mut(node);
    n.advance_state(AstState::TypeCheckDone);
    for prop in [Prop::RegisterSelf, Prop::RegisterNested, Prop::NameResolve, Prop::TypeCheck] {
        n.set_prop_state(prop, PropState::Calculated);
    }
}

// ---- subtree cloning ----

/// Relocation state for one clone operation. Handles inside the subtree are
/// remapped; already-analyzed nodes (shared type nodes, resolved entities)
/// are shared, not copied.
pub struct Cloner {
    pub node_map: HashMap<AstIndex, AstIndex>,
    pub scope_map: HashMap<ScopeId, ScopeId>,
}

impl Cloner {
    pub fn new() -> Self {
        Cloner { node_map: HashMap::new(), scope_map: HashMap::new() }
    }
}

impl Default for Cloner {
    fn default() -> Self {
        Self::new()
    }
}

pub fn clone_node(ctx: &mut CompilationContext, c: &mut Cloner, index: AstIndex) -> AstIndex {
    if index.is_undef() {
        return index;
    }
    if let Some(&mapped) = c.node_map.get(&index) {
        return mapped;
    }
    // nodes past parsing are shared state (common types, resolved entities)
    if ctx.node(index).state > AstState::ParseDone {
        return index;
    }
    clone_node_forced(ctx, c, index)
}

/// Clone entry point that copies `index` even if it has advanced past
/// parsing (a registered template declaration being instantiated).
fn clone_node_forced(ctx: &mut CompilationContext, c: &mut Cloner, index: AstIndex) -> AstIndex {
    let mut node = ctx.node(index).clone();
    node.reset_for_clone();
    let new_index = AstIndex(ctx.nodes.len() as u32);
    ctx.nodes.push(node);
    c.node_map.insert(index, new_index);

    let data = ctx.node(new_index).data;
    let new_data = clone_data(ctx, c, data);
    ctx.node_mut(new_index).data = new_data;

    // a cloned declaration owns its cloned scope
    match new_data {
        AstData::StructDecl { scope, .. }
        | AstData::EnumDecl { scope, .. }
        | AstData::FunctionDecl { scope, .. } => {
            if !scope.is_none() {
                ctx.scope_mut(scope).owner = new_index;
            }
        }
        _ => {}
    }
    new_index
}

fn clone_list(ctx: &mut CompilationContext, c: &mut Cloner, slice: PoolSlice) -> PoolSlice {
    let items: Vec<AstIndex> =
        ctx.list(slice).into_iter().map(|item| clone_node(ctx, c, item)).collect();
    ctx.arrays.alloc(&items)
}

fn map_scope(ctx: &mut CompilationContext, c: &mut Cloner, scope: ScopeId) -> ScopeId {
    if scope.is_none() {
        return scope;
    }
    if let Some(&mapped) = c.scope_map.get(&scope) {
        return mapped;
    }
    // never clone module or root scopes; chains terminate at seeded entries
    if ctx.scope(scope).kind == ScopeKind::Global {
        return scope;
    }
    let parent = ctx.scope(scope).parent;
    let mapped_parent = map_scope(ctx, c, parent);
    let kind = ctx.scope(scope).kind;
    let owner = ctx.scope(scope).owner;
    let debug_name = ctx.scope(scope).debug_name.clone();
    let new_scope = ctx.new_scope(kind, mapped_parent, owner, debug_name);
    c.scope_map.insert(scope, new_scope);
    new_scope
}

fn clone_data(ctx: &mut CompilationContext, c: &mut Cloner, data: AstData) -> AstData {
    match data {
        AstData::ErrorNode
        | AstData::BreakStmt
        | AstData::ContinueStmt
        | AstData::IntLiteral { .. }
        | AstData::StringLiteral { .. }
        | AstData::BoolLiteral { .. }
        | AstData::NullLiteral
        | AstData::TypeBasic { .. }
        | AstData::BuiltinFunc { .. }
        | AstData::Attribute { .. } => data,

        AstData::Module { name, full_path, scope, items } => AstData::Module {
            name,
            full_path,
            scope: map_scope(ctx, c, scope),
            items: clone_list(ctx, c, items),
        },
        AstData::Import { path, parent_scope } => {
            AstData::Import { path, parent_scope: map_scope(ctx, c, parent_scope) }
        }
        AstData::Alias { name, parent_scope, expr } => AstData::Alias {
            name,
            parent_scope: map_scope(ctx, c, parent_scope),
            expr: clone_node(ctx, c, expr),
        },
        AstData::StructDecl { name, parent_scope, scope, members, template_params } => {
            AstData::StructDecl {
                name,
                parent_scope: map_scope(ctx, c, parent_scope),
                scope: map_scope(ctx, c, scope),
                members: clone_list(ctx, c, members),
                template_params: clone_list(ctx, c, template_params),
            }
        }
        AstData::EnumDecl { name, parent_scope, scope, base_type, members } => AstData::EnumDecl {
            name,
            parent_scope: map_scope(ctx, c, parent_scope),
            scope: map_scope(ctx, c, scope),
            base_type: clone_node(ctx, c, base_type),
            members: clone_list(ctx, c, members),
        },
        AstData::EnumMember { name, parent_scope, ty, value } => AstData::EnumMember {
            name,
            parent_scope: map_scope(ctx, c, parent_scope),
            ty: clone_node(ctx, c, ty),
            value: clone_node(ctx, c, value),
        },
        AstData::FunctionDecl {
            name,
            parent_scope,
            scope,
            signature,
            body,
            template_params,
            ir_index: _,
        } => AstData::FunctionDecl {
            name,
            parent_scope: map_scope(ctx, c, parent_scope),
            scope: map_scope(ctx, c, scope),
            signature: clone_node(ctx, c, signature),
            body: clone_node(ctx, c, body),
            template_params: clone_list(ctx, c, template_params),
            ir_index: 0,
        },
        AstData::VarDecl { name, parent_scope, ty, initializer } => AstData::VarDecl {
            name,
            parent_scope: map_scope(ctx, c, parent_scope),
            ty: clone_node(ctx, c, ty),
            initializer: clone_node(ctx, c, initializer),
        },

        AstData::StaticIf { condition, then_items, else_items } => AstData::StaticIf {
            condition: clone_node(ctx, c, condition),
            then_items: clone_list(ctx, c, then_items),
            else_items: clone_list(ctx, c, else_items),
        },
        AstData::StaticVersion { name, then_items, else_items } => AstData::StaticVersion {
            name,
            then_items: clone_list(ctx, c, then_items),
            else_items: clone_list(ctx, c, else_items),
        },
        AstData::StaticForeach { key, value, iterable, body_scope, body } => {
            AstData::StaticForeach {
                key,
                value,
                iterable: clone_node(ctx, c, iterable),
                body_scope: map_scope(ctx, c, body_scope),
                body: clone_list(ctx, c, body),
            }
        }
        AstData::StaticAssert { condition, message } => AstData::StaticAssert {
            condition: clone_node(ctx, c, condition),
            message: clone_node(ctx, c, message),
        },

        AstData::Block { scope, items } => {
            AstData::Block { scope: map_scope(ctx, c, scope), items: clone_list(ctx, c, items) }
        }
        AstData::IfStmt { condition, then_stmt, else_stmt } => AstData::IfStmt {
            condition: clone_node(ctx, c, condition),
            then_stmt: clone_node(ctx, c, then_stmt),
            else_stmt: clone_node(ctx, c, else_stmt),
        },
        AstData::WhileStmt { condition, body } => AstData::WhileStmt {
            condition: clone_node(ctx, c, condition),
            body: clone_node(ctx, c, body),
        },
        AstData::ForStmt { scope, init, condition, increment, body } => AstData::ForStmt {
            scope: map_scope(ctx, c, scope),
            init: clone_node(ctx, c, init),
            condition: clone_node(ctx, c, condition),
            increment: clone_node(ctx, c, increment),
            body: clone_node(ctx, c, body),
        },
        AstData::ReturnStmt { value } => {
            AstData::ReturnStmt { value: clone_node(ctx, c, value) }
        }

        AstData::NameUse { name, scope, entity } => AstData::NameUse {
            name,
            scope: map_scope(ctx, c, scope),
            entity: clone_node(ctx, c, entity),
        },
        AstData::MemberExpr { object, member, entity, member_index } => AstData::MemberExpr {
            object: clone_node(ctx, c, object),
            member,
            entity,
            member_index,
        },
        AstData::UnaryExpr { op, operand } => {
            AstData::UnaryExpr { op, operand: clone_node(ctx, c, operand) }
        }
        AstData::BinaryExpr { op, left, right } => AstData::BinaryExpr {
            op,
            left: clone_node(ctx, c, left),
            right: clone_node(ctx, c, right),
        },
        AstData::CallExpr { callee, args } => AstData::CallExpr {
            callee: clone_node(ctx, c, callee),
            args: clone_list(ctx, c, args),
        },
        AstData::IndexExpr { base, indices } => AstData::IndexExpr {
            base: clone_node(ctx, c, base),
            indices: clone_list(ctx, c, indices),
        },
        AstData::CastExpr { ty, expr } => AstData::CastExpr {
            ty: clone_node(ctx, c, ty),
            expr: clone_node(ctx, c, expr),
        },
        AstData::LiteralArray { items } => {
            AstData::LiteralArray { items: clone_list(ctx, c, items) }
        }

        AstData::TypePtr { target } => AstData::TypePtr { target: clone_node(ctx, c, target) },
        AstData::TypeSlice { element } => {
            AstData::TypeSlice { element: clone_node(ctx, c, element) }
        }
        AstData::TypeStaticArray { element, length_expr, length } => AstData::TypeStaticArray {
            element: clone_node(ctx, c, element),
            length_expr: clone_node(ctx, c, length_expr),
            length,
        },
        AstData::FunctionSignature { return_type, params } => AstData::FunctionSignature {
            return_type: clone_node(ctx, c, return_type),
            params: clone_list(ctx, c, params),
        },
    }
}

// ---- template instantiation ----

/// Instantiate a templated struct or function with the given argument
/// entities. Instances are cached per canonical argument list; the clone
/// binds each template parameter as an alias to its argument inside a fresh
/// instance scope.
pub fn instantiate_template(
    ctx: &mut CompilationContext,
    decl: AstIndex,
    args: &[AstIndex],
    loc: SourceLoc,
) -> Fallible<AstIndex> {
    let (name, parent_scope, own_scope, template_params) = match ctx.node(decl).data {
        AstData::StructDecl { name, parent_scope, scope, template_params, .. } => {
            (name, parent_scope, scope, template_params)
        }
        AstData::FunctionDecl { name, parent_scope, scope, template_params, .. } => {
            (name, parent_scope, scope, template_params)
        }
        _ => {
            return Err(ctx.fatal(
                DiagKind::Type,
                loc,
                "template arguments applied to a non-template declaration".to_string(),
            ));
        }
    };

    let params = ctx.list(template_params);
    if params.len() != args.len() {
        let message = format!(
            "template '{}' expects {} argument(s), got {}",
            ctx.name(name),
            params.len(),
            args.len()
        );
        ctx.error(DiagKind::Type, loc, message);
        return Ok(ctx.common.error_node);
    }

    let key_args: Vec<AstIndex> = args.iter().map(|&a| canonical_entity(ctx, a)).collect();
    if let Some(&instance) = ctx.template_instances.get(&(decl, key_args.clone())) {
        return Ok(instance);
    }

    let instance_scope =
        ctx.new_scope(ScopeKind::NoScope, parent_scope, AstIndex::UNDEF, "template-instance");
    for (param, &arg) in params.iter().zip(&key_args) {
        if let Some(param_name) = ctx.node(*param).decl_name() {
            ctx.bind_symbol(instance_scope, param_name, arg);
        }
    }

    let mut cloner = Cloner::new();
    // the declaration's own scope is re-parented under the instance scope so
    // parameter names resolve to the bound arguments
    let kind = ctx.scope(own_scope).kind;
    let debug_name = format!("{}!", ctx.name(name));
    let cloned_scope = ctx.new_scope(kind, instance_scope, AstIndex::UNDEF, debug_name);
    cloner.scope_map.insert(own_scope, cloned_scope);

    let instance = clone_node_forced(ctx, &mut cloner, decl);
    match &mut ctx.node_mut(instance).data {
        AstData::StructDecl { template_params, .. }
        | AstData::FunctionDecl { template_params, .. } => *template_params = PoolSlice::EMPTY,
        _ => {}
    }
    // the instance is anonymous in the scope tree: never registered by name
    ctx.node_mut(instance).set_prop_state(Prop::RegisterSelf, PropState::Calculated);
    ctx.node_mut(instance).advance_state(AstState::NameRegisterSelfDone);
    if ctx.kind_of(instance) == AstKind::FunctionDecl {
        ctx.all_functions.push(instance);
    }

    ctx.template_instances.insert((decl, key_args), instance);
    analysis::require_register_nested(ctx, instance)?;
    Ok(instance)
}

/// Canonical node for a template argument, so `Box[i32]` written in two
/// places shares one instance.
fn canonical_entity(ctx: &CompilationContext, node: AstIndex) -> AstIndex {
    match ctx.node(node).data {
        AstData::TypeBasic { basic } => ctx.basic_type(basic),
        AstData::NameUse { entity, .. } if entity.is_defined() => entity,
        _ => node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;

    fn setup(source: &str, config: CompilerConfig) -> (CompilationContext, AstIndex) {
        let mut ctx = CompilationContext::new(config);
        let file = ctx.add_file("test.mica", source);
        let module = crate::parser::parse_module_file(&mut ctx, file);
        ctx.add_module(module, file);
        (ctx, module)
    }

    fn registered_names(ctx: &CompilationContext, module: AstIndex) -> Vec<String> {
        let AstData::Module { scope, .. } = ctx.node(module).data else { panic!() };
        ctx.scope(scope).symbols.keys().map(|&id| ctx.name(id).to_string()).collect()
    }

    #[test]
    fn test_version_selects_enabled_branch() {
        let config = CompilerConfig::new().with_version("linux").unwrap();
        let (mut ctx, module) = setup(
            "module m;\n\
             #version(linux) { enum A = 1; } else { enum B = 2; }\n",
            config,
        );
        analysis::require_register_nested(&mut ctx, module).unwrap();
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        assert_eq!(registered_names(&ctx, module), vec!["A"]);
    }

    #[test]
    fn test_version_disabled_selects_else() {
        let (mut ctx, module) = setup(
            "module m;\n\
             #version(windows) { enum A = 1; } else { enum B = 2; }\n",
            CompilerConfig::default(),
        );
        analysis::require_register_nested(&mut ctx, module).unwrap();
        assert_eq!(registered_names(&ctx, module), vec!["B"]);
    }

    #[test]
    fn test_unknown_version_reports() {
        let (mut ctx, module) = setup(
            "module m;\n#version(solaris) { enum A = 1; }\n",
            CompilerConfig::default(),
        );
        // 'solaris' lexes fine but is not a built-in version id
        analysis::require_register_nested(&mut ctx, module).unwrap();
        assert_eq!(ctx.diagnostics.count_of(DiagKind::StaticExpansion), 1);
        assert!(registered_names(&ctx, module).is_empty());
    }

    #[test]
    fn test_static_if_with_define() {
        let config = CompilerConfig::new().with_define("FEATURE", 1);
        let (mut ctx, module) = setup(
            "module m;\n#if(FEATURE) { i32 on = 1; } else { i32 off = 0; }\n",
            config,
        );
        analysis::require_register_nested(&mut ctx, module).unwrap();
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        assert_eq!(registered_names(&ctx, module), vec!["on"]);
    }

    #[test]
    fn test_static_if_sees_forward_constant() {
        // the condition references a constant declared AFTER the #if
        let (mut ctx, module) = setup(
            "module m;\n\
             #if(LATER) { i32 chosen = 1; }\n\
             enum LATER = 1;\n",
            CompilerConfig::default(),
        );
        analysis::require_register_nested(&mut ctx, module).unwrap();
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let names = registered_names(&ctx, module);
        assert_eq!(names, vec!["LATER", "chosen"]);
    }

    #[test]
    fn test_expansion_preserves_order() {
        let config = CompilerConfig::new().with_version("linux").unwrap();
        let (mut ctx, module) = setup(
            "module m;\n\
             enum first = 1;\n\
             #version(linux) { enum second = 2; enum third = 3; }\n\
             enum fourth = 4;\n",
            config,
        );
        analysis::require_register_nested(&mut ctx, module).unwrap();
        let AstData::Module { items, .. } = ctx.node(module).data else { panic!() };
        let order: Vec<String> = ctx
            .list(items)
            .iter()
            .filter_map(|&i| ctx.node(i).decl_name())
            .map(|id| ctx.name(id).to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn test_nested_conditionals_expand() {
        let config = CompilerConfig::new().with_version("linux").unwrap().with_define("DEEP", 1);
        let (mut ctx, module) = setup(
            "module m;\n\
             #version(linux) {\n\
               #if(DEEP) { enum inner = 1; }\n\
             }\n",
            config,
        );
        analysis::require_register_nested(&mut ctx, module).unwrap();
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        assert_eq!(registered_names(&ctx, module), vec!["inner"]);
    }

    #[test]
    fn test_static_assert_failure_reports() {
        let (mut ctx, module) = setup(
            "module m;\n#assert(0, \"must not build\");\n",
            CompilerConfig::default(),
        );
        analysis::require_register_nested(&mut ctx, module).unwrap();
        assert_eq!(ctx.diagnostics.count_of(DiagKind::StaticAssert), 1);
        let messages: Vec<&str> =
            ctx.diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert!(messages[0].contains("must not build"));
    }

    #[test]
    fn test_foreach_expands_alias_array() {
        let (mut ctx, module) = setup(
            "module m;\n\
             void f() { }\n\
             void g() { }\n\
             void h() { }\n\
             alias handlers = [f, g, h];\n\
             #foreach(i, v; handlers) { enum u64 slot = i; }\n",
            CompilerConfig::default(),
        );
        analysis::require_register_nested(&mut ctx, module).unwrap();
        // the three clones share the name `slot`, so registration reports
        // duplicates; the expansion itself is what this test pins down
        let AstData::Module { items, .. } = ctx.node(module).data else { panic!() };
        let slots: Vec<AstIndex> = ctx
            .list(items)
            .into_iter()
            .filter(|&i| {
                matches!(ctx.node(i).data, AstData::EnumMember { name, .. } if ctx.name(name) == "slot")
            })
            .collect();
        assert_eq!(slots.len(), 3);
    }
}
