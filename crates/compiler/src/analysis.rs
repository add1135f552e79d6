//! The lazy-property analysis driver.
//!
//! Semantic analysis tolerates forward references and out-of-order
//! declarations by calculating properties on demand: any pass may call
//! `require(node, prop)` for any node, and the driver transitions through
//! whatever intermediate states are still missing. A stack of in-progress
//! (node, property) pairs detects circular dependencies; the cycle error
//! lists the stack path from the offending entry to the top. This stack is
//! the only sequencing discipline between passes.

use crate::ast::{AstIndex, AstKind, AstData, Prop, PropState};
use crate::context::CompilationContext;
use crate::errors::{DiagKind, Fallible};
use crate::{irgen, register, resolve, typecheck};
use tracing::trace;

/// Require `prop` (and every property below it) to be calculated on `node`.
/// Idempotent; re-entrant from any pass.
pub fn require(ctx: &mut CompilationContext, node: AstIndex, prop: Prop) -> Fallible<()> {
    for p in Prop::ALL {
        require_single(ctx, node, p)?;
        if p == prop {
            break;
        }
    }
    Ok(())
}

pub fn require_register_self(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    require(ctx, node, Prop::RegisterSelf)
}

pub fn require_register_nested(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    require(ctx, node, Prop::RegisterNested)
}

pub fn require_name_resolve(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    require(ctx, node, Prop::NameResolve)
}

pub fn require_type_check(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    require(ctx, node, Prop::TypeCheck)
}

pub fn require_ir_gen(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    require(ctx, node, Prop::IrGen)
}

fn require_single(ctx: &mut CompilationContext, node: AstIndex, prop: Prop) -> Fallible<()> {
    match ctx.node(node).prop_state(prop) {
        PropState::Calculated => return Ok(()),
        PropState::Calculating => return Err(report_cycle(ctx, node, prop)),
        PropState::NotCalculated => {}
    }

    // Template declarations are only registered by name; their bodies are
    // analyzed per instance.
    if is_template_decl(ctx, node) && prop != Prop::RegisterSelf {
        ctx.node_mut(node).set_prop_state(prop, PropState::Calculated);
        return Ok(());
    }

    trace!(node = node.0, prop = prop.name(), "require");
    ctx.node_mut(node).set_prop_state(prop, PropState::Calculating);
    ctx.analysis_stack.push((node, prop));

    let result = match prop {
        Prop::RegisterSelf => register::register_self(ctx, node),
        Prop::RegisterNested => register::register_nested(ctx, node),
        Prop::NameResolve => resolve::resolve_node(ctx, node),
        Prop::TypeCheck => typecheck::check_node(ctx, node),
        Prop::IrGen => irgen::gen_node(ctx, node),
    };

    ctx.analysis_stack.pop();
    result?;
    let n = ctx.node_mut(node);
    n.set_prop_state(prop, PropState::Calculated);
    n.advance_state(prop.done_state());
    Ok(())
}

fn is_template_decl(ctx: &CompilationContext, node: AstIndex) -> bool {
    match ctx.node(node).data {
        AstData::StructDecl { template_params, .. }
        | AstData::FunctionDecl { template_params, .. } => !template_params.is_empty(),
        _ => false,
    }
}

/// Build the cycle diagnostic: the participating (node, property) entries
/// from the first occurrence of the offender up to the top of the stack.
fn report_cycle(
    ctx: &mut CompilationContext,
    node: AstIndex,
    prop: Prop,
) -> crate::errors::Fatal {
    let start = ctx
        .analysis_stack
        .iter()
        .position(|&(n, p)| n == node && p == prop)
        .unwrap_or(0);
    let mut message = format!(
        "circular dependency: {} of '{}' depends on itself",
        prop.name(),
        describe(ctx, node)
    );
    for &(n, p) in &ctx.analysis_stack[start..] {
        message.push_str(&format!("\n  ... while computing {} of '{}'", p.name(), describe(ctx, n)));
    }
    let loc = ctx.node(node).loc;
    ctx.fatal(DiagKind::Cycle, loc, message)
}

fn describe(ctx: &CompilationContext, node: AstIndex) -> String {
    if let Some(name) = ctx.node(node).decl_name() {
        return ctx.name(name).to_string();
    }
    match ctx.node(node).kind() {
        AstKind::NameUse => {
            if let AstData::NameUse { name, .. } = ctx.node(node).data {
                ctx.name(name).to_string()
            } else {
                unreachable!()
            }
        }
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstData;
    use crate::config::CompilerConfig;
    use crate::errors::SourceLoc;

    #[test]
    fn test_require_is_idempotent() {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let node = ctx.add_node(SourceLoc::default(), AstData::BreakStmt);
        require(&mut ctx, node, Prop::NameResolve).unwrap();
        let state_after_first = ctx.node(node).state;
        require(&mut ctx, node, Prop::NameResolve).unwrap();
        assert_eq!(ctx.node(node).state, state_after_first);
        assert!(ctx.diagnostics.is_empty());
        assert!(ctx.analysis_stack.is_empty());
    }

    #[test]
    fn test_require_advances_through_intermediate_states() {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let node = ctx.add_node(SourceLoc::default(), AstData::BreakStmt);
        require(&mut ctx, node, Prop::NameResolve).unwrap();
        assert_eq!(ctx.node(node).prop_state(Prop::RegisterSelf), PropState::Calculated);
        assert_eq!(ctx.node(node).prop_state(Prop::RegisterNested), PropState::Calculated);
        assert_eq!(ctx.node(node).prop_state(Prop::NameResolve), PropState::Calculated);
        assert_eq!(ctx.node(node).prop_state(Prop::TypeCheck), PropState::NotCalculated);
    }
}
