//! Mica compiler library.
//!
//! The front end and mid end of the Mica language: parsing into an
//! arena-allocated AST, multi-pass semantic analysis driven by on-demand
//! lazy properties with cycle detection, and SSA IR construction. The
//! result of a successful compile is a [`CompilationContext`] whose IR
//! store holds one SSA function per generated body, ready for a code
//! generator.
//!
//! ```rust,ignore
//! use micac::{compile_sources, CompilerConfig};
//!
//! let config = CompilerConfig::new().with_version("linux")?;
//! let ctx = compile_sources(config, &[("app.mica", source)])?;
//! for func in &ctx.ir.functions {
//!     // hand off to the backend
//! }
//! ```

pub mod analysis;
pub mod arena;
pub mod ast;
pub mod config;
pub mod context;
pub mod errors;
pub mod eval;
pub mod interner;
pub mod ir;
pub mod irgen;
pub mod lexer;
pub mod parser;
pub mod register;
pub mod resolve;
pub mod scope;
pub mod typecheck;

pub use config::CompilerConfig;
pub use context::CompilationContext;
pub use errors::{CompileError, DiagKind, Diagnostic};

use ast::AstIndex;
use errors::Fallible;
use tracing::debug;

/// Run semantic analysis only: parse, register, resolve and type check
/// every declaration of every module.
pub fn analyze_sources(
    config: CompilerConfig,
    sources: &[(&str, &str)],
) -> Result<CompilationContext, CompileError> {
    run_pipeline(config, sources, false)
}

/// The full pipeline: semantic analysis, then IR generation for every
/// function body.
pub fn compile_sources(
    config: CompilerConfig,
    sources: &[(&str, &str)],
) -> Result<CompilationContext, CompileError> {
    run_pipeline(config, sources, true)
}

fn run_pipeline(
    config: CompilerConfig,
    sources: &[(&str, &str)],
    gen_ir: bool,
) -> Result<CompilationContext, CompileError> {
    let mut ctx = CompilationContext::new(config);

    // parse every file and build the package tree
    for (name, source) in sources {
        let file = ctx.add_file(*name, *source);
        let module = parser::parse_module_file(&mut ctx, file);
        ctx.add_module(module, file);
    }
    debug!(modules = ctx.modules.len(), "parsed");

    // a fatal error unwinds to here; its diagnostic is already recorded
    let _ = drive(&mut ctx, gen_ir);

    if !ctx.diagnostics.is_empty() {
        return Err(CompileError::Aborted(ctx.rendered_diagnostics()));
    }
    Ok(ctx)
}

/// For each module, require `type_check_done` on all declarations, then
/// require `ir_gen_done` on each function body.
fn drive(ctx: &mut CompilationContext, gen_ir: bool) -> Fallible<()> {
    let modules: Vec<AstIndex> = ctx.modules.clone();
    for &module in &modules {
        analysis::require_register_nested(ctx, module)?;
    }
    for &module in &modules {
        analysis::require_type_check(ctx, module)?;
    }
    // IR is only generated from a clean front end; with errors pending the
    // partial results stay in the arenas and are never consumed
    if gen_ir && ctx.diagnostics.is_empty() {
        // template instances may be appended while generating; index loop
        let mut i = 0;
        while i < ctx.all_functions.len() {
            let func = ctx.all_functions[i];
            analysis::require_ir_gen(ctx, func)?;
            i += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_minimal_module() {
        let ctx = analyze_sources(
            CompilerConfig::default(),
            &[("a.mica", "module a;\ni32 x = 3;\n")],
        )
        .expect("clean analysis");
        assert_eq!(ctx.modules.len(), 1);
    }

    #[test]
    fn test_compile_reports_all_errors() {
        let err = analyze_sources(
            CompilerConfig::default(),
            &[(
                "a.mica",
                "module a;\ni32 x = missing_one;\ni32 y = missing_two;\n",
            )],
        )
        .unwrap_err();
        let CompileError::Aborted(messages) = err else { panic!("expected Aborted") };
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("missing_one"));
        assert!(messages[1].contains("missing_two"));
    }

    #[test]
    fn test_compile_generates_ir_for_each_function() {
        let ctx = compile_sources(
            CompilerConfig::default(),
            &[(
                "a.mica",
                "module a;\n\
                 i32 add(i32 a, i32 b) { return a + b; }\n\
                 i32 twice(i32 v) { return add(v, v); }\n",
            )],
        )
        .expect("clean compile");
        assert_eq!(ctx.ir.functions.len(), 2);
        for func in &ctx.ir.functions {
            assert!(!func.external);
            assert!(!func.blocks.is_empty());
        }
    }
}
