//! End-to-end pipeline scenarios: source text in, SSA IR out.

use micac::analysis;
use micac::ast::AstData;
use micac::context::CompilationContext;
use micac::ir::{IrFunction, IrIndex, IrKind, IrOpcode, IrStore};
use micac::{analyze_sources, compile_sources, CompileError, CompilerConfig, DiagKind};

fn find_function<'a>(ctx: &'a CompilationContext, name: &str) -> &'a IrFunction {
    ctx.ir
        .functions
        .iter()
        .find(|f| ctx.interner.resolve(f.name) == name)
        .unwrap_or_else(|| panic!("no IR function named {}", name))
}

/// Structural IR invariants: terminator uniqueness, sealing completeness,
/// trivial-phi absence, single definition per live vreg.
fn verify_function(store: &IrStore, func: &IrFunction) {
    if func.external {
        return;
    }
    for (bi, block) in func.blocks.iter().enumerate() {
        let handle = IrIndex::new(IrKind::BasicBlock, bi as u32);
        let instrs = func.block_instrs(handle);
        for (pos, &instr) in instrs.iter().enumerate() {
            let is_last = pos + 1 == instrs.len();
            assert_eq!(
                func.instr(instr).op.is_terminator(),
                is_last,
                "@{}: terminator not in final position",
                bi
            );
        }
        if !instrs.is_empty() {
            assert!(block.is_finished(), "@{}: non-empty block without terminator", bi);
        }
        assert!(block.is_sealed(), "@{}: unsealed block in final IR", bi);

        let pred_count = block.predecessors.len;
        for phi in func.block_phis(handle) {
            let args = func.pool.get(func.phi(phi).args);
            assert_eq!(args.len() as u32, pred_count, "@{}: phi arity != pred count", bi);
            assert!(args.len() >= 2, "@{}: unary phi survived", bi);
            // trivial-phi absence
            let result = func.phi(phi).result;
            let mut distinct = Vec::new();
            for &arg in args {
                if arg != result && !distinct.contains(&arg) {
                    distinct.push(arg);
                }
            }
            assert!(distinct.len() >= 2, "@{}: trivial phi survived finalize", bi);
        }
    }
    for (i, vreg) in func.vregs.iter().enumerate() {
        assert!(!vreg.removed, "tombstone vreg v{} after finalize", i);
        let handle = IrIndex::new(IrKind::VirtReg, i as u32);
        match vreg.definition.kind() {
            IrKind::Instr => assert_eq!(func.instr_result(vreg.definition), Some(handle)),
            IrKind::Phi => assert_eq!(func.phi(vreg.definition).result, handle),
            other => panic!("v{} defined by {:?}", i, other),
        }
    }
    let _ = store;
}

fn verify_all(ctx: &CompilationContext) {
    for func in &ctx.ir.functions {
        verify_function(&ctx.ir, func);
    }
}

// ---- scenario 1: hello world under #version ----

const HELLO: &str = "module app;\n\
    #version(windows) {\n\
      @extern(module, \"kernel32\")\n\
      noreturn ExitProcess(u32 code);\n\
      noreturn stop(u32 code) { ExitProcess(code); }\n\
    }\n\
    #version(linux) {\n\
      @extern(syscall, 60)\n\
      noreturn sys_exit(u32 code);\n\
      noreturn stop(u32 code) { sys_exit(code); }\n\
    }\n\
    void main() { stop(0); }\n";

#[test]
fn scenario_hello_world_windows() {
    let config = CompilerConfig::new().with_version("windows").unwrap();
    let ctx = compile_sources(config, &[("app.mica", HELLO)]).expect("clean compile");
    verify_all(&ctx);

    // exactly one external reference to ExitProcess, no syscall anywhere
    let externs: Vec<&IrFunction> =
        ctx.ir.functions.iter().filter(|f| f.library.is_defined()).collect();
    assert_eq!(externs.len(), 1);
    assert_eq!(ctx.interner.resolve(externs[0].name), "ExitProcess");
    assert_eq!(ctx.interner.resolve(externs[0].library), "kernel32");
    for func in &ctx.ir.functions {
        for instr in &func.instrs {
            assert_ne!(instr.op, IrOpcode::Syscall);
        }
    }
}

#[test]
fn scenario_hello_world_linux() {
    let config = CompilerConfig::new().with_version("linux").unwrap();
    let ctx = compile_sources(config, &[("app.mica", HELLO)]).expect("clean compile");
    verify_all(&ctx);

    // one syscall instruction with immediate 60, no external module refs
    assert!(ctx.ir.functions.iter().all(|f| !f.library.is_defined()));
    let mut syscalls = 0;
    for func in &ctx.ir.functions {
        for (i, instr) in func.instrs.iter().enumerate() {
            if instr.op == IrOpcode::Syscall {
                syscalls += 1;
                let handle = IrIndex::new(IrKind::Instr, i as u32);
                let number = func.instr_args(handle)[0];
                assert_eq!(ctx.ir.const_value(number), 60);
            }
        }
    }
    assert_eq!(syscalls, 1);
}

// ---- scenario 2: forward alias chain ----

#[test]
fn scenario_forward_alias_chain() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             alias A = B;\n\
             alias B = i32;\n\
             i32 f() { A x = 3; return x; }\n",
        )],
    )
    .expect("no cycle error");
    verify_all(&ctx);
    // the aliases leave no trace in the IR: one function, i32-sized ops
    assert_eq!(ctx.ir.functions.len(), 1);
}

#[test]
fn scenario_alias_cycle_detected_once() {
    let err = analyze_sources(
        CompilerConfig::default(),
        &[("a.mica", "module a;\nalias X = Y;\nalias Y = X;\n")],
    )
    .unwrap_err();
    let CompileError::Aborted(messages) = err else { panic!() };
    let cycles: Vec<&String> =
        messages.iter().filter(|m| m.contains("circular dependency")).collect();
    assert_eq!(cycles.len(), 1);
}

// ---- scenario 3: SSA of a diamond ----

#[test]
fn scenario_ssa_diamond() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             i32 f(i32 c) {\n\
               i32 x = 1;\n\
               if (c > 0) { x = 2; } else { x = 3; }\n\
               return x;\n\
             }\n",
        )],
    )
    .expect("clean compile");
    verify_all(&ctx);

    let f = find_function(&ctx, "f");
    // exactly one phi: the merge of x
    let mut phis = Vec::new();
    for (bi, _) in f.blocks.iter().enumerate() {
        let handle = IrIndex::new(IrKind::BasicBlock, bi as u32);
        phis.extend(f.block_phis(handle));
    }
    assert_eq!(phis.len(), 1);
    let args: Vec<i64> =
        f.pool.get(f.phi(phis[0]).args).iter().map(|&a| ctx.ir.const_value(a)).collect();
    assert_eq!(args, vec![2, 3]);

    // the dead initial assignment x = 1 feeds nothing
    for (i, _) in f.instrs.iter().enumerate() {
        let handle = IrIndex::new(IrKind::Instr, i as u32);
        for &arg in f.instr_args(handle) {
            if arg.kind() == IrKind::ConstSmall {
                assert_ne!(ctx.ir.const_value(arg), 1, "x = 1 should be dead");
            }
        }
    }
}

// ---- scenario 4: trivial-phi elimination ----

#[test]
fn scenario_trivial_phi_eliminated() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             i32 f(i32 c) {\n\
               i32 y = 7;\n\
               while (c > 0) { }\n\
               return y;\n\
             }\n",
        )],
    )
    .expect("clean compile");
    verify_all(&ctx);

    let f = find_function(&ctx, "f");
    // no phi survives: y is never written in the loop, c never changes
    for (bi, _) in f.blocks.iter().enumerate() {
        let handle = IrIndex::new(IrKind::BasicBlock, bi as u32);
        assert!(f.block_phis(handle).is_empty(), "trivial phi survived in @{}", bi);
    }
    // the outside read resolved straight to the pre-loop definition
    let exit_instrs = f.block_instrs(IrFunction::EXIT_BLOCK);
    let ret = *exit_instrs.last().unwrap();
    assert_eq!(f.instr(ret).op, IrOpcode::RetVal);
    assert_eq!(ctx.ir.const_value(f.instr_args(ret)[0]), 7);
}

// ---- scenario 5: static foreach over an alias array ----

#[test]
fn scenario_static_foreach_expansion() {
    // driven below the public pipeline so the duplicate-name diagnostics of
    // the clones do not abort the inspection
    let mut ctx = CompilationContext::new(CompilerConfig::default());
    let file = ctx.add_file(
        "a.mica",
        "module a;\n\
         void f() { }\n\
         void g() { }\n\
         void h() { }\n\
         alias handlers = [f, g, h];\n\
         #foreach(i, v; handlers) { enum u64 slot = i; }\n",
    );
    let module = micac::parser::parse_module_file(&mut ctx, file);
    ctx.add_module(module, file);
    analysis::require_register_nested(&mut ctx, module).unwrap();

    let AstData::Module { items, .. } = ctx.node(module).data else { panic!() };
    let slots: Vec<_> = ctx
        .list(items)
        .into_iter()
        .filter(|&i| {
            matches!(ctx.node(i).data,
                AstData::EnumMember { name, .. } if ctx.interner.resolve(name) == "slot")
        })
        .collect();
    assert_eq!(slots.len(), 3);
    let values: Vec<i64> =
        slots.iter().map(|&s| micac::eval::member_value(&mut ctx, s).unwrap()).collect();
    assert_eq!(values, vec![0, 1, 2]);
}

// ---- scenario 6: module/package conflict ----

#[test]
fn scenario_module_conflict() {
    let err = analyze_sources(
        CompilerConfig::default(),
        &[
            ("first.mica", "module a.b;\ni32 x = 1;\n"),
            ("second.mica", "module a.b;\ni32 y = 2;\n"),
        ],
    )
    .unwrap_err();
    let CompileError::Aborted(messages) = err else { panic!() };
    let conflicts: Vec<&String> =
        messages.iter().filter(|m| m.contains("declared by both")).collect();
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].contains("first.mica"));
    assert!(conflicts[0].contains("second.mica"));
}

#[test]
fn scenario_module_conflict_keeps_one_module_lookupable() {
    let mut ctx = CompilationContext::new(CompilerConfig::default());
    for (name, source) in [
        ("first.mica", "module a.b;\ni32 x = 1;\n"),
        ("second.mica", "module a.b;\ni32 y = 2;\n"),
    ] {
        let file = ctx.add_file(name, source);
        let module = micac::parser::parse_module_file(&mut ctx, file);
        ctx.add_module(module, file);
    }
    // neither module was dropped, and the path maps to exactly one of them
    assert_eq!(ctx.modules.len(), 2);
    assert_eq!(ctx.diagnostics.count_of(DiagKind::Name), 1);
    let path = ctx.intern("a.b");
    let winner = ctx.module_paths.get(&path).copied().expect("path still resolves");
    assert_eq!(winner, ctx.modules[0]);
}

// ---- cross-cutting checks ----

#[test]
fn imports_make_names_visible() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[
            ("lib.mica", "module lib;\ni32 five() { return 5; }\n"),
            (
                "app.mica",
                "module app;\nimport lib;\ni32 main() { return five(); }\n",
            ),
        ],
    )
    .expect("clean compile");
    verify_all(&ctx);
    assert_eq!(ctx.ir.functions.len(), 2);
}

#[test]
fn string_literal_becomes_slice_constant() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             @extern(syscall, 1)\n\
             i64 sys_write(i64 fd, u8* buf, u64 len);\n\
             void main() {\n\
               u8[] msg = \"hi\\n\";\n\
               sys_write(1, msg.ptr, msg.length);\n\
             }\n",
        )],
    )
    .expect("clean compile");
    verify_all(&ctx);

    // a read-only zero-terminated global plus a {length, ptr} aggregate
    assert_eq!(ctx.ir.globals.len(), 1);
    let global = &ctx.ir.globals[0];
    assert!(global.readonly);
    assert_eq!(global.data, b"hi\n\0");
    assert_eq!(ctx.ir.aggregates.len(), 1);
    let agg = &ctx.ir.aggregates[0];
    assert_eq!(ctx.ir.const_value(agg.elems[0]), 3);
    assert_eq!(agg.elems[1].kind(), IrKind::Global);
}

#[test]
fn short_circuit_generates_control_flow() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             i32 f(i32 a, i32 b) {\n\
               if (a > 0 && b > 0) { return 1; }\n\
               return 0;\n\
             }\n",
        )],
    )
    .expect("clean compile");
    verify_all(&ctx);
    let f = find_function(&ctx, "f");
    // two conditional branches: one per operand of &&
    let branches =
        f.instrs.iter().filter(|i| i.op == IrOpcode::BranchBinary).count();
    assert_eq!(branches, 2);
}

#[test]
fn aggregates_above_eight_bytes_pass_by_pointer() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             struct Pair { i64 a; i64 b; }\n\
             i64 sum(Pair p) { return p.a + p.b; }\n\
             i64 main() {\n\
               Pair p;\n\
               p.a = 1;\n\
               p.b = 2;\n\
               return sum(p);\n\
             }\n",
        )],
    )
    .expect("clean compile");
    verify_all(&ctx);

    let sum = find_function(&ctx, "sum");
    let sig = &ctx.ir.func_sigs[sum.sig as usize];
    assert_eq!(sig.params.len(), 1);
    assert_eq!(sig.params[0], micac::ir::IrBasic::Ptr.handle());
}

#[test]
fn identical_type_asts_share_ir_types() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             u8* f(u8* p) { return p; }\n\
             u8* g(u8* q) { return q; }\n",
        )],
    )
    .expect("clean compile");
    let f = find_function(&ctx, "f");
    let g = find_function(&ctx, "g");
    let sf = &ctx.ir.func_sigs[f.sig as usize];
    let sg = &ctx.ir.func_sigs[g.sig as usize];
    assert_eq!(sf.params[0], sg.params[0]);
    assert_eq!(sf.ret, sg.ret);
}

#[test]
fn infinite_loop_with_break_compiles() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             i64 f() {\n\
               i64 i = 0;\n\
               while (true) {\n\
                 i = i + 1;\n\
                 if (i > 10) { break; }\n\
               }\n\
               return i;\n\
             }\n",
        )],
    )
    .expect("clean compile");
    verify_all(&ctx);
    let f = find_function(&ctx, "f");
    // the loop header carries the phi for i
    let phis: usize = (0..f.blocks.len())
        .map(|bi| f.block_phis(IrIndex::new(IrKind::BasicBlock, bi as u32)).len())
        .sum();
    assert_eq!(phis, 1);
}

#[test]
fn methods_and_loops_compile_together() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             struct Counter {\n\
               i64 count;\n\
               void bump() { count = count + 1; }\n\
             }\n\
             i64 main() {\n\
               Counter c;\n\
               c.count = 0;\n\
               for (i64 i = 0; i < 10; i = i + 1) {\n\
                 if (i % 2 == 0) { continue; }\n\
                 c.bump();\n\
               }\n\
               return c.count;\n\
             }\n",
        )],
    )
    .expect("clean compile");
    verify_all(&ctx);
    assert_eq!(ctx.ir.functions.len(), 2);
}

#[test]
fn compile_from_disk_round_trip() {
    // the CLI path: sources live on disk
    let dir = tempfile::tempdir().expect("tempdir");
    let lib_path = dir.path().join("lib.mica");
    let app_path = dir.path().join("app.mica");
    std::fs::write(&lib_path, "module lib;\ni32 seven() { return 7; }\n").unwrap();
    std::fs::write(&app_path, "module app;\nimport lib;\ni32 main() { return seven(); }\n")
        .unwrap();

    let lib_src = std::fs::read_to_string(&lib_path).unwrap();
    let app_src = std::fs::read_to_string(&app_path).unwrap();
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[
            (lib_path.to_str().unwrap(), &lib_src),
            (app_path.to_str().unwrap(), &app_src),
        ],
    )
    .expect("clean compile");
    verify_all(&ctx);
}

#[test]
fn templates_instantiate_through_the_pipeline() {
    let ctx = compile_sources(
        CompilerConfig::default(),
        &[(
            "a.mica",
            "module a;\n\
             struct Box[T] { T* item; }\n\
             T pick[T](T a, T b) { return a; }\n\
             i32 main() {\n\
               Box[i32] b;\n\
               b.item = null;\n\
               return pick[i32](1, 2);\n\
             }\n",
        )],
    )
    .expect("clean compile");
    verify_all(&ctx);
    // main plus the pick[i32] instance
    assert_eq!(ctx.ir.functions.len(), 2);
}
