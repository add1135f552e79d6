//! Textual IR dump, for `--dump-ir` and debugging.
//!
//! The format is not stable; the backend consumes the IR in memory.

use std::fmt::Write;

use super::{block_flags, IrFunction, IrIndex, IrKind, IrOpcode, IrStore};
use crate::interner::Interner;

pub fn print_function(interner: &Interner, store: &IrStore, func: &IrFunction) -> String {
    let mut out = String::new();
    let name = interner.resolve(func.name);

    if func.external {
        let lib = if func.library.is_defined() {
            format!(" from \"{}\"", interner.resolve(func.library))
        } else {
            String::new()
        };
        let _ = writeln!(out, "extern func @{}{}", name, lib);
        return out;
    }
    if let Some(n) = func.syscall_number {
        let _ = writeln!(out, "func @{} (syscall {})", name, n);
    } else {
        let _ = writeln!(out, "func @{}", name);
    }

    // blocks in layout order
    let mut block = IrFunction::ENTRY_BLOCK;
    loop {
        print_block(&mut out, store, func, block);
        let next = func.block(block).next_block;
        if next.is_undef() {
            break;
        }
        block = next;
    }
    out
}

fn print_block(out: &mut String, store: &IrStore, func: &IrFunction, block: IrIndex) {
    let b = func.block(block);
    let mut tags = Vec::new();
    if block == IrFunction::ENTRY_BLOCK {
        tags.push("entry");
    }
    if block == IrFunction::EXIT_BLOCK {
        tags.push("exit");
    }
    if b.flags & block_flags::LOOP_HEADER != 0 {
        tags.push("loop");
    }
    let preds: Vec<String> =
        func.pool.get(b.predecessors).iter().map(|p| format!("@{}", p.index())).collect();

    let _ = write!(out, "@{}:", block.index());
    if !tags.is_empty() {
        let _ = write!(out, "  ; {}", tags.join(", "));
    }
    if !preds.is_empty() {
        let _ = write!(out, "  ; preds: {}", preds.join(" "));
    }
    let _ = writeln!(out);

    for phi in func.block_phis(block) {
        let p = func.phi(phi);
        let args: Vec<String> = func
            .pool
            .get(p.args)
            .iter()
            .zip(func.pool.get(b.predecessors))
            .map(|(arg, pred)| format!("(@{}: {})", pred.index(), value(store, *arg)))
            .collect();
        let _ = writeln!(out, "  {} = phi {}", value(store, p.result), args.join(", "));
    }

    for instr in func.block_instrs(block) {
        let header = func.instr(instr);
        let mut line = String::new();
        if let Some(result) = func.instr_result(instr) {
            let _ = write!(line, "{} = ", value(store, result));
        }
        let _ = write!(line, "{}", header.op.name());
        if header.cond != super::IrCond::None {
            let _ = write!(line, ".{}", header.cond.name());
        }
        if header.arg_size != 0 && !matches!(header.op, IrOpcode::Jump) {
            let _ = write!(line, ".{}", header.arg_size * 8);
        }
        let args: Vec<String> =
            func.instr_args(instr).iter().map(|&a| value(store, a)).collect();
        if !args.is_empty() {
            let _ = write!(line, " {}", args.join(", "));
        }
        if matches!(header.op, IrOpcode::BranchUnary | IrOpcode::BranchBinary) {
            let succs: Vec<String> =
                func.pool.get(b.successors).iter().map(|s| format!("@{}", s.index())).collect();
            let _ = write!(line, " -> {}", succs.join(", "));
        }
        let _ = writeln!(out, "  {}", line);
    }
}

fn value(store: &IrStore, v: IrIndex) -> String {
    match v.kind() {
        IrKind::Undefined => "undef".to_string(),
        IrKind::VirtReg => format!("%{}", v.index()),
        IrKind::PhysReg => format!("r{}", v.phys_index()),
        IrKind::ConstSmall => v.small_value().to_string(),
        IrKind::ConstBig => store.const_value(v).to_string(),
        IrKind::ConstAggregate => format!("aggr#{}", v.index()),
        IrKind::ConstZero => "zero".to_string(),
        IrKind::BasicBlock => format!("@{}", v.index()),
        IrKind::StackSlot => format!("slot#{}", v.index()),
        IrKind::Global => format!("@g{}", v.index()),
        IrKind::Variable => format!("var#{}", v.index()),
        IrKind::Func => format!("@f{}", v.index()),
        IrKind::Instr => format!("instr#{}", v.index()),
        IrKind::Phi => format!("phi#{}", v.index()),
        IrKind::Type | IrKind::Array => format!("<{}>", v.index()),
    }
}
