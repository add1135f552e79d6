//! IR generation.
//!
//! A tree walk over the type-checked AST emitting through the SSA builder.
//! Scalar locals become SSA variables; aggregates and address-taken locals
//! get stack slots. Control structures are lowered through [`IrLabel`]
//! merges, so trivial joins inherit their sole predecessor block instead of
//! materializing an empty one. Short-circuit `&&`/`||` become control flow;
//! in value position they merge through a temporary SSA variable.
//!
//! Aggregates above eight bytes are passed by pointer. String literals
//! become read-only zero-terminated globals bundled with their length into
//! a `{length, ptr}` slice constant.

use std::collections::HashMap;

use crate::analysis;
use crate::ast::{
    builtin_member, flags, AstData, AstIndex, AstKind, BasicType, BinOp, UnOp, AttributeKind,
};
use crate::context::CompilationContext;
use crate::errors::{DiagKind, Fallible, SourceLoc};
use crate::ir::builder::{IrBuilder, IrLabel, RetClass};
use crate::ir::{
    IrAggregate, IrBasic, IrCond, IrFuncSig, IrFunction, IrGlobal, IrIndex, IrKind, IrOpcode,
};
use crate::typecheck;
use tracing::debug;

pub fn gen_node(ctx: &mut CompilationContext, node: AstIndex) -> Fallible<()> {
    match ctx.node(node).data {
        AstData::Module { items, .. } => {
            for item in ctx.list(items) {
                if ctx.kind_of(item) == AstKind::FunctionDecl {
                    analysis::require_ir_gen(ctx, item)?;
                }
            }
            Ok(())
        }
        AstData::FunctionDecl { .. } => gen_function(ctx, node),
        AstData::StructDecl { members, .. } => {
            for member in ctx.list(members) {
                if ctx.kind_of(member) == AstKind::FunctionDecl {
                    analysis::require_ir_gen(ctx, member)?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Where a declaration's value lives during generation.
#[derive(Debug, Clone, Copy)]
enum Place {
    /// An SSA variable handle.
    Var(IrIndex),
    /// An address value (stack slot, global, or computed pointer).
    Addr(IrIndex),
}

/// Result of generating an expression.
#[derive(Debug, Clone, Copy)]
enum ExprValue {
    Value(IrIndex),
    /// Address of the value; loaded on demand.
    Addr(IrIndex),
    Void,
}

/// Whether control continues after a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Diverged,
}

enum ContTarget {
    Block(IrIndex),
    Label(IrLabel),
}

struct LoopFrame {
    break_label: IrLabel,
    cont: ContTarget,
}

struct Gen {
    builder: IrBuilder,
    places: HashMap<AstIndex, Place>,
    loops: Vec<LoopFrame>,
}

impl Gen {
    fn fail(&self, ctx: &mut CompilationContext, loc: SourceLoc, e: String) -> crate::errors::Fatal {
        ctx.fatal(DiagKind::Internal, loc, e)
    }
}

/// Allocate (or look up) the IR function entry for a declaration without
/// generating its body, so calls never force generation order.
pub fn ensure_ir_func(ctx: &mut CompilationContext, decl: AstIndex) -> Fallible<u32> {
    let AstData::FunctionDecl { name, ir_index, signature, body, .. } = ctx.node(decl).data
    else {
        let loc = ctx.node(decl).loc;
        return Err(ctx.fatal(DiagKind::Internal, loc, "not a function declaration".to_string()));
    };
    if ir_index > 0 {
        return Ok(ir_index - 1);
    }

    let sig = lower_func_sig(ctx, signature)?;
    let mut func = IrFunction::new(name, sig);
    func.inline_hint = ctx.node(decl).has_flag(flags::IS_INLINE);
    if body.is_undef() {
        func.external = true;
    }
    if let Some(info) = ctx.attr_info(decl) {
        for &attr in info.attributes.clone().iter() {
            if let AstData::Attribute { kind } = ctx.node(attr).data {
                match kind {
                    AttributeKind::ExternModule { library } => {
                        func.external = true;
                        func.library = library;
                    }
                    AttributeKind::ExternSyscall { number } => {
                        func.syscall_number = Some(number);
                    }
                }
            }
        }
    }

    let index = ctx.ir.functions.len() as u32;
    ctx.ir.functions.push(func);
    if let AstData::FunctionDecl { ir_index: slot, .. } = &mut ctx.node_mut(decl).data {
        *slot = index + 1;
    }
    Ok(index)
}

fn lower_func_sig(ctx: &mut CompilationContext, signature: AstIndex) -> Fallible<u32> {
    let AstData::FunctionSignature { return_type, params } = ctx.node(signature).data else {
        let loc = ctx.node(signature).loc;
        return Err(ctx.fatal(DiagKind::Internal, loc, "malformed function signature".to_string()));
    };
    let mut lowered = Vec::new();
    for param in ctx.list(params) {
        let pt = ctx.get_type(param);
        let ir = if typecheck::is_pass_by_ptr(ctx, pt) {
            IrBasic::Ptr.handle()
        } else {
            ir_type_of(ctx, pt)
        };
        lowered.push(ir);
    }
    let ret = ir_type_of(ctx, return_type);
    Ok(ctx.ir.add_func_sig(IrFuncSig { params: lowered, ret }))
}

/// Lower an AST type to its IR type handle.
pub fn ir_type_of(ctx: &mut CompilationContext, ty: AstIndex) -> IrIndex {
    if ty.is_undef() {
        return IrBasic::I64.handle();
    }
    match ctx.node(ty).data {
        AstData::TypeBasic { basic } => match basic {
            BasicType::Noreturn => IrBasic::Noreturn.handle(),
            BasicType::Void => IrBasic::Void.handle(),
            BasicType::Bool => IrBasic::I8.handle(),
            BasicType::Null => IrBasic::Ptr.handle(),
            BasicType::I8 => IrBasic::I8.handle(),
            BasicType::I16 => IrBasic::I16.handle(),
            BasicType::I32 => IrBasic::I32.handle(),
            BasicType::I64 => IrBasic::I64.handle(),
            BasicType::U8 => IrBasic::U8.handle(),
            BasicType::U16 => IrBasic::U16.handle(),
            BasicType::U32 => IrBasic::U32.handle(),
            BasicType::U64 => IrBasic::U64.handle(),
            BasicType::F32 => IrBasic::F32.handle(),
            BasicType::F64 => IrBasic::F64.handle(),
            BasicType::Alias | BasicType::Type => IrBasic::Ptr.handle(),
        },
        AstData::TypePtr { target } => {
            let pointee = ir_type_of(ctx, target);
            ctx.ir.ptr_type(pointee)
        }
        AstData::TypeSlice { element } => {
            let elem = ir_type_of(ctx, element);
            ctx.ir.slice_type(elem)
        }
        AstData::TypeStaticArray { element, length, .. } => {
            let elem = ir_type_of(ctx, element);
            ctx.ir.array_type(elem, length)
        }
        AstData::EnumDecl { base_type, .. } => ir_type_of(ctx, base_type),
        AstData::StructDecl { .. } => lower_struct_type(ctx, ty),
        AstData::FunctionSignature { .. } => IrBasic::Ptr.handle(),
        _ => IrBasic::I64.handle(),
    }
}

fn lower_struct_type(ctx: &mut CompilationContext, decl: AstIndex) -> IrIndex {
    if let Some(&handle) = ctx.ir.struct_type_map.get(&decl) {
        return handle;
    }
    let (size, align, _) = typecheck::struct_layout_full(ctx, decl);
    let fields = typecheck::struct_fields(ctx, decl);
    let members: Vec<IrIndex> = fields
        .iter()
        .map(|&f| {
            let ft = ctx.get_type(f);
            ir_type_of(ctx, ft)
        })
        .collect();
    let index = ctx.ir.struct_types.len() as u32;
    ctx.ir.struct_types.push(crate::ir::IrStructType {
        members,
        size: size as u32,
        align: align as u32,
    });
    let handle = IrIndex::ty(crate::ir::IrTypeKind::Struct, index);
    ctx.ir.struct_type_map.insert(decl, handle);
    handle
}

fn type_size(ctx: &mut CompilationContext, ty: AstIndex) -> u8 {
    typecheck::size_of(ctx, ty).min(8) as u8
}

// ---- function generation ----

fn gen_function(ctx: &mut CompilationContext, decl: AstIndex) -> Fallible<()> {
    let slot = ensure_ir_func(ctx, decl)?;
    let AstData::FunctionDecl { name, signature, body, .. } = ctx.node(decl).data else {
        return Ok(());
    };
    if body.is_undef() {
        return Ok(()); // externs have no body to generate
    }
    debug!(name = ctx.name(name), "generating IR");
    let loc = ctx.node(decl).loc;

    let AstData::FunctionSignature { return_type, params } = ctx.node(signature).data else {
        return Ok(());
    };
    let ret_class = match typecheck::basic_of(ctx, return_type) {
        Some(BasicType::Noreturn) => RetClass::NoReturn,
        Some(BasicType::Void) => RetClass::Void,
        _ => RetClass::Value(ir_type_of(ctx, return_type)),
    };

    let sig = ctx.ir.functions[slot as usize].sig;
    let builder = IrBuilder::new(name, sig, ret_class)
        .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
    let mut g = Gen { builder, places: HashMap::new(), loops: Vec::new() };
    let inline_hint = ctx.node(decl).has_flag(flags::IS_INLINE);

    let entry = IrFunction::ENTRY_BLOCK;
    for (i, param) in ctx.list(params).into_iter().enumerate() {
        gen_param(ctx, &mut g, entry, param, i as u32)?;
    }

    let mut cur = entry;
    let flow = gen_stmt(ctx, &mut g, &mut cur, body)?;
    if flow == Flow::Next {
        let void_ret = matches!(ret_class, RetClass::Void);
        if !void_ret && !matches!(ret_class, RetClass::NoReturn) {
            let message = format!(
                "control reaches the end of function '{}' without a return",
                ctx.name(name)
            );
            ctx.error(DiagKind::Type, loc, message);
        }
        g.builder
            .add_jump(cur, IrFunction::EXIT_BLOCK)
            .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
    }

    let mut func =
        g.builder.finish().map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
    func.inline_hint = inline_hint;
    // carry over the shell's extern info (syscall wrappers may have bodies)
    func.library = ctx.ir.functions[slot as usize].library;
    func.syscall_number = ctx.ir.functions[slot as usize].syscall_number;
    ctx.ir.functions[slot as usize] = func;
    Ok(())
}

fn gen_param(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    entry: IrIndex,
    param: AstIndex,
    position: u32,
) -> Fallible<()> {
    let loc = ctx.node(param).loc;
    let pt = ctx.get_type(param);
    let by_ptr = typecheck::is_pass_by_ptr(ctx, pt);
    let ir_t = if by_ptr { IrBasic::Ptr.handle() } else { ir_type_of(ctx, pt) };
    let size = if by_ptr { 8 } else { type_size(ctx, pt) };
    let index_const = ctx.ir.int_const(position as i64);
    let value = g
        .builder
        .emit(entry, IrOpcode::Param, IrCond::None, size, &[index_const], Some(ir_t))
        .map_err(|e| g.fail(ctx, loc, e))?;

    if by_ptr {
        g.places.insert(param, Place::Addr(value));
        return Ok(());
    }
    let aggregate = typecheck::is_aggregate(ctx, pt);
    let addr_taken = ctx.node(param).has_flag(flags::IS_ADDRESS_TAKEN);
    if aggregate || addr_taken {
        let full = typecheck::size_of(ctx, pt) as u32;
        let align = typecheck::align_of(ctx, pt) as u32;
        let slot = g.builder.func.add_stack_slot(ir_t, full, align);
        g.builder
            .emit(entry, IrOpcode::Store, IrCond::None, size, &[slot, value], None)
            .map_err(|e| g.fail(ctx, loc, e))?;
        g.places.insert(param, Place::Addr(slot));
    } else {
        let var = g.builder.new_var(ir_t);
        g.builder.write_variable(entry, var, value);
        g.places.insert(param, Place::Var(var));
    }
    Ok(())
}

// ---- statements ----

fn gen_stmt(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    stmt: AstIndex,
) -> Fallible<Flow> {
    if stmt.is_undef() {
        return Ok(Flow::Next);
    }
    let loc = ctx.node(stmt).loc;
    match ctx.node(stmt).data {
        AstData::Block { items, .. } => {
            for item in ctx.list(items) {
                match gen_stmt(ctx, g, cur, item)? {
                    Flow::Next => {}
                    // anything after an unconditional transfer is dead code
                    Flow::Diverged => return Ok(Flow::Diverged),
                }
            }
            Ok(Flow::Next)
        }
        AstData::VarDecl { .. } => {
            gen_local_decl(ctx, g, cur, stmt)?;
            Ok(Flow::Next)
        }
        AstData::Alias { .. }
        | AstData::EnumDecl { .. }
        | AstData::EnumMember { .. }
        | AstData::StructDecl { .. }
        | AstData::Import { .. } => Ok(Flow::Next),
        AstData::IfStmt { condition, then_stmt, else_stmt } => {
            gen_if(ctx, g, cur, condition, then_stmt, else_stmt)
        }
        AstData::WhileStmt { condition, body } => gen_while(ctx, g, cur, condition, body),
        AstData::ForStmt { init, condition, increment, body, .. } => {
            gen_for(ctx, g, cur, init, condition, increment, body)
        }
        AstData::ReturnStmt { value } => {
            if value.is_defined() {
                let v = gen_value(ctx, g, cur, value)?;
                let ret_var = g.builder.ret_var;
                g.builder.write_variable(*cur, ret_var, v);
            }
            g.builder
                .add_jump(*cur, IrFunction::EXIT_BLOCK)
                .map_err(|e| g.fail(ctx, loc, e))?;
            Ok(Flow::Diverged)
        }
        AstData::BreakStmt => {
            let frame = g.loops.last_mut().ok_or_else(|| {
                ctx.fatal(DiagKind::Internal, loc, "break outside of a loop".to_string())
            })?;
            g.builder
                .add_jump_to_label(*cur, &mut frame.break_label)
                .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
            Ok(Flow::Diverged)
        }
        AstData::ContinueStmt => {
            let frame = g.loops.last_mut().ok_or_else(|| {
                ctx.fatal(DiagKind::Internal, loc, "continue outside of a loop".to_string())
            })?;
            match &mut frame.cont {
                ContTarget::Block(header) => {
                    let header = *header;
                    g.builder
                        .add_jump(*cur, header)
                        .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
                }
                ContTarget::Label(label) => {
                    g.builder
                        .add_jump_to_label(*cur, label)
                        .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
                }
            }
            Ok(Flow::Diverged)
        }
        AstData::StaticIf { .. }
        | AstData::StaticVersion { .. }
        | AstData::StaticForeach { .. }
        | AstData::StaticAssert { .. } => Ok(Flow::Next),
        _ => {
            gen_expr(ctx, g, cur, stmt)?;
            Ok(Flow::Next)
        }
    }
}

fn gen_local_decl(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    decl: AstIndex,
) -> Fallible<()> {
    let AstData::VarDecl { ty, initializer, .. } = ctx.node(decl).data else { return Ok(()) };
    let loc = ctx.node(decl).loc;
    let ir_t = ir_type_of(ctx, ty);
    let aggregate = typecheck::is_aggregate(ctx, ty);
    let addr_taken = ctx.node(decl).has_flag(flags::IS_ADDRESS_TAKEN);

    if aggregate || addr_taken {
        let size = typecheck::size_of(ctx, ty) as u32;
        let align = typecheck::align_of(ctx, ty) as u32;
        let slot = g.builder.func.add_stack_slot(ir_t, size, align);
        g.places.insert(decl, Place::Addr(slot));
        if initializer.is_defined() {
            store_into(ctx, g, cur, slot, initializer, ty)?;
        } else {
            let zero = ctx.ir.zero_const(ir_t);
            let size_const = ctx.ir.int_const(size as i64);
            g.builder
                .emit(*cur, IrOpcode::Copy, IrCond::None, 8, &[slot, zero, size_const], None)
                .map_err(|e| g.fail(ctx, loc, e))?;
        }
    } else {
        let var = g.builder.new_var(ir_t);
        g.places.insert(decl, Place::Var(var));
        let value = if initializer.is_defined() {
            gen_value(ctx, g, cur, initializer)?
        } else {
            ctx.ir.int_const(0)
        };
        g.builder.write_variable(*cur, var, value);
    }
    Ok(())
}

fn gen_if(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    condition: AstIndex,
    then_stmt: AstIndex,
    else_stmt: AstIndex,
) -> Fallible<Flow> {
    let loc = ctx.node(condition).loc;
    let mut then_l = IrLabel::new();
    let mut else_l = IrLabel::new();
    let mut merge = IrLabel::new();
    gen_branch(ctx, g, cur, condition, &mut then_l, &mut else_l)?;

    *cur = g.builder.begin_label_block(&mut then_l).map_err(|e| g.fail(ctx, loc, e))?;
    if gen_stmt(ctx, g, cur, then_stmt)? == Flow::Next {
        g.builder.add_jump_to_label(*cur, &mut merge).map_err(|e| g.fail(ctx, loc, e))?;
    }

    *cur = g.builder.begin_label_block(&mut else_l).map_err(|e| g.fail(ctx, loc, e))?;
    let else_flow =
        if else_stmt.is_defined() { gen_stmt(ctx, g, cur, else_stmt)? } else { Flow::Next };
    if else_flow == Flow::Next {
        g.builder.add_jump_to_label(*cur, &mut merge).map_err(|e| g.fail(ctx, loc, e))?;
    }

    let reachable = merge.num_preds > 0;
    *cur = g.builder.begin_label_block(&mut merge).map_err(|e| g.fail(ctx, loc, e))?;
    Ok(if reachable { Flow::Next } else { Flow::Diverged })
}

fn gen_while(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    condition: AstIndex,
    body: AstIndex,
) -> Fallible<Flow> {
    let loc = ctx.node(condition).loc;
    let header = g.builder.func.add_block();
    g.builder.mark_loop_header(header);
    g.builder.add_jump(*cur, header).map_err(|e| g.fail(ctx, loc, e))?;

    let mut body_l = IrLabel::new();
    let exit_l = IrLabel::new();
    let mut hcur = header;
    g.loops.push(LoopFrame { break_label: exit_l, cont: ContTarget::Block(header) });
    {
        let frame_index = g.loops.len() - 1;
        let mut exit_label = g.loops[frame_index].break_label;
        gen_branch(ctx, g, &mut hcur, condition, &mut body_l, &mut exit_label)?;
        g.loops[frame_index].break_label = exit_label;
    }

    *cur = g.builder.begin_label_block(&mut body_l).map_err(|e| g.fail(ctx, loc, e))?;
    if gen_stmt(ctx, g, cur, body)? == Flow::Next {
        g.builder.add_jump(*cur, header).map_err(|e| g.fail(ctx, loc, e))?;
    }
    g.builder.seal_block(header).map_err(|e| g.fail(ctx, loc, e))?;

    let frame = g.loops.pop().expect("loop frame");
    let mut exit_l = frame.break_label;
    let reachable = exit_l.num_preds > 0;
    *cur = g.builder.begin_label_block(&mut exit_l).map_err(|e| g.fail(ctx, loc, e))?;
    Ok(if reachable { Flow::Next } else { Flow::Diverged })
}

fn gen_for(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    init: AstIndex,
    condition: AstIndex,
    increment: AstIndex,
    body: AstIndex,
) -> Fallible<Flow> {
    let loc = ctx.node(body).loc;
    if init.is_defined() {
        gen_stmt(ctx, g, cur, init)?;
    }
    let header = g.builder.func.add_block();
    g.builder.mark_loop_header(header);
    g.builder.add_jump(*cur, header).map_err(|e| g.fail(ctx, loc, e))?;

    let mut body_l = IrLabel::new();
    let mut hcur = header;
    g.loops.push(LoopFrame {
        break_label: IrLabel::new(),
        cont: ContTarget::Label(IrLabel::new()),
    });
    let frame_index = g.loops.len() - 1;
    if condition.is_defined() {
        let mut exit_label = g.loops[frame_index].break_label;
        gen_branch(ctx, g, &mut hcur, condition, &mut body_l, &mut exit_label)?;
        g.loops[frame_index].break_label = exit_label;
    } else {
        g.builder.add_jump_to_label(hcur, &mut body_l).map_err(|e| g.fail(ctx, loc, e))?;
    }

    *cur = g.builder.begin_label_block(&mut body_l).map_err(|e| g.fail(ctx, loc, e))?;
    if gen_stmt(ctx, g, cur, body)? == Flow::Next {
        let ContTarget::Label(ref mut inc_l) = g.loops[frame_index].cont else { unreachable!() };
        g.builder.add_jump_to_label(*cur, inc_l).map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
    }

    let frame = g.loops.pop().expect("loop frame");
    let mut exit_l = frame.break_label;
    let ContTarget::Label(mut inc_l) = frame.cont else { unreachable!() };

    if inc_l.num_preds > 0 {
        let mut icur =
            g.builder.begin_label_block(&mut inc_l).map_err(|e| g.fail(ctx, loc, e))?;
        if increment.is_defined() {
            gen_expr(ctx, g, &mut icur, increment)?;
        }
        if !g.builder.is_finished(icur) {
            g.builder.add_jump(icur, header).map_err(|e| g.fail(ctx, loc, e))?;
        }
    }
    g.builder.seal_block(header).map_err(|e| g.fail(ctx, loc, e))?;

    let reachable = exit_l.num_preds > 0;
    *cur = g.builder.begin_label_block(&mut exit_l).map_err(|e| g.fail(ctx, loc, e))?;
    Ok(if reachable { Flow::Next } else { Flow::Diverged })
}

// ---- conditions ----

fn ir_cond_of(op: BinOp, signed: bool) -> IrCond {
    match (op, signed) {
        (BinOp::Eq, _) => IrCond::Eq,
        (BinOp::Ne, _) => IrCond::Ne,
        (BinOp::Lt, true) => IrCond::Slt,
        (BinOp::Lt, false) => IrCond::Ult,
        (BinOp::Gt, true) => IrCond::Sgt,
        (BinOp::Gt, false) => IrCond::Ugt,
        (BinOp::Le, true) => IrCond::Sle,
        (BinOp::Le, false) => IrCond::Ule,
        (BinOp::Ge, true) => IrCond::Sge,
        (BinOp::Ge, false) => IrCond::Uge,
        _ => IrCond::None,
    }
}

fn is_signed_type(ctx: &CompilationContext, t: AstIndex) -> bool {
    typecheck::basic_of(ctx, t).is_some_and(|b| b.is_signed())
}

/// Lower a condition into control flow toward two labels, fusing
/// comparisons into conditional branches and expanding `&&`/`||`/`!`.
fn gen_branch(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    cond: AstIndex,
    true_l: &mut IrLabel,
    false_l: &mut IrLabel,
) -> Fallible<()> {
    let loc = ctx.node(cond).loc;
    match ctx.node(cond).data {
        AstData::BinaryExpr { op, left, right } if op.is_comparison() => {
            let lv = gen_value(ctx, g, cur, left)?;
            let rv = gen_value(ctx, g, cur, right)?;
            let lt = ctx.get_type(left);
            let ir_cond = ir_cond_of(op, is_signed_type(ctx, lt));
            let size = type_size(ctx, lt);
            let (t, e) = g
                .builder
                .add_bin_branch(*cur, ir_cond, size, lv, rv)
                .map_err(|e| g.fail(ctx, loc, e))?;
            g.builder.seal_block(t).map_err(|e| g.fail(ctx, loc, e))?;
            g.builder.seal_block(e).map_err(|e| g.fail(ctx, loc, e))?;
            g.builder.add_jump_to_label(t, true_l).map_err(|e| g.fail(ctx, loc, e))?;
            g.builder.add_jump_to_label(e, false_l).map_err(|e| g.fail(ctx, loc, e))?;
            Ok(())
        }
        AstData::BinaryExpr { op: BinOp::LogicAnd, left, right } => {
            let mut mid = IrLabel::new();
            gen_branch(ctx, g, cur, left, &mut mid, false_l)?;
            *cur = g.builder.begin_label_block(&mut mid).map_err(|e| g.fail(ctx, loc, e))?;
            gen_branch(ctx, g, cur, right, true_l, false_l)
        }
        AstData::BinaryExpr { op: BinOp::LogicOr, left, right } => {
            let mut mid = IrLabel::new();
            gen_branch(ctx, g, cur, left, true_l, &mut mid)?;
            *cur = g.builder.begin_label_block(&mut mid).map_err(|e| g.fail(ctx, loc, e))?;
            gen_branch(ctx, g, cur, right, true_l, false_l)
        }
        AstData::UnaryExpr { op: UnOp::Not, operand } => {
            gen_branch(ctx, g, cur, operand, false_l, true_l)
        }
        AstData::BoolLiteral { value } => {
            let target = if value { true_l } else { false_l };
            g.builder.add_jump_to_label(*cur, target).map_err(|e| g.fail(ctx, loc, e))
        }
        _ => {
            let v = gen_value(ctx, g, cur, cond)?;
            let t_ast = ctx.get_type(cond);
            let size = type_size(ctx, t_ast);
            let (t, e) = g
                .builder
                .add_unary_branch(*cur, IrCond::Ne, size, v)
                .map_err(|e| g.fail(ctx, loc, e))?;
            g.builder.seal_block(t).map_err(|e| g.fail(ctx, loc, e))?;
            g.builder.seal_block(e).map_err(|e| g.fail(ctx, loc, e))?;
            g.builder.add_jump_to_label(t, true_l).map_err(|e| g.fail(ctx, loc, e))?;
            g.builder.add_jump_to_label(e, false_l).map_err(|e| g.fail(ctx, loc, e))?;
            Ok(())
        }
    }
}

// ---- expressions ----

fn gen_value(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
) -> Fallible<IrIndex> {
    let loc = ctx.node(expr).loc;
    match gen_expr(ctx, g, cur, expr)? {
        ExprValue::Value(v) => Ok(v),
        ExprValue::Addr(addr) => {
            let t = ctx.get_type(expr);
            if typecheck::is_aggregate(ctx, t) {
                // an aggregate's "value" is its address
                return Ok(addr);
            }
            let ir_t = ir_type_of(ctx, t);
            let size = type_size(ctx, t);
            g.builder
                .emit(*cur, IrOpcode::Load, IrCond::None, size, &[addr], Some(ir_t))
                .map_err(|e| g.fail(ctx, loc, e))
        }
        ExprValue::Void => Ok(IrIndex::UNDEF),
    }
}

fn gen_expr(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
) -> Fallible<ExprValue> {
    let loc = ctx.node(expr).loc;
    match ctx.node(expr).data {
        AstData::IntLiteral { value } => Ok(ExprValue::Value(ctx.ir.int_const(value as i64))),
        AstData::BoolLiteral { value } => {
            Ok(ExprValue::Value(ctx.ir.int_const(value as i64)))
        }
        AstData::NullLiteral => Ok(ExprValue::Value(ctx.ir.int_const(0))),
        AstData::StringLiteral { index } => {
            Ok(ExprValue::Value(string_const(ctx, index)))
        }
        AstData::NameUse { entity, .. } => gen_name_use(ctx, g, cur, expr, entity),
        AstData::MemberExpr { .. } => gen_member(ctx, g, cur, expr),
        AstData::UnaryExpr { op, operand } => gen_unary(ctx, g, cur, expr, op, operand),
        AstData::BinaryExpr { op, left, right } => {
            gen_binary(ctx, g, cur, expr, op, left, right)
        }
        AstData::CallExpr { .. } => gen_call(ctx, g, cur, expr),
        AstData::IndexExpr { base, indices } => gen_index(ctx, g, cur, expr, base, indices),
        AstData::CastExpr { ty: _, expr: inner } => gen_cast(ctx, g, cur, expr, inner),
        AstData::ErrorNode => Ok(ExprValue::Value(ctx.ir.int_const(0))),
        _ => Err(ctx.fatal(
            DiagKind::Internal,
            loc,
            format!("cannot generate IR for {:?}", ctx.node(expr).kind()),
        )),
    }
}

fn gen_name_use(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
    entity: AstIndex,
) -> Fallible<ExprValue> {
    let loc = ctx.node(expr).loc;
    if entity.is_undef() || entity == ctx.common.error_node {
        return Ok(ExprValue::Value(ctx.ir.int_const(0)));
    }
    match ctx.node(entity).kind() {
        AstKind::VarDecl => {
            if ctx.node(entity).has_flag(flags::IS_GLOBAL) {
                let global = ensure_global(ctx, entity)?;
                return Ok(ExprValue::Addr(global));
            }
            match g.places.get(&entity).copied() {
                Some(Place::Var(var)) => {
                    let v = g
                        .builder
                        .read_variable(*cur, var)
                        .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
                    Ok(ExprValue::Value(v))
                }
                Some(Place::Addr(addr)) => Ok(ExprValue::Addr(addr)),
                None => Err(ctx.fatal(
                    DiagKind::Internal,
                    loc,
                    "variable used before IR generation placed it".to_string(),
                )),
            }
        }
        AstKind::EnumMember => {
            let value = ctx.enum_values.get(&entity).copied().unwrap_or(0);
            Ok(ExprValue::Value(ctx.ir.int_const(value)))
        }
        AstKind::FunctionDecl => {
            let index = ensure_ir_func(ctx, entity)?;
            Ok(ExprValue::Value(IrIndex::new(IrKind::Func, index)))
        }
        _ => Ok(ExprValue::Value(ctx.ir.int_const(0))),
    }
}

fn gen_member(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
) -> Fallible<ExprValue> {
    let AstData::MemberExpr { object, entity, member_index, .. } = ctx.node(expr).data else {
        return Ok(ExprValue::Void);
    };
    let loc = ctx.node(expr).loc;

    // scoped enum member: a constant
    if entity.is_defined() && ctx.kind_of(entity) == AstKind::EnumMember {
        let value = ctx.enum_values.get(&entity).copied().unwrap_or(0);
        return Ok(ExprValue::Value(ctx.ir.int_const(value)));
    }

    let needs_deref = ctx.node(expr).has_flag(flags::NEEDS_DEREF);
    let object_t = ctx.get_type(object);
    let base_t = match ctx.node(object_t).data {
        AstData::TypePtr { target } if needs_deref => target,
        _ => object_t,
    };

    // base address (or constant aggregate) of the receiver
    let base = if needs_deref {
        ExprValue::Value(gen_value(ctx, g, cur, object)?)
    } else {
        gen_expr(ctx, g, cur, object)?
    };

    match ctx.node(base_t).data {
        AstData::StructDecl { .. } => {
            let (_, _, offsets) = typecheck::struct_layout_full(ctx, base_t);
            let offset = offsets.get(member_index as usize).copied().unwrap_or(0);
            let addr = base_address(ctx, g, cur, loc, base)?;
            Ok(ExprValue::Addr(offset_addr(ctx, g, cur, loc, addr, offset)?))
        }
        AstData::TypeSlice { .. } => {
            // a constant slice aggregate yields its element directly
            if let ExprValue::Value(v) = base {
                if v.kind() == IrKind::ConstAggregate {
                    let elem =
                        ctx.ir.aggregates[v.index() as usize].elems[member_index as usize];
                    return Ok(ExprValue::Value(elem));
                }
            }
            let addr = base_address(ctx, g, cur, loc, base)?;
            let offset = if member_index == builtin_member::LENGTH { 0 } else { 8 };
            Ok(ExprValue::Addr(offset_addr(ctx, g, cur, loc, addr, offset)?))
        }
        AstData::TypeStaticArray { length, .. } => {
            if member_index == builtin_member::LENGTH {
                return Ok(ExprValue::Value(ctx.ir.int_const(length as i64)));
            }
            // the array's address doubles as its first-element pointer
            let addr = base_address(ctx, g, cur, loc, base)?;
            Ok(ExprValue::Value(addr))
        }
        _ => Err(ctx.fatal(
            DiagKind::Internal,
            loc,
            "member access on a type without members survived checking".to_string(),
        )),
    }
}

fn base_address(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    _cur: &mut IrIndex,
    loc: SourceLoc,
    base: ExprValue,
) -> Fallible<IrIndex> {
    let _ = g;
    match base {
        ExprValue::Addr(a) => Ok(a),
        ExprValue::Value(v) => Ok(v),
        ExprValue::Void => Err(ctx.fatal(
            DiagKind::Internal,
            loc,
            "void value has no address".to_string(),
        )),
    }
}

fn offset_addr(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    loc: SourceLoc,
    addr: IrIndex,
    offset: u64,
) -> Fallible<IrIndex> {
    if offset == 0 {
        return Ok(addr);
    }
    let off = ctx.ir.int_const(offset as i64);
    g.builder
        .emit(*cur, IrOpcode::Add, IrCond::None, 8, &[addr, off], Some(IrBasic::Ptr.handle()))
        .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))
}

fn gen_unary(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
    op: UnOp,
    operand: AstIndex,
) -> Fallible<ExprValue> {
    let loc = ctx.node(expr).loc;
    match op {
        UnOp::AddrOf => match gen_expr(ctx, g, cur, operand)? {
            ExprValue::Addr(a) => Ok(ExprValue::Value(a)),
            ExprValue::Value(v) => Ok(ExprValue::Value(v)), // function handles
            ExprValue::Void => Err(ctx.fatal(
                DiagKind::Internal,
                loc,
                "address of a void value".to_string(),
            )),
        },
        UnOp::Deref => {
            let v = gen_value(ctx, g, cur, operand)?;
            Ok(ExprValue::Addr(v))
        }
        UnOp::Neg => {
            let v = gen_value(ctx, g, cur, operand)?;
            let t = ctx.get_type(expr);
            let ir_t = ir_type_of(ctx, t);
            let size = type_size(ctx, t);
            let r = g
                .builder
                .emit(*cur, IrOpcode::Neg, IrCond::None, size, &[v], Some(ir_t))
                .map_err(|e| g.fail(ctx, loc, e))?;
            Ok(ExprValue::Value(r))
        }
        UnOp::BitNot => {
            let v = gen_value(ctx, g, cur, operand)?;
            let t = ctx.get_type(expr);
            let ir_t = ir_type_of(ctx, t);
            let size = type_size(ctx, t);
            let r = g
                .builder
                .emit(*cur, IrOpcode::Not, IrCond::None, size, &[v], Some(ir_t))
                .map_err(|e| g.fail(ctx, loc, e))?;
            Ok(ExprValue::Value(r))
        }
        UnOp::Not => {
            let v = gen_value(ctx, g, cur, operand)?;
            let one = ctx.ir.int_const(1);
            let r = g
                .builder
                .emit(*cur, IrOpcode::Xor, IrCond::None, 1, &[v, one], Some(IrBasic::I8.handle()))
                .map_err(|e| g.fail(ctx, loc, e))?;
            Ok(ExprValue::Value(r))
        }
    }
}

fn arith_opcode(op: BinOp, signed: bool) -> IrOpcode {
    match op {
        BinOp::Add => IrOpcode::Add,
        BinOp::Sub => IrOpcode::Sub,
        BinOp::Mul => IrOpcode::Mul,
        BinOp::Div => {
            if signed { IrOpcode::Sdiv } else { IrOpcode::Udiv }
        }
        BinOp::Rem => {
            if signed { IrOpcode::Srem } else { IrOpcode::Urem }
        }
        BinOp::BitAnd => IrOpcode::And,
        BinOp::BitOr => IrOpcode::Or,
        BinOp::BitXor => IrOpcode::Xor,
        BinOp::Shl => IrOpcode::Shl,
        BinOp::Shr => {
            if signed { IrOpcode::Sar } else { IrOpcode::Shr }
        }
        _ => IrOpcode::Add,
    }
}

fn gen_binary(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
    op: BinOp,
    left: AstIndex,
    right: AstIndex,
) -> Fallible<ExprValue> {
    let loc = ctx.node(expr).loc;

    if op == BinOp::Assign {
        gen_assign(ctx, g, cur, left, right)?;
        return Ok(ExprValue::Void);
    }

    if op.is_logic() {
        // value position: merge 0/1 through a temporary SSA variable
        let tmp = g.builder.new_var(IrBasic::I8.handle());
        let mut true_l = IrLabel::new();
        let mut false_l = IrLabel::new();
        let mut end_l = IrLabel::new();
        gen_branch(ctx, g, cur, expr, &mut true_l, &mut false_l)?;

        let tcur =
            g.builder.begin_label_block(&mut true_l).map_err(|e| g.fail(ctx, loc, e))?;
        let one = ctx.ir.int_const(1);
        g.builder.write_variable(tcur, tmp, one);
        g.builder.add_jump_to_label(tcur, &mut end_l).map_err(|e| g.fail(ctx, loc, e))?;

        let fcur =
            g.builder.begin_label_block(&mut false_l).map_err(|e| g.fail(ctx, loc, e))?;
        let zero = ctx.ir.int_const(0);
        g.builder.write_variable(fcur, tmp, zero);
        g.builder.add_jump_to_label(fcur, &mut end_l).map_err(|e| g.fail(ctx, loc, e))?;

        *cur = g.builder.begin_label_block(&mut end_l).map_err(|e| g.fail(ctx, loc, e))?;
        let v = g
            .builder
            .read_variable(*cur, tmp)
            .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
        return Ok(ExprValue::Value(v));
    }

    let lv = gen_value(ctx, g, cur, left)?;
    let rv = gen_value(ctx, g, cur, right)?;
    let lt = ctx.get_type(left);
    let signed = is_signed_type(ctx, lt);

    if op.is_comparison() {
        let cond = ir_cond_of(op, signed);
        let size = type_size(ctx, lt);
        let r = g
            .builder
            .emit(*cur, IrOpcode::SetCond, cond, size, &[lv, rv], Some(IrBasic::I8.handle()))
            .map_err(|e| g.fail(ctx, loc, e))?;
        return Ok(ExprValue::Value(r));
    }

    // pointer arithmetic scales by the element size
    let result_t = ctx.get_type(expr);
    let (rv, size) = if typecheck::is_pointer(ctx, result_t) {
        let AstData::TypePtr { target } = ctx.node(result_t).data else { unreachable!() };
        let elem = typecheck::size_of(ctx, target).max(1);
        let scaled = if elem > 1 {
            let c = ctx.ir.int_const(elem as i64);
            g.builder
                .emit(*cur, IrOpcode::Mul, IrCond::None, 8, &[rv, c], Some(IrBasic::U64.handle()))
                .map_err(|e| g.fail(ctx, loc, e))?
        } else {
            rv
        };
        (scaled, 8)
    } else {
        (rv, type_size(ctx, result_t))
    };

    let ir_t = ir_type_of(ctx, result_t);
    let opcode = arith_opcode(op, signed);
    let r = g
        .builder
        .emit(*cur, opcode, IrCond::None, size, &[lv, rv], Some(ir_t))
        .map_err(|e| g.fail(ctx, loc, e))?;
    Ok(ExprValue::Value(r))
}

fn gen_assign(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    left: AstIndex,
    right: AstIndex,
) -> Fallible<()> {
    let loc = ctx.node(left).loc;

    // direct SSA write for plain variable targets
    if let AstData::NameUse { entity, .. } = ctx.node(left).data {
        if let Some(Place::Var(var)) = g.places.get(&entity).copied() {
            let v = gen_value(ctx, g, cur, right)?;
            g.builder.write_variable(*cur, var, v);
            return Ok(());
        }
    }

    let target = match gen_expr(ctx, g, cur, left)? {
        ExprValue::Addr(a) => a,
        _ => {
            return Err(ctx.fatal(
                DiagKind::Internal,
                loc,
                "assignment target without an address survived checking".to_string(),
            ));
        }
    };
    let lt = ctx.get_type(left);
    store_into(ctx, g, cur, target, right, lt)
}

/// Store the value of `expr` (of declared type `ty`) into `addr`, choosing
/// between a scalar store and an aggregate copy.
fn store_into(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    addr: IrIndex,
    expr: AstIndex,
    ty: AstIndex,
) -> Fallible<()> {
    let loc = ctx.node(expr).loc;
    if typecheck::is_aggregate(ctx, ty) {
        let size = typecheck::size_of(ctx, ty);
        let src = gen_value(ctx, g, cur, expr)?; // address or constant aggregate
        let size_const = ctx.ir.int_const(size as i64);
        g.builder
            .emit(*cur, IrOpcode::Copy, IrCond::None, 8, &[addr, src, size_const], None)
            .map_err(|e| g.fail(ctx, loc, e))?;
        return Ok(());
    }
    let v = gen_value(ctx, g, cur, expr)?;
    let size = type_size(ctx, ty);
    g.builder
        .emit(*cur, IrOpcode::Store, IrCond::None, size, &[addr, v], None)
        .map_err(|e| g.fail(ctx, loc, e))?;
    Ok(())
}

fn gen_call(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
) -> Fallible<ExprValue> {
    let AstData::CallExpr { callee, args } = ctx.node(expr).data else {
        return Ok(ExprValue::Void);
    };
    let loc = ctx.node(expr).loc;
    let args: Vec<AstIndex> = ctx.list(args);

    // resolve the target: direct, method, or indirect
    let mut receiver = AstIndex::UNDEF;
    let mut fdecl = AstIndex::UNDEF;
    match ctx.node(callee).data {
        AstData::NameUse { entity, .. }
            if entity.is_defined() && ctx.kind_of(entity) == AstKind::FunctionDecl =>
        {
            fdecl = entity;
        }
        AstData::MemberExpr { object, entity, .. }
            if entity.is_defined() && ctx.kind_of(entity) == AstKind::FunctionDecl =>
        {
            fdecl = entity;
            receiver = object;
        }
        _ => {}
    }

    let signature = if fdecl.is_defined() {
        typecheck::ensure_signature(ctx, fdecl)?
    } else {
        ctx.get_type(callee)
    };
    let AstData::FunctionSignature { return_type, params } = ctx.node(signature).data else {
        return Err(ctx.fatal(DiagKind::Internal, loc, "call without a signature".to_string()));
    };
    let params: Vec<AstIndex> = ctx.list(params);

    let mut lowered: Vec<IrIndex> = Vec::with_capacity(params.len() + 1);
    let skip = if receiver.is_defined() { 1 } else { 0 };
    if receiver.is_defined() {
        let needs_deref = ctx.node(callee).has_flag(flags::NEEDS_DEREF);
        let receiver_t = ctx.get_type(receiver);
        let addr = if needs_deref {
            gen_value(ctx, g, cur, receiver)?
        } else {
            match gen_expr(ctx, g, cur, receiver)? {
                ExprValue::Addr(a) => a,
                ExprValue::Value(v) => spill_to_slot(ctx, g, cur, loc, v, receiver_t)?,
                ExprValue::Void => {
                    return Err(ctx.fatal(
                        DiagKind::Internal,
                        loc,
                        "method receiver has no value".to_string(),
                    ));
                }
            }
        };
        lowered.push(addr);
    }

    for (i, &param) in params.iter().enumerate().skip(skip) {
        let pt = ctx.get_type(param);
        let arg_expr = if i - skip < args.len() {
            args[i - skip]
        } else {
            let AstData::VarDecl { initializer, .. } = ctx.node(param).data else {
                continue;
            };
            if initializer.is_undef() {
                continue; // argument-count error already reported
            }
            initializer
        };
        if typecheck::is_pass_by_ptr(ctx, pt) {
            let addr = match gen_expr(ctx, g, cur, arg_expr)? {
                ExprValue::Addr(a) => a,
                ExprValue::Value(v) => spill_to_slot(ctx, g, cur, loc, v, pt)?,
                ExprValue::Void => {
                    return Err(ctx.fatal(
                        DiagKind::Internal,
                        loc,
                        "void argument survived checking".to_string(),
                    ));
                }
            };
            lowered.push(addr);
        } else {
            lowered.push(gen_value(ctx, g, cur, arg_expr)?);
        }
    }

    let ret_is_void =
        typecheck::basic_of(ctx, return_type).is_some_and(|b| b.is_noreturn_or_void());
    if typecheck::is_pass_by_ptr(ctx, return_type) {
        ctx.error(
            DiagKind::Type,
            loc,
            "returning an aggregate larger than 8 bytes is not supported".to_string(),
        );
    }
    let result_ty =
        if ret_is_void { None } else { Some(ir_type_of(ctx, return_type)) };
    let ret_size = if ret_is_void { 0 } else { type_size(ctx, return_type) };

    // syscalls lower to a raw syscall instruction; no function reference
    if fdecl.is_defined() {
        if let AstData::FunctionDecl { ir_index: _, .. } = ctx.node(fdecl).data {
            let func_index = ensure_ir_func(ctx, fdecl)?;
            let shell_syscall = ctx.ir.functions[func_index as usize].syscall_number;
            if let Some(number) = shell_syscall {
                let mut call_args = vec![ctx.ir.int_const(number as i64)];
                call_args.extend(lowered);
                let r = g
                    .builder
                    .emit(*cur, IrOpcode::Syscall, IrCond::None, ret_size, &call_args, result_ty)
                    .map_err(|e| g.fail(ctx, loc, e))?;
                return Ok(if ret_is_void { ExprValue::Void } else { ExprValue::Value(r) });
            }
            let mut call_args = vec![IrIndex::new(IrKind::Func, func_index)];
            call_args.extend(lowered);
            let r = g
                .builder
                .emit(*cur, IrOpcode::Call, IrCond::None, ret_size, &call_args, result_ty)
                .map_err(|e| g.fail(ctx, loc, e))?;
            return Ok(if ret_is_void { ExprValue::Void } else { ExprValue::Value(r) });
        }
    }

    // indirect call through a function-pointer value
    let fv = gen_value(ctx, g, cur, callee)?;
    let mut call_args = vec![fv];
    call_args.extend(lowered);
    let r = g
        .builder
        .emit(*cur, IrOpcode::Call, IrCond::None, ret_size, &call_args, result_ty)
        .map_err(|e| g.fail(ctx, loc, e))?;
    Ok(if ret_is_void { ExprValue::Void } else { ExprValue::Value(r) })
}

/// Spill an rvalue (typically a constant aggregate) into a fresh stack slot
/// and return the slot's address.
fn spill_to_slot(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    loc: SourceLoc,
    value: IrIndex,
    ty: AstIndex,
) -> Fallible<IrIndex> {
    let ir_t = ir_type_of(ctx, ty);
    let size = typecheck::size_of(ctx, ty) as u32;
    let align = typecheck::align_of(ctx, ty) as u32;
    let slot = g.builder.func.add_stack_slot(ir_t, size, align);
    let size_const = ctx.ir.int_const(size as i64);
    g.builder
        .emit(*cur, IrOpcode::Copy, IrCond::None, 8, &[slot, value, size_const], None)
        .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
    Ok(slot)
}

fn gen_index(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
    base: AstIndex,
    indices: crate::arena::PoolSlice,
) -> Fallible<ExprValue> {
    let loc = ctx.node(expr).loc;
    let indices = ctx.list(indices);
    let index_expr = indices.first().copied().unwrap_or(AstIndex::UNDEF);

    let base_t = ctx.get_type(base);
    let elem_t = ctx.get_type(expr);
    let elem_size = typecheck::size_of(ctx, elem_t).max(1);

    // the element base pointer
    let base_ptr = match ctx.node(base_t).data {
        AstData::TypeSlice { .. } => {
            // load the ptr field of the slice
            match gen_expr(ctx, g, cur, base)? {
                ExprValue::Addr(a) => {
                    let ptr_addr = offset_addr(ctx, g, cur, loc, a, 8)?;
                    g.builder
                        .emit(
                            *cur,
                            IrOpcode::Load,
                            IrCond::None,
                            8,
                            &[ptr_addr],
                            Some(IrBasic::Ptr.handle()),
                        )
                        .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?
                }
                ExprValue::Value(v) if v.kind() == IrKind::ConstAggregate => {
                    ctx.ir.aggregates[v.index() as usize].elems[builtin_member::PTR as usize]
                }
                ExprValue::Value(v) => v,
                ExprValue::Void => {
                    return Err(ctx.fatal(DiagKind::Internal, loc, "void slice".to_string()));
                }
            }
        }
        AstData::TypeStaticArray { .. } => match gen_expr(ctx, g, cur, base)? {
            ExprValue::Addr(a) => a,
            ExprValue::Value(v) => v,
            ExprValue::Void => {
                return Err(ctx.fatal(DiagKind::Internal, loc, "void array".to_string()));
            }
        },
        _ => gen_value(ctx, g, cur, base)?, // raw pointer
    };

    let iv = gen_value(ctx, g, cur, index_expr)?;
    let scaled = if elem_size > 1 {
        let c = ctx.ir.int_const(elem_size as i64);
        g.builder
            .emit(*cur, IrOpcode::Mul, IrCond::None, 8, &[iv, c], Some(IrBasic::U64.handle()))
            .map_err(|e| g.fail(ctx, loc, e))?
    } else {
        iv
    };
    let addr = g
        .builder
        .emit(
            *cur,
            IrOpcode::Add,
            IrCond::None,
            8,
            &[base_ptr, scaled],
            Some(IrBasic::Ptr.handle()),
        )
        .map_err(|e| g.fail(ctx, loc, e))?;
    Ok(ExprValue::Addr(addr))
}

fn gen_cast(
    ctx: &mut CompilationContext,
    g: &mut Gen,
    cur: &mut IrIndex,
    expr: AstIndex,
    inner: AstIndex,
) -> Fallible<ExprValue> {
    let loc = ctx.node(expr).loc;
    let target_t = ctx.get_type(expr);
    let source_t = ctx.get_type(inner);

    // slice → pointer takes the ptr field
    if typecheck::is_pointer(ctx, target_t) {
        if let AstData::TypeSlice { .. } = ctx.node(source_t).data {
            let addr = match gen_expr(ctx, g, cur, inner)? {
                ExprValue::Value(v) if v.kind() == IrKind::ConstAggregate => {
                    let elem = ctx.ir.aggregates[v.index() as usize].elems
                        [builtin_member::PTR as usize];
                    return Ok(ExprValue::Value(elem));
                }
                // the slice's "value" is its address in either form
                ExprValue::Addr(a) => a,
                ExprValue::Value(v) => v,
                ExprValue::Void => {
                    return Err(ctx.fatal(DiagKind::Internal, loc, "void slice".to_string()));
                }
            };
            let ptr_addr = offset_addr(ctx, g, cur, loc, addr, 8)?;
            let v = g
                .builder
                .emit(
                    *cur,
                    IrOpcode::Load,
                    IrCond::None,
                    8,
                    &[ptr_addr],
                    Some(IrBasic::Ptr.handle()),
                )
                .map_err(|e| ctx.fatal(DiagKind::Internal, loc, e))?;
            return Ok(ExprValue::Value(v));
        }
    }

    let v = gen_value(ctx, g, cur, inner)?;
    let src_size = typecheck::size_of(ctx, source_t).max(1) as u8;
    let dst_size = typecheck::size_of(ctx, target_t).max(1) as u8;
    let ir_t = ir_type_of(ctx, target_t);

    let value = if dst_size == src_size {
        v
    } else if dst_size < src_size {
        g.builder
            .emit(*cur, IrOpcode::Trunc, IrCond::None, dst_size, &[v], Some(ir_t))
            .map_err(|e| g.fail(ctx, loc, e))?
    } else {
        let signed = is_signed_type(ctx, source_t)
            || matches!(ctx.node(source_t).data, AstData::EnumDecl { .. })
                && is_signed_enum(ctx, source_t);
        let op = if signed { IrOpcode::Sext } else { IrOpcode::Zext };
        g.builder
            .emit(*cur, op, IrCond::None, dst_size, &[v], Some(ir_t))
            .map_err(|e| g.fail(ctx, loc, e))?
    };
    Ok(ExprValue::Value(value))
}

fn is_signed_enum(ctx: &CompilationContext, t: AstIndex) -> bool {
    match ctx.node(t).data {
        AstData::EnumDecl { base_type, .. } => is_signed_type(ctx, base_type),
        _ => false,
    }
}

// ---- globals & string constants ----

fn ensure_global(ctx: &mut CompilationContext, decl: AstIndex) -> Fallible<IrIndex> {
    if let Some(&handle) = ctx.ir.global_map.get(&decl) {
        return Ok(handle);
    }
    let AstData::VarDecl { name, ty, initializer, .. } = ctx.node(decl).data else {
        let loc = ctx.node(decl).loc;
        return Err(ctx.fatal(DiagKind::Internal, loc, "not a global variable".to_string()));
    };
    let ir_t = ir_type_of(ctx, ty);
    let size = typecheck::size_of(ctx, ty) as usize;
    let mut data = vec![0u8; size];
    if initializer.is_defined() {
        let value = crate::eval::eval_static_expr(ctx, initializer)?;
        let bytes = value.to_le_bytes();
        let n = size.min(8);
        data[..n].copy_from_slice(&bytes[..n]);
    }
    let handle = ctx.ir.add_global(IrGlobal { name, ty: ir_t, data, readonly: false });
    ctx.ir.global_map.insert(decl, handle);
    Ok(handle)
}

/// A string literal becomes a read-only zero-terminated byte global bundled
/// with its length into a `{i64 length, u8* ptr}` slice constant.
fn string_const(ctx: &mut CompilationContext, index: u32) -> IrIndex {
    if let Some(&handle) = ctx.ir.string_consts.get(&index) {
        return handle;
    }
    let text = ctx.strings[index as usize].clone();
    let mut data = text.clone().into_bytes();
    data.push(0);

    let name = ctx.intern(&format!("str.{}", index));
    let u8_t = IrBasic::U8.handle();
    let array_t = ctx.ir.array_type(u8_t, data.len() as u64);
    let global = ctx.ir.add_global(IrGlobal { name, ty: array_t, data, readonly: true });

    let len_const = ctx.ir.int_const(text.len() as i64);
    let slice_t = ctx.ir.slice_type(u8_t);
    let aggregate =
        ctx.ir.add_aggregate(IrAggregate { ty: slice_t, elems: vec![len_const, global] });
    ctx.ir.string_consts.insert(index, aggregate);
    aggregate
}
