//! SSA construction.
//!
//! Direct SSA construction from unstructured code after Braun et al.:
//! `write_variable`/`read_variable` track the current definition of each
//! variable per block, blocks are *sealed* once their predecessor set is
//! final, and phis created in unsealed blocks stay incomplete until
//! sealing fills their operands. Trivial phis (all operands one value or a
//! self-reference) are removed on the spot, recursively revisiting phi
//! users that may have become trivial in turn.
//!
//! Contract violations (adding a predecessor to a sealed block, finishing a
//! finished block, a plain return in a value-returning function) are
//! internal errors: they surface as `Err` and abort the invocation.

use std::collections::HashMap;

use super::{
    block_flags, IrCond, IrFunction, IrIndex, IrKind, IrOpcode, IrPhi,
};
use crate::arena::PoolSlice;
use crate::interner::Ident;
use tracing::trace;

pub type BuildResult<T> = Result<T, String>;

/// How the function returns; decides the exit block's shape.
#[derive(Debug, Clone, Copy)]
pub enum RetClass {
    NoReturn,
    Void,
    Value(IrIndex),
}

/// Forward-referenced jump target with deferred block allocation: a label
/// with a single predecessor inherits that block outright, so trivial
/// control structures produce no empty fall-through blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrLabel {
    pub block: IrIndex,
    pub num_preds: u32,
    pub is_allocated: bool,
}

impl IrLabel {
    pub fn new() -> Self {
        IrLabel::default()
    }
}

pub struct IrBuilder {
    pub func: IrFunction,
    /// (block, variable) → current SSA value. Per-function scratch, dropped
    /// when construction finishes.
    block_var_def: HashMap<(u32, u32), IrIndex>,
    var_types: Vec<IrIndex>,
    removed_vregs: u32,
    /// The implicit return variable; undefined for void/noreturn functions.
    pub ret_var: IrIndex,
}

impl IrBuilder {
    /// Allocate the entry and exit blocks and emit the exit terminator. The
    /// entry block is sealed immediately; the exit block is finished here
    /// and sealed by [`IrBuilder::finish`].
    pub fn new(name: Ident, sig: u32, ret: RetClass) -> BuildResult<IrBuilder> {
        let mut builder = IrBuilder {
            func: IrFunction::new(name, sig),
            block_var_def: HashMap::new(),
            var_types: Vec::new(),
            removed_vregs: 0,
            ret_var: IrIndex::UNDEF,
        };
        let entry = builder.func.add_block();
        let exit = builder.func.add_block();
        debug_assert_eq!(entry, IrFunction::ENTRY_BLOCK);
        debug_assert_eq!(exit, IrFunction::EXIT_BLOCK);

        match ret {
            RetClass::NoReturn => builder.add_unreachable(exit)?,
            RetClass::Void => builder.add_return(exit)?,
            RetClass::Value(ty) => {
                builder.ret_var = builder.new_var(ty);
                let value = builder.read_variable(exit, builder.ret_var)?;
                builder.add_return_value(exit, value)?;
            }
        }
        builder.seal_block(entry)?;
        Ok(builder)
    }

    // ---- variables ----

    pub fn new_var(&mut self, ty: IrIndex) -> IrIndex {
        let handle = IrIndex::new(IrKind::Variable, self.var_types.len() as u32);
        self.var_types.push(ty);
        self.func.num_vars += 1;
        handle
    }

    pub fn write_variable(&mut self, block: IrIndex, var: IrIndex, value: IrIndex) {
        self.block_var_def.insert((block.index(), var.index()), value);
    }

    pub fn read_variable(&mut self, block: IrIndex, var: IrIndex) -> BuildResult<IrIndex> {
        if let Some(&value) = self.block_var_def.get(&(block.index(), var.index())) {
            return Ok(value);
        }
        if !self.func.block(block).is_sealed() {
            // incomplete phi, completed when the block is sealed
            let (_, result) = self.add_phi(block, var);
            self.write_variable(block, var, result);
            return Ok(result);
        }
        let preds = self.func.block(block).predecessors;
        if preds.len == 1 {
            let pred = self.func.pool.at(preds, 0);
            return self.read_variable(pred, var);
        }
        let (phi, result) = self.add_phi(block, var);
        self.write_variable(block, var, result);
        self.add_phi_operands(block, var, phi)
    }

    fn add_phi(&mut self, block: IrIndex, var: IrIndex) -> (IrIndex, IrIndex) {
        let handle = IrIndex::new(IrKind::Phi, self.func.phis.len() as u32);
        let ty = self.var_types[var.index() as usize];
        let result = self.func.add_vreg(ty, handle);

        // append to the block's phi list
        let mut prev = IrIndex::UNDEF;
        let mut cur = self.func.block(block).first_phi;
        while cur.is_defined() {
            prev = cur;
            cur = self.func.phi(cur).next;
        }
        self.func.phis.push(IrPhi {
            block,
            result,
            var,
            args: PoolSlice::EMPTY,
            prev,
            next: IrIndex::UNDEF,
            removed: false,
        });
        if prev.is_defined() {
            self.func.phi_mut(prev).next = handle;
        } else {
            self.func.block_mut(block).first_phi = handle;
        }
        trace!(block = block.index(), var = var.index(), "new phi");
        (handle, result)
    }

    /// Fill a phi's operands from its block's predecessors (positionally
    /// parallel), then try to collapse it.
    fn add_phi_operands(
        &mut self,
        block: IrIndex,
        var: IrIndex,
        phi: IrIndex,
    ) -> BuildResult<IrIndex> {
        let preds: Vec<IrIndex> =
            self.func.pool.get(self.func.block(block).predecessors).to_vec();
        for pred in preds {
            let value = self.read_variable(pred, var)?;
            let args = self.func.phi(phi).args;
            let args = self.func.pool.push(args, value);
            self.func.phi_mut(phi).args = args;
            self.func.add_user(value, phi);
        }
        self.try_remove_trivial_phi(phi)
    }

    /// If the phi merges a single value (or only itself), replace its result
    /// by that value everywhere and retire the phi, recursing into phi users
    /// that may have become trivial.
    fn try_remove_trivial_phi(&mut self, phi: IrIndex) -> BuildResult<IrIndex> {
        let result = self.func.phi(phi).result;
        let args: Vec<IrIndex> = self.func.pool.get(self.func.phi(phi).args).to_vec();

        let mut same = IrIndex::UNDEF;
        for &arg in &args {
            if arg == same || arg == result {
                continue;
            }
            if same.is_defined() {
                return Ok(result); // merges at least two values
            }
            same = arg;
        }
        trace!(phi = phi.index(), "removing trivial phi");

        // detach the phi from its arguments' user sets
        for &arg in &args {
            self.remove_user(arg, phi);
        }

        // rewire every user of the phi's result
        let users: Vec<IrIndex> = self.func.pool.get(self.func.vreg(result).users).to_vec();
        for &user in &users {
            if user == phi {
                continue;
            }
            match user.kind() {
                IrKind::Instr => self.replace_in_instr_args(user, result, same),
                IrKind::Phi => self.replace_in_phi_args(user, result, same),
                _ => {}
            }
            self.func.add_user(same, user);
        }

        // definitions that still name the phi's result follow it
        for value in self.block_var_def.values_mut() {
            if *value == result {
                *value = same;
            }
        }

        self.unlink_phi(phi);
        self.func.phi_mut(phi).removed = true;
        self.func.vreg_mut(result).removed = true;
        self.removed_vregs += 1;

        for &user in &users {
            if user != phi && user.kind() == IrKind::Phi && !self.func.phi(user).removed {
                self.try_remove_trivial_phi(user)?;
            }
        }
        Ok(same)
    }

    fn unlink_phi(&mut self, phi: IrIndex) {
        let IrPhi { block, prev, next, .. } = *self.func.phi(phi);
        if prev.is_defined() {
            self.func.phi_mut(prev).next = next;
        } else {
            self.func.block_mut(block).first_phi = next;
        }
        if next.is_defined() {
            self.func.phi_mut(next).prev = prev;
        }
    }

    fn remove_user(&mut self, value: IrIndex, user: IrIndex) {
        if value.kind() != IrKind::VirtReg {
            return;
        }
        let users = self.func.vreg(value).users;
        let list = self.func.pool.get(users).to_vec();
        if let Some(pos) = list.iter().position(|&u| u == user) {
            let last = list.len() - 1;
            if pos != last {
                self.func.pool.set(users, pos as u32, list[last]);
            }
            let mut shrunk = users;
            shrunk.len -= 1;
            self.func.vreg_mut(value).users = shrunk;
        }
    }

    fn replace_in_instr_args(&mut self, instr: IrIndex, old: IrIndex, new: IrIndex) {
        let header = *self.func.instr(instr);
        let start = header.payload_offset as usize
            + (header.flags & super::instr_flags::HAS_RESULT != 0) as usize;
        for slot in &mut self.func.payload[start..start + header.num_args as usize] {
            if *slot == old {
                *slot = new;
            }
        }
    }

    fn replace_in_phi_args(&mut self, phi: IrIndex, old: IrIndex, new: IrIndex) {
        let args = self.func.phi(phi).args;
        for i in 0..args.len {
            if self.func.pool.at(args, i) == old {
                self.func.pool.set(args, i, new);
            }
        }
    }

    // ---- sealing & wiring ----

    /// Declare the block's predecessor set final and complete its pending
    /// phis. Sealing an already-sealed block is a no-op.
    pub fn seal_block(&mut self, block: IrIndex) -> BuildResult<()> {
        if self.func.block(block).is_sealed() {
            return Ok(());
        }
        let phis = self.func.block_phis(block);
        for phi in phis {
            let var = self.func.phi(phi).var;
            self.add_phi_operands(block, var, phi)?;
        }
        self.func.block_mut(block).flags |= block_flags::SEALED;
        Ok(())
    }

    /// Wire a CFG edge. The target must not be sealed.
    pub fn add_block_target(&mut self, from: IrIndex, to: IrIndex) -> BuildResult<()> {
        if self.func.block(to).is_sealed() {
            return Err(format!("adding a predecessor to sealed block b{}", to.index()));
        }
        let succ = self.func.block(from).successors;
        let succ = self.func.pool.push(succ, to);
        self.func.block_mut(from).successors = succ;
        let pred = self.func.block(to).predecessors;
        let pred = self.func.pool.push(pred, from);
        self.func.block_mut(to).predecessors = pred;
        Ok(())
    }

    // ---- instructions ----

    /// Emit a non-terminator instruction, optionally producing a result in
    /// a fresh virtual register.
    pub fn emit(
        &mut self,
        block: IrIndex,
        op: IrOpcode,
        cond: IrCond,
        arg_size: u8,
        args: &[IrIndex],
        result_ty: Option<IrIndex>,
    ) -> BuildResult<IrIndex> {
        if self.func.block(block).is_finished() {
            return Err(format!("emitting into finished block b{}", block.index()));
        }
        debug_assert!(!op.is_terminator());
        let instr = IrIndex::new(IrKind::Instr, self.func.instrs.len() as u32);
        let result = result_ty.map(|ty| self.func.add_vreg(ty, instr));
        self.func.push_instr(block, op, cond, arg_size, result, args);
        for &arg in args {
            self.func.add_user(arg, instr);
        }
        Ok(result.unwrap_or(IrIndex::UNDEF))
    }

    fn emit_terminator(
        &mut self,
        block: IrIndex,
        op: IrOpcode,
        cond: IrCond,
        arg_size: u8,
        args: &[IrIndex],
    ) -> BuildResult<()> {
        if self.func.block(block).is_finished() {
            return Err(format!("finishing already-finished block b{}", block.index()));
        }
        let instr = IrIndex::new(IrKind::Instr, self.func.instrs.len() as u32);
        self.func.push_instr(block, op, cond, arg_size, None, args);
        for &arg in args {
            self.func.add_user(arg, instr);
        }
        self.func.block_mut(block).flags |= block_flags::FINISHED;
        Ok(())
    }

    pub fn add_jump(&mut self, from: IrIndex, to: IrIndex) -> BuildResult<()> {
        self.emit_terminator(from, IrOpcode::Jump, IrCond::None, 0, &[to])?;
        self.add_block_target(from, to)
    }

    /// Branch on `value` under `cond` (tested against zero). Returns the
    /// freshly allocated (then, else) successor blocks, unsealed.
    pub fn add_unary_branch(
        &mut self,
        from: IrIndex,
        cond: IrCond,
        arg_size: u8,
        value: IrIndex,
    ) -> BuildResult<(IrIndex, IrIndex)> {
        self.emit_terminator(from, IrOpcode::BranchUnary, cond, arg_size, &[value])?;
        let then_block = self.func.add_block();
        let else_block = self.func.add_block();
        self.add_block_target(from, then_block)?;
        self.add_block_target(from, else_block)?;
        Ok((then_block, else_block))
    }

    /// Branch comparing two operands. Returns the freshly allocated
    /// (then, else) successor blocks, unsealed.
    pub fn add_bin_branch(
        &mut self,
        from: IrIndex,
        cond: IrCond,
        arg_size: u8,
        left: IrIndex,
        right: IrIndex,
    ) -> BuildResult<(IrIndex, IrIndex)> {
        self.emit_terminator(from, IrOpcode::BranchBinary, cond, arg_size, &[left, right])?;
        let then_block = self.func.add_block();
        let else_block = self.func.add_block();
        self.add_block_target(from, then_block)?;
        self.add_block_target(from, else_block)?;
        Ok((then_block, else_block))
    }

    pub fn add_return(&mut self, block: IrIndex) -> BuildResult<()> {
        if self.ret_var.is_defined() {
            return Err("plain return in a function that returns a value".to_string());
        }
        self.emit_terminator(block, IrOpcode::Ret, IrCond::None, 0, &[])
    }

    pub fn add_return_value(&mut self, block: IrIndex, value: IrIndex) -> BuildResult<()> {
        if self.ret_var.is_undef() {
            return Err("value return in a void function".to_string());
        }
        self.emit_terminator(block, IrOpcode::RetVal, IrCond::None, 8, &[value])
    }

    pub fn add_unreachable(&mut self, block: IrIndex) -> BuildResult<()> {
        self.emit_terminator(block, IrOpcode::Unreachable, IrCond::None, 0, &[])
    }

    // ---- labels ----

    /// Route a jump from `from` to a label. A label's first predecessor is
    /// recorded without emitting anything (the label may inherit the block
    /// outright); the second allocates the real join block.
    pub fn add_jump_to_label(&mut self, from: IrIndex, label: &mut IrLabel) -> BuildResult<()> {
        if label.is_allocated {
            label.num_preds += 1;
            return self.add_jump(from, label.block);
        }
        if label.num_preds == 0 {
            label.num_preds = 1;
            label.block = from;
            return Ok(());
        }
        // second predecessor: allocate the join block and wire both
        let first = label.block;
        let block = self.func.add_block();
        self.add_jump(first, block)?;
        self.add_jump(from, block)?;
        label.block = block;
        label.num_preds = 2;
        label.is_allocated = true;
        Ok(())
    }

    /// Finish a label and return the block where generation continues.
    /// Allocated joins are sealed here; a label that inherited its sole
    /// predecessor hands back that block untouched (it is either a branch
    /// target sealed at creation, or a still-open block such as a loop
    /// header whose predecessors are not final yet).
    pub fn begin_label_block(&mut self, label: &mut IrLabel) -> BuildResult<IrIndex> {
        if !label.is_allocated {
            if label.num_preds == 0 {
                // unreachable join: fresh empty block with no predecessors
                let block = self.func.add_block();
                label.block = block;
                label.is_allocated = true;
                self.seal_block(block)?;
                return Ok(block);
            }
            // sole predecessor: generation continues in that block
            return Ok(label.block);
        }
        self.seal_block(label.block)?;
        Ok(label.block)
    }

    // ---- finalize ----

    /// Seal what remains and compact the virtual-register arena: live
    /// registers from the right end are swapped into removed slots found
    /// from the left, redirecting definitions and users, then the arena is
    /// truncated by the removed count.
    pub fn finish(mut self) -> BuildResult<IrFunction> {
        self.seal_block(IrFunction::EXIT_BLOCK)?;

        let total = self.func.vregs.len();
        let live_target = total - self.removed_vregs as usize;
        let mut right = total;
        for left in 0..live_target {
            if !self.func.vregs[left].removed {
                continue;
            }
            loop {
                right -= 1;
                if !self.func.vregs[right].removed {
                    break;
                }
            }
            let old = IrIndex::new(IrKind::VirtReg, right as u32);
            let new = IrIndex::new(IrKind::VirtReg, left as u32);

            // definition result slot
            let def = self.func.vregs[right].definition;
            match def.kind() {
                IrKind::Instr => {
                    let header = *self.func.instr(def);
                    if header.flags & super::instr_flags::HAS_RESULT != 0 {
                        let slot = header.payload_offset as usize;
                        if self.func.payload[slot] == old {
                            self.func.payload[slot] = new;
                        }
                    }
                }
                IrKind::Phi => self.func.phi_mut(def).result = new,
                _ => {}
            }
            // argument occurrences in users
            let users: Vec<IrIndex> =
                self.func.pool.get(self.func.vregs[right].users).to_vec();
            for user in users {
                match user.kind() {
                    IrKind::Instr => self.replace_in_instr_args(user, old, new),
                    IrKind::Phi => self.replace_in_phi_args(user, old, new),
                    _ => {}
                }
            }
            self.func.vregs.swap(left, right);
        }
        self.func.vregs.truncate(live_target);
        Ok(self.func)
    }

    // ---- queries used by the generator ----

    pub fn is_finished(&self, block: IrIndex) -> bool {
        self.func.block(block).is_finished()
    }

    pub fn mark_loop_header(&mut self, block: IrIndex) {
        self.func.block_mut(block).flags |= block_flags::LOOP_HEADER;
    }

    pub fn live_vreg_count(&self) -> usize {
        self.func.live_vreg_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrBasic;

    fn i32_t() -> IrIndex {
        IrBasic::I32.handle()
    }

    fn c(v: i64) -> IrIndex {
        IrIndex::small_const(v).unwrap()
    }

    /// Check the single-definition invariant: every live vreg is the result
    /// of exactly one instruction or phi, and its user set matches the
    /// multiset of operand occurrences.
    fn verify_ssa(f: &IrFunction) {
        for (i, vreg) in f.vregs.iter().enumerate() {
            assert!(!vreg.removed, "finalize left a tombstone at v{}", i);
            let handle = IrIndex::new(IrKind::VirtReg, i as u32);
            match vreg.definition.kind() {
                IrKind::Instr => {
                    assert_eq!(f.instr_result(vreg.definition), Some(handle));
                }
                IrKind::Phi => {
                    assert_eq!(f.phi(vreg.definition).result, handle);
                    assert!(!f.phi(vreg.definition).removed);
                }
                other => panic!("v{} defined by {:?}", i, other),
            }
            // user multiset equals operand occurrences
            let mut expected = 0usize;
            for (j, _) in f.instrs.iter().enumerate() {
                let ih = IrIndex::new(IrKind::Instr, j as u32);
                expected += f.instr_args(ih).iter().filter(|&&a| a == handle).count();
            }
            for phi in &f.phis {
                if !phi.removed {
                    expected += f.pool.get(phi.args).iter().filter(|&&a| a == handle).count();
                }
            }
            assert_eq!(
                f.pool.get(vreg.users).len(),
                expected,
                "user set of v{} out of sync",
                i
            );
        }
    }

    #[test]
    fn test_begin_shapes_exit_block() {
        let b = IrBuilder::new(Ident(0), 0, RetClass::Void).unwrap();
        let exit = IrFunction::EXIT_BLOCK;
        assert!(b.func.block(exit).is_finished());
        let instrs = b.func.block_instrs(exit);
        assert_eq!(instrs.len(), 1);
        assert_eq!(b.func.instr(instrs[0]).op, IrOpcode::Ret);

        let b = IrBuilder::new(Ident(0), 0, RetClass::NoReturn).unwrap();
        let instrs = b.func.block_instrs(exit);
        assert_eq!(b.func.instr(instrs[0]).op, IrOpcode::Unreachable);

        let b = IrBuilder::new(Ident(0), 0, RetClass::Value(i32_t())).unwrap();
        let instrs = b.func.block_instrs(exit);
        assert_eq!(b.func.instr(instrs[0]).op, IrOpcode::RetVal);
        assert!(b.ret_var.is_defined());
    }

    #[test]
    fn test_diamond_produces_one_phi() {
        // if (c) x = 2; else x = 3; merge reads x
        let mut b = IrBuilder::new(Ident(0), 0, RetClass::Value(i32_t())).unwrap();
        let entry = IrFunction::ENTRY_BLOCK;
        let x = b.new_var(i32_t());
        b.write_variable(entry, x, c(1));

        let cond = b.emit(entry, IrOpcode::Param, IrCond::None, 4, &[c(0)], Some(i32_t())).unwrap();
        let (t, e) = b.add_unary_branch(entry, IrCond::Ne, 4, cond).unwrap();
        b.seal_block(t).unwrap();
        b.seal_block(e).unwrap();

        b.write_variable(t, x, c(2));
        b.write_variable(e, x, c(3));

        let mut merge = IrLabel::new();
        b.add_jump_to_label(t, &mut merge).unwrap();
        b.add_jump_to_label(e, &mut merge).unwrap();
        let m = b.begin_label_block(&mut merge).unwrap();
        assert!(merge.is_allocated);

        let v = b.read_variable(m, x).unwrap();
        assert_eq!(v.kind(), IrKind::VirtReg);
        let phis = b.func.block_phis(m);
        assert_eq!(phis.len(), 1);
        let args: Vec<IrIndex> = b.func.pool.get(b.func.phi(phis[0]).args).to_vec();
        assert_eq!(args, vec![c(2), c(3)]);

        b.write_variable(m, b.ret_var, v);
        b.add_jump(m, IrFunction::EXIT_BLOCK).unwrap();
        let f = b.finish().unwrap();
        verify_ssa(&f);
    }

    #[test]
    fn test_single_predecessor_phi_short_circuits() {
        // a phi is never materialized for a single-predecessor block
        let mut b = IrBuilder::new(Ident(0), 0, RetClass::Void).unwrap();
        let entry = IrFunction::ENTRY_BLOCK;
        let x = b.new_var(i32_t());
        b.write_variable(entry, x, c(7));

        let next = b.func.add_block();
        b.add_jump(entry, next).unwrap();
        b.seal_block(next).unwrap();

        let v = b.read_variable(next, x).unwrap();
        assert_eq!(v, c(7));
        assert!(b.func.block_phis(next).is_empty());
    }

    #[test]
    fn test_loop_trivial_phi_removed() {
        // while-shaped loop where the body never writes x: the header phi
        // collapses back to the pre-loop definition
        let mut b = IrBuilder::new(Ident(0), 0, RetClass::Void).unwrap();
        let entry = IrFunction::ENTRY_BLOCK;
        let x = b.new_var(i32_t());
        b.write_variable(entry, x, c(41));
        let vregs_before = b.func.vregs.len();

        let header = b.func.add_block();
        b.mark_loop_header(header);
        b.add_jump(entry, header).unwrap();

        // header reads x for its condition while unsealed → incomplete phi
        let cond_v = b.read_variable(header, x).unwrap();
        assert_eq!(cond_v.kind(), IrKind::VirtReg);
        let (body, exit) = b.add_unary_branch(header, IrCond::Ne, 4, cond_v).unwrap();
        b.seal_block(body).unwrap();

        // body writes nothing, jumps back
        b.add_jump(body, header).unwrap();
        b.seal_block(header).unwrap();
        b.seal_block(exit).unwrap();

        // after sealing, the incomplete phi was filled with [41, 41-via-body]
        // and removed as trivial
        assert!(b.func.block_phis(header).is_empty());
        let v = b.read_variable(exit, x).unwrap();
        assert_eq!(v, c(41));

        b.add_jump(exit, IrFunction::EXIT_BLOCK).unwrap();
        let f = b.finish().unwrap();
        // the phi's vreg was compacted away
        assert_eq!(f.vregs.len(), vregs_before);
        verify_ssa(&f);
    }

    #[test]
    fn test_loop_with_write_keeps_phi() {
        let mut b = IrBuilder::new(Ident(0), 0, RetClass::Void).unwrap();
        let entry = IrFunction::ENTRY_BLOCK;
        let x = b.new_var(i32_t());
        b.write_variable(entry, x, c(0));

        let header = b.func.add_block();
        b.add_jump(entry, header).unwrap();
        let cond_v = b.read_variable(header, x).unwrap();
        let (body, exit) = b.add_unary_branch(header, IrCond::Ne, 4, cond_v).unwrap();
        b.seal_block(body).unwrap();

        // x = x + 1 in the body
        let cur = b.read_variable(body, x).unwrap();
        let next = b.emit(body, IrOpcode::Add, IrCond::None, 4, &[cur, c(1)], Some(i32_t())).unwrap();
        b.write_variable(body, x, next);
        b.add_jump(body, header).unwrap();
        b.seal_block(header).unwrap();
        b.seal_block(exit).unwrap();

        let phis = b.func.block_phis(header);
        assert_eq!(phis.len(), 1);
        let args: Vec<IrIndex> = b.func.pool.get(b.func.phi(phis[0]).args).to_vec();
        // entry value and loop-carried value, parallel to predecessors
        assert_eq!(args.len(), 2);
        assert!(args.contains(&c(0)));
        assert!(args.contains(&next));

        b.add_jump(exit, IrFunction::EXIT_BLOCK).unwrap();
        let f = b.finish().unwrap();
        verify_ssa(&f);
    }

    #[test]
    fn test_sealed_block_rejects_new_predecessor() {
        let mut b = IrBuilder::new(Ident(0), 0, RetClass::Void).unwrap();
        let sealed = b.func.add_block();
        b.seal_block(sealed).unwrap();
        let other = b.func.add_block();
        let err = b.add_block_target(other, sealed).unwrap_err();
        assert!(err.contains("sealed"));
    }

    #[test]
    fn test_finishing_twice_is_an_error() {
        let mut b = IrBuilder::new(Ident(0), 0, RetClass::Void).unwrap();
        let entry = IrFunction::ENTRY_BLOCK;
        b.add_jump(entry, IrFunction::EXIT_BLOCK).unwrap();
        let err = b.add_jump(entry, IrFunction::EXIT_BLOCK).unwrap_err();
        assert!(err.contains("finished"));
    }

    #[test]
    fn test_plain_return_in_value_function_is_an_error() {
        let mut b = IrBuilder::new(Ident(0), 0, RetClass::Value(i32_t())).unwrap();
        let block = b.func.add_block();
        let err = b.add_return(block).unwrap_err();
        assert!(err.contains("return"));
    }

    #[test]
    fn test_label_with_one_predecessor_inherits_block() {
        let mut b = IrBuilder::new(Ident(0), 0, RetClass::Void).unwrap();
        let entry = IrFunction::ENTRY_BLOCK;
        let blocks_before = b.func.blocks.len();
        let mut label = IrLabel::new();
        b.add_jump_to_label(entry, &mut label).unwrap();
        let joined = b.begin_label_block(&mut label).unwrap();
        // no new block was allocated; generation continues in entry
        assert_eq!(joined, entry);
        assert_eq!(b.func.blocks.len(), blocks_before);
    }
}
