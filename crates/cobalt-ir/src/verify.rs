//! IR validation: the invariants every lowered module must satisfy
//! before it reaches a backend.
//!
//! Checked per function: every block ends in exactly one terminator,
//! phis appear only at block entry with one argument per predecessor,
//! every use is dominated by its definition (phi arguments by the
//! corresponding predecessor's terminator), and predecessor lists
//! agree with the terminators.

use std::collections::HashMap;

use crate::{Block, BlockId, Function, Inst, Module, Terminator, ValueId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub message: String,
}

impl VerifyError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ir verify error: {}", self.message)
    }
}

impl std::error::Error for VerifyError {}

pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for func in &module.functions {
        verify_function(func).map_err(|e| VerifyError::new(format!("{}: {}", func.name, e.message)))?;
    }
    Ok(())
}

pub fn verify_function(func: &Function) -> Result<(), VerifyError> {
    if func.blocks.is_empty() {
        return Err(VerifyError::new("function has no blocks"));
    }

    for (idx, block) in func.blocks.iter().enumerate() {
        if !block.is_terminated() {
            return Err(VerifyError::new(format!("block b{idx} is unterminated")));
        }
        for succ in block.terminator.successors() {
            if succ.0 as usize >= func.blocks.len() {
                return Err(VerifyError::new(format!(
                    "block b{idx} targets missing block {succ}"
                )));
            }
        }
        for inst in &block.instrs {
            if let Inst::SetHandler { target } = inst {
                if target.0 as usize >= func.blocks.len() {
                    return Err(VerifyError::new(format!(
                        "block b{idx} arms a handler at missing block {target}"
                    )));
                }
            }
        }
    }

    verify_preds(func)?;
    verify_phi_shape(func)?;
    verify_defs(func)?;
    verify_dominance(func)?;
    Ok(())
}

fn verify_preds(func: &Function) -> Result<(), VerifyError> {
    let mut expected: Vec<Vec<BlockId>> = vec![Vec::new(); func.blocks.len()];
    for (idx, block) in func.blocks.iter().enumerate() {
        for succ in block.terminator.successors() {
            let preds = &mut expected[succ.0 as usize];
            if !preds.contains(&BlockId(idx as u32)) {
                preds.push(BlockId(idx as u32));
            }
        }
    }
    for (idx, block) in func.blocks.iter().enumerate() {
        let mut got = block.preds.clone();
        let mut want = expected[idx].clone();
        got.sort();
        want.sort();
        if got != want {
            return Err(VerifyError::new(format!(
                "block b{idx} predecessor list {got:?} does not match CFG {want:?}"
            )));
        }
    }
    Ok(())
}

fn verify_phi_shape(func: &Function) -> Result<(), VerifyError> {
    for (idx, block) in func.blocks.iter().enumerate() {
        let mut past_phis = false;
        for inst in &block.instrs {
            match inst {
                Inst::Phi { args, .. } => {
                    if past_phis {
                        return Err(VerifyError::new(format!(
                            "block b{idx} has a phi after a non-phi instruction"
                        )));
                    }
                    let mut arg_blocks: Vec<BlockId> = args.iter().map(|(b, _)| *b).collect();
                    arg_blocks.sort();
                    let mut preds = block.preds.clone();
                    preds.sort();
                    if arg_blocks != preds {
                        return Err(VerifyError::new(format!(
                            "phi in block b{idx} covers {arg_blocks:?} but predecessors are {preds:?}"
                        )));
                    }
                }
                _ => past_phis = true,
            }
        }
    }
    Ok(())
}

/// Where a value is defined: the entry block for parameters, otherwise
/// the block and instruction index of its defining instruction.
struct DefSites {
    sites: HashMap<ValueId, (BlockId, usize)>,
}

fn collect_defs(func: &Function) -> Result<DefSites, VerifyError> {
    let mut sites = HashMap::new();
    for &param in &func.params {
        sites.insert(param, (func.entry_block(), 0));
    }
    for (bidx, block) in func.blocks.iter().enumerate() {
        for (iidx, inst) in block.instrs.iter().enumerate() {
            if let Some(dst) = inst.dst() {
                if dst.0 as usize >= func.value_types.len() {
                    return Err(VerifyError::new(format!(
                        "instruction defines {dst} beyond the value table"
                    )));
                }
                if sites.insert(dst, (BlockId(bidx as u32), iidx)).is_some() {
                    return Err(VerifyError::new(format!("{dst} is defined more than once")));
                }
            }
        }
    }
    Ok(DefSites { sites })
}

fn verify_defs(func: &Function) -> Result<(), VerifyError> {
    let defs = collect_defs(func)?;
    let mut err = None;
    for block in &func.blocks {
        for inst in &block.instrs {
            inst.visit_uses(|v| {
                if err.is_none() && !defs.sites.contains_key(&v) {
                    err = Some(VerifyError::new(format!("{v} is used but never defined")));
                }
            });
        }
        block.terminator.visit_uses(|v| {
            if err.is_none() && !defs.sites.contains_key(&v) {
                err = Some(VerifyError::new(format!("{v} is used but never defined")));
            }
        });
    }
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Immediate dominators by iterative intersection over reverse
/// postorder (Cooper–Harvey–Kennedy).
pub(crate) fn immediate_dominators(func: &Function) -> Vec<Option<usize>> {
    let n = func.blocks.len();
    let mut postorder = Vec::with_capacity(n);
    let mut visited = vec![false; n];
    // Iterative DFS from the entry.
    let mut stack: Vec<(usize, Vec<BlockId>)> = vec![(0, func.blocks[0].terminator.successors())];
    visited[0] = true;
    loop {
        let next = match stack.last_mut() {
            None => break,
            Some((_, succs)) => succs.pop(),
        };
        match next {
            Some(succ) => {
                let succ = succ.0 as usize;
                if !visited[succ] {
                    visited[succ] = true;
                    stack.push((succ, func.blocks[succ].terminator.successors()));
                }
            }
            None => {
                let (node, _) = stack.pop().expect("stack is nonempty");
                postorder.push(node);
            }
        }
    }

    let mut order_of = vec![usize::MAX; n];
    for (i, &b) in postorder.iter().enumerate() {
        order_of[b] = i;
    }

    let mut idom: Vec<Option<usize>> = vec![None; n];
    idom[0] = Some(0);
    let mut changed = true;
    while changed {
        changed = false;
        for &b in postorder.iter().rev() {
            if b == 0 {
                continue;
            }
            let mut new_idom: Option<usize> = None;
            for pred in &func.blocks[b].preds {
                let p = pred.0 as usize;
                if idom[p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, &order_of, p, cur),
                });
            }
            if idom[b] != new_idom {
                idom[b] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

fn intersect(idom: &[Option<usize>], order_of: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while order_of[a] < order_of[b] {
            a = idom[a].expect("processed");
        }
        while order_of[b] < order_of[a] {
            b = idom[b].expect("processed");
        }
    }
    a
}

fn dominates(idom: &[Option<usize>], a: usize, mut b: usize) -> bool {
    loop {
        if a == b {
            return true;
        }
        match idom[b] {
            Some(parent) if parent != b => b = parent,
            _ => return false,
        }
    }
}

fn verify_dominance(func: &Function) -> Result<(), VerifyError> {
    let defs = collect_defs(func)?;
    let idom = immediate_dominators(func);

    let check_use = |v: ValueId, block: usize, inst_idx: usize| -> Result<(), VerifyError> {
        let &(def_block, def_idx) = defs.sites.get(&v).expect("checked by verify_defs");
        let ok = if def_block.0 as usize == block {
            // Parameters dominate everything in the entry block.
            func.params.contains(&v) || def_idx < inst_idx
        } else {
            dominates(&idom, def_block.0 as usize, block)
        };
        if ok {
            Ok(())
        } else {
            Err(VerifyError::new(format!(
                "{v} does not dominate its use in block b{block}"
            )))
        }
    };

    for (bidx, block) in func.blocks.iter().enumerate() {
        // Unreachable blocks have no dominator information; they are
        // dropped by the optimizer, not validated here.
        if bidx != 0 && idom[bidx].is_none() {
            continue;
        }
        for (iidx, inst) in block.instrs.iter().enumerate() {
            if let Inst::Phi { args, .. } = inst {
                for (pred, v) in args {
                    let &(def_block, _) = defs.sites.get(v).expect("checked by verify_defs");
                    let p = pred.0 as usize;
                    if idom[p].is_none() && p != 0 {
                        continue;
                    }
                    if !dominates(&idom, def_block.0 as usize, p) {
                        return Err(VerifyError::new(format!(
                            "phi argument {v} does not dominate predecessor b{p}"
                        )));
                    }
                }
            } else {
                let mut err = None;
                inst.visit_uses(|v| {
                    if err.is_none() {
                        err = check_use(v, bidx, iidx).err();
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            }
        }
        let mut err = None;
        let end = block.instrs.len();
        block.terminator.visit_uses(|v| {
            if err.is_none() {
                err = check_use(v, bidx, end).err();
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{self, TypeRegistry};

    fn one_block_func(build: impl FnOnce(&mut Function, BlockId)) -> Function {
        let mut func = Function::new("f".to_string(), types::I64);
        let entry = func.add_block();
        build(&mut func, entry);
        func.recompute_preds();
        func
    }

    fn verify_in_module(func: Function) -> Result<(), VerifyError> {
        let mut module = Module::new(TypeRegistry::new());
        module.functions.push(func);
        verify_module(&module)
    }

    #[test]
    fn accepts_constant_return() {
        let func = one_block_func(|func, entry| {
            let v = func.new_value(types::I64);
            let block = func.block_mut(entry);
            block.instrs.push(Inst::IConst { dst: v, value: 42 });
            block.terminator = Terminator::Ret { value: Some(v) };
        });
        verify_in_module(func).expect("verify");
    }

    #[test]
    fn rejects_unterminated_block() {
        let func = one_block_func(|func, entry| {
            let v = func.new_value(types::I64);
            func.block_mut(entry)
                .instrs
                .push(Inst::IConst { dst: v, value: 1 });
        });
        let err = verify_in_module(func).unwrap_err();
        assert!(err.message.contains("unterminated"), "{}", err.message);
    }

    #[test]
    fn rejects_use_before_def_in_block() {
        let func = one_block_func(|func, entry| {
            let a = func.new_value(types::I64);
            let b = func.new_value(types::I64);
            let block = func.block_mut(entry);
            // b = a + a before a is defined.
            block.instrs.push(Inst::IAdd { dst: b, a, b: a });
            block.instrs.push(Inst::IConst { dst: a, value: 1 });
            block.terminator = Terminator::Ret { value: Some(b) };
        });
        let err = verify_in_module(func).unwrap_err();
        assert!(err.message.contains("dominate"), "{}", err.message);
    }

    #[test]
    fn rejects_phi_after_non_phi() {
        let func = one_block_func(|func, entry| {
            let a = func.new_value(types::I64);
            let p = func.new_value(types::I64);
            let block = func.block_mut(entry);
            block.instrs.push(Inst::IConst { dst: a, value: 1 });
            block.instrs.push(Inst::Phi {
                dst: p,
                args: Vec::new(),
            });
            block.terminator = Terminator::Ret { value: Some(a) };
        });
        let err = verify_in_module(func).unwrap_err();
        assert!(err.message.contains("phi"), "{}", err.message);
    }

    #[test]
    fn rejects_phi_not_covering_preds() {
        let mut func = Function::new("f".to_string(), types::I64);
        let entry = func.add_block();
        let left = func.add_block();
        let right = func.add_block();
        let join = func.add_block();

        let cond = func.new_value(types::BOOL);
        let a = func.new_value(types::I64);
        let b = func.new_value(types::I64);
        let p = func.new_value(types::I64);

        func.block_mut(entry)
            .instrs
            .push(Inst::BConst { dst: cond, value: true });
        func.block_mut(entry).terminator = Terminator::BrIf {
            cond,
            then_target: left,
            else_target: right,
        };
        func.block_mut(left)
            .instrs
            .push(Inst::IConst { dst: a, value: 1 });
        func.block_mut(left).terminator = Terminator::Jump { target: join };
        func.block_mut(right)
            .instrs
            .push(Inst::IConst { dst: b, value: 2 });
        func.block_mut(right).terminator = Terminator::Jump { target: join };
        // Phi only mentions one of the two predecessors.
        func.block_mut(join).instrs.push(Inst::Phi {
            dst: p,
            args: vec![(left, a)],
        });
        func.block_mut(join).terminator = Terminator::Ret { value: Some(p) };
        func.recompute_preds();

        let err = verify_in_module(func).unwrap_err();
        assert!(err.message.contains("predecessors"), "{}", err.message);
    }

    #[test]
    fn accepts_diamond_with_phi() {
        let mut func = Function::new("f".to_string(), types::I64);
        let entry = func.add_block();
        let left = func.add_block();
        let right = func.add_block();
        let join = func.add_block();

        let cond = func.new_value(types::BOOL);
        let a = func.new_value(types::I64);
        let b = func.new_value(types::I64);
        let p = func.new_value(types::I64);

        func.block_mut(entry)
            .instrs
            .push(Inst::BConst { dst: cond, value: true });
        func.block_mut(entry).terminator = Terminator::BrIf {
            cond,
            then_target: left,
            else_target: right,
        };
        func.block_mut(left)
            .instrs
            .push(Inst::IConst { dst: a, value: 1 });
        func.block_mut(left).terminator = Terminator::Jump { target: join };
        func.block_mut(right)
            .instrs
            .push(Inst::IConst { dst: b, value: 2 });
        func.block_mut(right).terminator = Terminator::Jump { target: join };
        func.block_mut(join).instrs.push(Inst::Phi {
            dst: p,
            args: vec![(left, a), (right, b)],
        });
        func.block_mut(join).terminator = Terminator::Ret { value: Some(p) };
        func.recompute_preds();

        verify_in_module(func).expect("verify");
    }

    #[test]
    fn rejects_double_definition() {
        let func = one_block_func(|func, entry| {
            let v = func.new_value(types::I64);
            let block = func.block_mut(entry);
            block.instrs.push(Inst::IConst { dst: v, value: 1 });
            block.instrs.push(Inst::IConst { dst: v, value: 2 });
            block.terminator = Terminator::Ret { value: Some(v) };
        });
        let err = verify_in_module(func).unwrap_err();
        assert!(err.message.contains("more than once"), "{}", err.message);
    }
}
