//! Constant folding and dead-code elimination on the IR.
//!
//! This is the whole optimization story by design: fold instructions
//! whose operands are compile-time constants, collapse branches on
//! folded conditions, drop unreachable blocks, and remove pure
//! instructions whose results are never used. Signed integer folding
//! wraps, matching the VM.

use std::collections::HashMap;

use crate::{Block, BlockId, FloatCC, Function, Inst, IntCC, Module, Terminator, ValueId};

/// Runs constant folding then dead-code elimination over every
/// function in the module.
pub fn optimize_module(module: &mut Module) {
    let mut strings = std::mem::take(&mut module.strings);
    for func in &mut module.functions {
        fold_function(func, &mut strings);
        compact_reachable_blocks(func);
        eliminate_dead_instructions(func);
    }
    module.strings = strings;
}

/// A value known at compile time.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Known {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(u32),
    Null,
}

fn intern(strings: &mut Vec<String>, s: &str) -> u32 {
    if let Some(idx) = strings.iter().position(|x| x == s) {
        return idx as u32;
    }
    strings.push(s.to_string());
    (strings.len() - 1) as u32
}

fn fold_function(func: &mut Function, strings: &mut Vec<String>) {
    let mut known: HashMap<ValueId, Known> = HashMap::new();

    for block in &mut func.blocks {
        for inst in &mut block.instrs {
            if let Some(folded) = fold_inst(inst, &known, strings) {
                let dst = inst.dst().expect("foldable instructions define a value");
                known.insert(dst, folded);
                *inst = known_to_inst(dst, folded);
            } else {
                record_const(inst, &mut known);
            }
        }

        block.terminator = match std::mem::replace(&mut block.terminator, Terminator::Unterminated)
        {
            Terminator::BrIf {
                cond,
                then_target,
                else_target,
            } => match known.get(&cond) {
                Some(Known::Bool(true)) => Terminator::Jump {
                    target: then_target,
                },
                Some(Known::Bool(false)) => Terminator::Jump {
                    target: else_target,
                },
                _ => Terminator::BrIf {
                    cond,
                    then_target,
                    else_target,
                },
            },
            Terminator::BrTable {
                value,
                targets,
                default,
            } => match known.get(&value) {
                Some(Known::Int(n)) => {
                    let target = usize::try_from(*n)
                        .ok()
                        .and_then(|i| targets.get(i).copied())
                        .unwrap_or(default);
                    Terminator::Jump { target }
                }
                _ => Terminator::BrTable {
                    value,
                    targets,
                    default,
                },
            },
            other => other,
        };
    }
}

fn record_const(inst: &Inst, known: &mut HashMap<ValueId, Known>) {
    match *inst {
        Inst::IConst { dst, value } => {
            known.insert(dst, Known::Int(value));
        }
        Inst::FConst { dst, value } => {
            known.insert(dst, Known::Float(value));
        }
        Inst::BConst { dst, value } => {
            known.insert(dst, Known::Bool(value));
        }
        Inst::SConst { dst, string } => {
            known.insert(dst, Known::Str(string));
        }
        Inst::NullConst { dst } => {
            known.insert(dst, Known::Null);
        }
        _ => {}
    }
}

fn known_to_inst(dst: ValueId, value: Known) -> Inst {
    match value {
        Known::Int(value) => Inst::IConst { dst, value },
        Known::Float(value) => Inst::FConst { dst, value },
        Known::Bool(value) => Inst::BConst { dst, value },
        Known::Str(string) => Inst::SConst { dst, string },
        Known::Null => Inst::NullConst { dst },
    }
}

fn fold_inst(
    inst: &Inst,
    known: &HashMap<ValueId, Known>,
    strings: &mut Vec<String>,
) -> Option<Known> {
    let int = |v: &ValueId| match known.get(v) {
        Some(Known::Int(n)) => Some(*n),
        _ => None,
    };
    let float = |v: &ValueId| match known.get(v) {
        Some(Known::Float(x)) => Some(*x),
        _ => None,
    };
    let boolean = |v: &ValueId| match known.get(v) {
        Some(Known::Bool(b)) => Some(*b),
        _ => None,
    };
    let string = |v: &ValueId| match known.get(v) {
        Some(Known::Str(s)) => Some(*s),
        _ => None,
    };

    Some(match inst {
        Inst::IAdd { a, b, .. } => Known::Int(int(a)?.wrapping_add(int(b)?)),
        Inst::ISub { a, b, .. } => Known::Int(int(a)?.wrapping_sub(int(b)?)),
        Inst::IMul { a, b, .. } => Known::Int(int(a)?.wrapping_mul(int(b)?)),
        // Division by a constant zero keeps the runtime trap.
        Inst::SDiv { a, b, .. } => match (int(a), int(b)) {
            (Some(x), Some(y)) if y != 0 => Known::Int(x.wrapping_div(y)),
            _ => return None,
        },
        Inst::SRem { a, b, .. } => match (int(a), int(b)) {
            (Some(x), Some(y)) if y != 0 => Known::Int(x.wrapping_rem(y)),
            _ => return None,
        },
        Inst::UDiv { a, b, .. } => match (int(a), int(b)) {
            (Some(x), Some(y)) if y != 0 => Known::Int(((x as u64) / (y as u64)) as i64),
            _ => return None,
        },
        Inst::URem { a, b, .. } => match (int(a), int(b)) {
            (Some(x), Some(y)) if y != 0 => Known::Int(((x as u64) % (y as u64)) as i64),
            _ => return None,
        },
        Inst::INeg { src, .. } => Known::Int(int(src)?.wrapping_neg()),

        Inst::FAdd { a, b, .. } => Known::Float(float(a)? + float(b)?),
        Inst::FSub { a, b, .. } => Known::Float(float(a)? - float(b)?),
        Inst::FMul { a, b, .. } => Known::Float(float(a)? * float(b)?),
        Inst::FDiv { a, b, .. } => Known::Float(float(a)? / float(b)?),
        Inst::FRem { a, b, .. } => Known::Float(float(a)? % float(b)?),
        Inst::FNeg { src, .. } => Known::Float(-float(src)?),

        Inst::BAnd { a, b, .. } => Known::Int(int(a)? & int(b)?),
        Inst::BOr { a, b, .. } => Known::Int(int(a)? | int(b)?),
        Inst::BXor { a, b, .. } => Known::Int(int(a)? ^ int(b)?),
        Inst::BNot { src, .. } => Known::Int(!int(src)?),
        Inst::Shl { a, b, .. } => Known::Int(int(a)?.wrapping_shl(int(b)? as u32)),
        Inst::AShr { a, b, .. } => Known::Int(int(a)?.wrapping_shr(int(b)? as u32)),
        Inst::LShr { a, b, .. } => {
            Known::Int(((int(a)? as u64).wrapping_shr(int(b)? as u32)) as i64)
        }

        Inst::Icmp { cc, a, b, .. } => {
            let (x, y) = (int(a)?, int(b)?);
            Known::Bool(match cc {
                IntCC::Eq => x == y,
                IntCC::Ne => x != y,
                IntCC::Slt => x < y,
                IntCC::Sle => x <= y,
                IntCC::Sgt => x > y,
                IntCC::Sge => x >= y,
                IntCC::Ult => (x as u64) < (y as u64),
                IntCC::Ule => (x as u64) <= (y as u64),
                IntCC::Ugt => (x as u64) > (y as u64),
                IntCC::Uge => (x as u64) >= (y as u64),
            })
        }
        Inst::Fcmp { cc, a, b, .. } => {
            let (x, y) = (float(a)?, float(b)?);
            Known::Bool(match cc {
                FloatCC::Eq => x == y,
                FloatCC::Ne => x != y,
                FloatCC::Lt => x < y,
                FloatCC::Le => x <= y,
                FloatCC::Gt => x > y,
                FloatCC::Ge => x >= y,
            })
        }

        Inst::LogAnd { a, b, .. } => Known::Bool(boolean(a)? && boolean(b)?),
        Inst::LogOr { a, b, .. } => Known::Bool(boolean(a)? || boolean(b)?),
        Inst::LogNot { src, .. } => Known::Bool(!boolean(src)?),

        Inst::StrConcat { a, b, .. } => {
            let (x, y) = (string(a)?, string(b)?);
            let joined = format!("{}{}", strings[x as usize], strings[y as usize]);
            Known::Str(intern(strings, &joined))
        }
        Inst::StrLen { src, .. } => Known::Int(strings[string(src)? as usize].len() as i64),
        Inst::StrCompare { a, b, .. } => {
            let (x, y) = (string(a)?, string(b)?);
            Known::Int(match strings[x as usize].cmp(&strings[y as usize]) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            })
        }

        Inst::IsNull { src, .. } => match known.get(src) {
            Some(Known::Null) => Known::Bool(true),
            _ => return None,
        },

        _ => return None,
    })
}

/// Drops blocks unreachable from the entry and renumbers the rest,
/// rewriting terminator targets, phi argument blocks, handler targets,
/// and predecessor lists. The lowerer also runs this on freshly built
/// functions, so joins whose every path returned never reach the
/// verifier. Handler targets count as edges: a catch block is entered
/// by the VM, not by a terminator.
pub fn compact_reachable_blocks(func: &mut Function) {
    let n = func.blocks.len();
    let mut reachable = vec![false; n];
    let mut stack = vec![0usize];
    reachable[0] = true;
    while let Some(b) = stack.pop() {
        let mut reach = |s: usize, stack: &mut Vec<usize>, reachable: &mut Vec<bool>| {
            if !reachable[s] {
                reachable[s] = true;
                stack.push(s);
            }
        };
        for succ in func.blocks[b].terminator.successors() {
            reach(succ.0 as usize, &mut stack, &mut reachable);
        }
        for inst in &func.blocks[b].instrs {
            if let Inst::SetHandler { target } = inst {
                reach(target.0 as usize, &mut stack, &mut reachable);
            }
        }
    }

    if reachable.iter().all(|&r| r) {
        func.recompute_preds();
        prune_phi_args(func);
        return;
    }

    let mut remap: Vec<Option<BlockId>> = vec![None; n];
    let mut next = 0u32;
    for (idx, &r) in reachable.iter().enumerate() {
        if r {
            remap[idx] = Some(BlockId(next));
            next += 1;
        }
    }

    let old_blocks = std::mem::take(&mut func.blocks);
    for (idx, mut block) in old_blocks.into_iter().enumerate() {
        if !reachable[idx] {
            continue;
        }
        rewrite_targets(&mut block, &remap);
        func.blocks.push(block);
    }
    func.recompute_preds();
    prune_phi_args(func);
}

fn rewrite_targets(block: &mut Block, remap: &[Option<BlockId>]) {
    let map = |b: BlockId| remap[b.0 as usize].expect("reachable target");
    block.terminator = match std::mem::replace(&mut block.terminator, Terminator::Unterminated) {
        Terminator::Jump { target } => Terminator::Jump {
            target: map(target),
        },
        Terminator::BrIf {
            cond,
            then_target,
            else_target,
        } => Terminator::BrIf {
            cond,
            then_target: map(then_target),
            else_target: map(else_target),
        },
        Terminator::BrTable {
            value,
            targets,
            default,
        } => Terminator::BrTable {
            value,
            targets: targets.into_iter().map(map).collect(),
            default: map(default),
        },
        other => other,
    };
    for inst in &mut block.instrs {
        match inst {
            Inst::Phi { args, .. } => {
                // Arguments from dropped predecessors disappear with
                // the edge; the remaining blocks are renumbered.
                args.retain(|(b, _)| remap[b.0 as usize].is_some());
                for (b, _) in args.iter_mut() {
                    *b = remap[b.0 as usize].expect("retained above");
                }
            }
            Inst::SetHandler { target } => {
                *target = remap[target.0 as usize].expect("handler target is reachable");
            }
            _ => {}
        }
    }
}

/// Removes phi arguments for edges that no longer exist (after branch
/// folding turned conditional branches into jumps).
fn prune_phi_args(func: &mut Function) {
    for idx in 0..func.blocks.len() {
        let preds = func.blocks[idx].preds.clone();
        for inst in &mut func.blocks[idx].instrs {
            if let Inst::Phi { args, .. } = inst {
                args.retain(|(b, _)| preds.contains(b));
            }
        }
    }
}

/// Iteratively removes pure instructions whose results are unused.
fn eliminate_dead_instructions(func: &mut Function) {
    loop {
        let mut use_counts: HashMap<ValueId, usize> = HashMap::new();
        for block in &func.blocks {
            for inst in &block.instrs {
                inst.visit_uses(|v| *use_counts.entry(v).or_insert(0) += 1);
            }
            block.terminator.visit_uses(|v| *use_counts.entry(v).or_insert(0) += 1);
        }

        let mut removed = false;
        for block in &mut func.blocks {
            block.instrs.retain(|inst| {
                let dead = inst.is_pure()
                    && inst
                        .dst()
                        .is_some_and(|d| use_counts.get(&d).copied().unwrap_or(0) == 0);
                if dead {
                    removed = true;
                }
                !dead
            });
        }
        if !removed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{self, TypeRegistry};
    use crate::verify_module;

    fn module_with(func: Function) -> Module {
        let mut module = Module::new(TypeRegistry::new());
        module.functions.push(func);
        module
    }

    #[test]
    fn folds_arithmetic_with_precedence_shape() {
        // return 1 + 2 * 3
        let mut func = Function::new("main".to_string(), types::I64);
        let entry = func.add_block();
        let one = func.new_value(types::I64);
        let two = func.new_value(types::I64);
        let three = func.new_value(types::I64);
        let mul = func.new_value(types::I64);
        let sum = func.new_value(types::I64);
        let block = func.block_mut(entry);
        block.instrs.push(Inst::IConst { dst: one, value: 1 });
        block.instrs.push(Inst::IConst { dst: two, value: 2 });
        block.instrs.push(Inst::IConst { dst: three, value: 3 });
        block.instrs.push(Inst::IMul { dst: mul, a: two, b: three });
        block.instrs.push(Inst::IAdd { dst: sum, a: one, b: mul });
        block.terminator = Terminator::Ret { value: Some(sum) };
        func.recompute_preds();

        let mut module = module_with(func);
        optimize_module(&mut module);
        verify_module(&module).expect("verify");

        let block = &module.functions[0].blocks[0];
        // Only the final constant survives DCE.
        assert_eq!(block.instrs.len(), 1);
        match &block.instrs[0] {
            Inst::IConst { value, .. } => assert_eq!(*value, 7),
            other => panic!("expected folded constant, got {other:?}"),
        }
    }

    #[test]
    fn folding_wraps_on_signed_overflow() {
        let mut func = Function::new("main".to_string(), types::I64);
        let entry = func.add_block();
        let max = func.new_value(types::I64);
        let one = func.new_value(types::I64);
        let sum = func.new_value(types::I64);
        let block = func.block_mut(entry);
        block.instrs.push(Inst::IConst { dst: max, value: i64::MAX });
        block.instrs.push(Inst::IConst { dst: one, value: 1 });
        block.instrs.push(Inst::IAdd { dst: sum, a: max, b: one });
        block.terminator = Terminator::Ret { value: Some(sum) };
        func.recompute_preds();

        let mut module = module_with(func);
        optimize_module(&mut module);
        match &module.functions[0].blocks[0].instrs[0] {
            Inst::IConst { value, .. } => assert_eq!(*value, i64::MIN),
            other => panic!("expected folded constant, got {other:?}"),
        }
    }

    #[test]
    fn division_by_constant_zero_is_not_folded() {
        let mut func = Function::new("main".to_string(), types::I64);
        let entry = func.add_block();
        let a = func.new_value(types::I64);
        let zero = func.new_value(types::I64);
        let q = func.new_value(types::I64);
        let block = func.block_mut(entry);
        block.instrs.push(Inst::IConst { dst: a, value: 7 });
        block.instrs.push(Inst::IConst { dst: zero, value: 0 });
        block.instrs.push(Inst::SDiv { dst: q, a, b: zero });
        block.terminator = Terminator::Ret { value: Some(q) };
        func.recompute_preds();

        let mut module = module_with(func);
        optimize_module(&mut module);
        assert!(matches!(
            module.functions[0].blocks[0].instrs.last(),
            Some(Inst::SDiv { .. })
        ));
    }

    #[test]
    fn folded_branch_drops_unreachable_block() {
        let mut func = Function::new("main".to_string(), types::I64);
        let entry = func.add_block();
        let then_b = func.add_block();
        let else_b = func.add_block();

        let cond = func.new_value(types::BOOL);
        let a = func.new_value(types::I64);
        let b = func.new_value(types::I64);

        func.block_mut(entry)
            .instrs
            .push(Inst::BConst { dst: cond, value: true });
        func.block_mut(entry).terminator = Terminator::BrIf {
            cond,
            then_target: then_b,
            else_target: else_b,
        };
        func.block_mut(then_b)
            .instrs
            .push(Inst::IConst { dst: a, value: 1 });
        func.block_mut(then_b).terminator = Terminator::Ret { value: Some(a) };
        func.block_mut(else_b)
            .instrs
            .push(Inst::IConst { dst: b, value: 2 });
        func.block_mut(else_b).terminator = Terminator::Ret { value: Some(b) };
        func.recompute_preds();

        let mut module = module_with(func);
        optimize_module(&mut module);
        verify_module(&module).expect("verify");
        assert_eq!(module.functions[0].blocks.len(), 2);
    }

    #[test]
    fn folds_string_concat_through_the_pool() {
        let mut module = Module::new(TypeRegistry::new());
        let hello = module.intern_string("hello ");
        let world = module.intern_string("world");

        let mut func = Function::new("main".to_string(), types::STR);
        let entry = func.add_block();
        let a = func.new_value(types::STR);
        let b = func.new_value(types::STR);
        let joined = func.new_value(types::STR);
        let block = func.block_mut(entry);
        block.instrs.push(Inst::SConst { dst: a, string: hello });
        block.instrs.push(Inst::SConst { dst: b, string: world });
        block.instrs.push(Inst::StrConcat { dst: joined, a, b });
        block.terminator = Terminator::Ret {
            value: Some(joined),
        };
        func.recompute_preds();
        module.functions.push(func);

        optimize_module(&mut module);
        let block = &module.functions[0].blocks[0];
        match block.instrs.last() {
            Some(Inst::SConst { string, .. }) => {
                assert_eq!(module.strings[*string as usize], "hello world");
            }
            other => panic!("expected folded string constant, got {other:?}"),
        }
    }
}
