//! Alias Access (§4.9)
//!
//! Hides every stack alloca behind a struct graph instead of letting a
//! use name the alloca's pointer directly. Allocas land in randomly
//! built "raw" structs mixed with pointer-typed padding; "transition"
//! structs of six pointer slots point at earlier raw or transition
//! nodes, wired into a DAG deep enough that reaching a given alloca
//! means walking a chain of shared getter calls down through it. A
//! disassembler sees six generic accessor functions and a pile of
//! opaque structs, never which slot belongs to which local.
//!
//! Functions with no allocas are left unchanged; the six getters are
//! only added to the module the first time some function actually
//! needs them.

use std::collections::{HashMap, HashSet};

use ir_core::{
    BasicBlock, Builder, CallTarget, CallingConv, Function, InstKind, Linkage, Module, Opcode,
    Type, Value,
};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::pass::{ModulePass, Pass, PassContext, PassInfo, PassResult};
use crate::rewrite::{find_index_by_name, remove_instruction_at, replace_value_in_function};

pub struct AliasAccessPass;

impl Pass for AliasAccessPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "alias_access",
            description: "[Pluto] buries alloca loads/stores behind a synthetic struct graph of padding and transition nodes",
            is_module_pass: true,
        }
    }
}

const TRANSITION_SLOTS: usize = 6;

fn getter_name(k: usize) -> String {
    format!("__alias_get_{k}")
}

/// Adds the six shared getters to `module`, unless it already has them:
/// `get_k(ptr) = load (ptr as [6 x i8*]*)[k]`, generic over whichever
/// six-pointer-slot struct `ptr` actually points to at a given call site.
fn ensure_getters(module: &mut Module) {
    if module.function_by_name(&getter_name(0)).is_some() {
        return;
    }
    let ptr_i8 = Type::ptr(Type::i8());
    let slots_ty = Type::Struct(vec![ptr_i8.clone(); TRANSITION_SLOTS]);
    for k in 0..TRANSITION_SLOTS {
        let f = Function::new(getter_name(k), ptr_i8.clone(), vec![ptr_i8.clone()]);
        f.set_linkage(Linkage::Private);
        let entry = BasicBlock::new("entry");
        f.append_block(entry.clone());
        let mut b = Builder::new(&f);
        b.position_at_end(entry);
        let slot = b.build_gep(
            slots_ty.clone(),
            Value::Param(ptr_i8.clone(), 0),
            vec![0, k as i64],
            ptr_i8.clone(),
        );
        let loaded = b.build_load(ptr_i8.clone(), slot);
        b.build_ret(loaded);
        module.add_function(f);
    }
}

fn bitcast_to_i8_ptr(b: &mut Builder<'_>, v: Value) -> Value {
    b.build_bitcast(v, Type::ptr(Type::i8()))
}

/// A node in the struct graph.
enum Node {
    /// A struct mixing real alloca slots with pointer padding.
    /// `field_of` maps an alloca's index in [`rewrite_function`]'s
    /// `allocas` list to its slot within `struct_ty`.
    Raw {
        struct_ty: Type,
        ptr: Value,
        field_of: HashMap<usize, usize>,
    },
    /// A six-pointer-slot struct pointing at earlier nodes.
    Transition { ptr: Value },
}

fn node_ptr(node: &Node) -> Value {
    match node {
        Node::Raw { ptr, .. } => ptr.clone(),
        Node::Transition { ptr } => ptr.clone(),
    }
}

struct AllocaSite {
    block: BasicBlock,
    name: String,
    allocated_ty: Type,
}

fn collect_allocas(function: &Function) -> Vec<AllocaSite> {
    let mut out = Vec::new();
    for block in function.blocks() {
        for inst in block.instructions() {
            if inst.opcode != Opcode::Alloca {
                continue;
            }
            let (Some(name), InstKind::Alloca { allocated_ty }) = (&inst.name, &inst.kind) else {
                continue;
            };
            out.push(AllocaSite {
                block: block.clone(),
                name: name.clone(),
                allocated_ty: allocated_ty.clone(),
            });
        }
    }
    out
}

impl ModulePass for AliasAccessPass {
    fn run_on_module(
        &mut self,
        module: &mut Module,
        ctx: &mut PassContext,
        selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool> {
        let functions: Vec<Function> = module.functions().to_vec();
        let mut changed = false;
        let mut getters_ready = false;

        for function in &functions {
            if function.is_declaration() {
                continue;
            }
            if let Some(set) = selected_functions {
                if !set.contains(&function.name()) {
                    continue;
                }
            }
            let allocas = collect_allocas(function);
            if allocas.is_empty() {
                continue;
            }
            if !getters_ready {
                ensure_getters(module);
                getters_ready = true;
            }
            rewrite_function(function, &allocas, ctx);
            changed = true;
        }

        Ok(changed)
    }
}

fn rewrite_function(function: &Function, allocas: &[AllocaSite], ctx: &mut PassContext) {
    let n = allocas.len();
    let ptr_i8 = Type::ptr(Type::i8());

    // Step 1: n buckets, one alloca assigned to each with replacement.
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        let bucket = ctx.rng.inner_mut().gen_range(0..n);
        buckets[bucket].push(i);
    }

    let entry = function.entry_block().expect("function has an entry block");
    let mut b = Builder::new(function);
    b.position_before_index(entry.clone(), entry.first_non_phi_index());

    // Step 2: one raw node per non-empty bucket, fields shuffled with
    // pointer padding so the real slots aren't in any fixed position.
    enum Field {
        Real(usize),
        Padding,
    }

    let mut nodes: Vec<Node> = Vec::new();
    let mut home: Vec<(usize, usize)> = vec![(0, 0); n];

    for bucket in &buckets {
        if bucket.is_empty() {
            continue;
        }
        let mut fields: Vec<Field> = bucket.iter().map(|&i| Field::Real(i)).collect();
        let padding = 1 + ctx.rng.inner_mut().gen_range(0..3);
        fields.extend((0..padding).map(|_| Field::Padding));
        fields.shuffle(ctx.rng.inner_mut());

        let field_types: Vec<Type> = fields
            .iter()
            .map(|f| match f {
                Field::Real(i) => allocas[*i].allocated_ty.clone(),
                Field::Padding => ptr_i8.clone(),
            })
            .collect();
        let struct_ty = Type::Struct(field_types);
        let ptr = b.build_alloca(struct_ty.clone());

        let raw_idx = nodes.len();
        let mut field_of = HashMap::new();
        for (slot, f) in fields.iter().enumerate() {
            if let Field::Real(i) = f {
                field_of.insert(*i, slot);
                home[*i] = (raw_idx, slot);
            }
        }
        nodes.push(Node::Raw { struct_ty, ptr, field_of });
    }
    let raw_count = nodes.len();

    // Step 3: 3 * raw_count transition nodes, each slot wired to a
    // randomly chosen node created earlier than itself.
    let transition_struct_ty = Type::Struct(vec![ptr_i8.clone(); TRANSITION_SLOTS]);
    let mut slot_target: Vec<[usize; TRANSITION_SLOTS]> = Vec::new();
    for _ in 0..3 * raw_count {
        let pool_size = nodes.len();
        let ptr = b.build_alloca(transition_struct_ty.clone());
        let mut targets = [0usize; TRANSITION_SLOTS];
        for (k, target) in targets.iter_mut().enumerate() {
            *target = ctx.rng.inner_mut().gen_range(0..pool_size);
            let dest = bitcast_to_i8_ptr(&mut b, node_ptr(&nodes[*target]));
            let slot = b.build_gep(
                transition_struct_ty.clone(),
                ptr.clone(),
                vec![0, k as i64],
                ptr_i8.clone(),
            );
            b.build_store(dest, slot);
        }
        slot_target.push(targets);
        nodes.push(Node::Transition { ptr });
    }

    // Step 4: path propagation, keeping the first reachable path to
    // each alloca per transition node.
    let mut paths: Vec<HashMap<usize, Vec<usize>>> = vec![HashMap::new(); slot_target.len()];
    for ti in 0..slot_target.len() {
        for (k, &target) in slot_target[ti].iter().enumerate() {
            if target < raw_count {
                let Node::Raw { field_of, .. } = &nodes[target] else {
                    unreachable!("raw-node index must point at a Raw node")
                };
                for &alloca_idx in field_of.keys() {
                    paths[ti].entry(alloca_idx).or_insert_with(|| vec![k]);
                }
            } else {
                let tj = target - raw_count;
                let via: Vec<(usize, Vec<usize>)> =
                    paths[tj].iter().map(|(a, p)| (*a, p.clone())).collect();
                for (alloca_idx, path) in via {
                    paths[ti].entry(alloca_idx).or_insert_with(|| {
                        let mut full = Vec::with_capacity(path.len() + 1);
                        full.push(k);
                        full.extend(path);
                        full
                    });
                }
            }
        }
    }

    // Step 6: for every alloca, walk a chosen transition node's path
    // down to its raw node (or address the raw node directly if no
    // transition node happens to reach it), then GEP into its slot.
    let mut replacements: Vec<(AllocaSite, Value)> = Vec::with_capacity(n);
    for (i, site) in allocas.iter().enumerate() {
        let (raw_idx, field_idx) = home[i];
        let Node::Raw { struct_ty, ptr: raw_ptr, .. } = &nodes[raw_idx] else {
            unreachable!("home must point at a Raw node")
        };
        let struct_ty = struct_ty.clone();
        let raw_ptr = raw_ptr.clone();

        let candidates: Vec<usize> = (0..slot_target.len())
            .filter(|ti| paths[*ti].contains_key(&i))
            .collect();

        let field_ptr = match candidates.choose(ctx.rng.inner_mut()) {
            Some(&ti) => {
                let path = paths[ti][&i].clone();
                let transition_ptr = node_ptr(&nodes[raw_count + ti]);
                let mut cur = bitcast_to_i8_ptr(&mut b, transition_ptr);
                for &slot in &path {
                    cur = b
                        .build_call(
                            ptr_i8.clone(),
                            CallTarget::Direct(getter_name(slot)),
                            CallingConv::C,
                            vec![cur],
                            true,
                        )
                        .expect("getter always returns a value");
                }
                let raw_typed = b.build_bitcast(cur, Type::ptr(struct_ty.clone()));
                b.build_gep(struct_ty, raw_typed, vec![0, field_idx as i64], site.allocated_ty.clone())
            }
            None => b.build_gep(struct_ty, raw_ptr, vec![0, field_idx as i64], site.allocated_ty.clone()),
        };
        replacements.push((
            AllocaSite {
                block: site.block.clone(),
                name: site.name.clone(),
                allocated_ty: site.allocated_ty.clone(),
            },
            field_ptr,
        ));
    }

    for (site, replacement) in replacements {
        let old_val = Value::Inst(Type::ptr(site.allocated_ty.clone()), site.name.clone());
        replace_value_in_function(function, &old_val, &replacement);
        if let Some(idx) = find_index_by_name(&site.block, &site.name) {
            remove_instruction_at(&site.block, idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_module, Instruction};

    fn two_local_function() -> Function {
        let f = Function::new("f", Type::i32(), vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(
            Instruction::new(Opcode::Alloca, Type::ptr(Type::i32()), Some("a".into()), vec![])
                .with_kind(InstKind::Alloca { allocated_ty: Type::i32() }),
        );
        bb.push_instruction(
            Instruction::new(Opcode::Alloca, Type::ptr(Type::i32()), Some("b".into()), vec![])
                .with_kind(InstKind::Alloca { allocated_ty: Type::i32() }),
        );
        bb.push_instruction(Instruction::new(
            Opcode::Store,
            Type::Void,
            None,
            vec![Value::ConstInt(Type::i32(), 1), Value::Inst(Type::ptr(Type::i32()), "a".into())],
        ));
        bb.push_instruction(Instruction::new(
            Opcode::Store,
            Type::Void,
            None,
            vec![Value::ConstInt(Type::i32(), 2), Value::Inst(Type::ptr(Type::i32()), "b".into())],
        ));
        bb.push_instruction(Instruction::new(
            Opcode::Load,
            Type::i32(),
            Some("av".into()),
            vec![Value::Inst(Type::ptr(Type::i32()), "a".into())],
        ));
        bb.push_instruction(Instruction::new(
            Opcode::Ret,
            Type::Void,
            None,
            vec![Value::Inst(Type::i32(), "av".into())],
        ));
        f.append_block(bb);
        f
    }

    #[test]
    fn boxes_locals_behind_the_struct_graph_and_stays_verifiable() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        m.add_function(two_local_function());

        let mut pass = AliasAccessPass;
        let mut ctx = PassContext::new(5);
        let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
        assert!(changed);
        verify_module(&m).unwrap();

        assert!(m.function_by_name(&getter_name(0)).is_some());
        assert!(m.function_by_name(&getter_name(5)).is_some());

        let f = m.function_by_name("f").unwrap();
        let entry = f.entry_block().unwrap();
        assert!(find_index_by_name(&entry, "a").is_none());
        assert!(find_index_by_name(&entry, "b").is_none());
        assert!(entry.instructions().iter().any(|i| i.opcode == Opcode::GetElementPtr));
    }

    #[test]
    fn no_allocas_no_change() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        let f = Function::new("f", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb);
        m.add_function(f);

        let mut pass = AliasAccessPass;
        let mut ctx = PassContext::new(5);
        let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
        assert!(!changed);
        assert!(m.function_by_name(&getter_name(0)).is_none());
    }

    #[test]
    fn respects_selected_functions() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");

        for name in ["keep", "skip"] {
            let f = Function::new(name, Type::Void, vec![]);
            let bb = BasicBlock::new("entry");
            bb.push_instruction(
                Instruction::new(Opcode::Alloca, Type::ptr(Type::i32()), Some("x".into()), vec![])
                    .with_kind(InstKind::Alloca { allocated_ty: Type::i32() }),
            );
            bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
            f.append_block(bb);
            m.add_function(f);
        }

        let mut pass = AliasAccessPass;
        let mut ctx = PassContext::new(6);
        let selected: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let changed = pass.run_on_module(&mut m, &mut ctx, Some(&selected)).unwrap();
        assert!(changed);

        let keep_entry = m.function_by_name("keep").unwrap().entry_block().unwrap();
        let skip_entry = m.function_by_name("skip").unwrap().entry_block().unwrap();
        assert!(find_index_by_name(&keep_entry, "x").is_none());
        assert!(find_index_by_name(&skip_entry, "x").is_some());
    }
}
