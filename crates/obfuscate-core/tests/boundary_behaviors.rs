//! Boundary behaviors each pass documents as a deliberate no-op.

use std::collections::HashSet;

use ir_core::{
    verification::verify_module, BasicBlock, CallingConv, Function, GlobalVariable, Instruction,
    Linkage, Module, Opcode, Type, Value,
};
use obfuscate_core::pass::{ForEachFunction, ModulePass, PassContext};
use obfuscate_core::passes::{
    AliasAccessPass, AntiDisassemblyPass, FlatteningPass, FunctionMergePass, GlobalEncryptionPass,
};

fn single_block_adder(name: &str) -> Function {
    let f = Function::new(name, Type::i32(), vec![Type::i32(), Type::i32()]);
    let bb = BasicBlock::new("entry");
    bb.push_instruction(Instruction::new(
        Opcode::Add,
        Type::i32(),
        Some("s".into()),
        vec![Value::Param(Type::i32(), 0), Value::Param(Type::i32(), 1)],
    ));
    bb.push_instruction(Instruction::new(
        Opcode::Ret,
        Type::Void,
        None,
        vec![Value::Inst(Type::i32(), "s".into())],
    ));
    f.append_block(bb);
    f
}

/// A two-block function so `FlatteningPass` actually has something to
/// flatten when it does run.
fn two_block_adder(name: &str) -> Function {
    let f = Function::new(name, Type::i32(), vec![Type::i32(), Type::i32()]);
    let entry = BasicBlock::new("entry");
    let exit = BasicBlock::new("exit");
    entry.push_instruction(
        Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(ir_core::InstKind::Br {
            target: "exit".into(),
        }),
    );
    exit.push_instruction(Instruction::new(
        Opcode::Add,
        Type::i32(),
        Some("s".into()),
        vec![Value::Param(Type::i32(), 0), Value::Param(Type::i32(), 1)],
    ));
    exit.push_instruction(Instruction::new(
        Opcode::Ret,
        Type::Void,
        None,
        vec![Value::Inst(Type::i32(), "s".into())],
    ));
    f.append_block(entry);
    f.append_block(exit);
    f
}

#[test]
fn single_block_function_is_unchanged_by_flattening() {
    let mut m = Module::new("x86_64-unknown-linux-gnu");
    m.add_function(single_block_adder("add"));
    let mut ctx = PassContext::new(1);
    let mut pass = ForEachFunction::new(FlatteningPass { encrypted_dispatch: true });
    let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
    assert!(!changed);
    assert_eq!(m.function_by_name("add").unwrap().block_count(), 1);
}

#[test]
fn function_with_no_allocas_is_unchanged_by_alias_access() {
    let mut m = Module::new("x86_64-unknown-linux-gnu");
    m.add_function(single_block_adder("add"));
    let mut ctx = PassContext::new(1);
    let mut pass = AliasAccessPass;
    let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
    assert!(!changed);
    assert!(m.function_by_name("__alias_get_0").is_none());
}

#[test]
fn non_x86_target_is_unchanged_by_anti_disassembly() {
    let mut m = Module::new("aarch64-apple-darwin");
    m.add_function(single_block_adder("add"));
    let mut ctx = PassContext::new(1);
    let mut pass = AntiDisassemblyPass { density: 0.3 };
    let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
    assert!(!changed);
    verify_module(&m).unwrap();
}

#[test]
fn single_mergeable_function_is_unchanged_by_function_merge() {
    let mut m = Module::new("x86_64-unknown-linux-gnu");
    m.add_function(single_block_adder("add"));
    let mut ctx = PassContext::new(1);
    let mut pass = FunctionMergePass { min_group_size: 2 };
    let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
    assert!(!changed);
    assert_eq!(m.functions().len(), 1);
}

#[test]
fn calling_convention_pool_never_assigns_default_c() {
    assert!(!CallingConv::RANDOM_POOL.contains(&CallingConv::C));
}

/// §8: an empty `selected_functions` set restricts a function-shaped
/// rewrite to nothing, but a module pass whose effect is inherently
/// global (global encryption's shared key and decrypt prologue) ignores
/// the restriction entirely and still runs.
#[test]
fn empty_selection_blocks_function_passes_but_not_module_wide_ones() {
    let mut m = Module::new("x86_64-unknown-linux-gnu");
    m.add_function(two_block_adder("add"));

    let arr_ty = Type::array(Type::i8(), 3);
    let g = GlobalVariable::new("msg", arr_ty.clone(), Linkage::Private);
    g.set_initializer(Value::ConstArray(
        arr_ty,
        vec![
            Value::ConstInt(Type::i8(), b'h' as i64),
            Value::ConstInt(Type::i8(), b'i' as i64),
            Value::ConstInt(Type::i8(), 0),
        ],
    ));
    m.add_global(g.clone());

    let empty: HashSet<String> = HashSet::new();
    let mut ctx = PassContext::new(1);

    let mut flatten = ForEachFunction::new(FlatteningPass { encrypted_dispatch: false });
    let flatten_changed = flatten.run_on_module(&mut m, &mut ctx, Some(&empty)).unwrap();
    assert!(!flatten_changed);
    assert_eq!(m.function_by_name("add").unwrap().block_count(), 2);

    let mut encrypt = GlobalEncryptionPass { encrypt_strings: true };
    let encrypt_changed = encrypt.run_on_module(&mut m, &mut ctx, Some(&empty)).unwrap();
    assert!(encrypt_changed);
    assert!(!g.is_constant());
    verify_module(&m).unwrap();
}
