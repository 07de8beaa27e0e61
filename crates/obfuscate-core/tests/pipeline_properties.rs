//! Universal properties the pipeline must hold for any run: verifiable
//! output, determinism under a fixed seed, no leaked plaintext after
//! global encryption, and calling-convention agreement at every direct
//! call site.

use ir_core::{
    verification::verify_module, BasicBlock, CallTarget, Function, GlobalVariable, InstKind,
    Instruction, Linkage, Module, Opcode, Type, Value,
};
use obfuscate_core::config::{ObfuscationConfig, PassSpec};
use obfuscate_core::pipeline::run_pipeline;

fn adder() -> Function {
    let f = Function::new("add", Type::i32(), vec![Type::i32(), Type::i32()]);
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

fn caller_of(callee: &str) -> Function {
    let f = Function::new("caller", Type::i32(), vec![Type::i32(), Type::i32()]);
    let bb = BasicBlock::new("entry");
    bb.push_instruction(
        Instruction::new(
            Opcode::Call,
            Type::i32(),
            Some("r".into()),
            vec![Value::Param(Type::i32(), 0), Value::Param(Type::i32(), 1)],
        )
        .with_kind(InstKind::Call {
            callee: CallTarget::Direct(callee.to_string()),
            cc: ir_core::CallingConv::C,
        }),
    );
    bb.push_instruction(Instruction::new(
        Opcode::Ret,
        Type::Void,
        None,
        vec![Value::Inst(Type::i32(), "r".into())],
    ));
    f.append_block(bb);
    f
}

fn sample_module() -> Module {
    let mut m = Module::new("x86_64-unknown-linux-gnu");
    m.add_function(adder());
    m.add_function(caller_of("add"));
    m
}

#[test]
fn same_seed_same_module_produces_identical_ir_text() {
    let config = ObfuscationConfig::new(42)
        .with_pass(PassSpec::ArithmeticSubstitution { iterations: 3 })
        .with_pass(PassSpec::BogusControlFlow { probability: 0.4 })
        .with_pass(PassSpec::CallingConvention);

    let mut a = sample_module();
    run_pipeline(&mut a, &config).unwrap();

    let mut b = sample_module();
    run_pipeline(&mut b, &config).unwrap();

    assert_eq!(a.to_ir_string(), b.to_ir_string());
}

#[test]
fn calling_convention_pass_keeps_call_site_and_callee_in_sync() {
    let mut m = sample_module();
    let config = ObfuscationConfig::new(7).with_pass(PassSpec::CallingConvention);
    run_pipeline(&mut m, &config).unwrap();

    let add = m.function_by_name("add").unwrap();
    let caller = m.function_by_name("caller").unwrap();
    let call_cc = caller
        .blocks()
        .iter()
        .flat_map(|b| b.instructions())
        .find_map(|inst| match &inst.kind {
            InstKind::Call { callee: CallTarget::Direct(name), cc } if name == "add" => Some(*cc),
            _ => None,
        })
        .expect("caller has a direct call to add");

    assert_eq!(call_cc, add.calling_conv());
}

#[test]
fn global_encryption_removes_plaintext_from_ir_text() {
    let mut m = sample_module();
    let plaintext = "Serial accepted";
    let bytes: Vec<Value> = plaintext
        .bytes()
        .map(|b| Value::ConstInt(Type::i8(), b as i64))
        .collect();
    let arr_ty = Type::array(Type::i8(), bytes.len());
    let g = GlobalVariable::new("msg", arr_ty.clone(), Linkage::Private);
    g.set_initializer(Value::ConstArray(arr_ty, bytes));
    m.add_global(g);

    let config = ObfuscationConfig::new(5).with_pass(PassSpec::GlobalEncryption { encrypt_strings: true });
    run_pipeline(&mut m, &config).unwrap();

    let text = m.to_ir_string();
    assert!(!text.contains(plaintext));
}

#[test]
fn full_named_pass_sequence_stays_verifiable() {
    let mut m = sample_module();
    let config = ObfuscationConfig::new(99)
        .with_pass(PassSpec::ArithmeticSubstitution { iterations: 2 })
        .with_pass(PassSpec::MbaObfuscation { max_terms: 4 })
        .with_pass(PassSpec::BogusControlFlow { probability: 0.3 })
        .with_pass(PassSpec::Flattening { encrypted_dispatch: true })
        .with_pass(PassSpec::AliasAccess)
        .with_pass(PassSpec::IndirectBranch)
        .with_pass(PassSpec::IndirectCall)
        .with_pass(PassSpec::CallingConvention);

    let report = run_pipeline(&mut m, &config).unwrap();
    assert_eq!(report.applied.len(), 8);
    verify_module(&m).unwrap();
}

#[test]
fn virtualizing_a_function_leaves_the_module_verifiable_and_callable() {
    let mut m = sample_module();
    let config = ObfuscationConfig::new(13).with_pass(PassSpec::Virtualize {
        functions: vec!["add".to_string()],
    });
    run_pipeline(&mut m, &config).unwrap();

    assert!(m.function_by_name("__vm_interpret").is_some());
    assert!(m.global_by_name("add.bytecode").is_some());

    let caller = m.function_by_name("caller").unwrap();
    let still_calls_add = caller
        .blocks()
        .iter()
        .flat_map(|b| b.instructions())
        .any(|inst| matches!(&inst.kind, InstKind::Call { callee: CallTarget::Direct(n), .. } if n == "add"));
    assert!(still_calls_add, "virtualizing add must not touch its callers' call sites");
}
