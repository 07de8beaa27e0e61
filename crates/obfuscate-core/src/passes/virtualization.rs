//! Virtualization (§4.12)
//!
//! For each named target function: lower its body to bytecode through
//! `vm::compiler`, stash the words in a private global, make sure the
//! shared `__vm_interpret` exists in the module, then replace the
//! function's real body with one that marshals its arguments into a
//! register-file-shaped array and calls through to the interpreter.
//! The result is opaque to static analysis — the "real" logic is data,
//! not code, until something actually runs the bytecode.

use std::collections::HashSet;

use ir_core::{
    BasicBlock, Builder, CallTarget, CallingConv, Function, Instruction, Module, Opcode, Type,
    Value,
};

use crate::pass::{ModulePass, Pass, PassContext, PassInfo, PassResult};
use crate::rewrite::replace_value_in_function;
use crate::vm::compiler::{compile_function, BytecodeProgram};
use crate::vm::interpreter::{ensure_interpreter, host_fn_type, INTERPRETER_NAME};

pub struct VirtualizePass {
    pub functions: Vec<String>,
}

impl Pass for VirtualizePass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "virtualization",
            description: "[VMwhere] compiles a function to bytecode and replaces its body with a call into the embedded interpreter",
            is_module_pass: true,
        }
    }
}

fn widen_to_i64(b: &mut Builder, value: Value, ty: &Type) -> Value {
    if ty.is_pointer() {
        b.build_ptrtoint(value, Type::i64())
    } else if ty.bit_width() == Some(64) {
        value
    } else {
        b.build_zext(value, Type::i64())
    }
}

fn narrow_from_i64(b: &mut Builder, value: Value, ty: &Type) -> Value {
    if ty.is_pointer() {
        b.build_inttoptr(value, ty.clone())
    } else if ty.bit_width() == Some(64) {
        value
    } else {
        b.build_trunc(value, ty.clone())
    }
}

fn bytecode_global_name(f: &Function) -> String {
    format!("{}.bytecode", f.name())
}

/// Erases `f`'s body (replacing every result with `undef` so no stale use
/// survives) and replaces it with args/global-ref/host-table marshaling
/// plus a call through to `__vm_interpret`, per §4.12.4.
fn replace_body(module: &Module, f: &Function, program: &BytecodeProgram, bc_global: &str) {
    let blocks = f.blocks();
    for block in &blocks {
        for inst in block.instructions() {
            if let Some(name) = &inst.name {
                let old = Value::Inst(inst.ty.clone(), name.clone());
                let undef = Value::Undef(inst.ty.clone());
                replace_value_in_function(f, &old, &undef);
            }
        }
    }
    for block in blocks.iter().skip(1) {
        block.set_instructions(vec![Instruction::new(
            Opcode::Unreachable,
            Type::Void,
            None,
            vec![],
        )]);
    }
    let entry = blocks[0].clone();
    entry.set_instructions(vec![]);

    let mut b = Builder::new(f);
    b.position_at_end(entry);

    let param_types = f.param_types();
    let n_params = param_types.len();
    let args_arr_ty = Type::array(Type::i64(), 8);
    let args_alloc = b.build_alloca(args_arr_ty.clone());
    for (i, ty) in param_types.iter().enumerate() {
        let raw = widen_to_i64(&mut b, Value::Param(ty.clone(), i), ty);
        let slot = b.build_gep(args_arr_ty.clone(), args_alloc.clone(), vec![0, i as i64], Type::i64());
        b.build_store(raw, slot);
    }

    let n_globals = program.global_ref_names.len().max(1);
    let globals_tbl_ty = Type::array(Type::i64(), n_globals);
    let globals_tbl = b.build_alloca(globals_tbl_ty.clone());
    for (i, gname) in program.global_ref_names.iter().enumerate() {
        let g_ty = module
            .global_by_name(gname)
            .map(|g| g.value_type())
            .unwrap_or(Type::i8());
        let addr = Value::Global(Type::ptr(g_ty), gname.clone());
        let addr_int = b.build_ptrtoint(addr, Type::i64());
        let slot = b.build_gep(globals_tbl_ty.clone(), globals_tbl.clone(), vec![0, i as i64], Type::i64());
        b.build_store(addr_int, slot);
    }
    let tbl_base = b.build_ptrtoint(globals_tbl, Type::i64());
    let base_slot = b.build_gep(args_arr_ty.clone(), args_alloc.clone(), vec![0, n_params as i64], Type::i64());
    b.build_store(tbl_base, base_slot);

    let ret_slot = b.build_alloca(Type::i64());

    let host_fn_ptr_ty = Type::ptr(host_fn_type());
    let n_hosts = program.host_function_names.len().max(1);
    let hosts_tbl_ty = Type::array(host_fn_ptr_ty.clone(), n_hosts);
    let hosts_tbl = b.build_alloca(hosts_tbl_ty.clone());
    for (i, hname) in program.host_function_names.iter().enumerate() {
        let (ret_ty, param_tys, var_arg) = module
            .function_by_name(hname)
            .map(|hf| (hf.return_type(), hf.param_types(), hf.is_var_arg()))
            .unwrap_or_else(|| (Type::i64(), vec![Type::i64(); 6], false));
        let actual_fn_ptr_ty = Type::ptr(Type::function(ret_ty, param_tys, var_arg));
        let fn_ref = Value::FunctionRef(actual_fn_ptr_ty, hname.clone());
        let cast = b.build_bitcast(fn_ref, host_fn_ptr_ty.clone());
        let slot = b.build_gep(hosts_tbl_ty.clone(), hosts_tbl.clone(), vec![0, i as i64], host_fn_ptr_ty.clone());
        b.build_store(cast, slot);
    }
    let hosts_base = b.build_gep(hosts_tbl_ty, hosts_tbl, vec![0, 0], host_fn_ptr_ty);

    let bc_arr_ty = Type::array(Type::i8(), program.words.len() * 4);
    let bc_global = Value::Global(Type::ptr(bc_arr_ty.clone()), bc_global.to_string());
    let bc_ptr = b.build_gep(bc_arr_ty, bc_global, vec![0, 0], Type::i8());
    let bc_len = Value::ConstInt(Type::i64(), (program.words.len() * 4) as i64);

    b.build_call(
        Type::Void,
        CallTarget::Direct(INTERPRETER_NAME.to_string()),
        CallingConv::C,
        vec![bc_ptr, bc_len, args_alloc, ret_slot.clone(), hosts_base],
        false,
    );

    let ret_ty = f.return_type();
    if ret_ty.is_void() {
        b.build_ret_void();
    } else {
        let raw = b.build_load(Type::i64(), ret_slot);
        let result = narrow_from_i64(&mut b, raw, &ret_ty);
        b.build_ret(result);
    }
}

impl ModulePass for VirtualizePass {
    fn run_on_module(
        &mut self,
        module: &mut Module,
        _ctx: &mut PassContext,
        _selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool> {
        let mut changed = false;

        for name in &self.functions {
            let Some(f) = module.function_by_name(name).cloned() else {
                continue;
            };
            if f.is_declaration() {
                continue;
            }

            let program = compile_function(&f)?;
            let bytes: Vec<u8> = program.words.iter().flat_map(|w| w.to_le_bytes()).collect();
            let bc_name = bytecode_global_name(&f);
            let arr_ty = Type::array(Type::i8(), bytes.len());
            let g = ir_core::GlobalVariable::new(bc_name.clone(), arr_ty.clone(), ir_core::Linkage::Private);
            g.set_initializer(Value::ConstArray(
                arr_ty,
                bytes.iter().map(|byte| Value::ConstInt(Type::i8(), *byte as i64)).collect(),
            ));
            module.add_global(g);

            ensure_interpreter(module);
            replace_body(module, &f, &program, &bc_name);
            changed = true;
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_module, BasicBlock as Bb, Instruction as Inst, Opcode as Op};

    fn make_adder(name: &str) -> Function {
        let f = Function::new(name, Type::i32(), vec![Type::i32(), Type::i32()]);
        let bb = Bb::new("entry");
        bb.push_instruction(Inst::new(
            Op::Add,
            Type::i32(),
            Some("s".into()),
            vec![Value::Param(Type::i32(), 0), Value::Param(Type::i32(), 1)],
        ));
        bb.push_instruction(Inst::new(
            Op::Ret,
            Type::Void,
            None,
            vec![Value::Inst(Type::i32(), "s".into())],
        ));
        f.append_block(bb);
        f
    }

    #[test]
    fn virtualizes_a_simple_function() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        m.add_function(make_adder("add"));

        let mut pass = VirtualizePass {
            functions: vec!["add".to_string()],
        };
        let mut ctx = PassContext::new(9);
        let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
        assert!(changed);
        verify_module(&m).unwrap();

        assert!(m.function_by_name(INTERPRETER_NAME).is_some());
        assert!(m.global_by_name("add.bytecode").is_some());
        let add = m.function_by_name("add").unwrap();
        assert!(add.blocks().iter().any(|b| {
            b.instructions().iter().any(|i| {
                matches!(&i.kind, ir_core::InstKind::Call { callee: CallTarget::Direct(n), .. } if n == INTERPRETER_NAME)
            })
        }));
    }

    #[test]
    fn unknown_function_names_are_skipped() {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        let mut pass = VirtualizePass {
            functions: vec!["missing".to_string()],
        };
        let mut ctx = PassContext::new(9);
        assert!(!pass.run_on_module(&mut m, &mut ctx, None).unwrap());
    }
}
