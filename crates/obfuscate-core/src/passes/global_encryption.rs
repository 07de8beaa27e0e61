//! Global / String Encryption (§4.5)
//!
//! XOR-encrypts every eligible global's constant initializer with a
//! per-module 4-byte key, cycling the key across the initializer's
//! little-endian byte representation, then flips the global to
//! non-constant. Uses the "inline variant": a single decrypt-in-place
//! prologue is inserted at the top of the first defined function in the
//! module, so every encrypted global is decrypted exactly once at
//! program start rather than on every call into every function that
//! happens to reference it. `encrypt_strings = true` restricts the pass
//! to byte (`i8` element) arrays, the string/byte-blob case; `false`
//! also takes scalar integers and wider-integer-element arrays.

use std::collections::HashSet;

use ir_core::{Builder, GlobalVariable, Linkage, Module, Type, Value};
use rand::Rng;

use crate::pass::{ModulePass, Pass, PassContext, PassInfo, PassResult};

pub struct GlobalEncryptionPass {
    pub encrypt_strings: bool,
}

impl Pass for GlobalEncryptionPass {
    fn info(&self) -> PassInfo {
        PassInfo {
            name: "global_encryption",
            description: "[Pluto] XOR-encrypts qualifying global initializers and decrypts them once at program start",
            is_module_pass: true,
        }
    }
}

fn eligible_type(ty: &Type, encrypt_strings: bool) -> bool {
    if let Some(elem) = ty.array_element() {
        if !elem.is_integer() {
            return false;
        }
        if encrypt_strings {
            elem.bit_width() == Some(8)
        } else {
            true
        }
    } else if ty.is_integer() {
        !encrypt_strings
    } else {
        false
    }
}

fn name_excluded(name: &str) -> bool {
    name.starts_with("llvm.") || name.starts_with("__")
}

fn qualifies(g: &GlobalVariable, encrypt_strings: bool) -> bool {
    if name_excluded(&g.name()) {
        return false;
    }
    if !matches!(g.linkage(), Linkage::Internal | Linkage::Private | Linkage::LinkOnceOdr) {
        return false;
    }
    if g.initializer().is_none() {
        return false;
    }
    eligible_type(&g.value_type(), encrypt_strings)
}

/// XORs `value`'s low `bit_width` bits, taken as little-endian bytes,
/// against `key` cycling from `offset`. XOR is its own inverse so the
/// same function both encrypts and decrypts.
fn xor_bytes(value: i64, bit_width: u32, key: [u8; 4], offset: usize) -> i64 {
    let width_bytes = (bit_width as usize / 8).max(1);
    let mut bytes = value.to_le_bytes();
    for i in 0..width_bytes.min(8) {
        bytes[i] ^= key[(offset + i) % 4];
    }
    i64::from_le_bytes(bytes)
}

/// Encrypts `g`'s initializer in place (scalar int or int array), returns
/// the number of bytes consumed from the key's running cycle so the next
/// global's offset continues rather than restarting — matching "a 4-byte
/// key cycles over ... the initializer" read as the whole module's worth
/// of ciphertext rather than per-global.
fn encrypt_initializer(g: &GlobalVariable, key: [u8; 4], offset: &mut usize) {
    match g.initializer() {
        Some(Value::ConstArray(arr_ty, elems)) => {
            let elem_ty = arr_ty.array_element().cloned().unwrap_or(Type::i8());
            let width = elem_ty.bit_width().unwrap_or(8);
            let new_elems: Vec<Value> = elems
                .iter()
                .map(|v| {
                    let plain = v.as_const_int().unwrap_or(0);
                    let cipher = xor_bytes(plain, width, key, *offset);
                    *offset += (width as usize / 8).max(1);
                    Value::ConstInt(elem_ty.clone(), cipher)
                })
                .collect();
            g.set_initializer(Value::ConstArray(arr_ty, new_elems));
        }
        Some(Value::ConstInt(ty, plain)) => {
            let width = ty.bit_width().unwrap_or(32);
            let cipher = xor_bytes(plain, width, key, *offset);
            *offset += (width as usize / 8).max(1);
            g.set_initializer(Value::ConstInt(ty, cipher));
        }
        _ => {}
    }
    g.set_is_constant(false);
}

/// Emits the reverse of [`encrypt_initializer`] as IR: load, xor, store,
/// element by element (or once, for a scalar).
fn emit_decrypt(b: &mut Builder, g: &GlobalVariable, key: [u8; 4], offset: &mut usize) {
    let ty = g.value_type();
    if let Some(elem) = ty.array_element().cloned() {
        let len = ty.array_len().unwrap_or(0);
        let width = elem.bit_width().unwrap_or(8);
        let ptr = Value::Global(Type::ptr(ty.clone()), g.name());
        for i in 0..len {
            let elem_ptr = b.build_gep(ty.clone(), ptr.clone(), vec![0, i as i64], elem.clone());
            let loaded = b.build_load(elem.clone(), elem_ptr.clone());
            let k = xor_key_const(&elem, key, *offset);
            let decrypted = b.build_xor(loaded, k);
            b.build_store(decrypted, elem_ptr);
            *offset += (width as usize / 8).max(1);
        }
    } else {
        let width = ty.bit_width().unwrap_or(32);
        let ptr = Value::Global(Type::ptr(ty.clone()), g.name());
        let loaded = b.build_load(ty.clone(), ptr.clone());
        let k = xor_key_const(&ty, key, *offset);
        let decrypted = b.build_xor(loaded, k);
        b.build_store(decrypted, ptr);
        *offset += (width as usize / 8).max(1);
    }
}

/// Builds the constant operand for one decrypt XOR: the key bytes
/// relevant to this element's width and offset, packed into `ty`'s bit
/// width the same way [`xor_bytes`] unpacked them.
fn xor_key_const(ty: &Type, key: [u8; 4], offset: usize) -> Value {
    let width = ty.bit_width().unwrap_or(8) as usize;
    let width_bytes = (width / 8).max(1).min(8);
    let mut bytes = [0u8; 8];
    for i in 0..width_bytes {
        bytes[i] = key[(offset + i) % 4];
    }
    Value::ConstInt(ty.clone(), i64::from_le_bytes(bytes))
}

impl ModulePass for GlobalEncryptionPass {
    fn run_on_module(
        &mut self,
        module: &mut Module,
        ctx: &mut PassContext,
        _selected_functions: Option<&HashSet<String>>,
    ) -> PassResult<bool> {
        // Global/string encryption rewrites module-wide state, not a
        // single function's body, so it always runs over every
        // qualifying global regardless of a function-scoped selection.
        let Some(first_defined) = module.functions().iter().find(|f| !f.is_declaration()).cloned() else {
            return Ok(false);
        };

        let key: [u8; 4] = [
            ctx.rng.inner_mut().gen(),
            ctx.rng.inner_mut().gen(),
            ctx.rng.inner_mut().gen(),
            ctx.rng.inner_mut().gen(),
        ];

        let mut targets: Vec<GlobalVariable> = Vec::new();
        for g in module.globals_mut() {
            if qualifies(g, self.encrypt_strings) {
                targets.push(g.clone());
            }
        }
        if targets.is_empty() {
            return Ok(false);
        }

        let mut encrypt_offset = 0usize;
        for g in &targets {
            encrypt_initializer(g, key, &mut encrypt_offset);
            if g.linkage() == Linkage::LinkOnceOdr {
                g.set_linkage(Linkage::Internal);
            }
        }

        let entry = first_defined.entry_block().expect("defined function has an entry block");
        let insert_at = entry.first_non_phi_index();
        let mut b = Builder::new(&first_defined);
        b.position_before_index(entry, insert_at);

        let mut decrypt_offset = 0usize;
        for g in &targets {
            emit_decrypt(&mut b, g, key, &mut decrypt_offset);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_core::{verification::verify_module, BasicBlock, Function, Instruction, Opcode};

    fn module_with_main() -> (Module, Function) {
        let mut m = Module::new("x86_64-unknown-linux-gnu");
        let f = Function::new("main", Type::Void, vec![]);
        let bb = BasicBlock::new("entry");
        bb.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));
        f.append_block(bb);
        m.add_function(f.clone());
        (m, f)
    }

    #[test]
    fn encrypts_a_string_global_and_decrypts_once_in_first_function() {
        let (mut m, main) = module_with_main();
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

        let mut pass = GlobalEncryptionPass { encrypt_strings: true };
        let mut ctx = PassContext::new(5);
        let changed = pass.run_on_module(&mut m, &mut ctx, None).unwrap();
        assert!(changed);
        assert!(!g.is_constant());
        verify_module(&m).unwrap();

        let Some(Value::ConstArray(_, elems)) = g.initializer() else {
            panic!("expected an array initializer");
        };
        let bytes: Vec<i64> = elems.iter().map(|v| v.as_const_int().unwrap()).collect();
        assert_ne!(bytes, vec![b'h' as i64, b'i' as i64, 0]);

        let entry = main.entry_block().unwrap();
        let loads = entry.instructions().into_iter().filter(|i| i.opcode == Opcode::Load).count();
        assert_eq!(loads, 3, "one decrypt load per byte, inserted exactly once");
    }

    #[test]
    fn wide_integer_array_keeps_its_element_type() {
        let (mut m, _main) = module_with_main();
        let arr_ty = Type::array(Type::i32(), 2);
        let g = GlobalVariable::new("table", arr_ty.clone(), Linkage::Internal);
        g.set_initializer(Value::ConstArray(
            arr_ty,
            vec![Value::ConstInt(Type::i32(), 10), Value::ConstInt(Type::i32(), 20)],
        ));
        m.add_global(g.clone());

        let mut pass = GlobalEncryptionPass { encrypt_strings: false };
        let mut ctx = PassContext::new(3);
        assert!(pass.run_on_module(&mut m, &mut ctx, None).unwrap());
        verify_module(&m).unwrap();

        let Some(Value::ConstArray(elem_ty, elems)) = g.initializer() else {
            panic!("expected an array initializer");
        };
        assert_eq!(elem_ty.array_element().unwrap().bit_width(), Some(32));
        for v in &elems {
            assert!(matches!(v, Value::ConstInt(ty, _) if ty.bit_width() == Some(32)));
        }
    }

    #[test]
    fn string_mode_skips_wider_integer_arrays() {
        let (mut m, _main) = module_with_main();
        let arr_ty = Type::array(Type::i32(), 2);
        let g = GlobalVariable::new("table", arr_ty.clone(), Linkage::Internal);
        g.set_initializer(Value::ConstArray(
            arr_ty,
            vec![Value::ConstInt(Type::i32(), 10), Value::ConstInt(Type::i32(), 20)],
        ));
        m.add_global(g.clone());

        let mut pass = GlobalEncryptionPass { encrypt_strings: true };
        let mut ctx = PassContext::new(3);
        assert!(!pass.run_on_module(&mut m, &mut ctx, None).unwrap());
        assert!(g.is_constant());
    }

    #[test]
    fn external_linkage_globals_are_ineligible() {
        let (mut m, _main) = module_with_main();
        let g = GlobalVariable::new("exported", Type::i32(), Linkage::External);
        g.set_initializer(Value::ConstInt(Type::i32(), 7));
        m.add_global(g.clone());

        let mut pass = GlobalEncryptionPass { encrypt_strings: false };
        let mut ctx = PassContext::new(5);
        assert!(!pass.run_on_module(&mut m, &mut ctx, None).unwrap());
    }

    #[test]
    fn dunder_and_intrinsic_names_are_excluded() {
        let (mut m, _main) = module_with_main();
        let g1 = GlobalVariable::new("__private_state", Type::i32(), Linkage::Internal);
        g1.set_initializer(Value::ConstInt(Type::i32(), 1));
        m.add_global(g1.clone());
        let g2 = GlobalVariable::new("llvm.metadata", Type::i32(), Linkage::Internal);
        g2.set_initializer(Value::ConstInt(Type::i32(), 1));
        m.add_global(g2.clone());

        let mut pass = GlobalEncryptionPass { encrypt_strings: false };
        let mut ctx = PassContext::new(5);
        assert!(!pass.run_on_module(&mut m, &mut ctx, None).unwrap());
        assert!(g1.is_constant());
        assert!(g2.is_constant());
    }

    #[test]
    fn linkonce_odr_is_demoted_to_internal_after_encryption() {
        let (mut m, _main) = module_with_main();
        let g = GlobalVariable::new("shared_const", Type::i32(), Linkage::LinkOnceOdr);
        g.set_initializer(Value::ConstInt(Type::i32(), 42));
        m.add_global(g.clone());

        let mut pass = GlobalEncryptionPass { encrypt_strings: false };
        let mut ctx = PassContext::new(5);
        assert!(pass.run_on_module(&mut m, &mut ctx, None).unwrap());
        assert_eq!(g.linkage(), Linkage::Internal);
    }

    #[test]
    fn non_array_non_integer_globals_are_untouched() {
        let (mut m, _main) = module_with_main();
        let g = GlobalVariable::new("flag", Type::ptr(Type::i8()), Linkage::Internal);
        m.add_global(g);
        let mut pass = GlobalEncryptionPass { encrypt_strings: true };
        let mut ctx = PassContext::new(5);
        assert!(!pass.run_on_module(&mut m, &mut ctx, None).unwrap());
    }
}
