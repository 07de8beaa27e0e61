//! Modules and Global Variables

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::function::{Function, Linkage};
use crate::types::Type;
use crate::value::Value;

#[derive(Clone)]
pub struct GlobalVariable {
    data: Arc<RwLock<GlobalData>>,
}

struct GlobalData {
    name: String,
    ty: Type,
    linkage: Linkage,
    initializer: Option<Value>,
    /// `true` if the global may never be written through (a normal
    /// `constant`); global/string encryption flips this when it needs to
    /// prove the pointee is writable at decryption time.
    is_constant: bool,
}

impl GlobalVariable {
    pub fn new(name: impl Into<String>, ty: Type, linkage: Linkage) -> Self {
        GlobalVariable {
            data: Arc::new(RwLock::new(GlobalData {
                name: name.into(),
                ty,
                linkage,
                initializer: None,
                is_constant: true,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.data.read().unwrap().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.data.write().unwrap().name = name.into();
    }

    pub fn value_type(&self) -> Type {
        self.data.read().unwrap().ty.clone()
    }

    pub fn pointer_value(&self) -> Value {
        let data = self.data.read().unwrap();
        Value::Global(Type::ptr(data.ty.clone()), data.name.clone())
    }

    pub fn linkage(&self) -> Linkage {
        self.data.read().unwrap().linkage
    }

    pub fn set_linkage(&self, linkage: Linkage) {
        self.data.write().unwrap().linkage = linkage;
    }

    pub fn initializer(&self) -> Option<Value> {
        self.data.read().unwrap().initializer.clone()
    }

    pub fn set_initializer(&self, value: Value) {
        self.data.write().unwrap().initializer = Some(value);
    }

    pub fn is_constant(&self) -> bool {
        self.data.read().unwrap().is_constant
    }

    pub fn set_is_constant(&self, v: bool) {
        self.data.write().unwrap().is_constant = v;
    }
}

impl fmt::Display for GlobalVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read().unwrap();
        write!(f, "@{} = {} ", data.name, data.linkage)?;
        if data.is_constant {
            write!(f, "constant ")?;
        } else {
            write!(f, "global ")?;
        }
        write!(f, "{}", data.ty)?;
        if let Some(init) = &data.initializer {
            write!(f, " {}", init)?;
        }
        Ok(())
    }
}

impl PartialEq for GlobalVariable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
impl Eq for GlobalVariable {}

pub struct Module {
    target_triple: String,
    functions: Vec<Function>,
    globals: Vec<GlobalVariable>,
}

impl Module {
    pub fn new(target_triple: impl Into<String>) -> Self {
        Module {
            target_triple: target_triple.into(),
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn target_triple(&self) -> &str {
        &self.target_triple
    }

    pub fn set_target_triple(&mut self, triple: impl Into<String>) {
        self.target_triple = triple.into();
    }

    pub fn is_x86_target(&self) -> bool {
        let t = self.target_triple.to_ascii_lowercase();
        ["x86_64", "x86", "i386", "i686"]
            .iter()
            .any(|needle| t.contains(needle))
    }

    pub fn add_function(&mut self, f: Function) {
        self.functions.push(f);
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut Vec<Function> {
        &mut self.functions
    }

    pub fn function_by_name(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name() == name)
    }

    pub fn add_global(&mut self, g: GlobalVariable) {
        self.globals.push(g);
    }

    pub fn globals(&self) -> &[GlobalVariable] {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Vec<GlobalVariable> {
        &mut self.globals
    }

    pub fn global_by_name(&self, name: &str) -> Option<&GlobalVariable> {
        self.globals.iter().find(|g| g.name() == name)
    }

    pub fn remove_global(&mut self, name: &str) {
        self.globals.retain(|g| g.name() != name);
    }

    /// A plain-text rendering, used by the no-plaintext-leak test for
    /// global/string encryption and for debug logging.
    pub fn to_ir_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("target triple = \"{}\"\n\n", self.target_triple));
        for g in &self.globals {
            out.push_str(&g.to_string());
            out.push('\n');
        }
        out.push('\n');
        for f in &self.functions {
            out.push_str(&f.to_string());
            out.push('\n');
        }
        out
    }
}
