//! Functions

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::basic_block::BasicBlock;
use crate::instruction::CallingConv;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Internal,
    Private,
    External,
    LinkOnceOdr,
}

impl Linkage {
    pub fn is_module_local(self) -> bool {
        matches!(
            self,
            Linkage::Internal | Linkage::Private | Linkage::LinkOnceOdr
        )
    }
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Linkage::Internal => "internal",
            Linkage::Private => "private",
            Linkage::External => "external",
            Linkage::LinkOnceOdr => "linkonce_odr",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone)]
pub struct Function {
    data: Arc<RwLock<FunctionData>>,
}

struct FunctionData {
    name: String,
    return_ty: Type,
    param_types: Vec<Type>,
    is_var_arg: bool,
    linkage: Linkage,
    calling_conv: CallingConv,
    attributes: HashSet<String>,
    blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn new(name: impl Into<String>, return_ty: Type, param_types: Vec<Type>) -> Self {
        Function {
            data: Arc::new(RwLock::new(FunctionData {
                name: name.into(),
                return_ty,
                param_types,
                is_var_arg: false,
                linkage: Linkage::External,
                calling_conv: CallingConv::C,
                attributes: HashSet::new(),
                blocks: Vec::new(),
            })),
        }
    }

    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    pub fn name(&self) -> String {
        self.data.read().unwrap().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.data.write().unwrap().name = name.into();
    }

    pub fn return_type(&self) -> Type {
        self.data.read().unwrap().return_ty.clone()
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.data.read().unwrap().param_types.clone()
    }

    pub fn set_param_types(&self, types: Vec<Type>) {
        self.data.write().unwrap().param_types = types;
    }

    pub fn is_var_arg(&self) -> bool {
        self.data.read().unwrap().is_var_arg
    }

    pub fn set_is_var_arg(&self, v: bool) {
        self.data.write().unwrap().is_var_arg = v;
    }

    pub fn function_type(&self) -> Type {
        let data = self.data.read().unwrap();
        Type::function(data.return_ty.clone(), data.param_types.clone(), data.is_var_arg)
    }

    pub fn linkage(&self) -> Linkage {
        self.data.read().unwrap().linkage
    }

    pub fn set_linkage(&self, linkage: Linkage) {
        self.data.write().unwrap().linkage = linkage;
    }

    pub fn calling_conv(&self) -> CallingConv {
        self.data.read().unwrap().calling_conv
    }

    pub fn set_calling_conv(&self, cc: CallingConv) {
        self.data.write().unwrap().calling_conv = cc;
    }

    pub fn add_attribute(&self, attr: impl Into<String>) {
        self.data.write().unwrap().attributes.insert(attr.into());
    }

    pub fn has_attribute(&self, attr: &str) -> bool {
        self.data.read().unwrap().attributes.contains(attr)
    }

    pub fn attributes(&self) -> HashSet<String> {
        self.data.read().unwrap().attributes.clone()
    }

    pub fn blocks(&self) -> Vec<BasicBlock> {
        self.data.read().unwrap().blocks.clone()
    }

    pub fn block_count(&self) -> usize {
        self.data.read().unwrap().blocks.len()
    }

    pub fn is_declaration(&self) -> bool {
        self.data.read().unwrap().blocks.is_empty()
    }

    pub fn entry_block(&self) -> Option<BasicBlock> {
        self.data.read().unwrap().blocks.first().cloned()
    }

    pub fn append_block(&self, block: BasicBlock) {
        self.data.write().unwrap().blocks.push(block);
    }

    pub fn block_by_name(&self, name: &str) -> Option<BasicBlock> {
        self.data
            .read()
            .unwrap()
            .blocks
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    /// Replace the function's block list, preserving order as every
    /// structural pass (flattening, BCF, merge) builds its replacement
    /// list explicitly rather than mutating in place.
    pub fn set_blocks(&self, blocks: Vec<BasicBlock>) {
        self.data.write().unwrap().blocks = blocks;
    }

    /// A fresh block name guaranteed unique within this function, used by
    /// every pass that synthesizes new blocks (dispatcher, clone, bogus).
    pub fn fresh_block_name(&self, prefix: &str) -> String {
        let data = self.data.read().unwrap();
        let mut n = 0usize;
        loop {
            let candidate = format!("{}.{}", prefix, n);
            if !data.blocks.iter().any(|b| b.name() == candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// A fresh SSA result name guaranteed unique within this function.
    pub fn fresh_value_name(&self, prefix: &str) -> String {
        let data = self.data.read().unwrap();
        let mut n = 0usize;
        loop {
            let candidate = format!("{}.{}", prefix, n);
            let taken = data.blocks.iter().any(|b| {
                b.instructions()
                    .iter()
                    .any(|i| i.name.as_deref() == Some(candidate.as_str()))
            });
            if !taken {
                return candidate;
            }
            n += 1;
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read().unwrap();
        write!(f, "define {} {} @{}(", data.linkage, data.return_ty, data.name)?;
        for (i, ty) in data.param_types.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} %arg{}", ty, i)?;
        }
        writeln!(f, ") {{")?;
        for bb in &data.blocks {
            write!(f, "{}", bb)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read().unwrap();
        write!(f, "Function(@{}, {} blocks)", data.name, data.blocks.len())
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for Function {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_has_no_blocks() {
        let f = Function::new("foo", Type::i32(), vec![]);
        assert!(f.is_declaration());
    }

    #[test]
    fn fresh_names_avoid_collisions() {
        let f = Function::new("foo", Type::Void, vec![]);
        f.append_block(BasicBlock::new("bb.0"));
        assert_eq!(f.fresh_block_name("bb"), "bb.1");
    }
}
