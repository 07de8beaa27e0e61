//! Basic Blocks
//!
//! A maximal straight-line run of instructions ending in a terminator.
//! PHIs, when present, must form a contiguous prefix (§3 invariant),
//! which `push_instruction` enforces positionally rather than trusting
//! callers to order things correctly.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::instruction::{Instruction, Opcode};

#[derive(Clone)]
pub struct BasicBlock {
    data: Arc<RwLock<BasicBlockData>>,
}

struct BasicBlockData {
    name: String,
    instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(name: impl Into<String>) -> Self {
        BasicBlock {
            data: Arc::new(RwLock::new(BasicBlockData {
                name: name.into(),
                instructions: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> String {
        self.data.read().unwrap().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.data.write().unwrap().name = name.into();
    }

    /// Identity key stable across clones of this handle; two clones of
    /// the same block compare equal, two distinct blocks never do even
    /// if they currently share a name.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    pub fn instructions(&self) -> Vec<Instruction> {
        self.data.read().unwrap().instructions.clone()
    }

    pub fn instruction_count(&self) -> usize {
        self.data.read().unwrap().instructions.len()
    }

    pub fn is_empty_of_real_work(&self) -> bool {
        let data = self.data.read().unwrap();
        data.instructions
            .iter()
            .all(|i| i.is_phi() || i.is_terminator())
    }

    pub fn push_instruction(&self, inst: Instruction) {
        let mut data = self.data.write().unwrap();
        debug_assert!(
            !data.instructions.last().map(|i| i.is_terminator()).unwrap_or(false),
            "cannot append after a terminator"
        );
        data.instructions.push(inst);
    }

    pub fn terminator(&self) -> Option<Instruction> {
        let data = self.data.read().unwrap();
        data.instructions.iter().find(|i| i.is_terminator()).cloned()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator().is_some()
    }

    pub fn phis(&self) -> Vec<Instruction> {
        self.data
            .read()
            .unwrap()
            .instructions
            .iter()
            .take_while(|i| i.is_phi())
            .cloned()
            .collect()
    }

    /// Index of the first non-PHI instruction, i.e. where §4.3's BCF
    /// split and §4.2's PHI-demotion insertions both anchor.
    pub fn first_non_phi_index(&self) -> usize {
        self.data
            .read()
            .unwrap()
            .instructions
            .iter()
            .take_while(|i| i.is_phi())
            .count()
    }

    pub fn successors(&self) -> Vec<String> {
        self.terminator()
            .map(|t| t.successors())
            .unwrap_or_default()
    }

    /// Replace the whole instruction list. Every structural pass in this
    /// workspace snapshots what it needs before calling this, matching
    /// the teacher's `transform_instructions` convention.
    pub fn set_instructions(&self, instructions: Vec<Instruction>) {
        self.data.write().unwrap().instructions = instructions;
    }

    pub fn with_instructions<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<Instruction>) -> R,
    {
        let mut data = self.data.write().unwrap();
        f(&mut data.instructions)
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read().unwrap();
        writeln!(f, "{}:", data.name)?;
        for inst in &data.instructions {
            writeln!(f, "  {}", inst)?;
        }
        Ok(())
    }
}

impl fmt::Debug for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read().unwrap();
        write!(
            f,
            "BasicBlock({}, {} instructions)",
            data.name,
            data.instructions.len()
        )
    }
}

impl PartialEq for BasicBlock {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for BasicBlock {}
