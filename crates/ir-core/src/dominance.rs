//! Dominator Tree
//!
//! The iterative "engineer's algorithm" (Cooper, Harvey, Kennedy),
//! carried over from the teacher's analysis pass: compute blocks in
//! reverse-postorder, repeatedly intersect each block's processed
//! predecessors' immediate dominators, until the idom assignment reaches
//! a fixed point. Used by bogus control flow (§4.3) to find a safe
//! insertion point, and by alias access (§4.9) to confirm a replacement
//! block dominates every use it must still serve.

use rustc_hash::FxHashMap;

use crate::cfg::Cfg;

pub struct DominatorTree {
    idom: FxHashMap<String, String>,
    rpo_index: FxHashMap<String, usize>,
}

fn reverse_postorder(cfg: &Cfg) -> Vec<String> {
    let mut visited = std::collections::HashSet::new();
    let mut postorder = Vec::new();
    let mut stack = vec![(cfg.entry().to_string(), false)];
    while let Some((node, processed)) = stack.pop() {
        if processed {
            postorder.push(node);
            continue;
        }
        if !visited.insert(node.clone()) {
            continue;
        }
        stack.push((node.clone(), true));
        for succ in cfg.successors(&node) {
            if !visited.contains(succ) {
                stack.push((succ.clone(), false));
            }
        }
    }
    postorder.reverse();
    postorder
}

impl DominatorTree {
    pub fn build(cfg: &Cfg) -> Self {
        let rpo = reverse_postorder(cfg);
        let mut rpo_index = FxHashMap::default();
        for (i, name) in rpo.iter().enumerate() {
            rpo_index.insert(name.clone(), i);
        }

        let entry = cfg.entry().to_string();
        let mut idom: FxHashMap<String, String> = FxHashMap::default();
        idom.insert(entry.clone(), entry.clone());

        let mut changed = true;
        while changed {
            changed = false;
            for node in rpo.iter() {
                if *node == entry {
                    continue;
                }
                let preds: Vec<&String> = cfg
                    .predecessors(node)
                    .iter()
                    .filter(|p| idom.contains_key(*p))
                    .collect();
                let Some(first) = preds.first() else {
                    continue;
                };
                let mut new_idom = (*first).clone();
                for p in preds.iter().skip(1) {
                    new_idom = intersect(&rpo_index, &idom, &new_idom, p);
                }
                match idom.get(node) {
                    Some(existing) if *existing == new_idom => {}
                    _ => {
                        idom.insert(node.clone(), new_idom);
                        changed = true;
                    }
                }
            }
        }

        DominatorTree { idom, rpo_index }
    }

    pub fn immediate_dominator(&self, block: &str) -> Option<&str> {
        self.idom.get(block).map(|s| s.as_str())
    }

    pub fn dominates(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let mut cur = match self.idom.get(b) {
            Some(c) => c.clone(),
            None => return false,
        };
        loop {
            if cur == a {
                return true;
            }
            let next = match self.idom.get(&cur) {
                Some(n) => n.clone(),
                None => return false,
            };
            if next == cur {
                return false;
            }
            cur = next;
        }
    }

    pub fn is_reachable(&self, block: &str) -> bool {
        self.rpo_index.contains_key(block)
    }
}

fn intersect(
    rpo_index: &FxHashMap<String, usize>,
    idom: &FxHashMap<String, String>,
    a: &str,
    b: &str,
) -> String {
    let mut finger1 = a.to_string();
    let mut finger2 = b.to_string();
    while finger1 != finger2 {
        while rpo_index[&finger1] > rpo_index[&finger2] {
            finger1 = idom[&finger1].clone();
        }
        while rpo_index[&finger2] > rpo_index[&finger1] {
            finger2 = idom[&finger2].clone();
        }
    }
    finger1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_block::BasicBlock;
    use crate::function::Function;
    use crate::instruction::{InstKind, Instruction, Opcode};
    use crate::types::Type;
    use crate::value::Value;

    fn diamond() -> Function {
        let f = Function::new("f", Type::Void, vec![]);
        let entry = BasicBlock::new("entry");
        let left = BasicBlock::new("left");
        let right = BasicBlock::new("right");
        let join = BasicBlock::new("join");

        entry.push_instruction(
            Instruction::new(Opcode::CondBr, Type::Void, None, vec![Value::ConstInt(Type::i1(), 1)])
                .with_kind(InstKind::CondBr {
                    then_target: "left".into(),
                    else_target: "right".into(),
                }),
        );
        left.push_instruction(
            Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(InstKind::Br {
                target: "join".into(),
            }),
        );
        right.push_instruction(
            Instruction::new(Opcode::Br, Type::Void, None, vec![]).with_kind(InstKind::Br {
                target: "join".into(),
            }),
        );
        join.push_instruction(Instruction::new(Opcode::Ret, Type::Void, None, vec![]));

        f.append_block(entry);
        f.append_block(left);
        f.append_block(right);
        f.append_block(join);
        f
    }

    #[test]
    fn entry_dominates_everything() {
        let f = diamond();
        let cfg = Cfg::build(&f);
        let dom = DominatorTree::build(&cfg);
        assert!(dom.dominates("entry", "join"));
        assert!(dom.dominates("entry", "left"));
    }

    #[test]
    fn join_idom_is_entry_not_a_side() {
        let f = diamond();
        let cfg = Cfg::build(&f);
        let dom = DominatorTree::build(&cfg);
        assert_eq!(dom.immediate_dominator("join"), Some("entry"));
        assert!(!dom.dominates("left", "join"));
        assert!(!dom.dominates("right", "join"));
    }
}
