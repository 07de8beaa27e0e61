//! Linear Mixed Boolean-Arithmetic coefficient search (§4.7)
//!
//! Real obfuscators hand this to an SMT solver: find integer
//! coefficients for a basis of bitwise terms that reproduce a target
//! two's-complement operation everywhere. No SMT crate has precedent in
//! this workspace, so this module does the same job by brute force over
//! a 1-bit truth table: a coefficient vector that reproduces `a + b` at
//! all four bit combinations of `(a, b)` reproduces it at every integer
//! width too, because AND/OR/XOR are evaluated bit-by-bit and the
//! arithmetic carry is exactly what the `2×(a & b)` term encodes.

use rand::seq::SliceRandom;
use rand::Rng;

use ir_core::Opcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasisTerm {
    One,
    A,
    B,
    AAndB,
    AOrB,
    AXorB,
    NotAAndB,
    AAndNotB,
}

impl BasisTerm {
    const ALL: [BasisTerm; 8] = [
        BasisTerm::One,
        BasisTerm::A,
        BasisTerm::B,
        BasisTerm::AAndB,
        BasisTerm::AOrB,
        BasisTerm::AXorB,
        BasisTerm::NotAAndB,
        BasisTerm::AAndNotB,
    ];

    /// Value of this basis term for 1-bit `a`, `b` (each 0 or 1).
    fn eval(self, a: i64, b: i64) -> i64 {
        match self {
            BasisTerm::One => 1,
            BasisTerm::A => a,
            BasisTerm::B => b,
            BasisTerm::AAndB => a & b,
            BasisTerm::AOrB => a | b,
            BasisTerm::AXorB => a ^ b,
            BasisTerm::NotAAndB => (1 - a) & b,
            BasisTerm::AAndNotB => a & (1 - b),
        }
    }
}

fn truth_table_4(f: impl Fn(i64, i64) -> i64) -> [i64; 4] {
    [f(0, 0), f(0, 1), f(1, 0), f(1, 1)]
}

/// The four-row truth table for the arithmetic operation `opcode` computes
/// on single bits, or `None` if this module has no target table for it.
fn target_truth_table(opcode: Opcode) -> Option<[i64; 4]> {
    match opcode {
        Opcode::Add => Some(truth_table_4(|a, b| a + b)),
        Opcode::Sub => Some(truth_table_4(|a, b| a - b)),
        Opcode::And => Some(truth_table_4(|a, b| a & b)),
        Opcode::Or => Some(truth_table_4(|a, b| a | b)),
        Opcode::Xor => Some(truth_table_4(|a, b| a ^ b)),
        _ => None,
    }
}

/// One term of a found linear combination: `coefficient * term`.
pub type Solution = Vec<(i64, BasisTerm)>;

/// Searches subsets of up to `max_terms` basis functions, in an order
/// shuffled by `rng` so repeated calls don't always return the same
/// subset, for integer coefficients in `[-max_coeff, max_coeff]` whose
/// linear combination reproduces `opcode`'s truth table exactly.
pub fn search(opcode: Opcode, max_terms: usize, max_coeff: i64, rng: &mut impl Rng) -> Option<Solution> {
    let target = target_truth_table(opcode)?;
    let max_terms = max_terms.clamp(1, BasisTerm::ALL.len());

    let mut subsets = subsets_up_to(max_terms);
    subsets.shuffle(rng);

    for subset in subsets {
        if let Some(coeffs) = solve_subset(&subset, &target, max_coeff) {
            let solution: Solution = subset
                .into_iter()
                .zip(coeffs)
                .filter(|(_, c)| *c != 0)
                .map(|(term, c)| (c, term))
                .collect();
            if !solution.is_empty() {
                return Some(solution);
            }
        }
    }
    None
}

fn subsets_up_to(max_terms: usize) -> Vec<Vec<BasisTerm>> {
    let mut out = Vec::new();
    let all = BasisTerm::ALL;
    let n = all.len();
    for mask in 1u32..(1 << n) {
        let subset: Vec<BasisTerm> = (0..n).filter(|i| mask & (1 << i) != 0).map(|i| all[i]).collect();
        if subset.len() <= max_terms {
            out.push(subset);
        }
    }
    out
}

/// Brute-forces every coefficient assignment in `[-max_coeff, max_coeff]`
/// for `subset`, returning the first assignment whose combination
/// matches `target` at every row.
fn solve_subset(subset: &[BasisTerm], target: &[i64; 4], max_coeff: i64) -> Option<Vec<i64>> {
    let rows: Vec<[i64; 4]> = subset
        .iter()
        .map(|t| truth_table_4(|a, b| t.eval(a, b)))
        .collect();
    let mut coeffs = vec![-max_coeff; subset.len()];
    loop {
        if matches(&rows, &coeffs, target) {
            return Some(coeffs);
        }
        if !advance(&mut coeffs, max_coeff) {
            return None;
        }
    }
}

fn matches(rows: &[[i64; 4]], coeffs: &[i64], target: &[i64; 4]) -> bool {
    for row_idx in 0..4 {
        let sum: i64 = rows.iter().zip(coeffs).map(|(r, c)| r[row_idx] * c).sum();
        if sum != target[row_idx] {
            return false;
        }
    }
    true
}

fn advance(coeffs: &mut [i64], max_coeff: i64) -> bool {
    for c in coeffs.iter_mut() {
        if *c < max_coeff {
            *c += 1;
            return true;
        }
        *c = -max_coeff;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn finds_a_solution_for_add() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let sol = search(Opcode::Add, 3, 4, &mut rng).expect("add is solvable");
        let rows: Vec<[i64; 4]> = sol
            .iter()
            .map(|(_, t)| truth_table_4(|a, b| t.eval(a, b)))
            .collect();
        let target = target_truth_table(Opcode::Add).unwrap();
        for row_idx in 0..4 {
            let sum: i64 = rows
                .iter()
                .zip(sol.iter())
                .map(|(r, (c, _))| r[row_idx] * c)
                .sum();
            assert_eq!(sum, target[row_idx]);
        }
    }

    #[test]
    fn different_seeds_can_choose_different_bases() {
        let mut r1 = ChaCha8Rng::seed_from_u64(1);
        let mut r2 = ChaCha8Rng::seed_from_u64(2);
        let s1 = search(Opcode::Xor, 3, 4, &mut r1).unwrap();
        let s2 = search(Opcode::Xor, 3, 4, &mut r2).unwrap();
        // Not asserting inequality (small search space can coincide), just
        // that both are independently valid solutions.
        assert!(!s1.is_empty());
        assert!(!s2.is_empty());
    }

    #[test]
    fn non_target_opcode_returns_none() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(search(Opcode::Shl, 3, 4, &mut rng).is_none());
    }
}
