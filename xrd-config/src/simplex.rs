//! Load balancing of users across assignment templates.
//!
//! Given templates `T_0..T_t` over groups `g`, solve
//!
//! ```text
//! maximize  M
//! subject to  Σ_a x_a · [g ∈ T_a] ≥ M   for every group g
//!             Σ_a x_a = 1
//!             x_a ≥ 0
//! ```
//!
//! with `x_a` the fraction of users assigned to template `a` and `M` the
//! minimum per-group load. The problem has `O(√G)` variables and `G`
//! constraints, well within reach of a dense two-phase simplex.

use std::collections::HashMap;

use crate::Group;

const EPS: f64 = 1e-9;
const MAX_ITER: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SimplexError {
    #[error("linear program is infeasible")]
    Infeasible,
    #[error("linear program is unbounded")]
    Unbounded,
    #[error("simplex iteration limit reached")]
    IterationLimit,
}

/// Fraction of users per template and the attained minimum per-group load.
/// Callers derive the per-group cap as `⌈M · N⌉ + 1` for `N` users.
pub fn optimal_division(
    groups: &HashMap<String, Group>,
    templates: &[Vec<String>],
) -> Result<(Vec<f64>, f64), SimplexError> {
    let t = templates.len();
    let mut glist: Vec<&String> = groups.keys().collect();
    glist.sort();

    // variables: [M, x_0, .., x_{t-1}]
    let objective: Vec<f64> = std::iter::once(1.0).chain(std::iter::repeat(0.0).take(t)).collect();

    // M - Σ_{a: g ∈ T_a} x_a ≤ 0, one row per group
    let a_ub: Vec<Vec<f64>> = glist
        .iter()
        .map(|gid| {
            let mut row = vec![0.0; t + 1];
            row[0] = 1.0;
            for (a, template) in templates.iter().enumerate() {
                if template.iter().any(|g| &g == gid) {
                    row[a + 1] = -1.0;
                }
            }
            row
        })
        .collect();
    let b_ub = vec![0.0; glist.len()];

    // Σ x_a = 1
    let mut eq = vec![1.0; t + 1];
    eq[0] = 0.0;

    let solution = maximize(&objective, &a_ub, &b_ub, &[eq], &[1.0])?;
    let m = solution[0];
    Ok((solution[1..].to_vec(), m))
}

/// Maximize `c·z` subject to `a_ub·z ≤ b_ub`, `a_eq·z = b_eq`, `z ≥ 0`.
/// All right-hand sides must be non-negative.
pub fn maximize(
    c: &[f64],
    a_ub: &[Vec<f64>],
    b_ub: &[f64],
    a_eq: &[Vec<f64>],
    b_eq: &[f64],
) -> Result<Vec<f64>, SimplexError> {
    let n = c.len();
    let m_ub = a_ub.len();
    let m_eq = a_eq.len();
    let m = m_ub + m_eq;
    // columns: structural | slack | artificial | rhs
    let cols = n + m_ub + m_eq;

    let mut rows = Vec::with_capacity(m);
    let mut basis = Vec::with_capacity(m);
    for (i, a_row) in a_ub.iter().enumerate() {
        debug_assert!(b_ub[i] >= 0.0);
        let mut row = vec![0.0; cols + 1];
        row[..n].copy_from_slice(a_row);
        row[n + i] = 1.0;
        row[cols] = b_ub[i];
        rows.push(row);
        basis.push(n + i);
    }
    for (i, a_row) in a_eq.iter().enumerate() {
        debug_assert!(b_eq[i] >= 0.0);
        let mut row = vec![0.0; cols + 1];
        row[..n].copy_from_slice(a_row);
        row[n + m_ub + i] = 1.0;
        row[cols] = b_eq[i];
        rows.push(row);
        basis.push(n + m_ub + i);
    }

    let mut tab = Tableau { rows, basis, cols };

    if m_eq > 0 {
        // phase 1: drive the artificials to zero
        let mut phase1 = vec![0.0; cols];
        for coeff in phase1.iter_mut().skip(n + m_ub) {
            *coeff = -1.0;
        }
        tab.run(&phase1, |_| true)?;
        let infeasibility: f64 = tab
            .basis
            .iter()
            .zip(&tab.rows)
            .filter(|(b, _)| **b >= n + m_ub)
            .map(|(_, row)| row[tab.cols])
            .sum();
        if infeasibility > 1e-6 {
            return Err(SimplexError::Infeasible);
        }
        // pivot lingering zero-valued artificials out of the basis
        for i in 0..m {
            if tab.basis[i] >= n + m_ub {
                if let Some(col) = (0..n + m_ub).find(|&j| tab.rows[i][j].abs() > EPS) {
                    tab.pivot(i, col);
                }
            }
        }
    }

    let mut phase2 = vec![0.0; cols];
    phase2[..n].copy_from_slice(c);
    let structural = n + m_ub;
    tab.run(&phase2, |j| j < structural)?;

    let mut solution = vec![0.0; n];
    for (i, &b) in tab.basis.iter().enumerate() {
        if b < n {
            solution[b] = tab.rows[i][tab.cols];
        }
    }
    Ok(solution)
}

struct Tableau {
    rows: Vec<Vec<f64>>,
    basis: Vec<usize>,
    cols: usize,
}

impl Tableau {
    /// Run simplex pivots with Bland's rule until no allowed column has a
    /// positive reduced cost.
    fn run(
        &mut self,
        cost: &[f64],
        allowed: impl Fn(usize) -> bool,
    ) -> Result<(), SimplexError> {
        for _ in 0..MAX_ITER {
            let entering = (0..self.cols)
                .filter(|&j| allowed(j) && !self.basis.contains(&j))
                .find(|&j| self.reduced_cost(cost, j) > EPS);
            let Some(col) = entering else {
                return Ok(());
            };

            let mut leaving: Option<(usize, f64)> = None;
            for (i, row) in self.rows.iter().enumerate() {
                if row[col] > EPS {
                    let ratio = row[self.cols] / row[col];
                    let better = match leaving {
                        None => true,
                        Some((li, lr)) => {
                            ratio < lr - EPS
                                || (ratio < lr + EPS && self.basis[i] < self.basis[li])
                        }
                    };
                    if better {
                        leaving = Some((i, ratio));
                    }
                }
            }
            let Some((row, _)) = leaving else {
                return Err(SimplexError::Unbounded);
            };
            self.pivot(row, col);
        }
        Err(SimplexError::IterationLimit)
    }

    fn reduced_cost(&self, cost: &[f64], j: usize) -> f64 {
        let direct = cost[j];
        let basic: f64 = self
            .basis
            .iter()
            .zip(&self.rows)
            .map(|(&b, row)| cost[b] * row[j])
            .sum();
        direct - basic
    }

    fn pivot(&mut self, r: usize, c: usize) {
        let scale = self.rows[r][c];
        for value in self.rows[r].iter_mut() {
            *value /= scale;
        }
        for i in 0..self.rows.len() {
            if i == r {
                continue;
            }
            let factor = self.rows[i][c];
            if factor.abs() <= EPS {
                continue;
            }
            for j in 0..=self.cols {
                let delta = factor * self.rows[r][j];
                self.rows[i][j] -= delta;
            }
        }
        self.basis[r] = c;
    }
}
