use nalgebra::{DMatrix, DVector};
use tracing::{error, trace};

use super::SolverError;

/// Consumption intensities for one timestep
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Quantity per unit of accounted electricity, one entry per region
    pub intensity: Vec<f64>,
    /// Regions isolated in this timestep and pinned to zero
    pub perturbed: Vec<usize>,
}

/// Solves `A·X = F` with `A = diag(P + ImportTotal) − Imp` for one timestep.
///
/// `Imp[i,j] = max(-ID[i,j], 0)` is what region `i` receives from `j`, so
/// imports carry the exporter's intensity. A region with no production, no
/// weight and no trade leaves an all-zero row and column; such indices are
/// pinned (`A[i,i] = 1`, `F[i] = 0`) once the condition number exceeds the
/// limit, and must solve to exactly zero.
#[derive(Debug, Clone, Copy)]
pub struct ConsumptionEmissionsSolver {
    max_condition: f64,
}

impl Default for ConsumptionEmissionsSolver {
    fn default() -> Self {
        Self {
            max_condition: 1.0 / f64::EPSILON,
        }
    }
}

impl ConsumptionEmissionsSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the condition-number limit (default `1 / ε`)
    pub fn with_max_condition(max_condition: f64) -> Self {
        Self { max_condition }
    }

    /// `F` production, `P` generation weight, `ID` signed export-positive
    /// interchange (`n × n`)
    pub fn solve(&self, production: &[f64], weight: &[f64], interchange: &DMatrix<f64>) -> Result<Solution, SolverError> {
        let n = production.len();
        check_len("weight", n, weight.len())?;
        check_len("interchange rows", n, interchange.nrows())?;
        check_len("interchange columns", n, interchange.ncols())?;
        if production.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFiniteInput("production"));
        }
        if weight.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFiniteInput("weight"));
        }
        if interchange.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFiniteInput("interchange"));
        }
        if n == 0 {
            return Ok(Solution {
                intensity: Vec::new(),
                perturbed: Vec::new(),
            });
        }

        let mut a = assemble(weight, &import_matrix(interchange));
        let mut b = DVector::from_column_slice(production);
        let mut perturbed = Vec::new();
        let mut condition = condition_number(&a);

        if condition > self.max_condition {
            for i in 0..n {
                if a.row(i).iter().all(|v| *v == 0.0) && a.column(i).iter().all(|v| *v == 0.0) {
                    a[(i, i)] = 1.0;
                    b[i] = 0.0;
                    perturbed.push(i);
                }
            }
            condition = condition_number(&a);
            trace!(perturbed = ?perturbed, condition, "isolated regions pinned");
            if condition > self.max_condition {
                return Err(SolverError::SingularSystem { condition });
            }
        }

        let x = a
            .lu()
            .solve(&b)
            .filter(|x| x.iter().all(|v| v.is_finite()))
            .ok_or(SolverError::SingularSystem { condition })?;

        verify_perturbed(&x, &perturbed)?;

        Ok(Solution {
            intensity: x.iter().copied().collect(),
            perturbed,
        })
    }
}

/// Every pinned index must have solved to exactly zero
fn verify_perturbed(x: &DVector<f64>, perturbed: &[usize]) -> Result<(), SolverError> {
    match perturbed.iter().find(|&&i| x[i] != 0.0) {
        Some(&index) => {
            error!(index, value = x[index], "perturbed region did not solve to zero");
            Err(SolverError::PerturbationInvariantViolated { index, value: x[index] })
        }
        None => Ok(()),
    }
}

/// `Imp[i,j] = max(-ID[i,j], 0)`
pub fn import_matrix(interchange: &DMatrix<f64>) -> DMatrix<f64> {
    interchange.map(|v| (-v).max(0.0))
}

/// `diag(P + ImportTotal) − Imp`
pub fn assemble(weight: &[f64], imports: &DMatrix<f64>) -> DMatrix<f64> {
    let mut a = -imports.clone();
    for (i, p) in weight.iter().enumerate() {
        a[(i, i)] += p + imports.row(i).sum();
    }
    a
}

/// 2-norm condition number, infinite for a singular matrix
pub fn condition_number(a: &DMatrix<f64>) -> f64 {
    if a.is_empty() {
        return 1.0;
    }
    let singular = a.clone().singular_values();
    let (max, min) = (singular.max(), singular.min());
    if min <= 0.0 {
        f64::INFINITY
    } else {
        max / min
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), SolverError> {
    if expected == actual {
        Ok(())
    } else {
        Err(SolverError::DimensionMismatch { what, expected, actual })
    }
}
