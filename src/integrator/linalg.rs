// Dense kernels used by the multistep integrators.
//
// Matrices are stored column by column (`a[j][i]` is row i of column j) so the
// LU factorisation walks contiguous memory, as LINPACK's DGEFA/DGESL do.
// Vectors are plain slices; callers own every buffer.

use itertools::izip;

/// Raised by `lu_factor` when a zero pivot is met.
/// `column` is the first column without a usable pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SingularMatrix {
    pub column: usize,
}

// y <- alpha * x + y
pub(crate) fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    if alpha == 0.0 {
        return;
    }
    for (yi, xi) in izip!(y.iter_mut(), x) {
        *yi += alpha * xi;
    }
}

pub(crate) fn scale(alpha: f64, x: &mut [f64]) {
    for xi in x.iter_mut() {
        *xi *= alpha;
    }
}

// Index of the first element of largest magnitude. Returns 0 for an empty slice.
pub(crate) fn argmax_abs(x: &[f64]) -> usize {
    let mut index = 0;
    let mut largest = -1.0;
    for (i, xi) in x.iter().enumerate() {
        if abs!(*xi) > largest {
            largest = abs!(*xi);
            index = i;
        }
    }
    index
}

/// Weighted max-norm: max |v[i]| * w[i].
pub(crate) fn weighted_max_norm(v: &[f64], w: &[f64]) -> f64 {
    izip!(v, w).fold(0.0, |norm, (vi, wi)| max!(norm, abs!(vi) * wi))
}

/// Weighted norm of a matrix consistent with `weighted_max_norm`:
/// max over rows i of w[i] * sum_j |a[i][j]| / w[j].
pub(crate) fn weighted_matrix_norm(a: &[Vec<f64>], w: &[f64]) -> f64 {
    let mut norm = 0.0;
    for (i, wi) in w.iter().enumerate() {
        let sum = izip!(a, w).fold(0.0, |sum, (column, wj)| sum + abs!(column[i]) / wj);
        norm = max!(norm, wi * sum);
    }
    norm
}

/// Factors the column-major square matrix `a` in place by Gaussian elimination
/// with partial pivoting. On return `a` holds the unit lower triangular
/// multipliers (negated) below the diagonal and U on and above it, and
/// `pivots[k]` is the row swapped with row k at elimination step k.
///
/// A zero pivot does not stop the elimination; the first offending column is
/// reported so the caller can decide what to do with the partial factors.
pub(crate) fn lu_factor(a: &mut [Vec<f64>], pivots: &mut [usize]) -> Result<(), SingularMatrix> {
    let n = a.len();
    let mut singular = None;
    if n == 0 {
        return Ok(());
    }

    for k in 0..n - 1 {
        let (left, right) = a.split_at_mut(k + 1);
        let column_k = &mut left[k];

        let l = argmax_abs(&column_k[k..]) + k;
        pivots[k] = l;

        if column_k[l] == 0.0 {
            if singular.is_none() {
                singular = Some(k);
            }
            continue;
        }
        if l != k {
            column_k.swap(l, k);
        }

        let t = -1.0 / column_k[k];
        scale(t, &mut column_k[k + 1..]);

        // Row elimination with column indexing.
        for column_j in right.iter_mut() {
            let t = column_j[l];
            if l != k {
                column_j[l] = column_j[k];
                column_j[k] = t;
            }
            axpy(t, &column_k[k + 1..], &mut column_j[k + 1..]);
        }
    }

    pivots[n - 1] = n - 1;
    if a[n - 1][n - 1] == 0.0 && singular.is_none() {
        singular = Some(n - 1);
    }

    match singular {
        Some(column) => Err(SingularMatrix { column }),
        None => Ok(()),
    }
}

/// Solves `A x = b` using the factors produced by `lu_factor`; `b` is
/// overwritten with `x`.
pub(crate) fn lu_solve(lu: &[Vec<f64>], pivots: &[usize], b: &mut [f64]) {
    let n = lu.len();
    if n == 0 {
        return;
    }

    // Forward elimination: solve L y = P b.
    for k in 0..n - 1 {
        let l = pivots[k];
        let t = b[l];
        if l != k {
            b[l] = b[k];
            b[k] = t;
        }
        axpy(t, &lu[k][k + 1..], &mut b[k + 1..]);
    }

    // Back substitution: solve U x = y.
    for k in (0..n).rev() {
        b[k] /= lu[k][k];
        let t = -b[k];
        axpy(t, &lu[k][..k], &mut b[..k]);
    }
}
