use faer::{Mat, MatRef};
use rayon::iter::*;

////////////////////
// Util functions //
////////////////////

/// Calculates the columns means of a matrix
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the column-wise means
///
/// ### Returns
///
/// Vector of the column means.
pub fn col_means(mat: MatRef<f32>) -> Vec<f32> {
    let n_rows = mat.nrows();
    if n_rows == 0 {
        return vec![0.0; mat.ncols()];
    }
    let ones = Mat::<f32>::from_fn(n_rows, 1, |_, _| 1.0);
    let means = ones.transpose() * mat;

    (0..mat.ncols())
        .map(|j| means[(0, j)] / n_rows as f32)
        .collect()
}

/// Calculates the row sums of a matrix
pub fn row_sums(mat: MatRef<f32>) -> Vec<f32> {
    (0..mat.nrows())
        .map(|i| (0..mat.ncols()).map(|j| mat[(i, j)]).sum())
        .collect()
}

/// Numerically stable row-wise softmax
///
/// ### Params
///
/// * `logits` - Matrix with one distribution per row
///
/// ### Returns
///
/// Matrix of the same shape with every row summing to one.
pub fn softmax_rows(logits: MatRef<f32>) -> Mat<f32> {
    let (n, m) = logits.shape();
    let mut res = Mat::<f32>::zeros(n, m);
    for i in 0..n {
        let mut max = f32::NEG_INFINITY;
        for j in 0..m {
            max = max.max(logits[(i, j)]);
        }
        let mut total = 0_f32;
        for j in 0..m {
            let e = (logits[(i, j)] - max).exp();
            res[(i, j)] = e;
            total += e;
        }
        for j in 0..m {
            res[(i, j)] /= total;
        }
    }
    res
}

/// Library-size normalisation followed by `ln(1 + x)`
///
/// Rows with a library size of zero stay zero.
///
/// ### Params
///
/// * `counts` - Cells x genes count matrix
/// * `size_factor` - Target library size. `1e6` gives CPM.
///
/// ### Returns
///
/// The normalised matrix.
pub fn log_normalise_rows(counts: MatRef<f32>, size_factor: f32) -> Mat<f32> {
    let (n, m) = counts.shape();
    let lib_sizes = row_sums(counts);

    let rows: Vec<Vec<f32>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let lib = lib_sizes[i];
            (0..m)
                .map(|j| {
                    if lib > 0.0 {
                        (counts[(i, j)] / lib * size_factor).ln_1p()
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();

    Mat::from_fn(n, m, |i, j| rows[i][j])
}

/// Element-wise `ln(1 + x)`
pub fn log1p_mat(mat: MatRef<f32>) -> Mat<f32> {
    Mat::from_fn(mat.nrows(), mat.ncols(), |i, j| mat[(i, j)].ln_1p())
}

/// Check that every entry is finite
pub fn all_finite(mat: MatRef<f32>) -> bool {
    (0..mat.ncols()).all(|j| (0..mat.nrows()).all(|i| mat[(i, j)].is_finite()))
}

///////////
// Tests //
///////////
