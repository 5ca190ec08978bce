use faer::{Mat, MatRef};
use rustc_hash::FxHashMap;
use std::hash::Hash;

//////////////////
// VECTOR STUFF //
//////////////////

/// Mean and (population) variance of a slice
///
/// ### Params
///
/// * `x` - Slice of `f32`
///
/// ### Returns
///
/// Tuple of `(mean, variance)`. Empty slices return `(0, 0)`.
pub fn mean_var(x: &[f32]) -> (f32, f32) {
    if x.is_empty() {
        return (0.0, 0.0);
    }
    let n = x.len() as f64;
    let mean = x.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = x.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, var as f32)
}

/// Majority vote over a sequence of items
///
/// Counts are tallied in order of appearance. On equal counts, the item that
/// appeared first in the sequence wins, which lets callers pass items in
/// rank order and get rank-based tie breaking for free.
///
/// ### Params
///
/// * `items` - Iterator over the votes
///
/// ### Returns
///
/// The winning item or `None` for an empty iterator.
pub fn majority_vote<T, I>(items: I) -> Option<T>
where
    T: Eq + Hash + Copy,
    I: IntoIterator<Item = T>,
{
    let mut counts: FxHashMap<T, (usize, usize)> = FxHashMap::default();
    for (pos, item) in items.into_iter().enumerate() {
        counts.entry(item).or_insert((0, pos)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| {
            let (count_a, first_a) = a.1;
            let (count_b, first_b) = b.1;
            count_a.cmp(&count_b).then(first_b.cmp(&first_a))
        })
        .map(|(item, _)| item)
}

//////////////////
// MATRIX STUFF //
//////////////////

/// Build a one-hot encoding of categorical codes
///
/// ### Params
///
/// * `codes` - Category per row
/// * `n_categories` - Total number of categories
///
/// ### Returns
///
/// A `codes.len() x n_categories` matrix.
pub fn one_hot(codes: &[usize], n_categories: usize) -> Mat<f32> {
    Mat::from_fn(codes.len(), n_categories, |i, j| {
        if codes[i] == j {
            1.0
        } else {
            0.0
        }
    })
}

/// Copy selected rows of a matrix into a new matrix
///
/// ### Params
///
/// * `mat` - Source matrix
/// * `rows` - Row indices to take (in order)
///
/// ### Returns
///
/// The row subset.
pub fn select_rows(mat: MatRef<f32>, rows: &[usize]) -> Mat<f32> {
    Mat::from_fn(rows.len(), mat.ncols(), |i, j| mat[(rows[i], j)])
}

/// Copy selected columns of a matrix into a new matrix
pub fn select_cols(mat: MatRef<f32>, cols: &[usize]) -> Mat<f32> {
    Mat::from_fn(mat.nrows(), cols.len(), |i, j| mat[(i, cols[j])])
}

/// Row-wise concatenation of two matrices with the same number of rows
pub fn hcat(left: &Mat<f32>, right: &Mat<f32>) -> Mat<f32> {
    assert_eq!(left.nrows(), right.nrows(), "hcat: row counts differ");
    let split = left.ncols();
    Mat::from_fn(left.nrows(), split + right.ncols(), |i, j| {
        if j < split {
            left[(i, j)]
        } else {
            right[(i, j - split)]
        }
    })
}

/// Flatten a matrix into a column-major vector
pub fn mat_to_vec(mat: &Mat<f32>) -> Vec<f32> {
    let mut out = Vec::with_capacity(mat.nrows() * mat.ncols());
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out.push(mat[(i, j)]);
        }
    }
    out
}

/// Rebuild a matrix from a column-major vector
pub fn vec_to_mat(data: &[f32], nrows: usize, ncols: usize) -> Mat<f32> {
    Mat::from_fn(nrows, ncols, |i, j| data[j * nrows + i])
}

/// Squared Euclidean distance between two rows of (possibly different)
/// matrices
pub fn row_sq_dist(a: &Mat<f32>, i: usize, b: &Mat<f32>, j: usize) -> f32 {
    let mut sum = 0_f32;
    for d in 0..a.ncols() {
        let diff = a[(i, d)] - b[(j, d)];
        sum += diff * diff;
    }
    sum
}

///////////
// Tests //
///////////
