//! Tensor Operations for Inference
//!
//! A minimal row-major tensor covering what a GPT-2 forward pass needs. The
//! model processes one sequence at a time, so activations are always 2D
//! `[seq, features]` and weights are 1D or 2D. Everything here works on those
//! ranks.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[seq, n_embd]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! ## Example
//!
//! ```rust
//! use gpt2_lazy::Tensor;
//!
//! // Create a 2x3 matrix
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::new(data, vec![2, 3]);
//!
//! // Matrix multiplication
//! let other = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let result = tensor.matmul(&other);
//! assert_eq!(result.shape, vec![2, 2]);
//! ```
//!
//! ## Row and Column Helpers
//!
//! Attention needs to pull tensors apart and put them back together:
//!
//! ```text
//! gather_rows   wte[ids]                  embedding lookup
//! slice_rows    wpe[0..seq]               position embeddings
//! split_cols    [seq, 3·d] → q, k, v      and q → heads
//! concat_cols   heads → [seq, d]          merge heads
//! argmax_row    logits[last] → next id    greedy decoding
//! ```
//!
//! ## Performance
//!
//! Matrix multiplication uses a cache-blocked algorithm parallelised over
//! output rows via Rayon once the work is large enough. Softmax, reductions
//! and element-wise operations are parallel per row or per element.
//!
//! Shape misuse is a programming error and panics with the offending shapes.

use rayon::prelude::*;

/// A row-major array of `f32`
///
/// For shape `[2, 3]`, data is stored as:
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
/// and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Arguments
    ///
    /// * `data` - Flat vector of values
    /// * `shape` - Dimensions of the tensor
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// assert_eq!(tensor.shape, vec![2, 2]);
    /// ```
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Rows and columns of a 2D tensor
    fn dims2(&self, op: &str) -> (usize, usize) {
        assert_eq!(
            self.shape.len(),
            2,
            "{op} expects a 2D tensor, got shape {:?}",
            self.shape
        );
        (self.shape[0], self.shape[1])
    }

    /// Length of the last axis
    fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Row `i` of a 2D tensor as a slice
    pub fn row(&self, i: usize) -> &[f32] {
        let (rows, cols) = self.dims2("row");
        assert!(i < rows, "row {i} out of range for shape {:?}", self.shape);
        &self.data[i * cols..(i + 1) * cols]
    }

    // === MATRIX MULTIPLICATION ===

    /// Computes `result[j] += a_val * b[j]` for all j
    ///
    /// Kept as a plain zip loop so LLVM can auto-vectorize it.
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication of two 2D tensors
    ///
    /// For `A @ B` where `A` is `[m, k]` and `B` is `[k, n]`, the result is
    /// `[m, n]` with `C[i,j] = sum(A[i,l] * B[l,j])`.
    ///
    /// # Performance
    ///
    /// - **Small matrices** (< 1K multiply-adds): Sequential computation
    /// - **Larger matrices**: Parallel cache-blocked algorithm
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::Tensor;
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
    /// let c = a.matmul(&b);
    /// assert_eq!(c.data, a.data);
    /// ```
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        let (m, k) = self.dims2("matmul");
        let (k2, n) = other.dims2("matmul");
        assert_eq!(
            k, k2,
            "Matrix dimensions incompatible: [{m}, {k}] @ [{k2}, {n}]"
        );

        if m * n * k >= 1_000 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for l in 0..k {
                    sum += self.data[i * k + l] * other.data[l * n + j];
                }
                result[i * n + j] = sum;
            }
        }

        Tensor::new(result, vec![m, n])
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Output rows are split into blocks of 8 and handed to Rayon. Within a
    /// block the column and inner dimensions are also walked in blocks of 8
    /// so the innermost loop touches contiguous memory in both operands.
    ///
    /// # Arguments
    ///
    /// * `other` - Right-hand matrix
    /// * `m` - Rows in self
    /// * `n` - Columns in other
    /// * `k` - Inner dimension
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    // === ACTIVATIONS AND REDUCTIONS ===

    /// Softmax over the last axis of a 2D tensor
    ///
    /// Uses the numerically stable form:
    ///
    /// ```text
    /// softmax(x)[i] = exp(x[i] - max(x)) / sum(exp(x[j] - max(x)))
    /// ```
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0], vec![1, 3]);
    /// let result = tensor.softmax();
    /// let sum: f32 = result.data.iter().sum();
    /// assert!((sum - 1.0).abs() < 1e-6);
    /// ```
    pub fn softmax(&self) -> Tensor {
        let (rows, cols) = self.dims2("softmax");

        let result: Vec<f32> = (0..rows)
            .into_par_iter()
            .flat_map_iter(|i| {
                let row = &self.data[i * cols..(i + 1) * cols];
                let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let exp_values: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
                let sum: f32 = exp_values.iter().sum();
                exp_values.into_iter().map(move |val| val / sum)
            })
            .collect();

        Tensor::new(result, self.shape.clone())
    }

    /// Mean of each row of a 2D tensor, shape `[rows]`
    pub fn mean(&self) -> Tensor {
        let (rows, cols) = self.dims2("mean");
        let result: Vec<f32> = (0..rows)
            .into_par_iter()
            .map(|i| self.data[i * cols..(i + 1) * cols].iter().sum::<f32>() / cols as f32)
            .collect();
        Tensor::new(result, vec![rows])
    }

    /// Population variance of each row of a 2D tensor, shape `[rows]`
    pub fn var(&self) -> Tensor {
        let (rows, cols) = self.dims2("var");
        let result: Vec<f32> = (0..rows)
            .into_par_iter()
            .map(|i| {
                let slice = &self.data[i * cols..(i + 1) * cols];
                let mean = slice.iter().sum::<f32>() / cols as f32;
                slice
                    .iter()
                    .map(|&x| {
                        let diff = x - mean;
                        diff * diff
                    })
                    .sum::<f32>()
                    / cols as f32
            })
            .collect();
        Tensor::new(result, vec![rows])
    }

    /// Index of the largest value in row `i`
    ///
    /// Ties go to the lowest index.
    pub fn argmax_row(&self, i: usize) -> usize {
        self.row(i)
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best, best_val), (j, &v)| {
                if v > best_val {
                    (j, v)
                } else {
                    (best, best_val)
                }
            })
            .0
    }

    // === ELEMENT-WISE OPERATIONS ===

    /// Apply `op` element-wise, broadcasting `other` over the last axis if
    /// it is a vector of that length
    fn zip_broadcast(&self, other: &Tensor, name: &str, op: impl Fn(f32, f32) -> f32 + Sync) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| op(a, b))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = self.last_dim();
        if other.shape.len() == 1 && other.data.len() == last_dim {
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| op(a, other.data[i % last_dim]))
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for {name}: {:?} and {:?}",
            self.shape, other.shape
        );
    }

    /// Element-wise addition, same shape or `[*, n] + [n]`
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::Tensor;
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let bias = Tensor::new(vec![10.0, 20.0], vec![2]);
    /// assert_eq!(a.add(&bias).data, vec![11.0, 22.0, 13.0, 24.0]);
    /// ```
    pub fn add(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "add", |a, b| a + b)
    }

    /// Element-wise multiplication, same shape or `[*, n] * [n]`
    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "mul", |a, b| a * b)
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Apply `f` to every element
    pub fn map(&self, f: impl Fn(f32) -> f32 + Sync + Send) -> Tensor {
        let result = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Replace values where mask is non-zero with `value`
    ///
    /// Used for causal masking in attention.
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        assert_eq!(
            self.shape, mask.shape,
            "Mask shape must match tensor shape"
        );
        let result = self
            .data
            .par_iter()
            .zip(&mask.data)
            .map(|(&x, &m)| if m != 0.0 { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    // === SHAPE MANIPULATION ===

    /// Transpose a 2D tensor
    pub fn transpose(&self) -> Tensor {
        let (rows, cols) = self.dims2("transpose");
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    /// Stack the listed rows of a 2D tensor
    ///
    /// # Panics
    ///
    /// Panics if any index is out of range
    pub fn gather_rows(&self, indices: &[usize]) -> Tensor {
        let (_, cols) = self.dims2("gather_rows");
        let mut data = Vec::with_capacity(indices.len() * cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Tensor::new(data, vec![indices.len(), cols])
    }

    /// Rows `start..end` of a 2D tensor
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        let (rows, cols) = self.dims2("slice_rows");
        assert!(
            start <= end && end <= rows,
            "row range {start}..{end} out of bounds for shape {:?}",
            self.shape
        );
        Tensor::new(self.data[start * cols..end * cols].to_vec(), vec![end - start, cols])
    }

    /// Split a 2D tensor into `parts` equal column blocks
    ///
    /// # Example
    ///
    /// ```rust
    /// # use gpt2_lazy::Tensor;
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 4]);
    /// let halves = t.split_cols(2);
    /// assert_eq!(halves[0].data, vec![1.0, 2.0]);
    /// assert_eq!(halves[1].data, vec![3.0, 4.0]);
    /// ```
    pub fn split_cols(&self, parts: usize) -> Vec<Tensor> {
        let (rows, cols) = self.dims2("split_cols");
        assert!(
            parts > 0 && cols % parts == 0,
            "cannot split {cols} columns into {parts} parts"
        );
        let width = cols / parts;

        (0..parts)
            .map(|p| {
                let mut data = Vec::with_capacity(rows * width);
                for i in 0..rows {
                    let start = i * cols + p * width;
                    data.extend_from_slice(&self.data[start..start + width]);
                }
                Tensor::new(data, vec![rows, width])
            })
            .collect()
    }

    /// Join 2D tensors with equal row counts side by side
    pub fn concat_cols(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "concat_cols needs at least one tensor");
        let (rows, _) = parts[0].dims2("concat_cols");
        let total_cols: usize = parts
            .iter()
            .map(|p| {
                let (r, c) = p.dims2("concat_cols");
                assert_eq!(r, rows, "concat_cols row counts differ");
                c
            })
            .sum();

        let mut data = Vec::with_capacity(rows * total_cols);
        for i in 0..rows {
            for part in parts {
                data.extend_from_slice(part.row(i));
            }
        }
        Tensor::new(data, vec![rows, total_cols])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_strides() {
        let t = Tensor::zeros(vec![2, 3, 4]);
        assert_eq!(t.strides, vec![12, 4, 1]);
        assert_eq!(Tensor::zeros(vec![5]).strides, vec![1]);
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_new_rejects_wrong_length() {
        Tensor::new(vec![1.0, 2.0, 3.0], vec![2, 2]);
    }

    #[test]
    fn test_matmul_small() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let b = Tensor::new(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], vec![3, 2]);
        let c = a.matmul(&b);
        assert_eq!(c.shape, vec![2, 2]);
        assert_eq!(c.data, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_blocked_matches_naive() {
        let (m, k, n) = (19, 13, 11);
        let a = Tensor::new((0..m * k).map(|i| (i % 7) as f32 - 3.0).collect(), vec![m, k]);
        let b = Tensor::new((0..k * n).map(|i| (i % 5) as f32 * 0.5).collect(), vec![k, n]);
        let c = a.matmul(&b);

        let mut expected = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for l in 0..k {
                    expected[i * n + j] += a.data[i * k + l] * b.data[l * n + j];
                }
            }
        }
        assert!(approx_eq(&c.data, &expected));
    }

    #[test]
    #[should_panic(expected = "incompatible")]
    fn test_matmul_shape_mismatch() {
        Tensor::zeros(vec![2, 3]).matmul(&Tensor::zeros(vec![2, 3]));
    }

    #[test]
    fn test_softmax_rows() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0], vec![2, 3]);
        let s = t.softmax();
        let row0: f32 = s.row(0).iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!(approx_eq(s.row(1), &[1.0 / 3.0; 3]));
        assert!(s.data[2] > s.data[1] && s.data[1] > s.data[0]);
    }

    #[test]
    fn test_softmax_ignores_masked_positions() {
        let t = Tensor::new(vec![0.0, -1e10], vec![1, 2]);
        let s = t.softmax();
        assert!(approx_eq(&s.data, &[1.0, 0.0]));
    }

    #[test]
    fn test_mean_and_var() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 2.0, 2.0, 2.0, 2.0], vec![2, 4]);
        assert!(approx_eq(&t.mean().data, &[2.5, 2.0]));
        assert!(approx_eq(&t.var().data, &[1.25, 0.0]));
    }

    #[test]
    fn test_add_and_mul_broadcast() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let v = Tensor::new(vec![2.0, 3.0], vec![2]);
        assert_eq!(a.add(&v).data, vec![3.0, 5.0, 5.0, 7.0]);
        assert_eq!(a.mul(&v).data, vec![2.0, 6.0, 6.0, 12.0]);
        assert_eq!(a.add(&a).data, vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(a.mul_scalar(0.5).data, vec![0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    #[should_panic(expected = "Unsupported broadcast")]
    fn test_add_rejects_bad_broadcast() {
        Tensor::zeros(vec![2, 3]).add(&Tensor::zeros(vec![2]));
    }

    #[test]
    fn test_masked_fill() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let mask = Tensor::new(vec![0.0, 1.0, 0.0, 0.0], vec![2, 2]);
        assert_eq!(t.masked_fill(&mask, -9.0).data, vec![1.0, -9.0, 3.0, 4.0]);
    }

    #[test]
    fn test_transpose() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let tt = t.transpose();
        assert_eq!(tt.shape, vec![3, 2]);
        assert_eq!(tt.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(tt.transpose(), t);
    }

    #[test]
    fn test_gather_and_slice_rows() {
        let t = Tensor::new((0..8).map(|i| i as f32).collect(), vec![4, 2]);
        let g = t.gather_rows(&[3, 0, 3]);
        assert_eq!(g.shape, vec![3, 2]);
        assert_eq!(g.data, vec![6.0, 7.0, 0.0, 1.0, 6.0, 7.0]);

        let s = t.slice_rows(1, 3);
        assert_eq!(s.data, vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(t.slice_rows(2, 2).shape, vec![0, 2]);
    }

    #[test]
    fn test_split_then_concat_restores() {
        let t = Tensor::new((0..12).map(|i| i as f32).collect(), vec![2, 6]);
        let parts = t.split_cols(3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].data, vec![2.0, 3.0, 8.0, 9.0]);
        assert_eq!(Tensor::concat_cols(&parts), t);
    }

    #[test]
    fn test_argmax_row_prefers_first_maximum() {
        let t = Tensor::new(vec![0.1, 0.9, 0.9, 5.0, -1.0, 2.0], vec![2, 3]);
        assert_eq!(t.argmax_row(0), 1);
        assert_eq!(t.argmax_row(1), 0);
    }
}
