//! Reference implementations of vendor-library routines for the host device.
//!
//! All matrices are dense, row-major and `f32`. Batched routines process
//! `batch` consecutive matrices laid out back to back.

use crate::error::{Result, RuntimeError};

// ============================================================================
// GEMM
// ============================================================================

/// Parameters of a (batched) matrix multiply `C = alpha * op(A) op(B) + beta * C`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmParams {
    /// Rows of `op(A)` and `C`.
    pub m: usize,
    /// Columns of `op(B)` and `C`.
    pub n: usize,
    /// Contracting dimension.
    pub k: usize,
    /// Number of independent products.
    pub batch: usize,
    /// Use `A` transposed.
    pub transpose_a: bool,
    /// Use `B` transposed.
    pub transpose_b: bool,
    /// Scale applied to the product.
    pub alpha: f32,
    /// Scale applied to the existing output.
    pub beta: f32,
}

impl GemmParams {
    /// Plain `C = A B` without transposes or batching.
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self {
            m,
            n,
            k,
            batch: 1,
            transpose_a: false,
            transpose_b: false,
            alpha: 1.0,
            beta: 0.0,
        }
    }
}

/// Runs a GEMM.
pub fn gemm(p: &GemmParams, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
    let (a_len, b_len, c_len) = (p.m * p.k, p.k * p.n, p.m * p.n);
    check_len("gemm lhs", a.len(), a_len * p.batch)?;
    check_len("gemm rhs", b.len(), b_len * p.batch)?;
    check_len("gemm output", c.len(), c_len * p.batch)?;

    for batch in 0..p.batch {
        let a = &a[batch * a_len..(batch + 1) * a_len];
        let b = &b[batch * b_len..(batch + 1) * b_len];
        let c = &mut c[batch * c_len..(batch + 1) * c_len];
        for i in 0..p.m {
            for j in 0..p.n {
                let mut acc = 0.0f32;
                for l in 0..p.k {
                    let av = if p.transpose_a { a[l * p.m + i] } else { a[i * p.k + l] };
                    let bv = if p.transpose_b { b[j * p.k + l] } else { b[l * p.n + j] };
                    acc += av * bv;
                }
                let out = &mut c[i * p.n + j];
                *out = if p.beta == 0.0 {
                    p.alpha * acc
                } else {
                    p.alpha * acc + p.beta * *out
                };
            }
        }
    }
    Ok(())
}

// ============================================================================
// CHOLESKY
// ============================================================================

/// In-place Cholesky factorization of `batch` symmetric `n x n` matrices.
/// Writes `L` (lower) or `U` (upper) and zeroes the other triangle.
pub fn cholesky(a: &mut [f32], n: usize, batch: usize, lower: bool) -> Result<()> {
    check_len("cholesky input", a.len(), n * n * batch)?;
    for batch_index in 0..batch {
        let m = &mut a[batch_index * n * n..(batch_index + 1) * n * n];
        let mut l = vec![0.0f32; n * n];
        for j in 0..n {
            let mut diag = m[j * n + j];
            for k in 0..j {
                diag -= l[j * n + k] * l[j * n + k];
            }
            if diag <= 0.0 || !diag.is_finite() {
                return Err(RuntimeError::InvalidArgument(format!(
                    "cholesky: matrix {} is not positive definite",
                    batch_index
                )));
            }
            let diag = diag.sqrt();
            l[j * n + j] = diag;
            for i in j + 1..n {
                let mut v = m[i * n + j];
                for k in 0..j {
                    v -= l[i * n + k] * l[j * n + k];
                }
                l[i * n + j] = v / diag;
            }
        }
        for i in 0..n {
            for j in 0..n {
                m[i * n + j] = if lower { l[i * n + j] } else { l[j * n + i] };
            }
        }
    }
    Ok(())
}

// ============================================================================
// SORT
// ============================================================================

/// Sorts each row of `row_len` keys, permuting `values` alongside.
/// The sort is stable; unordered keys (NaN) compare equal.
pub fn sort_rows<K: PartialOrd + Copy>(
    keys: &mut [K],
    mut values: Option<&mut [u32]>,
    row_len: usize,
    descending: bool,
) -> Result<()> {
    if row_len == 0 || keys.len() % row_len != 0 {
        return Err(RuntimeError::InvalidArgument(format!(
            "sort: {} keys do not split into rows of {}",
            keys.len(),
            row_len
        )));
    }
    if let Some(values) = values.as_deref() {
        check_len("sort values", values.len(), keys.len())?;
    }

    for row in 0..keys.len() / row_len {
        let range = row * row_len..(row + 1) * row_len;
        let row_keys = &mut keys[range.clone()];
        let mut order: Vec<usize> = (0..row_len).collect();
        order.sort_by(|&x, &y| {
            let ord = row_keys[x]
                .partial_cmp(&row_keys[y])
                .unwrap_or(std::cmp::Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        let sorted_keys: Vec<K> = order.iter().map(|&i| row_keys[i]).collect();
        row_keys.copy_from_slice(&sorted_keys);
        if let Some(values) = values.as_deref_mut() {
            let row_values = &mut values[range];
            let sorted_values: Vec<u32> = order.iter().map(|&i| row_values[i]).collect();
            row_values.copy_from_slice(&sorted_values);
        }
    }
    Ok(())
}

// ============================================================================
// FFT
// ============================================================================

/// Direction of a complex-to-complex transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FftDirection {
    /// Forward transform.
    Forward,
    /// Inverse transform, scaled by `1 / length`.
    Inverse,
}

/// Batched complex FFT over interleaved `(re, im)` pairs.
pub fn fft(
    input: &[f32],
    output: &mut [f32],
    length: usize,
    batch: usize,
    direction: FftDirection,
) -> Result<()> {
    check_len("fft input", input.len(), 2 * length * batch)?;
    check_len("fft output", output.len(), 2 * length * batch)?;
    let sign = match direction {
        FftDirection::Forward => -1.0f64,
        FftDirection::Inverse => 1.0f64,
    };
    for b in 0..batch {
        let x = &input[2 * length * b..2 * length * (b + 1)];
        let y = &mut output[2 * length * b..2 * length * (b + 1)];
        for k in 0..length {
            let (mut re, mut im) = (0.0f64, 0.0f64);
            for t in 0..length {
                let angle = sign * 2.0 * std::f64::consts::PI * (k * t) as f64 / length as f64;
                let (s, c) = angle.sin_cos();
                let (xr, xi) = (x[2 * t] as f64, x[2 * t + 1] as f64);
                re += xr * c - xi * s;
                im += xr * s + xi * c;
            }
            if direction == FftDirection::Inverse {
                re /= length as f64;
                im /= length as f64;
            }
            y[2 * k] = re as f32;
            y[2 * k + 1] = im as f32;
        }
    }
    Ok(())
}

// ============================================================================
// TRIANGULAR SOLVE
// ============================================================================

/// Parameters of a triangular solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangularSolveParams {
    /// Rows of `B`.
    pub m: usize,
    /// Columns of `B`.
    pub n: usize,
    /// Solve `op(A) X = alpha B` when true, `X op(A) = alpha B` otherwise.
    pub left_side: bool,
    /// `A` is lower triangular.
    pub lower: bool,
    /// Use `A` transposed.
    pub transpose_a: bool,
    /// Assume a unit diagonal.
    pub unit_diagonal: bool,
    /// Scale applied to `B`.
    pub alpha: f32,
}

/// Solves in place: `b` is overwritten by `X`.
pub fn triangular_solve(p: &TriangularSolveParams, a: &[f32], b: &mut [f32]) -> Result<()> {
    let dim = if p.left_side { p.m } else { p.n };
    check_len("triangular solve a", a.len(), dim * dim)?;
    check_len("triangular solve b", b.len(), p.m * p.n)?;

    let mut t = transpose_if(a, dim, dim, p.transpose_a);
    let mut effective_lower = p.lower != p.transpose_a;
    for v in b.iter_mut() {
        *v *= p.alpha;
    }

    if p.left_side {
        solve_left(&t, effective_lower, p.unit_diagonal, p.m, p.n, b)
    } else {
        // X T = B  <=>  T^T X^T = B^T
        t = transpose_if(&t, dim, dim, true);
        effective_lower = !effective_lower;
        let mut bt = transpose_if(b, p.m, p.n, true);
        solve_left(&t, effective_lower, p.unit_diagonal, p.n, p.m, &mut bt)?;
        b.copy_from_slice(&transpose_if(&bt, p.n, p.m, true));
        Ok(())
    }
}

fn solve_left(t: &[f32], lower: bool, unit: bool, m: usize, n: usize, b: &mut [f32]) -> Result<()> {
    for col in 0..n {
        let rows: Box<dyn Iterator<Item = usize>> = if lower {
            Box::new(0..m)
        } else {
            Box::new((0..m).rev())
        };
        for i in rows {
            let mut v = b[i * n + col];
            let known: Box<dyn Iterator<Item = usize>> = if lower {
                Box::new(0..i)
            } else {
                Box::new(i + 1..m)
            };
            for j in known {
                v -= t[i * m + j] * b[j * n + col];
            }
            if !unit {
                let d = t[i * m + i];
                if d == 0.0 {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "triangular solve: zero on diagonal at {}",
                        i
                    )));
                }
                v /= d;
            }
            b[i * n + col] = v;
        }
    }
    Ok(())
}

fn transpose_if(x: &[f32], rows: usize, cols: usize, transpose: bool) -> Vec<f32> {
    if !transpose {
        return x.to_vec();
    }
    let mut out = vec![0.0f32; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = x[i * cols + j];
        }
    }
    out
}

// ============================================================================
// FUSED ATTENTION
// ============================================================================

/// Parameters of fused multi-head attention `softmax(scale * Q K^T) V`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionParams {
    /// Batch times heads.
    pub batch: usize,
    /// Query sequence length.
    pub seq_q: usize,
    /// Key/value sequence length.
    pub seq_kv: usize,
    /// Query/key head dimension.
    pub head_dim: usize,
    /// Value head dimension.
    pub value_dim: usize,
    /// Logit scale.
    pub scale: f32,
    /// Mask keys after the query position.
    pub causal: bool,
}

/// Runs fused attention.
pub fn attention(p: &AttentionParams, q: &[f32], k: &[f32], v: &[f32], out: &mut [f32]) -> Result<()> {
    check_len("attention q", q.len(), p.batch * p.seq_q * p.head_dim)?;
    check_len("attention k", k.len(), p.batch * p.seq_kv * p.head_dim)?;
    check_len("attention v", v.len(), p.batch * p.seq_kv * p.value_dim)?;
    check_len("attention output", out.len(), p.batch * p.seq_q * p.value_dim)?;

    let mut logits = vec![0.0f32; p.seq_kv];
    for b in 0..p.batch {
        for i in 0..p.seq_q {
            let qi = &q[(b * p.seq_q + i) * p.head_dim..(b * p.seq_q + i + 1) * p.head_dim];
            let mut max = f32::NEG_INFINITY;
            for (j, logit) in logits.iter_mut().enumerate() {
                if p.causal && j > i {
                    *logit = f32::NEG_INFINITY;
                    continue;
                }
                let kj = &k[(b * p.seq_kv + j) * p.head_dim..(b * p.seq_kv + j + 1) * p.head_dim];
                *logit = p.scale * qi.iter().zip(kj).map(|(x, y)| x * y).sum::<f32>();
                max = max.max(*logit);
            }
            let mut denom = 0.0f32;
            for logit in logits.iter_mut() {
                *logit = if *logit == f32::NEG_INFINITY { 0.0 } else { (*logit - max).exp() };
                denom += *logit;
            }
            let row = &mut out[(b * p.seq_q + i) * p.value_dim..(b * p.seq_q + i + 1) * p.value_dim];
            row.fill(0.0);
            for (j, weight) in logits.iter().enumerate() {
                if *weight == 0.0 {
                    continue;
                }
                let vj = &v[(b * p.seq_kv + j) * p.value_dim..(b * p.seq_kv + j + 1) * p.value_dim];
                for (o, x) in row.iter_mut().zip(vj) {
                    *o += weight / denom * x;
                }
            }
        }
    }
    Ok(())
}

fn check_len(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual < expected {
        return Err(RuntimeError::InvalidArgument(format!(
            "{}: expected {} elements, got {}",
            what, expected, actual
        )));
    }
    Ok(())
}
