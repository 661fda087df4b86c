//! Library-call thunks.
//!
//! Each thunk resolves its operand slices, runs the host reference routine
//! from `gpurt_core::device::library` in stream order and writes its
//! results back. Routines without a host implementation (convolution,
//! convolution reorder, norm) fail with [`RuntimeError::UnsupportedKind`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gpurt_core::device::library::{
    self, AttentionParams, FftDirection, GemmParams, TriangularSolveParams,
};
use gpurt_core::device::{BufferSlice, DeviceRegion, Stream};
use gpurt_core::error::{Result, RuntimeError};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::kind::ThunkKind;
use crate::params::{ExecuteParams, InitializeParams};

// ============================================================================
// GEMM
// ============================================================================

/// Post-processing applied to a matrix multiply result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Epilogue {
    /// No post-processing.
    #[default]
    Default,
    /// Adds a bias vector of `n` elements to every row.
    Bias,
    /// Clamps negative values to zero.
    Relu,
    /// Bias, then ReLU.
    BiasRelu,
}

impl Epilogue {
    fn has_bias(self) -> bool {
        matches!(self, Epilogue::Bias | Epilogue::BiasRelu)
    }

    fn has_relu(self) -> bool {
        matches!(self, Epilogue::Relu | Epilogue::BiasRelu)
    }
}

/// `C = alpha * op(A) op(B) + beta * C`, optionally followed by an
/// epilogue.
#[derive(Debug, Clone)]
pub struct GemmThunk {
    config: GemmParams,
    lhs: BufferSlice,
    rhs: BufferSlice,
    output: BufferSlice,
    epilogue: Epilogue,
    bias: Option<BufferSlice>,
}

impl GemmThunk {
    /// A plain matrix multiply.
    pub fn new(config: GemmParams, lhs: BufferSlice, rhs: BufferSlice, output: BufferSlice) -> Self {
        Self {
            config,
            lhs,
            rhs,
            output,
            epilogue: Epilogue::Default,
            bias: None,
        }
    }

    /// Set the epilogue. Bias epilogues read `bias`.
    #[must_use]
    pub fn with_epilogue(mut self, epilogue: Epilogue, bias: Option<BufferSlice>) -> Self {
        self.epilogue = epilogue;
        self.bias = bias;
        self
    }

    /// Multiply configuration.
    pub fn config(&self) -> &GemmParams {
        &self.config
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let a = params.region(&self.lhs)?;
        let b = params.region(&self.rhs)?;
        let c = params.region(&self.output)?;
        let bias = match (self.epilogue.has_bias(), &self.bias) {
            (false, _) => None,
            (true, Some(slice)) => Some(params.region(slice)?),
            (true, None) => {
                return Err(RuntimeError::InvalidArgument(
                    "gemm bias epilogue without a bias operand".to_string(),
                ))
            }
        };

        params.stream.run_library("gemm", || {
            let mut out = c.read_as::<f32>();
            library::gemm(&self.config, &a.read_as::<f32>(), &b.read_as::<f32>(), &mut out)?;
            if let Some(bias) = &bias {
                let bias = bias.read_as::<f32>();
                if bias.len() != self.config.n {
                    return Err(RuntimeError::InvalidArgument(format!(
                        "gemm bias has {} elements, expected {}",
                        bias.len(),
                        self.config.n
                    )));
                }
                for row in out.chunks_mut(self.config.n) {
                    for (v, b) in row.iter_mut().zip(&bias) {
                        *v += b;
                    }
                }
            }
            if self.epilogue.has_relu() {
                for v in out.iter_mut() {
                    *v = v.max(0.0);
                }
            }
            c.write_from(&out)
        })
    }
}

// ============================================================================
// CHOLESKY
// ============================================================================

/// Batched Cholesky factorization.
#[derive(Debug, Clone)]
pub struct CholeskyThunk {
    operand: BufferSlice,
    output: BufferSlice,
    n: usize,
    batch: usize,
    lower: bool,
}

impl CholeskyThunk {
    /// Factorizes `batch` `n x n` matrices from `operand` into `output`.
    pub fn new(operand: BufferSlice, output: BufferSlice, n: usize, batch: usize, lower: bool) -> Self {
        Self {
            operand,
            output,
            n,
            batch,
            lower,
        }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let src = params.region(&self.operand)?;
        let dst = params.region(&self.output)?;
        if self.operand != self.output {
            params.stream.memcpy_d2d(&dst, &src)?;
        }
        params.stream.run_library("potrf", || {
            let mut a = dst.read_as::<f32>();
            library::cholesky(&mut a, self.n, self.batch, self.lower)?;
            dst.write_from(&a)
        })
    }
}

// ============================================================================
// SORT
// ============================================================================

/// Element type of sort keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKeyType {
    /// 32-bit float keys.
    F32,
    /// 32-bit signed keys.
    S32,
}

/// In-place row sort of keys, optionally permuting `u32` values alongside.
#[derive(Debug, Clone)]
pub struct SortThunk {
    keys: BufferSlice,
    values: Option<BufferSlice>,
    key_type: SortKeyType,
    row_len: usize,
    descending: bool,
}

impl SortThunk {
    /// Sorts rows of `row_len` keys ascending.
    pub fn new(keys: BufferSlice, key_type: SortKeyType, row_len: usize) -> Self {
        Self {
            keys,
            values: None,
            key_type,
            row_len,
            descending: false,
        }
    }

    /// Permute `values` with the keys.
    #[must_use]
    pub fn with_values(mut self, values: BufferSlice) -> Self {
        self.values = Some(values);
        self
    }

    /// Sort descending.
    #[must_use]
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let keys = params.region(&self.keys)?;
        let values = self.values.as_ref().map(|v| params.region(v)).transpose()?;

        params.stream.run_library("radix-sort", || {
            let mut vals = values.as_ref().map(|v| v.read_as::<u32>());
            match self.key_type {
                SortKeyType::F32 => {
                    let mut k = keys.read_as::<f32>();
                    library::sort_rows(&mut k, vals.as_deref_mut(), self.row_len, self.descending)?;
                    keys.write_from(&k)?;
                }
                SortKeyType::S32 => {
                    let mut k = keys.read_as::<i32>();
                    library::sort_rows(&mut k, vals.as_deref_mut(), self.row_len, self.descending)?;
                    keys.write_from(&k)?;
                }
            }
            match (&values, &vals) {
                (Some(region), Some(v)) => region.write_from(v),
                _ => Ok(()),
            }
        })
    }
}

// ============================================================================
// FFT
// ============================================================================

/// Batched complex-to-complex FFT.
#[derive(Debug, Clone)]
pub struct FftThunk {
    input: BufferSlice,
    output: BufferSlice,
    length: usize,
    batch: usize,
    direction: FftDirection,
}

impl FftThunk {
    /// Transforms `batch` signals of `length` complex values.
    pub fn new(
        input: BufferSlice,
        output: BufferSlice,
        length: usize,
        batch: usize,
        direction: FftDirection,
    ) -> Self {
        Self {
            input,
            output,
            length,
            batch,
            direction,
        }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let input = params.region(&self.input)?;
        let output = params.region(&self.output)?;
        params.stream.run_library("fft", || {
            let mut out = vec![0.0f32; output.element_count::<f32>()];
            library::fft(&input.read_as::<f32>(), &mut out, self.length, self.batch, self.direction)?;
            output.write_from(&out)
        })
    }
}

// ============================================================================
// TRIANGULAR SOLVE
// ============================================================================

/// Triangular solve; `b` is copied to `output` and solved there.
#[derive(Debug, Clone)]
pub struct TriangularSolveThunk {
    config: TriangularSolveParams,
    a: BufferSlice,
    b: BufferSlice,
    output: BufferSlice,
}

impl TriangularSolveThunk {
    /// Creates a triangular solve.
    pub fn new(config: TriangularSolveParams, a: BufferSlice, b: BufferSlice, output: BufferSlice) -> Self {
        Self { config, a, b, output }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let a = params.region(&self.a)?;
        let b = params.region(&self.b)?;
        let out = params.region(&self.output)?;
        if self.b != self.output {
            params.stream.memcpy_d2d(&out, &b)?;
        }
        params.stream.run_library("trsm", || {
            let mut x = out.read_as::<f32>();
            library::triangular_solve(&self.config, &a.read_as::<f32>(), &mut x)?;
            out.write_from(&x)
        })
    }
}

// ============================================================================
// FUSED ATTENTION
// ============================================================================

/// Fused multi-head attention.
#[derive(Debug, Clone)]
pub struct FusedMhaThunk {
    config: AttentionParams,
    query: BufferSlice,
    key: BufferSlice,
    value: BufferSlice,
    output: BufferSlice,
}

impl FusedMhaThunk {
    /// Creates a fused attention call.
    pub fn new(
        config: AttentionParams,
        query: BufferSlice,
        key: BufferSlice,
        value: BufferSlice,
        output: BufferSlice,
    ) -> Self {
        Self {
            config,
            query,
            key,
            value,
            output,
        }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let q = params.region(&self.query)?;
        let k = params.region(&self.key)?;
        let v = params.region(&self.value)?;
        let out = params.region(&self.output)?;
        params.stream.run_library("fmha", || {
            let mut o = vec![0.0f32; out.element_count::<f32>()];
            library::attention(
                &self.config,
                &q.read_as::<f32>(),
                &k.read_as::<f32>(),
                &v.read_as::<f32>(),
                &mut o,
            )?;
            out.write_from(&o)
        })
    }
}

// ============================================================================
// ROUTINES WITHOUT A HOST IMPLEMENTATION
// ============================================================================

/// Library call whose routine has no host implementation.
#[derive(Debug, Clone, Default)]
pub struct LibraryCallThunk {
    operands: Vec<BufferSlice>,
    results: Vec<BufferSlice>,
}

impl LibraryCallThunk {
    /// Creates a call over `operands` producing `results`.
    pub fn new(operands: Vec<BufferSlice>, results: Vec<BufferSlice>) -> Self {
        Self { operands, results }
    }

    pub(crate) fn execute(&self, kind: ThunkKind, params: &ExecuteParams<'_>) -> Result<()> {
        tracing::error!(
            kind = %kind,
            device = %params.stream.device(),
            operands = self.operands.len(),
            results = self.results.len(),
            "No handler for library call"
        );
        Err(RuntimeError::UnsupportedKind(format!(
            "{} has no implementation on {}",
            kind,
            params.stream.device()
        )))
    }
}

// ============================================================================
// CUSTOM CALLS
// ============================================================================

/// Host implementation of a custom-call target: `(stream, operands,
/// results, opaque)`.
pub type CustomCallTarget =
    Arc<dyn Fn(&Stream, &[DeviceRegion], &[DeviceRegion], &str) -> Result<()> + Send + Sync>;

static CUSTOM_CALL_TARGETS: Lazy<RwLock<HashMap<String, CustomCallTarget>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers `target` process-wide under `name`, replacing any previous
/// registration.
pub fn register_custom_call<F>(name: impl Into<String>, target: F)
where
    F: Fn(&Stream, &[DeviceRegion], &[DeviceRegion], &str) -> Result<()> + Send + Sync + 'static,
{
    let name = name.into();
    tracing::debug!(target_name = %name, "Registered custom-call target");
    CUSTOM_CALL_TARGETS.write().insert(name, Arc::new(target));
}

/// Looks up a registered custom-call target.
pub fn lookup_custom_call(name: &str) -> Option<CustomCallTarget> {
    CUSTOM_CALL_TARGETS.read().get(name).cloned()
}

/// Call into a registered custom-call target, resolved at initialization.
pub struct CustomCallThunk {
    target_name: String,
    operands: Vec<BufferSlice>,
    results: Vec<BufferSlice>,
    opaque: String,
    resolved: Mutex<Option<CustomCallTarget>>,
}

impl CustomCallThunk {
    /// Creates a call to `target_name`.
    pub fn new(target_name: impl Into<String>, operands: Vec<BufferSlice>, results: Vec<BufferSlice>) -> Self {
        Self {
            target_name: target_name.into(),
            operands,
            results,
            opaque: String::new(),
            resolved: Mutex::new(None),
        }
    }

    /// Backend configuration string passed to the target.
    #[must_use]
    pub fn with_opaque(mut self, opaque: impl Into<String>) -> Self {
        self.opaque = opaque.into();
        self
    }

    /// Registered name of the target.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub(crate) fn initialize(&self, _params: &InitializeParams<'_>) -> Result<()> {
        let mut resolved = self.resolved.lock();
        if resolved.is_some() {
            return Ok(());
        }
        let target = lookup_custom_call(&self.target_name).ok_or_else(|| {
            RuntimeError::UnsupportedKind(format!(
                "custom-call target {} is not registered",
                self.target_name
            ))
        })?;
        *resolved = Some(target);
        Ok(())
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let target = self.resolved.lock().clone().ok_or_else(|| {
            RuntimeError::Internal(format!("custom-call target {} was not resolved", self.target_name))
        })?;
        let operands = self
            .operands
            .iter()
            .map(|s| params.region(s))
            .collect::<Result<Vec<_>>>()?;
        let results = self
            .results
            .iter()
            .map(|s| params.region(s))
            .collect::<Result<Vec<_>>>()?;
        params
            .stream
            .run_library("custom-call", || target(params.stream, &operands, &results, &self.opaque))
    }
}

impl fmt::Debug for CustomCallThunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCallThunk")
            .field("target_name", &self.target_name)
            .field("operands", &self.operands)
            .field("results", &self.results)
            .field("opaque", &self.opaque)
            .field("resolved", &self.resolved.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpurt_core::device::{BufferTable, ExecutableSource, StreamExecutor};

    #[test]
    fn test_gemm_with_bias_relu() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        // a: 2x2, b: 2x2, c: 2x2, bias: 2
        let table = BufferTable::with_sizes(&[16, 16, 16, 8]);
        table.whole(0).unwrap().write_from(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        table.whole(1).unwrap().write_from(&[1.0f32, 0.0, 0.0, 1.0]).unwrap();
        table.whole(3).unwrap().write_from(&[-10.0f32, 1.0]).unwrap();

        let thunk = GemmThunk::new(
            GemmParams::new(2, 2, 2),
            BufferSlice::new(0, 0, 16),
            BufferSlice::new(1, 0, 16),
            BufferSlice::new(2, 0, 16),
        )
        .with_epilogue(Epilogue::BiasRelu, Some(BufferSlice::new(3, 0, 8)));
        thunk.execute(&ExecuteParams::new(&table, &stream)).unwrap();
        assert_eq!(table.whole(2).unwrap().read_as::<f32>(), vec![0.0, 3.0, 0.0, 5.0]);
    }

    #[test]
    fn test_sort_with_values_descending() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let table = BufferTable::with_sizes(&[16, 16]);
        table.whole(0).unwrap().write_from(&[3i32, -1, 7, 0]).unwrap();
        table.whole(1).unwrap().write_from(&[0u32, 1, 2, 3]).unwrap();

        SortThunk::new(BufferSlice::new(0, 0, 16), SortKeyType::S32, 4)
            .with_values(BufferSlice::new(1, 0, 16))
            .descending()
            .execute(&ExecuteParams::new(&table, &stream))
            .unwrap();
        assert_eq!(table.whole(0).unwrap().read_as::<i32>(), vec![7, 3, 0, -1]);
        assert_eq!(table.whole(1).unwrap().read_as::<u32>(), vec![2, 0, 3, 1]);
    }

    #[test]
    fn test_cholesky_out_of_place() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let table = BufferTable::with_sizes(&[16, 16]);
        table.whole(0).unwrap().write_from(&[4.0f32, 2.0, 2.0, 5.0]).unwrap();

        CholeskyThunk::new(BufferSlice::new(0, 0, 16), BufferSlice::new(1, 0, 16), 2, 1, true)
            .execute(&ExecuteParams::new(&table, &stream))
            .unwrap();
        assert_eq!(table.whole(1).unwrap().read_as::<f32>(), vec![2.0, 0.0, 1.0, 2.0]);
        assert_eq!(table.whole(0).unwrap().read_as::<f32>(), vec![4.0, 2.0, 2.0, 5.0]);
    }

    #[test]
    fn test_unsupported_routine() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let table = BufferTable::with_sizes(&[4]);
        let err = LibraryCallThunk::default()
            .execute(ThunkKind::Convolution, &ExecuteParams::new(&table, &stream))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedKind(ref m) if m.contains("convolution")));
    }

    #[test]
    fn test_custom_call_resolution() {
        register_custom_call("test.negate", |_stream, operands, results, opaque| {
            assert_eq!(opaque, "cfg");
            let values: Vec<f32> = operands[0].read_as::<f32>().iter().map(|v| -v).collect();
            results[0].write_from(&values)
        });

        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let src = ExecutableSource::default();
        let table = BufferTable::with_sizes(&[8, 8]);
        table.whole(0).unwrap().write_from(&[1.0f32, -2.0]).unwrap();
        let init = InitializeParams::new(&executor, &src, &table, &stream);

        let thunk = CustomCallThunk::new(
            "test.negate",
            vec![BufferSlice::new(0, 0, 8)],
            vec![BufferSlice::new(1, 0, 8)],
        )
        .with_opaque("cfg");
        thunk.initialize(&init).unwrap();
        thunk.execute(&ExecuteParams::new(&table, &stream)).unwrap();
        assert_eq!(table.whole(1).unwrap().read_as::<f32>(), vec![-1.0, 2.0]);

        let unknown = CustomCallThunk::new("test.unknown", vec![], vec![]);
        assert!(matches!(
            unknown.initialize(&init),
            Err(RuntimeError::UnsupportedKind(_))
        ));
    }
}
