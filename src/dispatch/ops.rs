//! Operator kinds and their compute strategies.
//!
//! [`Op`] is the closed set of operators the graph executor may hand to
//! [`Runtime::try_compute`](super::Runtime::try_compute). Each supported kind
//! maps to an [`OpStrategy`]; kinds without one are left to the caller.

use super::Runtime;
use crate::device::{DevicePtr, Driver, Stream};
use crate::kernels::elementwise::{self, RopeParams};
use crate::kernels::launch_map;
use crate::tensor::Tensor;

/// Tensor operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Add,
    Mul,
    Scale { factor: f32 },
    Gelu,
    Silu,
    Norm { eps: f32 },
    RmsNorm { eps: f32 },
    MulMat,
    Cpy,
    Dup,
    Reshape,
    View,
    Permute,
    Transpose,
    DiagMaskInf { n_past: usize },
    SoftMax,
    Rope {
        n_past: usize,
        n_dims: usize,
        mode: u32,
        freq_base: f32,
        freq_scale: f32,
    },
    GetRows,
    Sum,
    Sqr,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Scale { .. } => "scale",
            Self::Gelu => "gelu",
            Self::Silu => "silu",
            Self::Norm { .. } => "norm",
            Self::RmsNorm { .. } => "rms_norm",
            Self::MulMat => "mul_mat",
            Self::Cpy => "cpy",
            Self::Dup => "dup",
            Self::Reshape => "reshape",
            Self::View => "view",
            Self::Permute => "permute",
            Self::Transpose => "transpose",
            Self::DiagMaskInf { .. } => "diag_mask_inf",
            Self::SoftMax => "soft_max",
            Self::Rope { .. } => "rope",
            Self::GetRows => "get_rows",
            Self::Sum => "sum",
            Self::Sqr => "sqr",
        }
    }

    /// Whether the operator only reinterprets its source's memory.
    pub fn is_view(&self) -> bool {
        matches!(self, Self::Reshape | Self::View | Self::Permute | Self::Transpose)
    }

    /// The device strategy for this operator, if any.
    pub(crate) fn strategy(&self) -> Option<Box<dyn OpStrategy>> {
        let s: Box<dyn OpStrategy> = match *self {
            Self::Add => Box::new(Rowwise(Add)),
            Self::Mul => Box::new(Rowwise(Mul)),
            Self::Scale { factor } => Box::new(Rowwise(Scale { factor })),
            Self::Gelu => Box::new(Rowwise(Gelu)),
            Self::Silu => Box::new(Rowwise(Silu)),
            Self::Norm { eps } => Box::new(Rowwise(Norm { eps })),
            Self::RmsNorm { eps } => Box::new(Rowwise(RmsNorm { eps })),
            Self::SoftMax => Box::new(Rowwise(SoftMax)),
            Self::DiagMaskInf { n_past } => Box::new(Rowwise(DiagMaskInf { n_past })),
            Self::Rope {
                n_past,
                n_dims,
                mode,
                freq_base,
                freq_scale,
            } => Box::new(Rowwise(Rope {
                n_past,
                params: RopeParams {
                    n_dims,
                    mode,
                    freq_base,
                    freq_scale,
                },
            })),
            Self::MulMat => Box::new(MulMat),
            Self::Cpy | Self::Dup => Box::new(Copy),
            Self::Reshape | Self::View | Self::Permute | Self::Transpose => Box::new(NoOp),
            Self::GetRows | Self::Sum | Self::Sqr => return None,
        };
        Some(s)
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Device implementation of one operator kind.
pub(crate) trait OpStrategy {
    fn name(&self) -> &'static str;

    /// Run the operator. Unsupported type combinations panic.
    fn compute(&self, rt: &mut Runtime, src0: &Tensor, src1: Option<&Tensor>, dst: &mut Tensor);
}

// ---------------------------------------------------------------------------
// Row kernels
// ---------------------------------------------------------------------------

/// One invocation of a row kernel on staged f32 data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RowArgs {
    pub src0: DevicePtr,
    /// Second operand and its element count (broadcast by index modulo).
    pub src1: Option<(DevicePtr, usize)>,
    pub dst: DevicePtr,
    pub ncols: usize,
    pub nrows: usize,
    /// Outer iteration index over dimension 2.
    pub i02: usize,
    /// Rows per channel (`ne01`), for kernels that see flattened rows.
    pub rows_per_channel: usize,
}

/// A row-parallel f32 kernel driven by the shared staging path.
pub(crate) trait RowKernel {
    fn name(&self) -> &'static str;

    /// Rows of all outer dimensions are processed in one invocation.
    fn flatten_rows(&self) -> bool {
        true
    }

    fn uses_src1(&self) -> bool {
        false
    }

    fn launch(&self, driver: &dyn Driver, stream: Stream, args: &RowArgs);
}

struct Rowwise<K>(K);

impl<K: RowKernel> OpStrategy for Rowwise<K> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn compute(&self, rt: &mut Runtime, src0: &Tensor, src1: Option<&Tensor>, dst: &mut Tensor) {
        rt.run_rowwise(&self.0, src0, src1, dst);
    }
}

struct Add;
struct Mul;
struct Scale {
    factor: f32,
}
struct Gelu;
struct Silu;
struct Norm {
    eps: f32,
}
struct RmsNorm {
    eps: f32,
}
struct SoftMax;
struct DiagMaskInf {
    n_past: usize,
}
struct Rope {
    n_past: usize,
    params: RopeParams,
}

impl RowKernel for Add {
    fn name(&self) -> &'static str {
        "add"
    }
    fn uses_src1(&self) -> bool {
        true
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        launch_map(driver, stream, "add", a.src0, a.src1, a.dst, a.ncols * a.nrows, |x, y, out| {
            elementwise::add(x, y.unwrap_or(&[0.0]), out)
        });
    }
}

impl RowKernel for Mul {
    fn name(&self) -> &'static str {
        "mul"
    }
    fn uses_src1(&self) -> bool {
        true
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        launch_map(driver, stream, "mul", a.src0, a.src1, a.dst, a.ncols * a.nrows, |x, y, out| {
            elementwise::mul(x, y.unwrap_or(&[1.0]), out)
        });
    }
}

impl RowKernel for Scale {
    fn name(&self) -> &'static str {
        "scale"
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        let factor = self.factor;
        launch_map(driver, stream, "scale", a.src0, None, a.dst, a.ncols * a.nrows, move |x, _, out| {
            elementwise::scale(x, factor, out)
        });
    }
}

impl RowKernel for Gelu {
    fn name(&self) -> &'static str {
        "gelu"
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        launch_map(driver, stream, "gelu", a.src0, None, a.dst, a.ncols * a.nrows, |x, _, out| {
            elementwise::gelu(x, out)
        });
    }
}

impl RowKernel for Silu {
    fn name(&self) -> &'static str {
        "silu"
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        launch_map(driver, stream, "silu", a.src0, None, a.dst, a.ncols * a.nrows, |x, _, out| {
            elementwise::silu(x, out)
        });
    }
}

impl RowKernel for Norm {
    fn name(&self) -> &'static str {
        "norm"
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        let (eps, ncols) = (self.eps, a.ncols);
        launch_map(driver, stream, "norm", a.src0, None, a.dst, a.ncols * a.nrows, move |x, _, out| {
            elementwise::norm(x, ncols, eps, out)
        });
    }
}

impl RowKernel for RmsNorm {
    fn name(&self) -> &'static str {
        "rms_norm"
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        let (eps, ncols) = (self.eps, a.ncols);
        launch_map(driver, stream, "rms_norm", a.src0, None, a.dst, a.ncols * a.nrows, move |x, _, out| {
            elementwise::rms_norm(x, ncols, eps, out)
        });
    }
}

impl RowKernel for SoftMax {
    fn name(&self) -> &'static str {
        "soft_max"
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        let ncols = a.ncols;
        launch_map(driver, stream, "soft_max", a.src0, None, a.dst, a.ncols * a.nrows, move |x, _, out| {
            elementwise::soft_max(x, ncols, out)
        });
    }
}

impl RowKernel for DiagMaskInf {
    fn name(&self) -> &'static str {
        "diag_mask_inf"
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        let (ncols, per_channel, n_past) = (a.ncols, a.rows_per_channel, self.n_past);
        launch_map(driver, stream, "diag_mask_inf", a.src0, None, a.dst, a.ncols * a.nrows, move |x, _, out| {
            elementwise::diag_mask_inf(x, ncols, per_channel, n_past, out)
        });
    }
}

impl RowKernel for Rope {
    fn name(&self) -> &'static str {
        "rope"
    }
    fn flatten_rows(&self) -> bool {
        false
    }
    fn launch(&self, driver: &dyn Driver, stream: Stream, a: &RowArgs) {
        // Bit 0 of the mode pins every row to `n_past`.
        let pos = if self.params.mode & 1 == 0 {
            self.n_past + a.i02
        } else {
            self.n_past
        };
        let (ncols, params) = (a.ncols, self.params);
        launch_map(driver, stream, "rope", a.src0, None, a.dst, a.ncols * a.nrows, move |x, _, out| {
            elementwise::rope(x, ncols, pos, &params, out)
        });
    }
}

// ---------------------------------------------------------------------------
// Other strategies
// ---------------------------------------------------------------------------

struct MulMat;

impl OpStrategy for MulMat {
    fn name(&self) -> &'static str {
        "mul_mat"
    }

    fn compute(&self, rt: &mut Runtime, src0: &Tensor, src1: Option<&Tensor>, dst: &mut Tensor) {
        let src1 = src1.unwrap_or_else(|| panic!("mul_mat: missing src1"));
        rt.mul_mat(src0, src1, dst);
    }
}

struct Copy;

impl OpStrategy for Copy {
    fn name(&self) -> &'static str {
        "cpy"
    }

    fn compute(&self, rt: &mut Runtime, src0: &Tensor, _src1: Option<&Tensor>, dst: &mut Tensor) {
        rt.run_copy(src0, dst);
    }
}

/// Views share their source's memory; nothing runs on the device.
struct NoOp;

impl OpStrategy for NoOp {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compute(&self, _rt: &mut Runtime, _src0: &Tensor, _src1: Option<&Tensor>, _dst: &mut Tensor) {}
}
