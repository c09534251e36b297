use std::fmt;

use serde::{Deserialize, Serialize};

/// Marker for a dimension whose extent is not known yet.
pub const DIM_UNKNOWN: i64 = -1;

/// Stable identifier of a logical tensor within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Element type of a logical tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    Bf16,
    F64,
    S8,
    U8,
    S32,
    S64,
    Boolean,
    Undef,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F64 | DType::S64 => 8,
            DType::F32 | DType::S32 => 4,
            DType::F16 | DType::Bf16 => 2,
            DType::S8 | DType::U8 | DType::Boolean => 1,
            DType::Undef => 0,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::Bf16 | DType::F64)
    }

    /// Integer types used for quantized storage.
    pub fn is_quantized(self) -> bool {
        matches!(self, DType::S8 | DType::U8)
    }
}

/// Memory layout of a logical tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Not decided yet; the compiler picks one.
    Undef,
    /// Explicit strides in elements, one per dimension.
    Strided(Vec<i64>),
    /// Any layout the compiler prefers.
    Any,
    /// Backend-private layout tag.
    Opaque(u64),
}

impl Layout {
    /// Returns true once the layout no longer needs a decision from the compiler.
    pub fn is_concrete(&self) -> bool {
        matches!(self, Layout::Strided(_) | Layout::Opaque(_))
    }
}

/// Row-major strides for `shape`, or `None` if any dimension is unknown.
pub fn contiguous_strides(shape: &[i64]) -> Option<Vec<i64>> {
    if shape.iter().any(|dim| *dim < 0) {
        return None;
    }
    let mut strides = vec![1i64; shape.len()];
    let mut acc = 1i64;
    for (index, dim) in shape.iter().enumerate().rev() {
        strides[index] = acc;
        acc = acc.saturating_mul((*dim).max(1));
    }
    Some(strides)
}

/// Descriptor of a value flowing between ops: identity plus element type, shape and layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalTensor {
    pub id: TensorId,
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub layout: Layout,
}

impl LogicalTensor {
    pub fn new(id: TensorId, dtype: DType, shape: impl Into<Vec<i64>>) -> Self {
        LogicalTensor {
            id,
            dtype,
            shape: shape.into(),
            layout: Layout::Undef,
        }
    }

    /// Builds a tensor with row-major strides when the shape is fully known.
    pub fn strided(id: TensorId, dtype: DType, shape: impl Into<Vec<i64>>) -> Self {
        let shape = shape.into();
        let layout = contiguous_strides(&shape)
            .map(Layout::Strided)
            .unwrap_or(Layout::Undef);
        LogicalTensor {
            id,
            dtype,
            shape,
            layout,
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_shape_known(&self) -> bool {
        self.shape.iter().all(|dim| *dim >= 0)
    }

    pub fn element_count(&self) -> Option<i64> {
        if !self.is_shape_known() {
            return None;
        }
        Some(self.shape.iter().product())
    }

    pub fn size_in_bytes(&self) -> Option<usize> {
        let elements = usize::try_from(self.element_count()?).ok()?;
        Some(elements.saturating_mul(self.dtype.size_in_bytes()))
    }
}
