use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::tensor::TensorId;

/// Attribute key carrying the fused-op kind on a node produced by the rewriter.
pub const FUSED_KIND_ATTR: &str = "fused_kind";
/// Attribute key listing the member op kinds of a fused node, in topological order.
pub const FUSED_OPS_ATTR: &str = "fused_ops";

/// Stable identifier of an op within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

macro_rules! op_kinds {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Kind of a graph operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum OpKind {
            $($variant),+
        }

        impl OpKind {
            /// Every kind, in declaration order.
            pub const ALL: &'static [OpKind] = &[$(OpKind::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(OpKind::$variant => $name),+
                }
            }

            pub fn from_name(name: &str) -> Option<OpKind> {
                match name {
                    $($name => Some(OpKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

op_kinds! {
    Abs => "Abs",
    Add => "Add",
    AvgPool => "AvgPool",
    BatchNormInference => "BatchNormInference",
    BiasAdd => "BiasAdd",
    Clamp => "Clamp",
    Concat => "Concat",
    Convolution => "Convolution",
    ConvTranspose => "ConvTranspose",
    Dequantize => "Dequantize",
    Divide => "Divide",
    DynamicDequantize => "DynamicDequantize",
    DynamicQuantize => "DynamicQuantize",
    Elu => "Elu",
    End => "End",
    Exp => "Exp",
    Gelu => "GELU",
    HardSigmoid => "HardSigmoid",
    HardSwish => "HardSwish",
    Interpolate => "Interpolate",
    LayerNorm => "LayerNorm",
    LeakyReLU => "LeakyReLU",
    Log => "Log",
    LogSoftmax => "LogSoftmax",
    MatMul => "MatMul",
    Maximum => "Maximum",
    MaxPool => "MaxPool",
    Minimum => "Minimum",
    Mish => "Mish",
    Multiply => "Multiply",
    Pow => "Pow",
    PReLU => "PReLU",
    Quantize => "Quantize",
    ReduceMax => "ReduceMax",
    ReduceMean => "ReduceMean",
    ReduceMin => "ReduceMin",
    ReduceSum => "ReduceSum",
    ReLU => "ReLU",
    Reorder => "Reorder",
    Round => "Round",
    Select => "Select",
    Sigmoid => "Sigmoid",
    SoftMax => "SoftMax",
    SoftPlus => "SoftPlus",
    Sqrt => "Sqrt",
    Square => "Square",
    StaticReshape => "StaticReshape",
    StaticTranspose => "StaticTranspose",
    Subtract => "Subtract",
    Tanh => "Tanh",
    TypeCast => "TypeCast",
    Wildcard => "Wildcard",
    FusedOp => "FusedOp",
}

impl OpKind {
    /// Elementwise ops with a single data input.
    pub const ELTWISE_UNARY: &'static [OpKind] = &[
        OpKind::Abs,
        OpKind::Clamp,
        OpKind::Elu,
        OpKind::Exp,
        OpKind::Gelu,
        OpKind::HardSigmoid,
        OpKind::HardSwish,
        OpKind::LeakyReLU,
        OpKind::Log,
        OpKind::Mish,
        OpKind::ReLU,
        OpKind::Round,
        OpKind::Sigmoid,
        OpKind::SoftPlus,
        OpKind::Sqrt,
        OpKind::Square,
        OpKind::Tanh,
    ];

    /// Elementwise ops with two broadcastable data inputs.
    pub const ELTWISE_BINARY: &'static [OpKind] = &[
        OpKind::Add,
        OpKind::Divide,
        OpKind::Maximum,
        OpKind::Minimum,
        OpKind::Multiply,
        OpKind::Pow,
        OpKind::Subtract,
    ];

    pub fn is_eltwise_unary(self) -> bool {
        Self::ELTWISE_UNARY.contains(&self)
    }

    pub fn is_eltwise_binary(self) -> bool {
        Self::ELTWISE_BINARY.contains(&self)
    }

    /// Binary ops whose two data inputs may be swapped without changing the result.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            OpKind::Add | OpKind::Multiply | OpKind::Maximum | OpKind::Minimum
        )
    }

    pub fn is_reduction(self) -> bool {
        matches!(
            self,
            OpKind::ReduceMax | OpKind::ReduceMean | OpKind::ReduceMin | OpKind::ReduceSum
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute value attached to an op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    F32(f32),
    I64(i64),
    Bool(bool),
    Str(String),
    F32s(Vec<f32>),
    I64s(Vec<i64>),
    Bools(Vec<bool>),
    Strs(Vec<String>),
}

impl AttrValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            AttrValue::F32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64s(&self) -> Option<&[i64]> {
        match self {
            AttrValue::I64s(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_strs(&self) -> Option<&[String]> {
        match self {
            AttrValue::Strs(values) => Some(values),
            _ => None,
        }
    }
}

macro_rules! attr_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(impl From<$ty> for AttrValue {
            fn from(value: $ty) -> Self {
                AttrValue::$variant(value.into())
            }
        })+
    };
}

attr_from! {
    f32 => F32,
    i64 => I64,
    bool => Bool,
    String => Str,
    &str => Str,
    Vec<f32> => F32s,
    Vec<i64> => I64s,
    Vec<bool> => Bools,
    Vec<String> => Strs,
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// A single node of the computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub kind: OpKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub attrs: Attributes,
}

impl Op {
    pub fn new(id: OpId, kind: OpKind) -> Self {
        Op {
            id,
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Attributes::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = TensorId>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = TensorId>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Fused-op kind when this node was produced by a fusion rewrite.
    pub fn fused_kind(&self) -> Option<&str> {
        if self.kind != OpKind::FusedOp {
            return None;
        }
        self.attr(FUSED_KIND_ATTR).and_then(AttrValue::as_str)
    }
}
