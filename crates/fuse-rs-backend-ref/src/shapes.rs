//! Output shape inference for the op kinds the reference compiler understands.

use fuse_rs::compile::CompileError;
use fuse_rs::graph::{Op, OpKind};

type Shape = Vec<i64>;

/// Shape of output 0 of `op`, or `None` when the kind is not inferred here
/// and the caller has to rely on the declared descriptor.
pub(crate) fn infer_output_shape(op: &Op, inputs: &[&[i64]]) -> Result<Option<Shape>, CompileError> {
    let shape = match op.kind {
        kind if kind.is_eltwise_unary() => arg(inputs, 0)?.to_vec(),
        kind if kind.is_eltwise_binary() => broadcast(op, arg(inputs, 0)?, arg(inputs, 1)?)?,
        OpKind::BiasAdd
        | OpKind::BatchNormInference
        | OpKind::LayerNorm
        | OpKind::SoftMax
        | OpKind::LogSoftmax
        | OpKind::PReLU
        | OpKind::Quantize
        | OpKind::Dequantize
        | OpKind::DynamicQuantize
        | OpKind::DynamicDequantize
        | OpKind::TypeCast
        | OpKind::Reorder => arg(inputs, 0)?.to_vec(),
        OpKind::Select => {
            let partial = broadcast(op, arg(inputs, 0)?, arg(inputs, 1)?)?;
            broadcast(op, &partial, arg(inputs, 2)?)?
        }
        OpKind::MatMul => matmul(op, arg(inputs, 0)?, arg(inputs, 1)?)?,
        OpKind::Convolution => convolution(op, arg(inputs, 0)?, arg(inputs, 1)?)?,
        OpKind::MaxPool | OpKind::AvgPool => pool(op, arg(inputs, 0)?)?,
        kind if kind.is_reduction() => reduce(op, arg(inputs, 0)?)?,
        OpKind::StaticReshape => reshape(op, arg(inputs, 0)?)?,
        OpKind::StaticTranspose => transpose(op, arg(inputs, 0)?)?,
        OpKind::Concat => concat(op, inputs)?,
        _ => return Ok(None),
    };
    Ok(Some(shape))
}

fn arg<'a>(inputs: &[&'a [i64]], index: usize) -> Result<&'a [i64], CompileError> {
    inputs.get(index).copied().ok_or(CompileError::ArityMismatch {
        what: "op input",
        expected: index + 1,
        found: inputs.len(),
    })
}

fn unsupported(op: &Op, reason: impl Into<String>) -> CompileError {
    CompileError::UnsupportedOp {
        kind: op.kind,
        reason: reason.into(),
    }
}

fn ints<'o>(op: &'o Op, name: &str) -> Result<Option<&'o [i64]>, CompileError> {
    match op.attr(name) {
        None => Ok(None),
        Some(value) => value
            .as_i64s()
            .map(Some)
            .ok_or_else(|| unsupported(op, format!("attribute `{name}` must be a list of integers"))),
    }
}

fn int(op: &Op, name: &str) -> Result<Option<i64>, CompileError> {
    match op.attr(name) {
        None => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| unsupported(op, format!("attribute `{name}` must be an integer"))),
    }
}

fn flag(op: &Op, name: &str) -> Result<bool, CompileError> {
    match op.attr(name) {
        None => Ok(false),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| unsupported(op, format!("attribute `{name}` must be a bool"))),
    }
}

/// Numpy broadcasting, aligned from the trailing dimension.
fn broadcast(op: &Op, lhs: &[i64], rhs: &[i64]) -> Result<Shape, CompileError> {
    let rank = lhs.len().max(rhs.len());
    let mut shape = vec![0; rank];
    for axis in 0..rank {
        let l = dim_from_end(lhs, rank - 1 - axis);
        let r = dim_from_end(rhs, rank - 1 - axis);
        shape[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) => {
                return Err(unsupported(
                    op,
                    format!("cannot broadcast {lhs:?} with {rhs:?}: {a} vs {b}"),
                ))
            }
        };
    }
    Ok(shape)
}

fn dim_from_end(shape: &[i64], offset: usize) -> i64 {
    if offset < shape.len() {
        shape[shape.len() - 1 - offset]
    } else {
        1
    }
}

fn matmul(op: &Op, lhs: &[i64], rhs: &[i64]) -> Result<Shape, CompileError> {
    if lhs.len() < 2 || rhs.len() < 2 {
        return Err(unsupported(op, "operands need rank 2 or more"));
    }
    let (lb, lm) = lhs.split_at(lhs.len() - 2);
    let (rb, rm) = rhs.split_at(rhs.len() - 2);
    let (m, k) = if flag(op, "transpose_a")? {
        (lm[1], lm[0])
    } else {
        (lm[0], lm[1])
    };
    let (k_rhs, n) = if flag(op, "transpose_b")? {
        (rm[1], rm[0])
    } else {
        (rm[0], rm[1])
    };
    if k != k_rhs {
        return Err(unsupported(
            op,
            format!("contraction dims differ: {k} vs {k_rhs}"),
        ));
    }
    let mut shape = broadcast(op, lb, rb)?;
    shape.extend([m, n]);
    Ok(shape)
}

/// Per spatial axis attribute, defaulting to `fill` when absent.
fn spatial(op: &Op, name: &str, axes: usize, fill: i64) -> Result<Vec<i64>, CompileError> {
    match ints(op, name)? {
        None => Ok(vec![fill; axes]),
        Some(values) if values.len() == axes => Ok(values.to_vec()),
        Some(values) => Err(unsupported(
            op,
            format!("attribute `{name}` has {} entries for {axes} spatial axes", values.len()),
        )),
    }
}

fn window_extent(op: &Op, input: i64, window: i64, stride: i64, dilation: i64, pad: i64) -> Result<i64, CompileError> {
    if stride <= 0 || dilation <= 0 {
        return Err(unsupported(op, "strides and dilations must be positive"));
    }
    let span = window
        .checked_sub(1)
        .and_then(|taps| dilation.checked_mul(taps))
        .and_then(|extent| extent.checked_add(1))
        .and_then(|effective| input.checked_add(pad)?.checked_sub(effective))
        .ok_or_else(|| unsupported(op, "window arithmetic overflows"))?;
    if span < 0 {
        return Err(unsupported(
            op,
            format!("window {window} does not fit input extent {input}"),
        ));
    }
    Ok(span / stride + 1)
}

/// NCX data with OIX weights.
fn convolution(op: &Op, data: &[i64], weights: &[i64]) -> Result<Shape, CompileError> {
    if data.len() < 3 || weights.len() != data.len() {
        return Err(unsupported(
            op,
            format!("expected NCX data and OIX weights, got {data:?} and {weights:?}"),
        ));
    }
    let axes = data.len() - 2;
    let groups = int(op, "groups")?.unwrap_or(1);
    let grouped_channels = weights[1]
        .checked_mul(groups)
        .filter(|_| groups > 0)
        .ok_or_else(|| unsupported(op, format!("invalid group count {groups}")))?;
    if data[1] != grouped_channels {
        return Err(unsupported(
            op,
            format!(
                "input channels {} do not match weights {} x groups {groups}",
                data[1], weights[1]
            ),
        ));
    }
    let strides = spatial(op, "strides", axes, 1)?;
    let dilations = spatial(op, "dilations", axes, 1)?;
    let pads_begin = spatial(op, "pads_begin", axes, 0)?;
    let pads_end = spatial(op, "pads_end", axes, 0)?;

    let mut shape = vec![data[0], weights[0]];
    for axis in 0..axes {
        shape.push(window_extent(
            op,
            data[axis + 2],
            weights[axis + 2],
            strides[axis],
            dilations[axis],
            pads_begin[axis] + pads_end[axis],
        )?);
    }
    Ok(shape)
}

fn pool(op: &Op, data: &[i64]) -> Result<Shape, CompileError> {
    if data.len() < 3 {
        return Err(unsupported(op, "pooling expects NCX data"));
    }
    let axes = data.len() - 2;
    let kernel = ints(op, "kernel")?
        .ok_or_else(|| unsupported(op, "missing `kernel` attribute"))?;
    if kernel.len() != axes {
        return Err(unsupported(op, "`kernel` rank does not match data"));
    }
    let strides = spatial(op, "strides", axes, 1)?;
    let pads_begin = spatial(op, "pads_begin", axes, 0)?;
    let pads_end = spatial(op, "pads_end", axes, 0)?;

    let mut shape = data[..2].to_vec();
    for axis in 0..axes {
        shape.push(window_extent(
            op,
            data[axis + 2],
            kernel[axis],
            strides[axis],
            1,
            pads_begin[axis] + pads_end[axis],
        )?);
    }
    Ok(shape)
}

fn normalize_axis(op: &Op, axis: i64, rank: usize) -> Result<usize, CompileError> {
    let rank = rank as i64;
    let normalized = if axis < 0 { axis + rank } else { axis };
    if (0..rank).contains(&normalized) {
        Ok(normalized as usize)
    } else {
        Err(unsupported(op, format!("axis {axis} is out of range for rank {rank}")))
    }
}

fn reduce(op: &Op, data: &[i64]) -> Result<Shape, CompileError> {
    let axes = ints(op, "axes")?
        .map(|axes| {
            axes.iter()
                .map(|axis| normalize_axis(op, *axis, data.len()))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_else(|| (0..data.len()).collect());
    let keep_dims = flag(op, "keep_dims")?;
    let shape = data
        .iter()
        .enumerate()
        .filter_map(|(axis, dim)| match (axes.contains(&axis), keep_dims) {
            (false, _) => Some(*dim),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    Ok(shape)
}

fn reshape(op: &Op, data: &[i64]) -> Result<Shape, CompileError> {
    let target = ints(op, "shape")?.ok_or_else(|| unsupported(op, "missing `shape` attribute"))?;
    let total: i64 = data.iter().product();
    let known: i64 = target.iter().filter(|dim| **dim >= 0).product();
    let holes = target.iter().filter(|dim| **dim < 0).count();
    let shape: Shape = match holes {
        0 => target.to_vec(),
        1 if known > 0 && total % known == 0 => target
            .iter()
            .map(|dim| if *dim < 0 { total / known } else { *dim })
            .collect(),
        _ => {
            return Err(unsupported(
                op,
                format!("cannot reshape {data:?} into {target:?}"),
            ))
        }
    };
    if shape.iter().product::<i64>() != total {
        return Err(unsupported(
            op,
            format!("cannot reshape {data:?} into {target:?}"),
        ));
    }
    Ok(shape)
}

fn transpose(op: &Op, data: &[i64]) -> Result<Shape, CompileError> {
    let order = ints(op, "order")?.ok_or_else(|| unsupported(op, "missing `order` attribute"))?;
    if order.len() != data.len() {
        return Err(unsupported(op, "`order` rank does not match data"));
    }
    let mut seen = vec![false; data.len()];
    let mut shape = Vec::with_capacity(data.len());
    for axis in order {
        let axis = normalize_axis(op, *axis, data.len())?;
        if std::mem::replace(&mut seen[axis], true) {
            return Err(unsupported(op, format!("axis {axis} appears twice in `order`")));
        }
        shape.push(data[axis]);
    }
    Ok(shape)
}

fn concat(op: &Op, inputs: &[&[i64]]) -> Result<Shape, CompileError> {
    let first = arg(inputs, 0)?;
    let axis = normalize_axis(op, int(op, "axis")?.unwrap_or(0), first.len())?;
    let mut shape = first.to_vec();
    for other in &inputs[1..] {
        let compatible = other.len() == first.len()
            && other
                .iter()
                .zip(first)
                .enumerate()
                .all(|(index, (a, b))| index == axis || a == b);
        if !compatible {
            return Err(unsupported(
                op,
                format!("cannot concatenate {first:?} with {other:?} on axis {axis}"),
            ));
        }
        shape[axis] += other[axis];
    }
    Ok(shape)
}
