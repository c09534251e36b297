//! Reusable decision functions for op nodes.

use crate::graph::{AttrValue, DType, OpView};

pub fn input_dtype(port: usize, dtype: DType) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| view.input(port).is_some_and(|tensor| tensor.dtype == dtype)
}

pub fn input_dtype_in(
    port: usize,
    dtypes: &'static [DType],
) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| {
        view.input(port)
            .is_some_and(|tensor| dtypes.contains(&tensor.dtype))
    }
}

pub fn output_dtype_in(
    port: usize,
    dtypes: &'static [DType],
) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| {
        view.output(port)
            .is_some_and(|tensor| dtypes.contains(&tensor.dtype))
    }
}

/// Every input is `dtype`; an op without inputs fails.
pub fn all_inputs_dtype(dtype: DType) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| view.num_inputs() > 0 && view.inputs().all(|tensor| tensor.dtype == dtype)
}

pub fn has_attr(name: &'static str) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| view.attr(name).is_some()
}

pub fn attr_eq(name: &'static str, expected: AttrValue) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| view.attr(name) == Some(&expected)
}

pub fn num_inputs_in(min: usize, max: usize) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| (min..=max).contains(&view.num_inputs())
}

/// The output at `port` feeds at most `limit` consumers.
pub fn output_consumers_at_most(
    port: usize,
    limit: usize,
) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| view.output_consumers(port).len() <= limit
}

/// Input `port` is a graph input rather than the output of another op.
pub fn input_is_external(port: usize) -> impl Fn(&OpView<'_>) -> bool + Send + Sync {
    move |view| view.producer_of_input(port).is_none()
}
