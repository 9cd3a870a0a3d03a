use derive_more::Display;
use itertools::Itertools;
use serde::Serialize;

use super::{
    LoomError,
    axis::{Axis, Order},
    placeholder::Placeholder,
    variable::{Attribute, Variable},
};

/// The closed set of operator kinds, used as the key of every backend's dispatch table.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OpKind {
    #[display("add")]
    Add,
    #[display("mul")]
    Mul,
    #[display("greater")]
    Greater,
    #[display("greater_equal")]
    GreaterEqual,
    #[display("scalar_affine")]
    ScalarAffine,
    #[display("select")]
    Select,
    #[display("tile")]
    Tile,
    #[display("slice")]
    Slice,
    #[display("reinterpret_axis")]
    ReinterpretAxis,
    #[display("resize_2d")]
    Resize2D,
}

impl OpKind {
    pub const ALL: [OpKind; 10] = [
        OpKind::Add,
        OpKind::Mul,
        OpKind::Greater,
        OpKind::GreaterEqual,
        OpKind::ScalarAffine,
        OpKind::Select,
        OpKind::Tile,
        OpKind::Slice,
        OpKind::ReinterpretAxis,
        OpKind::Resize2D,
    ];

    /// Operators computing each output element from the input elements at the same coordinate.
    pub fn is_elementwise(self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::Mul
                | OpKind::Greater
                | OpKind::GreaterEqual
                | OpKind::ScalarAffine
                | OpKind::Select
        )
    }
}

/// A pure graph node with immutable parameters.
///
/// Per-axis parameters (`Tile`, `Slice`) follow the axis sequence of the input's order.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Add,
    Mul,
    Greater,
    GreaterEqual,
    /// `x * scale + bias`.
    ScalarAffine { scale: f32, bias: f32 },
    /// `x0 != 0 ? x1 : x2`.
    Select,
    Tile { multiplier: Vec<usize> },
    /// Half-open ranges `begin..end` walked with a positive `stride`.
    Slice {
        begin: Vec<usize>,
        end: Vec<usize>,
        stride: Vec<usize>,
    },
    /// Renames the axes of `x` without touching its data.
    ReinterpretAxis { in_order: Order, out_order: Order },
    /// Nearest-neighbor resize of two axes.
    Resize2D {
        axis1: Axis,
        size1: usize,
        axis2: Axis,
        size2: usize,
    },
}

impl Operator {
    pub fn kind(&self) -> OpKind {
        match self {
            Operator::Add => OpKind::Add,
            Operator::Mul => OpKind::Mul,
            Operator::Greater => OpKind::Greater,
            Operator::GreaterEqual => OpKind::GreaterEqual,
            Operator::ScalarAffine { .. } => OpKind::ScalarAffine,
            Operator::Select => OpKind::Select,
            Operator::Tile { .. } => OpKind::Tile,
            Operator::Slice { .. } => OpKind::Slice,
            Operator::ReinterpretAxis { .. } => OpKind::ReinterpretAxis,
            Operator::Resize2D { .. } => OpKind::Resize2D,
        }
    }

    pub fn input_names(&self) -> &'static [&'static str] {
        match self.kind() {
            OpKind::Add | OpKind::Mul | OpKind::Greater | OpKind::GreaterEqual => &["x0", "x1"],
            OpKind::Select => &["x0", "x1", "x2"],
            _ => &["x"],
        }
    }

    #[inline]
    pub fn output_name(&self) -> &'static str {
        "y"
    }

    fn mismatch(&self, inputs: &[&Variable], reason: impl Into<String>) -> LoomError {
        LoomError::ShapeOrOrderMismatch {
            op: self.kind(),
            reason: reason.into(),
            inputs: inputs.iter().map(ToString::to_string).collect(),
        }
    }

    /// Infers the output variable from the inputs, checking the operator's contract.
    pub fn infer(&self, inputs: &[&Variable]) -> Result<Variable, LoomError> {
        let expected = self.input_names().len();
        if inputs.len() != expected {
            return Err(LoomError::Arity {
                op: self.kind(),
                expected,
                found: inputs.len(),
            });
        }

        let x = inputs[0];
        match self {
            Operator::Add
            | Operator::Mul
            | Operator::Greater
            | Operator::GreaterEqual
            | Operator::Select => self.broadcast(inputs),
            Operator::ScalarAffine { .. } => {
                let y = Variable::new(x.shape().to_vec(), x.order().clone())?;
                Ok(tensorwise(y, |_| true))
            }
            Operator::Tile { multiplier } => {
                if multiplier.len() != x.rank() {
                    return Err(self.mismatch(inputs, "multiplier rank differs from input rank"));
                }
                if multiplier.contains(&0) {
                    return Err(self.mismatch(inputs, "multiplier must be positive"));
                }
                let shape = x
                    .shape()
                    .iter()
                    .zip_eq(multiplier)
                    .map(|(size, &m)| size.clone() * m)
                    .collect_vec();
                Variable::new(shape, x.order().clone())
            }
            Operator::Slice { begin, end, stride } => {
                let rank = x.rank();
                if begin.len() != rank || end.len() != rank || stride.len() != rank {
                    return Err(self.mismatch(inputs, "slice ranges do not cover every axis"));
                }
                let mut shape = vec![];
                for (index, size) in x.shape().iter().enumerate() {
                    let (begin, end, stride) = (begin[index], end[index], stride[index]);
                    if stride == 0 || begin >= end {
                        return Err(self.mismatch(inputs, format!("empty range on axis {index}")));
                    }
                    if size.value().is_some_and(|size| end > size) {
                        return Err(self.mismatch(inputs, format!("range out of bound on axis {index}")));
                    }
                    shape.push((end - begin).div_ceil(stride));
                }
                Variable::new(shape, x.order().clone())
            }
            Operator::ReinterpretAxis {
                in_order,
                out_order,
            } => {
                if in_order.len() != out_order.len() {
                    return Err(self.mismatch(inputs, "reinterpreting must not change rank"));
                }
                if x.order() != in_order {
                    return Err(self.mismatch(inputs, format!("expected input order {in_order}")));
                }
                Variable::new(x.shape().to_vec(), out_order.clone())
            }
            Operator::Resize2D {
                axis1,
                size1,
                axis2,
                size2,
            } => {
                if axis1 == axis2 {
                    return Err(self.mismatch(inputs, "resized axes must be distinct"));
                }
                if *size1 == 0 || *size2 == 0 {
                    return Err(self.mismatch(inputs, "resized sizes must be positive"));
                }
                let (Some(index1), Some(index2)) = (x.order().index_of(axis1), x.order().index_of(axis2))
                else {
                    return Err(self.mismatch(inputs, format!("input lacks axis {axis1} or {axis2}")));
                };
                let mut shape = x.shape().to_vec();
                shape[index1] = Placeholder::Concrete(*size1);
                shape[index2] = Placeholder::Concrete(*size2);
                let y = Variable::new(shape, x.order().clone())?;
                Ok(tensorwise(y, |axis| axis != axis1 && axis != axis2))
            }
        }
    }

    /// Output axes are gathered from inputs visited by decreasing rank.
    fn broadcast(&self, inputs: &[&Variable]) -> Result<Variable, LoomError> {
        let mut axes: Vec<Axis> = vec![];
        let mut shape: Vec<Placeholder> = vec![];
        for x in inputs.iter().sorted_by_key(|x| std::cmp::Reverse(x.rank())) {
            for (axis, size) in x.order().iter().zip_eq(x.shape()) {
                match axes.iter().position(|a| a == axis) {
                    Some(index) if shape[index] == *size || *size == 1usize => {}
                    Some(index) if shape[index] == 1usize => shape[index] = size.clone(),
                    Some(_) => {
                        return Err(self.mismatch(inputs, format!("sizes disagree on axis {axis}")));
                    }
                    None => {
                        axes.push(axis.clone());
                        shape.push(size.clone());
                    }
                }
            }
        }
        let y = Variable::new(shape, Order::new(axes)?)?;
        Ok(tensorwise(y, |_| true))
    }

    /// Folding is declared for every operator, but only applies to concrete outputs.
    #[inline]
    pub fn can_fold(&self, output: &Variable) -> bool {
        output.is_concrete()
    }

    /// Computes the output data from concrete inputs.
    pub fn evaluate(
        &self,
        inputs: &[(&Variable, &[f32])],
        output: &Variable,
    ) -> Result<Vec<f32>, LoomError> {
        let shape = output.concrete_shape()?;
        let order = output.order();
        let modulo = |_: &Axis, coord: usize, size: usize, _: usize| coord % size;

        match self {
            Operator::ReinterpretAxis { .. } => Ok(inputs[0].1.to_vec()),
            Operator::Tile { .. } => gather(&shape, order, inputs[0], modulo),
            Operator::Slice { begin, stride, .. } => {
                let x = inputs[0].0;
                gather(&shape, order, inputs[0], |axis, coord, _, _| {
                    let index = x.order().index_of(axis).unwrap_or_default();
                    begin[index] + coord * stride[index]
                })
            }
            Operator::Resize2D { axis1, axis2, .. } => {
                gather(&shape, order, inputs[0], |axis, coord, size, out| {
                    match axis == axis1 || axis == axis2 {
                        true => coord * size / out,
                        false => coord,
                    }
                })
            }
            _ => {
                let columns: Vec<Vec<f32>> = inputs
                    .iter()
                    .map(|&input| gather(&shape, order, input, modulo))
                    .collect::<Result<_, _>>()?;
                let len = shape.iter().product::<usize>();
                let output = (0..len)
                    .map(|index| {
                        let x = |k: usize| columns[k][index];
                        match self {
                            Operator::Add => x(0) + x(1),
                            Operator::Mul => x(0) * x(1),
                            Operator::Greater => f32::from(u8::from(x(0) > x(1))),
                            Operator::GreaterEqual => f32::from(u8::from(x(0) >= x(1))),
                            Operator::ScalarAffine { scale, bias } => x(0) * scale + bias,
                            Operator::Select => match x(0) != 0.0 {
                                true => x(1),
                                false => x(2),
                            },
                            _ => unreachable!(),
                        }
                    })
                    .collect();
                Ok(output)
            }
        }
    }

    /// Substitutes the axes named in the parameters.
    pub fn map_axes(&self, f: impl Fn(&Axis) -> Axis) -> Result<Operator, LoomError> {
        let op = match self {
            Operator::ReinterpretAxis {
                in_order,
                out_order,
            } => Operator::ReinterpretAxis {
                in_order: in_order.map(&f)?,
                out_order: out_order.map(&f)?,
            },
            Operator::Resize2D {
                axis1,
                size1,
                axis2,
                size2,
            } => Operator::Resize2D {
                axis1: f(axis1),
                size1: *size1,
                axis2: f(axis2),
                size2: *size2,
            },
            op => op.clone(),
        };
        Ok(op)
    }
}

fn tensorwise(mut y: Variable, filter: impl Fn(&Axis) -> bool) -> Variable {
    let axes = y.order().iter().filter(|axis| filter(axis)).cloned().collect_vec();
    for axis in axes {
        y.attributes_mut().insert(Attribute::Tensorwise(axis));
    }
    y
}

/// Reads `input` at the coordinate computed by `map` for every output element.
///
/// `map` receives the axis, the output coordinate, the input size and the output size along it.
/// Axes absent from the output contribute nothing to the input index.
fn gather(
    shape: &[usize],
    order: &Order,
    (input, data): (&Variable, &[f32]),
    map: impl Fn(&Axis, usize, usize, usize) -> usize,
) -> Result<Vec<f32>, LoomError> {
    let input_shape = input.concrete_shape()?;
    let input_size = input_shape.iter().product::<usize>();
    if data.len() != input_size {
        return Err(LoomError::DataLength {
            expected: input_size,
            found: data.len(),
        });
    }

    let mut input_stride = vec![1usize; input_shape.len()];
    for index in (0..input_shape.len().saturating_sub(1)).rev() {
        input_stride[index] = input_stride[index + 1] * input_shape[index + 1];
    }
    let lookup = order.iter().map(|axis| input.order().index_of(axis)).collect_vec();

    let size = shape.iter().product::<usize>();
    let mut coords = vec![0usize; shape.len()];
    let mut output = Vec::with_capacity(size);
    for _ in 0..size {
        let mut index = 0;
        for (position, axis) in order.iter().enumerate() {
            if let Some(k) = lookup[position] {
                index += map(axis, coords[position], input_shape[k], shape[position]) * input_stride[k];
            }
        }
        let value = data.get(index).ok_or(LoomError::DataLength {
            expected: index + 1,
            found: data.len(),
        })?;
        output.push(*value);

        for d in (0..coords.len()).rev() {
            coords[d] += 1;
            if coords[d] < shape[d] {
                break;
            }
            coords[d] = 0;
        }
    }
    Ok(output)
}
