//! Walking several variables of different orders with one loop.

use itertools::Itertools;

use super::GenerateError;
use crate::loom::{axis::Axis, placeholder::Placeholder, variable::Variable};

/// A merged axis sequence shared by an output and its operands.
#[derive(Debug, Clone)]
pub struct IterationOrder {
    /// Unified axes; `None` marks padding.
    pub axes: Vec<Option<Axis>>,
    /// Loop extent along each unified axis.
    pub shape: Vec<Placeholder>,
    /// Per operand, output first: the stride along each unified axis. Broadcast axes get 0.
    pub strides: Vec<Vec<Placeholder>>,
}

impl IterationOrder {
    #[inline]
    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    pub fn size(&self) -> Placeholder {
        self.shape
            .iter()
            .fold(Placeholder::Concrete(1), |acc, x| acc * x.clone())
    }
}

/// Merges the orders of `output` and `inputs`.
///
/// The output's order comes first, followed by axes only found in the inputs, taken from inputs
/// of higher rank first. With a `ceiling`, the result is padded with neutral entries up to that
/// rank and fails if it is already beyond.
pub fn unify(
    output: &Variable,
    inputs: &[&Variable],
    ceiling: Option<usize>,
) -> Result<IterationOrder, GenerateError> {
    let mut axes = output.order().iter().cloned().collect_vec();
    let mut shape = output.shape().to_vec();
    for x in inputs.iter().sorted_by_key(|x| std::cmp::Reverse(x.rank())) {
        for (axis, size) in x.order().iter().zip_eq(x.shape()) {
            if !axes.contains(axis) {
                axes.push(axis.clone());
                shape.push(size.clone());
            }
        }
    }

    let strides = std::iter::once(output)
        .chain(inputs.iter().copied())
        .map(|x| {
            axes.iter()
                .zip_eq(&shape)
                .map(|(axis, extent)| match x.shape_of(axis) {
                    Some(size) if *size == 1usize && *extent != 1usize => Placeholder::Concrete(0),
                    Some(_) => x.stride_of(axis).unwrap_or_default(),
                    None => Placeholder::Concrete(0),
                })
                .collect_vec()
        })
        .collect_vec();

    let mut order = IterationOrder {
        axes: axes.into_iter().map(Some).collect(),
        shape,
        strides,
    };
    if let Some(ceiling) = ceiling {
        check_rank(order.rank(), ceiling)?;
        order.axes.resize(ceiling, None);
        order.shape = pad(&order.shape, ceiling, 1)?;
        for stride in order.strides.iter_mut() {
            *stride = pad(stride, ceiling, 1)?;
        }
    }
    Ok(order)
}

fn check_rank(rank: usize, ceiling: usize) -> Result<(), GenerateError> {
    match rank <= ceiling {
        true => Ok(()),
        false => Err(GenerateError::ResourceLimitExceeded {
            reason: format!("iteration rank {rank} exceeds the ceiling of {ceiling}"),
        }),
    }
}

/// Appends `neutral` entries up to `ceiling`.
pub fn pad(values: &[Placeholder], ceiling: usize, neutral: usize) -> Result<Vec<Placeholder>, GenerateError> {
    check_rank(values.len(), ceiling)?;
    let mut values = values.to_vec();
    values.resize(ceiling, Placeholder::Concrete(neutral));
    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{pad, unify};
    use crate::{
        hal::GenerateError,
        loom::{axis::Axis, placeholder::Placeholder, variable::Variable},
        order,
    };

    fn values(x: &[Placeholder]) -> Vec<Option<usize>> {
        x.iter().map(Placeholder::value).collect()
    }

    #[test]
    fn test_unify() -> Result<(), Box<dyn Error>> {
        let y = Variable::new([2usize, 3, 4], order![Axis::N, Axis::H, Axis::C])?;
        let x0 = Variable::new([4usize, 3], order![Axis::C, Axis::H])?;
        let x1 = Variable::new([2usize, 1, 4], order![Axis::N, Axis::H, Axis::C])?;

        let order = unify(&y, &[&x0, &x1], None)?;
        assert_eq!(order.rank(), 3);
        assert_eq!(values(&order.shape), [Some(2), Some(3), Some(4)]);
        assert_eq!(values(&order.strides[0]), [Some(12), Some(4), Some(1)]);
        assert_eq!(values(&order.strides[1]), [Some(0), Some(1), Some(3)]);
        assert_eq!(values(&order.strides[2]), [Some(4), Some(0), Some(1)]);
        assert_eq!(order.size(), Placeholder::Concrete(24));

        let order = unify(&y, &[&x0, &x1], Some(4))?;
        assert_eq!(order.axes.last(), Some(&None));
        assert_eq!(values(&order.shape), [Some(2), Some(3), Some(4), Some(1)]);
        assert_eq!(values(&order.strides[1]), [Some(0), Some(1), Some(3), Some(1)]);
        Ok(())
    }

    #[test]
    fn test_extra_axes() -> Result<(), Box<dyn Error>> {
        let y = Variable::new([3usize], order![Axis::C])?;
        let x0 = Variable::new([5usize, 3], order![Axis::W, Axis::C])?;
        let x1 = Variable::new([2usize, 5, 3], order![Axis::N, Axis::W, Axis::C])?;

        // the rank-3 operand contributes its axes first
        let order = unify(&y, &[&x0, &x1], None)?;
        let axes: Vec<_> = order.axes.iter().flatten().cloned().collect();
        assert_eq!(axes, [Axis::C, Axis::N, Axis::W]);
        assert_eq!(values(&order.strides[0]), [Some(1), Some(0), Some(0)]);
        Ok(())
    }

    #[test]
    fn test_rank_ceiling() -> Result<(), Box<dyn Error>> {
        let y = Variable::new([2usize, 2, 2, 2, 2], order![Axis::N, Axis::C, Axis::H, Axis::W, Axis::T])?;
        assert!(matches!(
            unify(&y, &[&y], Some(4)),
            Err(GenerateError::ResourceLimitExceeded { .. })
        ));
        assert_eq!(unify(&y, &[&y], None)?.rank(), 5);
        assert!(pad(&[Placeholder::Concrete(2)], 0, 1).is_err());
        let padded = pad(&[Placeholder::Concrete(2)], 3, 0)?;
        assert_eq!(values(&padded), [Some(2), Some(0), Some(0)]);
        Ok(())
    }
}
