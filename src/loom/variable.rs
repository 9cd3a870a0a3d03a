use std::sync::Arc;

use derive_more::Deref;
use itertools::Itertools;
use serde::Serialize;

use super::{
    LoomError,
    axis::{Axis, Order},
    placeholder::Placeholder,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Attribute {
    /// Fed by the runtime.
    Input,
    /// Read back by the runtime.
    Output,
    /// Computed independently along this axis.
    Tensorwise(Axis),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deref, Serialize)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    pub fn insert(&mut self, attribute: Attribute) {
        if !self.0.contains(&attribute) {
            self.0.push(attribute);
        }
    }

    pub fn remove(&mut self, attribute: &Attribute) {
        self.0.retain(|x| x != attribute);
    }

    /// Copies the runtime-facing attributes (input/output) of `other`.
    pub fn inherit(&mut self, other: &Attributes) {
        for attribute in other.iter() {
            if matches!(attribute, Attribute::Input | Attribute::Output) {
                self.insert(attribute.clone());
            }
        }
    }
}

/// A tensor node of the graph.
#[derive(Debug, Clone)]
pub struct Variable {
    shape: Vec<Placeholder>,
    order: Order,
    attributes: Attributes,
    data: Option<Arc<[f32]>>,
}

impl Variable {
    pub fn new(
        shape: impl IntoIterator<Item = impl Into<Placeholder>>,
        order: Order,
    ) -> Result<Self, LoomError> {
        let shape: Vec<Placeholder> = shape.into_iter().map_into().collect_vec();
        if shape.len() != order.len() {
            return Err(LoomError::Rank {
                order,
                rank: shape.len(),
            });
        }
        let size = shape.iter().fold(Placeholder::Concrete(1), |acc, x| acc * x.clone());
        if let Some(dim) = shape.iter().chain([&size]).find(|x| x.overflowed()) {
            return Err(LoomError::Overflow(dim.clone()));
        }
        Ok(Self {
            shape,
            order,
            attributes: Default::default(),
            data: None,
        })
    }

    /// Creates a constant. Its shape must be concrete and match the data length.
    pub fn constant(
        shape: impl IntoIterator<Item = usize>,
        order: Order,
        data: impl Into<Arc<[f32]>>,
    ) -> Result<Self, LoomError> {
        Self::new(shape, order)?.with_data(data)
    }

    /// Attaches constant data, checking the length against the shape.
    pub fn with_data(mut self, data: impl Into<Arc<[f32]>>) -> Result<Self, LoomError> {
        let data = data.into();
        let expected = self.concrete_size()?;
        if data.len() != expected {
            return Err(LoomError::DataLength {
                expected,
                found: data.len(),
            });
        }
        self.data = Some(data);
        Ok(self)
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.insert(attribute);
        self
    }

    #[inline]
    pub fn shape(&self) -> &[Placeholder] {
        &self.shape
    }

    #[inline]
    pub fn order(&self) -> &Order {
        &self.order
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    #[inline]
    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    #[inline]
    pub fn data(&self) -> Option<&[f32]> {
        self.data.as_deref()
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.data.is_some()
    }

    /// Total number of elements.
    pub fn size(&self) -> Placeholder {
        self.shape
            .iter()
            .fold(Placeholder::Concrete(1), |acc, x| acc * x.clone())
    }

    /// Row-major strides over the order's axis sequence.
    pub fn stride(&self) -> Vec<Placeholder> {
        let mut stride = vec![Placeholder::Concrete(1); self.rank()];
        for index in (0..self.rank().saturating_sub(1)).rev() {
            stride[index] = &stride[index + 1] * &self.shape[index + 1];
        }
        stride
    }

    pub fn shape_of(&self, axis: &Axis) -> Option<&Placeholder> {
        self.order.index_of(axis).map(|index| &self.shape[index])
    }

    pub fn stride_of(&self, axis: &Axis) -> Option<Placeholder> {
        let index = self.order.index_of(axis)?;
        Some(self.stride().swap_remove(index))
    }

    pub fn is_concrete(&self) -> bool {
        self.shape.iter().all(Placeholder::is_concrete)
    }

    /// The shape as plain integers. Fails on the first symbolic dimension.
    pub fn concrete_shape(&self) -> Result<Vec<usize>, LoomError> {
        self.shape
            .iter()
            .map(|x| x.value().ok_or_else(|| LoomError::Unresolved(x.clone())))
            .collect()
    }

    pub fn concrete_size(&self) -> Result<usize, LoomError> {
        Ok(self.concrete_shape()?.iter().product())
    }

    /// Same shape and data under another order of the same rank.
    pub(crate) fn with_order(mut self, order: Order) -> Result<Self, LoomError> {
        if order.len() != self.rank() {
            return Err(LoomError::Rank {
                order,
                rank: self.rank(),
            });
        }
        self.order = order;
        Ok(self)
    }

    /// Builds the constant replacing this variable once its value is known.
    /// Shape, order and runtime attributes are kept.
    pub fn fold(&self, data: impl Into<Arc<[f32]>>) -> Result<Self, LoomError> {
        let mut attributes = Attributes::default();
        attributes.inherit(&self.attributes);
        let variable = Self {
            shape: self.shape.clone(),
            order: self.order.clone(),
            attributes,
            data: None,
        };
        variable.with_data(data)
    }
}

impl std::fmt::Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]@{}", self.shape.iter().format(", "), self.order)
    }
}
