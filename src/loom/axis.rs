use std::{
    borrow::Cow,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use derive_more::{Deref, Display};
use itertools::Itertools;
use serde::{Serialize, Serializer};

use super::LoomError;

/// Ids below this are reserved for the well-known axes.
const RESERVED_AXES: u32 = 16;

static NEXT_AXIS: AtomicU32 = AtomicU32::new(RESERVED_AXES);

/// A semantic dimension identity.
///
/// Two axes are the same dimension iff they share an id; the name is only a label.
/// An axis without a name is *free*: a frontend could not decide its meaning and
/// expects [`UnifyAxes`](super::optimize::UnifyAxes) to bind it to a named one.
#[derive(Debug, Clone)]
pub struct Axis {
    id: u32,
    name: Option<Cow<'static, str>>,
}

impl Axis {
    /// Batch.
    pub const N: Axis = Axis::reserved(0, "N");
    /// Channel.
    pub const C: Axis = Axis::reserved(1, "C");
    /// Height.
    pub const H: Axis = Axis::reserved(2, "H");
    /// Width.
    pub const W: Axis = Axis::reserved(3, "W");
    /// Time.
    pub const T: Axis = Axis::reserved(4, "T");

    const fn reserved(id: u32, name: &'static str) -> Self {
        Self {
            id,
            name: Some(Cow::Borrowed(name)),
        }
    }

    /// Creates a new named axis, distinct from every other axis.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        let id = NEXT_AXIS.fetch_add(1, Ordering::Relaxed);
        let name = Some(name.into());
        Self { id, name }
    }

    /// Creates a free axis, to be resolved by axis unification.
    pub fn free() -> Self {
        let id = NEXT_AXIS.fetch_add(1, Ordering::Relaxed);
        Self { id, name: None }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.name.is_none()
    }
}

impl PartialEq for Axis {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Axis {}

impl Hash for Axis {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "?{}", self.id),
        }
    }
}

impl Serialize for Axis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The logical axis sequence of a variable. Axes are unique within an order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, Display, Serialize)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Order(Arc<[Axis]>);

impl Order {
    pub fn new(axes: impl IntoIterator<Item = Axis>) -> Result<Self, LoomError> {
        let order = Self(axes.into_iter().collect());
        match order.iter().all_unique() {
            true => Ok(order),
            false => Err(LoomError::DuplicateAxis(order)),
        }
    }

    /// Position of `axis` in this order.
    #[inline]
    pub fn index_of(&self, axis: &Axis) -> Option<usize> {
        self.iter().position(|x| x == axis)
    }

    /// Checks if both orders hold the same axes, regardless of their positions.
    pub fn same_axes(&self, other: &Order) -> bool {
        self.len() == other.len() && self.iter().all(|axis| other.contains(axis))
    }

    pub fn has_free_axis(&self) -> bool {
        self.iter().any(Axis::is_free)
    }

    /// Substitutes every axis through `f`. Fails if two axes collapse into one.
    pub fn map(&self, f: impl Fn(&Axis) -> Axis) -> Result<Self, LoomError> {
        Self::new(self.iter().map(f))
    }
}

/// Shorthand for building an [`Order`] of well-known or custom axes.
///
/// ```
/// use kiln::{order, loom::axis::Axis};
/// let order = order![Axis::N, Axis::H, Axis::W, Axis::C];
/// assert_eq!(order.to_string(), "[N, H, W, C]");
/// ```
#[macro_export]
macro_rules! order {
    ($($axis:expr),* $(,)?) => {
        $crate::loom::axis::Order::new([$($axis.clone()),*]).expect("duplicated axes")
    };
}
