use std::{
    borrow::Cow,
    hash::{Hash, Hasher},
    ops::{Add, Div, Mul, Rem, Sub},
    sync::Arc,
};

use rustc_hash::FxHashMap as HashMap;
use serde::{Serialize, Serializer, ser::SerializeStruct};

/// A dimension that is either known at build time or resolved when the model is instantiated.
///
/// Two symbolic placeholders are equal only if they are the very same symbol;
/// equal resolved values are not enough.
#[derive(Debug, Clone)]
pub enum Placeholder {
    Concrete(usize),
    Symbolic(Symbol),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId;

#[derive(Debug, Clone)]
pub struct Symbol(Arc<SymbolNode>);

#[derive(Debug)]
struct SymbolNode {
    id: uid::Id<SymbolId>,
    expr: Expr,
}

#[derive(Debug)]
enum Expr {
    Free(Cow<'static, str>),
    Binary(BinaryOp, Placeholder, Placeholder),
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn apply(self, x: usize, y: usize) -> Option<usize> {
        match self {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div => x.checked_div(y),
            BinaryOp::Rem => x.checked_rem(y),
        }
    }

    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
            BinaryOp::Rem => '%',
        }
    }
}

impl Symbol {
    fn new(expr: Expr) -> Self {
        let id = uid::Id::new();
        Self(Arc::new(SymbolNode { id, expr }))
    }

    #[inline]
    pub fn id(&self) -> uid::Id<SymbolId> {
        self.0.id
    }

    /// The label of a free symbol, or `None` if it is derived from others.
    pub fn label(&self) -> Option<&str> {
        match &self.0.expr {
            Expr::Free(label) => Some(label),
            Expr::Binary(..) => None,
        }
    }

    /// Collects the free symbols this symbol depends on.
    pub fn free_symbols(&self) -> Vec<Symbol> {
        let mut symbols = vec![];
        self.collect_free(&mut symbols);
        symbols
    }

    fn collect_free(&self, symbols: &mut Vec<Symbol>) {
        match &self.0.expr {
            Expr::Free(_) => {
                if symbols.iter().all(|x| x.id() != self.id()) {
                    symbols.push(self.clone())
                }
            }
            Expr::Binary(_, x, y) => {
                for p in [x, y] {
                    if let Placeholder::Symbolic(symbol) = p {
                        symbol.collect_free(symbols)
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0.expr {
            Expr::Free(label) => write!(f, "{label}"),
            Expr::Binary(op, x, y) => write!(f, "({x} {} {y})", op.symbol()),
        }
    }
}

impl Placeholder {
    /// Creates a fresh free symbol labelled `label`.
    pub fn symbol(label: impl Into<Cow<'static, str>>) -> Self {
        Self::Symbolic(Symbol::new(Expr::Free(label.into())))
    }

    /// Returns the value if it is known at build time.
    #[inline]
    pub fn value(&self) -> Option<usize> {
        match self {
            Placeholder::Concrete(value) => Some(*value),
            Placeholder::Symbolic(_) => None,
        }
    }

    #[inline]
    pub fn is_concrete(&self) -> bool {
        matches!(self, Placeholder::Concrete(_))
    }

    /// Evaluates the placeholder with free symbols bound by `env`.
    pub fn resolve(&self, env: &SymbolEnv) -> Option<usize> {
        match self {
            Placeholder::Concrete(value) => Some(*value),
            Placeholder::Symbolic(symbol) => match &symbol.0.expr {
                Expr::Free(_) => env.0.get(&symbol.id()).copied(),
                Expr::Binary(op, x, y) => op.apply(x.resolve(env)?, y.resolve(env)?),
            },
        }
    }

    pub fn free_symbols(&self) -> Vec<Symbol> {
        match self {
            Placeholder::Concrete(_) => vec![],
            Placeholder::Symbolic(symbol) => symbol.free_symbols(),
        }
    }

    /// Whether some arithmetic on two concrete operands overflowed or divided by zero.
    ///
    /// Successful concrete arithmetic always folds, so a derived node over two concrete
    /// operands only remains when it failed.
    pub fn overflowed(&self) -> bool {
        match self {
            Placeholder::Concrete(_) => false,
            Placeholder::Symbolic(symbol) => match &symbol.0.expr {
                Expr::Free(_) => false,
                Expr::Binary(_, x, y) => {
                    (x.is_concrete() && y.is_concrete()) || x.overflowed() || y.overflowed()
                }
            },
        }
    }

    /// Ceiling division, for a concrete divisor.
    pub fn div_ceil(&self, rhs: usize) -> Placeholder {
        match self {
            Placeholder::Concrete(x) => Placeholder::Concrete(x.div_ceil(rhs)),
            _ => (self.clone() + (rhs - 1)) / rhs,
        }
    }

    fn binary(op: BinaryOp, x: Placeholder, y: Placeholder) -> Placeholder {
        match (op, x.value(), y.value()) {
            (_, Some(a), Some(b)) => {
                if let Some(value) = op.apply(a, b) {
                    return Placeholder::Concrete(value);
                }
            }
            (BinaryOp::Add | BinaryOp::Sub, _, Some(0)) | (BinaryOp::Mul | BinaryOp::Div, _, Some(1)) => {
                return x;
            }
            (BinaryOp::Add, Some(0), _) | (BinaryOp::Mul, Some(1), _) => return y,
            _ => {}
        }
        Placeholder::Symbolic(Symbol::new(Expr::Binary(op, x, y)))
    }
}

impl Default for Placeholder {
    fn default() -> Self {
        Self::Concrete(0)
    }
}

impl From<usize> for Placeholder {
    fn from(value: usize) -> Self {
        Self::Concrete(value)
    }
}

impl PartialEq for Placeholder {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Placeholder::Concrete(x), Placeholder::Concrete(y)) => x == y,
            (Placeholder::Symbolic(x), Placeholder::Symbolic(y)) => x.id() == y.id(),
            _ => false,
        }
    }
}

impl Eq for Placeholder {}

impl PartialEq<usize> for Placeholder {
    fn eq(&self, other: &usize) -> bool {
        self.value() == Some(*other)
    }
}

impl Hash for Placeholder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Placeholder::Concrete(value) => {
                state.write_u8(0);
                value.hash(state);
            }
            Placeholder::Symbolic(symbol) => {
                state.write_u8(1);
                symbol.id().hash(state);
            }
        }
    }
}

impl std::fmt::Display for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Placeholder::Concrete(value) => write!(f, "{value}"),
            Placeholder::Symbolic(symbol) => write!(f, "{symbol}"),
        }
    }
}

impl Serialize for Placeholder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Placeholder::Concrete(value) => serializer.serialize_u64(*value as u64),
            Placeholder::Symbolic(symbol) => {
                let mut state = serializer.serialize_struct("Symbol", 2)?;
                state.serialize_field("id", &symbol.id().get())?;
                state.serialize_field("expr", &symbol.to_string())?;
                state.end()
            }
        }
    }
}

macro_rules! impl_arithmetic {
    ($trait:ident, $fn:ident, $op:expr) => {
        impl $trait for Placeholder {
            type Output = Placeholder;

            fn $fn(self, rhs: Placeholder) -> Placeholder {
                Placeholder::binary($op, self, rhs)
            }
        }

        impl $trait<usize> for Placeholder {
            type Output = Placeholder;

            fn $fn(self, rhs: usize) -> Placeholder {
                Placeholder::binary($op, self, Placeholder::Concrete(rhs))
            }
        }

        impl $trait<&Placeholder> for &Placeholder {
            type Output = Placeholder;

            fn $fn(self, rhs: &Placeholder) -> Placeholder {
                Placeholder::binary($op, self.clone(), rhs.clone())
            }
        }
    };
}

impl_arithmetic!(Add, add, BinaryOp::Add);
impl_arithmetic!(Sub, sub, BinaryOp::Sub);
impl_arithmetic!(Mul, mul, BinaryOp::Mul);
impl_arithmetic!(Div, div, BinaryOp::Div);
impl_arithmetic!(Rem, rem, BinaryOp::Rem);

/// Values bound to free symbols at model-instantiation time.
#[derive(Debug, Default, Clone)]
pub struct SymbolEnv(HashMap<uid::Id<SymbolId>, usize>);

impl SymbolEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a free symbol. Concrete or derived placeholders are ignored.
    pub fn bind(mut self, placeholder: &Placeholder, value: usize) -> Self {
        if let Placeholder::Symbolic(symbol) = placeholder {
            if symbol.label().is_some() {
                self.0.insert(symbol.id(), value);
            }
        }
        self
    }
}
