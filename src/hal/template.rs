//! Kernel templates and the typed injector resolving them.
//!
//! A template is source text with three kinds of requests:
//! - `%%LOAD_BUFFER(name)%%`: an access expression for a buffer, or an inline literal;
//! - `%%UNIFORM(type, name)%%`: a typed uniform declaration;
//! - `%%FUNC_NAME%%`: the kernel's unique name.
//!
//! Templates are parsed into a request list first, so a missing or unused binding is found by
//! comparing names rather than by scanning the emitted text.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

use super::allocator::{Allocation, MemorySpace};
use crate::loom::{graph::VarId, placeholder::Placeholder};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("malformed template request `{0}`")]
    Malformed(String),
    #[error("template requests `{0}` but nothing is bound to it")]
    MissingBinding(String),
    #[error("binding `{0}` is not referenced by the template")]
    UnusedBinding(String),
    #[error("{dialect:?} cannot render `{name}` as {request}")]
    UnsupportedRequest {
        dialect: Dialect,
        name: String,
        request: &'static str,
    },
    #[error("value {0} does not fit in a 32-bit integer")]
    Overflow(usize),
    #[error("value {0} is not finite")]
    NonFinite(f32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    LoadBuffer(String),
    Uniform { ty: String, name: String },
    FuncName,
}

impl Request {
    fn binding(&self) -> Option<&str> {
        match self {
            Request::LoadBuffer(name) | Request::Uniform { name, .. } => Some(name),
            Request::FuncName => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Request(Request),
}

/// A parsed kernel template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let pieces = source.split("%%").collect_vec();
        if pieces.len() % 2 == 0 {
            return Err(TemplateError::Malformed("unbalanced `%%`".into()));
        }

        let mut segments = vec![];
        for (index, piece) in pieces.into_iter().enumerate() {
            if index % 2 == 0 {
                if !piece.is_empty() {
                    segments.push(Segment::Text(piece.to_string()));
                }
                continue;
            }
            segments.push(Segment::Request(Self::parse_request(piece)?));
        }
        Ok(Self { segments })
    }

    fn parse_request(piece: &str) -> Result<Request, TemplateError> {
        let malformed = || TemplateError::Malformed(piece.to_string());
        let piece = piece.trim();
        if piece == "FUNC_NAME" {
            return Ok(Request::FuncName);
        }

        let (head, args) = piece.split_once('(').ok_or_else(malformed)?;
        let args = args.strip_suffix(')').ok_or_else(malformed)?;
        let valid = |x: &str| !x.is_empty() && x.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        match head.trim() {
            "LOAD_BUFFER" => {
                let name = args.trim();
                match valid(name) {
                    true => Ok(Request::LoadBuffer(name.to_string())),
                    false => Err(malformed()),
                }
            }
            "UNIFORM" => {
                let (ty, name) = args.split_once(',').ok_or_else(malformed)?;
                let (ty, name) = (ty.trim(), name.trim());
                match valid(ty) && valid(name) {
                    true => Ok(Request::Uniform {
                        ty: ty.to_string(),
                        name: name.to_string(),
                    }),
                    false => Err(malformed()),
                }
            }
            _ => Err(malformed()),
        }
    }

    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Request(request) => Some(request),
            Segment::Text(_) => None,
        })
    }
}

/// A value bound to a template name.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Buffer(Allocation),
    Int(Placeholder),
    Ints(Vec<Placeholder>),
    Float(f32),
    Sampler(VarId),
}

/// What the runtime has to provide for one binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BoundValue {
    /// Inlined in the source.
    Literal(i64),
    /// Inlined in the source.
    Float(f32),
    /// A range of the kernel's meta buffer.
    Meta { offset: usize, len: usize },
    Buffer(Allocation),
    Uniform { ty: String, value: UniformValue },
    Sampler { texture: VarId, unit: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UniformValue {
    Int(Vec<i64>),
    Float(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelBinding {
    pub name: String,
    pub value: BoundValue,
}

/// Where a symbolic value has to be written once it is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PatchSite {
    /// An entry of the kernel's meta buffer.
    Meta { index: usize },
    /// A component of a uniform.
    Uniform { name: String, component: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Patch {
    pub placeholder: Placeholder,
    pub site: PatchSite,
}

/// The per-kernel integer table of linear backends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetaBuffer {
    values: Vec<i32>,
    patches: Vec<Patch>,
}

impl MetaBuffer {
    /// Appends one value and returns its index. A symbolic value is stored as 0 and recorded.
    pub fn push(&mut self, value: &Placeholder) -> Result<usize, TemplateError> {
        let index = self.values.len();
        match value.value() {
            Some(x) => self.values.push(to_i32(x)?),
            None => {
                self.values.push(0);
                self.patches.push(Patch {
                    placeholder: value.clone(),
                    site: PatchSite::Meta { index },
                });
            }
        }
        Ok(index)
    }

    /// Appends a table and returns the index of its first entry.
    pub fn extend(&mut self, values: &[Placeholder]) -> Result<usize, TemplateError> {
        let start = self.values.len();
        for value in values {
            self.push(value)?;
        }
        Ok(start)
    }

    #[inline]
    pub fn values(&self) -> &[i32] {
        &self.values
    }

    #[inline]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.values).to_vec()
    }
}

fn to_i32(x: usize) -> Result<i32, TemplateError> {
    i32::try_from(x).map_err(|_| TemplateError::Overflow(x))
}

fn float(x: f32) -> Result<String, TemplateError> {
    match x.is_finite() {
        // `Debug` always keeps a decimal point or an exponent
        true => Ok(format!("{x:?}")),
        false => Err(TemplateError::NonFinite(x)),
    }
}

/// The target language of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// C-like kernels for WebAssembly, with `static_buffer`, `dynamic_buffer` and `meta_buffer`
    /// pointers in scope.
    C,
    /// WGSL with a single `data_buffer` holding the static space followed by the dynamic space,
    /// which starts at `dynamic_base`.
    Wgsl { dynamic_base: usize },
    /// GLSL ES fragment shaders; buffers are textures bound through uniforms.
    Glsl,
}

/// A template resolved against its bindings.
#[derive(Debug, Clone)]
pub struct Injected {
    pub source: String,
    pub meta: MetaBuffer,
    pub bindings: Vec<KernelBinding>,
    pub patches: Vec<Patch>,
}

/// Resolves template requests with typed bindings.
#[derive(Debug, Clone)]
pub struct Injector {
    dialect: Dialect,
    name: String,
    bindings: BTreeMap<String, Binding>,
}

struct Rendered {
    text: String,
    value: BoundValue,
}

impl Injector {
    pub fn new(dialect: Dialect, name: impl Into<String>) -> Self {
        Self {
            dialect,
            name: name.into(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }

    pub fn inject(&self, template: &Template) -> Result<Injected, TemplateError> {
        for request in template.requests() {
            if let Some(name) = request.binding() {
                if !self.bindings.contains_key(name) {
                    return Err(TemplateError::MissingBinding(name.to_string()));
                }
            }
        }
        for name in self.bindings.keys() {
            if !template.requests().any(|request| request.binding() == Some(name)) {
                return Err(TemplateError::UnusedBinding(name.clone()));
            }
        }

        let mut meta = MetaBuffer::default();
        let mut patches = vec![];
        let mut rendered: BTreeMap<&str, String> = BTreeMap::new();
        let mut bindings = vec![];
        let mut units = 0;

        let mut source = String::new();
        for segment in &template.segments {
            let request = match segment {
                Segment::Text(text) => {
                    source.push_str(text);
                    continue;
                }
                Segment::Request(Request::FuncName) => {
                    source.push_str(&self.name);
                    continue;
                }
                Segment::Request(request) => request,
            };
            let Some((name, binding)) = request
                .binding()
                .and_then(|name| self.bindings.get_key_value(name))
            else {
                continue;
            };
            if let Some(text) = rendered.get(name.as_str()) {
                source.push_str(text);
                continue;
            }

            let Rendered { text, value } = match request {
                Request::LoadBuffer(_) => self.load(name, binding, &mut meta)?,
                Request::Uniform { ty, .. } => self.uniform(ty, name, binding, &mut units, &mut patches)?,
                Request::FuncName => continue,
            };
            source.push_str(&text);
            rendered.insert(name.as_str(), text);
            bindings.push(KernelBinding {
                name: name.clone(),
                value,
            });
        }

        let patches = meta.patches().iter().cloned().chain(patches).collect();
        Ok(Injected {
            source,
            meta,
            bindings,
            patches,
        })
    }

    fn unsupported(&self, name: &str, request: &'static str) -> TemplateError {
        TemplateError::UnsupportedRequest {
            dialect: self.dialect,
            name: name.to_string(),
            request,
        }
    }

    fn load(&self, name: &str, binding: &Binding, meta: &mut MetaBuffer) -> Result<Rendered, TemplateError> {
        let dialect = self.dialect;
        let rendered = match (binding, dialect) {
            (Binding::Int(x), _) => match x.value() {
                Some(value) => Rendered {
                    text: to_i32(value)?.to_string(),
                    value: BoundValue::Literal(value as i64),
                },
                None if dialect == Dialect::Glsl => return Err(self.unsupported(name, "a symbolic literal")),
                None => {
                    let index = meta.push(x)?;
                    Rendered {
                        text: format!("meta_buffer[{index}]"),
                        value: BoundValue::Meta { offset: index, len: 1 },
                    }
                }
            },
            (Binding::Float(x), _) => {
                let text = match dialect {
                    Dialect::C => format!("{}f", float(*x)?),
                    _ => float(*x)?,
                };
                Rendered {
                    text,
                    value: BoundValue::Float(*x),
                }
            }
            (Binding::Ints(values), Dialect::C) => {
                let offset = meta.extend(values)?;
                Rendered {
                    text: format!("(meta_buffer + {offset})"),
                    value: BoundValue::Meta {
                        offset,
                        len: values.len(),
                    },
                }
            }
            (Binding::Ints(values), Dialect::Wgsl { .. }) => {
                let offset = meta.extend(values)?;
                Rendered {
                    text: offset.to_string(),
                    value: BoundValue::Meta {
                        offset,
                        len: values.len(),
                    },
                }
            }
            (Binding::Buffer(allocation), Dialect::C) => {
                let base = match allocation.space {
                    MemorySpace::Static => "static_buffer",
                    MemorySpace::Dynamic => "dynamic_buffer",
                };
                let text = match allocation.offset.value() {
                    Some(offset) => format!("({base} + {offset})"),
                    None => format!("({base} + meta_buffer[{}])", meta.push(&allocation.offset)?),
                };
                Rendered {
                    text,
                    value: BoundValue::Buffer(allocation.clone()),
                }
            }
            (Binding::Buffer(allocation), Dialect::Wgsl { dynamic_base }) => {
                let base = match allocation.space {
                    MemorySpace::Static => 0,
                    MemorySpace::Dynamic => dynamic_base,
                };
                let text = match allocation.offset.value() {
                    Some(offset) => to_i32(base + offset)?.to_string(),
                    None => format!("({} + meta_buffer[{}])", to_i32(base)?, meta.push(&allocation.offset)?),
                };
                Rendered {
                    text,
                    value: BoundValue::Buffer(allocation.clone()),
                }
            }
            (Binding::Ints(_), Dialect::Glsl) => return Err(self.unsupported(name, "an inline table")),
            (Binding::Buffer(_), Dialect::Glsl) => return Err(self.unsupported(name, "a buffer")),
            (Binding::Sampler(_), _) => return Err(self.unsupported(name, "a buffer load")),
        };
        Ok(rendered)
    }

    fn uniform(
        &self,
        ty: &str,
        name: &str,
        binding: &Binding,
        units: &mut u32,
        patches: &mut Vec<Patch>,
    ) -> Result<Rendered, TemplateError> {
        if self.dialect != Dialect::Glsl {
            return Err(self.unsupported(name, "a uniform"));
        }
        let mut ints = |values: &[Placeholder]| -> Result<Vec<i64>, TemplateError> {
            values
                .iter()
                .enumerate()
                .map(|(component, x)| match x.value() {
                    Some(value) => Ok(to_i32(value)? as i64),
                    None => {
                        patches.push(Patch {
                            placeholder: x.clone(),
                            site: PatchSite::Uniform {
                                name: name.to_string(),
                                component,
                            },
                        });
                        Ok(0)
                    }
                })
                .collect()
        };

        let value = match binding {
            Binding::Int(x) => UniformValue::Int(ints(std::slice::from_ref(x))?),
            Binding::Ints(values) => UniformValue::Int(ints(values)?),
            Binding::Float(x) => {
                float(*x)?;
                UniformValue::Float(vec![*x])
            }
            Binding::Sampler(texture) => {
                let unit = *units;
                *units += 1;
                return Ok(Rendered {
                    text: format!("uniform {ty} {name};"),
                    value: BoundValue::Sampler {
                        texture: *texture,
                        unit,
                    },
                });
            }
            Binding::Buffer(_) => return Err(self.unsupported(name, "a uniform")),
        };
        Ok(Rendered {
            text: format!("uniform {ty} {name};"),
            value: BoundValue::Uniform {
                ty: ty.to_string(),
                value,
            },
        })
    }
}
