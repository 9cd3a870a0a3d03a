use std::str::FromStr;

use rustc_hash::FxHashMap as HashMap;

use crate::{
    hal::texture::{ChannelMode, TextureShape},
    loom::{axis::Axis, graph::VarId},
};

/// Options of one conversion run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest width or height of a texture on the WebGL backend.
    pub max_texture_size: usize,
    /// How scalars are packed into texels on the WebGL backend.
    pub channel_mode: ChannelMode,
    /// Bound on the iterations of repeating optimizer groups.
    pub max_iterations: usize,
    /// Unifies the first axis of every graph output with the batch axis.
    pub batch_first: bool,
    /// Pairs of axes known to be the same dimension.
    pub axis_hints: Vec<(Axis, Axis)>,
    /// Explicit texture shapes, taking precedence over the derived ones.
    pub texture_shapes: HashMap<VarId, TextureShape>,
    /// Threads per workgroup on the WebGPU backend.
    pub workgroup_size: u32,
    /// Generates kernels of distinct operators on worker threads.
    pub parallel: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_texture_size: 4096,
            channel_mode: ChannelMode::R,
            max_iterations: 32,
            batch_first: false,
            axis_hints: vec![],
            texture_shapes: HashMap::default(),
            workgroup_size: 64,
            parallel: cfg!(feature = "rayon"),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default options overridden by `KILN_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Default options overridden by the `KILN_*` variables `var` looks up.
    /// Unparseable values are logged and ignored.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let config = Self::default();
        Self {
            max_texture_size: parse_value(&var, "KILN_MAX_TEXTURE_SIZE", config.max_texture_size),
            max_iterations: parse_value(&var, "KILN_OPTIMIZER_MAX_ITERATIONS", config.max_iterations),
            parallel: parse_flag(&var, "KILN_PARALLEL", config.parallel),
            ..config
        }
    }

    pub fn max_texture_size(mut self, size: usize) -> Self {
        self.max_texture_size = size;
        self
    }

    pub fn channel_mode(mut self, mode: ChannelMode) -> Self {
        self.channel_mode = mode;
        self
    }

    pub fn max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn batch_first(mut self, enabled: bool) -> Self {
        self.batch_first = enabled;
        self
    }

    pub fn axis_hint(mut self, x: Axis, y: Axis) -> Self {
        self.axis_hints.push((x, y));
        self
    }

    pub fn texture_shape(mut self, id: VarId, shape: TextureShape) -> Self {
        self.texture_shapes.insert(id, shape);
        self
    }

    pub fn workgroup_size(mut self, size: u32) -> Self {
        self.workgroup_size = size;
        self
    }

    pub fn parallel(mut self, enabled: bool) -> Self {
        self.parallel = enabled;
        self
    }
}

/// Interprets a string value such as "1" or "no" as a boolean.
fn str_as_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "t" | "yes" | "y" => Some(true),
        "0" | "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match var(name) {
        Some(value) => str_as_bool(&value).unwrap_or_else(|| {
            log::warn!("unrecognized boolean value \"{value}\" of {name}");
            default
        }),
        None => default,
    }
}

fn parse_value<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match var(name) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            log::warn!("unrecognized value \"{value}\" of {name}");
            default
        }),
        None => default,
    }
}
