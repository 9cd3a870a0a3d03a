use std::collections::BTreeMap;

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;

use crate::{
    config::Config,
    loom::{
        LoomError,
        graph::{Graph, VarId},
        optimize::{OptimizeError, OptimizeRule},
        variable::Variable,
    },
};

/// How scalars are packed into texels.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelMode {
    /// One scalar per texel.
    #[default]
    #[display("r")]
    R,
    /// Four scalars per texel.
    #[display("rgba")]
    Rgba,
}

impl ChannelMode {
    #[inline]
    pub fn channels(self) -> usize {
        match self {
            ChannelMode::R => 1,
            ChannelMode::Rgba => 4,
        }
    }
}

/// The 2D extent of a texture, in texels.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[display("{width}x{height}")]
pub struct TextureShape {
    pub width: usize,
    pub height: usize,
}

impl TextureShape {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Fills rows of at most `max` texels with `size` scalars.
    pub fn derive(size: usize, mode: ChannelMode, max: usize) -> Self {
        let texels = size.div_ceil(mode.channels()).max(1);
        let width = texels.min(max.max(1));
        let height = texels.div_ceil(width);
        Self { width, height }
    }

    #[inline]
    pub fn texels(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn fits(&self, max: usize) -> bool {
        self.width <= max && self.height <= max
    }
}

/// The texture backing one variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextureAllocation {
    pub shape: TextureShape,
    pub channel_mode: ChannelMode,
    /// Number of scalars stored.
    pub size: usize,
    /// Element offset of the initial data in the descriptor's constants, for constants only.
    pub constant_offset: Option<usize>,
}

/// Texture placement of every variable, for the texture-addressed backend.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TextureLayout {
    pub textures: BTreeMap<VarId, TextureAllocation>,
}

/// The texture shape `variable` gets, honoring explicit overrides.
fn texture_shape(
    overrides: &HashMap<VarId, TextureShape>,
    id: VarId,
    variable: &Variable,
    mode: ChannelMode,
    max: usize,
) -> Result<TextureShape, LoomError> {
    let size = variable.concrete_size()?;
    match overrides.get(&id) {
        Some(&shape) => Ok(shape),
        None => Ok(TextureShape::derive(size, mode, max)),
    }
}

impl TextureLayout {
    /// Assigns a texture to every reachable variable.
    ///
    /// Limits are not checked here; run [`AssertTextureSize`] first.
    pub fn allocate(graph: &Graph, config: &Config) -> Result<Self, LoomError> {
        let mut textures = BTreeMap::new();
        let mut offset = 0;
        for id in graph.variables()? {
            let variable = graph.variable(id)?;
            let shape = texture_shape(
                &config.texture_shapes,
                id,
                variable,
                config.channel_mode,
                config.max_texture_size,
            )?;
            let size = variable.concrete_size()?;
            textures.insert(
                id,
                TextureAllocation {
                    shape,
                    channel_mode: config.channel_mode,
                    size,
                    constant_offset: None,
                },
            );
        }
        // constants are laid out by ascending id, matching the descriptor's constant bytes
        for (id, texture) in textures.iter_mut() {
            if let Some(data) = graph.variable(*id)?.data() {
                texture.constant_offset = Some(offset);
                offset += data.len();
            }
        }
        Ok(Self { textures })
    }

    pub fn get(&self, id: VarId) -> Option<&TextureAllocation> {
        self.textures.get(&id)
    }

    /// Concatenated constant data, in the order of `constant_offset`.
    pub fn constants(&self, graph: &Graph) -> Result<Vec<f32>, LoomError> {
        let mut data = vec![];
        for (&id, texture) in &self.textures {
            if texture.constant_offset.is_some() {
                data.extend_from_slice(graph.variable(id)?.data().unwrap_or_default());
            }
        }
        Ok(data)
    }
}

/// Fails if any variable's texture would exceed the maximum dimension.
///
/// Never changes the graph.
#[derive(Debug, Clone)]
pub struct AssertTextureSize {
    max: usize,
    mode: ChannelMode,
    overrides: HashMap<VarId, TextureShape>,
}

impl AssertTextureSize {
    pub fn new(max: usize, mode: ChannelMode) -> Self {
        Self {
            max,
            mode,
            overrides: HashMap::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            max: config.max_texture_size,
            mode: config.channel_mode,
            overrides: config.texture_shapes.clone(),
        }
    }

    pub fn texture_shape(mut self, id: VarId, shape: TextureShape) -> Self {
        self.overrides.insert(id, shape);
        self
    }
}

impl OptimizeRule for AssertTextureSize {
    fn name(&self) -> &str {
        "assert_texture_size"
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn optimize(&self, graph: &mut Graph) -> Result<bool, OptimizeError> {
        for id in graph.variables()? {
            let variable = graph.variable(id)?;
            let shape = texture_shape(&self.overrides, id, variable, self.mode, self.max)?;
            if !shape.fits(self.max) {
                return Err(OptimizeError::ResourceLimitExceeded {
                    var: id,
                    reason: format!("texture {shape} of {variable} exceeds the maximum of {}", self.max),
                });
            }
            let size = variable.concrete_size()?;
            let capacity = shape.texels() * self.mode.channels();
            if capacity < size {
                return Err(OptimizeError::ResourceLimitExceeded {
                    var: id,
                    reason: format!("texture {shape} cannot hold {size} elements of {variable}"),
                });
            }
        }
        Ok(false)
    }
}
