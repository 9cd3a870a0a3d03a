//! WebGL kernels: GLSL ES 3.00 fragment shaders.
//!
//! Every variable lives in its own 2D texture, filled row by row with `CHANNELS` scalars per
//! texel. A kernel renders one output texture; each fragment computes the scalars of its texel.

use itertools::Itertools;

use super::{
    Backend, BackendKind, GenerateError, GeneratorBuilder, Kernel, Launch, Layout, OpContext, TextureLayout,
    gather_coordinate, gather_tables,
    iteration::{self, pad},
    template::{Binding, Dialect, Injector, Template},
    texture::AssertTextureSize,
};
use crate::{
    config::Config,
    loom::{
        LoomError,
        graph::{Graph, VarId},
        ops::{OpKind, Operator},
        optimize::{OptimizeError, OptimizeRule},
        placeholder::Placeholder,
    },
};

/// Highest rank a kernel can iterate; per-axis tables are `ivec4` uniforms.
pub const MAX_RANK: usize = 4;

const HEADER: &str = r#"#version 300 es
precision highp float;
precision highp int;
// %%FUNC_NAME%%
"#;

const HELPERS: &str = r#"
out vec4 fragment;

const int CHANNELS = %%LOAD_BUFFER(channels)%%;

float fetch(sampler2D tex, ivec2 size, int index) {
    int texel = index / CHANNELS;
    vec4 value = texelFetch(tex, ivec2(texel % size.x, texel / size.x), 0);
    return value[index % CHANNELS];
}
"#;

#[derive(Debug, Clone)]
pub struct WebGl {
    layout: TextureLayout,
    channels: usize,
}

impl WebGl {
    #[inline]
    pub fn textures(&self) -> &TextureLayout {
        &self.layout
    }

    fn texture(&self, id: VarId) -> Result<Vec<Placeholder>, GenerateError> {
        let texture = self.layout.get(id).ok_or(GenerateError::Unplaced(id))?;
        Ok(vec![texture.shape.width.into(), texture.shape.height.into()])
    }
}

impl Backend for WebGl {
    const KIND: BackendKind = BackendKind::WebGl;

    fn prepare(graph: &mut Graph, config: &Config) -> Result<Self, GenerateError> {
        AssertTextureSize::from_config(config)
            .optimize(graph)
            .map_err(|err| match err {
                OptimizeError::ResourceLimitExceeded { var, reason } => GenerateError::ResourceLimitExceeded {
                    reason: format!("{var}: {reason}"),
                },
                err => err.into(),
            })?;
        let layout = TextureLayout::allocate(graph, config)?;
        Ok(Self {
            layout,
            channels: config.channel_mode.channels(),
        })
    }

    fn layout(&self) -> Layout {
        Layout::Texture(self.layout.clone())
    }

    fn constants(&self, graph: &Graph) -> Result<Vec<f32>, GenerateError> {
        Ok(self.layout.constants(graph)?)
    }
}

impl GeneratorBuilder<WebGl> {
    pub fn add_default_ops(self) -> Self {
        OpKind::ALL.into_iter().fold(self, |builder, kind| match kind.is_elementwise() {
            true => builder.add_op(kind, elementwise),
            false => builder.add_op(kind, gather),
        })
    }
}

fn expression(op: &Operator) -> &'static str {
    match op {
        Operator::Add => "v0 + v1",
        Operator::Mul => "v0 * v1",
        Operator::Greater => "(v0 > v1) ? 1.0 : 0.0",
        Operator::GreaterEqual => "(v0 >= v1) ? 1.0 : 0.0",
        Operator::ScalarAffine { .. } => "v0 * (%%LOAD_BUFFER(scale)%%) + (%%LOAD_BUFFER(bias)%%)",
        Operator::Select => "(v0 != 0.0) ? v1 : v2",
        _ => "v0",
    }
}

/// Uniform declarations of one sampled operand.
fn sampled(name: &str) -> String {
    format!("%%UNIFORM(sampler2D, {name})%%\n%%UNIFORM(ivec2, {name}_texture)%%\n")
}

/// The fragment's main function. `body` computes `result[k]` from the scalar index `i`.
fn entry(body: &str) -> String {
    format!(
        r#"
void main() {{
    ivec2 pixel = ivec2(gl_FragCoord.xy);
    int texel = pixel.y * y_texture.x + pixel.x;
    vec4 result = vec4(0.0);
    for (int k = 0; k < CHANNELS; k++) {{
        int i = texel * CHANNELS + k;
        if (i >= y_size) {{
            break;
        }}
{body}
    }}
    fragment = result;
}}
"#
    )
}

impl WebGl {
    fn injector(&self, context: &OpContext<Self>, y: VarId, size: Placeholder) -> Result<Injector, GenerateError> {
        Ok(Injector::new(Dialect::Glsl, &context.name)
            .bind("channels", Binding::Int(Placeholder::Concrete(self.channels)))
            .bind("y_texture", Binding::Ints(self.texture(y)?))
            .bind("y_size", Binding::Int(size)))
    }

    fn sample(&self, injector: Injector, name: &str, id: VarId) -> Result<Injector, GenerateError> {
        Ok(injector
            .bind(name, Binding::Sampler(id))
            .bind(format!("{name}_texture"), Binding::Ints(self.texture(id)?)))
    }

    fn kernel(
        &self,
        context: &OpContext<Self>,
        y: VarId,
        template: &str,
        injector: Injector,
    ) -> Result<Kernel, GenerateError> {
        let texture = self.layout.get(y).ok_or(GenerateError::Unplaced(y))?;
        let template = Template::parse(template)?;
        let injected = injector.inject(&template)?;
        Ok(Kernel {
            name: context.name.clone(),
            kind: context.op().kind(),
            source: injected.source,
            meta: vec![],
            bindings: injected.bindings,
            patches: injected.patches,
            dynamic_buffer_size: Placeholder::Concrete(0),
            launch: Launch::Fragment {
                output: y,
                width: texture.shape.width,
                height: texture.shape.height,
            },
        })
    }
}

fn elementwise(context: &OpContext<WebGl>) -> Result<Vec<Kernel>, GenerateError> {
    let backend = context.backend;
    let op = context.op();
    let names = op.input_names();
    let (y, output) = context.output()?;
    let inputs = context.inputs()?;
    let variables = inputs.iter().map(|(_, x)| *x).collect_vec();
    let order = iteration::unify(output, &variables, Some(MAX_RANK))?;

    let uniforms = names
        .iter()
        .map(|name| format!("{}%%UNIFORM(ivec4, {name}_stride)%%\n", sampled(name)))
        .join("");
    let indices = names
        .iter()
        .map(|name| format!("        int {name}_index = 0;"))
        .join("\n");
    let walk = names
        .iter()
        .map(|name| format!("            {name}_index += c * {name}_stride[d];"))
        .join("\n");
    let load = names
        .iter()
        .enumerate()
        .map(|(index, name)| format!("        float v{index} = fetch({name}, {name}_texture, {name}_index);"))
        .join("\n");
    let body = format!(
        r#"        int rem = i;
{indices}
        for (int d = {last}; d >= 0; d--) {{
            int c = rem % shape[d];
            rem /= shape[d];
{walk}
        }}
{load}
        result[k] = {expression};"#,
        last = MAX_RANK - 1,
        expression = expression(op),
    );
    let template = format!(
        "{HEADER}{uniforms}%%UNIFORM(ivec2, y_texture)%%\n%%UNIFORM(ivec4, shape)%%\n%%UNIFORM(int, y_size)%%\n{HELPERS}{main}",
        main = entry(&body),
    );

    let mut injector = backend
        .injector(context, y, output.size())?
        .bind("shape", Binding::Ints(order.shape.clone()));
    for (index, (name, (id, _))) in names.iter().zip_eq(&inputs).enumerate() {
        injector = backend
            .sample(injector, name, *id)?
            .bind(format!("{name}_stride"), Binding::Ints(order.strides[index + 1].clone()));
    }
    if let Operator::ScalarAffine { scale, bias } = op {
        injector = injector
            .bind("scale", Binding::Float(*scale))
            .bind("bias", Binding::Float(*bias));
    }
    Ok(vec![backend.kernel(context, y, &template, injector)?])
}

fn gather(context: &OpContext<WebGl>) -> Result<Vec<Kernel>, GenerateError> {
    let backend = context.backend;
    let op = context.op();
    let (y, output) = context.output()?;
    let inputs = context.inputs()?;
    let &[(x, input)] = inputs.as_slice() else {
        return Err(LoomError::Arity {
            op: op.kind(),
            expected: 1,
            found: inputs.len(),
        }
        .into());
    };
    let tables = gather_tables(op, input);

    let uniforms = tables
        .iter()
        .map(|(name, _)| format!("%%UNIFORM(ivec4, {name})%%\n"))
        .join("");
    let coordinate = gather_coordinate(op, |name| format!("{name}[d]"));
    let body = format!(
        r#"        int rem = i;
        int x_index = 0;
        for (int d = {last}; d >= 0; d--) {{
            int c = rem % y_shape[d];
            rem /= y_shape[d];
            x_index += ({coordinate}) * x_stride[d];
        }}
        result[k] = fetch(x, x_texture, x_index);"#,
        last = MAX_RANK - 1,
    );
    let template = format!(
        "{HEADER}{sampled}%%UNIFORM(ivec4, x_stride)%%\n{uniforms}%%UNIFORM(ivec2, y_texture)%%\n%%UNIFORM(ivec4, y_shape)%%\n%%UNIFORM(int, y_size)%%\n{HELPERS}{main}",
        sampled = sampled("x"),
        main = entry(&body),
    );

    let mut injector = backend
        .injector(context, y, output.size())?
        .bind("y_shape", Binding::Ints(pad(output.shape(), MAX_RANK, 1)?))
        .bind("x_stride", Binding::Ints(pad(&input.stride(), MAX_RANK, 1)?));
    injector = backend.sample(injector, "x", x)?;
    for (name, values) in tables {
        let neutral = match name {
            "slice_begin" => 0,
            _ => 1,
        };
        injector = injector.bind(name, Binding::Ints(pad(&values, MAX_RANK, neutral)?));
    }
    Ok(vec![backend.kernel(context, y, &template, injector)?])
}
