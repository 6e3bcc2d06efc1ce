//! WGSL generators for the four SOM kernels.
//!
//! WGSL has no preprocessor, so build parameters (`X_DIM`, the grid size,
//! the CPU switch, metric variants) are emitted as literal constants and
//! code branches at generation time. Work-group sizes and shared array
//! lengths must be compile-time constants as well, which is why every
//! generator takes the work-group shape and each distinct shape gets its
//! own module.
//!
//! Tree reductions are unrolled here rather than looped in WGSL. Every
//! `workgroupBarrier()` then sits at the top level of the entry point,
//! which keeps the uniformity analysis happy on all backends.
//!
//! # Bindings
//!
//! | Kernel | Binding 0 | Binding 1 | Binding 2 | Binding 3 | Binding 4 |
//! |--------|-----------|-----------|-----------|-----------|-----------|
//! | `calculate_distances` | som (r) | inputs (r) | distances (rw) | step |  |
//! | `find_global_first_pass` | distances (r) | values (rw) | indexes (rw) |  |  |
//! | `find_global_min` | values (r) | indexes (r) | values (rw) | indexes (rw) | round (dyn) |
//! | `update_network` | som (rw) | inputs (r) | winner (r) | step |  |

use std::fmt::Write;

use crate::config::GridMetric;
use crate::device::KernelDefines;

/// Largest finite f32, used for lanes past the end of the grid.
pub const FLT_MAX_LITERAL: &str = "3.4028235e38";

/// Index sentinel for lanes past the end of the grid.
pub const NO_INDEX_LITERAL: &str = "0xffffffffu";

const STEP_STRUCT: &str = r#"
struct StepParams {
    vector_index: u32,
    radius: u32,
    sigma_sq: f32,
    learn_rate: f32,
}
"#;

fn grid_constants(defines: &KernelDefines) -> String {
    format!(
        "const X_DIM: u32 = {x}u;\n\
         const NEURON_SIZE: u32 = {n}u;\n\
         const NEURON_STRIDE: u32 = {s}u;\n\
         const SOM_SIZE_X: u32 = {sx}u;\n\
         const SOM_SIZE_Y: u32 = {sy}u;\n\
         const SOM_SIZE_Z: u32 = {sz}u;\n\
         const TOTAL_SIZE: u32 = {t}u;\n\
         const FLT_MAX: f32 = {FLT_MAX_LITERAL};\n\
         const NO_INDEX: u32 = {NO_INDEX_LITERAL};\n",
        x = defines.x_dim,
        n = defines.neuron_size,
        s = defines.neuron_stride,
        sx = defines.som_size[0],
        sy = defines.som_size[1],
        sz = defines.som_size[2],
        t = defines.total_size(),
    )
}

/// Halving offsets of a tree over `lanes` lanes: `lanes/2, lanes/4, .., 1`.
fn tree_offsets(lanes: usize) -> impl Iterator<Item = usize> {
    std::iter::successors(Some(lanes / 2), |&o| (o > 1).then_some(o / 2)).filter(|&o| o > 0)
}

/// Distance kernel for work groups of `(X_DIM, local_y, 1)`.
///
/// Each work item squares two feature differences (`c` and `c + X_DIM`),
/// then the row of `X_DIM` lanes is summed with a tree. With `cpu` set,
/// lane 0 sums the whole neuron sequentially instead.
pub fn distance_shader(defines: &KernelDefines, local_y: usize) -> String {
    let x_dim = defines.x_dim;
    let mut src = grid_constants(defines);
    src.push_str(STEP_STRUCT);
    let _ = write!(
        src,
        r#"
@group(0) @binding(0) var<storage, read> som: array<f32>;
@group(0) @binding(1) var<storage, read> inputs: array<f32>;
@group(0) @binding(2) var<storage, read_write> distances: array<f32>;
@group(0) @binding(3) var<uniform> params: StepParams;
"#
    );

    if defines.cpu {
        let _ = write!(
            src,
            r#"
@compute @workgroup_size({x_dim}, {local_y}, 1)
fn calculate_distances(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {{
    let y = gid.y;
    if (lid.x != 0u || y >= SOM_SIZE_Y) {{
        return;
    }}
    let neuron = gid.x / X_DIM + SOM_SIZE_X * (y + SOM_SIZE_Y * gid.z);
    let base = neuron * NEURON_STRIDE;
    let sample = params.vector_index * NEURON_STRIDE;
    var acc = 0.0;
    for (var c = 0u; c < NEURON_STRIDE; c++) {{
        let d = inputs[sample + c] - som[base + c];
        acc += d * d;
    }}
    distances[neuron] = acc;
}}
"#
        );
        return src;
    }

    let _ = write!(
        src,
        r#"
var<workgroup> partial: array<f32, {lanes}>;

@compute @workgroup_size({x_dim}, {local_y}, 1)
fn calculate_distances(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {{
    let lane = lid.x;
    let row = lid.y * X_DIM;
    let y = gid.y;
    let in_grid = y < SOM_SIZE_Y;
    let neuron = gid.x / X_DIM + SOM_SIZE_X * (y + SOM_SIZE_Y * gid.z);

    var acc = 0.0;
    if (in_grid) {{
        let base = neuron * NEURON_STRIDE;
        let sample = params.vector_index * NEURON_STRIDE;
        let a = inputs[sample + lane] - som[base + lane];
        let b = inputs[sample + lane + X_DIM] - som[base + lane + X_DIM];
        acc = a * a + b * b;
    }}
    partial[row + lane] = acc;
    workgroupBarrier();
"#,
        lanes = x_dim * local_y
    );
    for offset in tree_offsets(x_dim) {
        let _ = write!(
            src,
            "    if (lane < {offset}u) {{\n        partial[row + lane] = partial[row + lane] + partial[row + lane + {offset}u];\n    }}\n    workgroupBarrier();\n"
        );
    }
    src.push_str(
        "    if (in_grid && lane == 0u) {\n        distances[neuron] = partial[row];\n    }\n}\n",
    );
    src
}

const REDUCE_PAIR: &str = r#"
fn reduce_pair(a: u32, b: u32) {
    let vb = best_value[b];
    let ib = best_index[b];
    let va = best_value[a];
    if (vb < va || (vb == va && ib < best_index[a])) {
        best_value[a] = vb;
        best_index[a] = ib;
    }
}
"#;

fn reduce_tree(src: &mut String, group_size: usize) {
    for offset in tree_offsets(group_size) {
        let _ = write!(
            src,
            "    if (lane < {offset}u) {{\n        reduce_pair(lane, lane + {offset}u);\n    }}\n    workgroupBarrier();\n"
        );
    }
    src.push_str(
        "    if (lane == 0u) {\n        out_values[wid.x] = best_value[0];\n        out_indexes[wid.x] = best_index[0];\n    }\n}\n",
    );
}

/// Per-group `(min distance, flat index)` over groups of `group_size`.
///
/// Lanes past the end of the grid load `(FLT_MAX, NO_INDEX)`. Ties keep
/// the smaller index.
pub fn local_min_shader(defines: &KernelDefines, group_size: usize) -> String {
    let mut src = grid_constants(defines);
    let _ = write!(
        src,
        r#"
@group(0) @binding(0) var<storage, read> distances: array<f32>;
@group(0) @binding(1) var<storage, read_write> out_values: array<f32>;
@group(0) @binding(2) var<storage, read_write> out_indexes: array<u32>;

var<workgroup> best_value: array<f32, {group_size}>;
var<workgroup> best_index: array<u32, {group_size}>;
{REDUCE_PAIR}
@compute @workgroup_size({group_size})
fn find_global_first_pass(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {{
    let lane = lid.x;
    let i = gid.x;
    var candidate = FLT_MAX;
    var candidate_index = NO_INDEX;
    if (i < TOTAL_SIZE) {{
        candidate = distances[i];
        candidate_index = i;
    }}
    best_value[lane] = candidate;
    best_index[lane] = candidate_index;
    workgroupBarrier();
"#
    );
    reduce_tree(&mut src, group_size);
    src
}

/// One cross-group reduction round over groups of `group_size`.
///
/// The input count comes from a dynamically offset uniform, so one
/// pipeline serves every round with the same group size.
pub fn global_min_shader(group_size: usize) -> String {
    let mut src = format!(
        "const FLT_MAX: f32 = {FLT_MAX_LITERAL};\nconst NO_INDEX: u32 = {NO_INDEX_LITERAL};\n"
    );
    let _ = write!(
        src,
        r#"
struct RoundParams {{
    elements: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}}

@group(0) @binding(0) var<storage, read> in_values: array<f32>;
@group(0) @binding(1) var<storage, read> in_indexes: array<u32>;
@group(0) @binding(2) var<storage, read_write> out_values: array<f32>;
@group(0) @binding(3) var<storage, read_write> out_indexes: array<u32>;
@group(0) @binding(4) var<uniform> reduce_round: RoundParams;

var<workgroup> best_value: array<f32, {group_size}>;
var<workgroup> best_index: array<u32, {group_size}>;
{REDUCE_PAIR}
@compute @workgroup_size({group_size})
fn find_global_min(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
) {{
    let lane = lid.x;
    let i = gid.x;
    var candidate = FLT_MAX;
    var candidate_index = NO_INDEX;
    if (i < reduce_round.elements) {{
        candidate = in_values[i];
        candidate_index = in_indexes[i];
    }}
    best_value[lane] = candidate;
    best_index[lane] = candidate_index;
    workgroupBarrier();
"#
    );
    reduce_tree(&mut src, group_size);
    src
}

fn metric_sq(metric: GridMetric) -> &'static str {
    match metric {
        GridMetric::Chebyshev => {
            "let m = max(abs(d.x), max(abs(d.y), abs(d.z)));\n    return m * m;"
        }
        GridMetric::Euclidean => "return d.x * d.x + d.y * d.y + d.z * d.z;",
    }
}

/// Neighborhood update for work groups of `(X_DIM, local_y, 1)`.
///
/// Each work-group row handles one neuron of the clipped window. Lane 0
/// decides membership and computes the Gaussian weight into shared memory
/// (`-1` for neurons outside the neighborhood), then all `X_DIM` lanes
/// update the real features with stride `X_DIM`.
pub fn update_shader(defines: &KernelDefines, local_y: usize) -> String {
    let x_dim = defines.x_dim;
    let mut src = grid_constants(defines);
    src.push_str(STEP_STRUCT);
    let _ = write!(
        src,
        r#"
@group(0) @binding(0) var<storage, read_write> som: array<f32>;
@group(0) @binding(1) var<storage, read> inputs: array<f32>;
@group(0) @binding(2) var<storage, read> winner: array<u32>;
@group(0) @binding(3) var<uniform> params: StepParams;

var<workgroup> weights: array<f32, {local_y}>;

fn neighborhood_sq(d: vec3<i32>) -> i32 {{
    {neighborhood}
}}

fn weighting_sq(d: vec3<i32>) -> i32 {{
    {weighting}
}}

@compute @workgroup_size({x_dim}, {local_y}, 1)
fn update_network(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {{
    let size = vec3<i32>(i32(SOM_SIZE_X), i32(SOM_SIZE_Y), i32(SOM_SIZE_Z));
    let w_index = winner[0];
    let w = vec3<i32>(
        i32(w_index % SOM_SIZE_X),
        i32((w_index / SOM_SIZE_X) % SOM_SIZE_Y),
        i32(w_index / (SOM_SIZE_X * SOM_SIZE_Y)),
    );
    let r = i32(params.radius);
    let window = min(vec3<i32>(2 * r + 1), size);
    let origin = clamp(w - vec3<i32>(r), vec3<i32>(0), size - window);
    let rel = vec3<i32>(i32(gid.x / X_DIM), i32(gid.y), i32(gid.z));
    let pos = origin + rel;
    let d = pos - w;
    let lane = lid.x;

    if (lane == 0u) {{
        var weight = -1.0;
        if (rel.y < window.y && neighborhood_sq(d) <= r * r) {{
            let dist_sq = f32(weighting_sq(d));
            weight = params.learn_rate * exp(-dist_sq / (2.0 * params.sigma_sq));
        }}
        weights[lid.y] = weight;
    }}
    workgroupBarrier();

    let weight = weights[lid.y];
    if (weight >= 0.0) {{
        let neuron = u32(pos.x) + SOM_SIZE_X * (u32(pos.y) + SOM_SIZE_Y * u32(pos.z));
        let base = neuron * NEURON_STRIDE;
        let sample = params.vector_index * NEURON_STRIDE;
        for (var c = lane; c < NEURON_SIZE; c += X_DIM) {{
            let current = som[base + c];
            som[base + c] = current + weight * (inputs[sample + c] - current);
        }}
    }}
}}
"#,
        neighborhood = metric_sq(defines.variant.neighborhood),
        weighting = metric_sq(defines.variant.weighting),
    );
    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelVariant;

    fn defines(cpu: bool) -> KernelDefines {
        KernelDefines {
            x_dim: 4,
            neuron_size: 7,
            neuron_stride: 8,
            som_size: [4, 3, 2],
            cpu,
            variant: KernelVariant::default(),
        }
    }

    #[test]
    fn test_tree_offsets() {
        assert_eq!(tree_offsets(8).collect::<Vec<_>>(), vec![4, 2, 1]);
        assert_eq!(tree_offsets(2).collect::<Vec<_>>(), vec![1]);
        assert_eq!(tree_offsets(1).count(), 0);
    }

    #[test]
    fn test_shaders_contain_entry_points() {
        assert!(distance_shader(&defines(false), 16).contains("fn calculate_distances"));
        assert!(local_min_shader(&defines(false), 64).contains("fn find_global_first_pass"));
        assert!(global_min_shader(64).contains("fn find_global_min"));
        assert!(update_shader(&defines(false), 8).contains("fn update_network"));
    }

    #[test]
    fn test_constants_are_baked_in() {
        let src = distance_shader(&defines(false), 16);
        assert!(src.contains("const X_DIM: u32 = 4u;"));
        assert!(src.contains("const TOTAL_SIZE: u32 = 24u;"));
        assert!(src.contains("@workgroup_size(4, 16, 1)"));
        assert!(src.contains("array<f32, 64>"));
    }

    #[test]
    fn test_cpu_variant_sums_sequentially() {
        let src = distance_shader(&defines(true), 16);
        assert!(src.contains("for (var c = 0u; c < NEURON_STRIDE; c++)"));
        assert!(!src.contains("workgroupBarrier"));
    }

    #[test]
    fn test_reduction_is_unrolled() {
        let src = local_min_shader(&defines(false), 8);
        assert_eq!(src.matches("reduce_pair(lane, lane + ").count(), 3);
        assert_eq!(src.matches("workgroupBarrier();").count(), 4);
    }

    #[test]
    fn test_metric_variants() {
        let mut d = defines(false);
        d.variant.neighborhood = GridMetric::Euclidean;
        d.variant.weighting = GridMetric::Chebyshev;
        let src = update_shader(&d, 4);
        let neighborhood = src.split("fn neighborhood_sq").nth(1).unwrap();
        assert!(neighborhood.trim_start().starts_with("(d: vec3<i32>) -> i32 {\n    return d.x * d.x"));
    }
}
