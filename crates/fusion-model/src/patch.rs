//! Linear patch-embedding backbone
//!
//! The first stage of a ViT without the transformer blocks: 16x16 patches are
//! projected to D dimensions, position embeddings are added and each token is
//! layer-normalized. It produces the same `[1 + N, D]` token layout as the ONNX
//! backbone and reads the same timm checkpoint keys (`patch_embed.proj.*`,
//! `cls_token`, `pos_embed`, `norm.*`), so it can run on CPU with nothing but a
//! safetensors file, or fully seeded for tests and benchmarks.
//!
//! A full ViT checkpoint is refused: its transformer blocks would be dropped and
//! the features would not match what a head trained on ViT embeddings expects.

use crate::backbone::{BackboneOutput, VisualBackbone};
use crate::layers::layer_norm;
use crate::weights::{WeightError, WeightMap};
use crate::ModelError;
use cogniscan_common::{TokenFeatures, IMAGE_CHANNELS, IMAGE_SIZE};
use ndarray::{s, Array1, Array2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tracing::info;

/// Patch side length (ViT-B/16)
pub const PATCH_SIZE: usize = 16;

const GRID: usize = IMAGE_SIZE as usize / PATCH_SIZE;
const NUM_PATCHES: usize = GRID * GRID;
const PATCH_DIM: usize = IMAGE_CHANNELS * PATCH_SIZE * PATCH_SIZE;
const LAYER_NORM_EPS: f32 = 1e-6;

/// Checkpoint keys that only exist in a full transformer
const TRANSFORMER_PREFIXES: [&str; 2] = ["blocks.", "fc_norm."];

/// Patch projection + position embedding + LayerNorm
#[derive(Debug, Clone)]
pub struct LinearPatchBackbone {
    embed_dim: usize,
    /// `[D, 3 * 16 * 16]`, flattened conv kernel in (c, ky, kx) order
    proj_weight: Array2<f32>,
    proj_bias: Array1<f32>,
    cls_token: Array1<f32>,
    /// `[1 + N, D]`
    pos_embed: Array2<f32>,
    norm_weight: Array1<f32>,
    norm_bias: Array1<f32>,
}

fn reshape_err(name: &str) -> impl FnOnce(ndarray::ShapeError) -> WeightError + '_ {
    move |e| WeightError::InvalidValue {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

impl LinearPatchBackbone {
    pub fn from_safetensors<P: AsRef<Path>>(path: P, embed_dim: usize) -> Result<Self, WeightError> {
        let path = path.as_ref();
        info!("Loading patch-embedding backbone from {}", path.display());
        Self::from_checkpoint(WeightMap::from_file(path)?, embed_dim)
    }

    /// Build from a whole checkpoint, refusing one that carries transformer blocks
    pub fn from_checkpoint(mut weights: WeightMap, embed_dim: usize) -> Result<Self, WeightError> {
        weights.reject_prefixes(&TRANSFORMER_PREFIXES)?;
        Self::from_weights(&mut weights, embed_dim)
    }

    pub fn from_weights(weights: &mut WeightMap, embed_dim: usize) -> Result<Self, WeightError> {
        let proj_weight = weights
            .take_array(
                "patch_embed.proj.weight",
                &[embed_dim, IMAGE_CHANNELS, PATCH_SIZE, PATCH_SIZE],
            )?
            .into_shape_with_order((embed_dim, PATCH_DIM))
            .map_err(reshape_err("patch_embed.proj.weight"))?;
        let cls_token = weights
            .take_array("cls_token", &[1, 1, embed_dim])?
            .into_shape_with_order(embed_dim)
            .map_err(reshape_err("cls_token"))?;
        let pos_embed = weights
            .take_array("pos_embed", &[1, NUM_PATCHES + 1, embed_dim])?
            .into_shape_with_order((NUM_PATCHES + 1, embed_dim))
            .map_err(reshape_err("pos_embed"))?;

        Ok(Self {
            embed_dim,
            proj_weight,
            proj_bias: weights.take_vector("patch_embed.proj.bias", embed_dim)?,
            cls_token,
            pos_embed,
            norm_weight: weights.take_vector("norm.weight", embed_dim)?,
            norm_bias: weights.take_vector("norm.bias", embed_dim)?,
        })
    }

    /// Deterministic random projection for a given seed
    #[must_use]
    pub fn seeded(embed_dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (PATCH_DIM as f32).sqrt();
        let mut uniform = |scale: f32| (rng.random::<f32>() * 2.0 - 1.0) * scale;

        Self {
            embed_dim,
            proj_weight: Array2::from_shape_simple_fn((embed_dim, PATCH_DIM), || uniform(bound)),
            proj_bias: Array1::from_shape_simple_fn(embed_dim, || uniform(bound)),
            cls_token: Array1::from_shape_simple_fn(embed_dim, || uniform(0.02)),
            pos_embed: Array2::from_shape_simple_fn((NUM_PATCHES + 1, embed_dim), || {
                uniform(0.02)
            }),
            norm_weight: Array1::ones(embed_dim),
            norm_bias: Array1::zeros(embed_dim),
        }
    }

    /// Export with timm key names
    #[must_use]
    pub fn to_weights(&self) -> WeightMap {
        let d = self.embed_dim;
        let mut weights = WeightMap::new();
        let mut put = |name: &str, shape: Vec<usize>, data: Vec<f32>| {
            // Shapes are derived from our own arrays, so the lengths always agree
            let _ = weights.insert(name, shape, data);
        };
        put(
            "patch_embed.proj.weight",
            vec![d, IMAGE_CHANNELS, PATCH_SIZE, PATCH_SIZE],
            self.proj_weight.iter().copied().collect(),
        );
        put("patch_embed.proj.bias", vec![d], self.proj_bias.to_vec());
        put("cls_token", vec![1, 1, d], self.cls_token.to_vec());
        put(
            "pos_embed",
            vec![1, NUM_PATCHES + 1, d],
            self.pos_embed.iter().copied().collect(),
        );
        put("norm.weight", vec![d], self.norm_weight.to_vec());
        put("norm.bias", vec![d], self.norm_bias.to_vec());
        weights
    }

    /// Flatten the image into `[N, 3 * 16 * 16]` patch rows, row-major over the grid
    fn patchify(image: ArrayView3<'_, f32>) -> Array2<f32> {
        let mut patches = Array2::<f32>::zeros((NUM_PATCHES, PATCH_DIM));
        for gy in 0..GRID {
            for gx in 0..GRID {
                let mut row = patches.row_mut(gy * GRID + gx);
                let mut k = 0;
                for c in 0..IMAGE_CHANNELS {
                    for ky in 0..PATCH_SIZE {
                        for kx in 0..PATCH_SIZE {
                            row[k] = image[[c, gy * PATCH_SIZE + ky, gx * PATCH_SIZE + kx]];
                            k += 1;
                        }
                    }
                }
            }
        }
        patches
    }
}

impl VisualBackbone for LinearPatchBackbone {
    fn name(&self) -> &str {
        "linear-patch"
    }

    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn forward(&mut self, image: ArrayView3<'_, f32>) -> Result<BackboneOutput, ModelError> {
        let expected = [IMAGE_CHANNELS, IMAGE_SIZE as usize, IMAGE_SIZE as usize];
        if image.shape() != expected {
            return Err(ModelError::ShapeMismatch {
                what: "image tensor",
                expected: expected.to_vec(),
                actual: image.shape().to_vec(),
            });
        }

        let patches = Self::patchify(image);
        let mut tokens = patches.dot(&self.proj_weight.t()) + &self.proj_bias;
        tokens += &self.pos_embed.slice(s![1.., ..]);

        let mean = tokens
            .mean_axis(Axis(0))
            .ok_or_else(|| ModelError::InvalidOutput("no patch tokens".to_string()))?;
        let mut embedding = &self.cls_token + &self.pos_embed.row(0) + &mean;

        layer_norm(
            embedding.view_mut(),
            self.norm_weight.view(),
            self.norm_bias.view(),
            LAYER_NORM_EPS,
        );
        for row in tokens.rows_mut() {
            layer_norm(
                row,
                self.norm_weight.view(),
                self.norm_bias.view(),
                LAYER_NORM_EPS,
            );
        }

        Ok(BackboneOutput {
            embedding,
            tokens: TokenFeatures::new(tokens),
        })
    }
}
