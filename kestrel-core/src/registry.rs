//! Architecture registry and validated model configuration.
//!
//! Each supported architecture is one row in a static table: the backbone the engine
//! should build, which width scales it accepts, whether its export shape is fixed, and
//! whether structured pruning is available. Construction goes through [`ModelConfig::new`],
//! which resolves the row and validates the family parameters.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConfigError, Result};

/// Task family an architecture belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Classifier,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Classifier => "classifier",
        }
    }
}

/// One registry row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchitectureDescriptor {
    /// Public architecture name, recorded as `Model` in metadata.
    pub name: &'static str,
    /// Backbone the engine builds; differs from `name` for distilled variants.
    pub backbone: &'static str,
    pub family: ModelFamily,
    /// Accepted width multipliers; `None` when the architecture takes no `scale`.
    pub supported_scales: Option<&'static [f64]>,
    /// Per-stage learning-rate multipliers passed to the backbone.
    pub lr_mult_list: Option<&'static [f64]>,
    /// Export shape forced when the caller leaves spatial dims dynamic.
    pub fixed_export_shape: Option<[usize; 2]>,
    pub supports_pruning: bool,
}

const MOBILENET_V1_SCALES: &[f64] = &[0.25, 0.5, 0.75, 1.0];
const MOBILENET_V2_SCALES: &[f64] = &[0.25, 0.5, 0.75, 1.0, 1.5, 2.0];
const MOBILENET_V3_SCALES: &[f64] = &[0.35, 0.5, 0.75, 1.0, 1.25];
const SHUFFLENET_V2_SCALES: &[f64] = &[0.25, 0.33, 0.5, 1.0, 1.5, 2.0];
const SSLD_LR_MULT: &[f64] = &[0.1, 0.1, 0.2, 0.2, 0.3];

const fn plain(name: &'static str) -> ArchitectureDescriptor {
    ArchitectureDescriptor {
        name,
        backbone: name,
        family: ModelFamily::Classifier,
        supported_scales: None,
        lr_mult_list: None,
        fixed_export_shape: None,
        supports_pruning: true,
    }
}

const fn scaled(name: &'static str, scales: &'static [f64]) -> ArchitectureDescriptor {
    ArchitectureDescriptor {
        supported_scales: Some(scales),
        ..plain(name)
    }
}

const fn fixed_224(desc: ArchitectureDescriptor) -> ArchitectureDescriptor {
    ArchitectureDescriptor {
        fixed_export_shape: Some([224, 224]),
        ..desc
    }
}

const fn ssld(name: &'static str, backbone: &'static str) -> ArchitectureDescriptor {
    ArchitectureDescriptor {
        backbone,
        lr_mult_list: Some(SSLD_LR_MULT),
        ..plain(name)
    }
}

static ARCHITECTURES: &[ArchitectureDescriptor] = &[
    plain("ResNet18"),
    plain("ResNet34"),
    plain("ResNet50"),
    plain("ResNet101"),
    plain("ResNet152"),
    plain("ResNet18_vd"),
    plain("ResNet34_vd"),
    plain("ResNet50_vd"),
    ssld("ResNet50_vd_ssld", "ResNet50_vd"),
    plain("ResNet101_vd"),
    ssld("ResNet101_vd_ssld", "ResNet101_vd_ssld"),
    plain("ResNet152_vd"),
    plain("ResNet200_vd"),
    fixed_224(plain("AlexNet")),
    plain("DarkNet53"),
    scaled("MobileNetV1", MOBILENET_V1_SCALES),
    scaled("MobileNetV2", MOBILENET_V2_SCALES),
    scaled("MobileNetV3_small", MOBILENET_V3_SCALES),
    scaled("MobileNetV3_large", MOBILENET_V3_SCALES),
    plain("DenseNet121"),
    plain("DenseNet161"),
    plain("DenseNet169"),
    plain("DenseNet201"),
    plain("DenseNet264"),
    plain("HRNet_W18_C"),
    plain("HRNet_W30_C"),
    plain("HRNet_W32_C"),
    plain("HRNet_W40_C"),
    plain("HRNet_W44_C"),
    plain("HRNet_W48_C"),
    plain("HRNet_W64_C"),
    plain("Xception41"),
    plain("Xception65"),
    plain("Xception71"),
    fixed_224(scaled("ShuffleNetV2", SHUFFLENET_V2_SCALES)),
    fixed_224(ArchitectureDescriptor {
        backbone: "ShuffleNetV2_x1_5",
        ..plain("ShuffleNetV2_swish")
    }),
];

/// All registered architectures, in registration order.
pub fn architectures() -> &'static [ArchitectureDescriptor] {
    ARCHITECTURES
}

/// Look up an architecture by its public name.
pub fn resolve(name: &str) -> Result<&'static ArchitectureDescriptor> {
    ARCHITECTURES
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| {
            ConfigError::UnsupportedArchitecture {
                name: name.to_string(),
            }
            .into()
        })
}

/// Classifier-family hyperparameters. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

/// Immutable description of the model being trained.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    descriptor: &'static ArchitectureDescriptor,
    num_classes: usize,
    labels: Option<Vec<String>>,
    params: ClassifierParams,
}

impl ModelConfig {
    /// Resolve `architecture` and validate `params` against it.
    ///
    /// An unsupported `scale` is coerced to `1.0` with a warning; a `scale` on an
    /// architecture without width multipliers is an error.
    pub fn new(architecture: &str, num_classes: usize, params: ClassifierParams) -> Result<Self> {
        let descriptor = resolve(architecture)?;
        if num_classes == 0 {
            return Err(ConfigError::invalid("num_classes must be at least 1").into());
        }
        let params = match descriptor.supported_scales {
            None => {
                if params.scale.is_some() {
                    return Err(ConfigError::UnknownParameter {
                        architecture: architecture.to_string(),
                        key: "scale".to_string(),
                    }
                    .into());
                }
                params
            }
            Some(scales) => {
                let scale = params.scale.unwrap_or(1.0);
                let scale = if scales.iter().any(|s| (s - scale).abs() < 1e-9) {
                    scale
                } else {
                    warn!(
                        "scale={} is not supported by {}, scale is forcibly set to 1.0",
                        scale, descriptor.name
                    );
                    1.0
                };
                ClassifierParams { scale: Some(scale) }
            }
        };
        Ok(Self {
            descriptor,
            num_classes,
            labels: None,
            params,
        })
    }

    /// Rebuild from a metadata `_init_params` mapping.
    pub fn from_init_params(architecture: &str, init_params: &serde_yaml::Mapping) -> Result<Self> {
        let mut rest = init_params.clone();
        let num_classes = rest
            .remove("num_classes")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ConfigError::invalid("_init_params.num_classes is missing"))?
            as usize;
        if let Some(key) = rest
            .keys()
            .filter_map(|k| k.as_str())
            .find(|k| *k != "scale")
        {
            return Err(ConfigError::UnknownParameter {
                architecture: architecture.to_string(),
                key: key.to_string(),
            }
            .into());
        }
        let params: ClassifierParams = serde_yaml::from_value(serde_yaml::Value::Mapping(rest))?;
        Self::new(architecture, num_classes, params)
    }

    /// Constructor parameters as recorded in `_init_params`.
    pub fn init_params(&self) -> serde_yaml::Mapping {
        let mut map = serde_yaml::Mapping::new();
        map.insert("num_classes".into(), (self.num_classes as u64).into());
        if let Some(scale) = self.params.scale {
            map.insert("scale".into(), scale.into());
        }
        map
    }

    pub fn descriptor(&self) -> &'static ArchitectureDescriptor {
        self.descriptor
    }

    pub fn architecture(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn family(&self) -> ModelFamily {
        self.descriptor.family
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    /// Bind the label list. Later calls replace it only when training restarts.
    pub fn bind_labels(&mut self, labels: Vec<String>) {
        if labels.len() != self.num_classes {
            info!(
                "Dataset provides {} labels for a {}-class model",
                labels.len(),
                self.num_classes
            );
        }
        self.labels = Some(labels);
    }
}
