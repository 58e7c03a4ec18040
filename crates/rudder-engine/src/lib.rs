//! Rudder Engine - chart rendering for the release agent
//!
//! This crate turns a chart plus values into cluster-ready manifests:
//! - `Engine`: MiniJinja environment with Kubernetes-oriented filters
//! - `sort`: document splitting, hook extraction and install ordering
//! - `placeholder`: keeps user templating expressions alive across label injection
//! - `label`: stamps release identity and image pull secrets onto every object
//! - `pipeline`: the render / label / restore sequence used by the release engine

pub mod engine;
pub mod error;
pub mod filters;
pub mod functions;
pub mod label;
pub mod pipeline;
pub mod placeholder;
pub mod sort;

pub use engine::{Engine, EngineBuilder, RenderResult};
pub use error::{EngineError, Result, TemplateError, TemplateErrorKind};
pub use label::{LabelRequest, ManifestLabeler, YamlLabeler, CHART_ANNOTATION, RELEASE_LABEL, TEST_LABEL};
pub use pipeline::{PreparedChart, RenderPipeline, RenderRequest, RenderedRelease};
pub use placeholder::{ExpressionMap, PLACEHOLDER_MARKER, UNRESOLVED_PLACEHOLDER};
pub use sort::{HookManifest, Manifest, SortedManifests, INSTALL_ORDER};
