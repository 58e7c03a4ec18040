//! Rudder Core - shared types for the in-cluster release agent
//!
//! This crate provides the foundational types used throughout rudder:
//! - `Chart`: a packaged chart (templates, default values, subcharts)
//! - `Values`: structured configuration with deep merge and expression scrubbing
//! - `Release`: the actual state of a deployed release
//! - `request`: payloads exchanged between the reconciler and the executor
//! - `TemplateContext`: what templates see while rendering

pub mod chart;
pub mod context;
pub mod error;
pub mod release;
pub mod request;
pub mod values;

pub use chart::{Chart, ChartDependency, ChartMetadata, ChartTemplate};
pub use context::{Capabilities, ChartInfo, KubeVersion, TemplateContext, TemplateInfo};
pub use error::{CoreError, Result};
pub use release::{
    HookEvent, Release, ReleaseHook, ReleaseInfo, ReleaseResource, ReleaseStatus,
};
pub use request::{
    CertManagerInfo, DeleteReleaseRequest, GetReleaseContentRequest, ImagePullSecret,
    InstallReleaseRequest, OldEnv, RollbackReleaseRequest, StartReleaseRequest,
    StartReleaseResponse, StopReleaseRequest, StopReleaseResponse, TestReleaseRequest,
    UpgradeInfo, UpgradeReleaseRequest,
};
pub use values::{Values, contains_template_expression};
