//! Rudder chart sources
//!
//! Resolves `(repository URL, chart name, version)` into a loaded [`Chart`]:
//!
//! - **HTTP repositories**: Helm-style repos with `index.yaml`
//! - **Memory**: pre-loaded charts for tests and embedded use
//!
//! Downloads are verified against the index digest when one is published.
//!
//! [`Chart`]: rudder_core::Chart

pub mod error;
pub mod http;
pub mod index;
pub mod source;

pub use error::{RepoError, Result};
pub use http::HttpChartSource;
pub use index::{ChartEntry, ChartIndex};
pub use source::{ChartSource, MemoryChartSource};
