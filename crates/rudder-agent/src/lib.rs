//! Rudder agent - in-cluster release reconciliation
//!
//! Watches `ChartRelease` resources, compares each with the release recorded
//! by [`rudder_kube::ReleaseClient`] and queues the command that converges
//! them. An executor drains the command queue against the release engine and
//! queues one response per outcome.

pub mod channel;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod executor;
pub mod packet;
pub mod reconciler;
pub mod reporter;

pub use channel::{Inbox, Outbox, channels};
pub use config::{AgentOptions, LogFormat};
pub use controller::{ClusterDesiredState, Dispatcher, ObjectKey};
pub use crd::{ChartRelease, ChartReleaseSpec};
pub use error::{AgentError, Result};
pub use executor::{Executor, FailureReport};
pub use packet::{Packet, PacketKey, PacketType};
pub use reconciler::{DesiredStateSource, Outcome, Reconciler, ReleaseLookup};
pub use reporter::{LogReporter, Reporter};
