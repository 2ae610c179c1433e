//! A simulated cloud for running benchmark scenarios without real infrastructure.
//!
//! Every resource moves through a configurable status timeline measured against a shared
//! [cloudbench_core::prelude::Clock], and faults can be queued against individual API operations
//! so that failure handling can be exercised deterministically.

mod cloud;
mod compute;
mod error;
mod identity;
mod orchestration;
mod timeline;

pub use cloud::{Session, SimClients, SimCloud, SimCloudConfig, COMPUTE, IDENTITY, ORCHESTRATION};
pub use compute::{ComputeClient, Server};
pub use error::{SimApiError, SimResult};
pub use identity::{IdentityClient, ProjectRecord, UserRecord};
pub use orchestration::{OrchestrationClient, Stack};
pub use timeline::{Fault, FaultSpec, Operation, Timeline, TimelineStep};

pub mod prelude {
    pub use crate::{
        ComputeClient, Fault, FaultSpec, IdentityClient, Operation, OrchestrationClient,
        ProjectRecord, Server, Session, SimApiError, SimClients, SimCloud, SimCloudConfig,
        SimResult, Stack, Timeline, UserRecord, COMPUTE, IDENTITY, ORCHESTRATION,
    };
}
