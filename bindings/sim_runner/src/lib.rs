mod common;
mod context;
mod runner_context;

pub mod prelude {
    /// Common operations for scenarios against the simulated cloud.
    ///
    /// This is a good place to start if you are getting started writing scenarios.
    pub use crate::common::{ComputeScenario, OrchestrationScenario, SimScenarioContext};

    pub use crate::context::{
        required_services, sim_cloud_context, users_context, SIM_CLOUD_CONTEXT, USERS_CONTEXT,
    };
    pub use crate::runner_context::SimRunnerContext;

    /// Re-export of the `cloudbench_runner` prelude.
    ///
    /// This is for convenience so that you can depend on a single crate for the runner in your scenarios.
    pub use cloudbench_runner::prelude::*;

    /// Re-export of the simulated cloud client for convenience.
    pub use sim_cloud_client::prelude::*;
}
