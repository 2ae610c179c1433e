use anyhow::Context;
use cloudbench_runner::prelude::{Credential, ServiceClients, UserValuesConstraint};
use sim_cloud_client::prelude::{ProjectRecord, SimClients, SimCloud, SimApiError, UserRecord};

/// Runner context value for scenarios against the simulated cloud.
///
/// The cloud itself is created by the `sim_cloud` context, and the `users` context records what it
/// created here so that it can be removed again.
#[derive(Default, Debug)]
pub struct SimRunnerContext {
    pub(crate) cloud: Option<SimCloud>,
    pub(crate) created_projects: Vec<ProjectRecord>,
    pub(crate) created_users: Vec<UserRecord>,
}

impl UserValuesConstraint for SimRunnerContext {}

impl SimRunnerContext {
    pub fn cloud(&self) -> anyhow::Result<&SimCloud> {
        self.cloud
            .as_ref()
            .context("The simulated cloud is not running, add the 'sim_cloud' context to the workload")
    }

    pub fn created_users(&self) -> &[UserRecord] {
        &self.created_users
    }

    pub fn created_projects(&self) -> &[ProjectRecord] {
        &self.created_projects
    }
}

impl ServiceClients for SimRunnerContext {
    type Client = SimClients;

    fn client(&self, credential: &Credential, service: &str) -> anyhow::Result<SimClients> {
        let cloud = self.cloud()?;
        if !cloud.has_service(service) {
            return Err(SimApiError::ServiceUnavailable(service.to_string()).into());
        }

        cloud
            .connect(&credential.username, &credential.password)
            .with_context(|| format!("Could not connect to {service} as {}", credential.username))
    }
}
