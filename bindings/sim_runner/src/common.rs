use cloudbench_instruments::atomic_action;
use cloudbench_runner::prelude::{
    get_from_manager, ScenarioContext, WaitSpec, DEFAULT_ERROR_STATUSES,
};
use serde_json::{Map, Value};
use sim_cloud_client::prelude::{
    ComputeClient, OrchestrationClient, Server, Stack, COMPUTE, ORCHESTRATION,
};

use crate::runner_context::SimRunnerContext;

pub type SimScenarioContext = ScenarioContext<SimRunnerContext>;

/// Orchestration operations, each timed as an atomic action and waiting for the stack to settle.
pub trait OrchestrationScenario {
    fn orchestration_client(&self) -> anyhow::Result<OrchestrationClient>;

    /// Create a stack with a random name and wait for `CREATE_COMPLETE`.
    fn create_stack(&mut self, template: &Value, parameters: &Map<String, Value>)
        -> anyhow::Result<Stack>;

    /// Delete a stack and wait until it is gone.
    fn delete_stack(&mut self, stack: Stack) -> anyhow::Result<()>;
}

impl OrchestrationScenario for SimScenarioContext {
    fn orchestration_client(&self) -> anyhow::Result<OrchestrationClient> {
        Ok(self.clients(ORCHESTRATION)?.orchestration()?)
    }

    #[atomic_action("heat.create_stack")]
    fn create_stack(
        &mut self,
        template: &Value,
        parameters: &Map<String, Value>,
    ) -> anyhow::Result<Stack> {
        let client = self.orchestration_client()?;
        let stack = client.create_stack(
            &self.generate_random_name(),
            template.clone(),
            parameters.clone(),
        )?;

        let stack = self.poller().wait_for_status(
            stack,
            get_from_manager(&client, &[]),
            &WaitSpec::ready(["CREATE_COMPLETE"]).failure(["CREATE_FAILED"]),
        )?;

        Ok(stack)
    }

    #[atomic_action("heat.delete_stack")]
    fn delete_stack(&mut self, stack: Stack) -> anyhow::Result<()> {
        let client = self.orchestration_client()?;
        client.delete_stack(&stack.id)?;
        self.poller()
            .wait_for_delete(stack, get_from_manager(&client, &["DELETE_FAILED"]))?;

        Ok(())
    }
}

/// Compute operations, each timed as an atomic action and waiting for the server to settle.
pub trait ComputeScenario {
    fn compute_client(&self) -> anyhow::Result<ComputeClient>;

    /// Boot a server with a random name and wait for it to become `ACTIVE`.
    fn boot_server(&mut self, flavor: &str, image: &str) -> anyhow::Result<Server>;

    fn delete_server(&mut self, server: Server) -> anyhow::Result<()>;

    fn reboot_server(&mut self, server: &Server) -> anyhow::Result<Server>;

    fn stop_server(&mut self, server: &Server) -> anyhow::Result<Server>;

    fn start_server(&mut self, server: &Server) -> anyhow::Result<Server>;
}

impl ComputeScenario for SimScenarioContext {
    fn compute_client(&self) -> anyhow::Result<ComputeClient> {
        Ok(self.clients(COMPUTE)?.compute()?)
    }

    #[atomic_action("nova.boot_server")]
    fn boot_server(&mut self, flavor: &str, image: &str) -> anyhow::Result<Server> {
        let client = self.compute_client()?;
        let server = client.boot_server(&self.generate_random_name(), flavor, image)?;

        let server = self.poller().wait_for_status(
            server,
            get_from_manager(&client, DEFAULT_ERROR_STATUSES),
            &WaitSpec::ready(["ACTIVE"]),
        )?;

        Ok(server)
    }

    #[atomic_action("nova.delete_server")]
    fn delete_server(&mut self, server: Server) -> anyhow::Result<()> {
        let client = self.compute_client()?;
        client.delete_server(&server.id)?;
        self.poller()
            .wait_for_delete(server, get_from_manager(&client, DEFAULT_ERROR_STATUSES))?;

        Ok(())
    }

    #[atomic_action("nova.reboot_server")]
    fn reboot_server(&mut self, server: &Server) -> anyhow::Result<Server> {
        let client = self.compute_client()?;
        client.reboot_server(&server.id)?;
        wait_for_server(self, &client, server, "ACTIVE")
    }

    #[atomic_action("nova.stop_server")]
    fn stop_server(&mut self, server: &Server) -> anyhow::Result<Server> {
        let client = self.compute_client()?;
        client.stop_server(&server.id)?;
        wait_for_server(self, &client, server, "SHUTOFF")
    }

    #[atomic_action("nova.start_server")]
    fn start_server(&mut self, server: &Server) -> anyhow::Result<Server> {
        let client = self.compute_client()?;
        client.start_server(&server.id)?;
        wait_for_server(self, &client, server, "ACTIVE")
    }
}

fn wait_for_server(
    ctx: &SimScenarioContext,
    client: &ComputeClient,
    server: &Server,
    status: &str,
) -> anyhow::Result<Server> {
    Ok(ctx.poller().wait_for_status(
        server.clone(),
        get_from_manager(client, DEFAULT_ERROR_STATUSES),
        &WaitSpec::ready([status]),
    )?)
}
