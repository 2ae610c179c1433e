use anyhow::{bail, Context};
use cloudbench_runner::prelude::{
    ConfigurationError, ContextPlugin, Credential, HookResult, Permission, RunnerContext,
    ValidationError, Validator,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use sim_cloud_client::prelude::{IdentityClient, SimCloud, SimCloudConfig};

use crate::runner_context::SimRunnerContext;

pub const SIM_CLOUD_CONTEXT: &str = "sim_cloud";
pub const USERS_CONTEXT: &str = "users";

/// Starts a simulated cloud for the workload.
///
/// The context configuration is a [SimCloudConfig]. The deployment admin and any existing users
/// from the bench configuration are registered so that they can log in.
pub fn sim_cloud_context() -> ContextPlugin<SimRunnerContext> {
    ContextPlugin::new(SIM_CLOUD_CONTEXT, -100, setup_sim_cloud).with_cleanup(cleanup_sim_cloud)
}

/// Creates `tenants` projects with `users_per_tenant` users each, which the iterations then run as.
pub fn users_context() -> ContextPlugin<SimRunnerContext> {
    ContextPlugin::new(USERS_CONTEXT, 0, setup_users).with_cleanup(cleanup_users)
}

fn setup_sim_cloud(ctx: &mut RunnerContext<SimRunnerContext>, config: &Value) -> HookResult {
    let config = SimCloudConfig::from_value(config)?;
    let cloud = SimCloud::new(config, ctx.clock().clone());

    if let Some(admin) = ctx.admin() {
        cloud.add_admin(&admin.username, &admin.password);
    }
    for user in ctx.users() {
        cloud.add_user(&user.username, &user.password, &user.project);
    }

    log::info!(
        "Simulated cloud started with services: {}",
        cloud.config().services.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    ctx.get_mut().cloud = Some(cloud);

    Ok(())
}

fn cleanup_sim_cloud(ctx: &RunnerContext<SimRunnerContext>, _config: &Value) -> HookResult {
    let leftover = ctx.get().cloud()?.live_resources();
    if leftover > 0 {
        log::warn!("{leftover} resources were left behind in the simulated cloud");
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct UsersConfig {
    tenants: usize,
    users_per_tenant: usize,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            tenants: 1,
            users_per_tenant: 1,
        }
    }
}

fn admin_identity(ctx: &RunnerContext<SimRunnerContext>) -> anyhow::Result<IdentityClient> {
    let Some(admin) = ctx.admin() else {
        bail!(ConfigurationError(
            "the users context needs admin credentials in the deployment configuration".to_string()
        ));
    };

    Ok(ctx
        .get()
        .cloud()?
        .connect(&admin.username, &admin.password)?
        .identity()?)
}

fn setup_users(ctx: &mut RunnerContext<SimRunnerContext>, config: &Value) -> HookResult {
    let config: UsersConfig = serde_json::from_value(config.clone())
        .map_err(|e| ConfigurationError(format!("invalid users configuration: {e}")))?;
    if config.tenants == 0 || config.users_per_tenant == 0 {
        bail!(ConfigurationError(
            "tenants and users_per_tenant must be at least 1".to_string()
        ));
    }

    let identity = admin_identity(ctx)?;
    let mut credentials = Vec::with_capacity(config.tenants * config.users_per_tenant);

    let created = (|| -> anyhow::Result<()> {
        for _ in 0..config.tenants {
            let project = identity.create_project(&ctx.generate_random_name())?;
            ctx.get_mut().created_projects.push(project.clone());

            for _ in 0..config.users_per_tenant {
                let password = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(16)
                    .map(char::from)
                    .collect::<String>();
                let user =
                    identity.create_user(&ctx.generate_random_name(), &password, &project.id)?;
                credentials.push(Credential {
                    username: user.name.clone(),
                    password,
                    project: project.name.clone(),
                    project_id: Some(project.id.clone()),
                });
                ctx.get_mut().created_users.push(user);
            }
        }
        Ok(())
    })();

    if let Err(e) = created {
        // Nothing else will clean up after a context whose setup failed.
        delete_created(&identity, ctx.get());
        return Err(e).context("Failed to create users");
    }

    log::info!(
        "Created {} users in {} tenants",
        credentials.len(),
        config.tenants
    );
    ctx.set_users(credentials);

    Ok(())
}

fn cleanup_users(ctx: &RunnerContext<SimRunnerContext>, _config: &Value) -> HookResult {
    let identity = admin_identity(ctx)?;
    let failures = delete_created(&identity, ctx.get());
    if failures > 0 {
        bail!("{failures} users or tenants could not be deleted");
    }

    Ok(())
}

/// Delete the users and then the projects the context created. Returns how many deletions failed.
fn delete_created(identity: &IdentityClient, value: &SimRunnerContext) -> usize {
    let mut failures = 0;
    for user in &value.created_users {
        if let Err(e) = identity.delete_user(&user.id) {
            log::warn!("Failed to delete user {}: {e}", user.name);
            failures += 1;
        }
    }
    for project in &value.created_projects {
        if let Err(e) = identity.delete_project(&project.id) {
            log::warn!("Failed to delete tenant {}: {e}", project.name);
            failures += 1;
        }
    }
    failures
}

/// Fails unless every service in `services` is in the simulated cloud's catalog.
pub fn required_services(services: &[&str]) -> Validator<SimRunnerContext> {
    let services = services.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    Validator::credential("required_services", Permission::User, move |ctx: &RunnerContext<SimRunnerContext>, _, _| {
        let cloud = ctx
            .get()
            .cloud()
            .map_err(|e| ValidationError(format!("{e:#}")))?;
        let missing = services
            .iter()
            .filter(|s| !cloud.has_service(s))
            .cloned()
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError(format!(
                "services not available: {}",
                missing.join(", ")
            )))
        }
    })
}
