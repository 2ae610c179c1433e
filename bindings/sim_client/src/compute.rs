use std::time::Instant;

use cloudbench_core::prelude::{Resource, ResourceManager};
use serde::Serialize;

use crate::cloud::{Session, SimCloud};
use crate::error::{SimApiError, SimResult};
use crate::timeline::{History, Operation, Timeline};

#[derive(Debug)]
pub(crate) struct ServerRecord {
    id: String,
    name: String,
    project_id: String,
    flavor: String,
    image: String,
    history: History,
}

impl ServerRecord {
    pub(crate) fn project_id(&self) -> &str {
        &self.project_id
    }

    pub(crate) fn is_deleted(&self, now: Instant) -> bool {
        self.history.status_at(now) == Some("DELETED")
    }

    fn snapshot(&self, now: Instant) -> Server {
        Server {
            id: self.id.clone(),
            name: self.name.clone(),
            project_id: self.project_id.clone(),
            status: self.history.status_at(now).unwrap_or("BUILD").to_string(),
            fault: self.history.fault().map(str::to_string),
            flavor: self.flavor.clone(),
            image: self.image.clone(),
        }
    }
}

/// A point-in-time view of a compute server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub status: String,
    pub fault: Option<String>,
    pub flavor: String,
    pub image: String,
}

impl Resource for Server {
    fn resource_type(&self) -> String {
        "Server".to_string()
    }

    fn attribute(&self, attr: &str) -> Option<String> {
        match attr {
            "id" => Some(self.id.clone()),
            "name" => Some(self.name.clone()),
            "project_id" => Some(self.project_id.clone()),
            "status" => Some(self.status.clone()),
            "fault" => self.fault.clone(),
            "flavor" => Some(self.flavor.clone()),
            "image" => Some(self.image.clone()),
            _ => None,
        }
    }
}

/// The compute API, scoped to a session's project.
#[derive(Debug, Clone)]
pub struct ComputeClient {
    cloud: SimCloud,
    session: Session,
}

impl ComputeClient {
    pub(crate) fn new(cloud: SimCloud, session: Session) -> Self {
        Self { cloud, session }
    }

    pub fn boot_server(&self, name: &str, flavor: &str, image: &str) -> SimResult<Server> {
        let now = self.cloud.now();
        let mut state = self.cloud.lock();
        let fault = state.take_fault(Operation::BootServer)?;

        let id = state.next_id("srv");
        let mut record = ServerRecord {
            id: id.clone(),
            name: name.to_string(),
            project_id: self.session.project_id.clone(),
            flavor: flavor.to_string(),
            image: image.to_string(),
            history: History::default(),
        };
        record
            .history
            .schedule(now, &self.cloud.config().server_boot, fault.as_ref());

        let server = record.snapshot(now);
        state.servers.insert(id, record);
        log::debug!("Booted server {} ({})", server.name, server.id);

        Ok(server)
    }

    pub fn get_server(&self, id: &str) -> SimResult<Server> {
        let now = self.cloud.now();
        let mut state = self.cloud.lock();
        state.take_fault(Operation::GetServer)?;

        state
            .servers
            .get(id)
            .filter(|s| self.visible(s) && !s.is_deleted(now))
            .map(|s| s.snapshot(now))
            .ok_or_else(|| not_found(id))
    }

    pub fn list_servers(&self) -> Vec<Server> {
        let now = self.cloud.now();
        let state = self.cloud.lock();
        state
            .servers
            .values()
            .filter(|s| self.visible(s) && !s.is_deleted(now))
            .map(|s| s.snapshot(now))
            .collect()
    }

    pub fn delete_server(&self, id: &str) -> SimResult<()> {
        let timeline = self.cloud.config().server_delete.clone();
        self.transition(id, Operation::DeleteServer, &timeline, None)
    }

    /// Reboot an active server. Hard and soft reboots behave the same in the simulation.
    pub fn reboot_server(&self, id: &str) -> SimResult<()> {
        let timeline = self.cloud.config().server_reboot.clone();
        self.transition(id, Operation::RebootServer, &timeline, Some("ACTIVE"))
    }

    pub fn stop_server(&self, id: &str) -> SimResult<()> {
        let timeline = self.cloud.config().server_stop.clone();
        self.transition(id, Operation::StopServer, &timeline, Some("ACTIVE"))
    }

    pub fn start_server(&self, id: &str) -> SimResult<()> {
        let timeline = self.cloud.config().server_start.clone();
        self.transition(id, Operation::StartServer, &timeline, Some("SHUTOFF"))
    }

    fn visible(&self, record: &ServerRecord) -> bool {
        self.session.is_admin || record.project_id == self.session.project_id
    }

    /// Move a server through `timeline`, if it is currently in `required_status`.
    fn transition(
        &self,
        id: &str,
        operation: Operation,
        timeline: &Timeline,
        required_status: Option<&str>,
    ) -> SimResult<()> {
        let now = self.cloud.now();
        let mut state = self.cloud.lock();
        let fault = state.take_fault(operation)?;

        let session = &self.session;
        let record = state
            .servers
            .get_mut(id)
            .filter(|s| (session.is_admin || s.project_id == session.project_id) && !s.is_deleted(now))
            .ok_or_else(|| not_found(id))?;

        let current = record.history.status_at(now).unwrap_or("BUILD");
        if let Some(required) = required_status {
            if current != required {
                return Err(SimApiError::Conflict(format!(
                    "cannot {operation} server {id} while it is {current}"
                )));
            }
        }

        record.history.schedule(now, timeline, fault.as_ref());
        log::debug!("{operation} on server {} ({id})", record.name);

        Ok(())
    }
}

fn not_found(id: &str) -> SimApiError {
    SimApiError::NotFound {
        kind: "Server",
        id: id.to_string(),
    }
}

impl ResourceManager for ComputeClient {
    type Resource = Server;

    fn get(&self, id: &str) -> anyhow::Result<Option<Server>> {
        match self.get_server(id) {
            Ok(server) => Ok(Some(server)),
            Err(SimApiError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::SimCloudConfig;
    use crate::timeline::Fault;
    use cloudbench_core::prelude::ManualClock;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (SimCloud, Arc<ManualClock>, ComputeClient) {
        let clock = Arc::new(ManualClock::new());
        let cloud = SimCloud::new(SimCloudConfig::default(), clock.clone());
        cloud.add_user("demo", "pw", "demo");
        let client = cloud.connect("demo", "pw").unwrap().compute().unwrap();
        (cloud, clock, client)
    }

    #[test]
    fn boot_stop_start_delete() {
        let (_, clock, client) = setup();

        let server = client.boot_server("vm", "m1.tiny", "cirros").unwrap();
        assert_eq!("BUILD", server.status);
        clock.advance(Duration::from_secs(2));
        assert_eq!("ACTIVE", client.get_server(&server.id).unwrap().status);

        client.stop_server(&server.id).unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!("SHUTOFF", client.get_server(&server.id).unwrap().status);

        client.start_server(&server.id).unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!("ACTIVE", client.get_server(&server.id).unwrap().status);

        client.delete_server(&server.id).unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(None, client.get(&server.id).unwrap());
    }

    #[test]
    fn reboot_requires_active() {
        let (_, _, client) = setup();
        let server = client.boot_server("vm", "m1.tiny", "cirros").unwrap();

        assert!(matches!(
            client.reboot_server(&server.id),
            Err(SimApiError::Conflict(_))
        ));
    }

    #[test]
    fn injected_api_error_fails_get() {
        let (cloud, _, client) = setup();
        let server = client.boot_server("vm", "m1.tiny", "cirros").unwrap();
        cloud.inject(Operation::GetServer, Fault::ApiError("503".to_string()));

        assert!(client.get(&server.id).is_err());
        assert!(client.get(&server.id).unwrap().is_some());
    }
}
