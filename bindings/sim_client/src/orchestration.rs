use std::time::Instant;

use cloudbench_core::prelude::{Resource, ResourceManager};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cloud::{Session, SimCloud};
use crate::error::{SimApiError, SimResult};
use crate::timeline::{History, Operation};

#[derive(Debug)]
pub(crate) struct StackRecord {
    id: String,
    name: String,
    project_id: String,
    template: Value,
    parameters: Map<String, Value>,
    history: History,
}

impl StackRecord {
    pub(crate) fn project_id(&self) -> &str {
        &self.project_id
    }

    pub(crate) fn is_deleted(&self, now: Instant) -> bool {
        self.history.status_at(now) == Some("DELETE_COMPLETE")
    }

    fn snapshot(&self, now: Instant) -> Stack {
        let stack_status = self.history.status_at(now).unwrap_or("INIT").to_string();
        Stack {
            id: self.id.clone(),
            name: self.name.clone(),
            project_id: self.project_id.clone(),
            stack_status_reason: self.history.fault().map(str::to_string),
            stack_status,
            template: self.template.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// A point-in-time view of an orchestration stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stack {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub stack_status: String,
    pub stack_status_reason: Option<String>,
    pub template: Value,
    pub parameters: Map<String, Value>,
}

impl Resource for Stack {
    fn resource_type(&self) -> String {
        "Stack".to_string()
    }

    fn attribute(&self, attr: &str) -> Option<String> {
        match attr {
            "id" => Some(self.id.clone()),
            "name" => Some(self.name.clone()),
            "project_id" => Some(self.project_id.clone()),
            "stack_status" | "status" => Some(self.stack_status.clone()),
            "stack_status_reason" | "fault" => self.stack_status_reason.clone(),
            _ => None,
        }
    }
}

/// The orchestration API, scoped to a session's project.
#[derive(Debug, Clone)]
pub struct OrchestrationClient {
    cloud: SimCloud,
    session: Session,
}

impl OrchestrationClient {
    pub(crate) fn new(cloud: SimCloud, session: Session) -> Self {
        Self { cloud, session }
    }

    fn visible(&self, record: &StackRecord) -> bool {
        self.session.is_admin || record.project_id == self.session.project_id
    }

    pub fn create_stack(
        &self,
        name: &str,
        template: Value,
        parameters: Map<String, Value>,
    ) -> SimResult<Stack> {
        let now = self.cloud.now();
        let mut state = self.cloud.lock();
        let fault = state.take_fault(Operation::CreateStack)?;

        if state
            .stacks
            .values()
            .any(|s| s.name == name && s.project_id == self.session.project_id && !s.is_deleted(now))
        {
            return Err(SimApiError::Conflict(format!("stack {name} already exists")));
        }

        let id = state.next_id("stk");
        let mut record = StackRecord {
            id: id.clone(),
            name: name.to_string(),
            project_id: self.session.project_id.clone(),
            template,
            parameters,
            history: History::default(),
        };
        record
            .history
            .schedule(now, &self.cloud.config().stack_create, fault.as_ref());

        let stack = record.snapshot(now);
        state.stacks.insert(id, record);
        log::debug!("Created stack {} ({})", stack.name, stack.id);

        Ok(stack)
    }

    pub fn get_stack(&self, id: &str) -> SimResult<Stack> {
        let now = self.cloud.now();
        let mut state = self.cloud.lock();
        state.take_fault(Operation::GetStack)?;

        state
            .stacks
            .get(id)
            .filter(|s| self.visible(s))
            .map(|s| s.snapshot(now))
            .ok_or_else(|| SimApiError::NotFound {
                kind: "Stack",
                id: id.to_string(),
            })
    }

    pub fn list_stacks(&self) -> Vec<Stack> {
        let now = self.cloud.now();
        let state = self.cloud.lock();
        state
            .stacks
            .values()
            .filter(|s| self.visible(s) && !s.is_deleted(now))
            .map(|s| s.snapshot(now))
            .collect()
    }

    pub fn delete_stack(&self, id: &str) -> SimResult<()> {
        let now = self.cloud.now();
        let mut state = self.cloud.lock();
        let fault = state.take_fault(Operation::DeleteStack)?;

        let timeline = self.cloud.config().stack_delete.clone();
        let session = &self.session;
        let record = state
            .stacks
            .get_mut(id)
            .filter(|s| session.is_admin || s.project_id == session.project_id)
            .ok_or_else(|| SimApiError::NotFound {
                kind: "Stack",
                id: id.to_string(),
            })?;

        if record.is_deleted(now) {
            return Err(SimApiError::NotFound {
                kind: "Stack",
                id: id.to_string(),
            });
        }

        record.history.schedule(now, &timeline, fault.as_ref());
        log::debug!("Deleting stack {} ({id})", record.name);

        Ok(())
    }
}

impl ResourceManager for OrchestrationClient {
    type Resource = Stack;

    fn get(&self, id: &str) -> anyhow::Result<Option<Stack>> {
        match self.get_stack(id) {
            Ok(stack) => Ok(Some(stack)),
            Err(SimApiError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
