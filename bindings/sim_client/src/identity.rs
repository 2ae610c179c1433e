use serde::Serialize;

use crate::cloud::{Account, Session, SimCloud};
use crate::error::{SimApiError, SimResult};
use crate::timeline::{Fault, Operation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub project_id: String,
}

/// Admin-only management of projects and users.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    cloud: SimCloud,
    session: Session,
}

impl IdentityClient {
    pub(crate) fn new(cloud: SimCloud, session: Session) -> Self {
        Self { cloud, session }
    }

    pub fn create_project(&self, name: &str) -> SimResult<ProjectRecord> {
        let mut state = self.cloud.lock();
        if state.projects.values().any(|p| p.name == name) {
            return Err(SimApiError::Conflict(format!("project {name} already exists")));
        }

        let project = ProjectRecord {
            id: state.next_id("prj"),
            name: name.to_string(),
        };
        state.projects.insert(project.id.clone(), project.clone());
        log::debug!("{} created project {name} ({})", self.session.username, project.id);

        Ok(project)
    }

    /// Create a user that can log in with `password`, scoped to `project_id`.
    pub fn create_user(&self, name: &str, password: &str, project_id: &str) -> SimResult<UserRecord> {
        let mut state = self.cloud.lock();
        if let Some(Fault::EndIn { fault, .. }) = state.take_fault(Operation::CreateUser)? {
            return Err(SimApiError::Injected {
                operation: Operation::CreateUser.to_string(),
                message: fault,
            });
        }

        if !state.projects.contains_key(project_id) {
            return Err(SimApiError::NotFound {
                kind: "Project",
                id: project_id.to_string(),
            });
        }
        if state.accounts.contains_key(name) {
            return Err(SimApiError::Conflict(format!("user {name} already exists")));
        }

        let user = UserRecord {
            id: state.next_id("usr"),
            name: name.to_string(),
            project_id: project_id.to_string(),
        };
        state.users.insert(user.id.clone(), user.clone());
        state.accounts.insert(
            name.to_string(),
            Account {
                user_id: user.id.clone(),
                password: password.to_string(),
                project_id: project_id.to_string(),
                is_admin: false,
            },
        );
        log::debug!("{} created user {name} ({})", self.session.username, user.id);

        Ok(user)
    }

    pub fn list_users(&self) -> Vec<UserRecord> {
        self.cloud.lock().users.values().cloned().collect()
    }

    pub fn list_projects(&self) -> Vec<ProjectRecord> {
        self.cloud.lock().projects.values().cloned().collect()
    }

    pub fn delete_user(&self, user_id: &str) -> SimResult<()> {
        let mut state = self.cloud.lock();
        let user = state.users.remove(user_id).ok_or_else(|| SimApiError::NotFound {
            kind: "User",
            id: user_id.to_string(),
        })?;
        state.accounts.remove(&user.name);
        log::debug!("Deleted user {} ({user_id})", user.name);

        Ok(())
    }

    /// Delete an empty project. Projects still owning users or live resources are a conflict.
    pub fn delete_project(&self, project_id: &str) -> SimResult<()> {
        let now = self.cloud.now();
        let mut state = self.cloud.lock();
        if !state.projects.contains_key(project_id) {
            return Err(SimApiError::NotFound {
                kind: "Project",
                id: project_id.to_string(),
            });
        }

        let owns_users = state.users.values().any(|u| u.project_id == project_id);
        let owns_resources = state
            .stacks
            .values()
            .any(|s| s.project_id() == project_id && !s.is_deleted(now))
            || state
                .servers
                .values()
                .any(|s| s.project_id() == project_id && !s.is_deleted(now));
        if owns_users || owns_resources {
            return Err(SimApiError::Conflict(format!(
                "project {project_id} still owns users or resources"
            )));
        }

        state.projects.remove(project_id);
        log::debug!("Deleted project {project_id}");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup() -> (SimCloud, IdentityClient) {
        let cloud = SimCloud::default();
        cloud.add_admin("admin", "secret");
        let identity = cloud.connect("admin", "secret").unwrap().identity().unwrap();
        (cloud, identity)
    }

    #[test]
    fn created_users_can_log_in() {
        let (cloud, identity) = setup();
        let project = identity.create_project("tenant-1").unwrap();
        let user = identity.create_user("u1", "pw", &project.id).unwrap();

        let session = cloud.login("u1", "pw").unwrap();
        assert_eq!(user.id, session.user_id);
        assert_eq!(project.id, session.project_id);
        assert!(!session.is_admin);

        identity.delete_user(&user.id).unwrap();
        assert!(cloud.login("u1", "pw").is_err());
    }

    #[test]
    fn project_with_users_cannot_be_deleted() {
        let (_, identity) = setup();
        let project = identity.create_project("tenant-1").unwrap();
        let user = identity.create_user("u1", "pw", &project.id).unwrap();

        assert!(matches!(
            identity.delete_project(&project.id),
            Err(SimApiError::Conflict(_))
        ));

        identity.delete_user(&user.id).unwrap();
        identity.delete_project(&project.id).unwrap();
        assert!(identity.list_projects().iter().all(|p| p.id != project.id));
    }

    #[test]
    fn injected_create_user_failure() {
        let (cloud, identity) = setup();
        let project = identity.create_project("tenant-1").unwrap();
        cloud.inject(Operation::CreateUser, Fault::ApiError("quota".to_string()));

        assert!(matches!(
            identity.create_user("u1", "pw", &project.id),
            Err(SimApiError::Injected { .. })
        ));
        assert!(identity.create_user("u1", "pw", &project.id).is_ok());
    }
}
