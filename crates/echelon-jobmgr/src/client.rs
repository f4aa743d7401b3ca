//! Clients for the services the job manager collaborates with.
//!
//! The core consumes three narrow surfaces, each behind a trait with an
//! in-memory implementation for tests:
//!
//! - the **resource manager**, which knows why a PENDING task has not been
//!   placed yet
//! - the **host manager**, which resolves agent addresses and the broker
//!   master endpoint
//! - the **log manager**, which lists a run's sandbox files on its agent

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use echelon_core::JobId;

use crate::error::{Error, Result};

/// Entry for a task the resource manager is actively processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTaskEntry {
    /// Why the task has not been placed yet.
    pub reason: String,
}

/// Client surface of the resource manager.
#[async_trait]
pub trait ResManagerClient: Send + Sync {
    /// Gets the tasks of a job the resource manager is processing, keyed by
    /// `<job>-<instance>` name.
    async fn get_active_tasks(&self, job_id: &JobId) -> Result<HashMap<String, ActiveTaskEntry>>;
}

/// A broker agent's address information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    /// The agent's PID string, e.g. `slave(1)@10.2.3.4:5051`.
    pub pid: String,
}

/// A resolved `host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    /// Hostname or address.
    pub hostname: String,
    /// Port, as the wire carries it.
    pub port: String,
}

/// Client surface of the host manager.
#[async_trait]
pub trait HostManagerClient: Send + Sync {
    /// Resolves a broker agent by hostname.
    async fn agent_info(&self, hostname: &str) -> Result<Option<AgentInfo>>;

    /// The broker master's endpoint.
    async fn master_host_port(&self) -> Result<HostPort>;
}

/// Client surface of the log manager.
#[async_trait]
pub trait LogManager: Send + Sync {
    /// Lists the sandbox file paths of one run on its agent.
    #[allow(clippy::too_many_arguments)]
    async fn list_sandbox_files_paths(
        &self,
        work_dir: &str,
        framework_id: &str,
        agent_ip: &str,
        agent_port: &str,
        agent_id: &str,
        pod_id: &str,
    ) -> Result<Vec<String>>;
}

/// Splits an agent PID string into its ip and port.
///
/// PIDs look like `slave(1)@10.2.3.4:5051`; the port is optional.
///
/// # Errors
///
/// Returns an invalid-argument error when the PID carries no `@` separator
/// or an empty address.
pub fn extract_ip_port_from_agent_pid(pid: &str) -> Result<(String, Option<String>)> {
    let (_, address) = pid
        .split_once('@')
        .ok_or_else(|| Error::invalid_argument(format!("malformed agent pid '{pid}'")))?;
    if address.is_empty() {
        return Err(Error::invalid_argument(format!(
            "agent pid '{pid}' carries no address"
        )));
    }
    match address.rsplit_once(':') {
        Some((ip, port)) if !port.is_empty() => Ok((ip.to_string(), Some(port.to_string()))),
        Some((ip, _)) => Ok((ip.to_string(), None)),
        None => Ok((address.to_string(), None)),
    }
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("client registry lock poisoned")
}

/// In-memory resource manager for testing.
#[derive(Debug, Default)]
pub struct InMemoryResManager {
    tasks: RwLock<HashMap<String, ActiveTaskEntry>>,
}

impl InMemoryResManager {
    /// Creates an empty resource manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending reason under a `<job>-<instance>` name.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_reason(&self, task_name: &str, reason: &str) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        tasks.insert(
            task_name.to_string(),
            ActiveTaskEntry {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ResManagerClient for InMemoryResManager {
    async fn get_active_tasks(&self, job_id: &JobId) -> Result<HashMap<String, ActiveTaskEntry>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        let prefix = format!("{job_id}-");
        Ok(tasks
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect())
    }
}

/// In-memory host manager for testing.
#[derive(Debug)]
pub struct InMemoryHostManager {
    agents: RwLock<HashMap<String, AgentInfo>>,
    master: HostPort,
}

impl InMemoryHostManager {
    /// Creates a host manager with the given master endpoint.
    #[must_use]
    pub fn new(master: HostPort) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            master,
        }
    }

    /// Registers an agent under its hostname.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_agent(&self, hostname: &str, pid: &str) -> Result<()> {
        let mut agents = self.agents.write().map_err(poison_err)?;
        agents.insert(
            hostname.to_string(),
            AgentInfo {
                pid: pid.to_string(),
            },
        );
        Ok(())
    }
}

impl Default for InMemoryHostManager {
    fn default() -> Self {
        Self::new(HostPort {
            hostname: "master.local".to_string(),
            port: "5050".to_string(),
        })
    }
}

#[async_trait]
impl HostManagerClient for InMemoryHostManager {
    async fn agent_info(&self, hostname: &str) -> Result<Option<AgentInfo>> {
        let agents = self.agents.read().map_err(poison_err)?;
        Ok(agents.get(hostname).cloned())
    }

    async fn master_host_port(&self) -> Result<HostPort> {
        Ok(self.master.clone())
    }
}

/// In-memory log manager for testing.
///
/// Composes the canonical sandbox layout instead of talking to an agent.
#[derive(Debug, Default)]
pub struct InMemoryLogManager;

impl InMemoryLogManager {
    /// Creates a log manager.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LogManager for InMemoryLogManager {
    async fn list_sandbox_files_paths(
        &self,
        work_dir: &str,
        framework_id: &str,
        _agent_ip: &str,
        _agent_port: &str,
        agent_id: &str,
        pod_id: &str,
    ) -> Result<Vec<String>> {
        let sandbox =
            format!("{work_dir}/slaves/{agent_id}/frameworks/{framework_id}/executors/{pod_id}/runs/latest");
        Ok(vec![
            format!("{sandbox}/stdout"),
            format!("{sandbox}/stderr"),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_pid_parsing() {
        let (ip, port) = extract_ip_port_from_agent_pid("slave(1)@10.2.3.4:5051").unwrap();
        assert_eq!(ip, "10.2.3.4");
        assert_eq!(port.as_deref(), Some("5051"));

        let (ip, port) = extract_ip_port_from_agent_pid("slave(1)@10.2.3.4").unwrap();
        assert_eq!(ip, "10.2.3.4");
        assert!(port.is_none());

        assert!(extract_ip_port_from_agent_pid("no-separator").is_err());
        assert!(extract_ip_port_from_agent_pid("slave(1)@").is_err());
    }

    #[tokio::test]
    async fn res_manager_scopes_by_job() {
        let resmgr = InMemoryResManager::new();
        resmgr.set_reason("j1-0", "waiting for hosts").unwrap();
        resmgr.set_reason("j2-0", "other job").unwrap();

        let active = resmgr.get_active_tasks(&JobId::new("j1")).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active["j1-0"].reason, "waiting for hosts");
    }

    #[tokio::test]
    async fn host_manager_lookup() {
        let hostmgr = InMemoryHostManager::default();
        hostmgr.add_agent("host-a", "slave(1)@10.0.0.1:5051").unwrap();

        let agent = hostmgr.agent_info("host-a").await.unwrap().unwrap();
        assert_eq!(agent.pid, "slave(1)@10.0.0.1:5051");
        assert!(hostmgr.agent_info("host-b").await.unwrap().is_none());

        let master = hostmgr.master_host_port().await.unwrap();
        assert_eq!(master.hostname, "master.local");
    }
}
