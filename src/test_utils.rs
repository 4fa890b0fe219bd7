/// This module provides utilities for exercising fixture lifecycles in tests.
pub mod fixture_test_utils {
    use std::collections::{HashMap, HashSet};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, OnceLock, Weak};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use crate::manager::{FixtureManager, ResourceInfo};
    use crate::request::{NetworkSpec, PortSpec, ResourceRequest};
    use crate::runtime::{ContainerRuntime, CreateSpec, DockerRuntime};

    static DOCKER_MANAGER: OnceLock<tokio::sync::Mutex<Weak<FixtureManager>>> = OnceLock::new();

    /// Lazily initializes and retrieves a shared Docker-backed
    /// [`FixtureManager`], so parallel tests reuse one daemon connection.
    pub async fn lazy_docker_manager() -> Result<Arc<FixtureManager>> {
        let mut guard = DOCKER_MANAGER
            .get_or_init(|| tokio::sync::Mutex::new(Weak::new()))
            .lock()
            .await;
        let maybe_manager = guard.upgrade();

        if let Some(manager) = maybe_manager {
            Ok(manager)
        } else {
            let runtime = Arc::new(DockerRuntime::connect()?);
            let manager = Arc::new(FixtureManager::new(runtime));
            *guard = Arc::downgrade(&manager);

            Ok(manager)
        }
    }

    /// Creates the requested fixture, hands its connection info to `runner`,
    /// and terminates it on every exit path. A teardown failure after a
    /// failing runner is reported but never masks the runner's error.
    pub async fn run(
        manager: &FixtureManager,
        request: ResourceRequest,
        runner: impl FnOnce(ResourceInfo) -> Pin<Box<dyn Future<Output = Result<()>>>>,
    ) -> Result<()> {
        let mut handle = manager.create(request).await?;
        let result = runner(handle.info()).await;
        if let Err(err) = manager.terminate(&mut handle).await {
            log::warn!("fixture teardown failed: {:#}", err);
        }
        result
    }

    #[derive(Default)]
    struct InMemoryState {
        containers: HashMap<String, bool>,
        networks: HashSet<String>,
        configured_ports: HashMap<PortSpec, u16>,
        assigned_ports: HashMap<(String, PortSpec), u16>,
        next_id: u64,
        next_port: u16,
        logs: String,
        ops: Vec<String>,
    }

    /// [`ContainerRuntime`] that provisions nothing, for unit tests: it keeps
    /// a listing of resident resources and a journal of the mutating
    /// operations it saw. Unmapped exposed ports get pseudo host ports.
    #[derive(Default)]
    pub struct InMemoryRuntime {
        state: Mutex<InMemoryState>,
    }

    impl InMemoryRuntime {
        /// Pins the host port a container port resolves to.
        pub fn map_port(&self, port: PortSpec, host_port: u16) {
            self.state
                .lock()
                .unwrap()
                .configured_ports
                .insert(port, host_port);
        }

        /// Sets the canned log output returned for every container.
        pub fn set_logs(&self, logs: &str) {
            self.state.lock().unwrap().logs = logs.to_string();
        }

        /// Journal of the mutating runtime operations, in call order.
        pub fn ops(&self) -> Vec<String> {
            self.state.lock().unwrap().ops.clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for InMemoryRuntime {
        async fn create(&self, spec: &CreateSpec<'_>) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = format!("mem-{}", state.next_id);
            state.containers.insert(id.clone(), false);
            state.ops.push(format!("create {}", spec.image));
            Ok(id)
        }

        async fn start(&self, id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            match state.containers.get_mut(id) {
                Some(running) => *running = true,
                None => return Err(anyhow!("no such container: {id}")),
            }
            state.ops.push(format!("start {id}"));
            Ok(())
        }

        async fn stop(&self, id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            match state.containers.get_mut(id) {
                Some(running) => *running = false,
                None => return Err(anyhow!("no such container: {id}")),
            }
            state.ops.push(format!("stop {id}"));
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.containers.remove(id).is_none() {
                return Err(anyhow!("no such container: {id}"));
            }
            state.ops.push(format!("remove {id}"));
            Ok(())
        }

        async fn host(&self, _id: &str) -> Result<String> {
            Ok("127.0.0.1".to_string())
        }

        async fn mapped_port(&self, id: &str, port: PortSpec) -> Result<u16> {
            let mut state = self.state.lock().unwrap();
            if let Some(host_port) = state.configured_ports.get(&port) {
                return Ok(*host_port);
            }
            let key = (id.to_string(), port);
            if let Some(host_port) = state.assigned_ports.get(&key) {
                return Ok(*host_port);
            }
            let host_port = 49152 + state.next_port;
            state.next_port += 1;
            state.assigned_ports.insert(key, host_port);
            Ok(host_port)
        }

        async fn logs(&self, _id: &str) -> Result<String> {
            Ok(self.state.lock().unwrap().logs.clone())
        }

        async fn list(&self) -> Result<Vec<String>> {
            Ok(self.state.lock().unwrap().containers.keys().cloned().collect())
        }

        async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            state.networks.insert(spec.name.clone());
            state.ops.push(format!("create-network {}", spec.name));
            Ok(spec.name.clone())
        }

        async fn remove_network(&self, id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.networks.remove(id) {
                return Err(anyhow!("no such network: {id}"));
            }
            state.ops.push(format!("remove-network {id}"));
            Ok(())
        }
    }
}
