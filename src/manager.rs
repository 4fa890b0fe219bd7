//! The fixture lifecycle manager: create, wait for readiness, terminate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::EnvConfig;
use crate::errors::FixtureError;
use crate::hooks::{HookContext, HookPhase, LifecycleHook};
use crate::readiness::ReadyTarget;
use crate::request::{NetworkSpec, PortSpec, ResourceRequest};
use crate::runtime::{ContainerRuntime, CreateSpec};

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle state of a [`RunningResource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Terminated,
}

/// Owned handle to a provisioned fixture.
///
/// Host and port mappings are populated only once the post-start phase has
/// completed; a handle obtained from an unstarted request carries neither.
/// The handle is exclusively owned by its creator; share it across tasks
/// only with external synchronization.
#[derive(Debug)]
pub struct RunningResource {
    id: String,
    image: String,
    host: String,
    ports: HashMap<PortSpec, u16>,
    primary_port: Option<PortSpec>,
    state: LifecycleState,
    hooks: Vec<LifecycleHook>,
}

impl RunningResource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn mapped_port(&self, port: PortSpec) -> Option<u16> {
        self.ports.get(&port).copied()
    }

    /// `http://host:port` for the first exposed port, once started.
    pub fn uri(&self) -> Option<String> {
        if self.state != LifecycleState::Started {
            return None;
        }
        let port = self.ports.get(&self.primary_port?)?;
        Some(format!("http://{}:{}", self.host, port))
    }

    /// Owned snapshot of the connection metadata, for handing into callbacks.
    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id.clone(),
            host: self.host.clone(),
            ports: self.ports.clone(),
            uri: self.uri(),
        }
    }
}

/// Owned snapshot of a [`RunningResource`]'s connection metadata.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub id: String,
    pub host: String,
    pub ports: HashMap<PortSpec, u16>,
    pub uri: Option<String>,
}

/// Handle to a virtual network owned by the test session.
///
/// The network must outlive every resource attached to it; removal is
/// idempotent.
#[derive(Debug)]
pub struct NetworkHandle {
    id: String,
    name: String,
    removed: bool,
}

impl NetworkHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Creates, waits on and tears down ephemeral test fixtures against an
/// opaque [`ContainerRuntime`].
///
/// ```no_run
/// use std::sync::Arc;
/// use container_fixture::manager::FixtureManager;
/// use container_fixture::readiness::ReadyStrategy;
/// use container_fixture::request::ResourceRequest;
/// use container_fixture::runtime::DockerRuntime;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let manager = FixtureManager::new(Arc::new(DockerRuntime::connect()?));
///     let request = ResourceRequest::new("nginx:latest")
///         .with_exposed_port("80/tcp")
///         .with_ready(ReadyStrategy::http("/"));
///     let mut handle = manager.create(request).await?;
///     println!("serving at {}", handle.uri().unwrap());
///     manager.terminate(&mut handle).await?;
///     Ok(())
/// }
/// ```
pub struct FixtureManager {
    runtime: Arc<dyn ContainerRuntime>,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl FixtureManager {
    /// Builds a manager with defaults taken from the `CONTAINER_FIXTURE_*`
    /// environment, falling back to 60s timeout / 250ms poll interval.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let env = EnvConfig::new();
        Self {
            runtime,
            startup_timeout: env
                .startup_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT),
            poll_interval: env
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        }
    }

    pub fn with_defaults(
        runtime: Arc<dyn ContainerRuntime>,
        startup_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            startup_timeout,
            poll_interval,
        }
    }

    /// Provisions the requested fixture and blocks the calling task until it
    /// is ready (or the request did not ask to be started).
    pub async fn create(&self, request: ResourceRequest) -> Result<RunningResource, FixtureError> {
        self.create_with_cancel(request, None).await
    }

    /// Like [`create`](Self::create), aborting with
    /// [`FixtureError::Cancelled`] once `true` is observed on the channel.
    /// A cancelled or failed call cleans up anything it already allocated,
    /// best effort.
    pub async fn create_with_cancel(
        &self,
        mut request: ResourceRequest,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunningResource, FixtureError> {
        let ports = request.validate()?;
        if is_cancelled(&cancel) {
            return Err(FixtureError::Cancelled);
        }

        self.run_phase(HookPhase::PreCreate, &request.hooks, &request.image, None)
            .await?;

        let spec = CreateSpec {
            image: &request.image,
            ports: &ports,
            networks: &request.networks,
            entrypoint: request.entrypoint.as_deref(),
            cmd: &request.cmd,
            env: &request.env,
        };
        let id = self.runtime.create(&spec).await?;

        // from here on the resource exists; clean it up on any failure
        let (host, port_map) = match self.provision(&request, &ports, &id, &mut cancel).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.cleanup(&id).await;
                return Err(err);
            }
        };

        let state = if request.started {
            LifecycleState::Started
        } else {
            LifecycleState::Created
        };
        request
            .hooks
            .retain(|hook| matches!(hook.phase(), HookPhase::PreTerminate | HookPhase::PostTerminate));

        Ok(RunningResource {
            id,
            image: request.image,
            host,
            ports: port_map,
            primary_port: ports.first().copied(),
            state,
            hooks: request.hooks,
        })
    }

    async fn provision(
        &self,
        request: &ResourceRequest,
        ports: &[PortSpec],
        id: &str,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Result<(String, HashMap<PortSpec, u16>), FixtureError> {
        self.run_phase(HookPhase::PostCreate, &request.hooks, &request.image, Some(id))
            .await?;
        if !request.started {
            return Ok((String::new(), HashMap::new()));
        }
        if is_cancelled(cancel) {
            return Err(FixtureError::Cancelled);
        }

        self.run_phase(HookPhase::PreStart, &request.hooks, &request.image, Some(id))
            .await?;
        self.runtime.start(id).await?;
        self.run_phase(HookPhase::PostStart, &request.hooks, &request.image, Some(id))
            .await?;

        let host = self.runtime.host(id).await?;
        let mut port_map = HashMap::with_capacity(ports.len());
        for &port in ports {
            port_map.insert(port, self.runtime.mapped_port(id, port).await?);
        }

        let target = ReadyTarget {
            host: &host,
            ports: &port_map,
            primary: ports.first().copied(),
            container_id: id,
            runtime: self.runtime.as_ref(),
        };
        let timeout = request.startup_timeout.unwrap_or(self.startup_timeout);
        let interval = request.poll_interval.unwrap_or(self.poll_interval);
        self.await_ready(request, target, timeout, interval, cancel)
            .await?;

        Ok((host, port_map))
    }

    /// Bounded sleep-then-check loop. Each probe is capped by the remaining
    /// deadline, so the loop never overruns the timeout by more than one
    /// poll interval.
    async fn await_ready(
        &self,
        request: &ResourceRequest,
        target: ReadyTarget<'_>,
        timeout: Duration,
        interval: Duration,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Result<(), FixtureError> {
        let started_at = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started_at.elapsed());
            match tokio::time::timeout(remaining, request.ready.check(&target)).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {}
                Ok(Err(cause)) => return Err(FixtureError::Runtime(cause)),
                Err(_) => return Err(FixtureError::ReadinessTimeout { timeout }),
            }
            if started_at.elapsed() >= timeout {
                return Err(FixtureError::ReadinessTimeout { timeout });
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wait_cancelled(cancel) => return Err(FixtureError::Cancelled),
            }
        }
    }

    /// Tears the fixture down. Safe to call on an already-terminated handle;
    /// the second call is a no-op and touches no runtime state.
    pub async fn terminate(&self, handle: &mut RunningResource) -> Result<(), FixtureError> {
        if handle.state == LifecycleState::Terminated {
            return Ok(());
        }
        self.run_phase(
            HookPhase::PreTerminate,
            &handle.hooks,
            &handle.image,
            Some(&handle.id),
        )
        .await?;
        self.runtime.stop(&handle.id).await?;
        self.runtime.remove(&handle.id).await?;
        // the container is gone, so the handle is terminated even if a
        // post-terminate hook fails below
        handle.state = LifecycleState::Terminated;
        self.run_phase(
            HookPhase::PostTerminate,
            &handle.hooks,
            &handle.image,
            Some(&handle.id),
        )
        .await?;
        Ok(())
    }

    pub async fn create_network(&self, spec: NetworkSpec) -> Result<NetworkHandle, FixtureError> {
        if spec.name.trim().is_empty() {
            return Err(FixtureError::Validation(
                "network name must not be empty".into(),
            ));
        }
        let id = self.runtime.create_network(&spec).await?;
        Ok(NetworkHandle {
            id,
            name: spec.name,
            removed: false,
        })
    }

    /// Removes the network. Idempotent, like [`terminate`](Self::terminate).
    pub async fn remove_network(&self, handle: &mut NetworkHandle) -> Result<(), FixtureError> {
        if handle.removed {
            return Ok(());
        }
        self.runtime.remove_network(&handle.id).await?;
        handle.removed = true;
        Ok(())
    }

    async fn run_phase(
        &self,
        phase: HookPhase,
        hooks: &[LifecycleHook],
        image: &str,
        id: Option<&str>,
    ) -> Result<(), FixtureError> {
        for (index, hook) in hooks.iter().filter(|h| h.phase() == phase).enumerate() {
            let cx = HookContext {
                phase,
                image: image.to_string(),
                container_id: id.map(str::to_string),
            };
            hook.invoke(cx)
                .await
                .map_err(|cause| FixtureError::Hook { phase, index, cause })?;
        }
        Ok(())
    }

    /// Best-effort teardown of a partially provisioned container. Failures
    /// are reported but never mask the error that got us here.
    async fn cleanup(&self, id: &str) {
        if let Err(err) = self.runtime.stop(id).await {
            log::warn!("cleanup: failed to stop container {}: {:#}", id, err);
        }
        if let Err(err) = self.runtime.remove(id).await {
            log::warn!("cleanup: failed to remove container {}: {:#}", id, err);
        }
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

/// Resolves once the cancellation signal fires; pends forever when there is
/// no signal or its sender is gone.
async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
            std::future::pending::<()>().await
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::readiness::{ReadyCheck, ReadyStrategy, ReadyTarget};
    use crate::runtime::DockerRuntime;
    use crate::test_utils::fixture_test_utils::InMemoryRuntime;

    struct NeverReady;

    #[async_trait]
    impl ReadyCheck for NeverReady {
        async fn poll(&self, _target: &ReadyTarget<'_>) -> Result<bool> {
            Ok(false)
        }
    }

    fn manager(runtime: &Arc<InMemoryRuntime>) -> FixtureManager {
        FixtureManager::with_defaults(
            runtime.clone(),
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
    }

    fn recorder(
        phase: HookPhase,
        label: &'static str,
        seen: &Arc<Mutex<Vec<&'static str>>>,
    ) -> LifecycleHook {
        let seen = seen.clone();
        LifecycleHook::new(phase, move |_cx| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(label);
                Ok(())
            })
        })
    }

    #[test_log::test(tokio::test)]
    async fn create_then_terminate_leaves_no_resident_resource() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);

        let mut handle = manager
            .create(ResourceRequest::new("nginx:latest").with_exposed_port("80/tcp"))
            .await
            .unwrap();
        assert_eq!(handle.state(), LifecycleState::Started);
        assert_eq!(runtime.list().await.unwrap().len(), 1);

        manager.terminate(&mut handle).await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Terminated);
        assert!(runtime.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminate_twice_is_a_noop() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);

        let mut handle = manager
            .create(ResourceRequest::new("redis:7"))
            .await
            .unwrap();
        manager.terminate(&mut handle).await.unwrap();
        let ops_after_first = runtime.ops().len();

        manager.terminate(&mut handle).await.unwrap();
        assert_eq!(runtime.ops().len(), ops_after_first);
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let request = ResourceRequest::new("nginx:latest")
            .with_hook(recorder(HookPhase::PreCreate, "pre-create-0", &seen))
            .with_hook(recorder(HookPhase::PreCreate, "pre-create-1", &seen))
            .with_hook(recorder(HookPhase::PostCreate, "post-create-0", &seen))
            .with_hook(recorder(HookPhase::PreStart, "pre-start-0", &seen))
            .with_hook(recorder(HookPhase::PostStart, "post-start-0", &seen))
            .with_hook(recorder(HookPhase::PreTerminate, "pre-terminate-0", &seen))
            .with_hook(recorder(HookPhase::PostTerminate, "post-terminate-0", &seen));

        let mut handle = manager.create(request).await.unwrap();
        manager.terminate(&mut handle).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "pre-create-0",
                "pre-create-1",
                "post-create-0",
                "pre-start-0",
                "post-start-0",
                "pre-terminate-0",
                "post-terminate-0",
            ]
        );
    }

    #[tokio::test]
    async fn failing_pre_create_hook_aborts_creation() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let request = ResourceRequest::new("nginx:latest")
            .with_hook(recorder(HookPhase::PreCreate, "pre-create-0", &seen))
            .with_hook(LifecycleHook::new(HookPhase::PreCreate, |_cx| {
                Box::pin(async { Err(anyhow!("boom")) })
            }))
            .with_hook(recorder(HookPhase::PreCreate, "pre-create-2", &seen));

        let err = manager.create(request).await.unwrap_err();
        match err {
            FixtureError::Hook { phase, index, .. } => {
                assert_eq!(phase, HookPhase::PreCreate);
                assert_eq!(index, 1);
            }
            other => panic!("expected hook error, got {other}"),
        }
        // the hook after the failing one never ran, and the runtime was
        // never contacted
        assert_eq!(*seen.lock().unwrap(), vec!["pre-create-0"]);
        assert!(runtime.ops().is_empty());
    }

    #[tokio::test]
    async fn post_create_hook_failure_cleans_up() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);

        let request = ResourceRequest::new("nginx:latest").with_hook(LifecycleHook::new(
            HookPhase::PostCreate,
            |_cx| Box::pin(async { Err(anyhow!("boom")) }),
        ));

        let err = manager.create(request).await.unwrap_err();
        assert!(matches!(err, FixtureError::Hook { phase: HookPhase::PostCreate, .. }));
        assert!(runtime.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_image_is_rejected_without_runtime_calls() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);

        let err = manager.create(ResourceRequest::new("  ")).await.unwrap_err();
        assert!(matches!(err, FixtureError::Validation(_)));
        assert!(runtime.ops().is_empty());
    }

    #[tokio::test]
    async fn malformed_port_spec_is_rejected() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);

        let err = manager
            .create(ResourceRequest::new("nginx:latest").with_exposed_port("http"))
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::Validation(_)));
        assert!(runtime.ops().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn readiness_timeout_cleans_up_partial_resource() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);

        let request = ResourceRequest::new("nginx:latest")
            .with_ready(ReadyStrategy::custom(NeverReady))
            .with_startup_timeout(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(20));

        let started_at = Instant::now();
        let err = manager.create(request).await.unwrap_err();
        assert!(matches!(err, FixtureError::ReadinessTimeout { .. }));
        // timeout plus at most one extra poll interval, with slack
        assert!(started_at.elapsed() < Duration::from_secs(1));
        assert!(runtime.list().await.unwrap().is_empty());
        let ops = runtime.ops();
        assert!(ops.iter().any(|op| op.starts_with("stop")));
        assert!(ops.iter().any(|op| op.starts_with("remove")));
    }

    #[tokio::test]
    async fn log_pattern_readiness_succeeds() {
        let runtime = Arc::new(InMemoryRuntime::default());
        runtime.set_logs("Configuration complete; ready for start up");
        let manager = manager(&runtime);

        let request = ResourceRequest::new("nginx:latest").with_ready(ReadyStrategy::log_pattern(
            regex::Regex::new("ready for start up").unwrap(),
        ));
        let handle = manager.create(request).await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Started);
    }

    #[tokio::test]
    async fn http_readiness_waits_for_local_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });

        let runtime = Arc::new(InMemoryRuntime::default());
        runtime.map_port(PortSpec::tcp(80), port);
        let manager = manager(&runtime);

        let request = ResourceRequest::new("nginx:latest")
            .with_exposed_port("80/tcp")
            .with_ready(ReadyStrategy::http("/"));
        let handle = manager.create(request).await.unwrap();
        assert_eq!(handle.uri().unwrap(), format!("http://127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn cancellation_during_polling_cleans_up() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = FixtureManager::with_defaults(
            runtime.clone(),
            Duration::from_secs(10),
            Duration::from_millis(10),
        );

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });

        let request =
            ResourceRequest::new("nginx:latest").with_ready(ReadyStrategy::custom(NeverReady));
        let started_at = Instant::now();
        let err = manager.create_with_cancel(request, Some(rx)).await.unwrap_err();
        assert!(matches!(err, FixtureError::Cancelled));
        assert!(started_at.elapsed() < Duration::from_secs(5));
        assert!(runtime.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unstarted_request_returns_created_handle() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);

        let mut handle = manager
            .create(
                ResourceRequest::new("nginx:latest")
                    .with_exposed_port("80/tcp")
                    .with_started(false),
            )
            .await
            .unwrap();
        assert_eq!(handle.state(), LifecycleState::Created);
        assert!(handle.uri().is_none());
        assert!(runtime.ops().iter().all(|op| !op.starts_with("start")));

        manager.terminate(&mut handle).await.unwrap();
        assert!(runtime.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolved_ports_are_exposed_on_the_handle() {
        let runtime = Arc::new(InMemoryRuntime::default());
        runtime.map_port(PortSpec::tcp(80), 49160);
        let manager = manager(&runtime);

        let handle = manager
            .create(ResourceRequest::new("nginx:latest").with_exposed_port("80/tcp"))
            .await
            .unwrap();
        assert_eq!(handle.mapped_port(PortSpec::tcp(80)), Some(49160));
        assert_eq!(handle.uri().unwrap(), "http://127.0.0.1:49160");
    }

    #[tokio::test]
    async fn network_lifecycle_is_idempotent() {
        let runtime = Arc::new(InMemoryRuntime::default());
        let manager = manager(&runtime);

        let err = manager.create_network(NetworkSpec::new("")).await.unwrap_err();
        assert!(matches!(err, FixtureError::Validation(_)));

        let mut network = manager
            .create_network(NetworkSpec::new("foo-network"))
            .await
            .unwrap();
        assert_eq!(network.name(), "foo-network");

        manager.remove_network(&mut network).await.unwrap();
        let ops_after_first = runtime.ops().len();
        manager.remove_network(&mut network).await.unwrap();
        assert_eq!(runtime.ops().len(), ops_after_first);
    }

    #[tokio::test]
    #[ignore = "requires a local Docker daemon"]
    async fn nginx_http_fixture_round_trip() {
        let runtime = Arc::new(DockerRuntime::connect().unwrap());
        let manager = FixtureManager::new(runtime);

        let mut network = manager
            .create_network(NetworkSpec::new("fixture-net"))
            .await
            .unwrap();

        let request = ResourceRequest::new("nginx:latest")
            .with_exposed_port("80/tcp")
            .with_network(network.name())
            .with_ready(ReadyStrategy::http("/"));
        let mut handle = manager.create(request).await.unwrap();

        let response = reqwest::get(handle.uri().unwrap()).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);

        manager.terminate(&mut handle).await.unwrap();
        manager.remove_network(&mut network).await.unwrap();
    }
}
