//! Boundary to the container runtime and network substrate.
//!
//! The manager only ever talks to [`ContainerRuntime`]; the Docker-backed
//! implementation lives here, an in-memory one for tests lives in
//! `test_utils`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::EndpointSettings;
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::EnvConfig;
use crate::request::{NetworkSpec, PortSpec};

/// Borrowed view of a validated request, as handed to the runtime.
pub struct CreateSpec<'a> {
    pub image: &'a str,
    pub ports: &'a [PortSpec],
    pub networks: &'a [String],
    pub entrypoint: Option<&'a str>,
    pub cmd: &'a [String],
    pub env: &'a HashMap<String, String>,
}

/// Opaque create/start/stop/remove operations provided by the container
/// runtime, plus host and port resolution, log access and a listing
/// capability. The manager never reaches past this trait.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates (without starting) a container and returns its runtime id.
    async fn create(&self, spec: &CreateSpec<'_>) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    /// Resolves the address the container's mapped ports are reachable on.
    async fn host(&self, id: &str) -> Result<String>;
    /// Resolves the host port a container port was published to.
    async fn mapped_port(&self, id: &str, port: PortSpec) -> Result<u16>;
    /// Combined stdout/stderr output produced so far.
    async fn logs(&self, id: &str) -> Result<String>;
    /// Ids of all resident containers, running or not.
    async fn list(&self) -> Result<Vec<String>>;
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;
    async fn remove_network(&self, id: &str) -> Result<()>;
}

/// [`ContainerRuntime`] backed by the Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    host: String,
}

impl DockerRuntime {
    /// Connects using local defaults, honoring the `CONTAINER_FIXTURE_*`
    /// environment overrides.
    pub fn connect() -> Result<Self> {
        let env = EnvConfig::new();
        let docker = match &env.docker_host {
            Some(addr) => Docker::connect_with_http(addr, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self {
            docker,
            host: "localhost".to_string(),
        })
    }

    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            host: "localhost".to_string(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.with_context(|| format!("pulling image {}", image))?;
        }
        Ok(())
    }
}

fn random_suffix(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &CreateSpec<'_>) -> Result<String> {
        self.pull_image(spec.image).await?;

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|port| (port.to_string(), HashMap::new()))
            .collect();
        let config = bollard::container::Config {
            image: Some(spec.image.to_string()),
            entrypoint: spec.entrypoint.map(|e| vec![e.to_string()]),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.to_vec()),
            env: (!spec.env.is_empty())
                .then(|| spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(bollard::models::HostConfig {
                publish_all_ports: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: format!("fixture-{}", random_suffix(6)),
                    platform: None,
                }),
                config,
            )
            .await?;

        for network in spec.networks {
            self.docker
                .connect_network(
                    network,
                    ConnectNetworkOptions {
                        container: response.id.clone(),
                        endpoint_config: EndpointSettings::default(),
                    },
                )
                .await
                .with_context(|| format!("connecting container to network {}", network))?;
        }

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn host(&self, _id: &str) -> Result<String> {
        Ok(self.host.clone())
    }

    async fn mapped_port(&self, id: &str, port: PortSpec) -> Result<u16> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let bindings = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&port.to_string()).cloned())
            .flatten()
            .unwrap_or_default();
        bindings
            .iter()
            .find_map(|binding| binding.host_port.as_deref()?.parse::<u16>().ok())
            .with_context(|| format!("port {} is not published", port))
    }

    async fn logs(&self, id: &str) -> Result<String> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }
        Ok(output)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: spec.name.clone(),
                driver: spec.driver.clone(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("creating network {}", spec.name))?;
        // the name is valid wherever the api takes a network id
        Ok(spec.name.clone())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.docker.remove_network(id).await?;
        Ok(())
    }
}
