//! Declarative descriptors for the resources a test asks for.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::FixtureError;
use crate::hooks::LifecycleHook;
use crate::readiness::ReadyStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A single exposed port, the `"80/tcp"` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub number: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.number, proto)
    }
}

impl FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, proto) = match s.split_once('/') {
            Some((number, proto)) => (number, proto),
            None => (s, "tcp"),
        };
        let number = number
            .parse::<u16>()
            .map_err(|_| format!("malformed port spec {:?}", s))?;
        let protocol = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return Err(format!("malformed port spec {:?}", s)),
        };
        Ok(PortSpec { number, protocol })
    }
}

/// Declarative description of a container fixture.
///
/// Ports and networks are kept as written and validated when the request is
/// submitted; hooks are fixed at construction time and may not be added once
/// the request has been handed to the manager.
pub struct ResourceRequest {
    pub(crate) image: String,
    pub(crate) exposed_ports: Vec<String>,
    pub(crate) networks: Vec<String>,
    pub(crate) entrypoint: Option<String>,
    pub(crate) cmd: Vec<String>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) ready: ReadyStrategy,
    pub(crate) hooks: Vec<LifecycleHook>,
    pub(crate) started: bool,
    pub(crate) startup_timeout: Option<Duration>,
    pub(crate) poll_interval: Option<Duration>,
}

impl ResourceRequest {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            exposed_ports: Vec::new(),
            networks: Vec::new(),
            entrypoint: None,
            cmd: Vec::new(),
            env: HashMap::new(),
            ready: ReadyStrategy::default(),
            hooks: Vec::new(),
            started: true,
            startup_timeout: None,
            poll_interval: None,
        }
    }

    pub fn with_exposed_port(mut self, port: impl Into<String>) -> Self {
        self.exposed_ports.push(port.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.networks.push(network.into());
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn with_cmd(mut self, cmd: Vec<impl Into<String>>) -> Self {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_ready(mut self, ready: ReadyStrategy) -> Self {
        self.ready = ready;
        self
    }

    pub fn with_hook(mut self, hook: LifecycleHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_hooks(mut self, hooks: Vec<LifecycleHook>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    /// Whether the container is started (and waited on) by `create`.
    /// Defaults to true.
    pub fn with_started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Checks the request is well formed and returns the parsed port specs
    /// in declaration order.
    pub(crate) fn validate(&self) -> Result<Vec<PortSpec>, FixtureError> {
        if self.image.trim().is_empty() {
            return Err(FixtureError::Validation("image must not be empty".into()));
        }
        let mut ports = Vec::with_capacity(self.exposed_ports.len());
        for raw in &self.exposed_ports {
            let spec = raw
                .parse::<PortSpec>()
                .map_err(FixtureError::Validation)?;
            ports.push(spec);
        }
        if self.networks.iter().any(|n| n.trim().is_empty()) {
            return Err(FixtureError::Validation(
                "network name must not be empty".into(),
            ));
        }
        Ok(ports)
    }
}

/// Declarative description of a virtual network.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub(crate) name: String,
    pub(crate) driver: String,
}

impl NetworkSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: "bridge".to_string(),
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
