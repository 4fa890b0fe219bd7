//! Pluggable predicates deciding when a freshly started fixture is usable.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::net::TcpStream;

use crate::request::PortSpec;
use crate::runtime::ContainerRuntime;

/// Everything a readiness probe may look at: the resolved address, the port
/// mappings, and the runtime collaborator (for log inspection).
pub struct ReadyTarget<'a> {
    pub host: &'a str,
    pub ports: &'a HashMap<PortSpec, u16>,
    /// First exposed port of the request, probed when a strategy names none.
    pub primary: Option<PortSpec>,
    pub container_id: &'a str,
    pub runtime: &'a dyn ContainerRuntime,
}

impl ReadyTarget<'_> {
    fn resolve_port(&self, wanted: Option<PortSpec>) -> Result<u16> {
        wanted
            .or(self.primary)
            .and_then(|spec| self.ports.get(&spec).copied())
            .context("no mapped port available to probe")
    }
}

/// Caller-supplied readiness predicate.
///
/// A probe returns `Ok(false)` to be retried on the next poll; an `Err`
/// aborts fixture creation.
#[async_trait]
pub trait ReadyCheck: Send + Sync {
    async fn poll(&self, target: &ReadyTarget<'_>) -> Result<bool>;
}

/// How the manager decides a started fixture is ready for use.
#[derive(Default)]
pub enum ReadyStrategy {
    /// No wait; the fixture is considered ready as soon as it starts.
    #[default]
    Immediate,
    /// GET a path on a mapped port, succeeding only on the accepted status
    /// codes and retrying on connection failure.
    HttpGet {
        path: String,
        port: Option<PortSpec>,
        accept: Vec<u16>,
    },
    /// Succeeds once the container's log output matches the pattern.
    LogPattern(Regex),
    /// Succeeds once a TCP connection to a mapped port is accepted.
    PortOpen(Option<PortSpec>),
    Custom(Box<dyn ReadyCheck>),
}

impl ReadyStrategy {
    /// HTTP readiness against `path` on the request's first exposed port,
    /// accepting status 200 only.
    pub fn http(path: impl Into<String>) -> Self {
        ReadyStrategy::HttpGet {
            path: path.into(),
            port: None,
            accept: vec![200],
        }
    }

    pub fn log_pattern(pattern: Regex) -> Self {
        ReadyStrategy::LogPattern(pattern)
    }

    pub fn port_open() -> Self {
        ReadyStrategy::PortOpen(None)
    }

    pub fn custom(check: impl ReadyCheck + 'static) -> Self {
        ReadyStrategy::Custom(Box::new(check))
    }

    /// Runs the predicate once. `Ok(false)` means "not yet, retry".
    pub(crate) async fn check(&self, target: &ReadyTarget<'_>) -> Result<bool> {
        match self {
            ReadyStrategy::Immediate => Ok(true),
            ReadyStrategy::HttpGet { path, port, accept } => {
                let port = target.resolve_port(*port)?;
                let path = if path.starts_with('/') {
                    path.clone()
                } else {
                    format!("/{}", path)
                };
                let url = format!("http://{}:{}{}", target.host, port, path);
                match reqwest::get(&url).await {
                    Ok(response) => Ok(accept.contains(&response.status().as_u16())),
                    // connection refused or reset while the server boots
                    Err(_) => Ok(false),
                }
            }
            ReadyStrategy::LogPattern(pattern) => {
                match target.runtime.logs(target.container_id).await {
                    Ok(logs) => Ok(pattern.is_match(&logs)),
                    Err(_) => Ok(false),
                }
            }
            ReadyStrategy::PortOpen(port) => {
                let port = target.resolve_port(*port)?;
                Ok(TcpStream::connect((target.host, port)).await.is_ok())
            }
            ReadyStrategy::Custom(check) => check.poll(target).await,
        }
    }
}
