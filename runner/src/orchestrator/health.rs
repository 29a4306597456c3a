//! Readiness probes run before an experiment starts

use crate::config::HealthConfig;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PreconditionError {
    #[error("Invalid service address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Service {address} is not reachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Boolean readiness signal gating orchestration start
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> Result<(), PreconditionError>;
}

pub struct AlwaysReady;

impl HealthCheck for AlwaysReady {
    fn check(&self) -> Result<(), PreconditionError> {
        Ok(())
    }
}

/// Ready when every `host:port` accepts a TCP connection
pub struct ServiceProbe {
    services: Vec<String>,
    timeout: Duration,
}

impl ServiceProbe {
    pub fn new(services: Vec<String>, timeout: Duration) -> Self {
        Self { services, timeout }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(
            config.required_services.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }

    fn resolve(address: &str) -> Result<SocketAddr, PreconditionError> {
        let invalid = |reason: String| PreconditionError::InvalidAddress {
            address: address.to_string(),
            reason,
        };

        address
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("no addresses resolved".to_string()))
    }
}

impl HealthCheck for ServiceProbe {
    fn check(&self) -> Result<(), PreconditionError> {
        for address in &self.services {
            let socket = Self::resolve(address)?;
            TcpStream::connect_timeout(&socket, self.timeout).map_err(|source| {
                PreconditionError::Unreachable {
                    address: address.clone(),
                    source,
                }
            })?;
            debug!("Service {} is up", address);
        }

        Ok(())
    }
}
