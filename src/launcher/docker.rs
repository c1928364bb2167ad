//! Docker launcher backed by bollard
//!
//! Containers are named `<deployment>-<service>` and labelled so that a service
//! can be found again by name regardless of which CLI invocation started it.

use super::{Handle, LaunchError, Launcher};
use crate::catalog::ServiceSpec;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::service::{HostConfig, PortBinding};
use bollard::Docker;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const LABEL_DEPLOYMENT: &str = "rollout.deployment";
const LABEL_SERVICE: &str = "rollout.service";

pub struct DockerLauncher {
    docker: Docker,
    deployment: String,
    network: Option<String>,
}

fn has_status(err: &DockerError, code: u16) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

impl DockerLauncher {
    pub fn new(deployment: impl Into<String>, network: Option<String>) -> Result<Self, LaunchError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| LaunchError::Unavailable(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self {
            docker,
            deployment: deployment.into(),
            network,
        })
    }

    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.deployment, service)
    }

    fn container_config(&self, spec: &ServiceSpec) -> Config<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let labels: HashMap<String, String> = [
            (LABEL_DEPLOYMENT.to_string(), self.deployment.clone()),
            (LABEL_SERVICE.to_string(), spec.name.clone()),
        ]
        .into_iter()
        .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|port| (format!("{}/tcp", port), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|port| {
                (
                    format!("{}/tcp", port),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(port.to_string()),
                    }]),
                )
            })
            .collect();

        Config {
            image: Some(spec.start_ref.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                network_mode: self.network.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    async fn start(&self, spec: &ServiceSpec) -> Result<Handle, LaunchError> {
        let name = self.container_name(&spec.name);

        match self.docker.inspect_container(&name, None).await {
            Ok(inspect) => {
                let id = inspect
                    .id
                    .ok_or_else(|| LaunchError::start_failed(&spec.name, "container id missing"))?;
                if inspect.state.and_then(|s| s.running) == Some(true) {
                    debug!(service = %spec.name, container = %id, "Container already running");
                    return Ok(Handle::new(&spec.name, id));
                }
                self.docker
                    .start_container(&id, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(|e| LaunchError::start_failed(&spec.name, e))?;
                info!(service = %spec.name, container = %id, "Restarted existing container");
                return Ok(Handle::new(&spec.name, id));
            }
            Err(e) if has_status(&e, 404) => {}
            Err(e) => return Err(LaunchError::start_failed(&spec.name, e)),
        }

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                self.container_config(spec),
            )
            .await
            .map_err(|e| LaunchError::start_failed(&spec.name, e))?;

        for warning in &created.warnings {
            warn!(service = %spec.name, "Docker: {}", warning);
        }

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| LaunchError::start_failed(&spec.name, e))?;

        info!(service = %spec.name, container = %created.id, image = %spec.start_ref, "Container started");
        Ok(Handle::new(&spec.name, created.id))
    }

    async fn stop(&self, handle: &Handle, timeout: Duration) -> Result<(), LaunchError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => {}
            // 304: already stopped, 404: already gone
            Err(e) if has_status(&e, 304) || has_status(&e, 404) => {
                debug!(handle = %handle, "Container already stopped");
            }
            Err(e) => return Err(LaunchError::stop_failed(&handle.service, e)),
        }

        match self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if has_status(&e, 404) || has_status(&e, 409) => {}
            Err(e) => return Err(LaunchError::stop_failed(&handle.service, e)),
        }

        info!(handle = %handle, "Container stopped");
        Ok(())
    }

    async fn is_running(&self, handle: &Handle) -> bool {
        match self.docker.inspect_container(&handle.id, None).await {
            Ok(inspect) => inspect.state.and_then(|s| s.running) == Some(true),
            Err(e) => {
                debug!(handle = %handle, error = %e, "Container inspect failed");
                false
            }
        }
    }

    async fn check_available(&self) -> Result<(), LaunchError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| LaunchError::Unavailable(format!("Docker daemon not reachable: {}", e)))
    }

    fn name(&self) -> &str {
        "docker"
    }
}
