//! Docker engine backed by bollard.
//!
//! # Requirements
//!
//! - A reachable Docker daemon (`DOCKER_HOST` or the local socket)
//! - API version 1.41 or newer for the `removed` wait condition

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::system::EventsOptions;
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use tracing::{debug, info};

use container_engine_interface::{
    ContainerEngine, ContainerInfo, EngineResult, LabelFilter, OutputChunk, OutputStream,
    RemovalNotice, WaitCondition, WaitOutcome,
};
use harness_shared_types::{ContainerSpec, EngineError, ImageRef};

use crate::config::DockerConfig;

/// Map a bollard error onto the engine error kinds the runner branches on.
fn engine_error(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        BollardError::DockerStreamError { error } => EngineError::Stream(error),
        other => EngineError::Transport(other.to_string()),
    }
}

/// Stateless handle to a Docker daemon. Clones share one connection pool.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `config`, falling back to the local defaults.
    pub fn connect(config: &DockerConfig) -> EngineResult<Self> {
        let docker = match &config.socket {
            Some(socket) => Docker::connect_with_socket(
                &socket.to_string_lossy(),
                config.timeout_secs,
                API_DEFAULT_VERSION,
            )
            .map_err(engine_error)?,
            None => Docker::connect_with_local_defaults()
                .map_err(engine_error)?
                .with_timeout(Duration::from_secs(config.timeout_secs)),
        };
        info!("Connected to Docker engine");
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn label_filters(filter: &LabelFilter) -> HashMap<String, Vec<String>> {
        HashMap::from([("label".to_string(), vec![filter.to_filter()])])
    }

    fn to_hash_map(labels: &BTreeMap<String, String>) -> HashMap<String, String> {
        labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Translate a spec into bollard's create body.
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let networking_config = spec.network_id.as_ref().map(|network| bollard::container::NetworkingConfig {
        endpoints_config: HashMap::from([(network.clone(), EndpointSettings::default())]),
    });

    Config {
        image: Some(spec.image.to_string()),
        entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
        cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: (!spec.env.is_empty()).then(|| spec.env_list()),
        user: (!spec.user.is_empty()).then(|| spec.user.clone()),
        hostname: spec.hostname.clone(),
        labels: Some(DockerEngine::to_hash_map(&spec.labels)),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.bind_list()),
            auto_remove: Some(spec.auto_remove),
            network_mode: spec.network_id.clone(),
            ..Default::default()
        }),
        networking_config,
        ..Default::default()
    }
}

/// Split a bollard wait error into a terminal status when it only encodes
/// a non-zero exit.
fn wait_error_outcome(err: BollardError) -> EngineResult<WaitOutcome> {
    match err {
        BollardError::DockerContainerWaitError { error, code } => Ok(WaitOutcome {
            status_code: code,
            error: (!error.is_empty()).then_some(error),
        }),
        other => Err(engine_error(other)),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &ImageRef) -> EngineResult<bool> {
        match self.docker.inspect_image(&image.to_string()).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(engine_error(e)),
        }
    }

    async fn pull_image(&self, image: &ImageRef) -> EngineResult<()> {
        let options = if image.is_digest() {
            CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }
        } else {
            CreateImageOptions {
                from_image: image.repository.clone(),
                tag: image.version.clone(),
                ..Default::default()
            }
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(engine_error)?;
            if let Some(status) = progress.status {
                debug!(image = %image, "{}", status);
            }
        }
        Ok(())
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> EngineResult<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(engine_error)?;
        for warning in response.warnings {
            debug!(container = %name, "Create warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn attach_container(&self, id: &str) -> EngineResult<OutputStream> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, .. } =
            self.docker.attach_container(id, Some(options)).await.map_err(engine_error)?;

        let chunks = output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::Stdout(message.to_vec())))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message.to_vec()))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(engine_error(e))),
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn wait_container(&self, id: &str, condition: WaitCondition) -> EngineResult<WaitOutcome> {
        let options = WaitContainerOptions {
            condition: condition.as_str(),
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(WaitOutcome {
                status_code: response.status_code,
                error: response
                    .error
                    .and_then(|e| e.message)
                    .filter(|m| !m.is_empty()),
            }),
            Some(Err(e)) => wait_error_outcome(e),
            None => Err(EngineError::Stream(format!(
                "wait stream for {} closed without a result",
                id
            ))),
        }
    }

    async fn wait_removed(&self, id: &str) -> EngineResult<RemovalNotice> {
        let options = EventsOptions::<String> {
            filters: HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                ("container".to_string(), vec![id.to_string()]),
                ("event".to_string(), vec!["die".to_string(), "destroy".to_string()]),
            ]),
            ..Default::default()
        };
        let mut events = self.docker.events(Some(options));

        let mut exit_code = None;
        while let Some(event) = events.next().await {
            let event = event.map_err(engine_error)?;
            match event.action.as_deref() {
                Some("die") => {
                    exit_code = event
                        .actor
                        .and_then(|actor| actor.attributes)
                        .and_then(|attrs| attrs.get("exitCode").and_then(|c| c.parse().ok()));
                }
                Some("destroy") => return Ok(RemovalNotice { exit_code }),
                _ => {}
            }
        }
        Err(EngineError::Stream(format!("event stream for {} ended", id)))
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await.map_err(engine_error)?;
        Ok(())
    }

    async fn inspect_container(&self, id_or_name: &str) -> EngineResult<Option<ContainerInfo>> {
        match self.docker.inspect_container(id_or_name, None).await {
            Ok(info) => {
                let config = info.config.unwrap_or_default();
                Ok(Some(ContainerInfo {
                    id: info.id.unwrap_or_default(),
                    name: info
                        .name
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    labels: config.labels.unwrap_or_default().into_iter().collect(),
                    running: info.state.and_then(|s| s.running).unwrap_or(false),
                }))
            }
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(engine_error(e)),
        }
    }

    async fn list_containers(&self, filter: &LabelFilter) -> EngineResult<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: Self::label_filters(filter),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await.map_err(engine_error)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                labels: c.labels.unwrap_or_default().into_iter().collect(),
                running: c.state.as_deref() == Some("running"),
            })
            .collect())
    }

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> EngineResult<String> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: Self::to_hash_map(labels),
            ..Default::default()
        };
        let volume = self.docker.create_volume(options).await.map_err(engine_error)?;
        Ok(volume.name)
    }

    async fn list_volumes(&self, filter: &LabelFilter) -> EngineResult<Vec<String>> {
        let options = ListVolumesOptions::<String> {
            filters: Self::label_filters(filter),
        };
        let response = self.docker.list_volumes(Some(options)).await.map_err(engine_error)?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> EngineResult<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn create_network(&self, name: &str, labels: &BTreeMap<String, String>) -> EngineResult<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            labels: Self::to_hash_map(labels),
            ..Default::default()
        };
        self.docker.create_network(options).await.map_err(engine_error)?;
        // Docker takes the name anywhere a network id is expected.
        Ok(name.to_string())
    }

    async fn list_networks(&self, filter: &LabelFilter) -> EngineResult<Vec<String>> {
        let options = ListNetworksOptions::<String> {
            filters: Self::label_filters(filter),
        };
        let networks = self.docker.list_networks(Some(options)).await.map_err(engine_error)?;
        Ok(networks.into_iter().filter_map(|n| n.id).collect())
    }

    async fn remove_network(&self, id: &str) -> EngineResult<()> {
        self.docker.remove_network(id).await.map_err(engine_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_shared_types::Bind;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            job_name: "job".to_string(),
            image: ImageRef::new("busybox", "stable"),
            entrypoint: vec!["sh".to_string(), "-c".to_string()],
            args: vec!["exit 0".to_string()],
            env: BTreeMap::from([("HOME".to_string(), "/home/node".to_string())]),
            binds: vec![Bind::new("vol-1", "/mnt/test")],
            user: "0:0".to_string(),
            labels: BTreeMap::from([("harness.cleanup".to_string(), "TestDocker".to_string())]),
            network_id: Some("net-1".to_string()),
            hostname: None,
            auto_remove: true,
        }
    }

    #[test]
    fn test_container_config_translation() {
        let config = container_config(&spec());
        assert_eq!(config.image.as_deref(), Some("busybox:stable"));
        assert_eq!(config.entrypoint, Some(vec!["sh".to_string(), "-c".to_string()]));
        assert_eq!(config.cmd, Some(vec!["exit 0".to_string()]));
        assert_eq!(config.env, Some(vec!["HOME=/home/node".to_string()]));
        assert_eq!(config.user.as_deref(), Some("0:0"));

        let host = config.host_config.unwrap();
        assert_eq!(host.binds, Some(vec!["vol-1:/mnt/test".to_string()]));
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("net-1"));
        assert!(config.networking_config.unwrap().endpoints_config.contains_key("net-1"));
    }

    #[test]
    fn test_empty_fields_use_image_defaults() {
        let mut spec = spec();
        spec.entrypoint.clear();
        spec.user.clear();
        spec.env.clear();
        spec.network_id = None;

        let config = container_config(&spec);
        assert!(config.entrypoint.is_none());
        assert!(config.user.is_none());
        assert!(config.env.is_none());
        assert!(config.networking_config.is_none());
    }

    #[test]
    fn test_error_mapping() {
        let not_found = engine_error(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".to_string(),
        });
        assert!(not_found.is_not_found());

        let conflict = engine_error(BollardError::DockerResponseServerError {
            status_code: 409,
            message: "removal already in progress".to_string(),
        });
        assert!(matches!(conflict, EngineError::Conflict(_)));
    }

    #[test]
    fn test_non_zero_wait_error_is_an_exit_status() {
        let outcome = wait_error_outcome(BollardError::DockerContainerWaitError {
            error: String::new(),
            code: 7,
        })
        .unwrap();
        assert_eq!(outcome, WaitOutcome::exited(7));

        let outcome = wait_error_outcome(BollardError::DockerContainerWaitError {
            error: "oci runtime error".to_string(),
            code: 1,
        })
        .unwrap();
        assert_eq!(outcome.error.as_deref(), Some("oci runtime error"));

        let err = wait_error_outcome(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        })
        .unwrap_err();
        assert!(err.is_not_found());
    }
}
