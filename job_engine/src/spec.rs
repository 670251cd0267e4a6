//! Translates a run request into a [`ContainerSpec`].

use std::collections::BTreeMap;

use harness_shared_types::{Bind, ContainerSpec, ImageRef, JobError, CLEANUP_LABEL, RUN_ID_LABEL};

use crate::naming::condense_host_name;
use crate::scope::RunScope;

/// Optional settings for one job container.
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// Purpose used in the container name (default: "job").
    pub job_name: String,
    /// Overrides the image entrypoint when non-empty.
    pub entrypoint: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Raw `<source>:<target>[:mode]` strings.
    pub binds: Vec<String>,
    pub user: String,
    pub labels: BTreeMap<String, String>,
    pub network_id: Option<String>,
    pub hostname: Option<String>,
    pub auto_remove: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            job_name: "job".to_string(),
            entrypoint: Vec::new(),
            env: BTreeMap::new(),
            binds: Vec::new(),
            user: String::new(),
            labels: BTreeMap::new(),
            network_id: None,
            hostname: None,
            auto_remove: true,
        }
    }
}

impl ContainerOptions {
    /// Options carrying the scope's cleanup and run-id labels.
    pub fn for_scope(scope: &RunScope) -> Self {
        Self {
            labels: scope.labels(),
            ..Self::default()
        }
    }

    pub fn job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = job_name.into();
        self
    }

    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = entrypoint.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.binds.push(bind.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn network(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = Some(network_id.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }
}

/// Build a validated spec. Nothing is returned unless every check passes.
pub fn build(
    image: ImageRef,
    command: Vec<String>,
    options: ContainerOptions,
) -> Result<ContainerSpec, JobError> {
    if image.repository.is_empty() || image.version.is_empty() {
        return Err(JobError::InvalidSpec(format!(
            "image reference {:?} is incomplete",
            image.to_string()
        )));
    }

    let binds = options
        .binds
        .iter()
        .map(|raw| Bind::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    validate_user(&options.user)?;

    for required in [CLEANUP_LABEL, RUN_ID_LABEL] {
        match options.labels.get(required) {
            Some(value) if !value.is_empty() => {}
            _ => {
                return Err(JobError::InvalidSpec(format!(
                    "label {} is required on every job container",
                    required
                )))
            }
        }
    }

    if options.env.keys().any(|k| k.is_empty() || k.contains('=')) {
        return Err(JobError::InvalidSpec(
            "environment keys must be non-empty and contain no '='".to_string(),
        ));
    }

    let job_name = if options.job_name.is_empty() {
        "job".to_string()
    } else {
        options.job_name
    };

    Ok(ContainerSpec {
        job_name,
        image,
        entrypoint: options.entrypoint,
        args: command,
        env: options.env,
        binds,
        user: options.user,
        labels: options.labels,
        network_id: options.network_id.filter(|id| !id.is_empty()),
        hostname: options.hostname.map(|h| condense_host_name(&h)),
        auto_remove: options.auto_remove,
    })
}

/// Accept an empty string or `uid[:gid]`, each part numeric or a
/// user/group name.
fn validate_user(user: &str) -> Result<(), JobError> {
    if user.is_empty() {
        return Ok(());
    }

    let invalid = || {
        JobError::InvalidSpec(format!("user must be uid[:gid], got {:?}", user))
    };

    let mut parts = user.split(':');
    let uid = parts.next().unwrap_or_default();
    let gid = parts.next();
    if parts.next().is_some() {
        return Err(invalid());
    }

    if !is_id(uid) || gid.is_some_and(|g| !is_id(g)) {
        return Err(invalid());
    }
    Ok(())
}

fn is_id(part: &str) -> bool {
    if part.is_empty() {
        return false;
    }
    if part.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let mut chars = part.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
}
