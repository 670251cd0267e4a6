//! Volume ownership helper.

use tokio_util::sync::CancellationToken;
use tracing::info;

use harness_shared_types::{JobError, ROOT_USER};

use crate::runner::JobRunner;
use crate::scope::RunScope;
use crate::spec::{self, ContainerOptions};

/// Where the helper container mounts the volume.
pub const VOLUME_MOUNT_PATH: &str = "/mnt/dockervolume";

/// Hands a named volume to a non-root user.
///
/// Chain images usually run as an unprivileged user while fresh volumes are
/// owned by root, so each volume gets chowned once before the node uses it.
pub struct VolumeOwner<'a> {
    runner: &'a JobRunner,
    scope: &'a RunScope,
}

impl<'a> VolumeOwner<'a> {
    pub fn new(runner: &'a JobRunner, scope: &'a RunScope) -> Self {
        Self { runner, scope }
    }

    /// Make `owner` (`uid[:gid]`, default root) own `volume` with mode 0700.
    pub async fn set_owner(
        &self,
        cancel: &CancellationToken,
        volume: &str,
        owner: Option<&str>,
    ) -> Result<(), JobError> {
        let owner = owner.filter(|o| !o.is_empty()).unwrap_or(ROOT_USER);
        if volume.is_empty() {
            return Err(JobError::InvalidSpec("volume name must not be empty".to_string()));
        }

        let spec = spec::build(
            self.runner.config().helper_image.clone(),
            vec![
                r#"chown "$2" "$1" && chmod 0700 "$1""#.to_string(),
                // arg0 for `sh -c`
                "_".to_string(),
                VOLUME_MOUNT_PATH.to_string(),
                owner.to_string(),
            ],
            ContainerOptions::for_scope(self.scope)
                .job_name("volumeowner")
                .entrypoint(["sh", "-c"])
                .bind(format!("{}:{}", volume, VOLUME_MOUNT_PATH))
                .user(ROOT_USER),
        )?;

        let result = self.runner.run(cancel, &spec).await?;
        result.check()?;
        info!(volume, owner, "Volume ownership set");
        Ok(())
    }
}

#[cfg(all(test, feature = "mock-engine"))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::JobEngineConfig;
    use crate::mock::{JobScript, MockEngine};

    fn runner(engine: &MockEngine) -> JobRunner {
        JobRunner::new(Arc::new(engine.clone()), JobEngineConfig::default())
    }

    #[tokio::test]
    async fn test_set_owner_runs_chown_as_root() {
        let engine = MockEngine::new();
        engine.on_command("chown", JobScript::exit(0));
        let runner = runner(&engine);
        let scope = RunScope::new("TestVolumeOwner");

        VolumeOwner::new(&runner, &scope)
            .set_owner(&CancellationToken::new(), "vol-a", Some("1000:1000"))
            .await
            .unwrap();

        let created = engine.created_specs();
        assert_eq!(created.len(), 1);
        let (name, spec) = &created[0];
        assert!(name.starts_with("harness-volumeowner-"));
        assert_eq!(spec.user, ROOT_USER);
        assert_eq!(spec.entrypoint, vec!["sh", "-c"]);
        assert_eq!(spec.args[2], VOLUME_MOUNT_PATH);
        assert_eq!(spec.args[3], "1000:1000");
        assert_eq!(spec.bind_list(), vec!["vol-a:/mnt/dockervolume".to_string()]);
        assert_eq!(spec.cleanup_scope(), Some(scope.name()));
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn test_owner_defaults_to_root() {
        let engine = MockEngine::new();
        engine.on_command("chown", JobScript::exit(0));
        let runner = runner(&engine);
        let scope = RunScope::new("TestVolumeOwner");

        VolumeOwner::new(&runner, &scope)
            .set_owner(&CancellationToken::new(), "vol-b", None)
            .await
            .unwrap();

        assert_eq!(engine.created_specs()[0].1.args[3], ROOT_USER);
    }

    #[tokio::test]
    async fn test_failed_chown_is_an_error() {
        let engine = MockEngine::new();
        engine.on_command(
            "chown",
            JobScript::exit(1).stderr("chown: unknown user nobody\n"),
        );
        let runner = runner(&engine);
        let scope = RunScope::new("TestVolumeOwner");

        let err = VolumeOwner::new(&runner, &scope)
            .set_owner(&CancellationToken::new(), "vol-c", Some("nobody"))
            .await
            .unwrap_err();
        match err {
            JobError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "chown: unknown user nobody");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
