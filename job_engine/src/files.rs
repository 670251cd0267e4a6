//! Reads files out of named volumes through a helper container.

use std::path::{Component, Path};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use harness_shared_types::{Bind, JobError, ROOT_USER};

use crate::runner::JobRunner;
use crate::scope::RunScope;
use crate::spec::{self, ContainerOptions};

const MOUNT_PATH: &str = "/mnt/harness-volume";

pub struct FileRetriever<'a> {
    runner: &'a JobRunner,
    scope: &'a RunScope,
}

impl<'a> FileRetriever<'a> {
    pub fn new(runner: &'a JobRunner, scope: &'a RunScope) -> Self {
        Self { runner, scope }
    }

    /// Content of `rel_path` inside `volume`.
    ///
    /// The volume is mounted read-only. A missing file surfaces as
    /// [`JobError::NonZeroExit`] with the helper's stderr.
    pub async fn single_file_content(
        &self,
        cancel: &CancellationToken,
        volume: &str,
        rel_path: &str,
    ) -> Result<Vec<u8>, JobError> {
        let rel_path = validate_relative_path(rel_path)?;
        if volume.is_empty() {
            return Err(JobError::InvalidSpec("volume name must not be empty".to_string()));
        }

        let target = format!("{}/{}", MOUNT_PATH, rel_path);
        let spec = spec::build(
            self.runner.config().helper_image.clone(),
            vec!["cat".to_string(), target],
            ContainerOptions::for_scope(self.scope)
                .job_name("getfile")
                .bind(Bind::new(volume, MOUNT_PATH).read_only().to_string())
                .user(ROOT_USER),
        )?;

        let result = self.runner.run(cancel, &spec).await?;
        result.check()?;
        if let Some(err) = &result.container_error {
            return Err(err.clone());
        }

        debug!(volume, path = rel_path, bytes = result.stdout.len(), "Retrieved file");
        Ok(result.stdout)
    }
}

/// Accept only plain relative paths that stay inside the volume.
fn validate_relative_path(rel_path: &str) -> Result<&str, JobError> {
    let trimmed = rel_path.trim_start_matches("./");
    if trimmed.is_empty() {
        return Err(JobError::InvalidSpec("file path must not be empty".to_string()));
    }

    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(JobError::InvalidSpec(format!(
                    "file path {:?} escapes the volume",
                    rel_path
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(JobError::InvalidSpec(format!(
                    "file path {:?} must be relative to the volume root",
                    rel_path
                )))
            }
        }
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_relative_path() {
        assert_eq!(validate_relative_path("hello.txt").unwrap(), "hello.txt");
        assert_eq!(validate_relative_path("./foo/bar/baz.txt").unwrap(), "foo/bar/baz.txt");
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("foo/../../etc/passwd").is_err());
    }

    #[cfg(feature = "mock-engine")]
    mod with_mock {
        use std::sync::Arc;

        use super::*;
        use crate::config::JobEngineConfig;
        use crate::mock::{JobScript, MockEngine};

        fn runner(engine: &MockEngine) -> JobRunner {
            JobRunner::new(Arc::new(engine.clone()), JobEngineConfig::default())
        }

        #[tokio::test]
        async fn test_top_level_file() {
            let engine = MockEngine::new();
            engine.on_command("hello.txt", JobScript::exit(0).stdout("hello world"));
            let runner = runner(&engine);
            let scope = RunScope::new("TestFileRetriever");

            let content = FileRetriever::new(&runner, &scope)
                .single_file_content(&CancellationToken::new(), "vol-1", "hello.txt")
                .await
                .unwrap();
            assert_eq!(content, b"hello world");

            let (_, spec) = &engine.created_specs()[0];
            assert_eq!(spec.args, vec!["cat", "/mnt/harness-volume/hello.txt"]);
            assert_eq!(spec.bind_list(), vec!["vol-1:/mnt/harness-volume:ro".to_string()]);
        }

        #[tokio::test]
        async fn test_nested_file() {
            let engine = MockEngine::new();
            engine.on_command("foo/bar/baz.txt", JobScript::exit(0).stdout("test"));
            let runner = runner(&engine);
            let scope = RunScope::new("TestFileRetriever/nested file");

            let content = FileRetriever::new(&runner, &scope)
                .single_file_content(&CancellationToken::new(), "vol-1", "foo/bar/baz.txt")
                .await
                .unwrap();
            assert_eq!(content, b"test");
        }

        #[tokio::test]
        async fn test_missing_file() {
            let engine = MockEngine::new();
            engine.on_command(
                "cat",
                JobScript::exit(1).stderr("cat: can't open '/mnt/harness-volume/nope': No such file or directory\n"),
            );
            let runner = runner(&engine);
            let scope = RunScope::new("TestFileRetriever");

            let err = FileRetriever::new(&runner, &scope)
                .single_file_content(&CancellationToken::new(), "vol-1", "nope")
                .await
                .unwrap_err();
            assert!(matches!(err, JobError::NonZeroExit { code: 1, ref stderr } if stderr.contains("No such file")));
        }

        #[tokio::test]
        async fn test_escaping_path_creates_nothing() {
            let engine = MockEngine::new();
            let runner = runner(&engine);
            let scope = RunScope::new("TestFileRetriever");

            let err = FileRetriever::new(&runner, &scope)
                .single_file_content(&CancellationToken::new(), "vol-1", "../secret")
                .await
                .unwrap_err();
            assert!(matches!(err, JobError::InvalidSpec(_)));
            assert!(engine.created_specs().is_empty());
        }
    }
}
