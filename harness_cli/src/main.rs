// Harness CLI
//
// Runs one-off jobs in containers and cleans up after test runs.

mod config;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use job_engine::{
    spec, ContainerEngine, ContainerOptions, DockerEngine, FileRetriever, ImageRef, JobRunner,
    RunScope, VolumeOwner,
};
use observability::{init_tracing, LogFormat, TracingError};

use crate::config::HarnessConfig;

#[derive(Parser)]
#[command(name = "harness")]
#[command(version)]
#[command(about = "Run ephemeral container jobs for chain tests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: <config_dir>/chain-harness/config.toml)
    #[arg(long, global = true, env = "HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in a fresh container and print its output
    Run {
        /// Image reference, e.g. ghcr.io/org/chain:v1.0.0
        #[arg(long, default_value = "busybox:stable")]
        image: String,

        /// Override the image entrypoint
        #[arg(long)]
        entrypoint: Option<String>,

        /// User to run as (uid[:gid])
        #[arg(long)]
        user: Option<String>,

        /// Volume binding <source>:<target>[:mode], repeatable
        #[arg(long = "bind")]
        binds: Vec<String>,

        /// Environment variable KEY=VALUE, repeatable
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Cleanup scope the container is labelled with
        #[arg(long, default_value = "harness")]
        scope: String,

        /// Cancel the job after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Keep the container until explicit cleanup instead of auto-removal
        #[arg(long)]
        no_auto_remove: bool,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Remove every container, volume and network of a scope
    Sweep {
        #[arg(long)]
        scope: String,
    },

    /// Chown a volume so a non-root chain image can use it
    VolumeOwner {
        #[arg(long)]
        volume: String,

        /// Owner as uid[:gid] (default: root)
        #[arg(long)]
        owner: Option<String>,

        #[arg(long, default_value = "harness")]
        scope: String,
    },

    /// Print a file stored in a volume
    Cat {
        #[arg(long)]
        volume: String,

        /// Path relative to the volume root
        #[arg(long)]
        path: String,

        #[arg(long, default_value = "harness")]
        scope: String,
    },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = HarnessConfig::load(cli.config.as_deref())?;

    let mut tracing_config = config.logging.clone();
    if cli.json_logs {
        tracing_config.format = LogFormat::Json;
    }
    match init_tracing(&tracing_config) {
        Ok(()) | Err(TracingError::AlreadyInitialized) => {}
        Err(e) => return Err(e.into()),
    }

    let engine: Arc<dyn ContainerEngine> = Arc::new(
        DockerEngine::connect(&config.docker_config()).context("Failed to connect to Docker")?,
    );
    let runner = JobRunner::new(engine.clone(), config.engine_config()?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling job");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Run {
            image,
            entrypoint,
            user,
            binds,
            env,
            scope,
            timeout,
            no_auto_remove,
            command,
        } => {
            let scope = RunScope::new(&scope);
            let mut options = ContainerOptions::for_scope(&scope).auto_remove(!no_auto_remove);
            if let Some(entrypoint) = entrypoint {
                options = options.entrypoint([entrypoint]);
            }
            if let Some(user) = user {
                options = options.user(user);
            }
            for bind in binds {
                options = options.bind(bind);
            }
            for (key, value) in env {
                options = options.env(key, value);
            }

            let image = ImageRef::parse(&image)?;
            let spec = spec::build(image, command, options)?;
            let result = match timeout {
                Some(secs) => runner.run_with_timeout(&cancel, &spec, Duration::from_secs(secs)).await?,
                None => runner.run(&cancel, &spec).await?,
            };

            let status = format!("exit code {}", result.exit_code);
            if result.success() {
                eprintln!("{} {}", "✓".green(), status);
            } else {
                eprintln!("{} {}", "✗".red(), status.red());
            }
            if let Some(err) = &result.container_error {
                eprintln!("{} {}", "!".yellow(), err);
            }
            debug!(container = %result.container_name, source = ?result.exit_source, "Job result");

            std::io::stdout().write_all(&result.stdout)?;
            std::io::stderr().write_all(&result.stderr)?;

            Ok(ExitCode::from(u8::try_from(result.exit_code).unwrap_or(1)))
        }
        Commands::Sweep { scope } => {
            let scope = RunScope::new(&scope);
            let report = scope.teardown(engine.as_ref()).await;
            println!("{}: {}", scope.name().bold(), report);
            for failure in &report.failures {
                println!("  {} {}", "✗".red(), failure);
            }
            if report.failures.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::VolumeOwner { volume, owner, scope } => {
            let scope = RunScope::new(&scope);
            VolumeOwner::new(&runner, &scope)
                .set_owner(&cancel, &volume, owner.as_deref())
                .await
                .with_context(|| format!("Failed to set owner of volume {}", volume))?;
            println!("{} {}", "✓".green(), volume);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cat { volume, path, scope } => {
            let scope = RunScope::new(&scope);
            let content = FileRetriever::new(&runner, &scope)
                .single_file_content(&cancel, &volume, &path)
                .await
                .with_context(|| format!("Failed to read {} from volume {}", path, volume))?;
            std::io::stdout().write_all(&content)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(parse_env("A=1").unwrap(), ("A".to_string(), "1".to_string()));
        assert_eq!(parse_env("A=b=c").unwrap(), ("A".to_string(), "b=c".to_string()));
        assert!(parse_env("=1").is_err());
        assert!(parse_env("A").is_err());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "harness", "run", "--image", "busybox:1.36", "--bind", "vol:/data", "--env", "HOME=/data",
            "--timeout", "10", "--", "sh", "-c", "ls /data",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                image,
                binds,
                env,
                timeout,
                command,
                no_auto_remove,
                ..
            } => {
                assert_eq!(image, "busybox:1.36");
                assert_eq!(binds, vec!["vol:/data"]);
                assert_eq!(env, vec![("HOME".to_string(), "/data".to_string())]);
                assert_eq!(timeout, Some(10));
                assert_eq!(command, vec!["sh", "-c", "ls /data"]);
                assert!(!no_auto_remove);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["harness", "run"]).is_err());
    }

    #[test]
    fn test_cat_arguments() {
        let cli = Cli::try_parse_from([
            "harness", "cat", "--volume", "v1", "--path", "foo/bar.txt", "--scope", "TestCat",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cat { ref volume, ref path, ref scope } if volume == "v1" && path == "foo/bar.txt" && scope == "TestCat"
        ));
    }
}
