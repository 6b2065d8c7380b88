use async_trait::async_trait;
use reconciler::publisher::{ReloadError, Reloader};
use tokio::process::Command;
use tracing::{debug, info};

const INSTANCE_PLACEHOLDER: &str = "{instance}";

/// Runs a command per worker, with `{instance}` replaced by the worker index.
/// A command without the placeholder runs once for all workers.
pub struct CommandReloader {
    command: Vec<String>,
}

impl CommandReloader {
    pub fn new(command: Vec<String>) -> Self {
        CommandReloader { command }
    }

    fn per_instance(&self) -> bool {
        self.command
            .iter()
            .any(|arg| arg.contains(INSTANCE_PLACEHOLDER))
    }

    async fn run(&self, instance: usize) -> Result<(), ReloadError> {
        let args: Vec<String> = self
            .command
            .iter()
            .map(|arg| arg.replace(INSTANCE_PLACEHOLDER, &instance.to_string()))
            .collect();
        let Some((program, args)) = args.split_first() else {
            return Ok(());
        };

        debug!(program = %program, ?args, instance, "running reload command");
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|source| ReloadError::Spawn { instance, source })?;

        if status.success() {
            Ok(())
        } else {
            Err(ReloadError::Failed {
                instance,
                status: status.to_string(),
            })
        }
    }
}

#[async_trait]
impl Reloader for CommandReloader {
    async fn reload(&self, instances: usize) -> Result<(), ReloadError> {
        if !self.per_instance() {
            return self.run(0).await;
        }
        for instance in 0..instances {
            self.run(instance).await?;
        }
        Ok(())
    }
}

/// Used when no reload command is configured.
pub struct LogReloader;

#[async_trait]
impl Reloader for LogReloader {
    async fn reload(&self, instances: usize) -> Result<(), ReloadError> {
        info!(instances, "configuration changed, workers should reload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn reloader(args: &[&str]) -> CommandReloader {
        CommandReloader::new(args.iter().map(|arg| arg.to_string()).collect())
    }

    #[tokio::test]
    async fn runs_once_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("reloads");
        let script = format!("echo {{instance}} >> {}", log.display());

        reloader(&["sh", "-c", script.as_str()]).reload(3).await.unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "0\n1\n2\n");
    }

    #[tokio::test]
    async fn runs_once_without_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("reloads");
        let script = format!("echo reload >> {}", log.display());

        reloader(&["sh", "-c", script.as_str()]).reload(3).await.unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "reload\n");
    }

    #[tokio::test]
    async fn reports_failures() {
        assert!(matches!(
            reloader(&["false"]).reload(1).await,
            Err(ReloadError::Failed { instance: 0, .. })
        ));
        assert!(matches!(
            reloader(&["/nonexistent/reload", "{instance}"]).reload(2).await,
            Err(ReloadError::Spawn { instance: 0, .. })
        ));
        assert!(LogReloader.reload(2).await.is_ok());
    }
}
