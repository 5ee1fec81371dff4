//! Transfers run as an external worker process.
//!
//! The worker is this binary's `push` command (or whatever `workers.program`
//! names), optionally behind a launcher prefix such as `ssh <host> <wrapper>`
//! for sequential-stream access, which must run next to the data.

use crate::error::PipelineError;
use crate::models::{AccessMode, DataRequest};
use crate::telemetry;
use lclconf::StreamConfig;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable carrying the W3C trace context to the worker.
pub const TRACEPARENT_ENV: &str = "TRACEPARENT";

/// Fully resolved worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn for_request(request: &DataRequest, config: &StreamConfig) -> Self {
        let mut argv: Vec<String> = Vec::new();
        if request.access_mode == AccessMode::Sequential {
            argv.extend(config.workers.launcher.iter().cloned());
        }
        argv.push(config.workers.program.clone());
        argv.extend([
            "push".to_string(),
            "-e".into(),
            request.experiment.clone(),
            "-r".into(),
            request.run.to_string(),
            "-d".into(),
            request.detector_name.clone(),
            "-m".into(),
            request.retrieval_mode.as_str().into(),
            "-c".into(),
            request.access_mode.as_str().into(),
            "-a".into(),
            request.destination_address.clone(),
            "--ndial".into(),
            config.transport.ndial.to_string(),
            "--batch-size".into(),
            config.pipeline.batch_size.to_string(),
            "--codec".into(),
            config.pipeline.codec.as_str().into(),
        ]);

        let program = argv.remove(0);
        Self { program, args: argv }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(traceparent) = telemetry::current_traceparent() {
            cmd.env(TRACEPARENT_ENV, traceparent);
        }
        cmd
    }

    /// Launch and wait for exit. Cancellation kills the child.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|source| PipelineError::WorkerSpawn {
                program: self.program.clone(),
                source,
            })?;
        info!(
            "worker {} started (pid {:?}): {}",
            self.program,
            child.id(),
            self.args.join(" ")
        );

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| PipelineError::WorkerSpawn {
                program: self.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                debug!("killing worker {}", self.program);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker {}: {}", self.program, e);
                }
                return Err(PipelineError::Canceled);
            }
        };

        if !status.success() {
            return Err(PipelineError::WorkerFailed(status.code().unwrap_or(-1)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrievalMode;
    use pretty_assertions::assert_eq;

    fn request(access_mode: AccessMode) -> DataRequest {
        DataRequest {
            experiment: "xpptut15".into(),
            run: 580,
            access_mode,
            detector_name: "jungfrau4M".into(),
            retrieval_mode: RetrievalMode::AssembledImage,
            destination_address: "tcp://sdfiana:5000".into(),
        }
    }

    #[test]
    fn test_indexed_command_line() {
        let mut config = StreamConfig::default();
        config.workers.launcher = vec!["ssh".into(), "psana".into()];

        let cmd = WorkerCommand::for_request(&request(AccessMode::Indexed), &config);
        assert_eq!(cmd.program(), "lclstream");
        assert_eq!(
            cmd.args().join(" "),
            "push -e xpptut15 -r 580 -d jungfrau4M -m image -c idx -a tcp://sdfiana:5000 \
             --ndial 1 --batch-size 20 --codec container"
        );
    }

    #[test]
    fn test_sequential_uses_launcher() {
        let mut config = StreamConfig::default();
        config.workers.launcher = vec!["ssh".into(), "psana".into(), "/opt/run_push".into()];

        let cmd = WorkerCommand::for_request(&request(AccessMode::Sequential), &config);
        assert_eq!(cmd.program(), "ssh");
        assert_eq!(&cmd.args()[..3], &["psana", "/opt/run_push", "lclstream"]);
        assert!(cmd.args().contains(&"smd".to_string()));
    }

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn test_exit_codes() {
        assert!(shell("exit 0").run(CancellationToken::new()).await.is_ok());
        assert!(matches!(
            shell("exit 3").run(CancellationToken::new()).await,
            Err(PipelineError::WorkerFailed(3))
        ));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = WorkerCommand {
            program: "/nonexistent/lclstream-worker".into(),
            args: vec![],
        };
        assert!(matches!(
            cmd.run(CancellationToken::new()).await,
            Err(PipelineError::WorkerSpawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_kills_worker() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = shell("sleep 30").run(cancel).await;
        assert!(matches!(result, Err(PipelineError::Canceled)));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
