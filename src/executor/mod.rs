//! Promotion executors: the part that actually changes a stage.
//!
//! The scheduler treats execution as opaque. It hands an admitted promotion
//! to a [`PromotionExecutor`] and records whatever final phase comes back.

pub mod stages;

pub use stages::{StageConfig, StageRegistry, StepConfig};

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Phase, Promotion};

/// What an executor reports back for one promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// `Succeeded` or `Failed`.
    pub phase: Phase,
    /// Failure detail, shown on the promotion.
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl Execution {
    pub fn succeeded(duration_ms: u64) -> Self {
        Self {
            phase: Phase::Succeeded,
            message: None,
            duration_ms,
        }
    }

    pub fn failed(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            phase: Phase::Failed,
            message: Some(message.into()),
            duration_ms,
        }
    }
}

#[async_trait]
pub trait PromotionExecutor: Send + Sync {
    /// Drive `promotion` to a terminal phase.
    ///
    /// Must stop promptly once `cancel` fires.
    ///
    /// # Errors
    ///
    /// An error means the promotion could not be executed at all; the
    /// caller records it as `Failed`.
    async fn execute(&self, promotion: &Promotion, cancel: CancellationToken) -> Result<Execution>;
}

/// Runs the configured steps of a promotion's stage as subprocesses.
pub struct StepExecutor {
    registry: Arc<StageRegistry>,
}

impl StepExecutor {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self { registry }
    }

    async fn run_step(
        &self,
        promotion: &Promotion,
        step: &StepConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Resolve relative command paths against the process CWD.
        let command = if step.command.is_relative() {
            std::env::current_dir()?.join(&step.command)
        } else {
            step.command.clone()
        };

        debug!(
            promotion = %promotion.key(),
            step = %step.name,
            command = %command.display(),
            "running step"
        );

        let mut child = step_command(&command, promotion, &step.name)
            .args(&step.args)
            .kill_on_drop(true)
            .spawn()?;

        let wait = async {
            let status = match step.timeout() {
                Some(limit) => tokio::time::timeout(limit, child.wait())
                    .await
                    .map_err(|_| {
                        Error::Other(format!("{} timed out after {limit:?}", step.name))
                    })??,
                None => child.wait().await?,
            };
            Ok::<_, Error>(status)
        };

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Other(format!("{} cancelled", step.name)));
            }
            status = wait => status?,
        };

        if status.success() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "{} exited with status {}",
                step.name,
                status.code().unwrap_or(-1)
            )))
        }
    }
}

fn step_command(command: &Path, promotion: &Promotion, step: &str) -> Command {
    let mut cmd = Command::new(command);
    cmd.env("STAGEGATE_NAMESPACE", &promotion.namespace)
        .env("STAGEGATE_PROMOTION", &promotion.name)
        .env("STAGEGATE_STAGE", &promotion.stage)
        .env("STAGEGATE_FREIGHT", &promotion.freight)
        .env("STAGEGATE_STEP", step);
    cmd
}

#[async_trait]
impl PromotionExecutor for StepExecutor {
    async fn execute(&self, promotion: &Promotion, cancel: CancellationToken) -> Result<Execution> {
        let stage = self
            .registry
            .get(&promotion.stage)
            .ok_or_else(|| Error::NotFound(format!("stage config for {}", promotion.stage)))?;

        let start = Instant::now();
        for step in &stage.steps {
            let step_start = Instant::now();
            match self.run_step(promotion, step, &cancel).await {
                Ok(()) => {
                    info!(
                        promotion = %promotion.key(),
                        step = %step.name,
                        duration_ms = step_start.elapsed().as_millis() as u64,
                        "step completed"
                    );
                }
                Err(e) if cancel.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        promotion = %promotion.key(),
                        step = %step.name,
                        error = %e,
                        "step failed"
                    );
                    return Ok(Execution::failed(
                        e.to_string(),
                        start.elapsed().as_millis() as u64,
                    ));
                }
            }
        }

        Ok(Execution::succeeded(start.elapsed().as_millis() as u64))
    }
}
