//! Operation types this agent can run.

use anyhow::{bail, Context};
use shoal_core::engine::{Operation, OperationRegistry, TaskRun};
use shoal_core::{Capabilities, EngineResult};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub fn registry() -> EngineResult<OperationRegistry> {
    Ok(OperationRegistry::builder()
        .register(Arc::new(Noop))?
        .register(Arc::new(Wait))?
        .register(Arc::new(Script))?
        .build())
}

/// Succeeds without side effects. Useful as a stage marker.
pub struct Noop;

#[async_trait::async_trait]
impl Operation for Noop {
    fn type_name(&self) -> &str {
        "noop"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn execute(&self, run: &mut TaskRun) -> anyhow::Result<()> {
        run.log("nothing to do");
        Ok(())
    }
}

/// Sleeps for `seconds`, giving other agents time to settle.
pub struct Wait;

#[async_trait::async_trait]
impl Operation for Wait {
    fn type_name(&self) -> &str {
        "wait"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .continuable()
            .retryable()
            .passable()
            .cancellable()
    }

    async fn execute(&self, run: &mut TaskRun) -> anyhow::Result<()> {
        let seconds: u64 = run.context().param("seconds")?;
        run.log(format!("waiting {}s", seconds));

        let cancel = run.cancellation().clone();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            _ = cancel.cancelled() => bail!("wait interrupted"),
        }

        run.log("wait finished");
        Ok(())
    }
}

/// Runs a program on the execute agent.
///
/// Parameters: `command` (program), optional `args`, and optional
/// `rollback_command` / `rollback_args` for the compensating action.
/// Every output line lands in the task log. The exit code is stored as the
/// `exit_code` result.
pub struct Script;

#[async_trait::async_trait]
impl Operation for Script {
    fn type_name(&self) -> &str {
        "script"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
            .retryable()
            .passable()
            .rollbackable()
            .cancellable()
    }

    async fn execute(&self, run: &mut TaskRun) -> anyhow::Result<()> {
        let command: String = run.context().param("command")?;
        let args: Vec<String> = run.context().param_opt("args")?.unwrap_or_default();
        run_command(run, &command, &args).await
    }

    async fn rollback(&self, run: &mut TaskRun) -> anyhow::Result<()> {
        let Some(command) = run.context().param_opt::<String>("rollback_command")? else {
            run.log("no rollback_command given, nothing to roll back");
            return Ok(());
        };
        let args: Vec<String> = run
            .context()
            .param_opt("rollback_args")?
            .unwrap_or_default();
        run_command(run, &command, &args).await
    }
}

async fn run_command(run: &mut TaskRun, command: &str, args: &[String]) -> anyhow::Result<()> {
    run.log(format!("$ {} {}", command, args.join(" ")));

    let mut child = Command::new(command)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start '{}'", command))?;

    let stdout = child.stdout.take().context("stdout not captured")?;
    let stderr = child.stderr.take().context("stderr not captured")?;
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            line = stdout.next_line(), if out_open => match line? {
                Some(line) => run.log(line),
                None => out_open = false,
            },
            line = stderr.next_line(), if err_open => match line? {
                Some(line) => run.log(line),
                None => err_open = false,
            },
        }
    }

    let status = child.wait().await?;
    let code = status.code();
    run.context_mut().set_result("exit_code", code)?;

    match code {
        Some(0) => Ok(()),
        Some(code) => bail!("'{}' exited with code {}", command, code),
        None => bail!("'{}' was terminated by a signal", command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::engine::TaskLogger;
    use shoal_core::{AgentInfo, DagId, TaskContext, TaskId};
    use tokio_util::sync::CancellationToken;

    fn run_for(context: TaskContext, cancel: CancellationToken) -> TaskRun {
        let task_id = TaskId::new();
        let agent = context.execute_agent.clone();
        TaskRun::new(
            DagId::new(),
            task_id,
            context,
            agent,
            TaskLogger::new(task_id, None),
            cancel,
        )
    }

    fn context() -> TaskContext {
        TaskContext::new(AgentInfo::new("127.0.0.1", 2886))
    }

    #[test]
    fn test_registry_contents() {
        let registry = registry().unwrap();
        assert_eq!(registry.type_names(), vec!["noop", "script", "wait"]);
        assert!(!registry.capabilities("script").unwrap().can_continue);
        assert!(registry.capabilities("wait").unwrap().can_cancel);
    }

    #[tokio::test]
    async fn test_wait_observes_cancellation() {
        let cancel = CancellationToken::new();
        let mut run = run_for(context().with_param("seconds", 3600), cancel.clone());

        cancel.cancel();
        let err = Wait.execute(&mut run).await.unwrap_err();
        assert_eq!(err.to_string(), "wait interrupted");
    }

    #[tokio::test]
    async fn test_wait_requires_seconds() {
        let mut run = run_for(context(), CancellationToken::new());
        assert!(Wait.execute(&mut run).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_logs_output() {
        let ctx = context()
            .with_param("command", "sh")
            .with_param("args", vec!["-c", "echo zone z1 added; echo warn >&2"]);
        let mut run = run_for(ctx, CancellationToken::new());

        Script.execute(&mut run).await.unwrap();

        let lines: Vec<&str> = run.logs().iter().map(|l| l.message.as_str()).collect();
        assert!(lines.contains(&"zone z1 added"));
        assert!(lines.contains(&"warn"));
        assert_eq!(run.context().result::<i32>("exit_code"), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_failure_carries_exit_code() {
        let ctx = context()
            .with_param("command", "sh")
            .with_param("args", vec!["-c", "echo disk full >&2; exit 3"]);
        let mut run = run_for(ctx, CancellationToken::new());

        let err = Script.execute(&mut run).await.unwrap_err();
        assert!(err.to_string().contains("exited with code 3"));
        assert_eq!(run.context().result::<i32>("exit_code"), Some(3));
    }

    #[tokio::test]
    async fn test_script_rollback_without_command() {
        let mut run = run_for(context().with_param("command", "true"), CancellationToken::new());
        Script.rollback(&mut run).await.unwrap();
    }
}
