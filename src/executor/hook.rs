// Recovery hook run once after a failed task

use tokio::process::Command;
use tracing::{info, warn};

use crate::output::errors::SpotError;

/// Run `line` with `sh -c`, inheriting environment and standard streams.
pub async fn run_on_error(line: &str) -> Result<(), SpotError> {
    let hook_err = |message: String| SpotError::Hook {
        command: line.to_string(),
        message,
    };

    info!("run on-error command {:?}", line);
    let status = Command::new("sh")
        .arg("-c")
        .arg(line)
        .status()
        .await
        .map_err(|e| hook_err(e.to_string()))?;

    if !status.success() {
        return Err(hook_err(status.to_string()));
    }
    Ok(())
}

/// Best effort: a failing hook is logged and otherwise ignored
pub async fn run_on_error_logged(line: &str) {
    if let Err(e) = run_on_error(line).await {
        warn!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hook_runs_with_process_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("hook.out");
        std::env::set_var("SPOT_HOOK_TEST_VALUE", "inherited");

        run_on_error(&format!("echo $SPOT_HOOK_TEST_VALUE > {}", out.display()))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "inherited");
    }

    #[tokio::test]
    async fn test_hook_failure_is_reported() {
        let err = run_on_error("exit 7").await.unwrap_err();
        assert!(matches!(err, SpotError::Hook { .. }));

        // never panics or returns anything
        run_on_error_logged("exit 7").await;
    }
}
