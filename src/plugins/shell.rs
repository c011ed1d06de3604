//! CR-023: `shell` plugin. Runs a script through `bash` to initialize or configure.
//!
//! Action kwargs: `script` (required), `env` (optional string map).
//! The script is piped to stdin rather than passed as an argument, avoiding
//! argument length limits. Exit code 0 is success.

use super::{Configurer, Driver, Initializer, Outcome, PluginModule};
use crate::core::error::PluginError;
use crate::core::types::Kwargs;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

const NAME: &str = "shell";

/// Output from running a script.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn into_outcome(self) -> Outcome {
        let response = json!({
            "exit_code": self.exit_code,
            "stdout": self.stdout,
            "stderr": self.stderr,
        });
        if self.exit_code == 0 {
            Outcome::ok(response)
        } else {
            Outcome::failed(response)
        }
    }
}

/// Execute a shell script locally via `bash`.
/// Uses bash (not sh/dash) so scripts may rely on `set -o pipefail`.
pub fn exec_local(script: &str, env: &[(String, String)]) -> Result<ExecOutput, String> {
    let mut child = Command::new("bash")
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn bash: {}", e))?;

    if let Some(ref mut stdin) = child.stdin {
        stdin
            .write_all(script.as_bytes())
            .map_err(|e| format!("stdin write error: {}", e))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("wait error: {}", e))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// The `shell` plugin module.
pub struct ShellPlugin;

impl PluginModule for ShellPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn initializer(&self) -> Option<Arc<dyn Initializer>> {
        Some(Arc::new(ShellRunner))
    }

    fn configurer(&self) -> Option<Arc<dyn Configurer>> {
        Some(Arc::new(ShellRunner))
    }

    fn default_config(&self) -> Value {
        json!({"interpreter": "bash"})
    }
}

fn client(driver: &str, args: &[Value], kwargs: &Kwargs) -> Result<Driver, PluginError> {
    match driver {
        "default" | "bash" => Ok(Driver::new(NAME, driver, args, kwargs)),
        other => Err(PluginError::Client {
            plugin: NAME.to_string(),
            driver: other.to_string(),
            reason: "only the bash driver is supported".to_string(),
        }),
    }
}

fn env_pairs(kwargs: &Kwargs) -> Vec<(String, String)> {
    kwargs
        .get("env")
        .and_then(Value::as_object)
        .map(|env| {
            env.iter()
                .map(|(k, v)| {
                    let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn run(kwargs: &Kwargs) -> Result<Outcome, PluginError> {
    let Some(script) = kwargs.get("script").and_then(Value::as_str) else {
        return Ok(Outcome::failed(json!({"error": "missing 'script' kwarg"})));
    };
    let script = script.to_string();
    let env = env_pairs(kwargs);
    let joined = tokio::task::spawn_blocking(move || exec_local(&script, &env)).await;
    Ok(match joined {
        Ok(Ok(output)) => output.into_outcome(),
        Ok(Err(error)) => Outcome::failed(json!({"error": error})),
        Err(e) => Outcome::failed(json!({"error": format!("runner panicked: {}", e)})),
    })
}

/// Runs the `script` kwarg; serves as both initializer and configurer.
pub struct ShellRunner;

#[async_trait]
impl Initializer for ShellRunner {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError> {
        client(driver, args, kwargs)
    }

    async fn create(
        &self,
        _driver: &Driver,
        _args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError> {
        run(kwargs).await
    }
}

#[async_trait]
impl Configurer for ShellRunner {
    async fn new_client(
        &self,
        driver: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Driver, PluginError> {
        client(driver, args, kwargs)
    }

    async fn create(
        &self,
        _driver: &Driver,
        _args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<Outcome, PluginError> {
        run(kwargs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(s: &str) -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("script".into(), json!(s));
        kwargs
    }

    #[test]
    fn test_cr023_local_echo() {
        let out = exec_local("echo hello", &[]).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_cr023_local_failure() {
        let out = exec_local("exit 42", &[]).unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn test_cr023_local_pipefail() {
        let out = exec_local("set -euo pipefail\nfalse | true", &[]).unwrap();
        assert!(!out.success(), "pipefail should catch false in pipeline");
    }

    #[test]
    fn test_cr023_env_passed() {
        let env = vec![("CORRAL_TEST_VALUE".to_string(), "42".to_string())];
        let out = exec_local("echo $CORRAL_TEST_VALUE", &env).unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }

    #[test]
    fn test_cr023_env_pairs_stringify() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("env".into(), json!({"A": "x", "B": 2}));
        let pairs = env_pairs(&kwargs);
        assert_eq!(
            pairs,
            vec![("A".to_string(), "x".to_string()), ("B".to_string(), "2".to_string())]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cr023_configurer_success_and_failure() {
        let runner = ShellRunner;
        let driver = Configurer::new_client(&runner, "bash", &[], &Kwargs::new())
            .await
            .unwrap();

        let ok = Configurer::create(&runner, &driver, &[], &script("echo configured"))
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.response["stdout"], "configured\n");

        let bad = Configurer::create(&runner, &driver, &[], &script("echo nope >&2; exit 3"))
            .await
            .unwrap();
        assert!(!bad.success);
        assert_eq!(bad.response["exit_code"], 3);
        assert_eq!(bad.response["stderr"], "nope\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cr023_missing_script_fails() {
        let runner = ShellRunner;
        let driver = Initializer::new_client(&runner, "default", &[], &Kwargs::new())
            .await
            .unwrap();
        let out = Initializer::create(&runner, &driver, &[], &Kwargs::new())
            .await
            .unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_cr023_unsupported_driver() {
        let err = Configurer::new_client(&ShellRunner, "powershell", &[], &Kwargs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Client { .. }));
    }
}
