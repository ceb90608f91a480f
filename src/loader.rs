use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use strum::{AsRefStr, Display};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ContextConfig, LogicConfig},
    digest::Digest,
    error::{Error, Result},
    registry::DeploymentRegistry,
};

/// The three entry points deployed logic has to provide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum EntryPoint {
    HandleInteraction,
    HandleMessage,
    HandleHttpRequest,
}

/// Shared context handed to every invocation of deployed logic.
#[derive(Clone, Debug, Serialize)]
pub struct LogicContext {
    pub deployment: Digest,
    pub state_dir: PathBuf,
    pub chat_token: Option<String>,
    pub database_url: Option<String>,
    pub credentials_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct Invocation<'a> {
    entry_point: EntryPoint,
    context: &'a LogicContext,
    payload: &'a Value,
}

/// Resolves the active deployment's entry file, fresh for every inbound event.
pub struct Loader {
    deployments: PathBuf,
    state_dir: PathBuf,
    registry: Arc<DeploymentRegistry>,
    logic: LogicConfig,
    context: ContextConfig,
}

impl Loader {
    pub fn new(
        deployments: PathBuf,
        state_dir: PathBuf,
        registry: Arc<DeploymentRegistry>,
        logic: LogicConfig,
        context: ContextConfig,
    ) -> Self {
        Self {
            deployments,
            state_dir,
            registry,
            logic,
            context,
        }
    }

    pub async fn load_active(&self) -> Result<DeployedLogic> {
        let deployment = self
            .registry
            .current()
            .ok_or(Error::NoDeploymentAvailable)?;

        let candidate = self
            .deployments
            .join(deployment.as_str())
            .join(&self.logic.entry);

        let entry = tokio::fs::canonicalize(&candidate).await.map_err(|err| {
            Error::ModuleLoadFailure(format!("cannot resolve {}: {err}", candidate.display()))
        })?;

        debug!(%deployment, entry = %entry.display(), "Loaded active deployment");

        Ok(DeployedLogic {
            entry,
            interpreter: self.logic.interpreter.clone(),
            timeout: self.logic.timeout,
            context: LogicContext {
                deployment,
                state_dir: self.state_dir.clone(),
                chat_token: self.context.chat_token.clone(),
                database_url: self.context.database_url.clone(),
                credentials_path: self.context.credentials_path.clone(),
            },
        })
    }
}

/// Handle to one deployment's entry logic.
///
/// Every call runs the entry file as a fresh process: the invocation is written to its stdin as
/// JSON and a single JSON document is expected back on stdout. Stderr is forwarded to the log.
#[derive(Debug)]
pub struct DeployedLogic {
    entry: PathBuf,
    interpreter: Vec<String>,
    timeout: Duration,
    context: LogicContext,
}

impl DeployedLogic {
    pub fn entry(&self) -> &Path {
        &self.entry
    }

    pub fn deployment(&self) -> &Digest {
        &self.context.deployment
    }

    pub async fn handle_interaction(&self, interaction: &Value) -> Result<Value> {
        self.invoke(EntryPoint::HandleInteraction, interaction).await
    }

    pub async fn handle_message(&self, message: &Value) -> Result<Value> {
        self.invoke(EntryPoint::HandleMessage, message).await
    }

    pub async fn handle_http_request(&self, request: &Value) -> Result<Value> {
        self.invoke(EntryPoint::HandleHttpRequest, request).await
    }

    pub async fn invoke(&self, entry_point: EntryPoint, payload: &Value) -> Result<Value> {
        let started = Instant::now();
        let deployment = self.context.deployment.clone();

        let input = serde_json::to_vec(&Invocation {
            entry_point,
            context: &self.context,
            payload,
        })
        .context("Failed to encode invocation")?;

        let mut command = match self.interpreter.split_first() {
            Some((program, args)) => {
                let mut command = Command::new(program);
                command.args(args).arg(&self.entry);
                command
            }
            None => Command::new(&self.entry),
        };

        if let Some(dir) = self.entry.parent() {
            command.current_dir(dir);
        }

        command
            .env("HOTDEPLOY_DEPLOYMENT", deployment.as_str())
            .env("HOTDEPLOY_ENTRY_POINT", entry_point.as_ref())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            Error::ModuleLoadFailure(format!("cannot start {}: {err}", self.entry.display()))
        })?;

        let mut stdin = child.stdin.take().context("Child has no stdin")?;
        let writer = tokio::spawn(async move {
            match stdin.write_all(&input).await {
                // The logic is free to exit without reading its input
                Err(err) if err.kind() != ErrorKind::BrokenPipe => {
                    warn!("Error whilst writing invocation: {err:?}")
                }
                _ => {}
            }
        });

        if let Some(stderr) = child.stderr.take() {
            let deployment = deployment.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(%deployment, %entry_point, "{line}");
                }
            });
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output,
            Err(_) => {
                return Err(Error::ModuleLoadFailure(format!(
                    "{entry_point} timed out after {:?}",
                    self.timeout
                )));
            }
        };
        let _ = writer.await;

        let result = read_reply(entry_point, output)?;

        info!(
            %deployment,
            %entry_point,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Invoked deployed logic"
        );

        Ok(result)
    }
}

/// Turns a finished child into the reply of deployed logic. Empty stdout means `null`.
fn read_reply(entry_point: EntryPoint, output: std::io::Result<Output>) -> Result<Value> {
    let output = output.map_err(|err| {
        Error::ModuleLoadFailure(format!("{entry_point} could not be awaited: {err}"))
    })?;

    if !output.status.success() {
        return Err(Error::ModuleLoadFailure(format!(
            "{entry_point} exited with {}",
            output.status
        )));
    }

    if output.stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }

    serde_json::from_slice(&output.stdout).map_err(|err| {
        Error::ModuleLoadFailure(format!("{entry_point} returned invalid JSON: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;
    use test_log::test;

    use crate::{deployments::FileEntry, tests::StateFixture};

    use super::*;

    const ECHO: &str = r#"input=$(cat)
echo "invoked with $HOTDEPLOY_ENTRY_POINT" >&2
printf '%s' "$input"
"#;

    #[test(tokio::test)]
    async fn nothing_published() -> Result<()> {
        let fixture = StateFixture::new().await?;

        let err = fixture.loader.load_active().await.unwrap_err();
        assert!(matches!(err, Error::NoDeploymentAvailable));

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn resolves_inside_deployment() -> Result<()> {
        let fixture = StateFixture::new().await?;

        let deployment = fixture
            .builder
            .build(&[FileEntry::new("index.sh", ECHO)])
            .await?;

        let logic = fixture.loader.load_active().await?;

        assert_eq!(logic.deployment(), &deployment);
        let root = std::fs::canonicalize(fixture.builder.deployment_path(&deployment))?;
        assert!(logic.entry().starts_with(&root));

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn missing_entry_file() -> Result<()> {
        let fixture = StateFixture::new().await?;

        fixture
            .builder
            .build(&[FileEntry::new("not-the-entry.sh", ECHO)])
            .await?;

        let err = fixture.loader.load_active().await.unwrap_err();
        assert!(matches!(err, Error::ModuleLoadFailure(_)));

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn invocation_protocol() -> Result<()> {
        let fixture = StateFixture::new().await?;

        let deployment = fixture
            .builder
            .build(&[FileEntry::new("index.sh", ECHO)])
            .await?;

        let logic = fixture.loader.load_active().await?;
        let echoed = logic.handle_message(&json!({"content": "!ping"})).await?;

        assert_eq!(echoed["entry_point"], "handleMessage");
        assert_eq!(echoed["payload"]["content"], "!ping");
        assert_eq!(echoed["context"]["deployment"], deployment.to_string());

        let echoed = logic.handle_interaction(&json!({})).await?;
        assert_eq!(echoed["entry_point"], "handleInteraction");

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn picks_up_new_deployments() -> Result<()> {
        let fixture = StateFixture::new().await?;

        fixture
            .builder
            .build(&[FileEntry::new("index.sh", "printf '\"v1\"'")])
            .await?;
        let logic = fixture.loader.load_active().await?;
        assert_eq!(logic.handle_http_request(&json!({})).await?, json!("v1"));

        fixture
            .builder
            .build(&[FileEntry::new("index.sh", "printf '\"v2\"'")])
            .await?;

        // A handle obtained earlier keeps its deployment, a fresh load sees the new one
        assert_eq!(logic.handle_http_request(&json!({})).await?, json!("v1"));
        let logic = fixture.loader.load_active().await?;
        assert_eq!(logic.handle_http_request(&json!({})).await?, json!("v2"));

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn failing_logic() -> Result<()> {
        let fixture = StateFixture::new().await?;

        fixture
            .builder
            .build(&[FileEntry::new("index.sh", "echo boom >&2; exit 3")])
            .await?;
        let logic = fixture.loader.load_active().await?;

        let err = logic.handle_message(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ModuleLoadFailure(_)));

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn invalid_output() -> Result<()> {
        let fixture = StateFixture::new().await?;

        fixture
            .builder
            .build(&[FileEntry::new("index.sh", "echo not json")])
            .await?;
        let logic = fixture.loader.load_active().await?;

        let err = logic.handle_message(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ModuleLoadFailure(_)));

        fixture.teardown().await
    }

    #[test(tokio::test)]
    async fn timeout() -> Result<()> {
        let fixture = StateFixture::with_builder(
            crate::tests::FixtureBuilder::new().timeout(Duration::from_millis(200)),
        )
        .await?;

        fixture
            .builder
            .build(&[FileEntry::new("index.sh", "sleep 5")])
            .await?;
        let logic = fixture.loader.load_active().await?;

        let started = Instant::now();
        let err = logic.handle_message(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ModuleLoadFailure(_)));
        assert!(started.elapsed() < Duration::from_secs(5));

        fixture.teardown().await
    }

    #[test]
    fn unreadable_child() {
        let err = read_reply(
            EntryPoint::HandleMessage,
            Err(std::io::Error::other("wait failed")),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::ModuleLoadFailure(ref message) if message.contains("wait failed")
        ));
    }
}
