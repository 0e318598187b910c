//! Resource status reporting around the script
//!
//! After a successful script run, tracks the resources named in the
//! deployment's manifests until they settle and publishes each one's final
//! document as an output variable. A verdict other than success fails the
//! step.

use std::sync::Arc;

use tracing::info;

use rudder_common::command::CommandRunner;
use rudder_common::variables::names;
use rudder_common::Error;
use rudder_status::manifest::{identifiers_from_files, split_manifest_paths};
use rudder_status::{
    KubectlGet, ResourceRetriever, ResourceStatusChecker, ResourceUpdateReporter,
    StatusCheckConfig, StatusEventContext,
};

use crate::context::kubectl_executable;
use crate::pipeline::DeploymentContext;
use crate::script::{CommandResult, ScriptEnvironment};
use crate::stage::Next;

/// Exit code given to a step whose resources did not deploy
pub const STATUS_CHECK_FAILED_EXIT_CODE: i32 = 1;

/// Output variable holding a tracked resource's last document
pub fn output_variable_name(resource_name: &str) -> String {
    format!("CustomResources({})", resource_name)
}

/// Runs the resource status checker after the script.
pub struct StatusReportingStage {
    runner: Arc<dyn CommandRunner>,
}

impl StatusReportingStage {
    /// Stage querying the cluster through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Enabled by `Octopus.Action.Kubernetes.ResourceStatusCheck=True`
    pub fn is_enabled(&self, ctx: &DeploymentContext) -> bool {
        ctx.variables
            .get_flag(names::RESOURCE_STATUS_CHECK, false)
            .unwrap_or(false)
    }

    /// Run `next`, then check the deployed resources
    pub async fn wrap(
        &self,
        ctx: &DeploymentContext,
        env: ScriptEnvironment,
        next: Next<'_>,
    ) -> Result<CommandResult, Error> {
        let script_env = env.to_vec();
        let result = next.run(env).await?;
        if !result.is_success() {
            ctx.log.verbose(&format!(
                "Skipping the resource status check because the script exited with code {}",
                result.exit_code
            ));
            return Ok(result);
        }

        let config = StatusCheckConfig::from_variables(&ctx.variables)?;
        let paths = ctx
            .variables
            .get(names::CUSTOM_RESOURCE_YAML_FILE_NAME)
            .map(split_manifest_paths)
            .unwrap_or_default();
        let identifiers = identifiers_from_files(&ctx.working_dir, &paths, ctx.namespace())?;

        let query = KubectlGet::new(
            self.runner.clone(),
            kubectl_executable(&ctx.variables, &ctx.working_dir)?,
        )
        .with_env(script_env)
        .with_working_dir(ctx.working_dir.clone());
        let reporter = ResourceUpdateReporter::new(
            StatusEventContext::from_variables(&ctx.variables),
            ctx.log.as_ref(),
        );
        let checker = ResourceStatusChecker::new(
            ResourceRetriever::new(Arc::new(query)),
            reporter,
            ctx.log.as_ref(),
            config,
        );

        let report = checker.check(identifiers.clone()).await;
        for id in &identifiers {
            if let Some(state) = report.last_state(id) {
                ctx.log
                    .set_output_variable(&output_variable_name(&id.name), &state.raw.to_string());
            }
        }

        info!(outcome = ?report.outcome, checks = report.check_count, "Resource status check finished");
        if report.outcome.is_success() {
            Ok(result)
        } else {
            Ok(CommandResult::new(STATUS_CHECK_FAILED_EXIT_CODE))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::MockScriptExecutor;
    use crate::stage::WrapperStage;
    use crate::Pipeline;
    use rudder_common::command::{CommandOutput, StubRunner};
    use rudder_common::log::{InMemoryLog, LogLevel};
    use rudder_status::checker::{FAILED_SUMMARY, SUCCESS_SUMMARY};
    use serde_json::json;

    const CONFIG_MAP: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
"#;

    fn pipeline(stub: Arc<StubRunner>, exit_code: i32) -> Pipeline {
        let mut executor = MockScriptExecutor::new();
        executor
            .expect_execute()
            .times(1)
            .returning(move |_, _| Ok(CommandResult::new(exit_code)));
        Pipeline::new(Arc::new(executor))
            .with_stage(WrapperStage::StatusReporting(StatusReportingStage::new(stub)))
    }

    fn context(dir: &tempfile::TempDir, log: Arc<InMemoryLog>) -> DeploymentContext {
        std::fs::write(dir.path().join("manifest.yaml"), CONFIG_MAP).unwrap();
        DeploymentContext::new(
            [
                (names::RESOURCE_STATUS_CHECK, "True"),
                (names::CUSTOM_RESOURCE_YAML_FILE_NAME, "manifest.yaml"),
                (names::NAMESPACE, "web"),
            ]
            .into_iter()
            .collect(),
            dir.path(),
            log,
        )
    }

    fn config_map() -> CommandOutput {
        CommandOutput::ok(
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "settings", "namespace": "web", "uid": "cm-1"},
                "data": {"mode": "blue"}
            })
            .to_string(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failed_script_skips_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemoryLog::new());
        let stub = Arc::new(StubRunner::new());

        let result = pipeline(stub.clone(), 2)
            .execute(&context(&dir, log.clone()))
            .await
            .unwrap();

        assert_eq!(result, CommandResult::new(2));
        assert!(stub.calls().is_empty());
        assert!(log.contains("script exited with code 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_resources_publish_output_variables() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemoryLog::new());
        let stub = Arc::new(StubRunner::new());
        stub.on("kubectl", &["get", "ConfigMap", "settings"], config_map());

        let result = pipeline(stub.clone(), 0)
            .execute(&context(&dir, log.clone()))
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(log.messages_at(LogLevel::Info).last().map(String::as_str), Some(SUCCESS_SUMMARY));

        let outputs = log.service_messages_named("setVariable");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].get("name"), Some("CustomResources(settings)"));
        let value: serde_json::Value = serde_json::from_str(outputs[0].get("value").unwrap()).unwrap();
        assert_eq!(value["data"]["mode"], "blue");

        let get = &stub.calls_matching("kubectl", &["get", "ConfigMap"])[0];
        assert_eq!(get.flag_value("-n"), Some("web"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verdict_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemoryLog::new());
        let stub = Arc::new(StubRunner::new());
        // never found: absent past the stabilization timeout
        stub.on("kubectl", &["get", "ConfigMap", "settings"], CommandOutput::ok(""));

        let result = pipeline(stub, 0)
            .execute(&context(&dir, log.clone()))
            .await
            .unwrap();

        assert_eq!(result, CommandResult::new(STATUS_CHECK_FAILED_EXIT_CODE));
        assert_eq!(log.messages_at(LogLevel::Error), vec![FAILED_SUMMARY.to_string()]);
        assert!(log.service_messages_named("setVariable").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemoryLog::new());
        let mut ctx = context(&dir, log);
        ctx.variables
            .set(names::CUSTOM_RESOURCE_YAML_FILE_NAME, "manifest.yaml;missing.yaml");

        let err = pipeline(Arc::new(StubRunner::new()), 0)
            .execute(&ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }
}
