//! Workflow manifest
//!
//! A TOML document declaring the models, phases and script actors of one
//! workflow:
//!
//! ```toml
//! workflow = "in-place-upgrade"
//!
//! [[models]]
//! name = "KernelInfo"
//! fields = [{ name = "version", kind = "string" }]
//!
//! [[phases]]
//! name = "facts"
//! stage = "pre"
//!
//! [[actors]]
//! name = "scan_kernel"
//! phase = "facts"
//! produces = ["KernelInfo"]
//! command = "actors/scan_kernel.sh"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::WrapErr;
use serde::Deserialize;
use uplift_core::{ActorDescriptor, ActorRegistry, ModelRegistry, ModelSchema, Phase, Workflow};

use crate::script::{ScriptActor, ScriptQuestion};

/// Exit code a script uses to report that it had nothing to do
pub const DEFAULT_SKIP_EXIT_CODE: i32 = 100;

/// Exit code a script uses to abort the whole run
pub const DEFAULT_FATAL_EXIT_CODE: i32 = 101;

/// Parsed manifest
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Workflow name
    pub workflow: String,
    /// Model schemas; `Report` is built in
    #[serde(default)]
    pub models: Vec<ModelSchema>,
    /// Phases in execution order
    pub phases: Vec<Phase>,
    /// Script actors
    #[serde(default)]
    pub actors: Vec<ActorSpec>,
    /// Directory relative commands are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// One script actor
#[derive(Debug, Clone, Deserialize)]
pub struct ActorSpec {
    pub name: String,
    pub phase: String,
    /// Defaults to the manifest's workflow
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub consumes: Vec<String>,
    /// Consumed models that must have a message before the actor runs
    #[serde(default)]
    pub mandatory: Vec<String>,
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub required: bool,
    /// Shell command line
    pub command: String,
    /// Questions whose answers the script reads from its environment
    #[serde(default)]
    pub questions: Vec<ScriptQuestion>,
    #[serde(default = "default_skip_exit_code")]
    pub skip_exit_code: i32,
    #[serde(default = "default_fatal_exit_code")]
    pub fatal_exit_code: i32,
}

fn default_skip_exit_code() -> i32 {
    DEFAULT_SKIP_EXIT_CODE
}

fn default_fatal_exit_code() -> i32 {
    DEFAULT_FATAL_EXIT_CODE
}

/// Everything the scheduler needs from a manifest
pub struct Loaded {
    pub workflow: Workflow,
    pub models: ModelRegistry,
    pub actors: ActorRegistry,
}

impl Manifest {
    /// Load a manifest file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read manifest {}", path.display()))?;
        let mut manifest = Self::parse(&content)
            .wrap_err_with(|| format!("failed to parse manifest {}", path.display()))?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(manifest)
    }

    /// Parse a manifest document
    ///
    /// # Errors
    /// Returns error if the document is not a valid manifest
    pub fn parse(content: &str) -> eyre::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Build the registries and workflow
    ///
    /// # Errors
    /// Returns error on duplicate models or actors and malformed actor tags
    pub fn into_loaded(self) -> eyre::Result<Loaded> {
        let mut models = ModelRegistry::with_builtins();
        for schema in self.models {
            models.register(schema)?;
        }

        let working_dir = (!self.base_dir.as_os_str().is_empty()).then(|| self.base_dir.clone());

        let mut actors = ActorRegistry::new();
        for spec in self.actors {
            let descriptor = spec
                .into_descriptor(&self.workflow, working_dir.clone())
                .wrap_err("invalid actor declaration")?;
            actors.register(descriptor)?;
        }

        let mut workflow = Workflow::new(self.workflow);
        for phase in self.phases {
            workflow = workflow.with_phase(phase);
        }

        tracing::debug!(
            workflow = %workflow.name,
            phases = workflow.phases.len(),
            models = models.len(),
            actors = actors.len(),
            "manifest loaded"
        );

        Ok(Loaded {
            workflow,
            models,
            actors,
        })
    }
}

impl ActorSpec {
    fn into_descriptor(
        self,
        default_workflow: &str,
        working_dir: Option<PathBuf>,
    ) -> eyre::Result<ActorDescriptor> {
        let mut builder = ActorDescriptor::builder(self.name.clone())
            .phase(self.phase)
            .workflow(self.workflow.unwrap_or_else(|| default_workflow.to_string()));

        for model in self.consumes {
            builder = builder.consumes(model);
        }
        for model in self.mandatory {
            builder = builder.consumes_mandatory(model);
        }
        for model in &self.produces {
            builder = builder.produces(model.clone());
        }
        for capability in self.capabilities {
            builder = builder.capability(capability);
        }
        if self.required {
            builder = builder.required();
        }

        let script = ScriptActor {
            command: self.command,
            working_dir,
            questions: self.questions,
            skip_exit_code: self.skip_exit_code,
            fatal_exit_code: self.fatal_exit_code,
        };

        Ok(builder.build(Arc::new(script))?)
    }
}

#[cfg(test)]
mod tests {
    use uplift_core::{RebootBoundary, validate};

    use super::*;

    const MANIFEST: &str = r#"
        workflow = "ipu"

        [[models]]
        name = "KernelInfo"
        fields = [{ name = "version", kind = "string" }]

        [[phases]]
        name = "facts"
        stage = "pre"

        [[phases]]
        name = "checks"
        stage = "pre"
        checkpoint = true
        reboot = "new-stage"

        [[phases]]
        name = "finalize"
        stage = "post"

        [[actors]]
        name = "scan_kernel"
        phase = "facts"
        produces = ["KernelInfo"]
        command = "echo"

        [[actors]]
        name = "check_kernel"
        phase = "checks"
        mandatory = ["KernelInfo"]
        produces = ["Report"]
        required = true
        command = "actors/check_kernel.sh"
        questions = [{ id = "allow_old_kernel", prompt = "Continue with an old kernel?" }]
    "#;

    #[test]
    fn test_manifest_builds_a_valid_workflow() {
        let loaded = Manifest::parse(MANIFEST).unwrap().into_loaded().unwrap();

        assert_eq!(loaded.workflow.name, "ipu");
        assert_eq!(
            loaded.workflow.phases[1].reboot,
            Some(RebootBoundary::NewStage)
        );
        assert!(loaded.models.contains("KernelInfo"));
        assert!(loaded.models.contains("Report"));

        let check = loaded.actors.get("check_kernel").unwrap();
        assert!(check.required);
        assert!(check.mandatory.contains("KernelInfo"));
        assert_eq!(check.workflow(), "ipu");

        let validated = validate(&loaded.workflow, &loaded.actors, &loaded.models).unwrap();
        assert_eq!(validated.actor_count(), 2);
    }

    #[test]
    fn test_duplicate_actor_rejected() {
        let content = format!(
            "{MANIFEST}\n[[actors]]\nname = \"scan_kernel\"\nphase = \"facts\"\ncommand = \"true\"\n"
        );
        let err = Manifest::parse(&content)
            .unwrap()
            .into_loaded()
            .err()
            .unwrap();
        assert!(err.to_string().contains("scan_kernel"));
    }

    #[test]
    fn test_demo_manifest_validates() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/workflow.toml");
        let manifest = Manifest::load(&path).unwrap();
        assert!(manifest.base_dir.ends_with("demos"));

        let loaded = manifest.into_loaded().unwrap();
        let validated = validate(&loaded.workflow, &loaded.actors, &loaded.models).unwrap();
        assert_eq!(validated.phases.len(), 4);
    }

    #[tokio::test]
    async fn test_script_workflow_runs_to_completion_and_halts() {
        use kameo::actor::Spawn;
        use uplift_core::{
            FileStateStore, ResumeManager, RunOptions, RunStatus, RunWorkflow, SchedulerActor,
            SchedulerActorArgs,
        };

        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("workflow.toml");
        std::fs::write(
            &manifest_path,
            r#"
            workflow = "ipu"

            [[models]]
            name = "KernelInfo"
            fields = [{ name = "version", kind = "string" }]

            [[phases]]
            name = "facts"
            stage = "pre"

            [[phases]]
            name = "checks"
            stage = "pre"
            checkpoint = true

            [[phases]]
            name = "finalize"
            stage = "pre"

            [[actors]]
            name = "scan"
            phase = "facts"
            produces = ["KernelInfo"]
            command = "echo '{\"model\": \"KernelInfo\", \"payload\": {\"version\": \"3.10\"}}'"

            [[actors]]
            name = "check"
            phase = "checks"
            mandatory = ["KernelInfo"]
            produces = ["Report"]
            command = "if [ \"$UPLIFT_STRICT\" = true ] && grep -q '3.10'; then echo '{\"model\": \"Report\", \"payload\": {\"severity\": \"high\", \"title\": \"old kernel\", \"summary\": \"3.10\", \"flags\": [\"inhibitor\"]}}'; fi"

            [[actors]]
            name = "finish"
            phase = "finalize"
            command = "pwd > finished"
            "#,
        )
        .unwrap();

        let run = |strict: bool| {
            let manifest_path = manifest_path.clone();
            let state_dir = dir.path().join("state");
            async move {
                let loaded = Manifest::load(&manifest_path)
                    .unwrap()
                    .into_loaded()
                    .unwrap();
                let mut bag = uplift_core::ConfigBag::new();
                bag.insert("strict", uplift_core::ConfigValue::Bool(strict));
                let args = SchedulerActorArgs::new(loaded.workflow, loaded.actors, loaded.models)
                    .with_resume(ResumeManager::new(Arc::new(FileStateStore::new(state_dir))))
                    .with_config_bag(bag);
                let scheduler = SchedulerActor::spawn(args);
                scheduler
                    .ask(RunWorkflow {
                        options: RunOptions::default(),
                    })
                    .await
                    .unwrap()
            }
        };

        let report = run(false).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert!(dir.path().join("finished").exists());
        std::fs::remove_file(dir.path().join("finished")).unwrap();

        let report = run(true).await;
        let RunStatus::Halted { inhibitors } = &report.status else {
            panic!("expected halt, got {}", report.status);
        };
        assert_eq!(inhibitors[0].title, "old kernel");
        assert!(!report.ran("finish"));
        assert!(!dir.path().join("finished").exists());
    }

    #[test]
    fn test_missing_command_is_a_parse_error() {
        let content = r#"
            workflow = "ipu"
            phases = []

            [[actors]]
            name = "a"
            phase = "facts"
        "#;
        assert!(Manifest::parse(content).is_err());
    }
}
