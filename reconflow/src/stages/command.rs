//! External-tool stages.

use super::{collect_outputs, RunnableStage, StageContext, StageDescriptor};
use crate::core::{ArtifactKey, StageOutput};
use crate::errors::{ExternalToolFailure, ReconflowError};
use crate::observability::StageTimer;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// One command-line argument, resolved against the stage context at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// A literal string.
    Lit(String),
    /// The path of an input artifact.
    Input(ArtifactKey),
    /// The path of an output artifact.
    Output(ArtifactKey),
    /// The subjects directory.
    SubjectsDir,
    /// The subject id.
    SubjectId,
}

/// A stage that launches an external program.
///
/// The program is never killed once started: recon tools leave the subject
/// directory in an unknown state when interrupted.
#[derive(Debug, Clone)]
pub struct CommandStage {
    descriptor: StageDescriptor,
    program: PathBuf,
    args: Vec<Arg>,
    env: Vec<(String, String)>,
}

impl CommandStage {
    /// Creates a new command stage.
    #[must_use]
    pub fn new(descriptor: StageDescriptor, program: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends a literal argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Lit(arg.into()));
        self
    }

    /// Appends several literal arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|a| Arg::Lit(a.into())));
        self
    }

    /// Appends the path of an input artifact.
    #[must_use]
    pub fn input(mut self, key: ArtifactKey) -> Self {
        self.args.push(Arg::Input(key));
        self
    }

    /// Appends the path of an output artifact.
    #[must_use]
    pub fn output(mut self, key: ArtifactKey) -> Self {
        self.args.push(Arg::Output(key));
        self
    }

    /// Appends the subjects directory.
    #[must_use]
    pub fn subjects_dir(mut self) -> Self {
        self.args.push(Arg::SubjectsDir);
        self
    }

    /// Appends the subject id.
    #[must_use]
    pub fn subject_id(mut self) -> Self {
        self.args.push(Arg::SubjectId);
        self
    }

    /// Sets an environment variable for the process.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns the program path.
    #[must_use]
    pub const fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Returns the unresolved argument list.
    #[must_use]
    pub fn arg_list(&self) -> &[Arg] {
        &self.args
    }

    /// Resolves the argument list against a context.
    ///
    /// # Errors
    ///
    /// Returns an error if an artifact argument has no location.
    pub fn render_args(&self, ctx: &StageContext) -> Result<Vec<OsString>, ReconflowError> {
        let name = &self.descriptor.name;
        self.args
            .iter()
            .map(|arg| -> Result<OsString, ReconflowError> {
                Ok(match arg {
                    Arg::Lit(s) => OsString::from(s),
                    Arg::Input(key) | Arg::Output(key) => ctx.resolve(name, key)?.into_os_string(),
                    Arg::SubjectsDir => ctx.subject().subjects_dir().as_os_str().to_os_string(),
                    Arg::SubjectId => OsString::from(ctx.subject().id()),
                })
            })
            .collect()
    }

    /// Renders the full command line for display.
    ///
    /// # Errors
    ///
    /// Returns an error if an artifact argument has no location.
    pub fn command_line(&self, ctx: &StageContext) -> Result<String, ReconflowError> {
        let mut line = self.program.display().to_string();
        for arg in self.render_args(ctx)? {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        Ok(line)
    }

    async fn prepare_output_dirs(&self, ctx: &StageContext) -> Result<(), ReconflowError> {
        for arg in &self.args {
            let Arg::Output(key) = arg else { continue };
            if *key == ArtifactKey::SubjectDir {
                continue;
            }
            let path = ctx.resolve(&self.descriptor.name, key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RunnableStage for CommandStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, ReconflowError> {
        let name = &self.descriptor.name;
        let subject = ctx.subject().id();
        let args = self.render_args(ctx)?;
        self.prepare_output_dirs(ctx).await?;

        debug!(stage = %name, subject = %subject, program = %self.program.display(), "launching external tool");
        let timer = StageTimer::start(name.clone());

        let output = Command::new(&self.program)
            .args(&args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("SUBJECTS_DIR", ctx.subject().subjects_dir())
            .env("OMP_NUM_THREADS", self.descriptor.resources.threads.max(1).to_string())
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|e| ExternalToolFailure::launch(name.clone(), subject, &e))?;

        if !output.status.success() {
            let diagnostics = diagnostic_tail(&output.stderr, &output.stdout);
            warn!(stage = %name, subject = %subject, code = ?output.status.code(), "external tool failed");
            return Err(ExternalToolFailure::exit(name.clone(), subject, output.status.code(), diagnostics).into());
        }

        Ok(collect_outputs(&self.descriptor, ctx)?.with_duration_ms(timer.elapsed_ms()))
    }
}

/// Returns the last lines of stderr, or of stdout when stderr is empty.
fn diagnostic_tail(stderr: &[u8], stdout: &[u8]) -> String {
    let source = if stderr.iter().all(u8::is_ascii_whitespace) { stdout } else { stderr };
    let text = String::from_utf8_lossy(source);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Hemisphere, StageStatus, SurfaceKind};
    use crate::events::NoOpEventSink;
    use crate::store::ArtifactStore;
    use std::sync::Arc;

    fn context(root: &std::path::Path) -> StageContext {
        let store = Arc::new(ArtifactStore::new(root));
        StageContext::new(store.subject("sub-01"), store, Arc::new(NoOpEventSink))
    }

    #[test]
    fn test_command_line_rendering() {
        let ctx = context(std::path::Path::new("/data/fs"));
        let surf = ArtifactKey::Surface(Hemisphere::Left, SurfaceKind::Pial);
        let stage = CommandStage::new(
            StageDescriptor::new("gifti_lh_pial")
                .with_input(ArtifactKey::ReconSurface(Hemisphere::Left, SurfaceKind::Pial))
                .with_output(surf.clone()),
            "mris_convert",
        )
        .input(ArtifactKey::ReconSurface(Hemisphere::Left, SurfaceKind::Pial))
        .output(surf);

        assert_eq!(
            stage.command_line(&ctx).unwrap(),
            "mris_convert /data/fs/sub-01/surf/lh.pial /data/fs/sub-01/surf/lh.pial.surf.gii"
        );
    }

    #[test]
    fn test_unresolvable_input_is_unsatisfied() {
        let ctx = context(std::path::Path::new("/data/fs"));
        let stage = CommandStage::new(StageDescriptor::new("autorecon1"), "recon-all").input(ArtifactKey::T1w);

        let err = stage.render_args(&ctx).unwrap_err();
        assert!(matches!(err, ReconflowError::UnsatisfiedInput(_)));
    }

    #[test]
    fn test_diagnostic_tail() {
        let stderr: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let tail = diagnostic_tail(stderr.as_bytes(), b"");
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
        assert_eq!(diagnostic_tail(b"  \n", b"only stdout"), "only stdout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_success_and_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let ribbon = ArtifactKey::custom("mri/ribbon.mgz");

        let touch = CommandStage::new(StageDescriptor::new("cortribbon").with_output(ribbon.clone()), "touch")
            .output(ribbon.clone());
        let output = touch.execute(&ctx).await.unwrap();
        assert_eq!(output.status, StageStatus::Ok);
        assert!(output.artifact(&ribbon).unwrap().exists());

        let liar = CommandStage::new(
            StageDescriptor::new("liar").with_output(ArtifactKey::custom("mri/never.mgz")),
            "true",
        );
        let err = liar.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, ReconflowError::ExternalTool(ref f) if f.artifact.is_some()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let stage = CommandStage::new(StageDescriptor::new("autorecon2_vol"), "sh")
            .args(["-c", "echo 'ERROR: mri_ca_label failed' >&2; exit 3"]);

        match stage.execute(&ctx).await.unwrap_err() {
            ReconflowError::ExternalTool(failure) => {
                assert_eq!(failure.exit_code, Some(3));
                assert_eq!(failure.subject, "sub-01");
                assert!(failure.diagnostics.contains("mri_ca_label"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let stage = CommandStage::new(StageDescriptor::new("fastsurfer"), "/nonexistent/run_fastsurfer.sh");

        let err = stage.execute(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("could not launch"));
    }
}
