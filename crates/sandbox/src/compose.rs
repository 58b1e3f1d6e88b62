//! Builds the self-contained shell script that runs inside the sandbox.
//!
//! The script is assembled as an ordered list of typed [`Stage`]s and only
//! rendered to text at the end, so the install → mount → user code → unmount
//! ordering can be checked on the stage list itself.

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    shell_words::quote,
};

use crate::{
    error::{Error, Result},
    identity::{IdentityPolicy, UID_VAR},
    mount::{self, MountPlan},
    request::{ExecutionRequest, PrivilegeMode},
};

/// Shell variable carrying the user script's exit code.
const EXIT_VAR: &str = "mountbox_exit";
const HEREDOC_BASE: &str = "MOUNTBOX_USER_SCRIPT";
/// Exit code reported when the unprivileged identity could not be created.
pub const IDENTITY_FAILURE_EXIT: i64 = 126;
/// Where the container entrypoint writes the decoded script.
pub const ENTRY_SCRIPT_PATH: &str = "/tmp/mountbox-entry.sh";

/// Fixed policy the composer applies to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerPolicy {
    pub working_dir: String,
    /// File the user script is written to before it runs.
    pub script_path: String,
    pub identity: IdentityPolicy,
}

impl Default for ComposerPolicy {
    fn default() -> Self {
        Self {
            working_dir: "/workspace".into(),
            script_path: "/tmp/mountbox-user.sh".into(),
            identity: IdentityPolicy::default(),
        }
    }
}

/// Who the user script runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecContext {
    Root,
    Unprivileged { user: String },
}

/// One step of the composed script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Disable fail-fast so later stages always run.
    Preamble,
    Install { fragment: String },
    PrepareMountPoint { path: String },
    Mount { fragment: String, source: String, path: String },
    CreateIdentity { policy: IdentityPolicy, working_dir: String },
    UserExec {
        script: String,
        context: ExecContext,
        working_dir: String,
        script_path: String,
    },
    Unmount { fragment: String },
    PropagateExit,
}

/// Discriminant of a [`Stage`], for ordering checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Preamble,
    Install,
    PrepareMountPoint,
    Mount,
    CreateIdentity,
    UserExec,
    Unmount,
    PropagateExit,
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Preamble => StageKind::Preamble,
            Self::Install { .. } => StageKind::Install,
            Self::PrepareMountPoint { .. } => StageKind::PrepareMountPoint,
            Self::Mount { .. } => StageKind::Mount,
            Self::CreateIdentity { .. } => StageKind::CreateIdentity,
            Self::UserExec { .. } => StageKind::UserExec,
            Self::Unmount { .. } => StageKind::Unmount,
            Self::PropagateExit => StageKind::PropagateExit,
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Preamble => "set +e".to_string(),
            Self::Install { fragment } => fragment.clone(),
            Self::PrepareMountPoint { path } => {
                format!("mkdir -p {} 2>/dev/null || true", quote(path))
            },
            Self::Mount {
                fragment,
                source,
                path,
            } => {
                let warning = format!(
                    "mountbox: warning: mounting {source} at {path} failed; continuing without it"
                );
                format!("if ! {fragment}; then\n    echo {} >&2\nfi", quote(&warning))
            },
            Self::CreateIdentity {
                policy,
                working_dir,
            } => policy.render_create(working_dir),
            Self::UserExec {
                script,
                context,
                working_dir,
                script_path,
            } => render_user_exec(script, context, working_dir, script_path),
            Self::Unmount { fragment } => fragment.clone(),
            Self::PropagateExit => format!("exit \"${EXIT_VAR}\""),
        }
    }
}

fn render_user_exec(
    script: &str,
    context: &ExecContext,
    working_dir: &str,
    script_path: &str,
) -> String {
    let delimiter = heredoc_delimiter(script);
    let path = quote(script_path);
    let mut body = script.to_string();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let run = format!(
        "cd {dir} || exit 1; if command -v bash >/dev/null 2>&1; then exec bash {path}; else exec sh {path}; fi",
        dir = quote(working_dir),
    );

    let invoke = match context {
        ExecContext::Root => format!("(\n    {run}\n)\n{EXIT_VAR}=$?"),
        ExecContext::Unprivileged { user } => {
            let refusal = format!(
                "mountbox: error: could not create unprivileged user {user}; refusing to run the script as root"
            );
            format!(
                "if [ -n \"${UID_VAR}\" ]; then\n    su -s /bin/sh {user} -c {cmd}\n    {EXIT_VAR}=$?\nelse\n    echo {refusal} >&2\n    {EXIT_VAR}={IDENTITY_FAILURE_EXIT}\nfi",
                user = quote(user),
                cmd = quote(&run),
                refusal = quote(&refusal),
            )
        },
    };

    format!(
        "cat > {path} <<'{delimiter}'\n{body}{delimiter}\nchmod 0755 {path}\n{invoke}\nrm -f {path}"
    )
}

/// A heredoc terminator that no line of `script` equals.
fn heredoc_delimiter(script: &str) -> String {
    let collides = |candidate: &str| script.lines().any(|line| line == candidate);
    let mut candidate = HEREDOC_BASE.to_string();
    let mut n = 0u32;
    while collides(&candidate) {
        n += 1;
        candidate = format!("{HEREDOC_BASE}_{n}");
    }
    candidate
}

/// Remove one leading `#!` interpreter line.
pub fn strip_shebang(script: &str) -> &str {
    if !script.starts_with("#!") {
        return script;
    }
    match script.find('\n') {
        Some(end) => &script[end + 1..],
        None => "",
    }
}

/// The rendered script and the stages it was rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedScript {
    stages: Vec<Stage>,
    text: String,
}

impl ComposedScript {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(Stage::kind).collect()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Standard base64 of the text, safe to pass as a process argument.
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.text.as_bytes())
    }

    /// `sh -c` command that decodes and runs the script inside the container.
    pub fn entry_command(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "printf '%s' '{}' | base64 -d > {ENTRY_SCRIPT_PATH} && exec sh {ENTRY_SCRIPT_PATH}",
                self.encoded()
            ),
        ]
    }
}

/// Reverse of [`ComposedScript::encoded`].
pub fn decode_script(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidRequest(format!("script is not valid base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| Error::InvalidRequest(format!("script is not valid UTF-8: {e}")))
}

/// Turns requests into [`ComposedScript`]s. Pure: equal inputs give equal text.
#[derive(Debug, Clone, Default)]
pub struct ScriptComposer {
    policy: ComposerPolicy,
}

impl ScriptComposer {
    pub fn new(policy: ComposerPolicy) -> Self {
        Self { policy }
    }

    pub fn compose(&self, request: &ExecutionRequest) -> ComposedScript {
        let plan = request.mount().map(|spec| (mount::plan(spec), spec.source.clone()));
        let stages = self.stages(request, plan);
        let text = stages
            .iter()
            .map(Stage::render)
            .collect::<Vec<_>>()
            .join("\n\n");
        ComposedScript {
            stages,
            text: format!("{text}\n"),
        }
    }

    fn stages(&self, request: &ExecutionRequest, plan: Option<(MountPlan, String)>) -> Vec<Stage> {
        let mut stages = vec![Stage::Preamble];

        let unmount = plan.map(|(plan, source)| {
            stages.push(Stage::Install {
                fragment: plan.install,
            });
            stages.push(Stage::PrepareMountPoint {
                path: plan.mount_point.clone(),
            });
            stages.push(Stage::Mount {
                fragment: plan.mount,
                source: source.trim().to_string(),
                path: plan.mount_point,
            });
            Stage::Unmount {
                fragment: plan.unmount,
            }
        });

        let context = match request.privilege_mode() {
            PrivilegeMode::DropPrivileges => {
                stages.push(Stage::CreateIdentity {
                    policy: self.policy.identity.clone(),
                    working_dir: self.policy.working_dir.clone(),
                });
                ExecContext::Unprivileged {
                    user: self.policy.identity.name.clone(),
                }
            },
            PrivilegeMode::RunAsRoot => ExecContext::Root,
        };

        stages.push(Stage::UserExec {
            script: strip_shebang(request.script()).to_string(),
            context,
            working_dir: self.policy.working_dir.clone(),
            script_path: self.policy.script_path.clone(),
        });
        stages.extend(unmount);
        stages.push(Stage::PropagateExit);
        stages
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::request::{Credentials, MountKind, MountSpec},
        rstest::rstest,
    };

    fn request(script: &str, mount: Option<MountSpec>, mode: PrivilegeMode) -> ExecutionRequest {
        ExecutionRequest::builder(script)
            .mount(mount)
            .image("ubuntu:latest")
            .timeout_secs(30)
            .privilege_mode(mode)
            .build()
            .unwrap()
    }

    fn position(text: &str, needle: &str) -> usize {
        text.find(needle)
            .unwrap_or_else(|| panic!("missing {needle:?} in:\n{text}"))
    }

    #[rstest]
    #[case(MountKind::Nfs, "nas:/export")]
    #[case(MountKind::Cifs, "//fs/share")]
    fn mounted_stages_are_ordered(#[case] kind: MountKind, #[case] source: &str) {
        let composer = ScriptComposer::default();
        let script = composer.compose(&request(
            "echo start\nexit 3\n",
            Some(MountSpec::new(kind, source)),
            PrivilegeMode::DropPrivileges,
        ));
        assert_eq!(script.stage_kinds(), vec![
            StageKind::Preamble,
            StageKind::Install,
            StageKind::PrepareMountPoint,
            StageKind::Mount,
            StageKind::CreateIdentity,
            StageKind::UserExec,
            StageKind::Unmount,
            StageKind::PropagateExit,
        ]);

        let text = script.text();
        let install = position(text, "command -v mount.");
        let mount = position(text, &format!("mount -t {}", kind.fs_type()));
        let user = position(text, "echo start\nexit 3\n");
        let unmount = position(text, "umount /mnt/network");
        let exit = position(text, "exit \"$mountbox_exit\"");
        assert!(install < mount && mount < user && user < unmount && unmount < exit);
    }

    #[test]
    fn no_mount_means_no_mount_stages() {
        let script =
            ScriptComposer::default().compose(&request("echo hi", None, PrivilegeMode::RunAsRoot));
        assert_eq!(script.stage_kinds(), vec![
            StageKind::Preamble,
            StageKind::UserExec,
            StageKind::PropagateExit,
        ]);
        assert!(!script.text().contains("mount -t"));
        assert!(!script.text().contains("umount"));
        assert!(script.text().starts_with("set +e\n"));
    }

    #[test]
    fn mount_failure_is_reported_not_fatal() {
        let script = ScriptComposer::default().compose(&request(
            "echo still-ran",
            Some(MountSpec::new(MountKind::Nfs, "bad:/nope")),
            PrivilegeMode::DropPrivileges,
        ));
        let text = script.text();
        assert!(text.contains("if ! mount -t nfs"));
        assert!(text.contains("mounting bad:/nope at /mnt/network failed; continuing without it"));
        assert!(!text.contains("set -e\n"));
    }

    #[rstest]
    #[case("#!/bin/bash\necho hi\n", "echo hi\n")]
    #[case("#!/bin/bash\n#!/bin/sh\necho hi\n", "#!/bin/sh\necho hi\n")]
    #[case("echo hi\n#!/bin/bash\n", "echo hi\n#!/bin/bash\n")]
    #[case("#!/usr/bin/env sh", "")]
    #[case(" #!/bin/sh\n", " #!/bin/sh\n")]
    fn shebang_stripped_exactly_once(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_shebang(input), expected);
    }

    #[test]
    fn embedded_script_has_shebang_removed_once() {
        let script = ScriptComposer::default().compose(&request(
            "#!/bin/bash\n#!/bin/bash\necho hi\n",
            None,
            PrivilegeMode::RunAsRoot,
        ));
        assert_eq!(script.text().matches("#!/bin/bash").count(), 1);
        let Stage::UserExec { script: body, .. } = &script.stages()[1] else {
            panic!("expected user exec stage");
        };
        assert_eq!(body, "#!/bin/bash\necho hi\n");
    }

    #[test]
    fn dropped_identity_gets_no_elevated_grants() {
        let script = ScriptComposer::default().compose(&request(
            "id",
            Some(MountSpec::new(MountKind::Cifs, "//fs/share").with_credentials(
                Credentials::new("svc", "pw"),
            )),
            PrivilegeMode::DropPrivileges,
        ));
        let text = script.text();
        assert!(text.contains("su -s /bin/sh mountbox -c"));
        for forbidden in ["sudo", "sudoers", "NOPASSWD", "usermod", "setcap", "chmod u+s"] {
            assert!(!text.contains(forbidden), "found {forbidden}");
        }
        // Privileged work happens before the identity exists.
        let mount = position(text, "mount -t cifs");
        let identity = position(text, "useradd");
        assert!(mount < identity);
    }

    #[test]
    fn identity_failure_refuses_to_run_as_root() {
        let script =
            ScriptComposer::default().compose(&request("id", None, PrivilegeMode::DropPrivileges));
        let text = script.text();
        assert!(text.contains("refusing to run the script as root"));
        assert!(text.contains("mountbox_exit=126"));
    }

    #[test]
    fn run_as_root_skips_privilege_transition() {
        let script =
            ScriptComposer::default().compose(&request("id", None, PrivilegeMode::RunAsRoot));
        assert!(!script.stage_kinds().contains(&StageKind::CreateIdentity));
        assert!(!script.text().contains("su -s"));
        assert!(script.text().contains("cd /workspace || exit 1"));
    }

    #[test]
    fn composing_twice_is_byte_identical() {
        let composer = ScriptComposer::default();
        let req = request(
            "#!/bin/sh\necho \"$HOME\" 'quoted'\n",
            Some(
                MountSpec::new(MountKind::Cifs, "//fs/share")
                    .with_options("vers=3.0")
                    .with_credentials(Credentials::new("svc", "pw")),
            ),
            PrivilegeMode::DropPrivileges,
        );
        assert_eq!(composer.compose(&req).text(), composer.compose(&req).text());
        assert_eq!(composer.compose(&req).encoded(), composer.compose(&req).encoded());
    }

    #[test]
    fn base64_round_trip_is_exact() {
        let script = ScriptComposer::default().compose(&request(
            "printf 'ünïcode \\t tab'\necho '$(not expanded)'\n",
            Some(MountSpec::new(MountKind::Nfs, "nas:/export")),
            PrivilegeMode::DropPrivileges,
        ));
        assert_eq!(decode_script(&script.encoded()).unwrap(), script.text());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_script("not base64!!").is_err());
    }

    #[test]
    fn heredoc_delimiter_avoids_collisions() {
        assert_eq!(heredoc_delimiter("echo hi"), "MOUNTBOX_USER_SCRIPT");
        assert_eq!(
            heredoc_delimiter("MOUNTBOX_USER_SCRIPT\nMOUNTBOX_USER_SCRIPT_1\n"),
            "MOUNTBOX_USER_SCRIPT_2"
        );
        // Only whole-line matches terminate a heredoc.
        assert_eq!(
            heredoc_delimiter("echo MOUNTBOX_USER_SCRIPT"),
            "MOUNTBOX_USER_SCRIPT"
        );
    }

    #[test]
    fn user_script_is_embedded_verbatim_in_quoted_heredoc() {
        let script = ScriptComposer::default().compose(&request(
            "echo \"$PATH\" `date`",
            None,
            PrivilegeMode::RunAsRoot,
        ));
        assert!(script.text().contains(
            "cat > /tmp/mountbox-user.sh <<'MOUNTBOX_USER_SCRIPT'\necho \"$PATH\" `date`\nMOUNTBOX_USER_SCRIPT\n"
        ));
    }

    #[test]
    fn entry_command_decodes_into_the_entry_script() {
        let script =
            ScriptComposer::default().compose(&request("echo hi", None, PrivilegeMode::RunAsRoot));
        let cmd = script.entry_command();
        assert_eq!(&cmd[..2], ["sh", "-c"]);
        assert!(cmd[2].contains(&script.encoded()));
        assert!(cmd[2].ends_with("exec sh /tmp/mountbox-entry.sh"));
    }
}
