//! Shell fragments that install a mount helper, mount a share and unmount it.

use shell_words::quote;

use crate::request::{MountKind, MountSpec};

/// Package managers probed inside the image, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Apk,
    Yum,
}

impl PackageManager {
    pub const PROBE_ORDER: [Self; 3] = [Self::Apt, Self::Apk, Self::Yum];

    /// Binary whose presence selects this package manager.
    pub fn binary(self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Apk => "apk",
            Self::Yum => "yum",
        }
    }

    /// Package that provides the mount helper for `kind`.
    pub fn client_package(self, kind: MountKind) -> &'static str {
        match (self, kind) {
            (Self::Apt, MountKind::Nfs) => "nfs-common",
            (Self::Apk | Self::Yum, MountKind::Nfs) => "nfs-utils",
            (_, MountKind::Cifs) => "cifs-utils",
        }
    }

    fn install_command(self, package: &str) -> String {
        match self {
            Self::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get update -qq >/dev/null 2>&1 && \
                 DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {package} >/dev/null 2>&1"
            ),
            Self::Apk => format!("apk add --no-cache -q {package} >/dev/null 2>&1"),
            Self::Yum => format!("yum install -y -q {package} >/dev/null 2>&1"),
        }
    }
}

impl MountKind {
    /// Default `-o` options when none are given.
    pub fn default_options(self) -> &'static str {
        match self {
            Self::Nfs => "rw,sync",
            Self::Cifs => "rw",
        }
    }

    /// Helper binary that `mount -t <kind>` delegates to.
    pub fn helper_binary(self) -> &'static str {
        match self {
            Self::Nfs => "mount.nfs",
            Self::Cifs => "mount.cifs",
        }
    }
}

/// The three shell fragments derived from a [`MountSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    pub install: String,
    pub mount: String,
    pub unmount: String,
    pub mount_point: String,
}

/// Build the install/mount/unmount fragments for `spec`.
///
/// Never fails: a missing package manager or a failed install only produces
/// a warning on stderr when the fragment runs.
pub fn plan(spec: &MountSpec) -> MountPlan {
    MountPlan {
        install: install_fragment(spec.kind),
        mount: mount_fragment(spec),
        unmount: format!("umount {} >/dev/null 2>&1 || true", quote(&spec.mount_point)),
        mount_point: spec.mount_point.clone(),
    }
}

/// Options passed to `mount -o`, credentials included for CIFS.
pub fn mount_options(spec: &MountSpec) -> String {
    let mut options = if spec.options.trim().is_empty() {
        spec.kind.default_options().to_string()
    } else {
        spec.options.trim().to_string()
    };
    if spec.kind == MountKind::Cifs
        && let Some(creds) = &spec.credentials
    {
        options.push_str(&format!(
            ",username={},password={}",
            creds.username,
            creds.password()
        ));
    }
    options
}

fn mount_fragment(spec: &MountSpec) -> String {
    format!(
        "mount -t {} -o {} {} {}",
        spec.kind.fs_type(),
        quote(&mount_options(spec)),
        quote(spec.source.trim()),
        quote(&spec.mount_point)
    )
}

fn install_fragment(kind: MountKind) -> String {
    let helper = kind.helper_binary();
    let mut out = format!("if command -v {helper} >/dev/null 2>&1; then\n    :\n");
    for pm in PackageManager::PROBE_ORDER {
        let package = pm.client_package(kind);
        out.push_str(&format!(
            "elif command -v {bin} >/dev/null 2>&1; then\n    {cmd} || echo \"mountbox: warning: failed to install {package} with {bin}\" >&2\n",
            bin = pm.binary(),
            cmd = pm.install_command(package),
        ));
    }
    out.push_str(&format!(
        "else\n    echo \"mountbox: warning: no supported package manager found; {helper} may be missing\" >&2\nfi"
    ));
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::request::Credentials, rstest::rstest};

    #[rstest]
    #[case(MountKind::Nfs, "", "rw,sync")]
    #[case(MountKind::Cifs, "", "rw")]
    #[case(MountKind::Nfs, "ro,vers=4.1", "ro,vers=4.1")]
    #[case(MountKind::Cifs, " vers=3.0 ", "vers=3.0")]
    fn options_default_per_kind(#[case] kind: MountKind, #[case] given: &str, #[case] expected: &str) {
        let spec = MountSpec::new(kind, "src").with_options(given);
        assert_eq!(mount_options(&spec), expected);
    }

    #[test]
    fn cifs_appends_credentials() {
        let spec = MountSpec::new(MountKind::Cifs, "//fs/share")
            .with_credentials(Credentials::new("svc", "p@ss word"));
        assert_eq!(
            mount_options(&spec),
            "rw,username=svc,password=p@ss word"
        );
        let plan = plan(&spec);
        assert_eq!(shell_words::split(&plan.mount).unwrap(), vec![
            "mount",
            "-t",
            "cifs",
            "-o",
            "rw,username=svc,password=p@ss word",
            "//fs/share",
            "/mnt/network",
        ]);
    }

    #[test]
    fn nfs_never_renders_credentials() {
        let spec = MountSpec::new(MountKind::Nfs, "nas:/export")
            .with_credentials(Credentials::new("svc", "secret"));
        let plan = plan(&spec);
        assert_eq!(shell_words::split(&plan.mount).unwrap(), vec![
            "mount",
            "-t",
            "nfs",
            "-o",
            "rw,sync",
            "nas:/export",
            "/mnt/network",
        ]);
        assert!(!plan.mount.contains("secret"));
    }

    #[test]
    fn unmount_targets_mount_point_and_suppresses_errors() {
        let spec = MountSpec::new(MountKind::Nfs, "nas:/export").with_mount_point("/mnt/my data");
        let unmount = plan(&spec).unmount;
        let words = shell_words::split(&unmount).unwrap();
        assert_eq!(&words[..2], ["umount", "/mnt/my data"]);
        assert!(unmount.ends_with("|| true"));
    }

    #[rstest]
    #[case(PackageManager::Apt, MountKind::Nfs, "nfs-common")]
    #[case(PackageManager::Apk, MountKind::Nfs, "nfs-utils")]
    #[case(PackageManager::Yum, MountKind::Nfs, "nfs-utils")]
    #[case(PackageManager::Apt, MountKind::Cifs, "cifs-utils")]
    #[case(PackageManager::Apk, MountKind::Cifs, "cifs-utils")]
    #[case(PackageManager::Yum, MountKind::Cifs, "cifs-utils")]
    fn client_packages(#[case] pm: PackageManager, #[case] kind: MountKind, #[case] pkg: &str) {
        assert_eq!(pm.client_package(kind), pkg);
    }

    #[test]
    fn install_probes_apt_then_apk_then_yum() {
        let install = plan(&MountSpec::new(MountKind::Nfs, "nas:/export")).install;
        let apt = install.find("command -v apt-get").unwrap();
        let apk = install.find("command -v apk").unwrap();
        let yum = install.find("command -v yum").unwrap();
        assert!(apt < apk && apk < yum);
        assert!(install.starts_with("if command -v mount.nfs"));
        assert!(install.contains("apt-get install -y -qq nfs-common"));
        assert!(install.contains("no supported package manager found"));
        assert!(install.ends_with("fi"));
    }
}
