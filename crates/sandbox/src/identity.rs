//! The unprivileged account user scripts run as.
//!
//! The account gets a home directory and ownership of the working directory,
//! nothing else: no sudoers entry and no extra groups.

use std::ops::RangeInclusive;

/// Shell variable holding the allocated UID once the identity stage has run.
pub const UID_VAR: &str = "mountbox_uid";

/// Name and UID allocation policy for the unprivileged identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPolicy {
    pub name: String,
    pub preferred_uid: u32,
    pub fallback: RangeInclusive<u32>,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            name: "mountbox".into(),
            preferred_uid: 1001,
            fallback: 1002..=1010,
        }
    }
}

impl From<&mountbox_config::IdentityConfig> for IdentityPolicy {
    fn from(cfg: &mountbox_config::IdentityConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            preferred_uid: cfg.uid,
            fallback: cfg.fallback_first..=cfg.fallback_last,
        }
    }
}

impl IdentityPolicy {
    /// UIDs in the order they are tried.
    pub fn candidates(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.preferred_uid).chain(
            self.fallback
                .clone()
                .filter(move |uid| *uid != self.preferred_uid),
        )
    }

    /// Shell that allocates the first free UID (GID = UID) and creates the
    /// account. Leaves `$mountbox_uid` empty when no account could be created.
    pub fn render_create(&self, working_dir: &str) -> String {
        let name = &self.name;
        let candidates = self
            .candidates()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let workdir = shell_words::quote(working_dir);
        format!(
            r#"{UID_VAR}=""
if id -u {name} >/dev/null 2>&1; then
    {UID_VAR}=$(id -u {name})
else
    for candidate in {candidates}; do
        if ! cut -d: -f3 /etc/passwd | grep -qx "$candidate" && ! cut -d: -f3 /etc/group | grep -qx "$candidate"; then
            {UID_VAR}=$candidate
            break
        fi
    done
    if [ -n "${UID_VAR}" ]; then
        if command -v useradd >/dev/null 2>&1; then
            groupadd -g "${UID_VAR}" {name} >/dev/null 2>&1
            useradd -m -u "${UID_VAR}" -g "${UID_VAR}" -s /bin/sh {name} >/dev/null 2>&1
        elif command -v adduser >/dev/null 2>&1; then
            addgroup -g "${UID_VAR}" {name} >/dev/null 2>&1
            adduser -D -u "${UID_VAR}" -G {name} -s /bin/sh {name} >/dev/null 2>&1
        fi
        id -u {name} >/dev/null 2>&1 || {UID_VAR}=""
    fi
fi
if [ -n "${UID_VAR}" ]; then
    mkdir -p {workdir} && chown "${UID_VAR}:${UID_VAR}" {workdir}
fi"#
        )
    }
}
