//! Originating service identity.

use serde::{Deserialize, Serialize};

/// Identity of the process that built a message.
///
/// Carried for diagnostics only; nothing in the hub authorizes on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderInfo {
    pub package: String,
    pub exe: String,
    pub version: String,
    pub commit: String,
    pub hostname: String,
    pub username: String,
    pub service_name: String,
}

impl SenderInfo {
    /// Identity of the running process, tagged with `service_name`.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}

impl Default for SenderInfo {
    fn default() -> Self {
        let exe = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            package: env!("CARGO_PKG_NAME").to_string(),
            exe,
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("DRIPLINE_GIT_COMMIT")
                .unwrap_or("unknown")
                .to_string(),
            hostname: env_or_unknown(&["HOSTNAME", "COMPUTERNAME"]),
            username: env_or_unknown(&["USER", "USERNAME"]),
            service_name: "unknown".to_string(),
        }
    }
}

fn env_or_unknown(vars: &[&str]) -> String {
    vars.iter()
        .find_map(|v| std::env::var(v).ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}
