//! Security profiles and the policy each one enforces.
//!
//! The profile is a property of the execution context, never of the tool.
//! It acts as a ceiling: a task that needs more than the active profile
//! grants is rejected with `SecurityViolation`, never silently downgraded.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Isolation strictness, ordered `none < standard < hardened`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    /// No isolation. Development only.
    None,
    /// Container-level isolation with safe defaults.
    #[default]
    Standard,
    /// Restricted capabilities, network denied by default.
    Hardened,
}

impl SecurityProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityProfile::None => "none",
            SecurityProfile::Standard => "standard",
            SecurityProfile::Hardened => "hardened",
        }
    }
}

impl fmt::Display for SecurityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(SecurityProfile::None),
            "standard" => Ok(SecurityProfile::Standard),
            "hardened" => Ok(SecurityProfile::Hardened),
            other => Err(Error::config(format!("unknown security profile '{}'", other))),
        }
    }
}

/// Filesystem access a tool needs, ordered by permissiveness.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemAccess {
    #[default]
    None,
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for FilesystemAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilesystemAccess::None => "none",
            FilesystemAccess::ReadOnly => "read_only",
            FilesystemAccess::ReadWrite => "read_write",
        };
        f.write_str(s)
    }
}

/// What a task asks of its sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SecurityRequirements {
    /// Outbound network access.
    pub network: bool,

    /// Access to the scratch filesystem.
    pub filesystem: FilesystemAccess,

    /// Isolation level the caller asked for, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<SecurityProfile>,
}

/// Concrete restrictions derived from a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityPolicy {
    pub profile: SecurityProfile,
    pub allow_network: bool,
    pub max_filesystem: FilesystemAccess,
    pub read_only_root: bool,
    pub drop_all_capabilities: bool,
    pub no_new_privileges: bool,
    pub pids_limit: Option<u32>,
    /// `uid:gid` the workload runs as, when the sandbox supports it.
    pub run_as: Option<String>,
}

impl SecurityPolicy {
    /// Policy for `profile`. `hardened_allow_network` is the deployment's
    /// opt-in for network access under `hardened`.
    pub fn for_profile(profile: SecurityProfile, hardened_allow_network: bool) -> Self {
        match profile {
            SecurityProfile::None => Self {
                profile,
                allow_network: true,
                max_filesystem: FilesystemAccess::ReadWrite,
                read_only_root: false,
                drop_all_capabilities: false,
                no_new_privileges: false,
                pids_limit: None,
                run_as: None,
            },
            SecurityProfile::Standard => Self {
                profile,
                allow_network: true,
                max_filesystem: FilesystemAccess::ReadWrite,
                read_only_root: false,
                drop_all_capabilities: false,
                no_new_privileges: true,
                pids_limit: Some(512),
                run_as: None,
            },
            SecurityProfile::Hardened => Self {
                profile,
                allow_network: hardened_allow_network,
                max_filesystem: FilesystemAccess::ReadOnly,
                read_only_root: true,
                drop_all_capabilities: true,
                no_new_privileges: true,
                pids_limit: Some(64),
                run_as: Some("65534:65534".to_string()),
            },
        }
    }

    /// Check a task's requirements against this policy.
    pub fn check(&self, requirements: &SecurityRequirements) -> Result<()> {
        if let Some(requested) = requirements.profile {
            if requested < self.profile {
                return Err(Error::security_violation(format!(
                    "task requests '{}' isolation but the active profile is '{}'",
                    requested, self.profile
                )));
            }
        }
        if requirements.network && !self.allow_network {
            return Err(Error::security_violation(format!(
                "network access is denied under the '{}' profile",
                self.profile
            )));
        }
        if requirements.filesystem > self.max_filesystem {
            return Err(Error::security_violation(format!(
                "{} filesystem access exceeds the '{}' profile limit of {}",
                requirements.filesystem, self.profile, self.max_filesystem
            )));
        }
        Ok(())
    }
}

/// Pick the profile a task runs under.
///
/// The active profile is the floor; a caller may tighten it but never loosen
/// it. The result must fit under what the sandbox technology can enforce.
pub fn effective_profile(
    active: SecurityProfile,
    requested: Option<SecurityProfile>,
    sandbox_max: SecurityProfile,
) -> Result<SecurityProfile> {
    let profile = match requested {
        Some(requested) if requested < active => {
            return Err(Error::security_violation(format!(
                "requested '{}' isolation is looser than the active '{}' profile",
                requested, active
            )))
        }
        Some(requested) => requested,
        None => active,
    };
    if profile > sandbox_max {
        return Err(Error::security_violation(format!(
            "sandbox cannot enforce the '{}' profile (maximum '{}')",
            profile, sandbox_max
        )));
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_ordering_and_parsing() {
        assert!(SecurityProfile::None < SecurityProfile::Standard);
        assert!(SecurityProfile::Standard < SecurityProfile::Hardened);
        assert_eq!("HARDENED".parse::<SecurityProfile>().unwrap(), SecurityProfile::Hardened);
        assert!("lax".parse::<SecurityProfile>().is_err());
        assert_eq!(
            serde_json::to_string(&SecurityProfile::None).unwrap(),
            "\"none\""
        );
    }

    #[test]
    fn test_none_permits_everything() {
        let policy = SecurityPolicy::for_profile(SecurityProfile::None, false);
        policy
            .check(&SecurityRequirements {
                network: true,
                filesystem: FilesystemAccess::ReadWrite,
                profile: Some(SecurityProfile::None),
            })
            .unwrap();
    }

    #[test]
    fn test_hardened_denies_network_and_writes() {
        let policy = SecurityPolicy::for_profile(SecurityProfile::Hardened, false);
        let net = SecurityRequirements {
            network: true,
            ..Default::default()
        };
        assert!(matches!(policy.check(&net), Err(Error::SecurityViolation(_))));

        let write = SecurityRequirements {
            filesystem: FilesystemAccess::ReadWrite,
            ..Default::default()
        };
        assert!(matches!(policy.check(&write), Err(Error::SecurityViolation(_))));

        let read = SecurityRequirements {
            filesystem: FilesystemAccess::ReadOnly,
            ..Default::default()
        };
        policy.check(&read).unwrap();
    }

    #[test]
    fn test_hardened_network_opt_in() {
        let policy = SecurityPolicy::for_profile(SecurityProfile::Hardened, true);
        policy
            .check(&SecurityRequirements {
                network: true,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_looser_request_is_violation() {
        let policy = SecurityPolicy::for_profile(SecurityProfile::Standard, false);
        let req = SecurityRequirements {
            profile: Some(SecurityProfile::None),
            ..Default::default()
        };
        assert!(matches!(policy.check(&req), Err(Error::SecurityViolation(_))));
    }

    #[test]
    fn test_effective_profile() {
        use SecurityProfile as P;
        assert_eq!(effective_profile(P::Standard, None, P::Hardened).unwrap(), P::Standard);
        assert_eq!(
            effective_profile(P::Standard, Some(P::Hardened), P::Hardened).unwrap(),
            P::Hardened
        );
        assert!(effective_profile(P::Hardened, Some(P::Standard), P::Hardened).is_err());
        assert!(effective_profile(P::Standard, None, P::None).is_err());
        assert_eq!(effective_profile(P::None, None, P::None).unwrap(), P::None);
    }
}
