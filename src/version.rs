//! Build metadata embedded by `build.rs`

use std::fmt;

/// Working-tree state of the checkout the binary was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitState {
    Clean,
    Dirty,
    Unknown,
}

impl GitState {
    fn from_marker(marker: &str) -> Self {
        match marker {
            "clean" => GitState::Clean,
            "dirty" => GitState::Dirty,
            _ => GitState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Build {
    pub package: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
    pub branch: &'static str,
    pub git: GitState,
    /// RFC 3339 UTC timestamp
    pub built_at: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
    pub rustc: &'static str,
}

impl Build {
    pub fn current() -> Self {
        Self {
            package: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            commit: env!("HYDRA_GIT_COMMIT"),
            branch: env!("HYDRA_GIT_BRANCH"),
            git: GitState::from_marker(env!("HYDRA_GIT_STATE")),
            built_at: env!("HYDRA_BUILT_AT"),
            target: env!("HYDRA_TARGET"),
            profile: env!("HYDRA_PROFILE"),
            rustc: env!("HYDRA_RUSTC"),
        }
    }

    /// Semver with build metadata, e.g. `0.1.0+1a2b3c4d` or `0.1.0+1a2b3c4d.dirty`
    pub fn describe(&self) -> String {
        match self.git {
            GitState::Dirty => format!("{}+{}.dirty", self.version, self.commit),
            _ => format!("{}+{}", self.version, self.commit),
        }
    }
}

impl fmt::Display for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.package, self.describe())?;
        writeln!(f)?;

        let rows = [
            ("commit", format!("{} ({})", self.commit, self.branch)),
            ("built", self.built_at.to_string()),
            ("profile", self.profile.to_string()),
            ("target", self.target.to_string()),
            ("rustc", self.rustc.to_string()),
            ("protocol", "Socket.IO over WebSocket (Engine.IO 3, 4)".to_string()),
        ];
        for (label, value) in rows {
            writeln!(f, "  {:<10}{}", label, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_build() {
        let build = Build::current();
        assert_eq!(build.package, "hydra-agent");
        assert!(build.describe().starts_with(build.version));
        assert!(build.describe().contains(build.commit));
    }

    #[test]
    fn test_git_state_markers() {
        assert_eq!(GitState::from_marker("clean"), GitState::Clean);
        assert_eq!(GitState::from_marker("dirty"), GitState::Dirty);
        assert_eq!(GitState::from_marker("unknown"), GitState::Unknown);
    }

    #[test]
    fn test_dirty_describe() {
        let build = Build {
            git: GitState::Dirty,
            commit: "1a2b3c4d",
            version: "0.1.0",
            ..Build::current()
        };
        assert_eq!(build.describe(), "0.1.0+1a2b3c4d.dirty");
    }

    #[test]
    fn test_display_lists_protocol() {
        let text = Build::current().to_string();
        assert!(text.starts_with("hydra-agent "));
        assert!(text.contains("commit"));
        assert!(text.contains("Engine.IO 3, 4"));
    }
}
