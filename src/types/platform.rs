//! Target platform identification.

use std::fmt;

use serde::Serialize;

/// A target platform: a pair of short OS and architecture tags, carried
/// opaquely through the path templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub os_tag: String,
    pub arch_tag: String,
}

impl Platform {
    pub fn new(os_tag: impl Into<String>, arch_tag: impl Into<String>) -> Self {
        Self {
            os_tag: os_tag.into(),
            arch_tag: arch_tag.into(),
        }
    }

    /// The platform this process is running on.
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os_tag, self.arch_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_platform_has_tags() {
        let platform = Platform::current();
        assert!(!platform.os_tag.is_empty());
        assert!(!platform.arch_tag.is_empty());
    }

    #[test]
    fn display_joins_tags() {
        assert_eq!(Platform::new("linux", "amd64").to_string(), "linux_amd64");
    }
}
