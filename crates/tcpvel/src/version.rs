//! Version information reported by the health check.

/// Crate version from Cargo.toml
pub const TCPVEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub tcpvel: &'static str,
    /// Robot link the producer runs against (e.g. "simulated").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_link: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            tcpvel: TCPVEL_VERSION,
            robot_link: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_robot_link(mut self, link: impl Into<String>) -> Self {
        self.robot_link = Some(link.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.tcpvel, TCPVEL_VERSION);
        assert!(info.robot_link.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            tcpvel: "0.1.0",
            robot_link: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "tcpvel": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo {
            tcpvel: "0.1.0",
            robot_link: None,
        }
        .with_robot_link("simulated");
        insta::assert_json_snapshot!(info, @r#"
        {
          "tcpvel": "0.1.0",
          "robot_link": "simulated"
        }
        "#);
    }
}
