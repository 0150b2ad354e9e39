//! Supported function runtimes.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A managed runtime with a matching sandbox image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Runtime {
    Nodejs6,
    Nodejs8,
    Nodejs10,
    Nodejs12,
    Python27,
    Python3,
    Java8,
    Java11,
    Php72,
    Dotnetcore21,
    Custom,
}

impl Runtime {
    /// All runtimes, in table order.
    pub const ALL: [Runtime; 11] = [
        Runtime::Nodejs6,
        Runtime::Nodejs8,
        Runtime::Nodejs10,
        Runtime::Nodejs12,
        Runtime::Python27,
        Runtime::Python3,
        Runtime::Java8,
        Runtime::Java11,
        Runtime::Php72,
        Runtime::Dotnetcore21,
        Runtime::Custom,
    ];

    /// Identifier as written in templates.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nodejs6 => "nodejs6",
            Self::Nodejs8 => "nodejs8",
            Self::Nodejs10 => "nodejs10",
            Self::Nodejs12 => "nodejs12",
            Self::Python27 => "python2.7",
            Self::Python3 => "python3",
            Self::Java8 => "java8",
            Self::Java11 => "java11",
            Self::Php72 => "php7.2",
            Self::Dotnetcore21 => "dotnetcore2.1",
            Self::Custom => "custom",
        }
    }

    /// Name used in the runtime image repository (`aliyunfc/runtime-<name>`).
    pub fn image_name(&self) -> &'static str {
        match self {
            Self::Python3 => "python3.6",
            other => other.as_str(),
        }
    }

    /// Path of the protocol adapter inside the sandbox image.
    pub fn mock_script(&self) -> String {
        format!("/var/fc/runtime/{}/mock", self.as_str())
    }

    pub fn is_nodejs(&self) -> bool {
        matches!(
            self,
            Self::Nodejs6 | Self::Nodejs8 | Self::Nodejs10 | Self::Nodejs12
        )
    }

    pub fn is_python(&self) -> bool {
        matches!(self, Self::Python27 | Self::Python3)
    }

    pub fn is_java(&self) -> bool {
        matches!(self, Self::Java8 | Self::Java11)
    }

    pub fn is_php(&self) -> bool {
        matches!(self, Self::Php72)
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Runtime::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| CoreError::InvalidRuntime(s.to_string()))
    }
}

impl TryFrom<String> for Runtime {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Runtime> for String {
    fn from(runtime: Runtime) -> Self {
        runtime.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for runtime in Runtime::ALL {
            assert_eq!(runtime.as_str().parse::<Runtime>().unwrap(), runtime);
        }
    }

    #[test]
    fn test_unknown_runtime() {
        assert!(matches!(
            "go1".parse::<Runtime>(),
            Err(CoreError::InvalidRuntime(_))
        ));
    }

    #[test]
    fn test_image_names() {
        assert_eq!(Runtime::Python3.image_name(), "python3.6");
        assert_eq!(Runtime::Python27.image_name(), "python2.7");
        assert_eq!(Runtime::Dotnetcore21.image_name(), "dotnetcore2.1");
    }

    #[test]
    fn test_mock_script() {
        assert_eq!(Runtime::Nodejs8.mock_script(), "/var/fc/runtime/nodejs8/mock");
    }

    #[test]
    fn test_deserialize() {
        let runtime: Runtime = serde_json::from_str("\"php7.2\"").unwrap();
        assert_eq!(runtime, Runtime::Php72);
        assert!(serde_json::from_str::<Runtime>("\"ruby\"").is_err());
    }
}
