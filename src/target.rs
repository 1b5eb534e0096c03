//! # Compilation Target
//!
//! Capability record consumed by schedule validation and lowering. Target
//! detection itself happens elsewhere; this layer only answers "is this
//! device API usable" and "is this feature on". Targets parse from
//! dash-separated strings ("host", "host-cuda", "host-msan-no_asserts") so
//! they can be carried in configuration files.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Device APIs a loop may be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceApi {
    /// No device annotation; the loop runs wherever its context runs.
    None,
    Host,
    Cuda,
    OpenCl,
    Metal,
}

impl fmt::Display for DeviceApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceApi::None => "none",
            DeviceApi::Host => "host",
            DeviceApi::Cuda => "cuda",
            DeviceApi::OpenCl => "opencl",
            DeviceApi::Metal => "metal",
        };
        f.write_str(s)
    }
}

/// Optional target features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Suppress all runtime assertion statements in the produced IR.
    NoAsserts,
    /// Emit memory-sanitizer annotations around extern stages.
    Msan,
    Cuda,
    OpenCl,
    Metal,
}

impl Feature {
    fn token(self) -> &'static str {
        match self {
            Feature::NoAsserts => "no_asserts",
            Feature::Msan => "msan",
            Feature::Cuda => "cuda",
            Feature::OpenCl => "opencl",
            Feature::Metal => "metal",
        }
    }
}

/// The capability record handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Target {
    features: BTreeSet<Feature>,
}

impl Target {
    /// The plain host target: no optional features.
    pub fn host() -> Target {
        Target::default()
    }

    pub fn with_feature(mut self, feature: Feature) -> Target {
        self.features.insert(feature);
        self
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Host execution is always available; device APIs require their
    /// matching feature.
    pub fn supports_device_api(&self, api: DeviceApi) -> bool {
        match api {
            DeviceApi::None | DeviceApi::Host => true,
            DeviceApi::Cuda => self.has_feature(Feature::Cuda),
            DeviceApi::OpenCl => self.has_feature(Feature::OpenCl),
            DeviceApi::Metal => self.has_feature(Feature::Metal),
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Target, Error> {
        let mut target = Target::default();
        for token in s.split('-') {
            match token {
                "host" | "" => {}
                "no_asserts" => {
                    target.features.insert(Feature::NoAsserts);
                }
                "msan" => {
                    target.features.insert(Feature::Msan);
                }
                "cuda" => {
                    target.features.insert(Feature::Cuda);
                }
                "opencl" => {
                    target.features.insert(Feature::OpenCl);
                }
                "metal" => {
                    target.features.insert(Feature::Metal);
                }
                other => {
                    return Err(Error::UnknownTargetFeature {
                        token: other.to_string(),
                    })
                }
            }
        }
        Ok(target)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host")?;
        for feature in &self.features {
            write!(f, "-{}", feature.token())?;
        }
        Ok(())
    }
}
