//! Closed set of per-tenant product features.
//!
//! Flags are read once from the tenant record at the boundary and evaluated
//! through [`FeatureSet::contains`]; nothing downstream compares strings.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Tenant data may live in a tenant-owned database.
    PrivateCloud,
    /// Tenant may call the machine-to-machine API.
    PrivateApi,
}

impl Feature {
    pub const ALL: [Feature; 2] = [Feature::PrivateCloud, Feature::PrivateApi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrivateCloud => "private_cloud",
            Self::PrivateApi => "private_api",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private_cloud" => Ok(Self::PrivateCloud),
            "private_api" => Ok(Self::PrivateApi),
            _ => Err(format!("unknown feature: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(BTreeSet<Feature>);

impl FeatureSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from the boolean flag columns of a tenant record.
    pub fn from_flags(private_cloud: bool, private_api: bool) -> Self {
        let mut set = BTreeSet::new();
        if private_cloud {
            set.insert(Feature::PrivateCloud);
        }
        if private_api {
            set.insert(Feature::PrivateApi);
        }
        Self(set)
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.0.insert(feature);
        self
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains(&feature)
    }

    pub fn require(&self, feature: Feature) -> Result<(), AuthError> {
        if self.contains(feature) {
            Ok(())
        } else {
            Err(AuthError::FeatureNotEnabled {
                feature: feature.to_string(),
            })
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_flags_maps_each_column() {
        assert!(FeatureSet::from_flags(false, false).is_empty());

        let set = FeatureSet::from_flags(true, false);
        assert!(set.contains(Feature::PrivateCloud));
        assert!(!set.contains(Feature::PrivateApi));

        let set = FeatureSet::from_flags(true, true);
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn require_reports_missing_feature() {
        let set = FeatureSet::from_flags(false, true);
        let err = set.require(Feature::PrivateCloud).unwrap_err();
        assert_eq!(
            err,
            AuthError::FeatureNotEnabled {
                feature: "private_cloud".into()
            }
        );
        assert!(set.require(Feature::PrivateApi).is_ok());
    }

    #[test]
    fn feature_string_roundtrip() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
        assert!("admin".parse::<Feature>().is_err());
    }

    #[test]
    fn serializes_as_sorted_list() {
        let set = FeatureSet::empty()
            .with(Feature::PrivateApi)
            .with(Feature::PrivateCloud);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["private_cloud","private_api"]"#);
    }
}
