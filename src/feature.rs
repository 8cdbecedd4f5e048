//! Optional delivery features and the registry tracking which are enabled

use crate::error::{ClientError, ClientResult};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::info;

/// A class of inbound delivery that needs a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Feature {
    #[serde(rename = "c2d")]
    CloudToDevice,
    #[serde(rename = "input")]
    InputMessages,
}

impl Feature {
    pub const ALL: [Feature; 2] = [Feature::CloudToDevice, Feature::InputMessages];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::CloudToDevice => "c2d",
            Feature::InputMessages => "input",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = ClientError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.as_str().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| ClientError::UnknownFeature(name.to_string()))
    }
}

/// Enabled-feature set of one session
///
/// Toggles are serialized by an async mutex held across the subscribe call,
/// while lookups only touch the set and never wait for a toggle in flight.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    enabled: RwLock<HashSet<Feature>>,
    toggle: Mutex<()>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.enabled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&feature)
    }

    pub fn enabled_features(&self) -> Vec<Feature> {
        let mut features: Vec<_> = self
            .enabled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        features.sort();
        features
    }

    /// Run `subscribe` unless the feature is already enabled; record it on success
    pub async fn enable<F, Fut>(&self, feature: Feature, subscribe: F) -> ClientResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientResult<()>>,
    {
        let _toggle = self.toggle.lock().await;
        if self.is_enabled(feature) {
            return Ok(());
        }

        subscribe().await?;
        self.set(feature, true);
        info!(feature = %feature, "Feature enabled");
        Ok(())
    }

    /// Run `unsubscribe` unless the feature is already disabled; forget it on success
    pub async fn disable<F, Fut>(&self, feature: Feature, unsubscribe: F) -> ClientResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientResult<()>>,
    {
        let _toggle = self.toggle.lock().await;
        if !self.is_enabled(feature) {
            return Ok(());
        }

        unsubscribe().await?;
        self.set(feature, false);
        info!(feature = %feature, "Feature disabled");
        Ok(())
    }

    /// Forget every feature; the subscriptions died with the connection
    pub fn clear(&self) {
        self.enabled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn set(&self, feature: Feature, enabled: bool) {
        let mut set = self.enabled.write().unwrap_or_else(|e| e.into_inner());
        if enabled {
            set.insert(feature);
        } else {
            set.remove(&feature);
        }
    }
}
