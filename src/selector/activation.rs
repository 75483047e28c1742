use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SelectorConfig;
use crate::error::OccasionError;

/// Anchor used when an occasion names none: every channel shares it.
pub const IMPLICIT_ANCHOR: &str = "occasion";

/// One channel's activation for one occasion. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelActivation {
    pub channel: String,
    pub strength: f64,
}

/// Raw per-occasion signal as handed over by the session layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activations {
    #[serde(default)]
    pub activations: BTreeMap<String, f64>,
    /// Semantic anchor -> channels that reference it.
    #[serde(default)]
    pub anchors: BTreeMap<String, Vec<String>>,
}

impl Activations {
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            activations: pairs.into_iter().map(|(c, s)| (c.into(), s)).collect(),
            anchors: BTreeMap::new(),
        }
    }

    pub fn with_anchor<S: Into<String>>(mut self, anchor: impl Into<String>, channels: impl IntoIterator<Item = S>) -> Self {
        self.anchors.insert(anchor.into(), channels.into_iter().map(Into::into).collect());
        self
    }
}

/// Activations checked against the configured channel set.
/// `strengths` is indexed like `SelectorConfig::channels`; absent channels are 0.
#[derive(Debug, Clone)]
pub struct ValidatedActivations {
    pub strengths: Vec<f64>,
    /// Anchor -> channel indices, sorted and deduplicated.
    pub anchors: Vec<(String, Vec<usize>)>,
}

impl ValidatedActivations {
    pub fn validate(raw: &Activations, config: &SelectorConfig) -> Result<Self, OccasionError> {
        let index_of = |name: &str| config.channels.iter().position(|c| c == name);

        for required in &config.required_channels {
            if !raw.activations.contains_key(required) {
                return Err(OccasionError::MissingChannel(required.clone()));
            }
        }

        let mut strengths = vec![0.0; config.channels.len()];
        for (channel, &value) in &raw.activations {
            let idx = index_of(channel).ok_or_else(|| OccasionError::UnknownChannel(channel.clone()))?;
            if !(0.0..=1.0).contains(&value) {
                return Err(OccasionError::StrengthOutOfRange { channel: channel.clone(), value });
            }
            strengths[idx] = value;
        }

        let anchors = if raw.anchors.is_empty() {
            vec![(IMPLICIT_ANCHOR.to_string(), (0..config.channels.len()).collect())]
        } else {
            let mut resolved = Vec::with_capacity(raw.anchors.len());
            for (anchor, channels) in &raw.anchors {
                let mut members = Vec::with_capacity(channels.len());
                for channel in channels {
                    let idx = index_of(channel).ok_or_else(|| OccasionError::UnknownAnchorChannel {
                        anchor: anchor.clone(),
                        channel: channel.clone(),
                    })?;
                    members.push(idx);
                }
                members.sort_unstable();
                members.dedup();
                resolved.push((anchor.clone(), members));
            }
            resolved
        };

        Ok(Self { strengths, anchors })
    }

    pub fn active_count(&self, threshold: f64) -> usize {
        self.strengths.iter().filter(|&&s| s > threshold).count()
    }
}
