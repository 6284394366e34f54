// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The upward channel handle: configuration defaults and per-call final
//! information, nothing more. Transport logic lives below the call.

// Standard library imports
use std::time::Duration;

// Third-party crates
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use wirecall_compression::{CompressionAlgorithm, CompressionLevel, EncodingSet};

// Local crate
use crate::status::FinalStatus;

/// Channel-wide compression defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionOptions {
    /// Level applied when a send-initial-metadata op does not set one.
    pub default_level: Option<CompressionLevel>,
    /// Algorithm forced for outgoing data when set.
    pub default_algorithm: Option<CompressionAlgorithm>,
    /// Algorithms this channel is willing to use.
    pub enabled: EncodingSet,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        CompressionOptions {
            default_level: None,
            default_algorithm: None,
            enabled: EncodingSet::all(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Target address, used as the peer fallback.
    pub target: String,
    #[serde(default)]
    pub compression: CompressionOptions,
}

impl ChannelConfig {
    pub fn new(target: impl Into<String>) -> Self {
        ChannelConfig {
            target: target.into(),
            compression: CompressionOptions::default(),
        }
    }
}

/// Reported to the channel when a call is torn down.
#[derive(Debug, Clone)]
pub struct FinalInfo {
    pub status: FinalStatus,
    pub latency: Duration,
}

type FinalInfoObserver = Box<dyn Fn(&FinalInfo) + Send + Sync>;

/// The channel object as seen by its calls.
pub struct Channel {
    config: ChannelConfig,
    observer: Mutex<Option<FinalInfoObserver>>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Channel {
            config,
            observer: Mutex::new(None),
        })
    }

    pub fn target(&self) -> &str {
        &self.config.target
    }

    pub fn compression_options(&self) -> &CompressionOptions {
        &self.config.compression
    }

    /// Register an observer for per-call final information.
    pub fn on_call_final(&self, observer: impl Fn(&FinalInfo) + Send + Sync + 'static) {
        *self.observer.lock() = Some(Box::new(observer));
    }

    pub(crate) fn report_final(&self, info: &FinalInfo) {
        if let Some(observer) = self.observer.lock().as_ref() {
            observer(info);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.config.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_default_compression_options() {
        let opts = CompressionOptions::default();
        assert!(opts.default_level.is_none());
        assert_eq!(opts.enabled, EncodingSet::all());
    }

    #[test]
    fn test_final_info_observer() {
        let channel = Channel::new(ChannelConfig::new("inproc:test"));
        let seen = std::sync::Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        channel.on_call_final(move |info| {
            *seen2.lock() = Some(info.status.code);
        });
        channel.report_final(&FinalInfo {
            status: FinalStatus {
                code: Code::NotFound,
                details: "gone".into(),
            },
            latency: Duration::from_millis(5),
        });
        assert_eq!(*seen.lock(), Some(Code::NotFound));
    }
}
