//! Timeout tiers and outcome classification for every outgoing call.

use std::time::Duration;

use serde_json::Value;
use tether_config::ServiceConfig;
use tether_rpc::{Peer, RpcError};

use crate::error::{Result, VmServiceError};
use crate::JsonMap;

/// Which timeout applies to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutTier {
    /// Fire-and-forget toggles.
    Short,
    #[default]
    Default,
    /// Expensive operations such as view enumeration or timeline capture.
    Long,
    Custom(Duration),
}

/// Per-call policy.
///
/// By default a timeout fails the call, while an application error is logged
/// and reported as an absent result. Calls that need to branch on error codes
/// opt into [`CallOptions::strict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub timeout: TimeoutTier,
    pub timeout_fatal: bool,
    pub application_errors_fatal: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: TimeoutTier::Default,
            timeout_fatal: true,
            application_errors_fatal: false,
        }
    }
}

impl CallOptions {
    pub fn short() -> Self {
        Self {
            timeout: TimeoutTier::Short,
            ..Self::default()
        }
    }

    pub fn long() -> Self {
        Self {
            timeout: TimeoutTier::Long,
            ..Self::default()
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: TimeoutTier::Custom(timeout),
            ..Self::default()
        }
    }

    /// A timeout yields `Ok(None)` instead of an error.
    pub fn non_fatal(mut self) -> Self {
        self.timeout_fatal = false;
        self
    }

    /// Application errors are returned as [`VmServiceError::Application`].
    pub fn strict(mut self) -> Self {
        self.application_errors_fatal = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timeouts {
    pub short: Duration,
    pub default: Duration,
    pub long: Duration,
}

impl Timeouts {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            short: config.short_timeout(),
            default: config.request_timeout(),
            long: config.long_timeout(),
        }
    }

    fn resolve(&self, tier: TimeoutTier) -> Duration {
        match tier {
            TimeoutTier::Short => self.short,
            TimeoutTier::Default => self.default,
            TimeoutTier::Long => self.long,
            TimeoutTier::Custom(duration) => duration,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Rpc {
    peer: Peer,
    timeouts: Timeouts,
}

impl Rpc {
    pub fn new(peer: Peer, timeouts: Timeouts) -> Self {
        Self { peer, timeouts }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub async fn call(
        &self,
        method: &str,
        params: JsonMap,
        options: CallOptions,
    ) -> Result<Option<JsonMap>> {
        let timeout = self.timeouts.resolve(options.timeout);
        let outcome = self
            .peer
            .send_request_with_timeout(method, Value::Object(params), timeout)
            .await;
        classify(method, options, timeout, outcome)
    }
}

fn classify(
    method: &str,
    options: CallOptions,
    timeout: Duration,
    outcome: std::result::Result<Value, RpcError>,
) -> Result<Option<JsonMap>> {
    match outcome {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(Value::Null) => Ok(None),
        Ok(other) => Err(VmServiceError::load(format!(
            "`{method}` returned a non-object result: {other}"
        ))),
        Err(RpcError::Timeout(_)) if options.timeout_fatal => Err(VmServiceError::Timeout {
            method: method.to_owned(),
            timeout,
        }),
        Err(RpcError::Timeout(_)) => {
            tracing::debug!(target: "tether.vm", method, ?timeout, "request timed out; ignoring");
            Ok(None)
        }
        Err(RpcError::Transport(source)) => Err(VmServiceError::Transport {
            method: method.to_owned(),
            source,
        }),
        Err(RpcError::Remote(err)) => {
            tracing::warn!(
                target: "tether.vm",
                method,
                code = err.code,
                message = %err.message,
                data = ?err.data,
                "VM service returned an error"
            );
            if options.application_errors_fatal {
                Err(VmServiceError::Application {
                    method: method.to_owned(),
                    code: err.code,
                    message: err.message,
                    data: err.data,
                })
            } else {
                Ok(None)
            }
        }
    }
}
