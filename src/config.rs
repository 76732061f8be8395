//! Participant and transport configuration
//!
//! The bus never parses configuration files or environment variables —
//! it consumes an already-resolved [`ParticipantConfig`]. Transport
//! options are string key/value maps interpreted by the individual
//! transport implementations.

use std::collections::HashMap;
use std::time::Duration;

use crate::dispatch::ReceivingStrategyKind;

/// Event ordering guarantee requested from a transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ordering {
    /// Events may be delivered in any order
    #[default]
    Unordered,
    /// Events are delivered in the order they were sent
    Ordered,
}

/// Delivery reliability requested from a transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reliability {
    /// Events may be dropped
    Unreliable,
    /// Events must not be dropped
    #[default]
    Reliable,
}

/// Quality-of-service specification, advisory to a connector
///
/// A connector that cannot honor a requested setting rejects it at
/// configuration time; it never silently downgrades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityOfServiceSpec {
    pub ordering: Ordering,
    pub reliability: Reliability,
}

/// What `handle` does when the single-threaded dispatch queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Block the caller until queue space frees up
    #[default]
    Block,
    /// Fail with a backpressure error after the given deadline
    Deadline(Duration),
}

/// Per-transport switch plus free-form options
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub enabled: bool,
    pub options: HashMap<String, String>,
}

impl TransportOptions {
    /// An enabled transport with no options
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            options: HashMap::new(),
        }
    }

    /// Add an option (builder style)
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Look up an option value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Resolved configuration consumed by participant constructors
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    /// Transport name → options; disabled transports are skipped
    pub transports: HashMap<String, TransportOptions>,

    /// Requested quality of service
    pub qos: QualityOfServiceSpec,

    /// Dispatch strategy for listeners
    pub strategy: ReceivingStrategyKind,

    /// Queue capacity of the single-threaded strategy
    pub queue_capacity: usize,

    /// Worker pool size of the unordered-parallel strategy
    pub pool_size: usize,

    /// Backpressure behavior of the single-threaded strategy
    pub backpressure: BackpressurePolicy,

    /// Reply deadline for synchronous and asynchronous RPC calls
    pub rpc_timeout: Duration,

    /// Payloads larger than this are fragmented on socket transports
    pub fragment_threshold: usize,

    /// Byte budget for buffered incomplete fragment sets per connection
    pub reassembly_budget: usize,

    /// Largest accepted wire message, including the notification envelope
    pub max_message_size: usize,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        let mut transports = HashMap::new();
        transports.insert("memory".to_string(), TransportOptions::enabled());
        Self {
            transports,
            qos: QualityOfServiceSpec::default(),
            strategy: ReceivingStrategyKind::default(),
            queue_capacity: 1024,
            pool_size: 4,
            backpressure: BackpressurePolicy::default(),
            rpc_timeout: Duration::from_secs(25),
            fragment_threshold: 256 * 1024,
            reassembly_budget: 16 * 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl ParticipantConfig {
    /// Names of the enabled transports
    pub fn enabled_transports(&self) -> impl Iterator<Item = (&str, &TransportOptions)> {
        self.transports
            .iter()
            .filter(|(_, options)| options.enabled)
            .map(|(name, options)| (name.as_str(), options))
    }
}
