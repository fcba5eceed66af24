//! # Unisphere Exporter
//!
//! Polls the real-time performance counters of Dell EMC Unity storage arrays
//! through the Unisphere management API and republishes them as OpenTelemetry
//! metrics.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          UNISPHERE EXPORTER                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  CATALOG → MATCHER → CLASSIFIER → DESCRIPTORS → REALTIME QUERY → DECODER    │
//! │                                                         ↓                   │
//! │                                          SNAPSHOT → OTLP METER PROVIDER     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every configured counter group ("provider") on every target array runs as its
//! own task. At startup a provider matches the array's counter catalog against
//! its configured path patterns, declares one instrument per supported path and
//! registers a real-time query. Each cycle it fetches the query result, decodes
//! the wildcard-indexed value tree and publishes a fresh observation snapshot.
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

// ----------------------------------------------------------------------------
// OpenTelemetry
// ----------------------------------------------------------------------------
use opentelemetry::metrics::{
    CallbackRegistration, Meter, MeterProvider as _, ObservableCounter, ObservableGauge, Observer, Unit,
};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::MeterProvider as SdkMeterProvider;
use opentelemetry_sdk::Resource;

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "unisphere-exporter";
pub const EXPORTER_FULL_NAME: &str = "Unisphere OpenTelemetry Exporter";

/// `service.name` resource attribute attached to every exported metric
pub const SERVICE_NAME: &str = "unisphere_exporter";

// ----------------------------------------------------------------------------
// Metric Paths & Naming
// ----------------------------------------------------------------------------

/// Namespace prepended to every synthesized instrument name
pub const METRIC_NAME_PREFIX: &str = "unisphere_";

/// Path segment standing in for one dimension instance (SP, LUN, port, ...)
pub const WILDCARD_SEGMENT: &str = "*";

/// Token sequence collapsed to a single underscore in instrument names
pub const MULTI_SEGMENT_WILDCARD: &str = ".*.";

/// Separator between path segments
pub const PATH_SEPARATOR: char = '.';

/// Trailing sentinel marking a substring pattern
pub const PREFIX_PATTERN_SENTINEL: char = '%';

/// Label name used for a wildcard with no literal segment before it
pub const FALLBACK_DIMENSION_LABEL: &str = "dimension";

/// Client identity label names
pub const HOST_NAME_LABEL: &str = "host.name";
pub const INSTANCE_LABEL: &str = "instance";

/// Path the OTLP/HTTP exporter appends to its endpoint
pub const OTLP_HTTP_METRICS_PATH: &str = "/v1/metrics";

// ----------------------------------------------------------------------------
// Real-Time Query Limits
// ----------------------------------------------------------------------------

/// Maximum number of paths a single real-time query may carry
pub const REALTIME_QUERY_MAX_PATHS: usize = 48;

/// Catalog type code for counters whose samples are not numeric
pub const NON_NUMERIC_TYPE_CODE: i32 = 6;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default provider collection interval (seconds)
pub const DEFAULT_PROVIDER_INTERVAL_SECS: u64 = 60;

/// Smallest interval the array accepts for a real-time query (seconds)
pub const MIN_PROVIDER_INTERVAL_SECS: u64 = 5;

/// Default timeout for a single array API call (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Back-off after a rejected login before credentials are sent again (seconds)
pub const AUTH_RETRY_BACKOFF_SECS: u64 = 60;

/// Grace period for provider tasks to stop on shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

/// How far back the first event poll reaches (seconds)
pub const EVENT_LOOKBACK_SECS: u64 = 3600;

/// Provider name that forwards the array event log
pub const EVENT_PROVIDER: &str = "event";

/// Most verbose array event severity (`OK`)
pub const MAX_EVENT_SEVERITY: u8 = 8;

// ----------------------------------------------------------------------------
// Unisphere REST API
// ----------------------------------------------------------------------------

pub const EMC_REST_CLIENT_HEADER: &str = "x-emc-rest-client";
pub const EMC_CSRF_TOKEN_HEADER: &str = "emc-csrf-token";

const LOGIN_SESSION_PATH: &str = "/api/types/loginSessionInfo/instances?compact=true";
const METRIC_CATALOG_PATH: &str = "/api/types/metric/instances?compact=true\
    &fields=name,path,type,unitDisplayString,description\
    &filter=isRealtimeAvailable%20eq%20true";
const REALTIME_QUERY_PATH: &str = "/api/types/metricRealTimeQuery/instances";
const QUERY_RESULT_PATH: &str = "/api/types/metricQueryResult/instances?compact=true&filter=queryId%20eq%20";
const SYSTEM_PATH: &str = "/api/types/system/instances?compact=true&fields=name,serialNumber";
const BASIC_SYSTEM_INFO_PATH: &str =
    "/api/types/basicSystemInfo/instances?compact=true&fields=name,model,softwareFullVersion";
const MGMT_INTERFACE_PATH: &str = "/api/types/mgmtInterface/instances?compact=true&fields=ipAddress";
const SYSTEM_CAPACITY_PATH: &str = "/api/types/systemCapacity/instances?compact=true\
    &fields=sizeTotal,sizeUsed,sizeFree,sizePreallocated,totalLogicalSize";
const LUN_PATH: &str = "/api/types/lun/instances?compact=true\
    &fields=name,wwn,sizeTotal,sizeUsed,sizeAllocated,sizePreallocated";
const EVENT_PATH: &str = "/api/types/event/instances?compact=true\
    &fields=creationTime,severity,messageId,message,source\
    &filter=creationTime%20gt%20";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Labels - Key-Value Dimensional Data
// ----------------------------------------------------------------------------

/// A single label (key-value pair) attached to an observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: CompactString,
    pub value: CompactString,
}

impl Label {
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl<K, V> From<(K, V)> for Label
where
    K: Into<CompactString>,
    V: Into<CompactString>,
{
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

/// Ordered label set. Client labels first, then one label per wildcard.
pub type Labels = SmallVec<[Label; 8]>;

/// Label names for the wildcard positions of one path, left to right.
pub type LabelNames = SmallVec<[CompactString; 4]>;

// ----------------------------------------------------------------------------
// 3.2 Catalog Entries
// ----------------------------------------------------------------------------

/// One counter path the array can report, as published in its metric catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub path: String,
    pub type_code: i32,
    pub description: String,
    pub unit: String,
}

impl CatalogEntry {
    pub fn new(path: impl Into<String>, type_code: i32) -> Self {
        Self {
            path: path.into(),
            type_code,
            description: String::new(),
            unit: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

// ----------------------------------------------------------------------------
// 3.3 Instrument Kinds & Descriptors
// ----------------------------------------------------------------------------

/// Instrument semantics of a counter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
        }
    }
}

/// Everything needed to declare one instrument for one catalog path.
///
/// `key` is the catalog path and joins decoded results back to the instrument;
/// `name` is derived from `key` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub key: String,
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: MetricKind,
}

// ----------------------------------------------------------------------------
// 3.4 Query Results
// ----------------------------------------------------------------------------

/// Identifier of a real-time query registered on the array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value tree of one queried path.
///
/// Each `Node` level is keyed by the concrete dimension value substituted for
/// the corresponding wildcard of the path. Leaves hold the raw sample text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValue {
    Leaf(String),
    Node(BTreeMap<String, ResultValue>),
}

impl ResultValue {
    pub fn leaf(value: impl Into<String>) -> Self {
        ResultValue::Leaf(value.into())
    }

    pub fn node<K, I>(children: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ResultValue)>,
    {
        ResultValue::Node(children.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Converts an untyped JSON value. Numbers become leaves holding their
    /// textual form; anything that is neither a number, a string nor an object
    /// becomes a leaf that will fail numeric parsing downstream.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::String(text) => ResultValue::Leaf(text),
            JsonValue::Number(number) => ResultValue::Leaf(number.to_string()),
            JsonValue::Object(map) => ResultValue::Node(
                map.into_iter()
                    .map(|(key, child)| (key, ResultValue::from_json(child)))
                    .collect(),
            ),
            other => ResultValue::Leaf(other.to_string()),
        }
    }

    /// Number of leaves under this value.
    pub fn leaf_count(&self) -> usize {
        match self {
            ResultValue::Leaf(_) => 1,
            ResultValue::Node(children) => children.values().map(ResultValue::leaf_count).sum(),
        }
    }
}

impl<'de> Deserialize<'de> for ResultValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        JsonValue::deserialize(deserializer).map(ResultValue::from_json)
    }
}

impl Default for ResultValue {
    fn default() -> Self {
        ResultValue::Node(BTreeMap::new())
    }
}

/// Result tree for one path of a real-time query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultEntry {
    pub path: String,
    pub tree: ResultValue,
}

/// Identity of an array, used for client-level labels.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemIdentity {
    pub name: String,
    pub serial_number: String,
}

// ----------------------------------------------------------------------------
// 3.5 Observations
// ----------------------------------------------------------------------------

/// One decoded scalar sample, ready to be reported against an instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    /// `MetricDescriptor::key` of the target instrument
    pub key: String,
    pub value: f64,
    pub labels: Labels,
}

/// Receives observations produced while decoding one cycle.
pub trait ObservationSink {
    fn observe(&mut self, observation: Observation);
}

impl ObservationSink for Vec<Observation> {
    fn observe(&mut self, observation: Observation) {
        self.push(observation);
    }
}

// ----------------------------------------------------------------------------
// 3.6 Inventory Records
// ----------------------------------------------------------------------------

/// Pool-wide capacity figures, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemCapacity {
    pub size_total: u64,
    pub size_used: u64,
    pub size_free: u64,
    pub size_preallocated: u64,
    pub total_logical_size: u64,
}

/// Size figures of one LUN, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LunInstance {
    pub name: String,
    pub wwn: String,
    pub size_total: u64,
    pub size_used: u64,
    pub size_allocated: u64,
    pub size_preallocated: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BasicSystemInfo {
    pub name: String,
    pub model: String,
    pub software_full_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MgmtInterface {
    pub ip_address: String,
}

/// One entry of the array's event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArrayEvent {
    pub creation_time: String,
    /// 0 (`EMERGENCY`) through 8 (`OK`)
    pub severity: u8,
    pub message_id: String,
    pub message: String,
    pub source: String,
}

impl ArrayEvent {
    pub fn severity_name(&self) -> &'static str {
        match self.severity {
            0 => "EMERGENCY",
            1 => "ALERT",
            2 => "CRITICAL",
            3 => "ERROR",
            4 => "WARNING",
            5 => "NOTICE",
            6 => "INFO",
            7 => "DEBUG",
            8 => "OK",
            _ => "UNKNOWN",
        }
    }
}

/// Events newer than a cursor, plus the array clock at response time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPage {
    pub updated: Option<String>,
    pub events: Vec<ArrayEvent>,
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Exporter Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Array API error: {0}")]
    Api(#[from] ApiError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Api(e) => e.is_recoverable(),
            ExporterError::Pipeline(e) => e.is_recoverable(),
            ExporterError::Telemetry(_) => false,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Api(_) => "api",
            ExporterError::Pipeline(_) => "pipeline",
            ExporterError::Telemetry(_) => "telemetry",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ExporterError::Config(_) => RecoveryHint::FixConfiguration,
            ExporterError::Api(e) => e.recovery_hint(),
            ExporterError::Pipeline(e) => e.recovery_hint(),
            ExporterError::Telemetry(_) => RecoveryHint::FixConfiguration,
            _ => RecoveryHint::RetryNextCycle,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Try again on the next collection cycle
    RetryNextCycle,
    /// Re-authenticate against the array
    Reauthenticate,
    /// Register a new real-time query
    RecreateQuery,
    /// Skip this item and continue
    Skip,
    /// Fix configuration and restart
    FixConfiguration,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Target '{endpoint}' references unknown auth '{auth}'")]
    UnknownAuth { endpoint: String, auth: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Array API Errors
// ----------------------------------------------------------------------------

/// Errors returned by calls against the array management API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Connection to '{endpoint}' failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Unauthorized by '{endpoint}': {message}")]
    Unauthorized { endpoint: String, message: String },

    #[error("Request rejected (422): {message}")]
    UnprocessableEntity { message: String },

    #[error("HTTP error {status_code} from '{url}'")]
    HttpStatus { status_code: u16, url: String },

    #[error("Invalid response from '{url}': {message}")]
    InvalidResponse { url: String, message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Real-time query {query_id} no longer exists")]
    QueryNotFound { query_id: String },
}

impl ApiError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ApiError::InvalidRequest { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ApiError::Unauthorized { .. } => RecoveryHint::Reauthenticate,
            ApiError::QueryNotFound { .. } => RecoveryHint::RecreateQuery,
            ApiError::InvalidResponse { .. } => RecoveryHint::Skip,
            ApiError::InvalidRequest { .. } => RecoveryHint::FixConfiguration,
            _ => RecoveryHint::RetryNextCycle,
        }
    }

    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        ApiError::Timeout {
            operation: operation.into(),
            timeout_ms: limit.as_millis() as u64,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Pipeline Errors
// ----------------------------------------------------------------------------

/// Provider startup failures. Any of these stops the affected provider only.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Provider '{provider}' could not fetch the metric catalog: {source}")]
    CatalogUnavailable {
        provider: String,
        #[source]
        source: ApiError,
    },

    #[error("Real-time query capacity exceeded: {count} paths, at most {capacity} allowed")]
    CapacityExceeded { count: usize, capacity: usize },

    #[error("Instrument name '{name}' derived from both '{existing_key}' and '{key}'")]
    InstrumentNameCollision {
        name: String,
        existing_key: String,
        key: String,
    },

    #[error("Failed to register instrument '{name}': {message}")]
    InstrumentRegistration { name: String, message: String },
}

impl PipelineError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::CatalogUnavailable { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PipelineError::CatalogUnavailable { .. } => RecoveryHint::RetryNextCycle,
            _ => RecoveryHint::FixConfiguration,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Telemetry Errors
// ----------------------------------------------------------------------------

/// Errors building the OpenTelemetry export pipeline
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to build OTLP metrics pipeline for '{endpoint}': {message}")]
    PipelineBuild { endpoint: String, message: String },

    #[error("Failed to install log subscriber: {message}")]
    Subscriber { message: String },
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

/// Result type for array API calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type for provider pipeline setup
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Runs an API call under a deadline, mapping expiry to [`ApiError::Timeout`].
pub async fn call_with_timeout<T, F>(operation: &str, limit: Duration, call: F) -> ApiResult<T>
where
    F: Future<Output = ApiResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::timeout(operation, limit)),
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Defaults applied to targets and providers
    #[serde(default)]
    pub global: GlobalConfig,

    /// Export destination
    #[serde(default)]
    pub server: ServerConfig,

    /// Arrays to poll
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// Named credentials referenced by targets
    #[serde(default)]
    pub auths: Vec<AuthConfig>,

    /// Counter groups keyed by provider name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            server: ServerConfig::default(),
            targets: Vec::new(),
            auths: Vec::new(),
            providers: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from file with environment variable overrides.
    ///
    /// `.yml`/`.yaml` files are read as YAML, everything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml") | Some("yaml") => Figment::new().merge(Yaml::file(path)),
            _ => Figment::new().merge(Toml::file(path)),
        };

        Self::extract(figment.merge(Env::prefixed("UNISPHERE_").split("__")))
    }

    /// Parse a YAML document without environment overrides
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Yaml::string(source)))
    }

    /// Parse a TOML document without environment overrides
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(source)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.apply_global();
        config.validate()?;

        Ok(config)
    }

    /// Fill every unset target/provider field from the global section.
    pub fn apply_global(&mut self) {
        for target in &mut self.targets {
            while target.endpoint.ends_with('/') {
                target.endpoint.pop();
            }
            if target.auth.is_none() {
                target.auth = self.global.client.auth.clone();
            }
            if target.insecure.is_none() {
                target.insecure = Some(self.global.client.insecure);
            }
            for (key, value) in &self.global.client.labels {
                target.labels.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        for provider in self.providers.values_mut() {
            if provider.interval.is_none() {
                provider.interval = Some(self.global.provider.interval);
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::missing_field("targets"));
        }

        for (index, target) in self.targets.iter().enumerate() {
            if target.endpoint.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("targets[{}].endpoint", index),
                    "endpoint must not be empty",
                ));
            }
            if let Some(auth) = &target.auth {
                if !self.auths.iter().any(|a| &a.name == auth) {
                    return Err(ConfigError::UnknownAuth {
                        endpoint: target.endpoint.clone(),
                        auth: auth.clone(),
                    });
                }
            }
        }

        let metrics = &self.server.metrics;
        if let Some(endpoint) = &metrics.endpoint {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    "server.metrics.endpoint",
                    "endpoint must not be empty when set",
                ));
            }
        }
        let api_path = metrics.api_path.trim().trim_end_matches('/');
        if metrics.mode == ExportMode::Http
            && !api_path.is_empty()
            && !api_path.ends_with(OTLP_HTTP_METRICS_PATH)
        {
            return Err(ConfigError::invalid_value(
                "server.metrics.api_path",
                format!("must end with {} in http mode", OTLP_HTTP_METRICS_PATH),
            ));
        }

        let min_interval = Duration::from_secs(MIN_PROVIDER_INTERVAL_SECS);
        if self.global.provider.interval < min_interval {
            return Err(ConfigError::invalid_value(
                "global.provider.interval",
                format!("must be at least {}s", MIN_PROVIDER_INTERVAL_SECS),
            ));
        }
        for (name, provider) in &self.providers {
            if provider.interval.map_or(false, |interval| interval < min_interval) {
                return Err(ConfigError::invalid_value(
                    format!("providers.{}.interval", name),
                    format!("must be at least {}s", MIN_PROVIDER_INTERVAL_SECS),
                ));
            }
            if InventoryKind::from_name(name).is_some() || name == EVENT_PROVIDER {
                if !provider.paths.is_empty() {
                    return Err(ConfigError::invalid_value(
                        format!("providers.{}.paths", name),
                        "fixed-field providers take no paths",
                    ));
                }
            }
            if provider.level.map_or(false, |level| level > MAX_EVENT_SEVERITY) {
                return Err(ConfigError::invalid_value(
                    format!("providers.{}.level", name),
                    format!("must be between 0 and {}", MAX_EVENT_SEVERITY),
                ));
            }
        }

        if self.global.timeout.is_zero() {
            return Err(ConfigError::invalid_value("global.timeout", "must be greater than zero"));
        }

        Ok(())
    }

    /// Targets with their credentials resolved
    pub fn resolve_targets(&self) -> Result<Vec<ResolvedTarget>, ConfigError> {
        self.targets
            .iter()
            .map(|target| {
                let credentials = match &target.auth {
                    Some(name) => {
                        let auth = self.auths.iter().find(|a| &a.name == name).ok_or_else(|| {
                            ConfigError::UnknownAuth {
                                endpoint: target.endpoint.clone(),
                                auth: name.clone(),
                            }
                        })?;
                        Some(Credentials {
                            user: auth.user.clone(),
                            password: auth.password.clone(),
                        })
                    }
                    None => None,
                };

                Ok(ResolvedTarget {
                    endpoint: target.endpoint.clone(),
                    credentials,
                    insecure: target.insecure.unwrap_or(self.global.client.insecure),
                    labels: target.labels.clone(),
                })
            })
            .collect()
    }

    /// Enabled counter groups, in name order
    pub fn enabled_providers(&self) -> Vec<ProviderPlan> {
        self.providers
            .iter()
            .filter(|(_, provider)| provider.enabled)
            .map(|(name, provider)| ProviderPlan {
                name: name.clone(),
                interval: provider.interval.unwrap_or(self.global.provider.interval),
                module: ProviderModule::for_provider(name, provider),
            })
            .collect()
    }

    /// Generate a sample configuration file
    pub fn generate_default_config() -> String {
        let mut sample = Self::default();
        sample.global.client.auth = Some("default".to_string());
        sample.server.metrics.endpoint = Some("http://localhost:4318".to_string());
        sample.server.metrics.api_path = OTLP_HTTP_METRICS_PATH.to_string();
        sample.auths.push(AuthConfig {
            name: "default".to_string(),
            user: "admin".to_string(),
            password: "changeme".to_string(),
        });
        sample.targets.push(TargetConfig {
            endpoint: "https://unity.example.com".to_string(),
            auth: None,
            insecure: None,
            labels: BTreeMap::from([("site".to_string(), "primary".to_string())]),
        });
        sample.providers.insert(
            "metric_a".to_string(),
            ProviderConfig {
                enabled: true,
                paths: vec![
                    "sp.*.cpu.summary.utilization".to_string(),
                    "sp.*.storage.lun.*.readsRate".to_string(),
                ],
                ..ProviderConfig::default()
            },
        );
        sample.providers.insert(
            "metric_b".to_string(),
            ProviderConfig {
                interval: Some(Duration::from_secs(300)),
                paths: vec!["sp.*.physical.disk.*.%".to_string()],
                ..ProviderConfig::default()
            },
        );
        sample.providers.insert(
            "capacity".to_string(),
            ProviderConfig {
                enabled: true,
                ..ProviderConfig::default()
            },
        );
        sample.providers.insert(
            "event".to_string(),
            ProviderConfig {
                level: Some(4),
                ..ProviderConfig::default()
            },
        );

        let body = toml::to_string_pretty(&sample)
            .unwrap_or_else(|e| format!("# failed to render sample configuration: {}\n", e));

        format!(
            "# {} configuration\n\
             # Generated by {} v{}\n\
             #\n\
             # Paths ending in '%' match every catalog path containing the text before it.\n\
             # 'system', 'capacity', 'lun' and 'event' are fixed-field providers and take no paths.\n\
             # Environment overrides use the UNISPHERE_ prefix, e.g. UNISPHERE_GLOBAL__TIMEOUT=10s\n\n{}",
            EXPORTER_FULL_NAME, EXPORTER_NAME, EXPORTER_VERSION, body
        )
    }
}

// ----------------------------------------------------------------------------
// 5.2 Global Defaults
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Deadline for a single array API call
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub client: GlobalClientConfig,

    #[serde(default)]
    pub provider: GlobalProviderConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
            client: GlobalClientConfig::default(),
            provider: GlobalProviderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,

    #[serde(default)]
    pub insecure: bool,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalProviderConfig {
    #[serde(default = "default_provider_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for GlobalProviderConfig {
    fn default() -> Self {
        Self {
            interval: default_provider_interval(),
        }
    }
}

fn default_provider_interval() -> Duration {
    Duration::from_secs(DEFAULT_PROVIDER_INTERVAL_SECS)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.3 Export Destination
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub metrics: OtlpConfig,
}

/// OTLP metrics endpoint. Without an endpoint observations are only logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtlpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// HTTP only: full request path, which must end in `/v1/metrics`
    /// (e.g. `/otlp/v1/metrics` behind a path-routing proxy). Empty means
    /// `/v1/metrics`. Ignored for gRPC.
    #[serde(default)]
    pub api_path: String,

    #[serde(default)]
    pub mode: ExportMode,

    /// Talk plaintext to the collector. Scheme-less endpoints get `http://`
    /// when set and `https://` otherwise, and an `https://` endpoint is
    /// downgraded to `http://`.
    #[serde(default)]
    pub insecure: bool,
}

impl OtlpConfig {
    /// Endpoint handed to the OTLP exporter, or `None` when export is off.
    ///
    /// The HTTP exporter appends `/v1/metrics` on its own, so only the part
    /// of `api_path` in front of it is kept here.
    pub fn exporter_endpoint(&self) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?.trim().trim_end_matches('/');
        let endpoint = match endpoint.split_once("://") {
            Some(("https", rest)) if self.insecure => format!("http://{}", rest),
            Some(_) => endpoint.to_string(),
            None if self.insecure => format!("http://{}", endpoint),
            None => format!("https://{}", endpoint),
        };

        Some(match self.mode {
            ExportMode::Http => format!("{}{}", endpoint, self.http_path_prefix()),
            ExportMode::Grpc => endpoint,
        })
    }

    /// Where metrics end up, for display.
    pub fn collector_url(&self) -> Option<String> {
        let endpoint = self.exporter_endpoint()?;
        Some(match self.mode {
            ExportMode::Http => format!("{}{}", endpoint, OTLP_HTTP_METRICS_PATH),
            ExportMode::Grpc => endpoint,
        })
    }

    fn http_path_prefix(&self) -> &str {
        let path = self.api_path.trim().trim_end_matches('/');
        path.strip_suffix(OTLP_HTTP_METRICS_PATH).unwrap_or(path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    #[default]
    Http,
    Grpc,
}

// ----------------------------------------------------------------------------
// 5.4 Targets & Credentials
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the Unisphere management interface
    pub endpoint: String,

    /// Name of an entry in `auths`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,

    /// Skip TLS certificate verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    /// Extra attributes attached to every observation from this array
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub name: String,
    pub user: String,
    pub password: String,
}

impl Debug for AuthConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A target after global defaults and auth references are resolved.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub endpoint: String,
    pub credentials: Option<Credentials>,
    pub insecure: bool,
    pub labels: BTreeMap<String, String>,
}

// ----------------------------------------------------------------------------
// 5.5 Providers
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,

    /// Literal paths or `%`-suffixed substring patterns
    #[serde(default)]
    pub paths: Vec<String>,

    /// `event` only: least severe code forwarded, from 0 (`EMERGENCY`) to
    /// 8 (`OK`). Defaults to 8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

/// An enabled provider ready to be started against each target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPlan {
    pub name: String,
    pub interval: Duration,
    pub module: ProviderModule,
}

/// What a provider collects, decided by its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderModule {
    /// Real-time metric paths from the catalog
    Metric { patterns: Vec<PathPattern> },
    /// Fixed fields of an instance collection
    Inventory(InventoryKind),
    /// Array event log
    Event { level: u8 },
}

impl ProviderModule {
    pub fn for_provider(name: &str, config: &ProviderConfig) -> Self {
        if let Some(kind) = InventoryKind::from_name(name) {
            return ProviderModule::Inventory(kind);
        }
        if name == EVENT_PROVIDER {
            return ProviderModule::Event {
                level: config.level.unwrap_or(MAX_EVENT_SEVERITY),
            };
        }
        ProviderModule::Metric {
            patterns: config.paths.iter().map(|raw| PathPattern::parse(raw)).collect(),
        }
    }

    /// Whether the provider reports through a `MetricsBackend`
    pub fn exports_metrics(&self) -> bool {
        !matches!(self, ProviderModule::Event { .. })
    }
}

impl Display for ProviderModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProviderModule::Metric { patterns } => {
                let rendered: Vec<String> = patterns.iter().map(ToString::to_string).collect();
                write!(f, "paths [{}]", rendered.join(", "))
            }
            ProviderModule::Inventory(kind) => write!(f, "{} fields", kind),
            ProviderModule::Event { level } => write!(f, "events at severity <= {}", level),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING SETUP
// ============================================================================

/// Initialize the logging system
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let parsed = config.level.parse::<LevelFilter>().ok();
    let level = parsed.unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(output_layer(config))
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber { message: e.to_string() })?;

    if parsed.is_none() {
        warn!(target: "unisphere::logging", level = %config.level, "Unknown log level, using info");
    }
    debug!(target: "unisphere::logging", %level, format = ?config.format, "Log subscriber installed");

    Ok(())
}

fn output_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let location = config.source_location;
    match config.format {
        LogFormat::Json => tracing_fmt::layer()
            .json()
            .flatten_event(true)
            .with_file(location)
            .with_line_number(location)
            .boxed(),
        LogFormat::Compact => tracing_fmt::layer().compact().with_ansi(config.colors).boxed(),
        LogFormat::Pretty => tracing_fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_file(location)
            .with_line_number(location)
            .boxed(),
    }
}

/// Performance timer for measuring operation duration
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold: Option<Duration>,
}

impl PerfTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold: Duration) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold: Some(threshold),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();

        match self.threshold {
            Some(threshold) if elapsed > threshold => {
                warn!(
                    target: "unisphere::perf",
                    operation = self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "Operation exceeded threshold"
                );
            }
            _ => {
                trace!(
                    target: "unisphere::perf",
                    operation = self.name,
                    elapsed_us = elapsed.as_micros() as u64,
                    "Operation completed"
                );
            }
        }

        elapsed
    }
}

// ============================================================================
// SECTION 7: CATALOG MATCHER
// ============================================================================

/// Operator-supplied selector for catalog paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathPattern {
    /// Matches one path exactly
    Literal(String),
    /// Matches every path containing the text anywhere
    Contains(String),
}

impl PathPattern {
    /// Parses a configured pattern. A trailing `%` turns it into a substring
    /// pattern with every `%` removed; anything else is literal.
    pub fn parse(raw: &str) -> Self {
        if raw.ends_with(PREFIX_PATTERN_SENTINEL) {
            PathPattern::Contains(raw.replace(PREFIX_PATTERN_SENTINEL, ""))
        } else {
            PathPattern::Literal(raw.to_string())
        }
    }

    #[inline]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Literal(literal) => path == literal,
            PathPattern::Contains(fragment) => path.contains(fragment.as_str()),
        }
    }
}

impl Display for PathPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Literal(literal) => f.write_str(literal),
            PathPattern::Contains(fragment) => write!(f, "{}{}", fragment, PREFIX_PATTERN_SENTINEL),
        }
    }
}

/// Selects the catalog entries matched by at least one pattern.
///
/// Result order follows the catalog; each path appears once no matter how many
/// patterns select it.
pub fn match_catalog(catalog: &[CatalogEntry], patterns: &[PathPattern]) -> Vec<CatalogEntry> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(catalog.len());

    catalog
        .iter()
        .filter(|entry| patterns.iter().any(|pattern| pattern.matches(&entry.path)))
        .filter(|entry| seen.insert(entry.path.as_str()))
        .cloned()
        .collect()
}

// ============================================================================
// SECTION 8: TYPE CLASSIFIER
// ============================================================================

/// Outcome of classifying a catalog type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Counter,
    Gauge,
    Unsupported,
}

impl Classification {
    pub fn classify(type_code: i32) -> Self {
        match type_code {
            2 | 3 | 7 | 8 => Classification::Counter,
            4 | 5 => Classification::Gauge,
            _ => Classification::Unsupported,
        }
    }

    pub fn kind(self) -> Option<MetricKind> {
        match self {
            Classification::Counter => Some(MetricKind::Counter),
            Classification::Gauge => Some(MetricKind::Gauge),
            Classification::Unsupported => None,
        }
    }
}

// ============================================================================
// SECTION 9: DESCRIPTOR SYNTHESIZER
// ============================================================================

/// Derives the instrument name for a catalog path.
///
/// `sp.*.cpu.summary.utilization` becomes `unisphere_sp_cpu_summary_utilization`.
pub fn instrument_name(path: &str) -> String {
    let collapsed = path.to_lowercase().replace(MULTI_SEGMENT_WILDCARD, "_");
    let mut name = String::with_capacity(METRIC_NAME_PREFIX.len() + collapsed.len());
    name.push_str(METRIC_NAME_PREFIX);
    name.push_str(&collapsed.replace(PATH_SEPARATOR, "_"));
    name
}

/// Label names for each wildcard of `path`, left to right.
///
/// A wildcard takes the name of the closest literal segment before it. Repeated
/// names get an ordinal suffix so every dimension keeps its own attribute key.
pub fn label_names(path: &str) -> LabelNames {
    let mut names = LabelNames::new();
    let mut last_literal: Option<&str> = None;

    for segment in path.split(PATH_SEPARATOR) {
        if segment != WILDCARD_SEGMENT {
            last_literal = Some(segment);
            continue;
        }

        let base = last_literal.unwrap_or(FALLBACK_DIMENSION_LABEL);
        let mut name = CompactString::from(base);
        let mut ordinal = 2;
        while names.contains(&name) {
            name = CompactString::from(format!("{}_{}", base, ordinal));
            ordinal += 1;
        }
        names.push(name);
    }

    names
}

impl MetricDescriptor {
    /// Builds the descriptor of a supported catalog entry.
    pub fn synthesize(entry: &CatalogEntry, kind: MetricKind) -> Self {
        Self {
            key: entry.path.clone(),
            name: instrument_name(&entry.path),
            description: entry.description.clone(),
            unit: entry.unit.to_lowercase(),
            kind,
        }
    }
}

/// Classifies matched entries and synthesizes descriptors for the supported ones.
pub fn build_descriptors(provider: &str, matched: &[CatalogEntry]) -> Vec<MetricDescriptor> {
    matched
        .iter()
        .filter_map(|entry| match Classification::classify(entry.type_code).kind() {
            Some(kind) => Some(MetricDescriptor::synthesize(entry, kind)),
            None if entry.type_code == NON_NUMERIC_TYPE_CODE => {
                info!(
                    target: "unisphere::pipeline",
                    provider = %provider,
                    path = %entry.path,
                    "Skipping path with non-numeric values"
                );
                None
            }
            None => {
                info!(
                    target: "unisphere::pipeline",
                    provider = %provider,
                    path = %entry.path,
                    type_code = entry.type_code,
                    "Skipping path with unsupported type code"
                );
                None
            }
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 9.1 Instrument Registry
// ----------------------------------------------------------------------------

/// The fixed instrument set of one provider, in catalog order.
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    descriptors: Vec<MetricDescriptor>,
    by_key: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor. Returns `Ok(false)` when the key is already present
    /// and an error when a different key already owns the same name.
    pub fn insert(&mut self, descriptor: MetricDescriptor) -> PipelineResult<bool> {
        if self.by_key.contains_key(&descriptor.key) {
            return Ok(false);
        }

        if let Some(&existing) = self.by_name.get(&descriptor.name) {
            return Err(PipelineError::InstrumentNameCollision {
                name: descriptor.name,
                existing_key: self.descriptors[existing].key.clone(),
                key: descriptor.key,
            });
        }

        let index = self.descriptors.len();
        self.by_key.insert(descriptor.key.clone(), index);
        self.by_name.insert(descriptor.name.clone(), index);
        self.descriptors.push(descriptor);
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<&MetricDescriptor> {
        self.by_key.get(key).map(|&index| &self.descriptors[index])
    }

    pub fn descriptors(&self) -> &[MetricDescriptor] {
        &self.descriptors
    }

    /// Paths in registration order, as sent in the real-time query
    pub fn paths(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// ============================================================================
// SECTION 10: QUERY LIFECYCLE MANAGER
// ============================================================================

/// The real-time query of one provider.
///
/// Unregistered until a create call succeeds. `invalidate` drops the id so the
/// next `ensure_registered` creates a new query before anything is fetched.
#[derive(Debug, Clone)]
pub struct RealtimeQuery {
    id: Option<QueryId>,
    paths: Vec<String>,
    interval: Duration,
    capacity: usize,
    fresh: bool,
    registrations: u64,
}

impl RealtimeQuery {
    pub fn new(paths: Vec<String>, interval: Duration) -> PipelineResult<Self> {
        Self::with_capacity(paths, interval, REALTIME_QUERY_MAX_PATHS)
    }

    pub fn with_capacity(paths: Vec<String>, interval: Duration, capacity: usize) -> PipelineResult<Self> {
        if paths.len() > capacity {
            return Err(PipelineError::CapacityExceeded {
                count: paths.len(),
                capacity,
            });
        }

        Ok(Self {
            id: None,
            paths,
            interval,
            capacity,
            fresh: false,
            registrations: 0,
        })
    }

    pub fn id(&self) -> Option<&QueryId> {
        self.id.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of successful create calls so far
    pub fn registrations(&self) -> u64 {
        self.registrations
    }

    /// Returns the live query id, creating a query on the array if needed.
    pub async fn ensure_registered(&mut self, api: &dyn ArrayApi, timeout: Duration) -> ApiResult<QueryId> {
        if let Some(id) = &self.id {
            return Ok(id.clone());
        }

        let id = call_with_timeout(
            "create_realtime_query",
            timeout,
            api.create_realtime_query(&self.paths, self.interval),
        )
        .await?;

        debug!(
            target: "unisphere::query",
            query_id = %id,
            paths = self.paths.len(),
            interval_secs = self.interval.as_secs(),
            "Registered real-time query"
        );

        self.id = Some(id.clone());
        self.fresh = true;
        self.registrations += 1;
        Ok(id)
    }

    /// Whether the current id has not been fetched from yet. Clears the flag.
    pub fn take_fresh(&mut self) -> bool {
        std::mem::replace(&mut self.fresh, false)
    }

    /// Forgets the current id. Returns it if there was one.
    pub fn invalidate(&mut self) -> Option<QueryId> {
        self.fresh = false;
        self.id.take()
    }
}

// ============================================================================
// SECTION 11: RESULT DECODER
// ============================================================================

/// Leaf counts of one decode pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeReport {
    pub emitted: usize,
    pub skipped: usize,
}

impl AddAssign for DecodeReport {
    fn add_assign(&mut self, other: Self) {
        self.emitted += other.emitted;
        self.skipped += other.skipped;
    }
}

struct DecodeContext<'a> {
    path: &'a str,
    label_names: &'a [CompactString],
    client_labels: &'a [Label],
    report: DecodeReport,
}

/// Walks the value tree of `path` and emits one observation per numeric leaf.
///
/// Map keys at depth `d` become the value of `label_names[d]`. Each observation
/// carries `client_labels` first, then the dimension labels in wildcard order.
/// Leaves at the wrong depth or with non-numeric text are skipped with a
/// warning; their siblings are still decoded.
pub fn decode(
    path: &str,
    tree: &ResultValue,
    label_names: &[CompactString],
    client_labels: &[Label],
    sink: &mut dyn ObservationSink,
) -> DecodeReport {
    let mut context = DecodeContext {
        path,
        label_names,
        client_labels,
        report: DecodeReport::default(),
    };
    let mut dimensions: SmallVec<[CompactString; 4]> = SmallVec::new();

    walk(&mut context, tree, &mut dimensions, sink);
    context.report
}

fn walk(
    context: &mut DecodeContext<'_>,
    node: &ResultValue,
    dimensions: &mut SmallVec<[CompactString; 4]>,
    sink: &mut dyn ObservationSink,
) {
    let depth = dimensions.len();

    match node {
        ResultValue::Leaf(raw) => {
            if depth != context.label_names.len() {
                warn!(
                    target: "unisphere::decoder",
                    path = %context.path,
                    depth,
                    wildcards = context.label_names.len(),
                    "Leaf depth does not match wildcard count, skipping"
                );
                context.report.skipped += 1;
                return;
            }

            let value = match raw.trim().parse::<f64>() {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        target: "unisphere::decoder",
                        path = %context.path,
                        dimensions = ?dimensions.as_slice(),
                        value = %raw,
                        error = %e,
                        "Malformed leaf value, skipping"
                    );
                    context.report.skipped += 1;
                    return;
                }
            };

            let mut labels: Labels = SmallVec::with_capacity(context.client_labels.len() + depth);
            labels.extend(context.client_labels.iter().cloned());
            labels.extend(
                context
                    .label_names
                    .iter()
                    .zip(dimensions.iter())
                    .map(|(name, value)| Label::new(name.clone(), value.clone())),
            );

            sink.observe(Observation {
                key: context.path.to_string(),
                value,
                labels,
            });
            context.report.emitted += 1;
        }
        ResultValue::Node(children) => {
            if depth >= context.label_names.len() && !children.is_empty() {
                let skipped = node.leaf_count();
                warn!(
                    target: "unisphere::decoder",
                    path = %context.path,
                    depth,
                    wildcards = context.label_names.len(),
                    skipped,
                    "Result nested deeper than wildcard count, skipping subtree"
                );
                context.report.skipped += skipped;
                return;
            }

            for (key, child) in children {
                dimensions.push(CompactString::from(key.as_str()));
                walk(context, child, dimensions, sink);
                dimensions.pop();
            }
        }
    }
}

// ============================================================================
// SECTION 12: METRICS BACKENDS
// ============================================================================

/// Where a provider's instruments live and its observations go.
///
/// `declare_instrument` is called once per descriptor, then `seal` once. After
/// that only `publish` is called, once per cycle, with the complete snapshot
/// of that cycle (empty after a failed cycle).
pub trait MetricsBackend: Send + Sync {
    fn declare_instrument(&self, descriptor: &MetricDescriptor) -> PipelineResult<()>;

    fn seal(&self) -> PipelineResult<()> {
        Ok(())
    }

    fn publish(&self, observations: Vec<Observation>);

    fn close(&self) {}
}

// ----------------------------------------------------------------------------
// 12.1 OpenTelemetry Backend
// ----------------------------------------------------------------------------

#[derive(Clone)]
enum OtelInstrument {
    Counter(ObservableCounter<f64>),
    Gauge(ObservableGauge<f64>),
}

impl OtelInstrument {
    fn as_any(&self) -> Arc<dyn Any> {
        match self {
            OtelInstrument::Counter(counter) => counter.as_any(),
            OtelInstrument::Gauge(gauge) => gauge.as_any(),
        }
    }

    fn observe(&self, observer: &dyn Observer, value: f64, attributes: &[KeyValue]) {
        match self {
            OtelInstrument::Counter(counter) => observer.observe_f64(counter, value, attributes),
            OtelInstrument::Gauge(gauge) => observer.observe_f64(gauge, value, attributes),
        }
    }
}

/// Observable OpenTelemetry instruments fed from the latest published snapshot.
///
/// The meter callback runs on the SDK's collection schedule and only reads the
/// snapshot; it never calls the array.
pub struct OtelBackend {
    meter: Meter,
    instruments: Mutex<HashMap<String, OtelInstrument>>,
    snapshot: Arc<ArcSwap<Vec<Observation>>>,
    registration: Mutex<Option<Box<dyn CallbackRegistration>>>,
}

impl OtelBackend {
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            instruments: Mutex::new(HashMap::new()),
            snapshot: Arc::new(ArcSwap::from_pointee(Vec::new())),
            registration: Mutex::new(None),
        }
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.lock().len()
    }

    /// Observations the next collection will report
    pub fn current_snapshot(&self) -> Arc<Vec<Observation>> {
        self.snapshot.load_full()
    }
}

impl MetricsBackend for OtelBackend {
    fn declare_instrument(&self, descriptor: &MetricDescriptor) -> PipelineResult<()> {
        let declared = match descriptor.kind {
            MetricKind::Counter => self
                .meter
                .f64_observable_counter(descriptor.name.clone())
                .with_description(descriptor.description.clone())
                .with_unit(Unit::new(descriptor.unit.clone()))
                .try_init()
                .map(OtelInstrument::Counter),
            MetricKind::Gauge => self
                .meter
                .f64_observable_gauge(descriptor.name.clone())
                .with_description(descriptor.description.clone())
                .with_unit(Unit::new(descriptor.unit.clone()))
                .try_init()
                .map(OtelInstrument::Gauge),
        };

        let instrument = declared.map_err(|e| PipelineError::InstrumentRegistration {
            name: descriptor.name.clone(),
            message: e.to_string(),
        })?;

        self.instruments.lock().insert(descriptor.key.clone(), instrument);
        Ok(())
    }

    fn seal(&self) -> PipelineResult<()> {
        let instruments = Arc::new(self.instruments.lock().clone());
        if instruments.is_empty() {
            return Ok(());
        }

        let handles: Vec<Arc<dyn Any>> = instruments.values().map(OtelInstrument::as_any).collect();
        let snapshot = Arc::clone(&self.snapshot);

        let registration = self
            .meter
            .register_callback(&handles, move |observer: &dyn Observer| {
                let current = snapshot.load();
                for observation in current.iter() {
                    let Some(instrument) = instruments.get(&observation.key) else {
                        continue;
                    };
                    let attributes: Vec<KeyValue> = observation
                        .labels
                        .iter()
                        .map(|label| KeyValue::new(label.key.to_string(), label.value.to_string()))
                        .collect();
                    instrument.observe(observer, observation.value, &attributes);
                }
            })
            .map_err(|e| PipelineError::InstrumentRegistration {
                name: "observation callback".to_string(),
                message: e.to_string(),
            })?;

        *self.registration.lock() = Some(registration);
        Ok(())
    }

    fn publish(&self, observations: Vec<Observation>) {
        self.snapshot.store(Arc::new(observations));
    }

    fn close(&self) {
        self.snapshot.store(Arc::new(Vec::new()));
        let registration = self.registration.lock().take();
        if let Some(mut registration) = registration {
            if let Err(e) = registration.unregister() {
                warn!(
                    target: "unisphere::otel",
                    error = %e,
                    "Failed to unregister observation callback"
                );
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 12.2 Tracing Backend
// ----------------------------------------------------------------------------

/// Logs observations instead of exporting them. Used when no metrics endpoint
/// is configured.
#[derive(Debug)]
pub struct TracingBackend {
    provider: String,
    names: Mutex<HashMap<String, String>>,
}

impl TracingBackend {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            names: Mutex::new(HashMap::new()),
        }
    }
}

impl MetricsBackend for TracingBackend {
    fn declare_instrument(&self, descriptor: &MetricDescriptor) -> PipelineResult<()> {
        debug!(
            target: "unisphere::backend",
            provider = %self.provider,
            name = %descriptor.name,
            kind = %descriptor.kind,
            unit = %descriptor.unit,
            "Declared instrument"
        );
        self.names.lock().insert(descriptor.key.clone(), descriptor.name.clone());
        Ok(())
    }

    fn publish(&self, observations: Vec<Observation>) {
        let names = self.names.lock();
        for observation in &observations {
            let name = names.get(&observation.key).map(String::as_str).unwrap_or(observation.key.as_str());
            let labels: Vec<String> = observation.labels.iter().map(Label::to_string).collect();
            info!(
                target: "unisphere::backend",
                provider = %self.provider,
                metric = %name,
                value = observation.value,
                labels = %labels.join(","),
                "Observation"
            );
        }
    }
}

// ----------------------------------------------------------------------------
// 12.3 OTLP Meter Provider
// ----------------------------------------------------------------------------

/// Builds the OTLP meter provider of one provider instance, or `None` when no
/// metrics endpoint is configured.
pub fn build_meter_provider(
    config: &OtlpConfig,
    interval: Duration,
    timeout: Duration,
) -> Result<Option<SdkMeterProvider>, TelemetryError> {
    let Some(url) = config.exporter_endpoint() else {
        return Ok(None);
    };

    let resource = Resource::new(vec![KeyValue::new("service.name", SERVICE_NAME)]);
    let pipeline = opentelemetry_otlp::new_pipeline().metrics(opentelemetry_sdk::runtime::Tokio);

    let built = match config.mode {
        ExportMode::Http => pipeline
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(url.clone())
                    .with_timeout(timeout),
            )
            .with_period(interval)
            .with_resource(resource)
            .build(),
        ExportMode::Grpc => pipeline
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(url.clone())
                    .with_timeout(timeout),
            )
            .with_period(interval)
            .with_resource(resource)
            .build(),
    };

    built.map(Some).map_err(|e| TelemetryError::PipelineBuild {
        endpoint: url,
        message: e.to_string(),
    })
}

// ============================================================================
// SECTION 13: ARRAY API
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Array API Trait
// ----------------------------------------------------------------------------

/// The management API calls the pipeline needs from an array.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArrayApi: Send + Sync {
    /// Counter paths available for real-time queries
    async fn fetch_catalog(&self) -> ApiResult<Vec<CatalogEntry>>;

    /// Registers a real-time query sampling `paths` every `interval`
    async fn create_realtime_query(&self, paths: &[String], interval: Duration) -> ApiResult<QueryId>;

    /// Latest result of a query. `QueryNotFound` once the array dropped it.
    async fn fetch_query_result(&self, query_id: &QueryId) -> ApiResult<Vec<QueryResultEntry>>;

    async fn fetch_system_identity(&self) -> ApiResult<SystemIdentity>;

    async fn fetch_basic_system_info(&self) -> ApiResult<Vec<BasicSystemInfo>>;

    async fn fetch_mgmt_interfaces(&self) -> ApiResult<Vec<MgmtInterface>>;

    async fn fetch_system_capacity(&self) -> ApiResult<Vec<SystemCapacity>>;

    async fn fetch_luns(&self) -> ApiResult<Vec<LunInstance>>;

    /// Events created after `since`, an RFC 3339 timestamp in UTC
    async fn fetch_events(&self, since: &str) -> ApiResult<EventPage>;
}

// ----------------------------------------------------------------------------
// 13.2 Response Parsing
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Collection<T> {
    #[serde(default)]
    entries: Vec<Entry<T>>,
}

#[derive(Deserialize)]
struct Entry<T> {
    content: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricContent {
    #[serde(default)]
    path: String,
    #[serde(default, rename = "type")]
    type_code: i32,
    #[serde(default)]
    description: String,
    #[serde(default)]
    unit_display_string: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultContent {
    #[serde(default)]
    path: String,
    #[serde(default)]
    values: ResultValue,
}

#[derive(Deserialize)]
struct CreatedContent {
    id: JsonValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemContent {
    #[serde(default)]
    name: String,
    #[serde(default)]
    serial_number: String,
}

#[derive(Deserialize)]
struct EventCollection {
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    entries: Vec<Entry<ArrayEvent>>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    messages: Vec<HashMap<String, JsonValue>>,
}

fn parse_body<T: DeserializeOwned>(url: &str, body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidResponse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// Parses a metric catalog response, dropping entries without a path.
pub fn parse_catalog(url: &str, body: &[u8]) -> ApiResult<Vec<CatalogEntry>> {
    let collection: Collection<MetricContent> = parse_body(url, body)?;
    Ok(collection
        .entries
        .into_iter()
        .map(|entry| entry.content)
        .filter(|content| !content.path.is_empty())
        .map(|content| CatalogEntry {
            path: content.path,
            type_code: content.type_code,
            description: content.description,
            unit: content.unit_display_string,
        })
        .collect())
}

pub fn parse_query_result(url: &str, body: &[u8]) -> ApiResult<Vec<QueryResultEntry>> {
    let collection: Collection<QueryResultContent> = parse_body(url, body)?;
    Ok(collection
        .entries
        .into_iter()
        .map(|entry| QueryResultEntry {
            path: entry.content.path,
            tree: entry.content.values,
        })
        .collect())
}

pub fn parse_query_created(url: &str, body: &[u8]) -> ApiResult<QueryId> {
    let created: Entry<CreatedContent> = parse_body(url, body)?;
    match created.content.id {
        JsonValue::Number(id) => Ok(QueryId::new(id.to_string())),
        JsonValue::String(id) if !id.is_empty() => Ok(QueryId::new(id)),
        other => Err(ApiError::InvalidResponse {
            url: url.to_string(),
            message: format!("unexpected query id {}", other),
        }),
    }
}

pub fn parse_system_identity(url: &str, body: &[u8]) -> ApiResult<SystemIdentity> {
    let collection: Collection<SystemContent> = parse_body(url, body)?;
    collection
        .entries
        .into_iter()
        .next()
        .map(|entry| SystemIdentity {
            name: entry.content.name,
            serial_number: entry.content.serial_number,
        })
        .ok_or_else(|| ApiError::InvalidResponse {
            url: url.to_string(),
            message: "no system instance returned".to_string(),
        })
}

/// Contents of a compact instance collection.
pub fn parse_instances<T: DeserializeOwned>(url: &str, body: &[u8]) -> ApiResult<Vec<T>> {
    let collection: Collection<T> = parse_body(url, body)?;
    Ok(collection.entries.into_iter().map(|entry| entry.content).collect())
}

pub fn parse_event_page(url: &str, body: &[u8]) -> ApiResult<EventPage> {
    let collection: EventCollection = parse_body(url, body)?;
    Ok(EventPage {
        updated: collection.updated,
        events: collection.entries.into_iter().map(|entry| entry.content).collect(),
    })
}

/// Extracts the `en-US` message of a 422 error body.
pub fn parse_error_message(body: &[u8]) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
    parsed
        .error
        .messages
        .iter()
        .find_map(|message| message.get("en-US").and_then(JsonValue::as_str))
        .map(str::to_string)
}

// ----------------------------------------------------------------------------
// 13.3 Unisphere REST Client
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionState {
    established: bool,
    csrf_token: Option<String>,
    rejected_at: Option<Instant>,
}

/// [`ArrayApi`] over the Unisphere REST interface.
///
/// Basic credentials are sent until the array hands out a session cookie.
/// POSTs carry the CSRF token the array returned on an earlier response.
pub struct UnisphereClient {
    endpoint: String,
    credentials: Option<Credentials>,
    timeout: Duration,
    http: HttpClient,
    session: Mutex<SessionState>,
}

impl Debug for UnisphereClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnisphereClient")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl UnisphereClient {
    pub fn new(target: &ResolvedTarget, timeout: Duration) -> ApiResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(EMC_REST_CLIENT_HEADER, HeaderValue::from_static("true"));

        let http = HttpClient::builder()
            .timeout(timeout)
            .cookie_store(true)
            .danger_accept_invalid_certs(target.insecure)
            .default_headers(headers)
            .user_agent(format!("{}/{}", EXPORTER_NAME, EXPORTER_VERSION))
            .build()
            .map_err(|e| ApiError::ConnectionFailed {
                endpoint: target.endpoint.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            endpoint: target.endpoint.clone(),
            credentials: target.credentials.clone(),
            timeout,
            http,
            session: Mutex::new(SessionState::default()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.endpoint, path_and_query)
    }

    fn authorize(&self, request: RequestBuilder) -> ApiResult<RequestBuilder> {
        let session = self.session.lock();
        if session.established {
            return Ok(request);
        }

        if let Some(rejected_at) = session.rejected_at {
            if rejected_at.elapsed() < Duration::from_secs(AUTH_RETRY_BACKOFF_SECS) {
                return Err(ApiError::Unauthorized {
                    endpoint: self.endpoint.clone(),
                    message: "login recently rejected, backing off".to_string(),
                });
            }
        }

        Ok(match &self.credentials {
            Some(credentials) => request.basic_auth(&credentials.user, Some(&credentials.password)),
            None => request,
        })
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> ApiResult<Vec<u8>> {
        let request = self.authorize(request)?;

        let response = request.send().await.map_err(|e| self.transport_error(url, e))?;
        let status = response.status();
        let csrf_token = response
            .headers()
            .get(EMC_CSRF_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| self.transport_error(url, e))?;

        if status.is_success() {
            let mut session = self.session.lock();
            session.established = true;
            session.rejected_at = None;
            if csrf_token.is_some() {
                session.csrf_token = csrf_token;
            }
            drop(session);
            return Ok(body.to_vec());
        }

        match status {
            StatusCode::UNAUTHORIZED => {
                *self.session.lock() = SessionState {
                    rejected_at: Some(Instant::now()),
                    ..SessionState::default()
                };
                warn!(
                    target: "unisphere::client",
                    endpoint = %self.endpoint,
                    "Array rejected credentials, session reset"
                );
                Err(ApiError::Unauthorized {
                    endpoint: self.endpoint.clone(),
                    message: status.to_string(),
                })
            }
            StatusCode::UNPROCESSABLE_ENTITY => Err(ApiError::UnprocessableEntity {
                message: parse_error_message(&body).unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned()),
            }),
            other => Err(ApiError::HttpStatus {
                status_code: other.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    fn transport_error(&self, url: &str, error: reqwest::Error) -> ApiError {
        if error.is_timeout() {
            ApiError::timeout(url, self.timeout)
        } else {
            ApiError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                message: error.to_string(),
            }
        }
    }

    async fn get(&self, path_and_query: &str) -> ApiResult<(String, Vec<u8>)> {
        let url = self.url(path_and_query);
        trace!(target: "unisphere::client", url = %url, "GET");
        let body = self.send(&url, self.http.get(&url)).await?;
        Ok((url, body))
    }

    async fn csrf_token(&self) -> ApiResult<String> {
        let cached = self.session.lock().csrf_token.clone();
        if let Some(token) = cached {
            return Ok(token);
        }

        let (url, _) = self.get(LOGIN_SESSION_PATH).await?;
        let issued = self.session.lock().csrf_token.clone();
        issued.ok_or_else(|| ApiError::InvalidResponse {
            url,
            message: "no CSRF token issued".to_string(),
        })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, payload: &B) -> ApiResult<(String, Vec<u8>)> {
        let token = self.csrf_token().await?;
        let url = self.url(path);
        let body = serde_json::to_vec(payload).map_err(|e| ApiError::InvalidRequest { message: e.to_string() })?;

        trace!(target: "unisphere::client", url = %url, "POST");
        let request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(EMC_CSRF_TOKEN_HEADER, token)
            .body(body);

        let body = self.send(&url, request).await?;
        Ok((url, body))
    }
}

#[derive(Serialize)]
struct RealtimeQueryRequest<'a> {
    paths: &'a [String],
    interval: u64,
}

#[async_trait]
impl ArrayApi for UnisphereClient {
    async fn fetch_catalog(&self) -> ApiResult<Vec<CatalogEntry>> {
        let (url, body) = self.get(METRIC_CATALOG_PATH).await?;
        parse_catalog(&url, &body)
    }

    async fn create_realtime_query(&self, paths: &[String], interval: Duration) -> ApiResult<QueryId> {
        if paths.len() > REALTIME_QUERY_MAX_PATHS {
            return Err(ApiError::InvalidRequest {
                message: format!(
                    "{} paths requested, a real-time query holds at most {}",
                    paths.len(),
                    REALTIME_QUERY_MAX_PATHS
                ),
            });
        }

        let request = RealtimeQueryRequest {
            paths,
            interval: interval.as_secs(),
        };
        let (url, body) = self.post(REALTIME_QUERY_PATH, &request).await?;
        parse_query_created(&url, &body)
    }

    async fn fetch_query_result(&self, query_id: &QueryId) -> ApiResult<Vec<QueryResultEntry>> {
        match self.get(&format!("{}{}", QUERY_RESULT_PATH, query_id)).await {
            Ok((url, body)) => parse_query_result(&url, &body),
            Err(ApiError::HttpStatus { status_code: 404, .. }) | Err(ApiError::UnprocessableEntity { .. }) => {
                Err(ApiError::QueryNotFound {
                    query_id: query_id.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_system_identity(&self) -> ApiResult<SystemIdentity> {
        let (url, body) = self.get(SYSTEM_PATH).await?;
        parse_system_identity(&url, &body)
    }

    async fn fetch_basic_system_info(&self) -> ApiResult<Vec<BasicSystemInfo>> {
        let (url, body) = self.get(BASIC_SYSTEM_INFO_PATH).await?;
        parse_instances(&url, &body)
    }

    async fn fetch_mgmt_interfaces(&self) -> ApiResult<Vec<MgmtInterface>> {
        let (url, body) = self.get(MGMT_INTERFACE_PATH).await?;
        parse_instances(&url, &body)
    }

    async fn fetch_system_capacity(&self) -> ApiResult<Vec<SystemCapacity>> {
        let (url, body) = self.get(SYSTEM_CAPACITY_PATH).await?;
        parse_instances(&url, &body)
    }

    async fn fetch_luns(&self) -> ApiResult<Vec<LunInstance>> {
        let (url, body) = self.get(LUN_PATH).await?;
        parse_instances(&url, &body)
    }

    async fn fetch_events(&self, since: &str) -> ApiResult<EventPage> {
        let (url, body) = self.get(&format!("{}%22{}%22", EVENT_PATH, since)).await?;
        parse_event_page(&url, &body)
    }
}

// ----------------------------------------------------------------------------
// 13.4 Target Identity
// ----------------------------------------------------------------------------

/// Client-level labels of one array: configured labels first, then
/// `host.name` and `instance` from the array's identity. `instance` falls back
/// to the endpoint when the identity cannot be fetched.
pub async fn resolve_client_labels(
    api: &dyn ArrayApi,
    endpoint: &str,
    custom: &BTreeMap<String, String>,
    timeout: Duration,
) -> Labels {
    let mut labels: Labels = custom
        .iter()
        .map(|(key, value)| Label::new(key.as_str(), value.as_str()))
        .collect();

    match call_with_timeout("fetch_system_identity", timeout, api.fetch_system_identity()).await {
        Ok(identity) => {
            labels.push(Label::new(HOST_NAME_LABEL, identity.name));
            labels.push(Label::new(INSTANCE_LABEL, identity.serial_number));
        }
        Err(e) => {
            warn!(
                target: "unisphere::client",
                endpoint = %endpoint,
                error = %e,
                "Failed to fetch system identity, using endpoint as instance"
            );
            labels.push(Label::new(INSTANCE_LABEL, endpoint));
        }
    }

    labels
}

/// A connected array and its client-level labels.
pub struct Target {
    pub endpoint: String,
    pub api: Arc<dyn ArrayApi>,
    pub labels: Labels,
}

impl Target {
    pub async fn connect(resolved: ResolvedTarget, timeout: Duration) -> ApiResult<Self> {
        let api: Arc<dyn ArrayApi> = Arc::new(UnisphereClient::new(&resolved, timeout)?);
        let labels = resolve_client_labels(api.as_ref(), &resolved.endpoint, &resolved.labels, timeout).await;

        info!(
            target: "unisphere::exporter",
            endpoint = %resolved.endpoint,
            labels = labels.len(),
            "Target connected"
        );

        Ok(Self {
            endpoint: resolved.endpoint,
            api,
            labels,
        })
    }
}

// ============================================================================
// SECTION 14: METRIC PROVIDER
// ============================================================================

/// Static settings of one provider instance.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub endpoint: String,
    pub interval: Duration,
    pub call_timeout: Duration,
    pub patterns: Vec<PathPattern>,
}

/// Per-provider counters, logged when the provider stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub cycles: u64,
    pub published_cycles: u64,
    pub failed_cycles: u64,
    pub stale_queries: u64,
    pub query_registrations: u64,
    pub observations: u64,
    pub skipped_leaves: u64,
}

/// What one collection cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No supported paths matched; nothing to collect
    Inert,
    /// A result was decoded and published
    Published(DecodeReport),
    /// The query was created moments ago and has no samples yet
    Pending,
    /// The array no longer knows the query; it is recreated next cycle
    QueryStale,
    RegistrationFailed,
    FetchFailed,
}

/// One counter group polled from one array.
///
/// The instrument set and path list are fixed at `start`. Only the query id
/// changes afterwards.
pub struct MetricProvider {
    settings: ProviderSettings,
    api: Arc<dyn ArrayApi>,
    backend: Arc<dyn MetricsBackend>,
    client_labels: Labels,
    registry: InstrumentRegistry,
    label_names: HashMap<String, LabelNames>,
    query: RealtimeQuery,
    stats: ProviderStats,
}

impl Debug for MetricProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricProvider")
            .field("name", &self.settings.name)
            .field("endpoint", &self.settings.endpoint)
            .field("instruments", &self.registry.len())
            .field("query", &self.query)
            .finish()
    }
}

impl MetricProvider {
    /// Builds the instrument set from the array's catalog, declares it on the
    /// backend and registers the initial query.
    ///
    /// Fails on an unreachable catalog, more supported paths than one query
    /// holds or colliding instrument names. A failed initial registration is
    /// only logged; the first cycle retries it.
    pub async fn start(
        settings: ProviderSettings,
        api: Arc<dyn ArrayApi>,
        backend: Arc<dyn MetricsBackend>,
        client_labels: Labels,
    ) -> PipelineResult<Self> {
        let timer = PerfTimer::new("provider_start");

        let catalog = call_with_timeout("fetch_catalog", settings.call_timeout, api.fetch_catalog())
            .await
            .map_err(|source| PipelineError::CatalogUnavailable {
                provider: settings.name.clone(),
                source,
            })?;

        let matched = match_catalog(&catalog, &settings.patterns);
        if matched.is_empty() {
            info!(
                target: "unisphere::provider",
                provider = %settings.name,
                endpoint = %settings.endpoint,
                patterns = settings.patterns.len(),
                "No catalog paths matched, provider is inert"
            );
        }

        let mut registry = InstrumentRegistry::new();
        for descriptor in build_descriptors(&settings.name, &matched) {
            registry.insert(descriptor)?;
        }

        let query = RealtimeQuery::new(registry.paths(), settings.interval)?;

        for descriptor in registry.descriptors() {
            backend.declare_instrument(descriptor)?;
        }
        backend.seal()?;

        let label_names = registry
            .descriptors()
            .iter()
            .map(|descriptor| (descriptor.key.clone(), self::label_names(&descriptor.key)))
            .collect();

        let mut provider = Self {
            settings,
            api,
            backend,
            client_labels,
            registry,
            label_names,
            query,
            stats: ProviderStats::default(),
        };

        if !provider.query.paths().is_empty() {
            if let Err(e) = provider
                .query
                .ensure_registered(provider.api.as_ref(), provider.settings.call_timeout)
                .await
            {
                warn!(
                    target: "unisphere::provider",
                    provider = %provider.settings.name,
                    endpoint = %provider.settings.endpoint,
                    error = %e,
                    "Initial real-time query registration failed, retrying next cycle"
                );
            }
        }

        info!(
            target: "unisphere::provider",
            provider = %provider.settings.name,
            endpoint = %provider.settings.endpoint,
            catalog = catalog.len(),
            matched = matched.len(),
            instruments = provider.registry.len(),
            elapsed_ms = timer.stop().as_millis() as u64,
            "Provider started"
        );

        Ok(provider)
    }

    pub fn descriptors(&self) -> &[MetricDescriptor] {
        self.registry.descriptors()
    }

    pub fn query(&self) -> &RealtimeQuery {
        &self.query
    }

    fn fail_cycle(&mut self, outcome: CycleOutcome) -> CycleOutcome {
        self.stats.failed_cycles += 1;
        self.backend.publish(Vec::new());
        outcome
    }

    pub async fn run(self, cancel: CancellationToken) -> ProviderStats {
        run_collector(Box::new(self), cancel).await
    }
}

#[async_trait]
impl Collector for MetricProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    fn interval(&self) -> Duration {
        self.settings.interval
    }

    fn stats(&self) -> ProviderStats {
        ProviderStats {
            query_registrations: self.query.registrations(),
            ..self.stats.clone()
        }
    }

    /// Runs one real-time query cycle and publishes its snapshot.
    async fn collect_cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;

        if self.query.paths().is_empty() {
            return CycleOutcome::Inert;
        }

        let query_id = match self
            .query
            .ensure_registered(self.api.as_ref(), self.settings.call_timeout)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    target: "unisphere::provider",
                    provider = %self.settings.name,
                    endpoint = %self.settings.endpoint,
                    error = %e,
                    "Real-time query registration failed"
                );
                return self.fail_cycle(CycleOutcome::RegistrationFailed);
            }
        };

        let fetched = call_with_timeout(
            "fetch_query_result",
            self.settings.call_timeout,
            self.api.fetch_query_result(&query_id),
        )
        .await;
        let fresh = self.query.take_fresh();

        let entries = match fetched {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) if fresh => {
                debug!(
                    target: "unisphere::provider",
                    provider = %self.settings.name,
                    query_id = %query_id,
                    "Query has no samples yet"
                );
                self.backend.publish(Vec::new());
                return CycleOutcome::Pending;
            }
            Ok(_) | Err(ApiError::QueryNotFound { .. }) => {
                warn!(
                    target: "unisphere::provider",
                    provider = %self.settings.name,
                    endpoint = %self.settings.endpoint,
                    query_id = %query_id,
                    "Real-time query is stale, recreating next cycle"
                );
                self.query.invalidate();
                self.stats.stale_queries += 1;
                return self.fail_cycle(CycleOutcome::QueryStale);
            }
            Err(e) => {
                warn!(
                    target: "unisphere::provider",
                    provider = %self.settings.name,
                    endpoint = %self.settings.endpoint,
                    query_id = %query_id,
                    error = %e,
                    "Failed to fetch query result"
                );
                return self.fail_cycle(CycleOutcome::FetchFailed);
            }
        };

        let mut observations = Vec::with_capacity(entries.len());
        let mut report = DecodeReport::default();
        for entry in &entries {
            let Some(names) = self.label_names.get(&entry.path) else {
                debug!(
                    target: "unisphere::provider",
                    provider = %self.settings.name,
                    path = %entry.path,
                    "Result for unregistered path ignored"
                );
                continue;
            };
            report += decode(&entry.path, &entry.tree, names, &self.client_labels, &mut observations);
        }

        self.stats.published_cycles += 1;
        self.stats.observations += report.emitted as u64;
        self.stats.skipped_leaves += report.skipped as u64;
        self.backend.publish(observations);

        CycleOutcome::Published(report)
    }

    fn close(&mut self) {
        self.backend.close();
    }
}

// ----------------------------------------------------------------------------
// 14.1 Collection Loop
// ----------------------------------------------------------------------------

/// A provider instance the collection loop can drive.
#[async_trait]
pub trait Collector: Send {
    fn name(&self) -> &str;

    fn endpoint(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Runs one cycle. Failures are logged and reported in the outcome.
    async fn collect_cycle(&mut self) -> CycleOutcome;

    fn stats(&self) -> ProviderStats;

    /// Called once after the last cycle
    fn close(&mut self) {}
}

/// Collects every interval until `cancel` fires. An in-flight cycle is
/// abandoned on cancellation.
pub async fn run_collector(mut collector: Box<dyn Collector>, cancel: CancellationToken) -> ProviderStats {
    let name = collector.name().to_string();
    let period = collector.interval();
    let mut ticker = interval_at(TokioInstant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        target: "unisphere::provider",
        provider = %name,
        endpoint = %collector.endpoint(),
        interval = %humantime::format_duration(period),
        "Provider collection loop started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let timer = PerfTimer::with_threshold("collect_cycle", period);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(target: "unisphere::provider", provider = %name, "Abandoning in-flight cycle");
                        break;
                    }
                    outcome = collector.collect_cycle() => {
                        trace!(target: "unisphere::provider", provider = %name, outcome = ?outcome, "Cycle complete");
                    }
                }
                timer.stop();
            }
        }
    }

    collector.close();
    collector.stats()
}

// ============================================================================
// SECTION 15: FIXED-FIELD PROVIDERS
// ============================================================================

/// Label names of the fixed-field instruments
pub const PRODUCT_NAME_LABEL: &str = "product.name";
pub const FIRMWARE_VERSION_LABEL: &str = "firmware.version";
pub const IP_ADDRESS_LABEL: &str = "ip.address";
pub const LUN_NAME_LABEL: &str = "lun.name";
pub const LUN_WWN_LABEL: &str = "lun.wwn";

pub const SYSTEM_INFO_METRIC: &str = "unisphere_system_info";

/// A gauge read from one numeric field of an instance.
pub struct FieldMetric<T> {
    pub name: &'static str,
    pub description: &'static str,
    pub unit: &'static str,
    pub read: fn(&T) -> f64,
}

impl<T> FieldMetric<T> {
    pub fn descriptor(&self) -> MetricDescriptor {
        MetricDescriptor {
            key: self.name.to_string(),
            name: self.name.to_string(),
            description: self.description.to_string(),
            unit: self.unit.to_string(),
            kind: MetricKind::Gauge,
        }
    }

    pub fn observe(&self, record: &T, labels: &Labels) -> Observation {
        Observation {
            key: self.name.to_string(),
            value: (self.read)(record),
            labels: labels.clone(),
        }
    }
}

pub const CAPACITY_METRICS: &[FieldMetric<SystemCapacity>] = &[
    FieldMetric {
        name: "unisphere_capacity_total_capacity",
        description: "Total capacity of the storage system",
        unit: "By",
        read: |capacity| capacity.size_total as f64,
    },
    FieldMetric {
        name: "unisphere_capacity_used_capacity",
        description: "Used capacity of the storage system",
        unit: "By",
        read: |capacity| capacity.size_used as f64,
    },
    FieldMetric {
        name: "unisphere_capacity_free_capacity",
        description: "Free capacity of the storage system",
        unit: "By",
        read: |capacity| capacity.size_free as f64,
    },
    FieldMetric {
        name: "unisphere_capacity_preallocated_capacity",
        description: "Space reserved in advance by thin storage resources",
        unit: "By",
        read: |capacity| capacity.size_preallocated as f64,
    },
    FieldMetric {
        name: "unisphere_capacity_total_provision",
        description: "Total logical size provisioned to storage resources",
        unit: "By",
        read: |capacity| capacity.total_logical_size as f64,
    },
];

pub const LUN_METRICS: &[FieldMetric<LunInstance>] = &[
    FieldMetric {
        name: "unisphere_lun_total_size",
        description: "Size of the LUN as seen by hosts",
        unit: "By",
        read: |lun| lun.size_total as f64,
    },
    FieldMetric {
        name: "unisphere_lun_used_size",
        description: "Space used by the LUN",
        unit: "By",
        read: |lun| lun.size_used as f64,
    },
    FieldMetric {
        name: "unisphere_lun_allocated_size",
        description: "Space actually allocated in the pool for the LUN",
        unit: "By",
        read: |lun| lun.size_allocated as f64,
    },
    FieldMetric {
        name: "unisphere_lun_preallocated_size",
        description: "Space reserved in the pool for the LUN",
        unit: "By",
        read: |lun| lun.size_preallocated as f64,
    },
];

/// Provider names that read fixed fields instead of metric paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryKind {
    System,
    Capacity,
    Lun,
}

impl InventoryKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "system" => Some(InventoryKind::System),
            "capacity" => Some(InventoryKind::Capacity),
            "lun" => Some(InventoryKind::Lun),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InventoryKind::System => "system",
            InventoryKind::Capacity => "capacity",
            InventoryKind::Lun => "lun",
        }
    }

    pub fn descriptors(self) -> Vec<MetricDescriptor> {
        match self {
            InventoryKind::System => vec![MetricDescriptor {
                key: SYSTEM_INFO_METRIC.to_string(),
                name: SYSTEM_INFO_METRIC.to_string(),
                description: "Model, firmware and management address of the storage system".to_string(),
                unit: String::new(),
                kind: MetricKind::Gauge,
            }],
            InventoryKind::Capacity => CAPACITY_METRICS.iter().map(FieldMetric::descriptor).collect(),
            InventoryKind::Lun => LUN_METRICS.iter().map(FieldMetric::descriptor).collect(),
        }
    }
}

impl Display for InventoryKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `unisphere_system_info` sample: always 1, with the identity in its
/// labels. The last management interface with an address wins.
pub fn system_info_observation(
    client_labels: &Labels,
    info: &[BasicSystemInfo],
    interfaces: &[MgmtInterface],
) -> Option<Observation> {
    let info = info.first()?;
    let ip_address = interfaces
        .iter()
        .rev()
        .map(|interface| interface.ip_address.as_str())
        .find(|address| !address.is_empty())
        .unwrap_or_default();

    let mut labels = client_labels.clone();
    labels.push(Label::new(PRODUCT_NAME_LABEL, info.model.as_str()));
    labels.push(Label::new(FIRMWARE_VERSION_LABEL, info.software_full_version.as_str()));
    labels.push(Label::new(IP_ADDRESS_LABEL, ip_address));

    Some(Observation {
        key: SYSTEM_INFO_METRIC.to_string(),
        value: 1.0,
        labels,
    })
}

fn observe_fields<T>(metrics: &[FieldMetric<T>], record: &T, labels: &Labels, sink: &mut impl ObservationSink) {
    for metric in metrics {
        sink.observe(metric.observe(record, labels));
    }
}

/// Polls one instance collection of one array and reports its fields.
pub struct InventoryProvider {
    kind: InventoryKind,
    settings: ProviderSettings,
    api: Arc<dyn ArrayApi>,
    backend: Arc<dyn MetricsBackend>,
    client_labels: Labels,
    stats: ProviderStats,
}

impl InventoryProvider {
    /// Declares the kind's instruments on the backend.
    pub fn start(
        kind: InventoryKind,
        settings: ProviderSettings,
        api: Arc<dyn ArrayApi>,
        backend: Arc<dyn MetricsBackend>,
        client_labels: Labels,
    ) -> PipelineResult<Self> {
        let mut registry = InstrumentRegistry::new();
        for descriptor in kind.descriptors() {
            registry.insert(descriptor)?;
        }
        for descriptor in registry.descriptors() {
            backend.declare_instrument(descriptor)?;
        }
        backend.seal()?;

        info!(
            target: "unisphere::provider",
            provider = %settings.name,
            endpoint = %settings.endpoint,
            instruments = registry.len(),
            "Provider started"
        );

        Ok(Self {
            kind,
            settings,
            api,
            backend,
            client_labels,
            stats: ProviderStats::default(),
        })
    }

    pub fn kind(&self) -> InventoryKind {
        self.kind
    }

    async fn observe(&self) -> ApiResult<Vec<Observation>> {
        let timeout = self.settings.call_timeout;
        let api = self.api.as_ref();
        let mut observations = Vec::new();

        match self.kind {
            InventoryKind::System => {
                let info = call_with_timeout("fetch_basic_system_info", timeout, api.fetch_basic_system_info()).await?;
                let interfaces = call_with_timeout("fetch_mgmt_interfaces", timeout, api.fetch_mgmt_interfaces()).await?;
                observations.extend(system_info_observation(&self.client_labels, &info, &interfaces));
            }
            InventoryKind::Capacity => {
                let records = call_with_timeout("fetch_system_capacity", timeout, api.fetch_system_capacity()).await?;
                for record in &records {
                    observe_fields(CAPACITY_METRICS, record, &self.client_labels, &mut observations);
                }
            }
            InventoryKind::Lun => {
                let luns = call_with_timeout("fetch_luns", timeout, api.fetch_luns()).await?;
                for lun in &luns {
                    let mut labels = self.client_labels.clone();
                    labels.push(Label::new(LUN_NAME_LABEL, lun.name.as_str()));
                    labels.push(Label::new(LUN_WWN_LABEL, lun.wwn.as_str()));
                    observe_fields(LUN_METRICS, lun, &labels, &mut observations);
                }
            }
        }

        Ok(observations)
    }
}

#[async_trait]
impl Collector for InventoryProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    fn interval(&self) -> Duration {
        self.settings.interval
    }

    fn stats(&self) -> ProviderStats {
        self.stats.clone()
    }

    async fn collect_cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;

        match self.observe().await {
            Ok(observations) => {
                let report = DecodeReport {
                    emitted: observations.len(),
                    skipped: 0,
                };
                self.stats.published_cycles += 1;
                self.stats.observations += report.emitted as u64;
                self.backend.publish(observations);
                CycleOutcome::Published(report)
            }
            Err(e) => {
                warn!(
                    target: "unisphere::provider",
                    provider = %self.settings.name,
                    endpoint = %self.settings.endpoint,
                    error = %e,
                    "Failed to fetch {} instances",
                    self.kind
                );
                self.stats.failed_cycles += 1;
                self.backend.publish(Vec::new());
                CycleOutcome::FetchFailed
            }
        }
    }

    fn close(&mut self) {
        self.backend.close();
    }
}

// ============================================================================
// SECTION 16: EVENT FORWARDING
// ============================================================================

/// Where forwarded array events go.
pub trait EventSink: Send + Sync {
    fn emit(&self, endpoint: &str, event: &ArrayEvent, labels: &Labels);
}

/// Writes each array event as a log record under `unisphere::event`, at the
/// level matching its severity.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, endpoint: &str, event: &ArrayEvent, labels: &Labels) {
        let labels = labels.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");

        macro_rules! forward {
            ($level:ident) => {
                $level!(
                    target: "unisphere::event",
                    endpoint = %endpoint,
                    level = event.severity_name(),
                    message.id = %event.message_id,
                    source = %event.source,
                    created = %event.creation_time,
                    labels = %labels,
                    "{}",
                    event.message
                )
            };
        }

        match event.severity {
            0..=3 => forward!(error),
            4 => forward!(warn),
            5 | 6 => forward!(info),
            _ => forward!(debug),
        }
    }
}

fn event_cursor(time: SystemTime) -> String {
    humantime::format_rfc3339_seconds(time).to_string()
}

/// Forwards new entries of one array's event log.
///
/// The first poll reaches back an hour. Later polls start at the array's
/// `updated` stamp of the previous response.
pub struct EventProvider {
    settings: ProviderSettings,
    api: Arc<dyn ArrayApi>,
    sink: Arc<dyn EventSink>,
    client_labels: Labels,
    level: u8,
    cursor: String,
    stats: ProviderStats,
}

impl EventProvider {
    /// `level` is the least severe code forwarded; 8 forwards everything.
    pub fn new(
        settings: ProviderSettings,
        api: Arc<dyn ArrayApi>,
        sink: Arc<dyn EventSink>,
        client_labels: Labels,
        level: u8,
    ) -> Self {
        let since = SystemTime::now()
            .checked_sub(Duration::from_secs(EVENT_LOOKBACK_SECS))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        Self {
            settings,
            api,
            sink,
            client_labels,
            level,
            cursor: event_cursor(since),
            stats: ProviderStats::default(),
        }
    }

    /// Lower bound of the next poll
    pub fn cursor(&self) -> &str {
        &self.cursor
    }
}

#[async_trait]
impl Collector for EventProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    fn interval(&self) -> Duration {
        self.settings.interval
    }

    fn stats(&self) -> ProviderStats {
        self.stats.clone()
    }

    async fn collect_cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;

        let fetched = call_with_timeout(
            "fetch_events",
            self.settings.call_timeout,
            self.api.fetch_events(&self.cursor),
        )
        .await;
        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    target: "unisphere::provider",
                    provider = %self.settings.name,
                    endpoint = %self.settings.endpoint,
                    since = %self.cursor,
                    error = %e,
                    "Failed to fetch events"
                );
                self.stats.failed_cycles += 1;
                return CycleOutcome::FetchFailed;
            }
        };

        let mut report = DecodeReport::default();
        for event in &page.events {
            if event.severity > self.level {
                report.skipped += 1;
                continue;
            }
            self.sink.emit(&self.settings.endpoint, event, &self.client_labels);
            report.emitted += 1;
        }

        match page.updated.as_deref().map(humantime::parse_rfc3339_weak) {
            Some(Ok(updated)) => self.cursor = event_cursor(updated),
            Some(Err(e)) => debug!(
                target: "unisphere::provider",
                provider = %self.settings.name,
                error = %e,
                "Unparseable event timestamp, keeping cursor"
            ),
            None => {}
        }

        self.stats.published_cycles += 1;
        self.stats.observations += report.emitted as u64;
        self.stats.skipped_leaves += report.skipped as u64;

        CycleOutcome::Published(report)
    }
}

// ============================================================================
// SECTION 17: EXPORTER SUPERVISOR
// ============================================================================

type ProviderExit = Option<(String, String, ProviderStats)>;

/// A provider plan bound to where its output goes.
enum Launch {
    Metric(Arc<dyn MetricsBackend>),
    Inventory(InventoryKind, Arc<dyn MetricsBackend>),
    Event(u8),
}

async fn start_collector(
    launch: Launch,
    settings: ProviderSettings,
    api: Arc<dyn ArrayApi>,
    labels: Labels,
) -> PipelineResult<Box<dyn Collector>> {
    let collector: Box<dyn Collector> = match launch {
        Launch::Metric(backend) => Box::new(MetricProvider::start(settings, api, backend, labels).await?),
        Launch::Inventory(kind, backend) => Box::new(InventoryProvider::start(kind, settings, api, backend, labels)?),
        Launch::Event(level) => Box::new(EventProvider::new(
            settings,
            api,
            Arc::new(TracingEventSink),
            labels,
            level,
        )),
    };
    Ok(collector)
}

/// Runs every enabled provider against every target until shutdown.
pub struct Exporter {
    config: ExporterConfig,
    cancel: CancellationToken,
}

impl Exporter {
    pub fn new(config: ExporterConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn backend_for(&self, plan: &ProviderPlan) -> ExporterResult<(Arc<dyn MetricsBackend>, Option<SdkMeterProvider>)> {
        match build_meter_provider(&self.config.server.metrics, plan.interval, self.config.global.timeout)? {
            Some(meter_provider) => {
                let backend: Arc<dyn MetricsBackend> =
                    Arc::new(OtelBackend::new(meter_provider.meter(plan.name.clone())));
                Ok((backend, Some(meter_provider)))
            }
            None => {
                let backend: Arc<dyn MetricsBackend> = Arc::new(TracingBackend::new(plan.name.clone()));
                Ok((backend, None))
            }
        }
    }

    /// Run the exporter until a shutdown signal or until every provider stops
    pub async fn run(&self) -> ExporterResult<()> {
        info!(
            target: "unisphere::exporter",
            version = EXPORTER_VERSION,
            targets = self.config.targets.len(),
            "Starting {}",
            EXPORTER_FULL_NAME
        );

        self.spawn_signal_listener();

        let timeout = self.config.global.timeout;
        let plans = self.config.enabled_providers();
        if plans.is_empty() {
            warn!(target: "unisphere::exporter", "No providers enabled");
        }
        if self.config.server.metrics.endpoint.is_none() {
            warn!(
                target: "unisphere::exporter",
                "No metrics endpoint configured, observations will only be logged"
            );
        }

        let resolved = self.config.resolve_targets()?;
        let connected = join_all(resolved.into_iter().map(|target| Target::connect(target, timeout))).await;

        let mut tasks: JoinSet<ProviderExit> = JoinSet::new();
        let mut meter_providers = Vec::new();

        for target in connected {
            let target = match target {
                Ok(target) => target,
                Err(e) => {
                    error!(target: "unisphere::exporter", error = %e, "Failed to set up target");
                    continue;
                }
            };

            for plan in &plans {
                let launch = match &plan.module {
                    ProviderModule::Event { level } => Launch::Event(*level),
                    module => {
                        let backend = match self.backend_for(plan) {
                            Ok((backend, meter_provider)) => {
                                meter_providers.extend(meter_provider);
                                backend
                            }
                            Err(e) => {
                                error!(
                                    target: "unisphere::exporter",
                                    provider = %plan.name,
                                    endpoint = %target.endpoint,
                                    error = %e,
                                    "Failed to set up metrics export, provider skipped"
                                );
                                continue;
                            }
                        };
                        match module {
                            ProviderModule::Inventory(kind) => Launch::Inventory(*kind, backend),
                            _ => Launch::Metric(backend),
                        }
                    }
                };

                let patterns = match &plan.module {
                    ProviderModule::Metric { patterns } => patterns.clone(),
                    _ => Vec::new(),
                };
                let settings = ProviderSettings {
                    name: plan.name.clone(),
                    endpoint: target.endpoint.clone(),
                    interval: plan.interval,
                    call_timeout: timeout,
                    patterns,
                };
                let api = Arc::clone(&target.api);
                let labels = target.labels.clone();
                let cancel = self.cancel.child_token();

                tasks.spawn(async move {
                    let name = settings.name.clone();
                    let endpoint = settings.endpoint.clone();
                    match start_collector(launch, settings, api, labels).await {
                        Ok(collector) => Some((name, endpoint, run_collector(collector, cancel).await)),
                        Err(e) => {
                            error!(
                                target: "unisphere::exporter",
                                provider = %name,
                                endpoint = %endpoint,
                                error = %e,
                                "Provider failed to start"
                            );
                            None
                        }
                    }
                });
            }
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(exit) => Self::log_provider_exit(exit),
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }

        if !tasks.is_empty() {
            let grace = Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS);
            let drained = tokio::time::timeout(grace, async {
                while let Some(exit) = tasks.join_next().await {
                    Self::log_provider_exit(exit);
                }
            })
            .await;

            if drained.is_err() {
                warn!(
                    target: "unisphere::exporter",
                    remaining = tasks.len(),
                    "Providers did not stop within grace period, aborting"
                );
                tasks.abort_all();
            }
        }

        for meter_provider in meter_providers {
            if let Err(e) = meter_provider.shutdown() {
                warn!(target: "unisphere::exporter", error = %e, "Failed to flush meter provider");
            }
        }

        info!(target: "unisphere::exporter", "Exporter stopped");
        Ok(())
    }

    fn log_provider_exit(exit: Result<ProviderExit, tokio::task::JoinError>) {
        match exit {
            Ok(Some((provider, endpoint, stats))) => info!(
                target: "unisphere::exporter",
                provider = %provider,
                endpoint = %endpoint,
                cycles = stats.cycles,
                published_cycles = stats.published_cycles,
                failed_cycles = stats.failed_cycles,
                stale_queries = stats.stale_queries,
                query_registrations = stats.query_registrations,
                observations = stats.observations,
                skipped_leaves = stats.skipped_leaves,
                "Provider stopped"
            ),
            Ok(None) => {}
            Err(e) => error!(target: "unisphere::exporter", error = %e, "Provider task panicked"),
        }
    }

    fn spawn_signal_listener(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_shutdown_signal() => {
                    info!(target: "unisphere::exporter", "Shutdown signal received");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(target: "unisphere::exporter", error = %e, "Failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

// ============================================================================
// SECTION 18: CLI INTERFACE
// ============================================================================

/// Command-line interface
#[derive(Parser, Debug)]
#[command(name = "unisphere-exporter")]
#[command(author = "AIOps Team")]
#[command(version = EXPORTER_VERSION)]
#[command(about = "Unisphere performance counters as OpenTelemetry metrics", long_about = None)]
pub struct Cli {
    /// Configuration file path (.yml/.yaml or .toml)
    #[arg(short, long, default_value = "unisphere.yml", env = "UNISPHERE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "UNISPHERE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the exporter (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show the resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show which catalog paths the configured patterns select on one target
    Catalog {
        /// Index of the target in the configuration
        #[arg(short, long, default_value_t = 0)]
        target: usize,

        /// Patterns to try instead of the enabled providers' paths
        #[arg(short, long = "pattern")]
        patterns: Vec<String>,
    },

    /// Show version information
    Version,
}

fn load_and_init(cli: &Cli) -> AnyhowResult<ExporterConfig> {
    let config = ExporterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if cli.debug {
        logging.level = "debug".to_string();
    }
    init_logging(&logging)?;

    Ok(config)
}

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration: {}", path.display());

    match ExporterConfig::load(path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Targets: {}", config.targets.len());
            println!("  Enabled providers: {}", config.enabled_providers().len());
            match config.server.metrics.collector_url() {
                Some(url) => println!("  Metrics endpoint: {} ({:?})", url, config.server.metrics.mode),
                None => println!("  Metrics endpoint: none (log only)"),
            }

            if verbose {
                for plan in config.enabled_providers() {
                    println!(
                        "  - {} every {}: {}",
                        plan.name,
                        humantime::format_duration(plan.interval),
                        plan.module
                    );
                }
                println!("\nResolved configuration:");
                println!("{:#?}", config);
            }
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration is invalid: {}", e);
            Err(e.into())
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = ExporterConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Configuration written to: {}", path.display());
        }
        None => println!("{}", config),
    }

    Ok(())
}

async fn handle_catalog(config: &ExporterConfig, target_index: usize, raw_patterns: &[String]) -> ExporterResult<()> {
    let target = config
        .resolve_targets()?
        .into_iter()
        .nth(target_index)
        .ok_or_else(|| ConfigError::invalid_value("--target", format!("no target at index {}", target_index)))?;

    let timeout = config.global.timeout;
    let client = UnisphereClient::new(&target, timeout)?;
    let catalog = call_with_timeout("fetch_catalog", timeout, client.fetch_catalog()).await?;

    let patterns: Vec<PathPattern> = if raw_patterns.is_empty() {
        config
            .enabled_providers()
            .into_iter()
            .filter_map(|plan| match plan.module {
                ProviderModule::Metric { patterns } => Some(patterns),
                _ => None,
            })
            .flatten()
            .collect()
    } else {
        raw_patterns.iter().map(|raw| PathPattern::parse(raw)).collect()
    };

    let matched = match_catalog(&catalog, &patterns);
    println!(
        "{}: {} of {} catalog paths matched",
        target.endpoint,
        matched.len(),
        catalog.len()
    );

    let mut supported = 0usize;
    for entry in &matched {
        match Classification::classify(entry.type_code).kind() {
            Some(kind) => {
                supported += 1;
                println!(
                    "  {:<8} {:<56} {} [{}]",
                    kind.to_string(),
                    entry.path,
                    instrument_name(&entry.path),
                    entry.unit.to_lowercase()
                );
            }
            None => println!("  {:<8} {:<56} type {}", "skipped", entry.path, entry.type_code),
        }
    }

    if supported > REALTIME_QUERY_MAX_PATHS {
        println!(
            "! {} supported paths exceed the real-time query limit of {}",
            supported, REALTIME_QUERY_MAX_PATHS
        );
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    println!("Real-time query capacity: {} paths", REALTIME_QUERY_MAX_PATHS);
}

// ============================================================================
// SECTION 19: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Version => {
            handle_version();
            Ok(())
        }
        Commands::GenerateConfig { output } => handle_generate_config(output.as_deref()),
        Commands::Validate { verbose } => handle_validate(&cli.config, verbose),
        Commands::Catalog { target, patterns } => {
            let config = load_and_init(&cli)?;
            handle_catalog(&config, target, &patterns).await?;
            Ok(())
        }
        Commands::Run => {
            let config = load_and_init(&cli)?;
            let exporter = Exporter::new(config);
            exporter.run().await.map_err(|e| {
                error!(
                    target: "unisphere::exporter",
                    category = e.category(),
                    recovery = ?e.recovery_hint(),
                    error = %e,
                    "Exporter failed"
                );
                e
            })?;
            Ok(())
        }
    }
}

// ============================================================================
// SECTION 20: TESTS
// ============================================================================




#[cfg(test)]
mod decoder_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::test_support::*;

    fn decode_all(path: &str, tree: &ResultValue, client: &[Label]) -> (Vec<Observation>, DecodeReport) {
        let names = label_names(path);
        let mut sink = Vec::new();
        let report = decode(path, tree, &names, client, &mut sink);
        (sink, report)
    }

    fn pairs(observation: &Observation) -> Vec<(String, String)> {
        observation
            .labels
            .iter()
            .map(|l| (l.key.to_string(), l.value.to_string()))
            .collect()
    }

    #[test]
    fn test_wildcard_decode() {
        let tree = leaves(&[("spa", "12.5"), ("spb", "8.0")]);

        let (observations, report) = decode_all("sp.*.cpuUtil", &tree, &[]);

        assert_eq!(report, DecodeReport { emitted: 2, skipped: 0 });
        assert_eq!(observations[0].value, 12.5);
        assert_eq!(pairs(&observations[0]), vec![("sp".to_string(), "spa".to_string())]);
        assert_eq!(observations[1].value, 8.0);
        assert_eq!(pairs(&observations[1]), vec![("sp".to_string(), "spb".to_string())]);
        assert!(observations.iter().all(|o| o.key == "sp.*.cpuUtil"));
    }

    #[test]
    fn test_client_labels_precede_dimensions() {
        let client = vec![Label::new("host.name", "unity01"), Label::new("instance", "CKM001")];
        let tree = ResultValue::node([("spa", leaves(&[("sv_1", "1.5"), ("sv_2", "2")]))]);

        let (observations, _) = decode_all("sp.*.storage.lun.*.readsRate", &tree, &client);

        assert_eq!(observations.len(), 2);
        assert_eq!(
            pairs(&observations[0]),
            vec![
                ("host.name".to_string(), "unity01".to_string()),
                ("instance".to_string(), "CKM001".to_string()),
                ("sp".to_string(), "spa".to_string()),
                ("lun".to_string(), "sv_1".to_string()),
            ]
        );
        assert_eq!(observations[1].value, 2.0);
    }

    #[test]
    fn test_malformed_leaf_skips_only_itself() {
        let tree = leaves(&[("spa", "12.5"), ("spb", "n/a"), ("spc", " 3 ")]);

        let (observations, report) = decode_all("sp.*.cpuUtil", &tree, &[]);

        assert_eq!(report, DecodeReport { emitted: 2, skipped: 1 });
        assert_eq!(observations.iter().map(|o| o.value).collect::<Vec<_>>(), vec![12.5, 3.0]);
    }

    #[test]
    fn test_shallow_leaf_is_skipped() {
        let tree = leaves(&[("spa", "3")]);

        let (observations, report) = decode_all("sp.*.storage.lun.*.readsRate", &tree, &[]);

        assert!(observations.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_subtree_deeper_than_wildcards_is_skipped() {
        let tree = ResultValue::node([
            ("spa", leaves(&[("extra", "1"), ("more", "2")])),
            ("spb", ResultValue::leaf("5")),
        ]);

        let (observations, report) = decode_all("sp.*.cpuUtil", &tree, &[]);

        assert_eq!(report, DecodeReport { emitted: 1, skipped: 2 });
        assert_eq!(observations[0].value, 5.0);
    }

    #[test]
    fn test_literal_path_root_leaf() {
        let (observations, report) = decode_all("sp.spa.cpuUtil", &ResultValue::leaf("42"), &[]);

        assert_eq!(report.emitted, 1);
        assert_eq!(observations[0].value, 42.0);
        assert!(observations[0].labels.is_empty());
    }

    #[test]
    fn test_arbitrary_depth() {
        let tree = ResultValue::node([(
            "a1",
            ResultValue::node([(
                "b1",
                ResultValue::node([("c1", ResultValue::node([("d1", ResultValue::leaf("7"))]))]),
            )]),
        )]);

        let (observations, _) = decode_all("w.*.x.*.y.*.z.*.v", &tree, &[]);

        assert_eq!(observations.len(), 1);
        assert_eq!(
            pairs(&observations[0]),
            vec![
                ("w".to_string(), "a1".to_string()),
                ("x".to_string(), "b1".to_string()),
                ("y".to_string(), "c1".to_string()),
                ("z".to_string(), "d1".to_string()),
            ]
        );
    }

    #[test]
    fn test_result_value_from_json() {
        let value: ResultValue =
            serde_json::from_str(r#"{"spa": 12.5, "spb": "8", "spc": {"x": 3}, "spd": null}"#).unwrap();

        assert_eq!(
            value,
            ResultValue::node([
                ("spa", ResultValue::leaf("12.5")),
                ("spb", ResultValue::leaf("8")),
                ("spc", ResultValue::node([("x", ResultValue::leaf("3"))])),
                ("spd", ResultValue::leaf("null")),
            ])
        );
        assert_eq!(value.leaf_count(), 4);
    }

    proptest! {
        #[test]
        fn prop_decode_recovers_every_sample(
            samples in proptest::collection::btree_map(
                "[a-z]{1,6}",
                proptest::collection::btree_map("[a-z0-9_]{1,6}", -1.0e9f64..1.0e9f64, 1..5),
                0..5,
            )
        ) {
            let tree = ResultValue::node(samples.iter().map(|(sp, luns)| {
                (sp.clone(), ResultValue::node(luns.iter().map(|(lun, v)| (lun.clone(), ResultValue::leaf(v.to_string())))))
            }));

            let (observations, report) = decode_all("sp.*.storage.lun.*.readsRate", &tree, &[]);

            let mut decoded = BTreeMap::new();
            for observation in &observations {
                prop_assert_eq!(observation.labels.len(), 2);
                decoded.insert(
                    (observation.labels[0].value.to_string(), observation.labels[1].value.to_string()),
                    observation.value,
                );
            }

            let expected: BTreeMap<(String, String), f64> = samples
                .iter()
                .flat_map(|(sp, luns)| luns.iter().map(move |(lun, v)| ((sp.clone(), lun.clone()), *v)))
                .collect();

            prop_assert_eq!(report.skipped, 0);
            prop_assert_eq!(decoded, expected);
        }
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    use super::test_support::*;

    async fn start_with(
        api: Arc<dyn ArrayApi>,
        patterns: &[&str],
    ) -> (PipelineResult<MetricProvider>, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let started = MetricProvider::start(settings(patterns), api, backend.clone(), Labels::new()).await;
        (started, backend)
    }

    fn lun_paths(count: usize) -> Vec<CatalogEntry> {
        (0..count).map(|i| gauge(&format!("pool.p{:02}.sizeUsed", i))).collect()
    }

    #[test]
    fn test_query_capacity_boundary() {
        let interval = Duration::from_secs(60);
        let paths = |n: usize| (0..n).map(|i| format!("p{}", i)).collect::<Vec<_>>();

        assert!(RealtimeQuery::new(paths(48), interval).is_ok());
        match RealtimeQuery::new(paths(49), interval) {
            Err(PipelineError::CapacityExceeded { count, capacity }) => {
                assert_eq!(count, 49);
                assert_eq!(capacity, REALTIME_QUERY_MAX_PATHS);
            }
            other => panic!("expected capacity error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_49_paths_fail_before_any_query_is_created() {
        let mut api = MockArrayApi::new();
        api.expect_fetch_catalog().times(1).returning(|| Ok(lun_paths(49)));
        api.expect_create_realtime_query().never();

        let (started, backend) = start_with(Arc::new(api), &["pool.%"]).await;

        assert!(matches!(started, Err(PipelineError::CapacityExceeded { count: 49, .. })));
        assert!(backend.declared.lock().is_empty());
    }

    #[tokio::test]
    async fn test_48_paths_register_one_query() {
        let api = Arc::new(ScriptedArray::new(lun_paths(48)));

        let (started, backend) = start_with(api.clone(), &["pool.%"]).await;
        let provider = started.unwrap();

        assert_eq!(provider.descriptors().len(), 48);
        assert_eq!(backend.declared.lock().len(), 48);
        assert!(backend.sealed.load(Ordering::SeqCst));
        assert_eq!(api.creates(), 1);
        assert_eq!(provider.query().id(), Some(&QueryId::new("1")));
    }

    #[tokio::test]
    async fn test_catalog_failure_is_fatal() {
        let mut api = MockArrayApi::new();
        api.expect_fetch_catalog().returning(|| {
            Err(ApiError::ConnectionFailed {
                endpoint: "https://unity.test".to_string(),
                message: "connection refused".to_string(),
            })
        });
        api.expect_create_realtime_query().never();

        let (started, _) = start_with(Arc::new(api), &["sp.%"]).await;

        match started {
            Err(PipelineError::CatalogUnavailable { provider, .. }) => assert_eq!(provider, "metric_a"),
            other => panic!("expected catalog error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_name_collision_is_fatal() {
        let api = Arc::new(ScriptedArray::new(vec![gauge("sp.*.cpu"), gauge("sp.cpu")]));

        let (started, _) = start_with(api.clone(), &["sp.%"]).await;

        assert!(matches!(started, Err(PipelineError::InstrumentNameCollision { .. })));
        assert_eq!(api.creates(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_type_absent_from_instruments() {
        let catalog = vec![
            CatalogEntry::new("sp.*.physical.disk.*.serialNumber", 6),
            gauge("sp.*.cpu.summary.utilization"),
        ];
        let api = Arc::new(ScriptedArray::new(catalog));

        let (started, backend) = start_with(api, &["sp.%"]).await;

        assert!(started.is_ok());
        assert_eq!(backend.declared_names(), vec!["unisphere_sp_cpu_summary_utilization"]);
    }

    #[tokio::test]
    async fn test_inert_provider_never_calls_array() {
        let mut api = MockArrayApi::new();
        api.expect_fetch_catalog().returning(|| Ok(vec![gauge("sp.*.cpu")]));
        api.expect_create_realtime_query().never();
        api.expect_fetch_query_result().never();

        let (started, _) = start_with(Arc::new(api), &["nothing.matches"]).await;
        let mut provider = started.unwrap();

        assert_eq!(provider.collect_cycle().await, CycleOutcome::Inert);
        assert!(!provider.query().is_registered());
    }

    #[tokio::test]
    async fn test_stale_query_recreated_before_next_fetch() {
        let calls = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut api = MockArrayApi::new();

        api.expect_fetch_catalog().returning(|| Ok(vec![gauge("sp.*.cpuUtil")]));

        let log = Arc::clone(&calls);
        let mut created = 0;
        api.expect_create_realtime_query()
            .times(2)
            .returning(move |_: &[String], _: Duration| {
                created += 1;
                log.lock().push(format!("create:{}", created));
                Ok(QueryId::new(created.to_string()))
            });

        let log = Arc::clone(&calls);
        let mut fetched = 0;
        api.expect_fetch_query_result()
            .times(3)
            .returning(move |id: &QueryId| {
                fetched += 1;
                log.lock().push(format!("fetch:{}", id));
                if fetched == 2 {
                    Err(ApiError::QueryNotFound { query_id: id.to_string() })
                } else {
                    Ok(vec![result("sp.*.cpuUtil", leaves(&[("spa", "12.5")]))])
                }
            });

        let (started, backend) = start_with(Arc::new(api), &["sp.*.cpuUtil"]).await;
        let mut provider = started.unwrap();

        assert!(matches!(provider.collect_cycle().await, CycleOutcome::Published(_)));
        assert_eq!(backend.last_published().unwrap().len(), 1);

        assert_eq!(provider.collect_cycle().await, CycleOutcome::QueryStale);
        assert!(!provider.query().is_registered());
        assert!(backend.last_published().unwrap().is_empty());

        assert!(matches!(provider.collect_cycle().await, CycleOutcome::Published(_)));
        assert_eq!(provider.query().id(), Some(&QueryId::new("2")));

        assert_eq!(
            *calls.lock(),
            vec!["create:1", "fetch:1", "fetch:1", "create:2", "fetch:2"]
        );
        let stats = provider.stats();
        assert_eq!(stats.stale_queries, 1);
        assert_eq!(stats.query_registrations, 2);
        assert_eq!(stats.published_cycles, 2);
    }

    #[tokio::test]
    async fn test_registration_failure_is_retried() {
        let api = Arc::new(
            ScriptedArray::new(vec![gauge("sp.*.cpuUtil")])
                .failing_creates(2)
                .with_results(vec![Ok(vec![result("sp.*.cpuUtil", leaves(&[("spa", "1")]))])]),
        );

        let (started, backend) = start_with(api.clone(), &["sp.*.cpuUtil"]).await;
        let mut provider = started.unwrap();
        assert!(!provider.query().is_registered());

        assert_eq!(provider.collect_cycle().await, CycleOutcome::RegistrationFailed);
        assert!(backend.last_published().unwrap().is_empty());

        assert!(matches!(
            provider.collect_cycle().await,
            CycleOutcome::Published(DecodeReport { emitted: 1, skipped: 0 })
        ));
        assert_eq!(api.creates(), 1);
        assert_eq!(provider.stats().failed_cycles, 1);
    }

    #[tokio::test]
    async fn test_fresh_query_tolerates_one_empty_result() {
        let api = Arc::new(ScriptedArray::new(vec![gauge("sp.*.cpuUtil")]).with_results(vec![Ok(vec![]), Ok(vec![])]));

        let (started, _) = start_with(api.clone(), &["sp.*.cpuUtil"]).await;
        let mut provider = started.unwrap();

        assert_eq!(provider.collect_cycle().await, CycleOutcome::Pending);
        assert_eq!(provider.collect_cycle().await, CycleOutcome::QueryStale);
        assert_eq!(provider.collect_cycle().await, CycleOutcome::Pending);
        assert_eq!(api.creates(), 2);
    }

    #[tokio::test]
    async fn test_fetch_timeout_fails_cycle_only() {
        let api = Arc::new(
            ScriptedArray::new(vec![gauge("sp.*.cpuUtil")]).with_fetch_delay(Duration::from_millis(500)),
        );
        let backend = Arc::new(RecordingBackend::default());
        let mut fast = settings(&["sp.*.cpuUtil"]);
        fast.call_timeout = Duration::from_millis(20);

        let mut provider = MetricProvider::start(fast, api, backend.clone(), Labels::new()).await.unwrap();

        assert_eq!(provider.collect_cycle().await, CycleOutcome::FetchFailed);
        assert!(provider.query().is_registered());
        assert!(backend.last_published().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_for_unknown_paths_are_ignored() {
        let api = Arc::new(ScriptedArray::new(vec![gauge("sp.*.cpuUtil")]).with_results(vec![Ok(vec![
            result("sp.*.other", leaves(&[("spa", "1")])),
            result("sp.*.cpuUtil", leaves(&[("spa", "2"), ("spb", "bad")])),
        ])]));

        let (started, backend) = start_with(api, &["sp.*.cpuUtil"]).await;
        let mut provider = started.unwrap();

        assert_eq!(
            provider.collect_cycle().await,
            CycleOutcome::Published(DecodeReport { emitted: 1, skipped: 1 })
        );
        let published = backend.last_published().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].value, 2.0);
        assert_eq!(provider.stats().skipped_leaves, 1);
    }

    #[tokio::test]
    async fn test_run_returns_on_cancellation() {
        let api = Arc::new(ScriptedArray::new(vec![gauge("sp.*.cpuUtil")]));
        let (started, backend) = start_with(api, &["sp.*.cpuUtil"]).await;
        let provider = started.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(provider.run(cancel.clone()));
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(stats.cycles, 0);
        assert_eq!(stats.query_registrations, 1);
        assert!(backend.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_client_labels_from_identity() {
        let api = ScriptedArray::new(Vec::new());
        let custom = BTreeMap::from([("site".to_string(), "dc1".to_string())]);

        let labels = resolve_client_labels(&api, "https://unity.test", &custom, Duration::from_secs(1)).await;

        assert_eq!(
            labels.into_vec(),
            vec![
                Label::new("site", "dc1"),
                Label::new(HOST_NAME_LABEL, "unity01"),
                Label::new(INSTANCE_LABEL, "CKM00000000001"),
            ]
        );
    }

    #[tokio::test]
    async fn test_client_labels_fall_back_to_endpoint() {
        let api = ScriptedArray::new(Vec::new()).with_identity(Err(ApiError::HttpStatus {
            status_code: 503,
            url: "https://unity.test/api/types/system/instances".to_string(),
        }));

        let labels = resolve_client_labels(&api, "https://unity.test", &BTreeMap::new(), Duration::from_secs(1)).await;

        assert_eq!(labels.into_vec(), vec![Label::new(INSTANCE_LABEL, "https://unity.test")]);
    }
}

#[cfg(test)]
mod inventory_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    use super::test_support::*;

    fn fixed_settings(name: &str) -> ProviderSettings {
        ProviderSettings {
            name: name.to_string(),
            ..settings(&[])
        }
    }

    fn client_labels() -> Labels {
        Labels::from_vec(vec![Label::new(INSTANCE_LABEL, "CKM00000000001")])
    }

    fn start(kind: InventoryKind, api: ScriptedArray) -> (InventoryProvider, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let provider = InventoryProvider::start(
            kind,
            fixed_settings(kind.as_str()),
            Arc::new(api),
            backend.clone(),
            client_labels(),
        )
        .unwrap();
        (provider, backend)
    }

    fn event(severity: u8, message: &str) -> ArrayEvent {
        ArrayEvent {
            creation_time: "2024-05-01T09:59:00.000Z".to_string(),
            severity,
            message_id: "14:60001".to_string(),
            message: message.to_string(),
            source: "system".to_string(),
        }
    }

    #[tokio::test]
    async fn test_capacity_reports_each_field() {
        let api = ScriptedArray::new(Vec::new()).with_capacity(Ok(vec![SystemCapacity {
            size_total: 1000,
            size_used: 400,
            size_free: 600,
            size_preallocated: 50,
            total_logical_size: 1500,
        }]));

        let (mut provider, backend) = start(InventoryKind::Capacity, api);

        assert_eq!(
            backend.declared_names(),
            vec![
                "unisphere_capacity_total_capacity",
                "unisphere_capacity_used_capacity",
                "unisphere_capacity_free_capacity",
                "unisphere_capacity_preallocated_capacity",
                "unisphere_capacity_total_provision",
            ]
        );
        assert!(backend.sealed.load(Ordering::SeqCst));

        let outcome = provider.collect_cycle().await;
        assert_eq!(outcome, CycleOutcome::Published(DecodeReport { emitted: 5, skipped: 0 }));

        let published = backend.last_published().unwrap();
        let values: Vec<(&str, f64)> = published.iter().map(|o| (o.key.as_str(), o.value)).collect();
        assert_eq!(
            values,
            vec![
                ("unisphere_capacity_total_capacity", 1000.0),
                ("unisphere_capacity_used_capacity", 400.0),
                ("unisphere_capacity_free_capacity", 600.0),
                ("unisphere_capacity_preallocated_capacity", 50.0),
                ("unisphere_capacity_total_provision", 1500.0),
            ]
        );
        assert!(published.iter().all(|o| o.labels == client_labels()));
    }

    #[tokio::test]
    async fn test_lun_labels_follow_client_labels() {
        let api = ScriptedArray::new(Vec::new()).with_luns(vec![
            LunInstance {
                name: "lun-a".to_string(),
                wwn: "60:06:01:60:aa".to_string(),
                size_total: 100,
                size_used: 10,
                size_allocated: 20,
                size_preallocated: 5,
            },
            LunInstance {
                name: "lun-b".to_string(),
                wwn: "60:06:01:60:bb".to_string(),
                ..LunInstance::default()
            },
        ]);

        let (mut provider, backend) = start(InventoryKind::Lun, api);
        provider.collect_cycle().await;

        let published = backend.last_published().unwrap();
        assert_eq!(published.len(), 8);

        let allocated = published
            .iter()
            .find(|o| o.key == "unisphere_lun_allocated_size")
            .unwrap();
        assert_eq!(allocated.value, 20.0);
        assert_eq!(
            allocated.labels.clone().into_vec(),
            vec![
                Label::new(INSTANCE_LABEL, "CKM00000000001"),
                Label::new(LUN_NAME_LABEL, "lun-a"),
                Label::new(LUN_WWN_LABEL, "60:06:01:60:aa"),
            ]
        );
    }

    #[tokio::test]
    async fn test_system_info_is_one_with_identity_labels() {
        let api = ScriptedArray::new(Vec::new()).with_system_info(
            vec![BasicSystemInfo {
                name: "unity01".to_string(),
                model: "Unity 480F".to_string(),
                software_full_version: "5.3.0.0.5.120".to_string(),
            }],
            vec![
                MgmtInterface {
                    ip_address: "10.0.0.10".to_string(),
                },
                MgmtInterface {
                    ip_address: "10.0.0.11".to_string(),
                },
                MgmtInterface::default(),
            ],
        );

        let (mut provider, backend) = start(InventoryKind::System, api);
        provider.collect_cycle().await;

        let published = backend.last_published().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, SYSTEM_INFO_METRIC);
        assert_eq!(published[0].value, 1.0);
        assert_eq!(
            published[0].labels.clone().into_vec(),
            vec![
                Label::new(INSTANCE_LABEL, "CKM00000000001"),
                Label::new(PRODUCT_NAME_LABEL, "Unity 480F"),
                Label::new(FIRMWARE_VERSION_LABEL, "5.3.0.0.5.120"),
                Label::new(IP_ADDRESS_LABEL, "10.0.0.11"),
            ]
        );
    }

    #[tokio::test]
    async fn test_system_info_without_instances_publishes_nothing() {
        let (mut provider, backend) = start(InventoryKind::System, ScriptedArray::new(Vec::new()));

        let outcome = provider.collect_cycle().await;

        assert_eq!(outcome, CycleOutcome::Published(DecodeReport::default()));
        assert_eq!(backend.last_published(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_inventory_fetch_failure_publishes_empty_snapshot() {
        let api = ScriptedArray::new(Vec::new()).with_capacity(Err(ApiError::HttpStatus {
            status_code: 503,
            url: "https://unity.test/api/types/systemCapacity/instances".to_string(),
        }));

        let (mut provider, backend) = start(InventoryKind::Capacity, api);

        assert_eq!(provider.collect_cycle().await, CycleOutcome::FetchFailed);
        assert_eq!(backend.last_published(), Some(Vec::new()));
        assert_eq!(provider.stats().failed_cycles, 1);
    }

    #[tokio::test]
    async fn test_inventory_run_closes_backend_on_cancel() {
        let api = ScriptedArray::new(Vec::new()).with_capacity(Ok(vec![SystemCapacity::default()]));
        let backend = Arc::new(RecordingBackend::default());
        let settings = ProviderSettings {
            interval: Duration::from_millis(20),
            ..fixed_settings("capacity")
        };
        let provider =
            InventoryProvider::start(InventoryKind::Capacity, settings, Arc::new(api), backend.clone(), client_labels())
                .unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_collector(Box::new(provider), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert!(stats.cycles >= 1);
        assert_eq!(stats.observations, stats.published_cycles * 5);
        assert!(backend.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_events_filtered_by_level_and_cursor_advances() {
        let api = Arc::new(ScriptedArray::new(Vec::new()).with_event_pages(vec![Ok(EventPage {
            updated: Some("2024-05-01T10:00:00.123Z".to_string()),
            events: vec![
                event(2, "Pool is full"),
                event(4, "Pool is almost full"),
                event(6, "User logged in"),
            ],
        })]));
        let sink = Arc::new(RecordingEventSink::default());
        let mut provider = EventProvider::new(fixed_settings(EVENT_PROVIDER), api.clone(), sink.clone(), Labels::new(), 4);
        let initial = provider.cursor().to_string();

        let outcome = provider.collect_cycle().await;
        assert_eq!(outcome, CycleOutcome::Published(DecodeReport { emitted: 2, skipped: 1 }));

        let forwarded: Vec<String> = sink.events.lock().iter().map(|(_, e)| e.message.clone()).collect();
        assert_eq!(forwarded, vec!["Pool is full", "Pool is almost full"]);
        assert_eq!(provider.cursor(), "2024-05-01T10:00:00Z");

        provider.collect_cycle().await;
        assert_eq!(api.event_cursors(), vec![initial, "2024-05-01T10:00:00Z".to_string()]);
        assert_eq!(provider.stats().observations, 2);
    }

    #[tokio::test]
    async fn test_first_event_poll_reaches_back_an_hour() {
        let api = Arc::new(ScriptedArray::new(Vec::new()));
        let provider = EventProvider::new(
            fixed_settings(EVENT_PROVIDER),
            api,
            Arc::new(RecordingEventSink::default()),
            Labels::new(),
            MAX_EVENT_SEVERITY,
        );

        assert!(provider.cursor().ends_with('Z'));
        let since = humantime::parse_rfc3339(provider.cursor()).unwrap();
        let age = SystemTime::now().duration_since(since).unwrap();
        assert!(age >= Duration::from_secs(EVENT_LOOKBACK_SECS - 1));
        assert!(age < Duration::from_secs(EVENT_LOOKBACK_SECS + 60));
    }

    #[tokio::test]
    async fn test_event_fetch_failure_keeps_cursor() {
        let api = Arc::new(ScriptedArray::new(Vec::new()).with_event_pages(vec![Err(ApiError::Unauthorized {
            endpoint: "https://unity.test".to_string(),
            message: "401 Unauthorized".to_string(),
        })]));
        let sink = Arc::new(RecordingEventSink::default());
        let mut provider = EventProvider::new(fixed_settings(EVENT_PROVIDER), api, sink.clone(), Labels::new(), 8);
        let before = provider.cursor().to_string();

        assert_eq!(provider.collect_cycle().await, CycleOutcome::FetchFailed);
        assert_eq!(provider.cursor(), before);
        assert!(sink.events.lock().is_empty());
        assert_eq!(provider.stats().failed_cycles, 1);
    }
}


#[cfg(test)]
mod client_tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider as _;
    use pretty_assertions::assert_eq;

    const URL: &str = "https://unity.test/api";

    #[test]
    fn test_parse_catalog() {
        let body = br#"{
            "@base": "https://unity.test/api/types/metric/instances",
            "entries": [
                {"content": {"id": 10001, "name": "CPU Utilization", "path": "sp.*.cpu.summary.utilization",
                             "type": 4, "unitDisplayString": "%", "description": "SP CPU utilization"}},
                {"content": {"id": 10002, "path": "sp.*.storage.lun.*.readsRate", "type": 2}},
                {"content": {"id": 10003, "type": 2}}
            ]
        }"#;

        let catalog = parse_catalog(URL, body).unwrap();

        assert_eq!(
            catalog,
            vec![
                CatalogEntry::new("sp.*.cpu.summary.utilization", 4)
                    .with_unit("%")
                    .with_description("SP CPU utilization"),
                CatalogEntry::new("sp.*.storage.lun.*.readsRate", 2),
            ]
        );
    }

    #[test]
    fn test_parse_query_result() {
        let body = br#"{"entries": [{"content": {
            "queryId": 5,
            "path": "sp.*.storage.lun.*.readsRate",
            "timestamp": "2024-01-01T00:00:00.000Z",
            "values": {"spa": {"sv_1": "1.5", "sv_2": 7}}
        }}]}"#;

        let entries = parse_query_result(URL, body).unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "sp.*.storage.lun.*.readsRate");
        assert_eq!(
            entries[0].tree,
            ResultValue::node([(
                "spa",
                ResultValue::node([("sv_1", ResultValue::leaf("1.5")), ("sv_2", ResultValue::leaf("7"))]),
            )])
        );
        assert!(parse_query_result(URL, br#"{"entries": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_query_created() {
        assert_eq!(parse_query_created(URL, br#"{"content": {"id": 42}}"#).unwrap(), QueryId::new("42"));
        assert!(matches!(
            parse_query_created(URL, br#"{"content": {"id": null}}"#),
            Err(ApiError::InvalidResponse { .. })
        ));
        assert!(matches!(parse_query_created(URL, b"not json"), Err(ApiError::InvalidResponse { .. })));
    }

    #[test]
    fn test_parse_system_identity() {
        let body = br#"{"entries": [{"content": {"id": "0", "name": "unity01", "serialNumber": "CKM001"}}]}"#;

        assert_eq!(
            parse_system_identity(URL, body).unwrap(),
            SystemIdentity {
                name: "unity01".to_string(),
                serial_number: "CKM001".to_string(),
            }
        );
        assert!(parse_system_identity(URL, br#"{"entries": []}"#).is_err());
    }

    #[test]
    fn test_parse_instances() {
        let body = br#"{"entries": [
            {"content": {"id": "sv_1", "name": "lun-a", "wwn": "60:06", "sizeTotal": 1073741824,
                         "sizeUsed": 1024, "sizeAllocated": 2048}},
            {"content": {"id": "sv_2"}}
        ]}"#;

        let luns: Vec<LunInstance> = parse_instances(URL, body).unwrap();

        assert_eq!(luns.len(), 2);
        assert_eq!(luns[0].name, "lun-a");
        assert_eq!(luns[0].size_total, 1_073_741_824);
        assert_eq!(luns[0].size_allocated, 2048);
        assert_eq!(luns[1], LunInstance::default());
        assert!(parse_instances::<SystemCapacity>(URL, br#"{"entries": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_event_page() {
        let body = br#"{"updated": "2024-05-01T10:00:00.000Z", "entries": [{"content": {
            "id": "event_1", "creationTime": "2024-05-01T09:58:12.000Z", "severity": 4,
            "messageId": "14:6000c", "message": "Storage pool is nearly full", "source": "pool_1"
        }}]}"#;

        let page = parse_event_page(URL, body).unwrap();

        assert_eq!(page.updated.as_deref(), Some("2024-05-01T10:00:00.000Z"));
        assert_eq!(
            page.events,
            vec![ArrayEvent {
                creation_time: "2024-05-01T09:58:12.000Z".to_string(),
                severity: 4,
                message_id: "14:6000c".to_string(),
                message: "Storage pool is nearly full".to_string(),
                source: "pool_1".to_string(),
            }]
        );
        assert_eq!(page.events[0].severity_name(), "WARNING");
    }

    #[test]
    fn test_parse_error_message() {
        let body = br#"{"error": {"errorCode": 131149829, "httpStatusCode": 422,
            "messages": [{"en-US": "The specified query does not exist."}]}}"#;

        assert_eq!(
            parse_error_message(body).as_deref(),
            Some("The specified query does not exist.")
        );
        assert_eq!(parse_error_message(b"<html>"), None);
    }

    #[tokio::test]
    async fn test_client_rejects_oversized_query_locally() {
        let target = ResolvedTarget {
            endpoint: "http://127.0.0.1:9".to_string(),
            credentials: None,
            insecure: false,
            labels: BTreeMap::new(),
        };
        let client = UnisphereClient::new(&target, Duration::from_secs(1)).unwrap();
        let paths: Vec<String> = (0..49).map(|i| format!("p{}", i)).collect();

        let created = client.create_realtime_query(&paths, Duration::from_secs(60)).await;

        assert!(matches!(created, Err(ApiError::InvalidRequest { .. })));
    }

    #[test]
    fn test_otel_backend_snapshot() {
        let meter = opentelemetry::metrics::noop::NoopMeterProvider::new().meter("test");
        let backend = OtelBackend::new(meter);

        let cpu = MetricDescriptor::synthesize(
            &CatalogEntry::new("sp.*.cpuUtil", 5).with_unit("%"),
            MetricKind::Gauge,
        );
        let reads = MetricDescriptor::synthesize(&CatalogEntry::new("sp.*.reads", 2), MetricKind::Counter);
        backend.declare_instrument(&cpu).unwrap();
        backend.declare_instrument(&reads).unwrap();
        backend.seal().unwrap();
        assert_eq!(backend.instrument_count(), 2);

        backend.publish(vec![Observation {
            key: cpu.key.clone(),
            value: 12.5,
            labels: smallvec::smallvec![Label::new("sp", "spa")],
        }]);
        assert_eq!(backend.current_snapshot().len(), 1);

        backend.close();
        assert!(backend.current_snapshot().is_empty());
    }

    #[test]
    fn test_error_classification() {
        let stale = ExporterError::from(ApiError::QueryNotFound { query_id: "7".to_string() });
        assert!(stale.is_recoverable());
        assert_eq!(stale.category(), "api");
        assert_eq!(stale.recovery_hint(), RecoveryHint::RecreateQuery);

        let capacity = ExporterError::from(PipelineError::CapacityExceeded { count: 49, capacity: 48 });
        assert!(!capacity.is_recoverable());
        assert_eq!(capacity.recovery_hint(), RecoveryHint::FixConfiguration);
    }
}
