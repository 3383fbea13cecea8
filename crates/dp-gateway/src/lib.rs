#![forbid(unsafe_code)]

//! The gateway to the external data service.
//!
//! The service itself is out of scope; this crate owns the request and
//! response contracts plus the client-side discipline around them:
//! GET-shaped calls are content-addressed and cached for the session, and
//! the two expensive calls (dimension values, correlation) are funneled
//! through a single-concurrency FIFO queue. In-flight work is never
//! aborted — each queued fetch carries the plot config it was issued for,
//! and the consumer discards results whose tag no longer matches.
//!
//! One gateway is constructed per application session and passed by
//! reference, so tests substitute a fake backend without any
//! module-level state.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dp_context::Context;
use dp_plot::{ColorBy, Dimension, PlotConfig, SliceRef};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("data service request failed: {0}")]
    Backend(String),
    #[error("gateway codec failure: {0}")]
    Codec(String),
    #[error("gateway lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub dataset_id: String,
    pub label: String,
    pub entity_type: String,
    pub units: Option<String>,
}

/// GET `/datasets_by_index_type` — the full catalogue, keyed by the
/// index type a plot ranges over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DatasetCatalog {
    pub by_index_type: BTreeMap<String, Vec<DatasetDescriptor>>,
}

/// POST `/datasets_matching_context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetsMatchingContextRequest {
    pub context: Context,
}

/// GET `/entity_labels` (`dataset_id: None`) and
/// GET `/entity_labels_of_dataset` (`dataset_id: Some`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLabelsRequest {
    pub entity_type: String,
    pub dataset_id: Option<String>,
}

/// GET `/unique_values_or_range`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueValuesRequest {
    pub slice_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_type", rename_all = "snake_case")]
pub enum SliceValueDomain {
    Categorical { unique_values: Vec<String> },
    Continuous { min: f64, max: f64 },
}

/// POST `/evaluate_context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateContextRequest {
    pub context: Context,
    pub summarize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEvaluation {
    pub num_matches: usize,
    pub num_candidates: Option<usize>,
}

/// POST `/plot_dimensions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotDimensionsRequest {
    pub index_type: String,
    pub color_by: Option<ColorBy>,
    pub dimensions: BTreeMap<String, Dimension>,
    pub filters: BTreeMap<String, Context>,
    pub metadata: BTreeMap<String, SliceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionValues {
    pub axis_label: String,
    pub dataset_label: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotDimensionsResponse {
    pub index_labels: Vec<String>,
    pub dimensions: BTreeMap<String, DimensionValues>,
}

/// POST `/get_correlation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRequest {
    pub index_type: String,
    pub dimensions: BTreeMap<String, Dimension>,
    pub filters: BTreeMap<String, Context>,
    pub use_clustering: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResponse {
    pub index_labels: Vec<String>,
    pub matrix: Vec<Vec<f64>>,
}

/// The seam to the data service. Implementations perform the actual
/// transport; the gateway never cares how.
pub trait DataBackend {
    fn datasets_by_index_type(&self) -> Result<DatasetCatalog, GatewayError>;

    fn datasets_matching_context(
        &self,
        request: &DatasetsMatchingContextRequest,
    ) -> Result<Vec<DatasetDescriptor>, GatewayError>;

    fn entity_labels(&self, request: &EntityLabelsRequest) -> Result<Vec<String>, GatewayError>;

    fn unique_values_or_range(
        &self,
        request: &UniqueValuesRequest,
    ) -> Result<SliceValueDomain, GatewayError>;

    fn evaluate_context(
        &self,
        request: &EvaluateContextRequest,
    ) -> Result<ContextEvaluation, GatewayError>;

    fn plot_dimensions(
        &self,
        request: &PlotDimensionsRequest,
    ) -> Result<PlotDimensionsResponse, GatewayError>;

    fn correlation(&self, request: &CorrelationRequest)
    -> Result<CorrelationResponse, GatewayError>;
}

/// A queued expensive fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpensiveRequest {
    PlotDimensions(PlotDimensionsRequest),
    Correlation(CorrelationRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpensiveResponse {
    PlotDimensions(PlotDimensionsResponse),
    Correlation(CorrelationResponse),
}

#[derive(Debug, Clone, PartialEq)]
struct QueuedFetch {
    tag: PlotConfig,
    request: ExpensiveRequest,
}

/// What the queue hands back: the tag the fetch was issued under and its
/// outcome. A backend failure is an outcome, not a gateway failure — the
/// UI renders it as an error state and nothing is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedResult {
    pub tag: PlotConfig,
    pub result: Result<ExpensiveResponse, GatewayError>,
}

/// True when a resolved fetch no longer matches the config in effect and
/// its result must be disregarded.
#[must_use]
pub fn is_stale(tag: &PlotConfig, current: &PlotConfig) -> bool {
    tag != current
}

pub struct DataGateway<B> {
    backend: B,
    cache: Mutex<BTreeMap<String, String>>,
    queue: Mutex<VecDeque<QueuedFetch>>,
}

impl<B: DataBackend> DataGateway<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            cache: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn datasets_by_index_type(&self) -> Result<DatasetCatalog, GatewayError> {
        self.cached("datasets_by_index_type", &(), |backend, _| {
            backend.datasets_by_index_type()
        })
    }

    pub fn entity_labels(
        &self,
        request: &EntityLabelsRequest,
    ) -> Result<Vec<String>, GatewayError> {
        self.cached("entity_labels", request, DataBackend::entity_labels)
    }

    pub fn unique_values_or_range(
        &self,
        request: &UniqueValuesRequest,
    ) -> Result<SliceValueDomain, GatewayError> {
        self.cached(
            "unique_values_or_range",
            request,
            DataBackend::unique_values_or_range,
        )
    }

    pub fn datasets_matching_context(
        &self,
        request: &DatasetsMatchingContextRequest,
    ) -> Result<Vec<DatasetDescriptor>, GatewayError> {
        self.backend.datasets_matching_context(request)
    }

    pub fn evaluate_context(
        &self,
        request: &EvaluateContextRequest,
    ) -> Result<ContextEvaluation, GatewayError> {
        self.backend.evaluate_context(request)
    }

    /// Queues an expensive fetch behind everything already waiting,
    /// tagged with the plot config that wants it.
    pub fn enqueue(&self, tag: PlotConfig, request: ExpensiveRequest) -> Result<(), GatewayError> {
        let mut queue = self.queue.lock().map_err(|_| GatewayError::LockPoisoned)?;
        queue.push_back(QueuedFetch { tag, request });
        #[cfg(feature = "tracing")]
        tracing::debug!(depth = queue.len(), "expensive fetch queued");
        Ok(())
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Runs exactly one queued fetch — the single-concurrency guarantee —
    /// and returns its tagged outcome, or `None` when the queue is empty.
    /// A superseded request still runs to completion here; staleness is
    /// the consumer's call via [`is_stale`].
    pub fn run_next(&self) -> Result<Option<QueuedResult>, GatewayError> {
        let next = {
            let mut queue = self.queue.lock().map_err(|_| GatewayError::LockPoisoned)?;
            queue.pop_front()
        };
        let Some(QueuedFetch { tag, request }) = next else {
            return Ok(None);
        };
        let result = match &request {
            ExpensiveRequest::PlotDimensions(request) => self
                .backend
                .plot_dimensions(request)
                .map(ExpensiveResponse::PlotDimensions),
            ExpensiveRequest::Correlation(request) => self
                .backend
                .correlation(request)
                .map(ExpensiveResponse::Correlation),
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(ok = result.is_ok(), "expensive fetch resolved");
        Ok(Some(QueuedResult { tag, result }))
    }

    /// Content-addressed session cache for GET-shaped calls: the first
    /// call reaches the backend, identical repeats are served locally.
    /// Only successes are cached.
    fn cached<Req, Resp>(
        &self,
        endpoint: &str,
        request: &Req,
        fetch: impl FnOnce(&B, &Req) -> Result<Resp, GatewayError>,
    ) -> Result<Resp, GatewayError>
    where
        Req: Serialize,
        Resp: Serialize + DeserializeOwned,
    {
        let key = format!(
            "{endpoint}?{}",
            serde_json::to_string(request).map_err(|err| GatewayError::Codec(err.to_string()))?
        );
        {
            let cache = self.cache.lock().map_err(|_| GatewayError::LockPoisoned)?;
            if let Some(json) = cache.get(&key) {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint, "gateway cache hit");
                return serde_json::from_str(json)
                    .map_err(|err| GatewayError::Codec(err.to_string()));
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint, "gateway cache miss");
        let response = fetch(&self.backend, request)?;
        let json = serde_json::to_string(&response)
            .map_err(|err| GatewayError::Codec(err.to_string()))?;
        let mut cache = self.cache.lock().map_err(|_| GatewayError::LockPoisoned)?;
        cache.insert(key, json);
        Ok(response)
    }
}
