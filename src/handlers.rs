use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::Json;
use json_patch::jsonptr::Pointer;
use json_patch::Patch;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::PolicyConfig;
use crate::engine::PatchGenerator;
use crate::error::Error;
use crate::kind::{object_details, ResourceKind, Workload};
use crate::metrics::{InjectionLabels, K8tzMetrics, RequestLabels, ResponseLabels, SkipLabels};
use crate::namespace::NamespaceLookup;
use crate::policy::{resolve, resolve_cron_job, Annotations, Resolution};

pub struct AppState<L> {
    pub config: PolicyConfig,
    pub namespaces: L,
    pub metrics: K8tzMetrics,
}

pub type SharedState<L> = Arc<AppState<L>>;

pub async fn handle_mutate<L: NamespaceLookup>(
    State(state): State<SharedState<L>>,
    body: Json<Value>,
) -> Json<Value> {
    let start = Instant::now();

    let review: AdmissionReview<DynamicObject> = match serde_json::from_value(body.0) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to deserialize AdmissionReview: {e}");
            let resp = AdmissionResponse::invalid(format!("failed to deserialize request: {e}"));
            return review_to_json(resp.into_review());
        }
    };

    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(r) => r,
        Err(e) => {
            warn!("AdmissionReview missing request field: {e}");
            let resp = AdmissionResponse::invalid("missing request field in AdmissionReview");
            return review_to_json(resp.into_review());
        }
    };

    record_request_metrics(&state, &req);
    let response = admit(&state, &req).await;
    record_response_metrics(&state, response.allowed);
    state
        .metrics
        .admission_request_duration_seconds
        .observe(start.elapsed().as_secs_f64());

    review_to_json(response.into_review())
}

fn review_to_json(review: AdmissionReview<DynamicObject>) -> Json<Value> {
    match serde_json::to_value(review) {
        Ok(value) => Json(value),
        Err(e) => {
            error!("failed to serialize AdmissionReview: {e}");
            Json(Value::Null)
        }
    }
}

/// Injectable resources, keyed by the admission request's group/version/resource.
fn supported_kind(req: &AdmissionRequest<DynamicObject>) -> Option<ResourceKind> {
    let gvr = &req.resource;
    match (gvr.group.as_str(), gvr.version.as_str(), gvr.resource.as_str()) {
        ("", "v1", "pods") => Some(ResourceKind::Pod),
        ("batch", "v1", "cronjobs") => Some(ResourceKind::CronJob),
        _ => None,
    }
}

/// Builds the admission response. Anything other than a pod or cronjob creation
/// is allowed untouched; every failure on the injection path denies the request.
pub async fn admit<L: NamespaceLookup>(
    state: &AppState<L>,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let kind = match supported_kind(req) {
        Some(kind) if matches!(req.operation, Operation::Create) => kind,
        _ => {
            debug!(uid = %req.uid, resource = %req.resource.resource, "resource is not handled, allowing");
            return AdmissionResponse::from(req);
        }
    };

    match patches_for(state, req, &kind).await {
        Ok(ops) if ops.is_empty() => AdmissionResponse::from(req),
        Ok(ops) => match AdmissionResponse::from(req).with_patch(Patch(ops)) {
            Ok(resp) => resp,
            Err(e) => {
                error!(uid = %req.uid, "failed to serialize patches: {e}");
                AdmissionResponse::from(req).deny(format!("failed to serialize patches: {e}"))
            }
        },
        Err(e) => {
            error!(uid = %req.uid, "rejecting admission request: {e}");
            AdmissionResponse::from(req).deny(e.to_string())
        }
    }
}

async fn patches_for<L: NamespaceLookup>(
    state: &AppState<L>,
    req: &AdmissionRequest<DynamicObject>,
    kind: &ResourceKind,
) -> Result<Vec<json_patch::PatchOperation>, Error> {
    let object = match &req.object {
        Some(object) => serde_json::to_value(object)?,
        None => return Err(Error::NotInjectable(format!("{kind} without object"))),
    };
    let workload = Workload::decode(kind, &object)?;

    let namespace_annotations: Option<Annotations> = match req.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => Some(state.namespaces.annotations(namespace).await?),
        _ => None,
    };

    let mut metadata = workload.metadata().cloned().unwrap_or_default();
    if metadata.namespace.is_none() {
        metadata.namespace = req.namespace.clone();
    }
    let details = object_details(Some(&metadata));

    let resolver = match kind {
        ResourceKind::CronJob => resolve_cron_job,
        _ => resolve,
    };
    let policy = match resolver(
        metadata.annotations.as_ref(),
        namespace_annotations.as_ref(),
        &state.config,
        &details,
    )? {
        Resolution::Skip(reason) => {
            info!(object = %details, "skipping injection: {reason}");
            state
                .metrics
                .skipped_total
                .get_or_create(&SkipLabels {
                    reason: reason.as_str(),
                })
                .inc();
            return Ok(Vec::new());
        }
        Resolution::Inject(policy) => policy,
    };

    let ops = PatchGenerator::new(&state.config, &policy).generate(&workload, Pointer::root())?;
    if ops.is_empty() {
        debug!(object = %details, kind = %kind, "nothing to inject");
        return Ok(ops);
    }

    info!(
        object = %details,
        timezone = %policy.timezone,
        strategy = %policy.strategy,
        patches = ops.len(),
        "injecting timezone"
    );
    state
        .metrics
        .injections_total
        .get_or_create(&InjectionLabels {
            kind: kind.to_string(),
            strategy: policy.strategy.as_str(),
        })
        .inc();

    Ok(ops)
}

fn record_request_metrics<L>(state: &AppState<L>, req: &AdmissionRequest<DynamicObject>) {
    let operation = format!("{:?}", req.operation).to_uppercase();
    let resource = req.resource.resource.clone();

    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels { operation, resource })
        .inc();
}

fn record_response_metrics<L>(state: &AppState<L>, allowed: bool) {
    state
        .metrics
        .admission_responses_total
        .get_or_create(&ResponseLabels {
            allowed: if allowed { "true" } else { "false" },
        })
        .inc();
}
