use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub allowed: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InjectionLabels {
    pub kind: String,
    pub strategy: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SkipLabels {
    pub reason: &'static str,
}

pub struct K8tzMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub admission_responses_total: Family<ResponseLabels, Counter>,
    pub injections_total: Family<InjectionLabels, Counter>,
    pub skipped_total: Family<SkipLabels, Counter>,
    pub admission_request_duration_seconds: Histogram,
}

const DURATION_BUCKETS: [f64; 14] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl K8tzMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "k8tz_admission_requests",
            "Total number of admission requests received",
            admission_requests_total.clone(),
        );

        let admission_responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "k8tz_admission_responses",
            "Total number of admission responses sent",
            admission_responses_total.clone(),
        );

        let injections_total = Family::<InjectionLabels, Counter>::default();
        registry.register(
            "k8tz_injections",
            "Total number of objects patched with a timezone",
            injections_total.clone(),
        );

        let skipped_total = Family::<SkipLabels, Counter>::default();
        registry.register(
            "k8tz_skipped",
            "Total number of objects admitted without injection",
            skipped_total.clone(),
        );

        let admission_request_duration_seconds = Histogram::new(DURATION_BUCKETS.iter().copied());
        registry.register(
            "k8tz_admission_request_duration_seconds",
            "Duration of admission request processing in seconds",
            admission_request_duration_seconds.clone(),
        );

        Self {
            admission_requests_total,
            admission_responses_total,
            injections_total,
            skipped_total,
            admission_request_duration_seconds,
        }
    }
}
