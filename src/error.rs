use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to decode yaml document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to decode object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not injectable object: {0}")]
    NotInjectable(String),

    #[error("unknown injection strategy specified: {0}")]
    UnknownStrategy(String),

    /// Malformed init container resources must never produce an unconstrained container.
    #[error("failed to parse init container resources json: {0}")]
    InvalidResources(#[source] serde_json::Error),

    #[error("failed to apply patch: {0}")]
    Apply(#[from] json_patch::PatchError),

    #[error("failed to lookup namespace '{namespace}': {source}")]
    NamespaceLookup {
        namespace: String,
        source: kube::Error,
    },

    #[error("failed to setup connection with kubernetes api: {0}")]
    KubeConfig(String),

    #[error("failed to fetch input: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("failed to {action} '{path}': {source}")]
    Bootstrap {
        action: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transformation failed for input: {identifier}({arg_number}), error: {source}")]
    Input {
        identifier: String,
        arg_number: usize,
        source: Box<Error>,
    },
}
