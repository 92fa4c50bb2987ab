use kdisco_core::{ClientError, ConsumerKey, Namespace, SelectorError};

/// Problems found while applying a desired state. None of them abort a reconcile pass.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid spec for {consumer}: {source}")]
    InvalidSpec {
        consumer: ConsumerKey,
        #[source]
        source: SelectorError,
    },
    #[error("watch on namespace {namespace} failed: {source}")]
    Watch {
        namespace: Namespace,
        #[source]
        source: ClientError,
    },
}
