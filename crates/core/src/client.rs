//! Contracts between the engine and its collaborators: the cluster client it
//! reads from and the dispatcher it writes notifications to.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ConsumerKey, Namespace, ObjectKind, ObjectRef, ObjectUpdate, OwnerTree, Uid, WatchedObject};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("object {0} has no metadata.uid")]
    MissingUid(String),
    #[error("invalid apiVersion: {0}")]
    InvalidApiVersion(String),
    #[error("watch channel closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Opens namespace-scoped watches. Implementations own transport, relisting and backoff.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Start watching `kind` objects in `namespace`.
    ///
    /// Establishment errors (auth, connectivity) must be returned here rather than by
    /// closing the channel. The channel closes when `cancel` fires or the server ends the watch.
    async fn watch_namespace(
        &self,
        kind: ObjectKind,
        namespace: &Namespace,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ObjectUpdate>, ClientError>;
}

/// Resolves the transitive `ownerReferences` chain of an object.
#[async_trait::async_trait]
pub trait OwnerFetcher: Send + Sync {
    async fn resolve_owner_tree(&self, subject: &ObjectRef) -> Result<OwnerTree, ClientError>;
}

/// Notification emitted to the rest of the system. Redelivery is safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Changed {
        consumer: ConsumerKey,
        object: Arc<WatchedObject>,
        /// The claimed UID in the owner chain that matched; `None` for label-selector matches.
        ancestor: Option<Uid>,
    },
    Deleted { kind: ObjectKind, namespace: Namespace, name: String },
    WatchError { kind: ObjectKind, namespace: Namespace, message: String },
}

impl Action {
    pub fn consumer(&self) -> Option<&ConsumerKey> {
        match self {
            Action::Changed { consumer, .. } => Some(consumer),
            _ => None,
        }
    }
}

pub trait Dispatch: Send + Sync {
    fn dispatch(&self, action: Action);
}

impl Dispatch for mpsc::UnboundedSender<Action> {
    fn dispatch(&self, action: Action) {
        // receiver gone means the system is shutting down
        let _ = self.send(action);
    }
}

impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    fn dispatch(&self, action: Action) { (**self).dispatch(action) }
}
