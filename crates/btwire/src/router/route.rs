//! Route table entries and the admin protocol shared by both router kinds.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex as StdMutex};

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::RouterError;

/// Admission predicate evaluated per message and per route.
pub type Passage<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Passage that admits every message.
pub fn open<T>() -> Passage<T> {
    Arc::new(|_| true)
}

/// Lifecycle of a router task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterState {
    /// Accepting route changes, not yet forwarding data.
    Created,
    Routing,
    Terminated,
}

/// Snapshot of a registered route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub name: String,
    pub capacity: usize,
}

/// One registered route. `E` is the router's end of the route channel.
pub(crate) struct Route<E, T> {
    pub name: String,
    pub capacity: usize,
    pub passage: Passage<T>,
    pub endpoint: E,
}

impl<E, T> Route<E, T> {
    /// Evaluate the passage. A panicking predicate denies the message.
    pub fn admits(&self, msg: &T) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.passage)(msg))) {
            Ok(admitted) => admitted,
            Err(_) => {
                tracing::error!(route = %self.name, "Passage panicked, denying message");
                false
            }
        }
    }

    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            name: self.name.clone(),
            capacity: self.capacity,
        }
    }
}

pub(crate) type RouteTable<E, T> = IndexMap<String, Route<E, T>>;

/// Requests served by a router task. Each carries its own reply channel.
pub(crate) enum AdminRequest<E, T> {
    Add {
        route: Route<E, T>,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    Remove {
        name: String,
        reply: oneshot::Sender<Option<RouteInfo>>,
    },
    Get {
        name: String,
        reply: oneshot::Sender<Option<RouteInfo>>,
    },
    Start {
        reply: oneshot::Sender<()>,
    },
    Terminate {
        ack: oneshot::Sender<()>,
    },
}

/// What the router loop should do after an admin request.
pub(crate) enum AdminOutcome {
    Continue,
    Terminate(oneshot::Sender<()>),
}

/// Apply one admin request to the route table.
pub(crate) fn apply_admin<E, T>(
    router: &str,
    request: AdminRequest<E, T>,
    routes: &mut RouteTable<E, T>,
    state: &watch::Sender<RouterState>,
) -> AdminOutcome {
    match request {
        AdminRequest::Add { route, reply } => {
            let result = if route.name.is_empty() {
                Err(RouterError::Rejected("route name must not be empty".to_string()))
            } else {
                let name = route.name.clone();
                let capacity = route.capacity;
                if routes.insert(name.clone(), route).is_some() {
                    tracing::warn!(%router, route = %name, "Route replaced by new registration");
                } else {
                    tracing::debug!(%router, route = %name, capacity, "Route added");
                }
                Ok(())
            };
            let _ = reply.send(result);
        }
        AdminRequest::Remove { name, reply } => {
            let removed = routes.shift_remove(&name).map(|r| r.info());
            if removed.is_some() {
                tracing::debug!(%router, route = %name, "Route removed");
            }
            let _ = reply.send(removed);
        }
        AdminRequest::Get { name, reply } => {
            let _ = reply.send(routes.get(&name).map(Route::info));
        }
        AdminRequest::Start { reply } => {
            if *state.borrow() == RouterState::Created {
                tracing::debug!(%router, routes = routes.len(), "Router started");
                let _ = state.send(RouterState::Routing);
            }
            let _ = reply.send(());
        }
        AdminRequest::Terminate { ack } => return AdminOutcome::Terminate(ack),
    }
    AdminOutcome::Continue
}

/// Drop every route endpoint, closing the channels, then publish termination.
pub(crate) fn close_all<E, T>(
    router: &str,
    routes: &mut RouteTable<E, T>,
    state: &watch::Sender<RouterState>,
    ack: Option<oneshot::Sender<()>>,
) {
    let count = routes.len();
    routes.clear();
    let _ = state.send(RouterState::Terminated);
    tracing::debug!(%router, routes = count, "Router terminated");
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

/// Client side of a router task, shared by both router kinds.
pub(crate) struct RouterHandle<E, T> {
    name: String,
    admin: mpsc::Sender<AdminRequest<E, T>>,
    state: watch::Receiver<RouterState>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl<E, T> RouterHandle<E, T> {
    pub fn new(
        name: String,
        admin: mpsc::Sender<AdminRequest<E, T>>,
        state: watch::Receiver<RouterState>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            admin,
            state,
            task: StdMutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RouterState {
        *self.state.borrow()
    }

    fn terminated(&self) -> RouterError {
        RouterError::Terminated(self.name.clone())
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> AdminRequest<E, T>,
    ) -> Result<R, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.admin
            .send(build(tx))
            .await
            .map_err(|_| self.terminated())?;
        rx.await.map_err(|_| self.terminated())
    }

    pub async fn add(&self, route: Route<E, T>) -> Result<(), RouterError> {
        self.request(|reply| AdminRequest::Add { route, reply })
            .await?
    }

    pub async fn remove(&self, name: &str) -> Result<Option<RouteInfo>, RouterError> {
        let name = name.to_string();
        self.request(|reply| AdminRequest::Remove { name, reply })
            .await
    }

    pub async fn get(&self, name: &str) -> Result<Option<RouteInfo>, RouterError> {
        let name = name.to_string();
        self.request(|reply| AdminRequest::Get { name, reply }).await
    }

    pub async fn start(&self) -> Result<(), RouterError> {
        self.request(|reply| AdminRequest::Start { reply }).await
    }

    /// Terminate the router and wait for its task. Safe to call repeatedly.
    pub async fn close(&self) {
        // An error here means the router already terminated on its own.
        let _ = self.request(|ack| AdminRequest::Terminate { ack }).await;

        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(router = %self.name, error = %e, "Router task ended abnormally");
        }
    }

    /// Wait until the router reaches the terminated state.
    pub async fn terminated_signal(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|s| *s == RouterState::Terminated)
            .await;
    }
}
