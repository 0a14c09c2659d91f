use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::route::{
    AdminOutcome, AdminRequest, Passage, Route, RouteInfo, RouteTable, RouterHandle, RouterState,
    apply_admin, close_all,
};
use super::{ADMIN_CAPACITY, RouterError};
use crate::scope::Scope;

/// How a fan-out router hands a message to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Wait for room in every admitting route.
    #[default]
    Blocking,
    /// Skip routes whose buffer is full.
    TrySend,
}

/// Distributes each message from one source to every route whose passage admits it.
pub struct FanOutRouter<O> {
    inner: Arc<RouterHandle<mpsc::Sender<O>, O>>,
}

impl<O> Clone for FanOutRouter<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O> FanOutRouter<O>
where
    O: Clone + Send + 'static,
{
    /// Spawn the router task. Messages stay in `source` until [`start`](Self::start).
    ///
    /// `mapper` converts each source message; `None` drops it.
    pub fn spawn<T, M>(
        name: impl Into<String>,
        source: mpsc::Receiver<T>,
        mapper: M,
        delivery: Delivery,
        scope: &Scope,
    ) -> Self
    where
        T: Send + 'static,
        M: Fn(T) -> Option<O> + Send + 'static,
    {
        let name = name.into();
        let (admin_tx, admin_rx) = mpsc::channel(ADMIN_CAPACITY);
        let (state_tx, state_rx) = watch::channel(RouterState::Created);
        let task = scope.spawn(run_fan_out(
            name.clone(),
            source,
            mapper,
            delivery,
            admin_rx,
            state_tx,
            scope.clone(),
        ));
        Self {
            inner: Arc::new(RouterHandle::new(name, admin_tx, state_rx, task)),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> RouterState {
        self.inner.state()
    }

    /// Register a route and return its receiving end.
    pub async fn new_route(
        &self,
        name: impl Into<String>,
        capacity: usize,
        passage: Passage<O>,
    ) -> Result<mpsc::Receiver<O>, RouterError> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        self.inner
            .add(Route {
                name: name.into(),
                capacity,
                passage,
                endpoint: tx,
            })
            .await?;
        Ok(rx)
    }

    /// Remove a route. Once this returns the route receives nothing further.
    pub async fn remove_route(&self, name: &str) -> Result<Option<RouteInfo>, RouterError> {
        self.inner.remove(name).await
    }

    pub async fn get_route(&self, name: &str) -> Result<Option<RouteInfo>, RouterError> {
        self.inner.get(name).await
    }

    pub async fn start(&self) -> Result<(), RouterError> {
        self.inner.start().await
    }

    /// Terminate the router, closing all routes.
    pub async fn close(&self) {
        self.inner.close().await
    }

    pub async fn terminated(&self) {
        self.inner.terminated_signal().await
    }
}

async fn run_fan_out<T, O, M>(
    name: String,
    mut source: mpsc::Receiver<T>,
    mapper: M,
    delivery: Delivery,
    mut admin_rx: mpsc::Receiver<AdminRequest<mpsc::Sender<O>, O>>,
    state: watch::Sender<RouterState>,
    scope: Scope,
) where
    T: Send + 'static,
    O: Clone + Send + 'static,
    M: Fn(T) -> Option<O> + Send + 'static,
{
    let cancel = scope.token();
    let mut routes: RouteTable<mpsc::Sender<O>, O> = RouteTable::new();
    let mut ack = None;

    loop {
        let routing = *state.borrow() == RouterState::Routing;
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(router = %name, "Router cancelled");
                break;
            }
            request = admin_rx.recv() => match request {
                Some(request) => {
                    if let AdminOutcome::Terminate(tx) = apply_admin(&name, request, &mut routes, &state) {
                        ack = Some(tx);
                        break;
                    }
                }
                None => {
                    tracing::debug!(router = %name, "All router handles dropped");
                    break;
                }
            },
            msg = source.recv(), if routing => match msg {
                Some(msg) => {
                    let mapped = match catch_unwind(AssertUnwindSafe(|| mapper(msg))) {
                        Ok(Some(mapped)) => mapped,
                        Ok(None) => continue,
                        Err(_) => {
                            tracing::error!(router = %name, "Mapper panicked, dropping message");
                            continue;
                        }
                    };
                    dispatch(&name, mapped, &mut routes, delivery).await;
                }
                None => {
                    tracing::debug!(router = %name, "Source closed");
                    break;
                }
            },
        }
    }

    close_all(&name, &mut routes, &state, ack);
}

async fn dispatch<O: Clone>(
    router: &str,
    msg: O,
    routes: &mut RouteTable<mpsc::Sender<O>, O>,
    delivery: Delivery,
) {
    let mut closed = Vec::new();
    for (route_name, route) in routes.iter() {
        if !route.admits(&msg) {
            continue;
        }
        match delivery {
            Delivery::Blocking => {
                if route.endpoint.send(msg.clone()).await.is_err() {
                    closed.push(route_name.clone());
                }
            }
            Delivery::TrySend => match route.endpoint.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(%router, route = %route_name, "Route full, message skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(route_name.clone());
                }
            },
        }
    }
    for route_name in closed {
        routes.shift_remove(&route_name);
        tracing::debug!(%router, route = %route_name, "Route closed by consumer, removed");
    }
}
