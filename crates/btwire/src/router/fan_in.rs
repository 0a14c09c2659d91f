use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, watch};

use super::route::{
    AdminOutcome, AdminRequest, Passage, Route, RouteInfo, RouteTable, RouterHandle, RouterState,
    apply_admin, close_all,
};
use super::{ADMIN_CAPACITY, RouterError};
use crate::scope::Scope;

/// Merges messages from many routes into one sink.
///
/// Routes are polled round-robin so a busy producer cannot starve the rest.
/// When the sink closes the router terminates.
pub struct FanInRouter<I> {
    inner: Arc<RouterHandle<mpsc::Receiver<I>, I>>,
}

impl<I> Clone for FanInRouter<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I> FanInRouter<I>
where
    I: Send + 'static,
{
    pub fn spawn<O, M>(
        name: impl Into<String>,
        sink: mpsc::Sender<O>,
        mapper: M,
        scope: &Scope,
    ) -> Self
    where
        O: Send + 'static,
        M: Fn(I) -> Option<O> + Send + 'static,
    {
        let name = name.into();
        let (admin_tx, admin_rx) = mpsc::channel(ADMIN_CAPACITY);
        let (state_tx, state_rx) = watch::channel(RouterState::Created);
        let task = scope.spawn(run_fan_in(
            name.clone(),
            sink,
            mapper,
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

    /// Register a route and return its sending end.
    pub async fn new_route(
        &self,
        name: impl Into<String>,
        capacity: usize,
        passage: Passage<I>,
    ) -> Result<mpsc::Sender<I>, RouterError> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        self.inner
            .add(Route {
                name: name.into(),
                capacity,
                passage,
                endpoint: rx,
            })
            .await?;
        Ok(tx)
    }

    pub async fn remove_route(&self, name: &str) -> Result<Option<RouteInfo>, RouterError> {
        self.inner.remove(name).await
    }

    pub async fn get_route(&self, name: &str) -> Result<Option<RouteInfo>, RouterError> {
        self.inner.get(name).await
    }

    pub async fn start(&self) -> Result<(), RouterError> {
        self.inner.start().await
    }

    pub async fn close(&self) {
        self.inner.close().await
    }

    pub async fn terminated(&self) {
        self.inner.terminated_signal().await
    }
}

/// Outcome of polling the route table once.
enum Polled<I> {
    Message(String, I),
    Closed(String),
}

fn poll_routes<I>(
    routes: &mut RouteTable<mpsc::Receiver<I>, I>,
    cursor: &mut usize,
    cx: &mut Context<'_>,
) -> Poll<Polled<I>> {
    let len = routes.len();
    for offset in 0..len {
        let index = (*cursor + offset) % len;
        let Some((name, route)) = routes.get_index_mut(index) else {
            continue;
        };
        if let Poll::Ready(msg) = route.endpoint.poll_recv(cx) {
            *cursor = index + 1;
            return Poll::Ready(match msg {
                Some(msg) => Polled::Message(name.clone(), msg),
                None => Polled::Closed(name.clone()),
            });
        }
    }
    Poll::Pending
}

async fn run_fan_in<I, O, M>(
    name: String,
    sink: mpsc::Sender<O>,
    mapper: M,
    mut admin_rx: mpsc::Receiver<AdminRequest<mpsc::Receiver<I>, I>>,
    state: watch::Sender<RouterState>,
    scope: Scope,
) where
    I: Send + 'static,
    O: Send + 'static,
    M: Fn(I) -> Option<O> + Send + 'static,
{
    let cancel = scope.token();
    let mut routes: RouteTable<mpsc::Receiver<I>, I> = RouteTable::new();
    let mut cursor = 0usize;
    let mut ack = None;

    loop {
        let routing = *state.borrow() == RouterState::Routing && !routes.is_empty();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(router = %name, "Router cancelled");
                break;
            }
            _ = sink.closed() => {
                tracing::debug!(router = %name, "Sink closed");
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
            polled = std::future::poll_fn(|cx| poll_routes(&mut routes, &mut cursor, cx)), if routing => {
                match polled {
                    Polled::Closed(route) => {
                        routes.shift_remove(&route);
                        tracing::debug!(router = %name, %route, "Route closed by producer, removed");
                    }
                    Polled::Message(route, msg) => {
                        let admitted = routes.get(&route).is_some_and(|r| r.admits(&msg));
                        if !admitted {
                            tracing::trace!(router = %name, %route, "Passage denied message");
                            continue;
                        }
                        let mapped = match catch_unwind(AssertUnwindSafe(|| mapper(msg))) {
                            Ok(Some(mapped)) => mapped,
                            Ok(None) => continue,
                            Err(_) => {
                                tracing::error!(router = %name, %route, "Mapper panicked, dropping message");
                                continue;
                            }
                        };
                        if sink.send(mapped).await.is_err() {
                            tracing::debug!(router = %name, "Sink closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    close_all(&name, &mut routes, &state, ack);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::open;

    fn spawn_doubler(capacity: usize) -> (mpsc::Receiver<u32>, FanInRouter<u32>) {
        let (tx, rx) = mpsc::channel(capacity);
        let router = FanInRouter::spawn("doubler", tx, |n: u32| Some(n * 2), &Scope::new());
        (rx, router)
    }

    #[tokio::test]
    async fn merges_routes_into_sink() {
        let (mut sink, router) = spawn_doubler(8);
        let a = router.new_route("a", 4, open()).await.unwrap();
        let b = router.new_route("b", 4, open()).await.unwrap();
        router.start().await.unwrap();

        a.send(1).await.unwrap();
        b.send(2).await.unwrap();
        a.send(3).await.unwrap();

        let mut got = vec![
            sink.recv().await.unwrap(),
            sink.recv().await.unwrap(),
            sink.recv().await.unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn per_route_order_is_preserved() {
        let (mut sink, router) = spawn_doubler(32);
        let a = router.new_route("a", 16, open()).await.unwrap();
        router.start().await.unwrap();

        for n in 0..10 {
            a.send(n).await.unwrap();
        }
        for n in 0..10 {
            assert_eq!(sink.recv().await, Some(n * 2));
        }
    }

    #[tokio::test]
    async fn passage_filters_on_the_way_in() {
        let (mut sink, router) = spawn_doubler(8);
        let odd_only: Passage<u32> = Arc::new(|n: &u32| n % 2 == 1);
        let a = router.new_route("a", 4, odd_only).await.unwrap();
        router.start().await.unwrap();

        for n in 1..=3 {
            a.send(n).await.unwrap();
        }
        assert_eq!(sink.recv().await, Some(2));
        assert_eq!(sink.recv().await, Some(6));
    }

    #[tokio::test]
    async fn dropped_producer_removes_route() {
        let (mut sink, router) = spawn_doubler(8);
        let a = router.new_route("a", 4, open()).await.unwrap();
        let b = router.new_route("b", 4, open()).await.unwrap();
        router.start().await.unwrap();

        drop(a);
        b.send(5).await.unwrap();
        assert_eq!(sink.recv().await, Some(10));

        // The closed route is noticed on a later poll; loop until it is gone.
        for _ in 0..50 {
            if router.get_route("a").await.unwrap().is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(router.get_route("a").await.unwrap().is_none());
        assert!(router.get_route("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn closed_sink_terminates_router() {
        let (sink, router) = spawn_doubler(8);
        let a = router.new_route("a", 4, open()).await.unwrap();
        router.start().await.unwrap();
        drop(sink);

        router.terminated().await;
        assert!(a.send(1).await.is_err());
        assert!(matches!(
            router.new_route("late", 1, open()).await,
            Err(RouterError::Terminated(_))
        ));
    }

    #[tokio::test]
    async fn close_closes_producer_channels() {
        let (_sink, router) = spawn_doubler(8);
        let a = router.new_route("a", 4, open()).await.unwrap();
        router.start().await.unwrap();

        router.close().await;
        router.close().await;
        assert!(a.send(1).await.is_err());
        assert_eq!(router.state(), RouterState::Terminated);
    }
}
