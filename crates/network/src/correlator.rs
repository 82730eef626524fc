//! Request/answer correlation
//!
//! Every query gets the next id of a per-correlator counter. Interest in the
//! answer is registered before the query is sent, and a single router task
//! hands each answer to the request with the same id.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use pop_protocol::{
    Answer, GenericMessage, MessageGeneral, Method, Query, RequestId, ResultValue,
};
use pop_transport::Transport;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::multiplexer::Multiplexer;

type PendingMap = DashMap<RequestId, oneshot::Sender<Answer>>;

/// An answer that will arrive later
///
/// Clones share the outcome: once settled, awaiting any clone again yields the
/// cached result without sending anything.
#[derive(Clone)]
pub struct PendingAnswer {
    id: RequestId,
    method: Method,
    inner: Shared<BoxFuture<'static, NetworkResult<ResultValue>>>,
}

impl PendingAnswer {
    /// Id the query was sent with
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Method of the query
    pub fn method(&self) -> Method {
        self.method
    }
}

impl Future for PendingAnswer {
    type Output = NetworkResult<ResultValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

/// Correlates queries with their answers
pub struct RequestCorrelator<T>
where
    T: Transport,
{
    multiplexer: Arc<Multiplexer<T>>,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    timeout: Duration,
}

impl<T> RequestCorrelator<T>
where
    T: Transport,
{
    /// Create a correlator and start routing answers
    pub fn new(multiplexer: Arc<Multiplexer<T>>, timeout: Duration) -> Self {
        let pending = Arc::new(PendingMap::new());

        let answers = multiplexer.observe_messages();
        multiplexer.spawn(route_answers(answers, PendingGuard(pending.clone())));

        Self {
            multiplexer,
            next_id: AtomicU64::new(1),
            pending,
            timeout,
        }
    }

    /// Send a query and return a handle on its answer
    ///
    /// The id attached to `query` is replaced by a fresh one. A send failure
    /// is only logged: the request then settles on timeout, or on close.
    pub async fn submit(&self, query: Query) -> PendingAnswer {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let method = query.method;
        let deadline = Instant::now() + self.timeout;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        debug!("Sending {} request {} on {}", method, id, query.params.channel);
        if let Err(e) = self
            .multiplexer
            .send(&GenericMessage::Query(query.with_id(id)))
            .await
        {
            warn!("Failed to send {} request {}: {}", method, id, e);
        }
        // The router may already have emptied the map on close
        if self.multiplexer.is_closed() {
            self.pending.remove(&id);
        }

        // The entry goes away at the deadline even if nobody awaits the answer
        let expiring = self.pending.clone();
        self.multiplexer.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if expiring.remove(&id).is_some() {
                debug!("{} request {} timed out", method, id);
            }
        });

        let pending = self.pending.clone();
        let token = self.multiplexer.cancellation_token();
        let timeout = self.timeout;
        let inner = async move {
            tokio::select! {
                () = token.cancelled() => Err(NetworkError::Closed),
                answer = tokio::time::timeout_at(deadline, rx) => match answer {
                    Ok(Ok(answer)) => answer.result.map_err(|error| NetworkError::Remote {
                        code: error.code,
                        description: error.description,
                    }),
                    // Sender dropped: expired or the correlator closed
                    Ok(Err(_)) if token.is_cancelled() => Err(NetworkError::Closed),
                    Ok(Err(_)) | Err(_) => {
                        pending.remove(&id);
                        Err(NetworkError::Timeout(id, timeout))
                    }
                },
            }
        }
        .boxed()
        .shared();

        PendingAnswer { id, method, inner }
    }

    /// Send a query and wait for its answer
    pub async fn request(&self, query: Query) -> NetworkResult<ResultValue> {
        self.submit(query).await.await
    }

    /// Requests waiting for an answer
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Configured answer timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Empties the pending map when the answer router stops
struct PendingGuard(Arc<PendingMap>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.0.is_empty() {
            debug!("Dropping {} pending requests", self.0.len());
        }
        self.0.clear();
    }
}

async fn route_answers(mut messages: broadcast::Receiver<GenericMessage>, pending: PendingGuard) {
    let mut dropped = 0u64;
    loop {
        match messages.recv().await {
            Ok(GenericMessage::Answer(answer)) => match pending.0.remove(&answer.id) {
                Some((_, tx)) => {
                    let _ = tx.send(answer);
                }
                None => debug!("No pending request for answer {}", answer.id),
            },
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                dropped += skipped;
                warn!(
                    skipped,
                    dropped, "Answer router lagged, the requests of skipped answers will time out"
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Expect a status code answer
pub fn expect_status(method: Method, value: ResultValue) -> NetworkResult<i64> {
    match value {
        ResultValue::Integer(status) => Ok(status),
        ResultValue::Messages(_) => Err(NetworkError::UnexpectedAnswer { method }),
    }
}

/// Expect a message list answer
pub fn expect_messages(method: Method, value: ResultValue) -> NetworkResult<Vec<MessageGeneral>> {
    match value {
        ResultValue::Messages(messages) => Ok(messages),
        ResultValue::Integer(_) => Err(NetworkError::UnexpectedAnswer { method }),
    }
}
