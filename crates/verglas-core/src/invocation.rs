use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use verglas_codec::InputStream;
use verglas_wire::{Identity, InvocationMode, OperationMode, ReplyStatus};

use crate::connection::Connection;
use crate::connection_factory::OutgoingConnectionFactory;
use crate::message::{Context, ReplyData, RequestSpec};
use crate::reference::Reference;
use crate::timer::{Timer, TimerToken};
use crate::{InvocationError, LocalError, ProtocolError, TransportError};

/// Completion slot shared by the caller-facing future, the connection's
/// reply path, the retry driver, the timeout timer and the cancel handle.
///
/// Exactly one outcome wins; later completions are ignored (cancel racing
/// a reply resolves to whichever got there first, and a cancel that wins
/// delivers `InvocationCanceled` even if the reply arrives a moment
/// later).
pub(crate) struct FutureInner {
    state: Mutex<FutureState>,
    cond: Condvar,
}

struct FutureState {
    outcome: Option<Result<ReplyData, LocalError>>,
    taken: bool,
    waker: Option<Waker>,
    cancelled: bool,
    /// Where the in-flight attempt's waiter is registered.
    registration: Option<(Weak<Connection>, i32)>,
    timeout_token: Option<TimerToken>,
}

impl FutureInner {
    fn new() -> Arc<Self> {
        Arc::new(FutureInner {
            state: Mutex::new(FutureState {
                outcome: None,
                taken: false,
                waker: None,
                cancelled: false,
                registration: None,
                timeout_token: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Deliver the final outcome. Returns false when something else
    /// already completed the invocation.
    fn complete(&self, timer: &Timer, outcome: Result<ReplyData, LocalError>) -> bool {
        let mut st = self.state.lock();
        if st.outcome.is_some() {
            return false;
        }
        st.outcome = Some(outcome);
        st.registration = None;
        let timeout_token = st.timeout_token.take();
        let waker = st.waker.take();
        drop(st);
        if let Some(token) = timeout_token {
            timer.cancel(token);
        }
        self.cond.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn is_done(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    fn take_registration(&self) -> Option<(Weak<Connection>, i32)> {
        self.state.lock().registration.take()
    }
}

/// Caller-facing handle for one invocation: blocking via
/// [`InvocationFuture::wait`], or polled as a standard future driven by
/// completions from the thread pool.
pub struct InvocationFuture {
    inner: Arc<FutureInner>,
    timer: Arc<Timer>,
}

impl InvocationFuture {
    /// Block the calling thread until the outcome is in.
    pub fn wait(self) -> Result<ReplyData, LocalError> {
        let mut st = self.inner.state.lock();
        loop {
            if st.outcome.is_some() {
                debug_assert!(!st.taken, "invocation outcome consumed twice");
                st.taken = true;
                return st.outcome.take().expect("outcome just observed");
            }
            self.inner.cond.wait(&mut st);
        }
    }

    /// Handle to cancel this invocation from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { inner: Arc::downgrade(&self.inner), timer: self.timer.clone() }
    }
}

impl Future for InvocationFuture {
    type Output = Result<ReplyData, LocalError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut st = self.inner.state.lock();
        if st.outcome.is_some() {
            debug_assert!(!st.taken, "invocation future polled after completion");
            st.taken = true;
            return Poll::Ready(st.outcome.take().expect("outcome just observed"));
        }
        st.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Cancels an in-flight invocation: removes the waiter from the
/// connection's table if still present and completes the future with
/// `InvocationCanceled`. Idempotent; a no-op after completion.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Weak<FutureInner>,
    timer: Arc<Timer>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut st = inner.state.lock();
            if st.outcome.is_some() {
                return;
            }
            st.cancelled = true;
        }
        if let Some((conn, id)) = inner.take_registration() {
            if let Some(conn) = conn.upgrade() {
                // Drops the reply callback; a reply arriving later for
                // this id counts as a correlation violation and closes
                // the connection.
                drop(conn.remove_waiter(id));
            }
        }
        inner.complete(&self.timer, Err(InvocationError::InvocationCanceled.into()));
    }
}

/// One logical invocation: drives connection acquisition, send, reply
/// interpretation and the retry schedule. Each retry is a fresh request
/// on a fresh (or re-fetched) connection.
pub(crate) struct Outgoing {
    factory: Arc<OutgoingConnectionFactory>,
    timer: Arc<Timer>,
    reference: Reference,
    operation: String,
    mode: OperationMode,
    context: Context,
    params: Bytes,
    retry_intervals: Vec<i64>,
    attempt: Mutex<usize>,
    inner: Arc<FutureInner>,
}

impl Outgoing {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        factory: Arc<OutgoingConnectionFactory>,
        timer: Arc<Timer>,
        reference: Reference,
        operation: String,
        mode: OperationMode,
        context: Context,
        params: Bytes,
        retry_intervals: Vec<i64>,
    ) -> InvocationFuture {
        let inner = FutureInner::new();
        let outgoing = Arc::new(Outgoing {
            factory,
            timer: timer.clone(),
            reference,
            operation,
            mode,
            context,
            params,
            retry_intervals,
            attempt: Mutex::new(0),
            inner: inner.clone(),
        });

        if let Some(ms) = outgoing.reference.invocation_timeout {
            if ms >= 0 {
                let weak = Arc::downgrade(&outgoing);
                let token = outgoing.timer.schedule(
                    Duration::from_millis(ms as u64),
                    move || {
                        if let Some(outgoing) = weak.upgrade() {
                            outgoing.timed_out();
                        }
                    },
                );
                inner.state.lock().timeout_token = Some(token);
            }
        }

        outgoing.proceed();
        InvocationFuture { inner, timer }
    }

    fn proceed(self: &Arc<Self>) {
        if self.inner.is_done() {
            return;
        }
        let me = self.clone();
        self.factory.get_connection(
            &self.reference,
            Box::new(move |result| match result {
                Ok(connection) => me.send_on(&connection),
                Err(e) => me.handle_failure(e, false),
            }),
        );
    }

    fn send_on(self: &Arc<Self>, connection: &Arc<Connection>) {
        if self.inner.is_done() {
            return;
        }
        let spec = RequestSpec {
            identity: self.reference.identity.clone(),
            facet: self.reference.facet.clone(),
            operation: self.operation.clone(),
            mode: self.mode,
            context: self.context.clone(),
            params: self.params.clone(),
            compress: self.reference.compress,
        };
        match self.reference.mode {
            InvocationMode::Twoway => {
                let me = self.clone();
                let callback = Box::new(move |result| me.on_reply(result));
                match connection.send_request(spec, Some(callback)) {
                    Ok(Some(id)) => {
                        self.inner.state.lock().registration =
                            Some((Arc::downgrade(connection), id));
                    }
                    Ok(None) => {}
                    Err(e) => self.handle_failure(e, false),
                }
            }
            InvocationMode::Oneway | InvocationMode::Datagram => {
                match connection.send_request(spec, None) {
                    Ok(_) => {
                        self.complete(Ok(empty_reply()));
                    }
                    Err(e) => self.handle_failure(e, false),
                }
            }
            InvocationMode::BatchOneway | InvocationMode::BatchDatagram => {
                match connection.send_batch_request(spec) {
                    Ok(()) => {
                        self.complete(Ok(empty_reply()));
                    }
                    Err(e) => self.handle_failure(e, false),
                }
            }
        }
    }

    fn on_reply(self: &Arc<Self>, result: Result<ReplyData, LocalError>) {
        match result {
            Ok(reply) => match reply.status {
                ReplyStatus::Ok | ReplyStatus::UserException => {
                    self.complete(Ok(reply));
                }
                ReplyStatus::ObjectNotExist
                | ReplyStatus::FacetNotExist
                | ReplyStatus::OperationNotExist => {
                    self.complete(Err(parse_request_failed(&reply)));
                }
                status => {
                    let message = parse_unknown_message(&reply);
                    self.complete(Err(
                        InvocationError::UnknownException { kind: status, message }.into()
                    ));
                }
            },
            // The connection failed underneath the request.
            Err(e) => self.handle_failure(e, true),
        }
    }

    /// Decide between retrying and surfacing the failure. Non-idempotent
    /// operations only retry failures that prove the request was never
    /// dispatched: refused connects and announced closes.
    fn handle_failure(self: &Arc<Self>, error: LocalError, after_send: bool) {
        if self.factory.is_destroyed() {
            // The timer goes away with the runtime; a scheduled retry
            // would never fire.
            self.complete(Err(error));
            return;
        }
        let retry_allowed = error.is_retryable()
            && (self.mode.is_idempotent()
                || !after_send
                || matches!(&error, LocalError::Protocol(ProtocolError::CloseConnection))
                || matches!(
                    &error,
                    LocalError::Transport(TransportError::ConnectFailed(_))
                ));
        let disabled = self.retry_intervals.first() == Some(&-1);
        let attempt = {
            let mut attempt = self.attempt.lock();
            let current = *attempt;
            if retry_allowed && !disabled && current < self.retry_intervals.len() {
                *attempt += 1;
                Some(current)
            } else {
                None
            }
        };
        match attempt {
            Some(attempt) => {
                let delay = self.retry_intervals[attempt].max(0) as u64;
                tracing::debug!(
                    operation = %self.operation,
                    attempt = attempt + 1,
                    delay_ms = delay,
                    error = %error,
                    "retrying invocation"
                );
                if delay == 0 {
                    self.proceed();
                } else {
                    // The scheduled closure is the only thing keeping this
                    // invocation alive across the delay.
                    let me = self.clone();
                    self.timer.schedule(Duration::from_millis(delay), move || {
                        me.proceed();
                    });
                }
            }
            None => {
                self.complete(Err(error));
            }
        }
    }

    fn timed_out(self: &Arc<Self>) {
        if let Some((conn, id)) = self.inner.take_registration() {
            if let Some(conn) = conn.upgrade() {
                drop(conn.remove_waiter(id));
            }
        }
        self.complete(Err(InvocationError::InvocationTimeout.into()));
    }

    fn complete(&self, outcome: Result<ReplyData, LocalError>) {
        self.inner.complete(&self.timer, outcome);
    }
}

fn empty_reply() -> ReplyData {
    ReplyData {
        status: ReplyStatus::Ok,
        body: Bytes::new(),
        encoding: verglas_wire::ENCODING_1_1,
    }
}

/// Body of ObjectNotExist/FacetNotExist/OperationNotExist replies:
/// identity, facet path, operation.
fn parse_request_failed(reply: &ReplyData) -> LocalError {
    let parse = || -> Result<(Identity, String, String), LocalError> {
        let mut input = InputStream::new(reply.body.clone(), reply.encoding);
        let name = input.read_string()?;
        let category = input.read_string()?;
        let facet = match input.read_size()? {
            0 => String::new(),
            _ => input.read_string()?,
        };
        let operation = input.read_string()?;
        Ok((Identity { category, name }, facet, operation))
    };
    let (identity, facet, operation) = match parse() {
        Ok(fields) => fields,
        Err(e) => return e,
    };
    match reply.status {
        ReplyStatus::FacetNotExist => {
            InvocationError::FacetNotExist { identity, facet, operation }.into()
        }
        ReplyStatus::OperationNotExist => {
            InvocationError::OperationNotExist { identity, facet, operation }.into()
        }
        _ => InvocationError::ObjectNotExist { identity, facet, operation }.into(),
    }
}

/// Body of the three unknown-exception replies: a bare string.
fn parse_unknown_message(reply: &ReplyData) -> String {
    let mut input = InputStream::new(reply.body.clone(), reply.encoding);
    input.read_string().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_blocks_until_completed() {
        let timer = Timer::new();
        let inner = FutureInner::new();
        let future = InvocationFuture { inner: inner.clone(), timer: timer.clone() };
        let completer = inner.clone();
        let t = timer.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(&t, Ok(empty_reply()));
        });
        let outcome = future.wait().unwrap();
        assert_eq!(outcome.status, ReplyStatus::Ok);
        timer.destroy();
    }

    #[test]
    fn first_completion_wins() {
        let timer = Timer::new();
        let inner = FutureInner::new();
        assert!(inner.complete(&timer, Err(InvocationError::InvocationCanceled.into())));
        assert!(!inner.complete(&timer, Ok(empty_reply())));
        let future = InvocationFuture { inner, timer: timer.clone() };
        assert!(matches!(
            future.wait(),
            Err(LocalError::Invocation(InvocationError::InvocationCanceled))
        ));
        timer.destroy();
    }

    #[test]
    fn cancel_handle_is_idempotent() {
        let timer = Timer::new();
        let inner = FutureInner::new();
        let future = InvocationFuture { inner: inner.clone(), timer: timer.clone() };
        let handle = future.cancel_handle();
        handle.cancel();
        handle.cancel();
        assert!(matches!(
            future.wait(),
            Err(LocalError::Invocation(InvocationError::InvocationCanceled))
        ));
        timer.destroy();
    }

    #[test]
    fn future_wakes_poller() {
        let timer = Timer::new();
        let inner = FutureInner::new();
        let future = InvocationFuture { inner: inner.clone(), timer: timer.clone() };
        let completer = inner.clone();
        let t = timer.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(&t, Ok(empty_reply()));
        });
        // A tiny hand-rolled block_on is all the executor this needs.
        let outcome = block_on(future).unwrap();
        assert_eq!(outcome.status, ReplyStatus::Ok);
        timer.destroy();
    }

    struct ThreadWaker(std::thread::Thread);

    impl std::task::Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
        let mut cx = TaskContext::from_waker(&waker);
        let mut future = std::pin::pin!(future);
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(v) => return v,
                Poll::Pending => std::thread::park_timeout(Duration::from_millis(50)),
            }
        }
    }
}
