use std::collections::VecDeque;
use std::fmt;
use std::fmt::Debug;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::{
    future::{Future, FutureExt},
    ready,
    sink::Sink,
    stream::{self, Stream, StreamExt},
};
use log::{debug, trace};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{self, Poll};
use tokio::sync::{
    mpsc::{self, UnboundedSender},
    oneshot,
};

use crate::aio::pubsub::Msg;
use crate::errors::{closed_connection_error, RedisError, ServerError};
use crate::types::{RedisResult, Value};

// Sender which the result of a single request is sent through
type PipelineOutput = oneshot::Sender<RedisResult<Value>>;

/// Per-connection tallies of how many responses resolved a command and how
/// many failed one.
#[derive(Default, Debug)]
pub struct ConnectionCounters {
    successful: AtomicU64,
    failed: AtomicU64,
}

impl ConnectionCounters {
    /// Responses that resolved their command successfully.
    pub fn successful_responses(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    /// Responses that failed their command, server error replies included.
    pub fn failed_responses(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

// A single message sent through the pipeline
enum PipelineMessage {
    Request {
        input: Vec<u8>,
        output: PipelineOutput,
    },
    Close {
        done: oneshot::Sender<()>,
    },
    InstallMsgSender {
        sender: Option<UnboundedSender<Msg>>,
    },
}

/// Lifecycle of the request/response matcher.
///
/// `Closing` is the tail end of a graceful close: the queue has drained and
/// the socket shutdown is in progress.
enum PipelineState {
    /// Accepting writes and reads.
    Default,
    /// A graceful close was requested with commands still in flight; no new
    /// writes are accepted.
    Draining { done: oneshot::Sender<()> },
    /// The queue is empty and the socket is being shut down.
    Closing { done: oneshot::Sender<()> },
    /// Terminal: every queued promise has been failed and every later write
    /// fails with the same error.
    Errored(RedisError),
}

/// Wrapper around a `Stream + Sink` where each item sent through the `Sink`
/// results in exactly one item being output by the `Stream`, in order.  With
/// the interface provided by `Pipeline` this becomes an easy request to
/// response mapping, hiding the `Stream` and `Sink`.
#[derive(Clone)]
pub(crate) struct Pipeline {
    sender: mpsc::UnboundedSender<PipelineMessage>,
    error_slot: Arc<OnceLock<RedisError>>,
}

impl Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pipeline").field(&self.sender).finish()
    }
}

pin_project! {
    struct PipelineSink<T> {
        #[pin]
        sink_stream: T,
        in_flight: VecDeque<PipelineOutput>,
        state: PipelineState,
        msg_sender: Option<UnboundedSender<Msg>>,
        counters: Arc<ConnectionCounters>,
        error_slot: Arc<OnceLock<RedisError>>,
    }
}

impl<T> PipelineSink<T>
where
    T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + 'static,
{
    fn new(
        sink_stream: T,
        counters: Arc<ConnectionCounters>,
        error_slot: Arc<OnceLock<RedisError>>,
    ) -> Self {
        PipelineSink {
            sink_stream,
            in_flight: VecDeque::new(),
            state: PipelineState::Default,
            msg_sender: None,
            counters,
            error_slot,
        }
    }

    // Read values from the stream and pair them with the in-flight queue.
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Result<(), ()>> {
        loop {
            if matches!(self.state, PipelineState::Closing { .. }) {
                if let Err(err) = ready!(self.as_mut().project().sink_stream.poll_close(cx)) {
                    debug!("error while closing connection: {err}");
                }
                self.as_mut().finish_close();
                // Nothing more will be read or written; `Err` breaks out of
                // the `forward` combinator driving this sink.
                return Poll::Ready(Err(()));
            }
            let item = ready!(self.as_mut().project().sink_stream.poll_next(cx));
            match item {
                Some(Ok(value)) => self.as_mut().send_result(value),
                Some(Err(err)) => {
                    self.as_mut().fail_all(err);
                    return Poll::Ready(Err(()));
                }
                // The response stream is not going to produce any more items
                // so we `Err` to stop handling requests.
                None => {
                    self.as_mut().fail_all(closed_connection_error());
                    return Poll::Ready(Err(()));
                }
            }
        }
    }

    fn send_result(self: Pin<&mut Self>, value: Value) {
        let self_ = self.project();

        // Published pubsub messages answer no command; they bypass the queue
        // and go to the installed receiver.
        if let Some(sender) = self_.msg_sender.as_ref() {
            if let Some(msg) = Msg::from_value(&value) {
                if sender.send(msg).is_err() {
                    trace!("dropping pubsub message, receiver is gone");
                }
                return;
            }
        }

        let entry = match self_.in_flight.pop_front() {
            Some(entry) => entry,
            // A value with nothing waiting for it can show up around state
            // transitions; it is dropped, not treated as a failure.
            None => {
                trace!("discarding response with no matching command: {value:?}");
                return;
            }
        };

        let result = match value {
            Value::Error(line) => {
                self_.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(RedisError::from(ServerError::parse(&line)))
            }
            value => {
                self_.counters.successful.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
        };
        // `Err` means the receiver was dropped in which case it does not
        // care about the output and we can continue by just dropping the
        // value and sender.
        let _ = entry.send(result);

        if self_.in_flight.is_empty() && matches!(self_.state, PipelineState::Draining { .. }) {
            if let PipelineState::Draining { done } =
                mem::replace(self_.state, PipelineState::Default)
            {
                *self_.state = PipelineState::Closing { done };
            }
        }
    }

    /// Terminal failure: every queued promise fails in FIFO order with the
    /// given error, which also becomes the answer for every later write.
    fn fail_all(self: Pin<&mut Self>, err: RedisError) {
        let self_ = self.project();
        debug!("connection failed: {err}");
        let _ = self_.error_slot.set(err.clone());
        for entry in self_.in_flight.drain(..) {
            self_.counters.failed.fetch_add(1, Ordering::Relaxed);
            let _ = entry.send(Err(err.clone()));
        }
        match mem::replace(self_.state, PipelineState::Errored(err)) {
            // A close that was waiting on the drain completes here: the
            // connection is down either way.
            PipelineState::Draining { done } | PipelineState::Closing { done } => {
                let _ = done.send(());
            }
            PipelineState::Default | PipelineState::Errored(_) => {}
        }
    }

    fn finish_close(self: Pin<&mut Self>) {
        let self_ = self.project();
        debug_assert!(
            self_.in_flight.is_empty(),
            "command queue not empty at connection teardown"
        );
        let _ = self_.error_slot.set(closed_connection_error());
        if let PipelineState::Closing { done } =
            mem::replace(self_.state, PipelineState::Errored(closed_connection_error()))
        {
            let _ = done.send(());
        }
    }
}

impl<T> Sink<PipelineMessage> for PipelineSink<T>
where
    T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + 'static,
{
    type Error = ();

    // Retrieve incoming messages and write them to the sink
    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        if !matches!(self.state, PipelineState::Default) {
            // `start_send` answers the message itself in every other state.
            return Poll::Ready(Ok(()));
        }
        match ready!(self.as_mut().project().sink_stream.poll_ready(cx)) {
            Ok(()) => Ok(()).into(),
            Err(err) => {
                self.fail_all(err);
                Ok(()).into()
            }
        }
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        msg: PipelineMessage,
    ) -> Result<(), Self::Error> {
        match msg {
            PipelineMessage::Request { input, output } => {
                // If there is nothing to receive our output we do not need to
                // send the message as it is ambiguous whether the message will
                // be sent anyway.  Helps shed some load on the connection.
                if output.is_closed() {
                    return Ok(());
                }
                {
                    let self_ = self.as_mut().project();
                    match self_.state {
                        PipelineState::Default => {}
                        PipelineState::Draining { .. } | PipelineState::Closing { .. } => {
                            let _ = output.send(Err(closed_connection_error()));
                            return Ok(());
                        }
                        PipelineState::Errored(err) => {
                            let _ = output.send(Err(err.clone()));
                            return Ok(());
                        }
                    }
                }
                let sent = self.as_mut().project().sink_stream.start_send(input);
                match sent {
                    Ok(()) => {
                        self.as_mut().project().in_flight.push_back(output);
                        Ok(())
                    }
                    Err(err) => {
                        let _ = output.send(Err(err.clone()));
                        self.as_mut().fail_all(err);
                        Err(())
                    }
                }
            }
            PipelineMessage::Close { done } => {
                let self_ = self.as_mut().project();
                match self_.state {
                    PipelineState::Default => {
                        if self_.in_flight.is_empty() {
                            *self_.state = PipelineState::Closing { done };
                        } else {
                            *self_.state = PipelineState::Draining { done };
                        }
                    }
                    // a close is already underway; this signal completes now
                    PipelineState::Draining { .. }
                    | PipelineState::Closing { .. }
                    | PipelineState::Errored(_) => {
                        let _ = done.send(());
                    }
                }
                Ok(())
            }
            PipelineMessage::InstallMsgSender { sender } => {
                *self.as_mut().project().msg_sender = sender;
                Ok(())
            }
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        ready!(self
            .as_mut()
            .project()
            .sink_stream
            .poll_flush(cx)
            .map_err(|err| {
                self.as_mut().fail_all(err);
            }))?;
        self.poll_read(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        // No new requests will come in after the first call to `close` but we
        // need to complete any in progress requests before closing
        if !self.in_flight.is_empty() {
            ready!(self.as_mut().poll_flush(cx))?;
        }
        let result = self.as_mut().project().sink_stream.poll_close(cx);
        result.map_err(|err| {
            self.fail_all(err);
        })
    }
}

impl Pipeline {
    /// Builds the pipeline over a framed transport and returns it together
    /// with the driver future that must be spawned to move it.
    pub(crate) fn new<T>(
        sink_stream: T,
        counters: Arc<ConnectionCounters>,
    ) -> (Self, impl Future<Output = ()>)
    where
        T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let error_slot = Arc::new(OnceLock::new());

        let sink = PipelineSink::new(sink_stream, counters, error_slot.clone());
        let f = stream::poll_fn(move |cx| receiver.poll_recv(cx))
            .map(Ok)
            .forward(sink)
            .map(|_| ());
        (Pipeline { sender, error_slot }, f)
    }

    /// The error later operations fail with once the driver has terminated.
    fn terminal_error(&self) -> RedisError {
        self.error_slot
            .get()
            .cloned()
            .unwrap_or_else(closed_connection_error)
    }

    /// Sends already packed command bytes and resolves with the single
    /// response value paired to it.
    pub(crate) async fn send_single(&self, input: Vec<u8>) -> RedisResult<Value> {
        let (sender, receiver) = oneshot::channel();
        if self
            .sender
            .send(PipelineMessage::Request {
                input,
                output: sender,
            })
            .is_err()
        {
            return Err(self.terminal_error());
        }
        match receiver.await {
            Ok(result) => result,
            // The sender was dropped which likely means that the stream part
            // failed for one reason or another
            Err(_) => Err(self.terminal_error()),
        }
    }

    /// Requests a graceful close and resolves once the socket has shut down.
    /// Draining, errored and already-closed pipelines resolve immediately.
    pub(crate) async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(PipelineMessage::Close { done }).is_err() {
            return;
        }
        let _ = wait.await;
    }

    /// Installs (or clears) the receiver for published pubsub messages.
    pub(crate) fn install_msg_sender(&self, sender: Option<UnboundedSender<Msg>>) {
        let _ = self
            .sender
            .send(PipelineMessage::InstallMsgSender { sender });
    }

    /// True once the driver has terminated and no request can succeed.
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
