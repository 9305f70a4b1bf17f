//! Dispatcher - RPC の送受信と相関
//!
//! # 状態
//! - `pending`: calls issued by this node, keyed by correlation id. Whoever
//!   removes an entry (reply, timeout, send failure, close) settles the
//!   response task; everyone else finds nothing.
//! - `awaiting_reply`: requests received by this node that may still be
//!   answered, keyed by (requester, correlation id). `reply` removes the
//!   entry, so a second reply finds nothing and is ignored.
//!
//! Handlers run as executor tasks with an affinity derived from the task
//! code, so requests for one code are served in arrival order.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::handler::{HandlerTable, RpcContext, RpcHandler};
use crate::domain::{CorrelationId, EndPoint, Message, MessageKind, TaskCode};
use crate::error::{SpindleError, SpindleResult};
use crate::ports::{Inbox, Transport};
use crate::task::{Executor, Task, TaskResult};

/// How long a received request stays answerable past its own budget.
const RECEIVED_GRACE: Duration = Duration::from_secs(30);

pub type RpcResponseTask = Task<Message>;

/// Runs once the response task settles, with the reply or the failure.
pub type ResponseCallback = Box<dyn FnOnce(&TaskResult<Message>) + Send>;

/// What to do with a reply whose call was already settled (timed out,
/// failed to send, or the dispatcher was closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateReplyPolicy {
    Drop,
    #[default]
    Log,
    /// Keep the most recent ones for `take_late_replies`.
    Retain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Budget for requests that carry none. 0 disables the timeout.
    pub default_timeout_ms: u64,
    pub late_reply: LateReplyPolicy,
    /// Bound of the retained late-reply buffer.
    pub late_reply_capacity: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            late_reply: LateReplyPolicy::default(),
            late_reply_capacity: 64,
        }
    }
}

struct PendingCall {
    task: RpcResponseTask,
    timer: Option<Task<()>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn code_affinity(code: &TaskCode) -> u64 {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    hasher.finish()
}

/// RPC endpoint of one node: bound to its primary address on the transport.
pub struct Dispatcher {
    me: Weak<Dispatcher>,
    address: EndPoint,
    executor: Arc<Executor>,
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    handlers: HandlerTable,
    bound: AtomicBool,
    next_correlation: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
    awaiting_reply: Mutex<HashMap<(EndPoint, CorrelationId), u64>>,
    late_replies: Mutex<VecDeque<Message>>,
}

impl Dispatcher {
    /// Create the dispatcher and bind `address` on `transport`.
    pub fn new(
        address: EndPoint,
        executor: Arc<Executor>,
        transport: Arc<dyn Transport>,
        config: RpcConfig,
    ) -> SpindleResult<Arc<Self>> {
        let dispatcher = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            address,
            executor,
            transport,
            config,
            handlers: HandlerTable::default(),
            bound: AtomicBool::new(false),
            next_correlation: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            awaiting_reply: Mutex::new(HashMap::new()),
            late_replies: Mutex::new(VecDeque::new()),
        });
        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        let inbox: Weak<dyn Inbox> = weak;
        dispatcher.transport.bind(&dispatcher.address, inbox)?;
        dispatcher.bound.store(true, Ordering::SeqCst);
        Ok(dispatcher)
    }

    /// Constant for the lifetime of the dispatcher.
    pub fn primary_address(&self) -> &EndPoint {
        &self.address
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Fails with `SpindleError::Argument` if `code` is already bound; the
    /// existing binding stays in place.
    pub fn register_rpc_handler<H>(
        &self,
        code: impl Into<TaskCode>,
        name: &str,
        handler: H,
    ) -> SpindleResult<()>
    where
        H: RpcHandler + 'static,
    {
        self.handlers.register(code.into(), name, Arc::new(handler))
    }

    pub fn unregister_rpc_handler(&self, code: impl Into<TaskCode>) -> SpindleResult<()> {
        self.handlers.unregister(&code.into())
    }

    /// Bound (code, handler name) pairs.
    pub fn handler_bindings(&self) -> Vec<(TaskCode, String)> {
        self.handlers.bindings()
    }

    /// Calls issued by this node that have not settled yet. Calls whose
    /// response task was canceled by the caller do not count.
    pub fn pending_calls(&self) -> usize {
        self.purge_settled();
        relock(&self.pending).len()
    }

    /// Send `request` to `server` and return its response task right away.
    ///
    /// The task completes with the reply, or fails with
    /// `SpindleError::Timeout` (request budget, else `default_timeout_ms`),
    /// `SpindleError::Network` (unreachable server), or
    /// `SpindleError::Argument` (no handler bound on the server).
    /// `callback`, if any, runs on a worker once it settles. Only fails
    /// itself when the executor is shut down.
    pub fn call(
        &self,
        server: &EndPoint,
        mut request: Message,
        callback: Option<ResponseCallback>,
    ) -> SpindleResult<RpcResponseTask> {
        let task = RpcResponseTask::pending(request.code().clone());
        if let Some(callback) = callback {
            task.set_callback(callback);
        }
        self.executor.arm(&task)?;

        let correlation_id = self.next_correlation_id();
        let timeout_ms = request
            .header()
            .timeout_ms
            .unwrap_or(self.config.default_timeout_ms);
        let header = request.header_mut();
        header.correlation_id = correlation_id;
        header.kind = MessageKind::Request;
        header.from = Some(self.address.clone());
        header.to = Some(server.clone());
        header.timeout_ms = Some(timeout_ms);

        self.purge_settled();
        // 応答やタイムアウトが send より先に来ても取りこぼさないよう、先に登録する
        relock(&self.pending).insert(
            correlation_id,
            PendingCall {
                task: task.clone(),
                timer: None,
            },
        );
        if timeout_ms > 0
            && let Some(timer) = self.arm_timeout(correlation_id, timeout_ms)
        {
            match relock(&self.pending).get_mut(&correlation_id) {
                Some(call) => call.timer = Some(timer),
                // already settled
                None => {
                    timer.cancel(false);
                }
            }
        }

        trace!(%correlation_id, code = %request.code(), %server, "rpc call");
        let sent = request
            .encode()
            .and_then(|bytes| self.transport.send(&self.address, server, bytes));
        if let Err(err) = sent {
            debug!(%correlation_id, %server, error = %err, "rpc send failed");
            if let Some(call) = self.take_pending(correlation_id) {
                self.settle(call, Err(err));
            }
        }
        Ok(task)
    }

    /// Fire and forget. No response task; failures are only logged.
    pub fn call_one_way(&self, server: &EndPoint, mut request: Message) {
        let correlation_id = self.next_correlation_id();
        let header = request.header_mut();
        header.correlation_id = correlation_id;
        header.kind = MessageKind::OneWay;
        header.from = Some(self.address.clone());
        header.to = Some(server.clone());

        let sent = request
            .encode()
            .and_then(|bytes| self.transport.send(&self.address, server, bytes));
        if let Err(err) = sent {
            debug!(%correlation_id, %server, error = %err, "one-way send failed");
        }
    }

    /// Send `response` (built with `Message::create_response`) back to the
    /// requester. Only the first reply to a request is sent; later ones, and
    /// replies to one-way or expired requests, are ignored.
    pub fn reply(&self, mut response: Message) {
        let Some(requester) = response.to().cloned() else {
            debug!(code = %response.code(), "reply without requester ignored");
            return;
        };
        let key = (requester.clone(), response.correlation_id());
        if relock(&self.awaiting_reply).remove(&key).is_none() {
            debug!(
                correlation_id = %key.1,
                %requester,
                "duplicate or stale reply ignored"
            );
            return;
        }
        self.send_response(&requester, &mut response);
    }

    /// Replies that arrived after their call settled (`LateReplyPolicy::Retain`).
    pub fn take_late_replies(&self) -> Vec<Message> {
        relock(&self.late_replies).drain(..).collect()
    }

    /// Unbind from the transport and fail every outstanding call with
    /// `SpindleError::State`.
    pub fn close(&self) {
        if self.bound.swap(false, Ordering::SeqCst) {
            self.transport.unbind(&self.address);
        }
        let calls: Vec<PendingCall> = relock(&self.pending).drain().map(|(_, c)| c).collect();
        if !calls.is_empty() {
            debug!(address = %self.address, count = calls.len(), "failing outstanding calls");
        }
        for call in calls {
            self.settle(call, Err(SpindleError::state("dispatcher closed")));
        }
        relock(&self.awaiting_reply).clear();
    }

    fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId::new(self.next_correlation.fetch_add(1, Ordering::Relaxed))
    }

    fn arm_timeout(&self, correlation_id: CorrelationId, timeout_ms: u64) -> Option<Task<()>> {
        let me = self.me.clone();
        let timer = Task::new("rpc.timeout", move |_| {
            if let Some(dispatcher) = me.upgrade()
                && let Some(call) = dispatcher.take_pending(correlation_id)
            {
                debug!(%correlation_id, timeout_ms, "rpc call timed out");
                dispatcher.settle(call, Err(SpindleError::Timeout(timeout_ms)));
            }
            Ok(())
        });
        match self
            .executor
            .enqueue(&timer, Duration::from_millis(timeout_ms))
        {
            Ok(()) => Some(timer),
            Err(err) => {
                warn!(%correlation_id, error = %err, "rpc timeout not armed");
                None
            }
        }
    }

    /// Drop entries whose response task went terminal without us (canceled
    /// by the caller), along with their timeout.
    fn purge_settled(&self) {
        let settled: Vec<PendingCall> = {
            let mut pending = relock(&self.pending);
            let done: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, call)| call.task.is_terminal())
                .map(|(id, _)| *id)
                .collect();
            done.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for call in settled {
            trace!(task_id = %call.task.id(), "canceled call purged");
            if let Some(timer) = call.timer {
                timer.cancel(false);
            }
        }
    }

    fn take_pending(&self, correlation_id: CorrelationId) -> Option<PendingCall> {
        relock(&self.pending).remove(&correlation_id)
    }

    fn settle(&self, call: PendingCall, result: TaskResult<Message>) {
        if let Some(timer) = call.timer {
            timer.cancel(false);
        }
        if !self.executor.complete(&call.task, result) {
            trace!(task_id = %call.task.id(), "response task no longer accepts a result");
        }
    }

    fn send_response(&self, requester: &EndPoint, response: &mut Message) {
        let header = response.header_mut();
        header.kind = MessageKind::Response;
        header.from = Some(self.address.clone());
        header.to = Some(requester.clone());

        let sent = response
            .encode()
            .and_then(|bytes| self.transport.send(&self.address, requester, bytes));
        if let Err(err) = sent {
            debug!(
                correlation_id = %response.correlation_id(),
                %requester,
                error = %err,
                "reply send failed"
            );
        }
    }

    fn receive(&self, message: Message) {
        match message.kind() {
            MessageKind::Response => self.on_response(message),
            MessageKind::Request | MessageKind::OneWay => self.on_request(message),
        }
    }

    fn on_response(&self, message: Message) {
        let correlation_id = message.correlation_id();
        let Some(call) = self.take_pending(correlation_id) else {
            self.on_late_reply(message);
            return;
        };
        self.purge_settled();
        let result = match message.header().error.clone() {
            Some(error) => Err(SpindleError::argument(error)),
            None => Ok(message),
        };
        self.settle(call, result);
    }

    fn on_late_reply(&self, message: Message) {
        match self.config.late_reply {
            LateReplyPolicy::Drop => {
                trace!(correlation_id = %message.correlation_id(), "late reply dropped");
            }
            LateReplyPolicy::Log => {
                warn!(
                    correlation_id = %message.correlation_id(),
                    code = %message.code(),
                    "reply arrived after its call settled"
                );
            }
            LateReplyPolicy::Retain => {
                let capacity = self.config.late_reply_capacity;
                if capacity == 0 {
                    return;
                }
                let mut late = relock(&self.late_replies);
                while late.len() >= capacity {
                    late.pop_front();
                }
                late.push_back(message);
            }
        }
    }

    fn on_request(&self, message: Message) {
        let Some(from) = message.from().cloned() else {
            warn!(code = %message.code(), "request without sender dropped");
            return;
        };
        let code = message.code().clone();
        let expects_reply = message.kind() == MessageKind::Request;

        let Some(handler) = self.handlers.get(&code) else {
            if expects_reply {
                warn!(%code, %from, "no handler bound, answering with an error");
                let mut response = message
                    .create_response()
                    .with_error(format!("no handler bound for code {code}"));
                self.send_response(&from, &mut response);
            } else {
                warn!(%code, %from, "one-way message for unbound code dropped");
            }
            return;
        };

        if expects_reply {
            let env = self.executor.env();
            let budget = message
                .header()
                .timeout_ms
                .unwrap_or(self.config.default_timeout_ms);
            // budget 0 は無期限: 応答はいつでも受け付ける
            let deadline = if budget == 0 {
                u64::MAX
            } else {
                env.deadline_after(Duration::from_millis(budget) + RECEIVED_GRACE)
            };
            let now = env.now_ns();
            let mut awaiting = relock(&self.awaiting_reply);
            awaiting.retain(|_, expires| *expires > now);
            awaiting.insert((from.clone(), message.correlation_id()), deadline);
        }

        let ctx = RpcContext::new(self.me.clone(), self.address.clone());
        let task = Task::new(code.clone(), move |_| {
            handler.handle(&ctx, message);
            Ok(())
        })
        .with_affinity(code_affinity(&code));
        if let Err(err) = self.executor.enqueue(&task, Duration::ZERO) {
            warn!(%code, %from, error = %err, "request dropped");
        }
    }
}

impl Inbox for Dispatcher {
    fn on_message(&self, bytes: Vec<u8>) {
        match Message::decode(&bytes) {
            Ok(message) => self.receive(message),
            Err(err) => {
                warn!(address = %self.address, error = %err, "undecodable message dropped");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.bound.swap(false, Ordering::SeqCst) {
            self.transport.unbind(&self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskState;
    use crate::env::Environment;
    use crate::impls::{IoRuntime, LocalNetwork};
    use crate::task::{CancelOutcome, ExecutorConfig};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    const FIVE_SECONDS: Option<Duration> = Some(Duration::from_secs(5));

    struct Harness {
        network: Arc<LocalNetwork>,
    }

    impl Harness {
        fn new() -> Self {
            let io = Arc::new(IoRuntime::new(2).unwrap());
            Self {
                network: Arc::new(LocalNetwork::new(io)),
            }
        }

        fn node(&self, port: u16, config: RpcConfig) -> Arc<Dispatcher> {
            let executor = Executor::new(
                ExecutorConfig {
                    name: format!("node-{port}"),
                    worker_count: 2,
                },
                Arc::new(Environment::system()),
            )
            .unwrap();
            Dispatcher::new(
                EndPoint::new("localhost", port),
                Arc::new(executor),
                self.network.clone(),
                config,
            )
            .unwrap()
        }
    }

    fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..500 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn pong_server(harness: &Harness, port: u16) -> Arc<Dispatcher> {
        let server = harness.node(port, RpcConfig::default());
        server
            .register_rpc_handler("PING", "ping", |ctx: &RpcContext, request: Message| {
                ctx.reply(request.create_response().with_payload(b"pong".to_vec()));
            })
            .unwrap();
        server
    }

    #[test]
    fn ping_callback_receives_pong() {
        let harness = Harness::new();
        let server = pong_server(&harness, 9001);
        let client = harness.node(9002, RpcConfig::default());
        let (tx, rx) = mpsc::channel();

        let task = client
            .call(
                server.primary_address(),
                Message::request("PING", b"ping".to_vec()),
                Some(Box::new(move |result: &TaskResult<Message>| {
                    tx.send(result.clone()).unwrap();
                })),
            )
            .unwrap();

        assert!(task.wait(FIVE_SECONDS));
        assert_eq!(task.state(), TaskState::Completed);
        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(reply.payload(), b"pong");
        assert_eq!(reply.from(), Some(server.primary_address()));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn unbound_code_fails_the_call_with_argument_error() {
        let harness = Harness::new();
        let server = harness.node(9011, RpcConfig::default());
        let client = harness.node(9012, RpcConfig::default());

        let task = client
            .call(server.primary_address(), Message::request("MISSING", Vec::<u8>::new()), None)
            .unwrap();

        assert!(task.wait(FIVE_SECONDS));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(matches!(task.take_result(), Some(Err(SpindleError::Argument(_)))));
    }

    #[test]
    fn unreachable_server_fails_with_network_error() {
        let harness = Harness::new();
        let client = harness.node(9021, RpcConfig::default());

        let task = client
            .call(&EndPoint::new("nowhere", 1), Message::request("PING", Vec::<u8>::new()), None)
            .unwrap();

        assert!(task.wait(FIVE_SECONDS));
        assert!(matches!(task.take_result(), Some(Err(SpindleError::Network(_)))));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn silent_handler_times_out_and_late_reply_is_retained() {
        let harness = Harness::new();
        let server = harness.node(9031, RpcConfig::default());
        let client = harness.node(
            9032,
            RpcConfig {
                late_reply: LateReplyPolicy::Retain,
                ..RpcConfig::default()
            },
        );
        server
            .register_rpc_handler("SLOW", "slow", |ctx: &RpcContext, request: Message| {
                let Some(dispatcher) = ctx.dispatcher() else {
                    return;
                };
                let ctx = ctx.clone();
                let later = Task::new("slow.reply", move |_| {
                    ctx.reply(request.create_response().with_payload(b"late".to_vec()));
                    Ok(())
                });
                dispatcher
                    .executor()
                    .enqueue(&later, Duration::from_millis(150))
                    .unwrap();
            })
            .unwrap();

        let task = client
            .call(
                server.primary_address(),
                Message::request("SLOW", Vec::<u8>::new()).with_timeout_ms(30),
                None,
            )
            .unwrap();

        assert!(task.wait(FIVE_SECONDS));
        assert_eq!(task.take_result(), Some(Err(SpindleError::Timeout(30))));
        assert!(eventually(|| !client.take_late_replies().is_empty()));
    }

    #[test]
    fn tight_budget_always_times_out_against_silent_server() {
        let harness = Harness::new();
        let server = harness.node(9033, RpcConfig::default());
        let client = harness.node(9034, RpcConfig::default());
        server
            .register_rpc_handler("MUTE", "mute", |_: &RpcContext, _: Message| {})
            .unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                client
                    .call(
                        server.primary_address(),
                        Message::request("MUTE", Vec::<u8>::new()).with_timeout_ms(1),
                        None,
                    )
                    .unwrap()
            })
            .collect();

        for task in &tasks {
            assert!(task.wait(FIVE_SECONDS));
            assert_eq!(task.take_result(), Some(Err(SpindleError::Timeout(1))));
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn canceled_calls_leave_no_pending_entries() {
        let harness = Harness::new();
        let server = harness.node(9035, RpcConfig::default());
        let client = harness.node(
            9036,
            RpcConfig {
                default_timeout_ms: 0,
                ..RpcConfig::default()
            },
        );
        server
            .register_rpc_handler("MUTE", "mute", |_: &RpcContext, _: Message| {})
            .unwrap();

        for _ in 0..100 {
            let task = client
                .call(server.primary_address(), Message::request("MUTE", Vec::<u8>::new()), None)
                .unwrap();
            assert_eq!(task.cancel(false), CancelOutcome::Intercepted);
        }

        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn untimed_request_stays_answerable() {
        let harness = Harness::new();
        let server = harness.node(9037, RpcConfig::default());
        let client = harness.node(9038, RpcConfig::default());
        let held = Arc::new(Mutex::new(None));
        let slot = held.clone();
        server
            .register_rpc_handler("PARK", "park", move |ctx: &RpcContext, request: Message| {
                *slot.lock().unwrap() = Some((ctx.clone(), request));
            })
            .unwrap();

        let task = client
            .call(
                server.primary_address(),
                Message::request("PARK", Vec::<u8>::new()).with_timeout_ms(0),
                None,
            )
            .unwrap();
        assert!(eventually(|| held.lock().unwrap().is_some()));

        let expiries: Vec<u64> = relock(&server.awaiting_reply).values().copied().collect();
        assert_eq!(expiries, vec![u64::MAX]);

        let (ctx, request) = held.lock().unwrap().take().unwrap();
        ctx.reply(request.create_response().with_payload(b"done".to_vec()));
        assert!(task.wait(FIVE_SECONDS));
        assert_eq!(task.take_result().unwrap().unwrap().payload(), b"done");
    }

    #[test]
    fn second_reply_is_ignored() {
        let harness = Harness::new();
        let server = harness.node(9041, RpcConfig::default());
        let client = harness.node(
            9042,
            RpcConfig {
                late_reply: LateReplyPolicy::Retain,
                ..RpcConfig::default()
            },
        );
        server
            .register_rpc_handler("TWICE", "twice", |ctx: &RpcContext, request: Message| {
                ctx.reply(request.create_response().with_payload(b"first".to_vec()));
                ctx.reply(request.create_response().with_payload(b"second".to_vec()));
            })
            .unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();

        let task = client
            .call(
                server.primary_address(),
                Message::request("TWICE", Vec::<u8>::new()),
                Some(Box::new(move |_: &TaskResult<Message>| {
                    count.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        assert!(task.wait(FIVE_SECONDS));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(task.take_result().unwrap().unwrap().payload(), b"first");
        assert!(client.take_late_replies().is_empty());
    }

    #[test]
    fn one_way_reaches_handler_without_response_task() {
        let harness = Harness::new();
        let server = harness.node(9051, RpcConfig::default());
        let client = harness.node(9052, RpcConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        server
            .register_rpc_handler("NOTE", "note", move |ctx: &RpcContext, request: Message| {
                seen.fetch_add(1, Ordering::SeqCst);
                // one-way: nothing to answer
                ctx.reply(request.create_response());
            })
            .unwrap();

        client.call_one_way(server.primary_address(), Message::request("NOTE", Vec::<u8>::new()));

        assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));
        assert_eq!(client.pending_calls(), 0);
    }

    #[test]
    fn duplicate_registration_fails_and_original_keeps_serving() {
        let harness = Harness::new();
        let server = pong_server(&harness, 9061);
        let client = harness.node(9062, RpcConfig::default());

        let again = server.register_rpc_handler("PING", "other", |_: &RpcContext, _: Message| {});
        assert!(matches!(again, Err(SpindleError::Argument(_))));

        let task = client
            .call(server.primary_address(), Message::request("PING", Vec::<u8>::new()), None)
            .unwrap();
        assert!(task.wait(FIVE_SECONDS));
        assert_eq!(task.take_result().unwrap().unwrap().payload(), b"pong");
    }

    #[test]
    fn close_fails_outstanding_calls() {
        let harness = Harness::new();
        let server = harness.node(9071, RpcConfig::default());
        let client = harness.node(9072, RpcConfig::default());
        server
            .register_rpc_handler("HOLD", "hold", |_: &RpcContext, _: Message| {})
            .unwrap();

        let task = client
            .call(server.primary_address(), Message::request("HOLD", Vec::<u8>::new()), None)
            .unwrap();
        client.close();

        assert!(task.wait(FIVE_SECONDS));
        assert!(matches!(task.take_result(), Some(Err(SpindleError::State(_)))));
        assert!(harness.network.bound_addresses().contains(server.primary_address()));
        assert!(!harness.network.bound_addresses().contains(client.primary_address()));
    }
}
