//! Token-correlated suspension of intercepted calls.
//!
//! `wait` parks a call under its token. The host later decides to run it
//! (`execute_signal`) and eventually delivers the terminal value
//! (`reply_signal`). Deciding to run is decoupled from delivering the reply,
//! which is what lets a restarted host re-drive a call by re-sending the same
//! token.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{CallError, WaiterError};
use crate::target::CallTarget;
use crate::token::CallToken;

/// Terminal value of a single intercepted call.
pub type CallOutcome = Result<Value, CallError>;

struct PendingCall<C> {
    target: CallTarget,
    args: Value,
    /// Taken by the first `execute_signal`.
    callable: Option<C>,
    completion: oneshot::Sender<CallOutcome>,
}

struct Table<C> {
    pending: HashMap<CallToken, PendingCall<C>>,
    stopped: bool,
}

/// Resolves once the call registered by [`CallWaiter::wait`] is replied to
/// or the waiter is stopped.
#[derive(Debug)]
pub struct Completion {
    token: CallToken,
    receiver: oneshot::Receiver<CallOutcome>,
}

impl Completion {
    pub fn token(&self) -> &CallToken {
        &self.token
    }

    /// Blocks the current thread. Must not be called from async code.
    pub fn blocking_wait(self) -> CallOutcome {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(CallError::SessionStopped))
    }
}

impl Future for Completion {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::SessionStopped)))
    }
}

/// Token table of one session. `C` is whatever the caller needs to run the
/// call later; the waiter never looks inside it.
pub struct CallWaiter<C> {
    table: Mutex<Table<C>>,
}

impl<C> Default for CallWaiter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CallWaiter<C> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                pending: HashMap::new(),
                stopped: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table<C>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `callable` and `args` under `token` and returns the
    /// completion the caller suspends on.
    pub fn wait(
        &self,
        callable: C,
        target: CallTarget,
        args: Value,
        token: CallToken,
    ) -> Result<Completion, WaiterError> {
        let mut table = self.lock();
        if table.stopped {
            return Err(WaiterError::SessionStopped);
        }
        if table.pending.contains_key(&token) {
            return Err(WaiterError::DuplicateToken {
                token: token.to_string(),
            });
        }
        let (sender, receiver) = oneshot::channel();
        trace!(token = %token, target = %target, "call suspended");
        table.pending.insert(
            token.clone(),
            PendingCall {
                target,
                args,
                callable: Some(callable),
                completion: sender,
            },
        );
        Ok(Completion { token, receiver })
    }

    /// Runs the callable registered under `token` and returns its result.
    ///
    /// The call stays pending until [`reply_signal`](Self::reply_signal).
    /// `invoke` runs outside the table lock.
    pub fn execute_signal<R>(
        &self,
        token: &CallToken,
        invoke: impl FnOnce(C, &Value) -> R,
    ) -> Result<R, WaiterError> {
        let (callable, args) = {
            let mut table = self.lock();
            let mismatch = || WaiterError::TokenMismatch {
                token: token.to_string(),
            };
            let pending = table.pending.get_mut(token).ok_or_else(mismatch)?;
            let callable = pending.callable.take().ok_or_else(mismatch)?;
            (callable, pending.args.clone())
        };
        trace!(token = %token, "executing suspended call");
        Ok(invoke(callable, &args))
    }

    /// Delivers the terminal value for `token`, resolving exactly one `wait`.
    pub fn reply_signal(&self, token: &CallToken, outcome: CallOutcome) -> Result<(), WaiterError> {
        let pending = self
            .lock()
            .pending
            .remove(token)
            .ok_or_else(|| WaiterError::TokenMismatch {
                token: token.to_string(),
            })?;
        if pending.completion.send(outcome).is_err() {
            debug!(token = %token, "reply delivered after caller went away");
        }
        Ok(())
    }

    /// Executes the call and feeds the result back to its original caller.
    pub fn execute_and_reply(
        &self,
        token: &CallToken,
        invoke: impl FnOnce(C, &Value) -> CallOutcome,
    ) -> Result<(), WaiterError> {
        let outcome = self.execute_signal(token, invoke)?;
        self.reply_signal(token, outcome)
    }

    /// Fails every outstanding call with [`CallError::SessionStopped`] and
    /// rejects further registrations. Returns how many calls were cancelled.
    pub fn stop(&self) -> usize {
        let drained: Vec<(CallToken, PendingCall<C>)> = {
            let mut table = self.lock();
            table.stopped = true;
            table.pending.drain().collect()
        };
        let count = drained.len();
        for (token, pending) in drained {
            trace!(token = %token, "cancelling suspended call");
            let _ = pending.completion.send(Err(CallError::SessionStopped));
        }
        if count > 0 {
            debug!(cancelled = count, "call waiter stopped");
        }
        count
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn target(&self, token: &CallToken) -> Option<CallTarget> {
        self.lock().pending.get(token).map(|p| p.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type AddFn = Box<dyn FnOnce(&Value) -> CallOutcome + Send>;

    fn adder(calls: Arc<AtomicUsize>) -> AddFn {
        Box::new(move |args: &Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            let sum: i64 = args
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_i64).sum())
                .unwrap_or_default();
            Ok(json!(sum))
        })
    }

    #[tokio::test]
    async fn test_execute_then_reply_reaches_wait_caller() {
        let waiter: CallWaiter<AddFn> = CallWaiter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CallToken::new("r/main.js:1:1/1");

        let completion = waiter
            .wait(adder(calls.clone()), CallTarget::function("add"), json!([2, 3]), token.clone())
            .unwrap();

        let result = waiter.execute_signal(&token, |f, args| f(args)).unwrap();
        assert_eq!(result, Ok(json!(5)));
        assert_eq!(waiter.outstanding(), 1);

        waiter.reply_signal(&token, result).unwrap();
        assert_eq!(completion.await, Ok(json!(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(waiter.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_execute_and_reply() {
        let waiter: CallWaiter<AddFn> = CallWaiter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CallToken::new("t");
        let completion = waiter
            .wait(adder(calls.clone()), CallTarget::function("add"), json!([1, 1]), token.clone())
            .unwrap();

        waiter.execute_and_reply(&token, |f, args| f(args)).unwrap();
        assert_eq!(completion.await, Ok(json!(2)));
    }

    #[test]
    fn test_second_execute_and_second_reply_are_mismatches() {
        let waiter: CallWaiter<AddFn> = CallWaiter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CallToken::new("t");
        let _completion = waiter
            .wait(adder(calls.clone()), CallTarget::function("add"), json!([]), token.clone())
            .unwrap();

        assert!(waiter.execute_signal(&token, |f, a| f(a)).is_ok());
        assert_eq!(
            waiter.execute_signal(&token, |f, a| f(a)).unwrap_err(),
            WaiterError::TokenMismatch { token: "t".into() }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        waiter.reply_signal(&token, Ok(json!(null))).unwrap();
        assert_eq!(
            waiter.reply_signal(&token, Ok(json!(null))).unwrap_err(),
            WaiterError::TokenMismatch { token: "t".into() }
        );
    }

    #[tokio::test]
    async fn test_unknown_token_has_no_side_effects() {
        let waiter: CallWaiter<AddFn> = CallWaiter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CallToken::new("known");
        let completion = waiter
            .wait(adder(calls.clone()), CallTarget::function("add"), json!([4]), token.clone())
            .unwrap();

        let unknown = CallToken::new("unknown");
        assert!(matches!(
            waiter.reply_signal(&unknown, Ok(json!(1))),
            Err(WaiterError::TokenMismatch { .. })
        ));
        assert!(matches!(
            waiter.execute_signal(&unknown, |f, a| f(a)),
            Err(WaiterError::TokenMismatch { .. })
        ));
        assert_eq!(waiter.outstanding(), 1);
        assert_eq!(waiter.target(&token), Some(CallTarget::function("add")));

        waiter.reply_signal(&token, Ok(json!("mine"))).unwrap();
        assert_eq!(completion.await, Ok(json!("mine")));
    }

    #[test]
    fn test_duplicate_outstanding_token_is_rejected() {
        let waiter: CallWaiter<()> = CallWaiter::new();
        let token = CallToken::new("dup");
        let _first = waiter
            .wait((), CallTarget::syscall("sleep"), json!([]), token.clone())
            .unwrap();
        assert_eq!(
            waiter
                .wait((), CallTarget::syscall("sleep"), json!([]), token.clone())
                .unwrap_err(),
            WaiterError::DuplicateToken { token: "dup".into() }
        );

        waiter.reply_signal(&token, Ok(Value::Null)).unwrap();
        assert!(waiter.wait((), CallTarget::syscall("sleep"), json!([]), token).is_ok());
    }

    #[tokio::test]
    async fn test_stop_fails_all_outstanding_calls() {
        let waiter: CallWaiter<()> = CallWaiter::new();
        let a = CallToken::new("a");
        let b = CallToken::new("b");
        let first = waiter
            .wait((), CallTarget::function("x"), json!([]), a.clone())
            .unwrap();
        let second = waiter
            .wait((), CallTarget::method("api", "get"), json!([]), b.clone())
            .unwrap();

        assert_eq!(waiter.stop(), 2);
        assert_eq!(first.await, Err(CallError::SessionStopped));
        assert_eq!(second.await, Err(CallError::SessionStopped));

        assert!(matches!(
            waiter.reply_signal(&a, Ok(json!(1))),
            Err(WaiterError::TokenMismatch { .. })
        ));
        assert!(matches!(
            waiter.reply_signal(&b, Ok(json!(1))),
            Err(WaiterError::TokenMismatch { .. })
        ));
        assert_eq!(
            waiter
                .wait((), CallTarget::function("x"), json!([]), CallToken::new("c"))
                .unwrap_err(),
            WaiterError::SessionStopped
        );
    }

    #[test]
    fn test_concurrent_replies_deliver_exactly_once() {
        let waiter: Arc<CallWaiter<()>> = Arc::new(CallWaiter::new());
        let tokens: Vec<CallToken> = (0..64).map(|i| CallToken::new(format!("t{i}"))).collect();
        let completions: Vec<Completion> = tokens
            .iter()
            .map(|t| {
                waiter
                    .wait((), CallTarget::function("f"), json!([]), t.clone())
                    .unwrap()
            })
            .collect();

        let delivered = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let waiter = waiter.clone();
                let tokens = tokens.clone();
                let delivered = delivered.clone();
                std::thread::spawn(move || {
                    for (i, token) in tokens.iter().enumerate() {
                        if waiter.reply_signal(token, Ok(json!(i))).is_ok() {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(delivered.load(Ordering::SeqCst), tokens.len());
        for (i, completion) in completions.into_iter().enumerate() {
            assert_eq!(completion.blocking_wait(), Ok(json!(i)));
        }
    }
}
