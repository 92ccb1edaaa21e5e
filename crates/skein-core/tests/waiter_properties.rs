use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;
use serde_json::json;
use skein_core::{CallError, CallTarget, CallToken, CallWaiter, WaiterError};

#[derive(Debug, Clone)]
enum Op {
    Execute(usize),
    Reply(usize),
}

fn op(tokens: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..tokens).prop_map(Op::Execute),
        (0..tokens).prop_map(Op::Reply),
    ]
}

proptest! {
    #[test]
    fn replies_and_executions_happen_at_most_once(ops in prop::collection::vec(op(4), 0..40)) {
        let waiter: CallWaiter<usize> = CallWaiter::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let tokens: Vec<CallToken> = (0..4).map(|i| CallToken::new(format!("runner/site/{i}"))).collect();
        let mut completions: Vec<_> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| Some(waiter.wait(i, CallTarget::function("f"), json!([i]), t.clone()).unwrap()))
            .collect();

        let mut executed = [false; 4];
        let mut replied = [false; 4];
        for op in ops {
            match op {
                Op::Execute(i) => {
                    let counter = executions.clone();
                    let result = waiter.execute_signal(&tokens[i], move |id, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        id
                    });
                    if executed[i] || replied[i] {
                        prop_assert!(matches!(result, Err(WaiterError::TokenMismatch { .. })), "execute {:?}", result);
                    } else {
                        prop_assert_eq!(result, Ok(i));
                        executed[i] = true;
                    }
                }
                Op::Reply(i) => {
                    let result = waiter.reply_signal(&tokens[i], Ok(json!(i)));
                    if replied[i] {
                        prop_assert!(matches!(result, Err(WaiterError::TokenMismatch { .. })), "reply {:?}", result);
                    } else {
                        prop_assert!(result.is_ok());
                        replied[i] = true;
                        let completion = completions[i].take().unwrap();
                        prop_assert_eq!(completion.blocking_wait(), Ok(json!(i)));
                    }
                }
            }
        }

        prop_assert_eq!(executions.load(Ordering::SeqCst), executed.iter().filter(|e| **e).count());
        prop_assert_eq!(waiter.outstanding(), replied.iter().filter(|r| !**r).count());

        waiter.stop();
        for completion in completions.into_iter().flatten() {
            prop_assert_eq!(completion.blocking_wait(), Err(CallError::SessionStopped));
        }
    }
}
