//! Turns intercepted calls into suspended waiter entries plus host requests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use rquickjs::{Ctx, Exception, Value};
use skein_core::{BundleManifest, CallError, CallOutcome, CallTarget, CallToken, CallWaiter, Completion, TokenMinter};
use skein_sandbox::{Callee, InterceptedCall, Interceptor};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Work the script thread hands to the dispatcher.
#[derive(Debug)]
pub(crate) enum HostRequest {
    /// An intercepted call waiting for its reply.
    Call {
        token: CallToken,
        target: CallTarget,
        args: serde_json::Value,
    },
    /// The entry point settled.
    Done { outcome: CallOutcome },
}

pub(crate) struct RunnerInterceptor {
    minter: TokenMinter,
    call_sites: HashMap<String, CallTarget>,
    waiter: Arc<CallWaiter<String>>,
    host: mpsc::UnboundedSender<HostRequest>,
    parked: RefCell<Vec<(String, Completion)>>,
}

impl RunnerInterceptor {
    pub(crate) fn new(
        runner_id: &str,
        bundle: &BundleManifest,
        waiter: Arc<CallWaiter<String>>,
        host: mpsc::UnboundedSender<HostRequest>,
    ) -> Self {
        let call_sites = bundle
            .modules
            .iter()
            .flat_map(|module| module.call_sites.iter())
            .map(|site| (site.site.clone(), site.target.clone()))
            .collect();
        Self {
            minter: TokenMinter::new(runner_id),
            call_sites,
            waiter,
            host,
            parked: RefCell::new(Vec::new()),
        }
    }

    /// Calls suspended since the last drain, keyed by sandbox call id.
    pub(crate) fn drain_parked(&self) -> Vec<(String, Completion)> {
        std::mem::take(&mut *self.parked.borrow_mut())
    }

    /// The target recorded at rewrite time, falling back to what the engine
    /// can tell about the callee.
    fn target(&self, site: &str, callee: &Callee<'_>) -> CallTarget {
        if let Callee::Syscall { name } = callee {
            return CallTarget::syscall(name.clone());
        }
        if let Some(target) = self.call_sites.get(site) {
            return target.clone();
        }
        let described = callee.describe();
        match callee {
            Callee::Method { name, .. } => {
                let receiver = described
                    .strip_suffix(name.as_str())
                    .and_then(|r| r.strip_suffix('.'))
                    .unwrap_or(&described);
                CallTarget::method(receiver, name.clone())
            }
            _ => CallTarget::function(described),
        }
    }
}

impl Interceptor for RunnerInterceptor {
    fn intercept<'js>(
        &self,
        ctx: &Ctx<'js>,
        call: InterceptedCall<'js>,
    ) -> rquickjs::Result<Value<'js>> {
        let token = self.minter.mint(&call.site);
        let target = self.target(&call.site, &call.callee);
        let args: serde_json::Value = serde_json::from_str(&call.args_json(ctx)?)
            .map_err(|e| Exception::throw_type(ctx, &format!("{}: arguments are not JSON: {e}", call.site)))?;

        let call_id = token.to_string();
        let completion = self
            .waiter
            .wait(call_id.clone(), target.clone(), args.clone(), token.clone())
            .map_err(|e| Exception::throw_message(ctx, &e.to_string()))?;
        debug!(token = %token, site = %call.site, target = %target, "call suspended");

        let promise = call.defer(ctx, &call_id)?;
        self.parked.borrow_mut().push((call_id, completion));

        let request = HostRequest::Call {
            token: token.clone(),
            target,
            args,
        };
        if self.host.send(request).is_err() {
            warn!(token = %token, "handler dispatcher is gone");
            let _ = self.waiter.reply_signal(
                &token,
                Err(CallError::Host("handler connection closed".to_string())),
            );
        }
        Ok(promise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::bundle::BundledModule;
    use skein_core::transform::CallSite;

    fn interceptor() -> RunnerInterceptor {
        let bundle = BundleManifest {
            modules: vec![BundledModule {
                path: "main.js".into(),
                call_sites: vec![CallSite {
                    site: "main.js:3:9".into(),
                    target: CallTarget::method("api", "fetch"),
                    awaited: true,
                }],
            }],
            ..Default::default()
        };
        let (host, _) = mpsc::unbounded_channel();
        RunnerInterceptor::new("r1", &bundle, Arc::new(CallWaiter::new()), host)
    }

    #[test]
    fn test_target_prefers_rewrite_time_call_site() {
        let interceptor = interceptor();
        let syscall = Callee::Syscall {
            name: "sleep".into(),
        };
        assert_eq!(
            interceptor.target("skein", &syscall),
            CallTarget::syscall("sleep")
        );
        assert_eq!(
            interceptor.target("main.js:3:9", &syscall),
            CallTarget::syscall("sleep")
        );
        assert_eq!(interceptor.call_sites.len(), 1);
        assert_eq!(
            interceptor.call_sites.get("main.js:3:9"),
            Some(&CallTarget::method("api", "fetch"))
        );
    }
}
