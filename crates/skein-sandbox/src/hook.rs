//! The interception hook seam between sandboxed code and its host.

use std::rc::Rc;

use rquickjs::{Array, Ctx, Exception, Function, Object, Value};
use skein_core::CallOutcome;

/// Global holding the prelude's internal helpers.
pub(crate) const INTERNAL: &str = "__skein_internal";
const NATIVE: &str = "__skein_native";

/// What an intercepted call targets, with live engine values.
pub enum Callee<'js> {
    Function(Function<'js>),
    Method { receiver: Value<'js>, name: String },
    /// `skein.*` or `console.*`.
    Syscall { name: String },
}

impl<'js> Callee<'js> {
    /// Best-effort printable name for logs and targets.
    pub fn describe(&self) -> String {
        match self {
            Callee::Function(function) => function
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "anonymous".to_string()),
            Callee::Method { receiver, name } => {
                let receiver_name = receiver
                    .as_object()
                    .and_then(|o| o.get::<_, Object>("constructor").ok())
                    .and_then(|c| c.get::<_, Option<String>>("name").ok().flatten())
                    .unwrap_or_else(|| receiver.type_name().to_string());
                format!("{receiver_name}.{name}")
            }
            Callee::Syscall { name } => name.clone(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Callee::Function(_) => "function",
            Callee::Method { .. } => "method",
            Callee::Syscall { .. } => "syscall",
        }
    }
}

/// One call that reached `__skein_call` or the SDK.
pub struct InterceptedCall<'js> {
    /// `<module>:<line>:<column>` stamped by the transformer, `skein` for SDK calls.
    pub site: String,
    pub callee: Callee<'js>,
    pub args: Array<'js>,
}

impl<'js> InterceptedCall<'js> {
    /// Arguments as a JSON array. Values JSON cannot represent become `null`.
    pub fn args_json(&self, ctx: &Ctx<'js>) -> rquickjs::Result<String> {
        match ctx.json_stringify(self.args.clone())? {
            Some(json) => json.to_string(),
            None => Ok("[]".to_string()),
        }
    }

    /// Parks the call inside the sandbox under `call_id` and returns the
    /// promise handed back to the script. The callable stays available to
    /// [`crate::Sandbox::start_call`] until the call is settled.
    pub fn defer(self, ctx: &Ctx<'js>, call_id: &str) -> rquickjs::Result<Value<'js>> {
        let kind = self.callee.kind();
        let (subject, method) = match self.callee {
            Callee::Function(function) => (function.into_value(), None),
            Callee::Method { receiver, name } => (receiver, Some(name)),
            Callee::Syscall { name } => (Value::new_undefined(ctx.clone()), Some(name)),
        };
        let internal: Object = ctx.globals().get(INTERNAL)?;
        let defer: Function = internal.get("defer")?;
        defer.call((call_id.to_string(), kind, subject, method, self.args))
    }
}

/// Host side of the hook. Implemented by whoever embeds the sandbox; the
/// sandbox itself does not interpret call targets.
pub trait Interceptor {
    /// Handles one intercepted call and returns the value the script sees,
    /// normally the promise from [`InterceptedCall::defer`].
    fn intercept<'js>(&self, ctx: &Ctx<'js>, call: InterceptedCall<'js>)
    -> rquickjs::Result<Value<'js>>;
}

/// Resolves or rejects the deferred call `call_id`. Returns `false` when no
/// such call is parked.
pub fn settle_call<'js>(
    ctx: &Ctx<'js>,
    call_id: &str,
    outcome: &CallOutcome,
) -> rquickjs::Result<bool> {
    let internal: Object = ctx.globals().get(INTERNAL)?;
    let settle: Function = internal.get("settle")?;
    match outcome {
        Ok(value) => settle.call((
            call_id.to_string(),
            true,
            value.to_string(),
            Value::new_null(ctx.clone()),
            Value::new_null(ctx.clone()),
        )),
        Err(error) => {
            let message = match error {
                skein_core::CallError::Exception { message, .. } => message.clone(),
                other => other.to_string(),
            };
            settle.call((
                call_id.to_string(),
                false,
                Value::new_null(ctx.clone()),
                error.js_name(),
                message,
            ))
        }
    }
}

pub(crate) fn install<'js>(ctx: &Ctx<'js>, interceptor: Rc<dyn Interceptor>) -> rquickjs::Result<()> {
    let native = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              site: String,
              kind: String,
              subject: Value<'js>,
              method: Option<String>,
              args: Array<'js>|
              -> rquickjs::Result<Value<'js>> {
            let callee = match kind.as_str() {
                "function" => match subject.into_function() {
                    Some(function) => Callee::Function(function),
                    None => {
                        return Err(Exception::throw_type(
                            &ctx,
                            &format!("{site}: intercepted callee is not a function"),
                        ));
                    }
                },
                "method" => Callee::Method {
                    receiver: subject,
                    name: method.unwrap_or_default(),
                },
                "syscall" => Callee::Syscall {
                    name: method.unwrap_or_default(),
                },
                other => {
                    return Err(Exception::throw_type(
                        &ctx,
                        &format!("{site}: unknown call kind `{other}`"),
                    ));
                }
            };
            interceptor.intercept(&ctx, InterceptedCall { site, callee, args })
        },
    )?;
    ctx.globals().set(NATIVE, native)
}
