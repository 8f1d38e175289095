//! Middleware chain driver (§4.6).
//!
//! A chain is an ordered list of callables `(req, res, next) -> Result<()>`.
//! The engine drives the chain recursively: slot `i` receives a `next` that,
//! when invoked, drives slot `i+1`; once all slots are exhausted, control
//! passes to the handler. This needs no coroutine support — ordinary
//! synchronous call semantics with a slot-index argument suffice (§9).
//!
//! Each slot fires `middleware:beforeExecute`/`middleware:afterExecute`/
//! `middleware:error` on the hook bus, carrying a `MiddlewareInfo` snapshot
//! (§3) so observers can see chain position without instrumenting handlers
//! themselves.

use std::cell::Cell;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::errors::TitanError;
use crate::hooks::{HookBus, HookName};
use crate::request::{RequestContext, ResponseContext};

pub type HandlerResult = Result<(), TitanError>;
pub type MiddlewareFn = Arc<dyn Fn(&mut RequestContext, &mut ResponseContext, &Next) -> HandlerResult + Send + Sync>;
pub type HandlerFn<'a> = dyn Fn(&mut RequestContext, &mut ResponseContext) -> HandlerResult + 'a;

/// One named entry of a chain: the middleware's declared name plus the
/// callable itself, so the hook payloads below can report who ran.
pub type ChainEntry = (String, MiddlewareFn);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Global,
    Route,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub path: String,
    pub method: Option<String>,
    pub dynamic: bool,
}

/// `{ type, name, positionInChain, totalInChain, route? }` — passed to hook
/// handlers for observability (§3).
#[derive(Debug, Clone, Serialize)]
pub struct MiddlewareInfo {
    #[serde(rename = "type")]
    pub kind: ChainKind,
    pub name: String,
    #[serde(rename = "positionInChain")]
    pub position_in_chain: usize,
    #[serde(rename = "totalInChain")]
    pub total_in_chain: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteInfo>,
}

/// The `next` handle passed into a middleware slot. `call` may be invoked
/// at most once; a second invocation is logged and ignored (P6) rather than
/// driving the chain twice.
pub struct Next<'a> {
    chain: &'a [ChainEntry],
    handler: &'a HandlerFn<'a>,
    idx: usize,
    invoked: Cell<bool>,
    hooks: &'a HookBus,
    kind: ChainKind,
    route: Option<&'a RouteInfo>,
}

impl<'a> Next<'a> {
    pub fn call(&self, req: &mut RequestContext, res: &mut ResponseContext) -> HandlerResult {
        if self.invoked.replace(true) {
            tracing::warn!("next() invoked more than once in the same middleware slot; ignoring");
            return Ok(());
        }
        drive(self.chain, self.handler, self.idx, req, res, self.hooks, self.kind, self.route)
    }
}

#[allow(clippy::too_many_arguments)]
fn drive<'a>(
    chain: &'a [ChainEntry],
    handler: &'a HandlerFn<'a>,
    idx: usize,
    req: &mut RequestContext,
    res: &mut ResponseContext,
    hooks: &'a HookBus,
    kind: ChainKind,
    route: Option<&'a RouteInfo>,
) -> HandlerResult {
    // If res.done became true at any point, remaining middlewares and the
    // handler are skipped (§4.6 chain semantics).
    if res.is_done() {
        return Ok(());
    }
    if idx >= chain.len() {
        return handler(req, res);
    }

    let (name, middleware) = &chain[idx];
    let info = MiddlewareInfo {
        kind,
        name: name.clone(),
        position_in_chain: idx,
        total_in_chain: chain.len(),
        route: route.cloned(),
    };
    hooks.fire_sync(HookName::MiddlewareBeforeExecute, to_json(&info));

    let next = Next { chain, handler, idx: idx + 1, invoked: Cell::new(false), hooks, kind, route };
    let result = middleware(req, res, &next);

    match &result {
        Ok(()) => hooks.fire_sync(HookName::MiddlewareAfterExecute, to_json(&info)),
        Err(err) => {
            let payload = serde_json::json!({
                "middleware": info,
                "message": err.message,
                "status": err.status().as_u16(),
            });
            hooks.fire_sync(HookName::MiddlewareError, payload);
        }
    }

    result
}

fn to_json(info: &MiddlewareInfo) -> Value {
    serde_json::to_value(info).unwrap_or(Value::Null)
}

/// Run a full chain followed by the handler. A middleware that returns
/// without calling `next` short-circuits: no later middleware or the
/// handler runs (P5).
#[allow(clippy::too_many_arguments)]
pub fn run_chain(
    chain: &[ChainEntry],
    handler: &HandlerFn<'_>,
    req: &mut RequestContext,
    res: &mut ResponseContext,
    hooks: &HookBus,
    kind: ChainKind,
    route: Option<&RouteInfo>,
) -> HandlerResult {
    drive(chain, handler, 0, req, res, hooks, kind, route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use axum::http::HeaderMap;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> (RequestContext, ResponseContext) {
        (
            RequestContext::new(
                "/".into(),
                "GET".into(),
                HeaderMap::new(),
                HashMap::new(),
                Options::default(),
                "req-1".into(),
            ),
            ResponseContext::new(),
        )
    }

    fn entry(name: &str, f: MiddlewareFn) -> ChainEntry {
        (name.to_string(), f)
    }

    #[test]
    fn short_circuit_skips_later_middleware_and_handler() {
        let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let handler_ran = Arc::new(AtomicUsize::new(0));
        let handler_ran2 = handler_ran.clone();

        let chain: Vec<ChainEntry> = vec![
            entry(
                "stop",
                Arc::new(move |_req, res, _next| {
                    res.send_text("stopped early");
                    Ok(())
                }),
            ),
            entry(
                "never-runs",
                Arc::new(move |req, res, next| {
                    ran2.fetch_add(1, Ordering::SeqCst);
                    next.call(req, res)
                }),
            ),
        ];

        let handler: Box<HandlerFn> = Box::new(move |_req, _res| {
            handler_ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (mut req, mut res) = ctx();
        let hooks = HookBus::new();
        run_chain(&chain, &*handler, &mut req, &mut res, &hooks, ChainKind::Route, None).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(handler_ran.load(Ordering::SeqCst), 0);
        assert!(res.is_done());
    }

    #[test]
    fn full_chain_calls_handler_when_all_slots_call_next() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let chain: Vec<ChainEntry> = vec![
            entry(
                "mw1",
                Arc::new(move |req, res, next| {
                    o1.lock().unwrap().push("mw1");
                    next.call(req, res)
                }),
            ),
            entry(
                "mw2",
                Arc::new(move |req, res, next| {
                    o2.lock().unwrap().push("mw2");
                    next.call(req, res)
                }),
            ),
        ];

        let o3 = order.clone();
        let handler: Box<HandlerFn> = Box::new(move |_req, res| {
            o3.lock().unwrap().push("handler");
            res.json(&serde_json::json!({"ok": true}));
            Ok(())
        });

        let (mut req, mut res) = ctx();
        let hooks = HookBus::new();
        run_chain(&chain, &*handler, &mut req, &mut res, &hooks, ChainKind::Route, None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["mw1", "mw2", "handler"]);
        assert!(res.is_done());
    }

    #[test]
    fn double_next_is_a_no_op_on_second_call() {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let hc = handler_calls.clone();

        let chain: Vec<ChainEntry> = vec![entry(
            "double-call",
            Arc::new(move |req, res, next| {
                next.call(req, res)?;
                // second call: must not re-enter the handler.
                next.call(req, res)
            }),
        )];

        let handler: Box<HandlerFn> = Box::new(move |_req, res| {
            hc.fetch_add(1, Ordering::SeqCst);
            res.json(&serde_json::json!({}));
            Ok(())
        });

        let (mut req, mut res) = ctx();
        let hooks = HookBus::new();
        run_chain(&chain, &*handler, &mut req, &mut res, &hooks, ChainKind::Route, None).unwrap();
        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn before_and_after_hooks_fire_once_per_slot() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let hooks = HookBus::new();
        let b = before.clone();
        hooks.register(HookName::MiddlewareBeforeExecute, Arc::new(move |_payload| {
            b.fetch_add(1, Ordering::SeqCst);
        }));
        let a = after.clone();
        hooks.register(HookName::MiddlewareAfterExecute, Arc::new(move |_payload| {
            a.fetch_add(1, Ordering::SeqCst);
        }));

        let chain: Vec<ChainEntry> = vec![entry("mw1", Arc::new(|req, res, next| next.call(req, res)))];
        let handler: Box<HandlerFn> = Box::new(|_req, res| {
            res.json(&serde_json::json!({}));
            Ok(())
        });

        let (mut req, mut res) = ctx();
        run_chain(&chain, &*handler, &mut req, &mut res, &hooks, ChainKind::Route, None).unwrap();
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_hook_fires_instead_of_after_hook() {
        let after = Arc::new(AtomicUsize::new(0));
        let errored = Arc::new(AtomicUsize::new(0));
        let hooks = HookBus::new();
        let a = after.clone();
        hooks.register(HookName::MiddlewareAfterExecute, Arc::new(move |_payload| {
            a.fetch_add(1, Ordering::SeqCst);
        }));
        let e = errored.clone();
        hooks.register(HookName::MiddlewareError, Arc::new(move |_payload| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        let chain: Vec<ChainEntry> =
            vec![entry("failing", Arc::new(|_req, _res, _next| Err(TitanError::bad_request("nope"))))];
        let handler: Box<HandlerFn> = Box::new(|_req, _res| Ok(()));

        let (mut req, mut res) = ctx();
        let result = run_chain(&chain, &*handler, &mut req, &mut res, &hooks, ChainKind::Route, None);
        assert!(result.is_err());
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(errored.load(Ordering::SeqCst), 1);
    }
}
