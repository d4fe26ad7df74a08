// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The routing and middleware contracts.
//!
//! The core does not bake in a routing strategy: a router is anything
//! that can turn `(method, path)` into a handler plus captures. The
//! regex-based router everyone actually wants lives outside this crate;
//! `StaticRouter` here is the minimal exact-match implementation that
//! makes the core usable and testable on its own.

use std::error::Error;
use std::ops::ControlFlow;

use crate::request::Method;
use crate::Request;
use crate::Response;

/// What a handler returns. Errors reaching the driver become a 500 when
/// the response head has not been sent yet, and a closed connection
/// otherwise.
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// A request handler.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &Request, response: &mut Response) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Request, &mut Response) -> HandlerResult + Send + Sync,
{
    fn handle(&self, request: &Request, response: &mut Response) -> HandlerResult {
        self(request, response)
    }
}

/// Path captures produced by a router: an ordered list of optional byte
/// ranges into the request path.
#[derive(Debug, Default)]
pub struct Captures {
    ranges: Vec<Option<(usize, usize)>>,
}

impl Captures {
    pub fn new() -> Captures {
        Captures { ranges: Vec::new() }
    }

    /// Appends a capture; `None` records a group that did not match.
    pub fn push(&mut self, range: Option<(usize, usize)>) {
        self.ranges.push(range);
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The captured slice of `path` at `index`.
    pub fn resolve<'a>(&self, path: &'a str, index: usize) -> Option<&'a str> {
        let (start, end) = (*self.ranges.get(index)?)?;
        path.get(start..end)
    }

    pub(crate) fn reset(&mut self) {
        self.ranges.clear();
    }
}

/// A resolved route: the handler to invoke and the path captures.
pub struct RouteMatch<'r> {
    pub handler: &'r dyn Handler,
    pub captures: Captures,
}

/// The router contract. The table behind it is read-only after startup,
/// so resolution takes `&self` and is called concurrently from every
/// worker.
pub trait Router: Send + Sync {
    fn resolve(&self, method: Method, path: &str) -> Option<RouteMatch<'_>>;
}

/// Pre/post filters wrapped around every handler invocation.
pub trait Middleware: Send + Sync {
    /// Runs before routing. Returning `Break(response)` short-circuits:
    /// the response is sent and neither the router nor the handler runs.
    fn pre(&self, _request: &Request) -> ControlFlow<Response> {
        ControlFlow::Continue(())
    }

    /// Runs after the handler, before the response is transmitted in the
    /// common buffered case.
    fn post(&self, _request: &Request, _response: &Response) {}
}

/// An exact-match router over a fixed table.
#[derive(Default)]
pub struct StaticRouter {
    routes: Vec<(Method, String, Box<dyn Handler>)>,
}

impl StaticRouter {
    pub fn new() -> StaticRouter {
        StaticRouter { routes: Vec::new() }
    }

    pub fn add<H>(&mut self, method: Method, path: &str, handler: H)
    where
        H: Handler + 'static,
    {
        self.routes.push((method, path.to_owned(), Box::new(handler)));
    }

    /// Builder-style variant of `add`.
    pub fn route<H>(mut self, method: Method, path: &str, handler: H) -> StaticRouter
    where
        H: Handler + 'static,
    {
        self.add(method, path, handler);
        self
    }
}

impl Router for StaticRouter {
    fn resolve(&self, method: Method, path: &str) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .find(|(m, p, _)| *m == method && p == path)
            .map(|(_, _, handler)| RouteMatch {
                handler: &**handler,
                captures: Captures::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler(_request: &Request, _response: &mut Response) -> HandlerResult {
        Ok(())
    }

    #[test]
    fn static_router_matches_method_and_path() {
        let router = StaticRouter::new()
            .route(Method::Get, "/", ok_handler)
            .route(Method::Post, "/submit", ok_handler);

        assert!(router.resolve(Method::Get, "/").is_some());
        assert!(router.resolve(Method::Post, "/submit").is_some());
        assert!(router.resolve(Method::Post, "/").is_none());
        assert!(router.resolve(Method::Get, "/submit").is_none());
        assert!(router.resolve(Method::Get, "/missing").is_none());
    }

    #[test]
    fn captures_resolve_against_the_path() {
        let mut captures = Captures::new();
        captures.push(Some((7, 9)));
        captures.push(None);
        captures.push(Some((10, 11)));

        let path = "/users/12/x";
        assert_eq!(captures.resolve(path, 0), Some("12"));
        assert_eq!(captures.resolve(path, 1), None);
        assert_eq!(captures.resolve(path, 2), Some("x"));
        assert_eq!(captures.resolve(path, 3), None);
        assert_eq!(captures.len(), 3);
    }

    #[test]
    fn out_of_range_capture_is_none() {
        let mut captures = Captures::new();
        captures.push(Some((0, 100)));
        assert_eq!(captures.resolve("/short", 0), None);
    }
}
