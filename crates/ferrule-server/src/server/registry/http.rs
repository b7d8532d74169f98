use crate::server::chain::InterceptorLayer;
use axum::extract::Request;
use axum::handler::Handler;
use axum::response::IntoResponse;
use axum::routing::{MethodFilter, MethodRouter, Route};
use axum::Router;
use ferrule_core::{Error, Result};
use http::Method;
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tower::{Layer, Service};

type RouterLayerFn = Arc<dyn Fn(Router) -> Router + Send + Sync>;
type RouteLayerFn = Arc<dyn Fn(MethodRouter) -> MethodRouter + Send + Sync>;

/// A tower layer applied after routing, to the whole server, a group or a
/// single handler depending on where it is registered.
#[derive(Clone)]
pub struct Middleware {
    name: String,
    router: RouterLayerFn,
    route: RouteLayerFn,
}

impl Middleware {
    pub fn new<L>(name: impl Into<String>, layer: L) -> Self
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        let router_layer = layer.clone();
        Self {
            name: name.into(),
            router: Arc::new(move |router: Router| router.layer(router_layer.clone())),
            route: Arc::new(move |route: MethodRouter| -> MethodRouter {
                route.layer(layer.clone())
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn apply_router(&self, router: Router) -> Router {
        (self.router)(router)
    }

    fn apply_route(&self, route: MethodRouter) -> MethodRouter {
        (self.route)(route)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Middleware").field(&self.name).finish()
    }
}

/// A tower layer that runs before route matching, around the whole router.
#[derive(Clone)]
pub struct PreMiddleware {
    name: String,
    wrap: RouterLayerFn,
}

impl PreMiddleware {
    pub fn new<L>(name: impl Into<String>, layer: L) -> Self
    where
        L: Layer<Router> + Send + Sync + 'static,
        L::Service: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        Self {
            name: name.into(),
            wrap: Arc::new(move |router: Router| {
                Router::new().fallback_service(layer.layer(router))
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PreMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreMiddleware").field(&self.name).finish()
    }
}

/// One handler bound to a method and path.
pub struct HandlerRoute {
    method: Method,
    path: String,
    route: Option<MethodRouter>,
    middlewares: Vec<Middleware>,
}

impl HandlerRoute {
    pub fn new<H, T>(method: Method, path: impl Into<String>, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        // Methods axum cannot route are reported when the registry resolves.
        let route = MethodFilter::try_from(method.clone())
            .ok()
            .map(|filter| axum::routing::on(filter, handler));
        Self {
            method,
            path: path.into(),
            route,
            middlewares: Vec::new(),
        }
    }

    /// Handler-local middleware, run inside group and global ones.
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn identity(&self, prefix: &str) -> String {
        format!("{} {}", self.method, join_path(prefix, &self.path))
    }

    fn into_method_router(self) -> Result<MethodRouter> {
        let Some(mut route) = self.route else {
            return Err(Error::UnsupportedMethod {
                method: self.method.to_string(),
                path: self.path,
            });
        };
        for middleware in self.middlewares.iter().rev() {
            route = middleware.apply_route(route);
        }
        Ok(route)
    }
}

impl fmt::Debug for HandlerRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRoute")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("middlewares", &self.middlewares)
            .finish()
    }
}

/// Handlers sharing a path prefix and group-scoped middlewares.
#[derive(Debug)]
pub struct HandlerGroup {
    prefix: String,
    handlers: Vec<HandlerRoute>,
    middlewares: Vec<Middleware>,
}

impl HandlerGroup {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_owned(),
            handlers: Vec::new(),
            middlewares: Vec::new(),
        }
    }

    pub fn handler(mut self, handler: HandlerRoute) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn into_router(self) -> Result<Router> {
        let mut router = Router::new();
        for handler in self.handlers {
            let path = handler.path.clone();
            router = router.route(&path, handler.into_method_router()?);
        }
        for middleware in self.middlewares.iter().rev() {
            router = middleware.apply_router(router);
        }
        Ok(router)
    }
}

/// Write-once, read-once collector of HTTP routes and middlewares.
#[derive(Debug, Default)]
pub struct HttpRegistry {
    groups: Vec<HandlerGroup>,
    handlers: Vec<HandlerRoute>,
    pre: Vec<PreMiddleware>,
    global: Vec<Middleware>,
}

impl HttpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_group(&mut self, group: HandlerGroup) -> &mut Self {
        tracing::debug!(prefix = %group.prefix, "registering handler group");
        self.groups.push(group);
        self
    }

    pub fn register_handler(&mut self, handler: HandlerRoute) -> &mut Self {
        tracing::debug!(method = %handler.method, path = %handler.path, "registering handler");
        self.handlers.push(handler);
        self
    }

    /// Middleware run before route matching.
    pub fn register_pre_middleware(&mut self, middleware: PreMiddleware) -> &mut Self {
        tracing::debug!(name = %middleware.name, "registering pre middleware");
        self.pre.push(middleware);
        self
    }

    /// Middleware run after route matching, for every route.
    pub fn register_middleware(&mut self, middleware: Middleware) -> &mut Self {
        tracing::debug!(name = %middleware.name, "registering middleware");
        self.global.push(middleware);
        self
    }

    /// Validates the registrations. Two handlers answering the same method
    /// on the same full path are rejected, as are paths axum cannot route:
    /// legacy `:param`/`*rest` segments and templates that conflict in the
    /// matcher.
    pub fn resolve(self) -> Result<ResolvedRoutes> {
        for group in &self.groups {
            if !group.prefix.is_empty() {
                check_prefix(&group.prefix)?;
            }
        }

        let mut seen = HashSet::new();
        let mut matcher = matchit::Router::new();
        let mut paths = HashSet::new();
        let grouped = self
            .groups
            .iter()
            .flat_map(|g| g.handlers.iter().map(move |h| (g.prefix.as_str(), h)));
        let standalone = self.handlers.iter().map(|h| ("", h));
        for (prefix, handler) in grouped.chain(standalone) {
            if !handler.path.starts_with('/') {
                return Err(invalid_route(&handler.path, "paths must start with '/'"));
            }
            if handler.route.is_none() {
                return Err(Error::UnsupportedMethod {
                    method: handler.method.to_string(),
                    path: handler.path.clone(),
                });
            }
            let identity = handler.identity(prefix);
            if !seen.insert(identity.clone()) {
                return Err(Error::DuplicateRegistration { identity });
            }

            let full = join_path(prefix, &handler.path);
            check_segments(&full)?;
            // Other methods on a known path merge into its method router.
            if paths.insert(full.clone()) {
                matcher
                    .insert(full.clone(), ())
                    .map_err(|err| invalid_route(&full, err))?;
            }
        }

        Ok(ResolvedRoutes {
            groups: self.groups,
            handlers: self.handlers,
            pre: self.pre,
            global: self.global,
        })
    }
}

fn invalid_route(path: &str, reason: impl fmt::Display) -> Error {
    Error::InvalidRoute {
        path: path.to_owned(),
        reason: reason.to_string(),
    }
}

/// Rejects the `:param` and `*rest` segments of axum 0.7, which the router
/// refuses at insertion.
fn check_segments(path: &str) -> Result<()> {
    for segment in path.split('/') {
        if segment.starts_with(':') {
            return Err(invalid_route(path, "captures are written `{param}`, not `:param`"));
        }
        if segment.starts_with('*') {
            return Err(invalid_route(path, "wildcards are written `{*rest}`, not `*rest`"));
        }
    }
    Ok(())
}

fn check_prefix(prefix: &str) -> Result<()> {
    if !prefix.starts_with('/') {
        return Err(invalid_route(prefix, "paths must start with '/'"));
    }
    check_segments(prefix)?;
    if prefix.split('/').any(|segment| segment.starts_with("{*")) {
        return Err(invalid_route(prefix, "group prefixes cannot hold wildcards"));
    }
    Ok(())
}

/// Validated registrations, ready to become a router.
#[derive(Debug)]
pub struct ResolvedRoutes {
    groups: Vec<HandlerGroup>,
    handlers: Vec<HandlerRoute>,
    pre: Vec<PreMiddleware>,
    global: Vec<Middleware>,
}

impl ResolvedRoutes {
    /// `METHOD /full/path` of every handler, groups first, in registration
    /// order.
    pub fn routes(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.handlers.iter().map(|h| h.identity(&g.prefix)))
            .chain(self.handlers.iter().map(|h| h.identity("")))
            .collect()
    }

    pub fn pre_middlewares(&self) -> impl Iterator<Item = &str> {
        self.pre.iter().map(PreMiddleware::name)
    }

    pub fn middlewares(&self) -> impl Iterator<Item = &str> {
        self.global.iter().map(Middleware::name)
    }

    /// Assembles the final router on top of `base`.
    ///
    /// From the outside in: pre middlewares in registration order, then the
    /// interceptor chain, global middlewares, group middlewares and handler
    /// middlewares.
    pub(crate) fn into_router(self, base: Router, interceptors: InterceptorLayer) -> Result<Router> {
        let mut router = base;
        for group in self.groups {
            let prefix = group.prefix.clone();
            let group_router = group.into_router()?;
            router = if prefix.is_empty() {
                router.merge(group_router)
            } else {
                router.nest(&prefix, group_router)
            };
        }
        for handler in self.handlers {
            let path = handler.path.clone();
            router = router.route(&path, handler.into_method_router()?);
        }
        for middleware in self.global.iter().rev() {
            router = middleware.apply_router(router);
        }
        router = router.layer(interceptors);
        for pre in self.pre.iter().rev() {
            router = (pre.wrap)(router);
        }
        Ok(router)
    }
}

fn join_path(prefix: &str, path: &str) -> String {
    match (prefix.is_empty(), path) {
        (true, _) => path.to_owned(),
        (false, "/") => prefix.to_owned(),
        (false, _) => format!("{prefix}{path}"),
    }
}
