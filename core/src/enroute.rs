//! The enroute registry: declarative routing from topics to callbacks.
//!
//! At startup each user service contributes a set of [`RouteDef`]s — the
//! declarative equivalent of per-method route annotations. The
//! [`EnrouteRegistry`] collects them once into an immutable process-wide map:
//! broker topic → callback, REST `(path, method)` → callback, and periodic
//! schedule → callback.
//!
//! Registration normalizes every callback into a uniform asynchronous
//! signature `(Request) -> Result<Response, HandlerError>`; synchronous
//! handlers are wrapped at registration time via [`handler_sync`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use transit_core::enroute::{
//!     EnrouteRegistry, EnrouteService, RouteDef, RouteTarget, handler_sync,
//! };
//! use transit_core::request::Response;
//!
//! struct TicketService;
//!
//! impl EnrouteService for TicketService {
//!     fn name(&self) -> &str {
//!         "ticket"
//!     }
//!
//!     fn routes(&self) -> Vec<RouteDef> {
//!         vec![RouteDef::new(
//!             "add_ticket",
//!             RouteTarget::BrokerCommand { topic: "AddTicket".into() },
//!             handler_sync(|_request| Ok(Response::from_bytes(b"ok".to_vec()))),
//!         )]
//!     }
//! }
//!
//! let registry = EnrouteRegistry::build(&[Arc::new(TicketService)]).unwrap();
//! assert!(registry.callback_for_topic("AddTicket").is_ok());
//! ```

use crate::request::{HandlerError, Request, Response};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building or querying the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrouteError {
    /// One method was annotated with routes of different kinds.
    #[error("method '{service}::{method}' mixes enroute kinds")]
    ConflictingKinds {
        /// Service declaring the method.
        service: String,
        /// Method name.
        method: String,
    },

    /// The same topic was bound to two distinct callbacks.
    #[error("topic '{0}' is bound to more than one callback")]
    DuplicateTopic(String),

    /// The same REST route was bound to two distinct callbacks.
    #[error("route '{method} {path}' is bound to more than one callback")]
    DuplicateRoute {
        /// HTTP path.
        path: String,
        /// HTTP method.
        method: String,
    },

    /// No callback is registered for the requested topic.
    #[error("no action registered for topic '{0}'")]
    ActionNotFound(String),
}

/// Kind of a route. Two routes on the same method must share a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnrouteKind {
    /// Imperative request expecting a reply.
    Command,
    /// Read-only request expecting a reply.
    Query,
    /// Fact notification; no reply.
    Event,
}

/// Where a route attaches: a broker topic, a REST endpoint or a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Broker command on the given topic.
    BrokerCommand {
        /// Topic name.
        topic: String,
    },
    /// Broker query on the given topic.
    BrokerQuery {
        /// Topic name.
        topic: String,
    },
    /// Broker event on the given topic.
    BrokerEvent {
        /// Topic name.
        topic: String,
    },
    /// REST command endpoint.
    RestCommand {
        /// HTTP path.
        path: String,
        /// HTTP method.
        method: String,
    },
    /// REST query endpoint.
    RestQuery {
        /// HTTP path.
        path: String,
        /// HTTP method.
        method: String,
    },
    /// Periodic invocation on a cron-style schedule.
    PeriodicEvent {
        /// Schedule expression.
        schedule: String,
    },
}

impl RouteTarget {
    /// The kind this target belongs to.
    #[must_use]
    pub const fn kind(&self) -> EnrouteKind {
        match self {
            Self::BrokerCommand { .. } | Self::RestCommand { .. } => EnrouteKind::Command,
            Self::BrokerQuery { .. } | Self::RestQuery { .. } => EnrouteKind::Query,
            Self::BrokerEvent { .. } | Self::PeriodicEvent { .. } => EnrouteKind::Event,
        }
    }
}

/// Normalized asynchronous callback signature shared by every route.
pub type Callback =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, HandlerError>> + Send + Sync>;

/// Wrap an asynchronous handler into the normalized [`Callback`] signature.
pub fn handler<F, Fut>(f: F) -> Callback
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    Arc::new(move |request| -> BoxFuture<'static, Result<Response, HandlerError>> {
        Box::pin(f(request))
    })
}

/// Wrap a synchronous handler into the normalized [`Callback`] signature.
pub fn handler_sync<F>(f: F) -> Callback
where
    F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    Arc::new(move |request| -> BoxFuture<'static, Result<Response, HandlerError>> {
        let result = f(request);
        Box::pin(async move { result })
    })
}

/// One route declaration: a method name, a target and the callback.
#[derive(Clone)]
pub struct RouteDef {
    /// Name of the annotated method. Routes sharing a name must share a kind.
    pub name: String,
    /// Attachment point of the route.
    pub target: RouteTarget,
    /// Normalized callback.
    pub callback: Callback,
}

impl RouteDef {
    /// Create a route definition.
    pub fn new(name: impl Into<String>, target: RouteTarget, callback: Callback) -> Self {
        Self {
            name: name.into(),
            target,
            callback,
        }
    }
}

/// A user service contributing routes to the registry.
pub trait EnrouteService: Send + Sync {
    /// Service name, used in diagnostics.
    fn name(&self) -> &str;

    /// The routes this service declares.
    fn routes(&self) -> Vec<RouteDef>;
}

/// A broker route: the kind it was declared with and its callback.
#[derive(Clone)]
pub struct BrokerRoute {
    /// Declared kind of the route.
    pub kind: EnrouteKind,
    /// Normalized callback.
    pub callback: Callback,
}

/// A periodic route: schedule expression and callback.
#[derive(Clone)]
pub struct PeriodicRoute {
    /// Schedule expression.
    pub schedule: String,
    /// Normalized callback.
    pub callback: Callback,
}

/// Immutable process-wide route map, computed once at startup.
#[derive(Clone, Default)]
pub struct EnrouteRegistry {
    broker: BTreeMap<String, BrokerRoute>,
    rest: BTreeMap<(String, String), Callback>,
    periodic: Vec<PeriodicRoute>,
}

impl EnrouteRegistry {
    /// Walk the given services and build the registry.
    ///
    /// # Errors
    ///
    /// Returns [`EnrouteError::ConflictingKinds`] if one method declares
    /// routes of different kinds, [`EnrouteError::DuplicateTopic`] if a topic
    /// is bound twice, or [`EnrouteError::DuplicateRoute`] for a REST route
    /// bound twice.
    pub fn build(services: &[Arc<dyn EnrouteService>]) -> Result<Self, EnrouteError> {
        let mut registry = Self::default();

        for service in services {
            let mut method_kinds: HashMap<String, EnrouteKind> = HashMap::new();

            for route in service.routes() {
                let kind = route.target.kind();
                if let Some(previous) = method_kinds.insert(route.name.clone(), kind) {
                    if previous != kind {
                        return Err(EnrouteError::ConflictingKinds {
                            service: service.name().to_string(),
                            method: route.name,
                        });
                    }
                }

                match route.target {
                    RouteTarget::BrokerCommand { topic }
                    | RouteTarget::BrokerQuery { topic }
                    | RouteTarget::BrokerEvent { topic } => {
                        if registry.broker.contains_key(&topic) {
                            return Err(EnrouteError::DuplicateTopic(topic));
                        }
                        registry.broker.insert(
                            topic,
                            BrokerRoute {
                                kind,
                                callback: route.callback,
                            },
                        );
                    }
                    RouteTarget::RestCommand { path, method }
                    | RouteTarget::RestQuery { path, method } => {
                        let key = (path, method);
                        if registry.rest.contains_key(&key) {
                            return Err(EnrouteError::DuplicateRoute {
                                path: key.0,
                                method: key.1,
                            });
                        }
                        registry.rest.insert(key, route.callback);
                    }
                    RouteTarget::PeriodicEvent { schedule } => {
                        registry.periodic.push(PeriodicRoute {
                            schedule,
                            callback: route.callback,
                        });
                    }
                }
            }
        }

        Ok(registry)
    }

    /// Broker topics declared with the given kind.
    #[must_use]
    pub fn topics_for_kind(&self, kind: EnrouteKind) -> BTreeSet<String> {
        self.broker
            .iter()
            .filter(|(_, route)| route.kind == kind)
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// The union of all broker topics.
    #[must_use]
    pub fn topics(&self) -> BTreeSet<String> {
        self.broker.keys().cloned().collect()
    }

    /// Look up the broker route for a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EnrouteError::ActionNotFound`] if no callback is registered.
    pub fn callback_for_topic(&self, topic: &str) -> Result<&BrokerRoute, EnrouteError> {
        self.broker
            .get(topic)
            .ok_or_else(|| EnrouteError::ActionNotFound(topic.to_string()))
    }

    /// Look up a REST callback by path and method.
    #[must_use]
    pub fn rest_route(&self, path: &str, method: &str) -> Option<&Callback> {
        self.rest
            .get(&(path.to_string(), method.to_string()))
    }

    /// All periodic routes.
    #[must_use]
    pub fn periodic_routes(&self) -> &[PeriodicRoute] {
        &self.periodic
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct FakeService {
        routes: Vec<RouteDef>,
    }

    impl EnrouteService for FakeService {
        fn name(&self) -> &str {
            "fake"
        }

        fn routes(&self) -> Vec<RouteDef> {
            self.routes.clone()
        }
    }

    fn ok_callback() -> Callback {
        handler_sync(|_| Ok(Response::from_bytes(b"ok".to_vec())))
    }

    fn build(routes: Vec<RouteDef>) -> Result<EnrouteRegistry, EnrouteError> {
        let service: Arc<dyn EnrouteService> = Arc::new(FakeService { routes });
        EnrouteRegistry::build(&[service])
    }

    #[test]
    fn collects_topics_by_kind() {
        let registry = build(vec![
            RouteDef::new(
                "add",
                RouteTarget::BrokerCommand { topic: "AddOrder".into() },
                ok_callback(),
            ),
            RouteDef::new(
                "get",
                RouteTarget::BrokerQuery { topic: "GetOrder".into() },
                ok_callback(),
            ),
            RouteDef::new(
                "on_added",
                RouteTarget::BrokerEvent { topic: "OrderAdded".into() },
                ok_callback(),
            ),
        ])
        .unwrap();

        assert_eq!(
            registry.topics_for_kind(EnrouteKind::Command),
            BTreeSet::from(["AddOrder".to_string()])
        );
        assert_eq!(
            registry.topics_for_kind(EnrouteKind::Event),
            BTreeSet::from(["OrderAdded".to_string()])
        );
        assert_eq!(registry.topics().len(), 3);
    }

    #[test]
    fn rejects_duplicate_topic() {
        let result = build(vec![
            RouteDef::new(
                "add",
                RouteTarget::BrokerCommand { topic: "AddOrder".into() },
                ok_callback(),
            ),
            RouteDef::new(
                "add_again",
                RouteTarget::BrokerCommand { topic: "AddOrder".into() },
                ok_callback(),
            ),
        ]);

        assert_eq!(result.err(), Some(EnrouteError::DuplicateTopic("AddOrder".into())));
    }

    #[test]
    fn rejects_mixed_kinds_on_one_method() {
        let result = build(vec![
            RouteDef::new(
                "add",
                RouteTarget::BrokerCommand { topic: "AddOrder".into() },
                ok_callback(),
            ),
            RouteDef::new(
                "add",
                RouteTarget::BrokerEvent { topic: "OrderAdded".into() },
                ok_callback(),
            ),
        ]);

        assert!(matches!(result, Err(EnrouteError::ConflictingKinds { .. })));
    }

    #[test]
    fn allows_same_kind_on_one_method() {
        let result = build(vec![
            RouteDef::new(
                "add",
                RouteTarget::BrokerCommand { topic: "AddOrder".into() },
                ok_callback(),
            ),
            RouteDef::new(
                "add",
                RouteTarget::RestCommand { path: "/order".into(), method: "POST".into() },
                ok_callback(),
            ),
        ]);

        assert!(result.is_ok());
    }

    #[test]
    fn unknown_topic_is_action_not_found() {
        let registry = build(vec![]).unwrap();
        assert_eq!(
            registry.callback_for_topic("Missing").err(),
            Some(EnrouteError::ActionNotFound("Missing".into()))
        );
    }

    #[tokio::test]
    async fn sync_handler_is_normalized() {
        use crate::message::{BrokerMessage, Trace, TraceStep};
        use uuid::Uuid;

        let registry = build(vec![RouteDef::new(
            "add",
            RouteTarget::BrokerCommand { topic: "AddOrder".into() },
            ok_callback(),
        )])
        .unwrap();

        let trace = Trace::origin(TraceStep::new(Uuid::new_v4(), "test"));
        let request = Request::new(BrokerMessage::new("AddOrder", vec![], trace));
        let route = registry.callback_for_topic("AddOrder").unwrap();
        let response = (route.callback)(request).await.unwrap();
        assert_eq!(response.content(), b"ok");
    }
}
