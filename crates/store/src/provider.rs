use std::sync::Arc;

use concord_core::Route;

use crate::error::StoreError;
use crate::session::Session;
use crate::r#trait::DocumentStore;

/// Resolves a route (logical database / tenant) to a store handle.
///
/// Created once per process and passed to every component at construction.
pub trait StoreProvider: Send + Sync {
    fn open(&self, route: &Route) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

impl<P> StoreProvider for Arc<P>
where
    P: StoreProvider + ?Sized,
{
    fn open(&self, route: &Route) -> Result<Arc<dyn DocumentStore>, StoreError> {
        (**self).open(route)
    }
}

/// A provider bound to one route; the handle components actually hold.
#[derive(Clone)]
pub struct RoutedStore {
    provider: Arc<dyn StoreProvider>,
    route: Route,
}

impl std::fmt::Debug for RoutedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedStore")
            .field("route", &self.route)
            .finish()
    }
}

impl RoutedStore {
    pub fn new(provider: Arc<dyn StoreProvider>, route: Route) -> Self {
        Self { provider, route }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn provider(&self) -> &Arc<dyn StoreProvider> {
        &self.provider
    }

    /// Open a fresh unit of work against this route.
    pub fn session(&self) -> Result<Session, StoreError> {
        Ok(Session::new(self.provider.open(&self.route)?))
    }

    /// Same provider, different route.
    pub fn with_route(&self, route: Route) -> Self {
        Self {
            provider: self.provider.clone(),
            route,
        }
    }
}
