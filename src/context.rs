//! # Shared services handed to every engine and slave.
//!
//! [`Context`] bundles the external collaborators the core consumes:
//! - isolation backend factories, keyed by `profile.isolate.type`;
//! - an [`Auth`] provider for worker tokens (Preparation state);
//! - a [`Locator`] resolving endpoints passed to new workers (Spawning state);
//! - a [`CrashlogStore`] for crash artifacts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::crashlog::{CrashlogStore, NullStore};
use crate::error::ErrorCode;
use crate::isolate::{Isolate, IsolateFactory};
use crate::profile::IsolateSpec;

/// Authentication token handed to a worker through its environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Token {
    /// Token type (e.g. `Bearer`); empty for anonymous.
    pub kind: String,
    /// Token body.
    pub body: String,
}

/// Issues worker tokens.
#[async_trait]
pub trait Auth: Send + Sync + 'static {
    async fn token(&self) -> Result<Token, ErrorCode>;
}

/// Auth provider issuing empty tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait]
impl Auth for Anonymous {
    async fn token(&self) -> Result<Token, ErrorCode> {
        Ok(Token::default())
    }
}

/// Resolves the locator endpoints passed to new workers.
pub trait Locator: Send + Sync + 'static {
    fn endpoints(&self) -> anyhow::Result<Vec<String>>;
}

/// Locator with a fixed endpoint list.
#[derive(Debug, Clone, Default)]
pub struct StaticLocator(pub Vec<String>);

impl Locator for StaticLocator {
    fn endpoints(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Cloneable bundle of collaborators.
#[derive(Clone)]
pub struct Context {
    isolates: Arc<RwLock<HashMap<String, Arc<dyn IsolateFactory>>>>,
    auth: Arc<dyn Auth>,
    locator: Option<Arc<dyn Locator>>,
    crashlogs: Arc<dyn CrashlogStore>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Empty context: no isolates, anonymous auth, no locator, crash logs dropped.
    pub fn new() -> Self {
        Self {
            isolates: Arc::new(RwLock::new(HashMap::new())),
            auth: Arc::new(Anonymous),
            locator: None,
            crashlogs: Arc::new(NullStore),
        }
    }

    /// Registers an isolation backend under `kind`.
    pub fn with_isolate(self, kind: impl Into<String>, factory: Arc<dyn IsolateFactory>) -> Self {
        self.isolates.write().insert(kind.into(), factory);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn Auth>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_crashlogs(mut self, store: Arc<dyn CrashlogStore>) -> Self {
        self.crashlogs = store;
        self
    }

    /// Builds the isolate selected by `spec` for application `app`.
    pub fn isolate(&self, app: &str, spec: &IsolateSpec) -> Result<Arc<dyn Isolate>, ErrorCode> {
        let factory = self.isolates.read().get(&spec.kind).cloned();
        match factory {
            Some(factory) => factory.create(app, &spec.args),
            None => Err(ErrorCode::Isolate {
                reason: format!("unknown isolate type '{}'", spec.kind),
            }),
        }
    }

    pub fn auth(&self) -> Arc<dyn Auth> {
        Arc::clone(&self.auth)
    }

    /// Resolves locator endpoints for a new worker.
    pub fn locate(&self) -> Result<Vec<String>, ErrorCode> {
        let Some(locator) = &self.locator else {
            return Err(ErrorCode::LocatorNotFound);
        };
        let endpoints = locator.endpoints().map_err(|err| {
            tracing::warn!(error = %err, "locator failed to resolve endpoints");
            ErrorCode::LocatorNotFound
        })?;
        if endpoints.is_empty() {
            return Err(ErrorCode::EmptyLocatorEndpoints);
        }
        Ok(endpoints)
    }

    pub fn crashlogs(&self) -> Arc<dyn CrashlogStore> {
        Arc::clone(&self.crashlogs)
    }
}
