//! Session tracking and lifecycle for the control server.
//!
//! Every request is registered while it runs. On platforms that enforce a
//! single active user, a request from a second OS user is refused until the
//! first user's requests have all completed. When a different user becomes
//! active the backend is reset so no session state crosses users.
//!
//! Decisions are made under the session lock and acted on after it is
//! released; the server lock is always taken before any backend lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use lodestar_protocol::protocol::{Request, Response, status};
use lodestar_protocol::server::ConnectionHandler;
use lodestar_protocol::transport::{ConnInfo, Listener};

use crate::api;
use crate::backend::{Backend, StartOptions};
use crate::config::ServerConfig;
use crate::errors::{AccessDeniedError, IdentityError};
use crate::identity::{ConnIdentity, IdentityResolver, resolver_for};
use crate::permissions::{CertUidMatcher, PermissionInput, Permissions, compute_permissions};

pub type Result<T> = std::result::Result<T, lodestar_protocol::errors::ServerError>;

/// Identity resolved for a connection, shared by all of its requests.
pub type ConnContext = std::result::Result<Arc<ConnIdentity>, IdentityError>;

/// What to do after registering a request.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RegisterOutcome {
    /// Tell the backend this user is now active.
    pub activate_user: Option<String>,
    /// The active user changed; reset the backend.
    pub reset: bool,
}

/// What to do after a request completes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ReleaseOutcome {
    /// No requests are left in flight.
    pub idle: bool,
}

#[derive(Default)]
pub(crate) struct SessionState {
    last_user_id: String,
    active: HashMap<u64, Arc<ConnIdentity>>,
    next_id: u64,
}

impl SessionState {
    /// An active identity whose user differs from `user_id`.
    fn other_active_user(&self, user_id: &str) -> Option<&Arc<ConnIdentity>> {
        self.active.values().find(|active| active.user_id != user_id)
    }

    pub(crate) fn register(&mut self, identity: Arc<ConnIdentity>) -> (u64, RegisterOutcome) {
        let id = self.next_id;
        self.next_id += 1;

        let user_id = identity.user_id.clone();
        self.active.insert(id, identity);

        let mut outcome = RegisterOutcome::default();
        if !user_id.is_empty() && self.active.len() == 1 {
            if self.last_user_id != user_id {
                outcome.reset = !self.last_user_id.is_empty();
                self.last_user_id = user_id.clone();
            }
            outcome.activate_user = Some(user_id);
        }
        (id, outcome)
    }

    pub(crate) fn release(&mut self, id: u64) -> ReleaseOutcome {
        self.active.remove(&id);
        ReleaseOutcome {
            idle: self.active.is_empty(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }
}

/// A registered request. Dropping it deregisters the request.
pub struct ActiveRequest<'a> {
    server: &'a Server,
    id: u64,
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        let outcome = self.server.session.lock().release(self.id);
        if outcome.idle {
            self.server.on_idle();
        }
    }
}

/// Calls `Backend::shutdown` when `run` exits, however it exits.
struct ShutdownGuard<'a>(&'a Server);

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if let Some(backend) = self.0.backend() {
            backend.shutdown();
        }
    }
}

pub struct Server {
    config: ServerConfig,
    resolver: Box<dyn IdentityResolver>,
    cert_uid: CertUidMatcher,
    single_user: bool,
    reset_on_idle: bool,
    backend: OnceLock<Arc<dyn Backend>>,
    start_once: Once,
    run_called: AtomicBool,
    session: Mutex<SessionState>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let resolver = resolver_for(config.platform);
        Self::with_resolver(config, resolver)
    }

    /// Build a server that identifies connections with `resolver`.
    pub fn with_resolver(config: ServerConfig, resolver: Box<dyn IdentityResolver>) -> Self {
        let cert_uid = CertUidMatcher::from_config(config.permit_cert_uid.as_deref());
        Self {
            single_user: config.platform.enforces_single_user(),
            reset_on_idle: config.platform.reset_on_idle(),
            config,
            resolver,
            cert_uid,
            backend: OnceLock::new(),
            start_once: Once::new(),
            run_called: AtomicBool::new(false),
            session: Mutex::new(SessionState::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the backend. Starts it if `run` has already begun.
    ///
    /// # Panics
    /// If a backend is already bound.
    pub fn bind_backend(&self, backend: Arc<dyn Backend>) {
        if self.backend.set(backend).is_err() {
            panic!("backend already bound");
        }
        self.start_backend_if_needed();
    }

    pub fn backend(&self) -> Option<Arc<dyn Backend>> {
        self.backend.get().cloned()
    }

    /// The bound backend.
    ///
    /// # Panics
    /// If no backend has been bound yet.
    pub fn must_backend(&self) -> Arc<dyn Backend> {
        match self.backend.get() {
            Some(backend) => Arc::clone(backend),
            None => panic!("backend used before bind_backend was called"),
        }
    }

    fn start_backend_if_needed(&self) {
        if !self.run_called.load(Ordering::SeqCst) {
            return;
        }
        let Some(backend) = self.backend.get() else {
            return;
        };
        if backend.config_valid() {
            self.start_once.call_once(|| {
                info!("Starting backend");
                backend.start(StartOptions::default());
            });
        } else {
            info!("Backend configuration is not valid; not starting");
        }
    }

    /// Requests currently registered.
    pub fn active_request_count(&self) -> usize {
        self.session.lock().len()
    }

    fn check_identity_locked(
        &self,
        state: &SessionState,
        identity: &ConnIdentity,
        backend: &dyn Backend,
    ) -> std::result::Result<(), AccessDeniedError> {
        if self.single_user
            && let Some(active) = state.other_active_user(&identity.user_id)
        {
            return Err(AccessDeniedError::InUseByOtherUser {
                username: active.display_name(),
                pid: active.pid,
            });
        }
        backend
            .check_connection_allowed(identity)
            .map_err(|reason| AccessDeniedError::Rejected { reason })
    }

    /// Whether `identity` may use the server right now.
    pub fn check_identity(&self, identity: &ConnIdentity) -> std::result::Result<(), AccessDeniedError> {
        let backend = self.must_backend();
        let state = self.session.lock();
        self.check_identity_locked(&state, identity, backend.as_ref())
    }

    /// Register a request from `identity`.
    ///
    /// When this makes a different user active, the backend is told about
    /// the new user and reset before this returns.
    pub fn begin_request(
        &self,
        identity: Arc<ConnIdentity>,
    ) -> std::result::Result<ActiveRequest<'_>, AccessDeniedError> {
        let backend = self.must_backend();

        let (id, outcome) = {
            let mut state = self.session.lock();
            self.check_identity_locked(&state, &identity, backend.as_ref())?;
            state.register(identity)
        };

        // Guard first so an unwinding backend call still deregisters
        let active = ActiveRequest { server: self, id };

        if let Some(user_id) = &outcome.activate_user {
            backend.set_active_user(user_id);
        }
        if outcome.reset {
            info!("identity changed; resetting server");
            backend.reset_for_disconnect();
        }
        Ok(active)
    }

    fn on_idle(&self) {
        if !self.reset_on_idle {
            return;
        }
        let Some(backend) = self.backend() else {
            return;
        };
        if backend.is_persistent_server_mode() {
            info!("client disconnected; staying alive in server mode");
        } else {
            info!("client disconnected; resetting server");
            backend.reset_for_disconnect();
        }
    }

    /// Local API capabilities of `identity`.
    pub fn permissions(&self, identity: &ConnIdentity) -> Permissions {
        let platform = self.config.platform;
        let session_authorized = platform.uses_named_pipes() && self.check_identity(identity).is_ok();
        let operator_uid = self
            .must_backend()
            .operator_user_id()
            .or_else(|| self.config.operator_uid.clone());
        compute_permissions(&PermissionInput {
            platform,
            identity,
            operator_uid: operator_uid.as_deref(),
            cert_uid: &self.cert_uid,
            session_authorized,
        })
    }

    async fn serve(&self, ctx: Arc<ConnContext>, request: Request) -> Response {
        let Some(backend) = self.backend() else {
            return Response::error(status::SERVICE_UNAVAILABLE, "no backend");
        };

        let identity = match ctx.as_ref() {
            Ok(identity) => Arc::clone(identity),
            Err(e) => return Response::error(status::UNAUTHORIZED, e.to_string()),
        };

        let _active = match self.begin_request(Arc::clone(&identity)) {
            Ok(active) => active,
            Err(e) => {
                debug!("Refused request from {}: {}", identity.display_name(), e);
                return Response::error(status::UNAUTHORIZED, e.to_string());
            }
        };

        if let Some(route) = request.local_api_path() {
            let permissions = self.permissions(&identity);
            return api::handle_local_api(backend.as_ref(), &identity, permissions, &request, route);
        }

        if request.path != "/" {
            return Response::not_found();
        }
        api::status_page(self.config.platform, backend.as_ref())
    }

    /// Serve connections from `listener` until `cancel` fires.
    ///
    /// Starts the backend if one is bound and its configuration is valid.
    /// The backend is shut down when this returns.
    pub async fn run<L: Listener>(self: Arc<Self>, listener: L, cancel: CancellationToken) -> Result<()> {
        self.run_called.store(true, Ordering::SeqCst);
        let _shutdown = ShutdownGuard(&self);

        self.start_backend_if_needed();

        lodestar_protocol::server::Server::new(listener, Arc::clone(&self))
            .with_idle_timeout(self.config.idle_timeout)
            .run(cancel)
            .await
    }
}

impl ConnectionHandler for Server {
    type Context = ConnContext;

    fn on_connect(&self, conn: &dyn ConnInfo) -> ConnContext {
        match self.resolver.resolve(conn) {
            Ok(identity) => Ok(Arc::new(identity)),
            Err(e) => {
                debug!("Failed to identify {} connection: {}", conn.transport_kind(), e);
                Err(e)
            }
        }
    }

    async fn handle(&self, ctx: Arc<ConnContext>, request: Request, _cancel: CancellationToken) -> Response {
        self.serve(ctx, request).await
    }
}
