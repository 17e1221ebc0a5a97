//! HTTP server — wiring, routing, and lifecycle.

mod middleware;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use middleware::auth_middleware;

use crate::auth::{CredentialResolver, LocalTokenValidator, RefreshOrchestrator, SessionCache};
use crate::config::{Config, GoogleConfig};
use crate::directory::{IdentityDirectory, InMemoryDirectory};
use crate::earthengine::EarthEngineClient;
use crate::google::{GoogleTokenClient, UpstreamAuthority};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Credential resolver, the auth entry point
    pub resolver: CredentialResolver,
    /// User and token store
    pub directory: Arc<dyn IdentityDirectory>,
    /// Session cache (exposed for health stats)
    pub cache: Arc<SessionCache>,
    /// Local token issuance for register/login
    pub validator: LocalTokenValidator,
    /// Google endpoints, used directly by the account-linking callback
    pub upstream: Arc<dyn UpstreamAuthority>,
    /// Google OAuth settings for building the consent redirect
    pub google: GoogleConfig,
    /// Downstream Earth Engine client
    pub earthengine: EarthEngineClient,
}

/// The gateway server
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a server from loaded configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Assemble collaborators, bind, and serve until ctrl-c.
    ///
    /// # Errors
    ///
    /// Configuration faults (bad bind address, missing JWT secret), an
    /// unreachable Earth Engine API, or a failed bind.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(self.build_state().await?);
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server shutdown complete");
        Ok(())
    }

    /// Wire the credential subsystem and downstream clients
    async fn build_state(&self) -> Result<AppState> {
        let secret = self.config.auth.resolve_jwt_secret()?;
        let validator = LocalTokenValidator::new(&secret, self.config.auth.token_lifetime());

        let directory: Arc<dyn IdentityDirectory> = Arc::new(InMemoryDirectory::new());
        let cache = Arc::new(SessionCache::new());
        let upstream: Arc<dyn UpstreamAuthority> =
            Arc::new(GoogleTokenClient::new(&self.config.google)?);

        let refresh = Arc::new(RefreshOrchestrator::new(
            Arc::clone(&upstream),
            Arc::clone(&directory),
            Arc::clone(&cache),
            self.config.auth.access_token_ttl(),
        ));

        let resolver = CredentialResolver::new(
            LocalTokenValidator::new(&secret, self.config.auth.token_lifetime()),
            Arc::clone(&directory),
            Arc::clone(&upstream),
            Arc::clone(&cache),
            refresh,
            self.config.auth.identity_ttl(),
            self.config.auth.access_token_ttl(),
        );

        let earthengine = EarthEngineClient::initialize(&self.config.earthengine).await?;

        Ok(AppState {
            resolver,
            directory,
            cache,
            validator,
            upstream,
            google: self.config.google.clone(),
            earthengine,
        })
    }
}

/// Create the router. Public routes first; protected routes sit behind the
/// auth middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/me", get(routes::me_handler))
        .route(
            "/api/earthengine/query",
            post(routes::earthengine_query_handler),
        )
        .route_layer(from_fn_with_state(Arc::clone(&state), auth_middleware));

    Router::new()
        .route("/health", get(routes::health_handler))
        .route("/auth/register", post(routes::register_handler))
        .route("/auth/login", post(routes::login_handler))
        .route("/auth/google", get(routes::google_auth_handler))
        .route("/auth/google/callback", get(routes::google_callback_handler))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve on ctrl-c (or SIGTERM where available)
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
