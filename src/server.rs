//! Axum setup, router configuration and graceful shutdown

use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use sqlx_sqlite_toolkit::DataAccess;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerArgs;
use crate::routes;
use crate::users::UserStore;

/// Shared by every handler. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct AppState {
   pub db: DataAccess,
   pub users: UserStore,
}

impl AppState {
   /// Wrap `db` and make sure the users schema exists.
   pub async fn new(db: DataAccess) -> anyhow::Result<Self> {
      let users = UserStore::init(db.clone())
         .await
         .context("failed to create users schema")?;
      Ok(Self { db, users })
   }
}

/// Run the server until Ctrl+C or SIGTERM, then close the pool.
pub async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
   let policy = args.retry_policy()?;
   let db = DataAccess::open(&args.db_path, args.pool_config(), policy)
      .await
      .with_context(|| format!("failed to open database at {}", args.db_path.display()))?
      .with_slow_query_threshold(args.slow_query_threshold());

   let state = AppState::new(db.clone()).await?;
   let app = create_router(state, Duration::from_secs(args.request_timeout));

   let addr = args.socket_addr()?;
   let listener = TcpListener::bind(addr)
      .await
      .with_context(|| format!("failed to bind {addr}"))?;

   info!(
      %addr,
      db_path = %args.db_path.display(),
      max_connections = args.max_connections,
      journal_mode = ?args.journal_mode,
      "Starting sqlite-gateway"
   );

   let served = axum::serve(listener, app)
      .with_graceful_shutdown(shutdown_signal())
      .await;

   db.close().await;
   served.context("server error")?;

   info!("Server shutdown complete");
   Ok(())
}

/// Build the router with all routes.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
   let middleware = ServiceBuilder::new()
      .layer(TraceLayer::new_for_http())
      .layer(TimeoutLayer::new(request_timeout));

   Router::new()
      // Health and stats
      .route("/health", get(routes::health_check))
      .route("/pool-stats", get(routes::pool_stats))
      .route("/stats", get(routes::user_stats))
      // Users
      .route("/users", get(routes::list_users).post(routes::create_user))
      .route("/users/bulk", post(routes::bulk_create_users))
      .route(
         "/users/{id}",
         get(routes::get_user)
            .put(routes::update_user)
            .delete(routes::delete_user),
      )
      // Ad-hoc SQL
      .route("/query", post(routes::run_query))
      .route("/execute", post(routes::execute_statement))
      .route("/transaction", post(routes::run_transaction))
      // Statements checked against the endpoint's kind
      .route("/select", post(routes::run_select))
      .route("/insert", post(routes::run_insert))
      .route("/update", post(routes::run_update))
      .route("/batch-insert", post(routes::batch_insert))
      .route("/batch-update", post(routes::batch_update))
      .with_state(state)
      .layer(middleware)
}

async fn shutdown_signal() {
   let ctrl_c = async {
      if let Err(e) = signal::ctrl_c().await {
         warn!(error = %e, "Failed to listen for Ctrl+C");
         std::future::pending::<()>().await;
      }
   };

   #[cfg(unix)]
   let terminate = async {
      match signal::unix::signal(signal::unix::SignalKind::terminate()) {
         Ok(mut term) => {
            term.recv().await;
         }
         Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
         }
      }
   };

   #[cfg(not(unix))]
   let terminate = std::future::pending::<()>();

   tokio::select! {
      _ = ctrl_c => {
         warn!("Received Ctrl+C, initiating graceful shutdown...");
      }
      _ = terminate => {
         warn!("Received SIGTERM, initiating graceful shutdown...");
      }
   }
}
