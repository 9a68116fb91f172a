use anyhow::Result;
use clap::Parser;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mysql_dba_operator::cluster::KubeCluster;
use mysql_dba_operator::config::{OperatorConfig, PasswordPolicy};
use mysql_dba_operator::controllers::{
    admin_connection::AdminConnectionController, database::DatabaseController, user::UserController, Context,
};
use mysql_dba_operator::session::mysql::MySqlConnector;

#[derive(Parser)]
#[command(name = "mysql-dba-operator")]
#[command(about = "Kubernetes operator provisioning MySQL databases, users and grants")]
struct Args {
    /// Kubernetes namespace to watch (empty = all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Health endpoint bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable development mode (more verbose logging)
    #[arg(long, env = "DEV_MODE")]
    dev_mode: bool,

    /// Timeout for each connect, ping and SQL statement
    #[arg(long, env = "SQL_TIMEOUT_SECS", default_value_t = 10)]
    sql_timeout_secs: u64,

    /// Requeue interval after a successful reconcile
    #[arg(long, env = "RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Requeue interval after a failed reconcile
    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value_t = 60)]
    error_requeue_secs: u64,

    /// Length of generated passwords
    #[arg(long, env = "PASSWORD_LENGTH", default_value_t = 16)]
    password_length: usize,

    #[arg(long, env = "PASSWORD_MIN_SPECIAL", default_value_t = 1)]
    password_min_special: usize,

    #[arg(long, env = "PASSWORD_MIN_NUMERIC", default_value_t = 1)]
    password_min_numeric: usize,

    #[arg(long, env = "PASSWORD_MIN_UPPER", default_value_t = 1)]
    password_min_upper: usize,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            sql_timeout: Duration::from_secs(self.sql_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            password_policy: PasswordPolicy {
                length: self.password_length,
                min_special: self.password_min_special,
                min_numeric: self.password_min_numeric,
                min_upper: self.password_min_upper,
            },
            ..OperatorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(args.dev_mode)
                .with_level(true)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .init();

    info!("Starting MySQL DBA operator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Watch namespace: {:?}", args.namespace);
    info!("Health address: {}", args.health_addr);

    let config = args.operator_config();

    let client = Client::try_default().await?;
    info!("Kubernetes client initialized");

    let context = Arc::new(Context::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(MySqlConnector::new(config.sql_timeout)),
        config,
    ));

    let health_server = start_health_server(args.health_addr.clone());

    info!("Starting controllers...");

    let admin_controller = AdminConnectionController::new(client.clone(), context.clone(), args.namespace.clone());
    let database_controller = DatabaseController::new(client.clone(), context.clone(), args.namespace.clone());
    let user_controller = UserController::new(client, context, args.namespace.clone());

    let admin_task = tokio::spawn(async move {
        admin_controller.run().await;
    });

    let database_task = tokio::spawn(async move {
        database_controller.run().await;
    });

    let user_task = tokio::spawn(async move {
        user_controller.run().await;
    });

    info!("All controllers started successfully");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = admin_task => {
            warn!("AdminConnection controller exited unexpectedly");
        }
        _ = database_task => {
            warn!("Database controller exited unexpectedly");
        }
        _ = user_task => {
            warn!("DatabaseUser controller exited unexpectedly");
        }
        result = health_server => {
            if let Err(e) = result {
                error!("Health server failed: {}", e);
            }
            warn!("Health server exited unexpectedly");
        }
    }

    info!("MySQL DBA operator shutdown complete");
    Ok(())
}

async fn start_health_server(addr: String) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    fn json(status: StatusCode, body: &'static str) -> Response<Body> {
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        response
    }

    async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(match req.uri().path() {
            "/healthz" => json(StatusCode::OK, r#"{"status":"healthy"}"#),
            "/readyz" => json(StatusCode::OK, r#"{"status":"ready"}"#),
            _ => json(StatusCode::NOT_FOUND, r#"{"status":"not found"}"#),
        })
    }

    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let addr: SocketAddr = addr.parse()?;
    let server = Server::bind(&addr).serve(make_svc);

    info!("Health server listening on {}", addr);

    server.await?;
    Ok(())
}
