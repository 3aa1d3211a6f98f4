use actix_cors::Cors;
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

use importers::contact_csv::{FieldMapper, FieldSynonyms, NormalizeWorkerPool};
use rolodex_api::jobs::import_manager::{ImportManager, ImportSettings};
use rolodex_api::storage::SqliteImportStore;
use rolodex_api::{config, handlers, helpers, Database};

#[get("/health")]
async fn health(db: web::Data<Arc<Database>>) -> impl Responder {
    match db.async_connection.lock().await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "database": "connected"
        })),
        Err(e) => {
            tracing::warn!("Health check could not reach the database: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "status": "unhealthy",
                "database": "disconnected"
            }))
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long)]
    log_file_path: Option<String>,

    /// Config file to use instead of the per-user default
    #[arg(long)]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if let Some(log_path) = args.log_file_path {
        let log_path = std::path::Path::new(&log_path);
        let file_appender = tracing_appender::rolling::never(
            log_path.parent().unwrap_or(std::path::Path::new(".")),
            log_path
                .file_name()
                .unwrap_or(std::ffi::OsStr::new("rolodex-api.log")),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        std::mem::forget(guard);

        tracing_subscriber::registry()
            .with(env_filter.clone())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(true)
                    .with_writer(std::io::stdout),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let (config, config_path) =
        config::ApiConfig::load(args.config.as_deref()).expect("Failed to load config");
    tracing::info!("Config loaded from {:?}", config_path);

    let database_path = config.database_path();
    let (db, db_path) = helpers::database::initialize_database(database_path.as_deref())
        .expect("Failed to initialize database");
    tracing::info!("Database initialized at {:?}", db_path);

    let import_config = config.import_settings();
    let synonyms = FieldSynonyms::with_additions(&config.field_synonyms())
        .expect("Invalid field_synonyms in config");
    let workers = NormalizeWorkerPool::new(import_config.worker_threads)
        .expect("Failed to start normalization workers");
    tracing::info!("Normalizing rows on {} thread(s)", workers.threads());

    let import_manager = Arc::new(ImportManager::new(
        Arc::new(SqliteImportStore::new(db.async_connection.clone())),
        FieldMapper::new(synonyms),
        workers,
        ImportSettings::from(&import_config),
    ));

    if let Err(e) = import_manager.restore_interrupted_jobs().await {
        tracing::warn!("Failed to restore interrupted import jobs: {}", e);
    }

    let (host, port) = if let Some(server_config) = &config.server {
        (server_config.host.clone(), server_config.port)
    } else {
        ("127.0.0.1".to_string(), 8080)
    };
    let max_upload = import_config.max_file_size_bytes as usize;

    tracing::info!("Starting server on {}:{}", host, port);

    let manager_for_server = import_manager.clone();
    let server = HttpServer::new(move || {
        let cors = if let Some(cors_config) = &config.cors {
            let mut cors_builder = Cors::default();
            for origin in &cors_config.allowed_origins {
                cors_builder = cors_builder.allowed_origin(origin);
            }
            cors_builder
                .allowed_methods(vec!["GET", "POST", "PUT", "OPTIONS"])
                .allowed_headers(vec!["Accept", "Content-Type"])
                .max_age(3600)
        } else {
            Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "POST", "PUT", "OPTIONS"])
                .allowed_headers(vec!["Accept", "Content-Type"])
                .max_age(3600)
        };

        App::new()
            .wrap(cors)
            // the manager rejects oversized files with a JSON error; this only caps the read
            .app_data(web::PayloadConfig::new(max_upload.saturating_add(1)))
            .app_data(web::Data::new(db.clone()))
            .app_data(web::Data::new(manager_for_server.clone()))
            .service(health)
            .route("/api/imports", web::post().to(handlers::imports::upload_import))
            .route("/api/imports", web::get().to(handlers::imports::list_imports))
            .route("/api/imports/{id}", web::get().to(handlers::imports::get_import))
            .route("/api/imports/{id}/mapping", web::get().to(handlers::imports::get_mapping))
            .route("/api/imports/{id}/mapping", web::put().to(handlers::imports::update_mapping))
            .route("/api/imports/{id}/start", web::post().to(handlers::imports::start_import))
            .route("/api/imports/{id}/cancel", web::post().to(handlers::imports::cancel_import))
            .route("/api/imports/{id}/rows", web::get().to(handlers::imports::list_import_rows))
            .route("/api/check-duplicates", web::post().to(handlers::imports::check_duplicates))
            .route("/api/contacts", web::get().to(handlers::contacts::list_contacts))
            .route("/api/contacts/{id}", web::get().to(handlers::contacts::get_contact))
    })
    .bind((host.as_str(), port))?
    .run();

    let handle = server.handle();
    let shutdown_manager = import_manager.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }

        tracing::info!("Ctrl+C received, shutting down...");
        if let Err(e) = shutdown_manager.shutdown().await {
            tracing::warn!("Failed to shutdown import manager cleanly: {}", e);
        }

        handle.stop(true).await;
    });

    server.await
}
