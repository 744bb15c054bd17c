use actix_web::{middleware, web, App, HttpServer};
use actix_cors::Cors;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::env;

use matchmail::api;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to create pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let bind = env::var("API_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    tracing::info!(%bind, "matchmail admin API starting");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(
                &env::var("ADMIN_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string()),
            )
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![
                actix_web::http::header::CONTENT_TYPE,
                actix_web::http::header::ACCEPT,
            ])
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(pool.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .service(
                web::scope("/api")
                    .configure(api::batches::configure)
                    .configure(api::system::configure),
            )
            .route("/health", web::get().to(|| async { "OK" }))
    })
    .bind(bind)?
    .run()
    .await
}
