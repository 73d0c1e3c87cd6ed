use actix_web::{
    error,
    http::header::ContentType,
    middleware::Logger,
    route,
    web::{Data, Json, Path},
    App, HttpResponse, HttpServer, Responder, Result,
};
use agenda::calendar::ics::IcsFeedFetcher;
use agenda::calendar::DayResolver;
use agenda::commands::{Commands, DayQuery};
use agenda::metrics::Metrics;
use agenda::scheduler::Scheduler;
use agenda::sink::WebhookSink;
use agenda::subscriptions::{ChannelId, JsonFileStore, Subscriptions};
use agenda::AppConfig;
use clap::Parser;
use dotenv::dotenv;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration directory
    #[arg(long, value_name = "DIR", env = "CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Serve commands without sending daily digests
    #[arg(long, env = "NO_SCHEDULER")]
    no_scheduler: bool,
}

#[derive(Deserialize)]
struct UrlRequest {
    url: String,
    role: Option<String>,
}

/// Maps library errors to HTTP errors. Only user errors are exposed to the client.
fn http_error(err: agenda::Error) -> error::Error {
    match err {
        agenda::Error::InvalidUrl(_)
        | agenda::Error::UnknownRole(_)
        | agenda::Error::InvalidDay(_)
        | agenda::Error::InvalidChannelId(_) => error::ErrorBadRequest(err.to_string()),
        agenda::Error::DuplicateRecord { .. } => error::ErrorConflict(err.to_string()),
        agenda::Error::NoSubscriptions(_) => error::ErrorNotFound(err.to_string()),
        err => {
            log::error!("{err}");
            error::ErrorInternalServerError("internal error")
        }
    }
}

fn channel_id(path: &str) -> Result<ChannelId> {
    path.parse().map_err(http_error)
}

#[route("/channels/{channel}/urls", method = "POST")]
async fn register_url(
    commands: Data<Commands>,
    channel: Path<String>,
    req: Json<UrlRequest>,
) -> Result<impl Responder> {
    let channel = channel_id(&channel)?;
    let record = commands
        .register_url(channel, &req.url, req.role.as_deref())
        .await
        .map_err(http_error)?;

    Ok(HttpResponse::Created().json(record))
}

#[route("/channels/{channel}/urls", method = "DELETE")]
async fn delete_url(
    commands: Data<Commands>,
    channel: Path<String>,
    req: Json<UrlRequest>,
) -> Result<impl Responder> {
    let channel = channel_id(&channel)?;
    let removed = commands
        .delete_url(channel, &req.url, req.role.as_deref())
        .await
        .map_err(http_error)?;

    Ok(HttpResponse::Ok().json(json!({ "removed": removed })))
}

#[route("/channels/{channel}/urls", method = "GET", method = "HEAD")]
async fn list_registrations(
    commands: Data<Commands>,
    channel: Path<String>,
) -> Result<impl Responder> {
    let channel = channel_id(&channel)?;
    let records = commands.list_registrations(channel).await;

    Ok(HttpResponse::Ok().json(records))
}

#[route("/channels/{channel}/days/{day}", method = "GET", method = "HEAD")]
async fn query_day(
    commands: Data<Commands>,
    path: Path<(String, String)>,
) -> Result<impl Responder> {
    let (channel, day) = path.into_inner();
    let channel = channel_id(&channel)?;
    let reply = commands
        .query_day(channel, &DayQuery::parse(Some(&day)))
        .await
        .map_err(http_error)?;

    Ok(HttpResponse::Ok().json(reply))
}

#[route("/metrics", method = "GET")]
async fn export_metrics(registry: Data<Registry>) -> Result<impl Responder> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|err| {
            log::error!("failed to encode metrics: {err}");
            error::ErrorInternalServerError("metrics error")
        })?;

    Ok(HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(buffer))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config_dir)?;

    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new()?);
    metrics.register(&registry)?;

    log::info!("opening subscription store {}", config.store.path.display());

    let subscriptions = Subscriptions::open(JsonFileStore::new(&config.store.path))
        .await?
        .with_metrics(metrics.clone());
    let subscriptions = Arc::new(subscriptions);

    let timezone = config.scheduler.timezone;
    let fetcher = IcsFeedFetcher::new(&config.feeds, timezone)?;
    let resolver =
        DayResolver::new(subscriptions.clone(), fetcher, timezone).with_metrics(metrics.clone());

    let scheduler = if config.scheduler.enabled && !cli.no_scheduler {
        let sink = WebhookSink::new(&config.destinations)?;

        log::info!(
            "sending daily digests at {} ({})",
            config.scheduler.run_at,
            timezone
        );

        let scheduler = Scheduler::new(
            subscriptions.clone(),
            resolver.clone(),
            sink,
            config.scheduler.run_at,
        )
        .with_metrics(metrics.clone());

        Some(scheduler.spawn())
    } else {
        log::info!("scheduler is disabled, no digests will be sent");
        None
    };

    let commands = Data::new(Commands::new(subscriptions, resolver));
    let registry = Data::new(registry);

    log::info!("starting HTTP server at {}", config.server.listen_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(commands.clone())
            .app_data(registry.clone())
            .service(register_url)
            .service(delete_url)
            .service(list_registrations)
            .service(query_day)
            .service(export_metrics)
            // Don't log things that could identify the user, e.g. omit client IP, referrer and
            // user agent.
            .wrap(Logger::new(r#""%r" %s %b %T"#))
    })
    .workers(2)
    .bind(config.server.listen_addr)?
    .run()
    .await?;

    if let Some(handle) = scheduler {
        log::info!("stopping scheduler");
        handle.stop().await?;
    }

    Ok(())
}
