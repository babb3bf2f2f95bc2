use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use runboat_k8s_util::client::new_client_with_metrics;
use runboat_operator::config::ControllerConfig;
use runboat_operator::controller::{Controller, State};
use runboat_operator::metrics::Metrics;
use runboat_operator::telemetry;

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

#[get("/metrics")]
async fn metrics(state: Data<State>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(state.metrics_text())
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/api/status")]
async fn status(state: Data<State>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json(state.controller_status())
}

#[derive(Parser, Debug)]
#[command(
    name = "runboat-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    #[clap(flatten)]
    controller: ControllerConfig,

    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,runboat_operator=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let mut registry = Registry::with_prefix("runboat");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;
    let operator_metrics = std::sync::Arc::new(Metrics::new(registry));

    let controller = Controller::new(args.controller, client, operator_metrics);
    let state = controller.state();
    let cancel = CancellationToken::new();

    let controller_task = tokio::spawn(controller.run(cancel.clone()));

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
            .service(status)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5)
    .run();

    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    controller_task.await?;
    Ok(())
}
