use std::{convert::Infallible, future::IntoFuture, process};

use futures::future::try_join_all;
use serde::Serialize;
use serde_json::{Value, json};
use storefront_query::{
    cache::{
        CacheConfig, FetchFn, FetchPolicy, QueryClient, QueryFilter, QueryKey, QueryOptions,
        Window,
    },
    config::{self, InspectArgs, LogFormat, Settings},
    error::AppError,
    infra::{snapshot, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Config(config::ConfigArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Inspect(args) => run_inspect(settings, *args).await,
        config::Command::Config(_) => run_config(&settings),
    }
}

async fn run_inspect(settings: Settings, args: InspectArgs) -> Result<(), AppError> {
    let invalidations = args
        .invalidate
        .iter()
        .map(|raw| {
            serde_json::from_str::<QueryKey>(raw)
                .map_err(|err| AppError::validation(format!("invalid key `{raw}`: {err}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let snapshot = snapshot::load(&args.snapshot).await?;
    let client: QueryClient<Value> = QueryClient::new(CacheConfig::from(&settings.query));

    let mut loads = Vec::with_capacity(snapshot.entries.len());
    for entry in snapshot.entries {
        let value = entry.value;
        let fetch_fn = FetchFn::new(move || {
            let value = value.clone();
            async move { Ok::<_, Infallible>(value) }
        });
        loads.push(client.fetch(
            entry.key,
            Some(fetch_fn),
            QueryOptions::new(),
            FetchPolicy::Force,
        )?);
    }
    let loaded = try_join_all(loads.into_iter().map(IntoFuture::into_future))
        .await?
        .len();
    info!(loaded, snapshot = %args.snapshot.display(), "Loaded catalog snapshot");

    for key in invalidations {
        client.invalidate(QueryFilter::prefix(key)).await;
    }

    print_json(&client.inspect_all())
}

fn run_config(settings: &Settings) -> Result<(), AppError> {
    let format = match settings.logging.format {
        LogFormat::Json => "json",
        LogFormat::Compact => "compact",
    };
    print_json(&json!({
        "logging": {
            "level": settings.logging.level.to_string(),
            "format": format,
        },
        "query": {
            "stale_time_ms": window_json(settings.query.stale_time),
            "gc_time_ms": window_json(settings.query.gc_time),
            "retry_count": settings.query.retry_count,
        },
    }))
}

fn window_json(window: Window) -> Value {
    match window.as_duration() {
        Some(duration) => json!(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
        None => json!("infinite"),
    }
}

fn print_json(value: &impl Serialize) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
