use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use bytes::Bytes;
use clap::Parser;
use relaykit_core::{
    config::Config, failure::FailureLevel, CancelableFuture, Entity, Expirator, ObjectCache,
};
use relaykit_services::{HttpTransport, RestApi, RestApiReply, TaskPool};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: Option<String>,
    /// HTTP method used for every path
    #[clap(short, long, default_value = "GET")]
    method: String,
    /// Request body for POST, PUT and PATCH
    #[clap(short, long)]
    body: Option<String>,
    /// Media-type vendor tag
    #[clap(long)]
    vendor: Option<String>,
    /// How long a reply stays cached after it was fetched
    #[clap(long, default_value_t = 60)]
    keep_alive_sec: u64,
    /// Paths to request, repeated paths are served from the cache
    #[clap(required = true)]
    paths: Vec<String>,
}

struct CachedReply {
    reply: RestApiReply,
}

impl Entity for CachedReply {}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let tasks = Arc::new(TaskPool::new(&config.tasks)?);
    let transport = Arc::new(HttpTransport::new(config.client.clone(), &config.runtime)?);
    let vendor = args.vendor.clone().or_else(|| config.client.vendor.clone());
    let api = RestApi::new(transport.clone(), tasks).with_vendor(vendor);
    tracing::info!(
        "talking to {}://{}:{}",
        config.client.scheme,
        config.client.host,
        config.client.port
    );
    if api.is_logged_out() {
        tracing::warn!("client credentials are incomplete, requests go out unsigned");
    }

    let expirator = Arc::new(Expirator::new(config.expirator.clone()));
    let cache: ObjectCache<String, CachedReply> = ObjectCache::weak()
        .with_expirator(expirator.clone(), Duration::from_secs(args.keep_alive_sec));

    let mut failed = 0;
    for path in &args.paths {
        if let Some(cached) = cache.get(path) {
            tracing::info!("{path} served from cache");
            print_reply(path, &cached.reply);
            continue;
        }

        let call = issue(&api, &args, path)?;
        match call.wait() {
            Ok(reply) => {
                let cached = cache.get_or_create(path, |_| Arc::new(CachedReply { reply }));
                print_reply(path, &cached.reply);
            }
            Err(failure) => {
                failed += 1;
                match failure.level {
                    FailureLevel::Warning => tracing::warn!("{path}: {failure}"),
                    _ => tracing::error!(
                        "{path}: {} (module {}, code {}, detail {:?})",
                        failure.display_message("request failed"),
                        failure.module_code,
                        failure.error_code,
                        failure.detail
                    ),
                }
            }
        }
    }

    tracing::info!("{} replies cached", cache.len());
    transport.shutdown();
    expirator.shutdown();
    if failed > 0 {
        bail!("{failed} of {} requests failed", args.paths.len());
    }
    Ok(())
}

fn issue(api: &RestApi, args: &Args, path: &str) -> Result<CancelableFuture<RestApiReply>> {
    let body = Bytes::from(args.body.clone().unwrap_or_default());
    let call = match args.method.to_ascii_uppercase().as_str() {
        "GET" => api.get(path, &[]),
        "DELETE" => api.delete(path, &[]),
        "POST" => api.post(path, &[], body),
        "PUT" => api.put(path, &[], body),
        "PATCH" => api.patch(path, &[], body),
        other => bail!("unsupported method {other}"),
    };
    Ok(call)
}

fn print_reply(path: &str, reply: &RestApiReply) {
    println!("{path}: {} {}", reply.status_code, reply.status_text);
    if !reply.body.is_empty() {
        println!("{}", String::from_utf8_lossy(&reply.body));
    }
}
