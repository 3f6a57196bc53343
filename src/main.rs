mod broadcaster;
mod dto;
mod poller;
mod store;
mod template;
mod util;
mod vendor;
mod web_interface;

use anyhow::Context;
use broadcaster::Broadcaster;
use poller::{Poller, PollerConfig};
use std::{env, process::exit, sync::Arc, time::Duration};
use store::Store;
use tokio::sync::oneshot::{self, error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use util::{config::get_config, setup_tracing};
use vendor::{VendorApi, VendorClient, VendorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    if let (Some(git_describe), Some(git_sha), Some(build_timestamp)) = (
        option_env!("VERGEN_GIT_DESCRIBE"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_BUILD_TIMESTAMP"),
    ) {
        info!("Fleetmap {} ({} {})", git_describe, git_sha, build_timestamp);
    }

    let args: Vec<String> = env::args().collect();
    let choice = args.get(1).cloned().unwrap_or_else(|| "all".into());

    let http_addr = get_config().get_string("http_addr")?;
    let store = Store::connect(&get_config().get_string("database_url")?).await?;
    let broadcaster = Arc::new(Broadcaster::new(
        get_config().get_int("listener_buffer")?.try_into()?,
    ));

    let shutdown = CancellationToken::new();
    spawn_ctrl_c_handler(shutdown.clone());

    match choice.as_str() {
        "all" => {
            let vendor: Arc<dyn VendorApi> = Arc::new(vendor_client()?);
            let poll_channel = start_poller(
                vendor.clone(),
                store.clone(),
                broadcaster.clone(),
                shutdown.clone(),
            )?;
            let web_channel =
                start_webserver(store, broadcaster, Some(vendor), http_addr, shutdown.clone());

            tokio::select! {
                res = poll_channel => handle_nested_result(res),
                res = web_channel => handle_nested_result(res),
            }
            shutdown.cancel();
        }
        "poll" => {
            let vendor = Arc::new(vendor_client()?);
            handle_result(start_poller(vendor, store, broadcaster, shutdown)?.await?)
        }
        "web" => {
            // Playback backfill needs the vendor, plain browsing does not.
            let vendor = match vendor_client() {
                Ok(client) => Some(Arc::new(client) as Arc<dyn VendorApi>),
                Err(err) => {
                    warn!("Vendor client unavailable, backfill disabled: {:#}", err);
                    None
                }
            };
            handle_result(start_webserver(store, broadcaster, vendor, http_addr, shutdown).await?)
        }
        _ => println!("Make a valid choice (all, poll, web)"),
    }

    Ok(())
}

fn vendor_client() -> anyhow::Result<VendorClient> {
    let config = get_config();

    let vendor_config = VendorConfig {
        base_url: config.get_string("vendor_base_url")?,
        username: config
            .get_string("vendor_username")
            .context("vendor_username is not configured")?,
        password: config
            .get_string("vendor_password")
            .context("vendor_password is not configured")?,
        timeout: Duration::from_secs(config.get_int("vendor_timeout_secs")?.try_into()?),
        stream: config.get_string("vendor_stream")?,
        page_size: config.get_int("vendor_page_size")?.try_into()?,
        only_connected: config.get_bool("vendor_only_connected")?,
    };

    Ok(VendorClient::new(vendor_config)?)
}

fn spawn_ctrl_c_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(err) => error!("Unable to listen for Ctrl-C: {}", err),
        }
        shutdown.cancel();
    });
}

fn handle_nested_result(res: Result<anyhow::Result<()>, RecvError>) {
    match res {
        Err(err) => {
            error!("An internal error occurred: {:?}", err);
            exit(2)
        }
        Ok(nested) => handle_result(nested),
    }
}

fn handle_result(res: anyhow::Result<()>) {
    if let Err(err) = res {
        error!("An error occurred: {:?}", err);
        exit(1)
    }
}

fn start_webserver(
    store: Store,
    broadcaster: Arc<Broadcaster>,
    vendor: Option<Arc<dyn VendorApi>>,
    http_addr: String,
    shutdown: CancellationToken,
) -> Receiver<anyhow::Result<()>> {
    let (sender, receiver) = oneshot::channel::<anyhow::Result<()>>();
    tokio::spawn(async move {
        let res =
            web_interface::start_server(store, broadcaster, vendor, http_addr, shutdown).await;
        if sender.send(res).is_err() {
            error!("Web server result was not received");
        }
    });
    receiver
}

fn start_poller(
    vendor: Arc<dyn VendorApi>,
    store: Store,
    broadcaster: Arc<Broadcaster>,
    shutdown: CancellationToken,
) -> anyhow::Result<Receiver<anyhow::Result<()>>> {
    let config = PollerConfig {
        interval: Duration::from_secs(get_config().get_int("poll_interval_secs")?.try_into()?),
        concurrency: get_config().get_int("poll_concurrency")?.try_into()?,
    };
    let poller = Poller::new(vendor, store, broadcaster, config);

    let (sender, receiver) = oneshot::channel::<anyhow::Result<()>>();
    tokio::spawn(async move {
        poller.run(shutdown).await;
        if sender.send(Ok(())).is_err() {
            error!("Poller result was not received");
        }
    });
    Ok(receiver)
}
