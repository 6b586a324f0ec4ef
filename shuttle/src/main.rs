#![warn(rust_2018_idioms)]

use anyhow::{anyhow, Result};
use futures::future::join_all;
use http::Method;
use structopt::StructOpt;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use h2_shuttle::opt::Opt;
use h2_shuttle::utils::DurationExt;
use h2_shuttle::{BoxedIo, ForwardRequest, ResponseSink, Upgrader, UpstreamResponse};

/// How a probed request ended up being served
enum Served {
    H2(UpstreamResponse),
    Fallback { socket: bool },
    Failed,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();
    let config = opt.config();
    info!(
        enable_h2 = config.enable_h2,
        "probing {} url(s) with connect timeout {}",
        opt.urls.len(),
        config.connect_timeout.autofmt()
    );
    let upgrader = Upgrader::new(config);

    let mut probes = Vec::new();
    for url in opt.urls.iter() {
        let dest = opt
            .destination(url)
            .map_err(|e| anyhow!("{}: {}", url, e))?;
        for _ in 0..opt.repeat {
            let request = ForwardRequest::new(opt.session, Method::GET, url.as_str())
                .with_destination(dest.clone());
            probes.push(probe(&upgrader, request));
        }
    }
    for (url, served) in join_all(probes).await {
        match served {
            Served::H2(mut response) => {
                let mut body = Vec::new();
                let read = response.body.read_to_end(&mut body).await;
                info!(
                    %url,
                    status = response.status.as_u16(),
                    headers = response.headers.len(),
                    body_len = body.len(),
                    complete = read.is_ok(),
                    "served over h2"
                );
            }
            Served::Fallback { socket } => {
                info!(%url, socket, "handed to http/1.x fallback")
            }
            Served::Failed => warn!(%url, "h2 stream failed"),
        }
    }
    Ok(())
}

async fn probe(upgrader: &Upgrader, request: ForwardRequest) -> (String, Served) {
    let url = request.url.clone();
    let t = Instant::now();
    let (response_tx, response_rx) = oneshot::channel::<UpstreamResponse>();
    let (fallback_tx, fallback_rx) = oneshot::channel::<bool>();
    upgrader
        .forward(
            request,
            Box::new(response_tx),
            Box::new(
                move |_request: ForwardRequest,
                      _sink: Box<dyn ResponseSink>,
                      io: Option<BoxedIo>| {
                    let _ = fallback_tx.send(io.is_some());
                },
            ),
        )
        .await;
    // the fallback is dropped unused once the request goes over h2
    let served = match fallback_rx.await {
        Ok(socket) => Served::Fallback { socket },
        Err(_) => match response_rx.await {
            Ok(response) => Served::H2(response),
            Err(_) => Served::Failed,
        },
    };
    info!(%url, "resolved after {}", t.elapsed().autofmt());
    (url, served)
}
