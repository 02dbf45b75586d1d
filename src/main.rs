use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

mod api;
mod args;
mod auth;
mod backend;
mod coin;
mod credentials;
mod gate;
mod ledger;
mod routes;
mod session;
mod time;
mod transaction;
mod user;

use args::Args;
use coin::TmsaCoin;

#[tokio::main]
async fn main() -> ExitCode {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "tmsacoin=info,warn");
    }
    pretty_env_logger::init();

    let args = Args::parse();

    let addr = match args.addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("couldn't parse address: {e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match backend::open(args.data_dir()).await {
        Ok(store) => store,
        Err(e) => {
            error!("couldn't open {}: {e}", args.data_dir().display());
            return ExitCode::FAILURE;
        }
    };
    let coin = Arc::new(TmsaCoin::new(store, args.session_ttl()));

    for username in args.admins() {
        if coin.promote(username).await.is_err() {
            return ExitCode::FAILURE;
        }
    }

    // mismatches are logged as they're found, serving continues regardless
    if args.audit() && coin.audit().await.is_err() {
        return ExitCode::FAILURE;
    }

    if let Some(interval) = args.reap_interval() {
        let coin = Arc::clone(&coin);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if coin.reap_sessions().await.is_err() {
                    error!("session reaper failed, retrying in {}s", interval.as_secs());
                }
            }
        });
    }

    let routes = routes::routes(coin, args.secure());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("couldn't wait for ctrl-c: {e}");
        }
        info!("shutting down");
    };

    match warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown) {
        Ok((addr, server)) => {
            info!("listening on {addr}");
            server.await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("couldn't bind to {addr}: {e}");
            ExitCode::FAILURE
        }
    }
}
