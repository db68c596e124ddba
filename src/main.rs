use dotenv::dotenv;
use log::info;

mod config;
mod credentials;
mod datahub;
mod domain;
mod http;
mod poller;
mod prices;
mod repository;
mod setup;

const APP_NAME: &str = "metertrack";

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    info!("Starting {}", APP_NAME);

    let state = setup::setup_app_state().await;

    tokio::spawn(poller::poll_prices(
        state.price_provider.clone(),
        state.price_repository.clone(),
        state.update_interval,
    ));

    match &state.metering_provider {
        Some(provider) => {
            tokio::spawn(poller::poll_metering(
                provider.clone(),
                state.metering_repository.clone(),
                state.update_interval,
                state.metering_days,
            ));
        }
        None => info!("metering data fetching is disabled"),
    }

    http::start_http_server(state.api_port).await.unwrap();

    info!("Shutting down {}", APP_NAME);
}
