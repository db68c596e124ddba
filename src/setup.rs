use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use url::Url;

use crate::config::{executable_dir, Config};
use crate::credentials::CredentialManager;
use crate::datahub::{DatahubClient, DATAHUB_BASE_URL};
use crate::domain::{MeteringProvider, PriceProvider};
use crate::prices::SpotPriceApi;
use crate::repository::{MeteringRepository, PostgresRepository, PriceRepository};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Everything the polling cycles and the http server need, constructed once
/// at startup. Any failure here means the process cannot do useful work, so
/// it exits non-zero.
pub(crate) struct AppState {
    pub(crate) api_port: u16,
    pub(crate) update_interval: Duration,
    pub(crate) metering_days: u32,
    pub(crate) price_provider: Arc<dyn PriceProvider>,
    pub(crate) metering_provider: Option<Arc<dyn MeteringProvider>>,
    pub(crate) price_repository: Arc<dyn PriceRepository>,
    pub(crate) metering_repository: Arc<dyn MeteringRepository>,
}

pub(crate) async fn setup_app_state() -> AppState {
    let config_path = std::env::var("METERTRACK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| Config::default_path());

    let config = Config::load(&config_path).unwrap_or_else(|e| {
        error!("unable to load the configuration: {}", e);
        process::exit(1);
    });

    let db = setup_db(&config.database.connection_url()).await;

    let repository = Arc::new(PostgresRepository::new(db));

    let prices_url = config.prices_url().unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });

    let price_provider = Arc::new(SpotPriceApi::new(
        prices_url,
        config.prices.days,
        config.prices.sector.clone(),
    ));

    let metering_provider = config
        .metering
        .enabled
        .then(|| resolve_metering_provider(&config));

    AppState {
        api_port: config.api_port,
        update_interval: Duration::from_secs(config.prices.update_interval),
        metering_days: config.metering.days,
        price_provider,
        metering_provider,
        price_repository: repository.clone(),
        metering_repository: repository,
    }
}

/// The application token is validated here; an invalid or expired token
/// requires manual rotation and is not worth starting the cycle for.
fn resolve_metering_provider(config: &Config) -> Arc<dyn MeteringProvider> {
    let base_url = Url::parse(DATAHUB_BASE_URL).expect("the datahub base url is well-formed");

    let credentials = CredentialManager::new(
        &config.metering.token,
        base_url.clone(),
        config.save_request_token,
        executable_dir().join(".requestToken"),
    )
    .unwrap_or_else(|e| {
        error!("unable to use the configured application token: {}", e);
        process::exit(1);
    });

    Arc::new(DatahubClient::new(base_url, Arc::new(credentials)))
}

async fn setup_db(connection_url: &str) -> PgPool {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(connection_url)
        .await
        .unwrap_or_else(|e| {
            error!("failed to connect to the database: {}", e);
            process::exit(1);
        });

    MIGRATOR.run(&pool).await.unwrap_or_else(|e| {
        error!("failed to run migrations: {}", e);
        process::exit(1);
    });

    pool
}
