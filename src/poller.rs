use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::domain::{MeteringProvider, PriceProvider};
use crate::repository::{MeteringRepository, PriceRepository};

/// Fixed delay before a failed cycle step is retried. The cycles run
/// unattended and simply try forever; there is no backoff growth and no
/// retry limit.
pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Fetch spot prices and upsert them, indefinitely. A failed fetch backs off
/// for `RETRY_DELAY` and retries; a failed upsert is logged and the cycle
/// carries on to its normal interval.
pub(crate) async fn poll_prices(
    provider: Arc<dyn PriceProvider>,
    repository: Arc<dyn PriceRepository>,
    interval: Duration,
) {
    loop {
        info!("fetching prices from the price provider");

        let records = match provider.fetch_prices().await {
            Ok(records) => records,
            Err(e) => {
                error!("failed to fetch prices: {}", e);
                sleep(RETRY_DELAY).await;
                continue;
            }
        };

        if let Err(e) = repository.persist_prices(&records).await {
            error!("failed to persist prices: {}", e);
        }

        sleep(interval).await;
    }
}

/// Refresh the request token, snapshot the metering points and pull each
/// point's trailing hourly readings, indefinitely. Any failed step backs off
/// for `RETRY_DELAY` and restarts the cycle from the top; partial progress
/// stands, the next attempt re-upserts everything.
pub(crate) async fn poll_metering(
    provider: Arc<dyn MeteringProvider>,
    repository: Arc<dyn MeteringRepository>,
    interval: Duration,
    lookback_days: u32,
) {
    'cycle: loop {
        info!("refreshing the metering request token");

        if let Err(e) = provider.ensure_request_token().await {
            error!("failed to refresh the request token: {}", e);
            sleep(RETRY_DELAY).await;
            continue;
        }

        let points = match provider.metering_points().await {
            Ok(points) => points,
            Err(e) => {
                error!("failed to fetch metering points: {}", e);
                sleep(RETRY_DELAY).await;
                continue;
            }
        };

        if let Err(e) = repository.persist_metering_points(&points).await {
            error!("failed to persist metering points: {}", e);
            sleep(RETRY_DELAY).await;
            continue;
        }

        for point in &points {
            // readings are published with a delay; stop one hour short of now
            let to = Utc::now() - chrono::Duration::hours(1);
            let from = Utc::now() - chrono::Duration::hours(i64::from(lookback_days) * 24);

            let readings = match provider
                .meter_readings(&point.metering_point_id, from, to)
                .await
            {
                Ok(readings) => readings,
                Err(e) => {
                    error!(
                        "failed to fetch readings for {}: {}",
                        point.metering_point_id, e
                    );
                    sleep(RETRY_DELAY).await;
                    continue 'cycle;
                }
            };

            if readings.is_empty() {
                continue;
            }

            if let Err(e) = repository.persist_time_series(&readings).await {
                error!(
                    "failed to persist readings for {}: {}",
                    point.metering_point_id, e
                );
                sleep(RETRY_DELAY).await;
                continue 'cycle;
            }
        }

        info!("metering cycle complete");

        sleep(interval).await;
    }
}
