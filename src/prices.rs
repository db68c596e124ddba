use axum::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::info;
use reqwest::Client;
use serde_derive::Deserialize;
use tracing::warn;
use url::Url;

use crate::domain::{PriceProvider, PriceProviderError, PriceRecord, HTTP_TIMEOUT};

/// Client for the unauthenticated spot-price API.
#[derive(Clone, Debug)]
pub(crate) struct SpotPriceApi {
    client: Client,
    url: Url,
    days: u32,
    sector: String,
}

impl SpotPriceApi {
    pub(crate) fn new(url: Url, days: u32, sector: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("failed to build http client"),
            url,
            days,
            sector,
        }
    }
}

#[async_trait]
impl PriceProvider for SpotPriceApi {
    async fn fetch_prices(&self) -> Result<Vec<PriceRecord>, PriceProviderError> {
        info!("fetching spot prices, {} day window", self.days);

        let response = self
            .client
            .get(self.url.clone())
            .query(&[
                ("days", self.days.to_string()),
                ("sector", self.sector.clone()),
            ])
            .send()
            .await
            .map_err(|e| PriceProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PriceProviderError::Provider(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PriceProviderError::Transport(e.to_string()))?;

        let documents = serde_json::from_str::<Vec<SpotPriceDocument>>(&body)
            .map_err(|e| PriceProviderError::Decode(e.to_string()))?;

        let records = documents
            .iter()
            .flat_map(SpotPriceDocument::records)
            .collect::<Vec<PriceRecord>>();

        info!("fetched {} hourly prices", records.len());

        Ok(records)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SpotPriceDocument {
    #[serde(rename = "PriceDate")]
    price_date: DateTime<Utc>,
    #[serde(rename = "Sector")]
    sector: String,
    #[serde(rename = "Currency")]
    currency: String,
    #[serde(rename = "DisplayPrices")]
    display_prices: Vec<DisplayPrice>,
}

#[derive(Debug, Clone, Deserialize)]
struct DisplayPrice {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Value")]
    value: f64,
}

impl SpotPriceDocument {
    /// One record per display price; `Time` is the hour offset from the
    /// document's price date.
    fn records(&self) -> Vec<PriceRecord> {
        self.display_prices
            .iter()
            .filter_map(|price| match price.time.parse::<i64>() {
                Ok(offset) => Some(PriceRecord {
                    price_date: self.price_date,
                    sector: self.sector.clone(),
                    currency: self.currency.clone(),
                    hour: self.price_date + Duration::hours(offset),
                    price: price.value,
                }),
                Err(_) => {
                    warn!("skipping price with unusable hour offset {:?}", price.time);
                    None
                }
            })
            .collect()
    }
}
