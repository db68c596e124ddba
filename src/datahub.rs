use axum::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::info;
use reqwest::Client;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::credentials::CredentialManager;
use crate::domain::{
    MeteringPoint, MeteringProvider, MeteringProviderError, TimeSeriesPoint, HTTP_TIMEOUT,
};

/// Production host of the metering datahub.
pub(crate) const DATAHUB_BASE_URL: &str = "https://api.eloverblik.dk/customerapi/";

/// Client for the bearer-authenticated metering datahub. Stateless request
/// builders only; retrying is the caller's concern.
pub(crate) struct DatahubClient {
    client: Client,
    base_url: Url,
    credentials: Arc<CredentialManager>,
}

impl DatahubClient {
    pub(crate) fn new(base_url: Url, credentials: Arc<CredentialManager>) -> Self {
        Self {
            client: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("failed to build http client"),
            base_url,
            credentials,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, MeteringProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| MeteringProviderError::Transport(e.to_string()))
    }
}

#[async_trait]
impl MeteringProvider for DatahubClient {
    async fn ensure_request_token(&self) -> Result<(), MeteringProviderError> {
        Ok(self.credentials.ensure_request_token(false).await?)
    }

    async fn metering_points(&self) -> Result<Vec<MeteringPoint>, MeteringProviderError> {
        info!("fetching metering points");

        let token = self.credentials.request_token().await?;

        let response = self
            .client
            .get(self.endpoint("api/meteringpoints/meteringpoints")?)
            .query(&[("includeAll", "true")])
            .header("accept", "application/json")
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| MeteringProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MeteringProviderError::Provider(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MeteringProviderError::Transport(e.to_string()))?;

        let parsed = serde_json::from_str::<MeteringPointsResponse>(&body)
            .map_err(|e| MeteringProviderError::Decode(e.to_string()))?;

        info!("fetched {} metering points", parsed.result.len());

        Ok(parsed.result)
    }

    async fn meter_readings(
        &self,
        metering_point_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>, MeteringProviderError> {
        let from = from.format("%Y-%m-%d").to_string();
        let to = to.format("%Y-%m-%d").to_string();

        info!(
            "fetching hourly readings for {} between {} and {}",
            metering_point_id, from, to
        );

        let token = self.credentials.request_token().await?;

        let request = TimeSeriesRequest {
            metering_points: TimeSeriesRequestIds {
                metering_point: vec![metering_point_id],
            },
        };

        let response = self
            .client
            .post(self.endpoint(&format!(
                "api/meterdata/gettimeseries/{}/{}/Hour",
                from, to
            ))?)
            .header("accept", "application/json")
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| MeteringProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MeteringProviderError::Provider(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MeteringProviderError::Transport(e.to_string()))?;

        let parsed = serde_json::from_str::<TimeSeriesResponse>(&body)
            .map_err(|e| MeteringProviderError::Decode(e.to_string()))?;

        let readings = flatten_time_series(parsed)?;

        info!("fetched {} hourly readings", readings.len());

        Ok(readings)
    }
}

#[derive(Debug, Deserialize)]
struct MeteringPointsResponse {
    result: Vec<MeteringPoint>,
}

#[derive(Debug, Serialize)]
struct TimeSeriesRequest<'a> {
    #[serde(rename = "meteringPoints")]
    metering_points: TimeSeriesRequestIds<'a>,
}

#[derive(Debug, Serialize)]
struct TimeSeriesRequestIds<'a> {
    #[serde(rename = "meteringPoint")]
    metering_point: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesResponse {
    result: Vec<TimeSeriesDocument>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesDocument {
    #[serde(rename = "MyEnergyData_MarketDocument")]
    market_document: MarketDocument,
}

#[derive(Debug, Deserialize)]
struct MarketDocument {
    #[serde(rename = "TimeSeries", default)]
    time_series: Vec<TimeSeries>,
}

#[derive(Debug, Deserialize)]
struct TimeSeries {
    #[serde(rename = "mRID")]
    metering_point_id: String,
    #[serde(rename = "businessType", default)]
    business_type: String,
    #[serde(rename = "measurement_Unit.name", default)]
    measurement_unit: String,
    #[serde(rename = "Period", default)]
    periods: Vec<TimeSeriesPeriod>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesPeriod {
    #[serde(rename = "timeInterval")]
    time_interval: TimeSeriesInterval,
    #[serde(rename = "Point", default)]
    points: Vec<TimeSeriesWirePoint>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesInterval {
    start: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesWirePoint {
    position: String,
    #[serde(rename = "out_Quantity.quantity")]
    quantity: String,
    #[serde(rename = "out_Quantity.quality")]
    quality: String,
}

/// Flatten the nested market document into one reading per hour. Positions
/// are 1-based hour offsets within their period.
fn flatten_time_series(
    response: TimeSeriesResponse,
) -> Result<Vec<TimeSeriesPoint>, MeteringProviderError> {
    let mut readings = Vec::new();

    for document in response.result {
        for series in document.market_document.time_series {
            for period in series.periods {
                let start = period.time_interval.start;

                for point in period.points {
                    let position = point.position.parse::<i64>().map_err(|e| {
                        MeteringProviderError::Decode(format!(
                            "unusable point position {:?}: {}",
                            point.position, e
                        ))
                    })?;

                    let quantity = point.quantity.parse::<f64>().map_err(|e| {
                        MeteringProviderError::Decode(format!(
                            "unusable point quantity {:?}: {}",
                            point.quantity, e
                        ))
                    })?;

                    readings.push(TimeSeriesPoint {
                        metering_point_id: series.metering_point_id.clone(),
                        measurement_unit: series.measurement_unit.clone(),
                        business_type: series.business_type.clone(),
                        hour: start + Duration::hours(position - 1),
                        quantity,
                        quality: point.quality,
                    });
                }
            }
        }
    }

    Ok(readings)
}
