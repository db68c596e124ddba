use axum::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::CredentialError;

/// Every outbound provider call is bounded by this timeout.
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// One hourly spot price as published by the price provider.
/// Uniquely identified by (price_date, sector, hour).
#[derive(Debug, Clone)]
pub(crate) struct PriceRecord {
    pub(crate) price_date: DateTime<Utc>,
    pub(crate) sector: String,
    pub(crate) currency: String,
    pub(crate) hour: DateTime<Utc>,
    pub(crate) price: f64,
}

/// Snapshot of a metering point as returned by the metering provider.
/// Overwritten wholesale on every successful fetch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MeteringPoint {
    pub(crate) metering_point_id: String,
    #[serde(rename = "typeOfMP")]
    pub(crate) type_of_mp: String,
    #[serde(default)]
    pub(crate) settlement_method: String,
    #[serde(default)]
    pub(crate) meter_reading_occurrence: String,
    #[serde(default)]
    pub(crate) meter_number: String,
    pub(crate) consumer_start_date: DateTime<Utc>,
    #[serde(default)]
    pub(crate) street_code: String,
    #[serde(default)]
    pub(crate) street_name: String,
    #[serde(default)]
    pub(crate) building_number: String,
    #[serde(default)]
    pub(crate) floor_id: String,
    #[serde(default)]
    pub(crate) room_id: String,
    #[serde(default)]
    pub(crate) postcode: String,
    #[serde(default)]
    pub(crate) city_name: String,
    #[serde(default)]
    pub(crate) city_sub_division_name: String,
    #[serde(default)]
    pub(crate) municipality_code: String,
    #[serde(default)]
    pub(crate) location_description: String,
    #[serde(default)]
    pub(crate) first_consumer_party_name: String,
    #[serde(default)]
    pub(crate) second_consumer_party_name: String,
    #[serde(default)]
    pub(crate) balance_supplier_name: String,
    #[serde(default)]
    pub(crate) has_relation: bool,
    #[serde(default, rename = "consumerCVR")]
    pub(crate) consumer_cvr: String,
    #[serde(default, rename = "dataAccessCVR")]
    pub(crate) data_access_cvr: String,
}

/// One hourly meter reading. Uniquely identified by (metering_point_id, hour).
#[derive(Debug, Clone)]
pub(crate) struct TimeSeriesPoint {
    pub(crate) metering_point_id: String,
    pub(crate) measurement_unit: String,
    pub(crate) business_type: String,
    pub(crate) hour: DateTime<Utc>,
    pub(crate) quantity: f64,
    pub(crate) quality: String,
}

#[async_trait]
pub(crate) trait PriceProvider: Send + Sync {
    async fn fetch_prices(&self) -> Result<Vec<PriceRecord>, PriceProviderError>;
}

#[async_trait]
pub(crate) trait MeteringProvider: Send + Sync {
    /// Make sure a valid request token is available for the authenticated calls.
    async fn ensure_request_token(&self) -> Result<(), MeteringProviderError>;

    async fn metering_points(&self) -> Result<Vec<MeteringPoint>, MeteringProviderError>;

    async fn meter_readings(
        &self,
        metering_point_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>, MeteringProviderError>;
}

#[derive(Debug, Clone, Error)]
pub(crate) enum PriceProviderError {
    #[error("price provider responded with status {0}")]
    Provider(u16),
    #[error("failed to fetch prices: {0}")]
    Transport(String),
    #[error("failed to decode price response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Error)]
pub(crate) enum MeteringProviderError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("metering provider responded with status {0}")]
    Provider(u16),
    #[error("failed to reach metering provider: {0}")]
    Transport(String),
    #[error("failed to decode metering response: {0}")]
    Decode(String),
}
