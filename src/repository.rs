use axum::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::domain::{MeteringPoint, PriceRecord, TimeSeriesPoint};

#[derive(Debug, Clone, Error)]
pub(crate) enum RepositoryError {
    #[error("the records could not be persisted: {0}")]
    Persistence(String),
}

#[async_trait]
pub(crate) trait PriceRepository: Send + Sync {
    async fn persist_prices(&self, prices: &[PriceRecord]) -> Result<(), RepositoryError>;
}

#[async_trait]
pub(crate) trait MeteringRepository: Send + Sync {
    async fn persist_metering_points(
        &self,
        points: &[MeteringPoint],
    ) -> Result<(), RepositoryError>;

    async fn persist_time_series(
        &self,
        readings: &[TimeSeriesPoint],
    ) -> Result<(), RepositoryError>;
}

/// Upsert-by-natural-key persistence. Each record is committed on its own;
/// re-running a cycle overwrites rather than duplicates.
#[derive(Clone, Debug)]
pub(crate) struct PostgresRepository {
    db: PgPool,
}

impl PostgresRepository {
    pub(crate) fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PriceRepository for PostgresRepository {
    async fn persist_prices(&self, prices: &[PriceRecord]) -> Result<(), RepositoryError> {
        info!("persisting {} prices", prices.len());

        for price in prices {
            sqlx::query(
                "insert into price_data (price_date, sector, currency, hour, price) \
                 values ($1, $2, $3, $4, $5) \
                 on conflict (price_date, sector, hour) \
                 do update set currency = excluded.currency, price = excluded.price",
            )
            .bind(price.price_date)
            .bind(&price.sector)
            .bind(&price.currency)
            .bind(price.hour)
            .bind(price.price)
            .execute(&self.db)
            .await
            .map_err(|e| RepositoryError::Persistence(e.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl MeteringRepository for PostgresRepository {
    async fn persist_metering_points(
        &self,
        points: &[MeteringPoint],
    ) -> Result<(), RepositoryError> {
        info!("persisting {} metering points", points.len());

        for point in points {
            sqlx::query(
                "insert into metering_point (metering_point_id, type_of_mp, settlement_method, \
                 meter_reading_occurrence, meter_number, consumer_start_date, street_code, \
                 street_name, building_number, floor_id, room_id, postcode, city_name, \
                 city_sub_division_name, municipality_code, location_description, \
                 first_consumer_party_name, second_consumer_party_name, balance_supplier_name, \
                 has_relation, consumer_cvr, data_access_cvr) \
                 values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                 $17, $18, $19, $20, $21, $22) \
                 on conflict (metering_point_id) \
                 do update set type_of_mp = excluded.type_of_mp, \
                 settlement_method = excluded.settlement_method, \
                 meter_reading_occurrence = excluded.meter_reading_occurrence, \
                 meter_number = excluded.meter_number, \
                 consumer_start_date = excluded.consumer_start_date, \
                 street_code = excluded.street_code, \
                 street_name = excluded.street_name, \
                 building_number = excluded.building_number, \
                 floor_id = excluded.floor_id, \
                 room_id = excluded.room_id, \
                 postcode = excluded.postcode, \
                 city_name = excluded.city_name, \
                 city_sub_division_name = excluded.city_sub_division_name, \
                 municipality_code = excluded.municipality_code, \
                 location_description = excluded.location_description, \
                 first_consumer_party_name = excluded.first_consumer_party_name, \
                 second_consumer_party_name = excluded.second_consumer_party_name, \
                 balance_supplier_name = excluded.balance_supplier_name, \
                 has_relation = excluded.has_relation, \
                 consumer_cvr = excluded.consumer_cvr, \
                 data_access_cvr = excluded.data_access_cvr",
            )
            .bind(&point.metering_point_id)
            .bind(&point.type_of_mp)
            .bind(&point.settlement_method)
            .bind(&point.meter_reading_occurrence)
            .bind(&point.meter_number)
            .bind(point.consumer_start_date)
            .bind(&point.street_code)
            .bind(&point.street_name)
            .bind(&point.building_number)
            .bind(&point.floor_id)
            .bind(&point.room_id)
            .bind(&point.postcode)
            .bind(&point.city_name)
            .bind(&point.city_sub_division_name)
            .bind(&point.municipality_code)
            .bind(&point.location_description)
            .bind(&point.first_consumer_party_name)
            .bind(&point.second_consumer_party_name)
            .bind(&point.balance_supplier_name)
            .bind(point.has_relation)
            .bind(&point.consumer_cvr)
            .bind(&point.data_access_cvr)
            .execute(&self.db)
            .await
            .map_err(|e| RepositoryError::Persistence(e.to_string()))?;
        }

        Ok(())
    }

    async fn persist_time_series(
        &self,
        readings: &[TimeSeriesPoint],
    ) -> Result<(), RepositoryError> {
        info!("persisting {} hourly readings", readings.len());

        for reading in readings {
            sqlx::query(
                "insert into metering_time_series (metering_point_id, measurement_unit, \
                 business_type, hour, quantity, quality) \
                 values ($1, $2, $3, $4, $5, $6) \
                 on conflict (metering_point_id, hour) \
                 do update set measurement_unit = excluded.measurement_unit, \
                 business_type = excluded.business_type, \
                 quantity = excluded.quantity, \
                 quality = excluded.quality",
            )
            .bind(&reading.metering_point_id)
            .bind(&reading.measurement_unit)
            .bind(&reading.business_type)
            .bind(reading.hour)
            .bind(reading.quantity)
            .bind(&reading.quality)
            .execute(&self.db)
            .await
            .map_err(|e| RepositoryError::Persistence(e.to_string()))?;
        }

        Ok(())
    }
}
