use crate::error::AppError;
use crate::intensity::IntensitySource;
use crate::models::IntensityReading;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

const SLOT_SECONDS: i64 = 30 * 60;
const MINUTE_FORMAT: &str = "%Y-%m-%dT%H:%MZ";

#[derive(Debug, Deserialize)]
struct IntensityResponse {
    #[serde(default)]
    data: Vec<IntensityRow>,
}

#[derive(Debug, Deserialize)]
struct IntensityRow {
    from: Option<String>,
    #[serde(default)]
    intensity: IntensityValues,
}

#[derive(Debug, Default, Deserialize)]
struct IntensityValues {
    actual: Option<f64>,
    forecast: Option<f64>,
}

/// Client for the GB national grid carbon-intensity API.
pub struct NationalGridClient {
    client: Client,
    base_url: String,
}

impl NationalGridClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, path: &str) -> Result<IntensityResponse, AppError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamUnavailable(format!(
                "carbon intensity API returned HTTP {}",
                status.as_u16()
            )));
        }

        response
            .json::<IntensityResponse>()
            .await
            .map_err(|e| AppError::MalformedResponse(e.to_string()))
    }
}

fn slot_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(SLOT_SECONDS) * SLOT_SECONDS;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

fn parse_from(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, MINUTE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        })
}

/// Actual figure when published, else the forecast.
fn reading_from_row(row: &IntensityRow) -> Option<IntensityReading> {
    let (g_per_kwh, actual) = match (row.intensity.actual, row.intensity.forecast) {
        (Some(v), _) => (v, true),
        (None, Some(v)) => (v, false),
        (None, None) => return None,
    };
    Some(IntensityReading {
        g_per_kwh,
        from: row.from.as_deref().and_then(parse_from),
        actual,
    })
}

fn pick_reading(
    response: &IntensityResponse,
    wanted: Option<DateTime<Utc>>,
) -> Result<IntensityReading, AppError> {
    let readings: Vec<IntensityReading> =
        response.data.iter().filter_map(reading_from_row).collect();

    let chosen = wanted
        .and_then(|slot| readings.iter().find(|r| r.from == Some(slot)))
        .or_else(|| readings.first());

    chosen
        .copied()
        .ok_or_else(|| AppError::MalformedResponse("no intensity value in response".into()))
}

#[async_trait]
impl IntensitySource for NationalGridClient {
    async fn current(&self) -> Result<IntensityReading, AppError> {
        let response = self.fetch("/intensity").await?;
        pick_reading(&response, None)
    }

    async fn at(&self, ts: DateTime<Utc>) -> Result<IntensityReading, AppError> {
        let from = slot_start(ts);
        let to = from + Duration::seconds(SLOT_SECONDS);
        let path = format!(
            "/intensity/{}/{}",
            from.format(MINUTE_FORMAT),
            to.format(MINUTE_FORMAT)
        );
        let response = self.fetch(&path).await?;
        pick_reading(&response, Some(from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(body: &str) -> IntensityResponse {
        serde_json::from_str(body).expect("valid payload")
    }

    #[test]
    fn actual_is_preferred_over_forecast() {
        let body = r#"{"data":[{"from":"2025-06-15T11:30Z","to":"2025-06-15T12:00Z",
            "intensity":{"forecast":190,"actual":174,"index":"moderate"}}]}"#;
        let reading = pick_reading(&parse(body), None).expect("reading");
        assert_eq!(reading.g_per_kwh, 174.0);
        assert!(reading.actual);
        assert_eq!(
            reading.from,
            Utc.with_ymd_and_hms(2025, 6, 15, 11, 30, 0).single()
        );
    }

    #[test]
    fn forecast_is_used_when_actual_is_missing() {
        let body = r#"{"data":[{"from":"2025-06-15T11:30Z","intensity":{"forecast":190,"actual":null}}]}"#;
        let reading = pick_reading(&parse(body), None).expect("reading");
        assert_eq!(reading.g_per_kwh, 190.0);
        assert!(!reading.actual);
    }

    #[test]
    fn empty_data_is_malformed() {
        let err = pick_reading(&parse(r#"{"data":[]}"#), None).expect_err("no rows");
        assert!(matches!(err, AppError::MalformedResponse(_)));

        let err = pick_reading(&parse(r#"{"data":[{"intensity":{}}]}"#), None)
            .expect_err("no values");
        assert!(matches!(err, AppError::MalformedResponse(_)));
    }

    #[test]
    fn range_lookup_prefers_matching_slot() {
        let body = r#"{"data":[
            {"from":"2025-06-15T11:30Z","intensity":{"forecast":100,"actual":101}},
            {"from":"2025-06-15T12:00Z","intensity":{"forecast":200,"actual":202}}]}"#;
        let slot = Utc
            .with_ymd_and_hms(2025, 6, 15, 12, 0, 0)
            .single()
            .expect("valid slot");
        let reading = pick_reading(&parse(body), Some(slot)).expect("reading");
        assert_eq!(reading.g_per_kwh, 202.0);
    }

    #[test]
    fn slot_start_floors_to_half_hour() {
        let ts = Utc
            .with_ymd_and_hms(2025, 6, 15, 12, 47, 13)
            .single()
            .expect("valid ts");
        assert_eq!(
            slot_start(ts),
            Utc.with_ymd_and_hms(2025, 6, 15, 12, 30, 0)
                .single()
                .expect("valid slot")
        );
    }
}
