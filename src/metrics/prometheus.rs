use crate::error::AppError;
use crate::metrics::{MetricsBackend, QueryResult, RangeQuery, Series};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

pub struct PrometheusBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl PrometheusBackend {
    pub fn new(client: Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            token,
        }
    }

    /// Accepts a bare host, a host with a path prefix, or a URL already
    /// ending in `/api/v1`.
    fn endpoint(base_url: &str, method: &str) -> Result<String, AppError> {
        let mut parsed = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid metrics.base_url '{base_url}': {e}")))?;
        let prefix = parsed
            .path()
            .trim_end_matches('/')
            .trim_end_matches("/api/v1")
            .to_string();
        parsed.set_path(&format!("{prefix}/api/v1/{method}"));
        Ok(parsed.to_string())
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn fetch(&self, method: &str, params: &[(&str, String)]) -> Result<QueryResult, AppError> {
        let url = Self::endpoint(&self.base_url, method)?;
        let response = self
            .authorize(self.client.get(url).query(params))
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

        if !status.is_success() {
            let reason = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(ToString::to_string))
                .unwrap_or_else(|| status.to_string());
            return Err(AppError::UpstreamUnavailable(format!(
                "HTTP {}: {reason}",
                status.as_u16()
            )));
        }

        parse_response(&body)
    }
}

/// Parses a Prometheus HTTP API payload. A `"status": "error"` body is a
/// backend failure; anything that does not fit the documented shape is
/// reported as `Malformed` rather than guessed at.
pub fn parse_response(body: &str) -> Result<QueryResult, AppError> {
    let payload: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return Ok(QueryResult::Malformed(format!("invalid JSON: {e}"))),
    };

    match payload.get("status").and_then(Value::as_str) {
        Some("success") => {}
        Some("error") => {
            let kind = payload
                .get("errorType")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let msg = payload.get("error").and_then(Value::as_str).unwrap_or("");
            return Err(AppError::UpstreamUnavailable(format!("{kind}: {msg}")));
        }
        _ => return Ok(QueryResult::Malformed("missing status".into())),
    }

    let Some(data) = payload.get("data") else {
        return Ok(QueryResult::Malformed("missing data".into()));
    };
    let result_type = data.get("resultType").and_then(Value::as_str);
    let result = data.get("result");

    let series = match (result_type, result) {
        (Some("matrix"), Some(Value::Array(rows))) => rows
            .iter()
            .map(|row| parse_series(row, "values"))
            .collect::<Option<Vec<_>>>(),
        (Some("vector"), Some(Value::Array(rows))) => rows
            .iter()
            .map(|row| parse_series(row, "value"))
            .collect::<Option<Vec<_>>>(),
        (Some("scalar"), Some(point)) => parse_point(point).map(|sample| {
            vec![Series {
                labels: HashMap::new(),
                samples: vec![sample],
            }]
        }),
        _ => return Ok(QueryResult::Malformed("unexpected result shape".into())),
    };

    Ok(match series {
        Some(series) if series.is_empty() => QueryResult::Empty,
        Some(series) => QueryResult::Matrix(series),
        None => QueryResult::Malformed("unparseable sample".into()),
    })
}

fn parse_series(row: &Value, samples_key: &str) -> Option<Series> {
    let labels = match row.get("metric") {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        None => HashMap::new(),
        Some(_) => return None,
    };

    let raw = row.get(samples_key)?;
    let samples = if samples_key == "value" {
        vec![parse_point(raw)?]
    } else {
        raw.as_array()?
            .iter()
            .map(parse_point)
            .collect::<Option<Vec<_>>>()?
    };

    Some(Series { labels, samples })
}

/// `[<unix seconds as number>, "<value as string>"]`
fn parse_point(point: &Value) -> Option<(i64, f64)> {
    let pair = point.as_array()?;
    if pair.len() != 2 {
        return None;
    }
    let ts = pair[0].as_f64()?.round() as i64;
    let value = match &pair[1] {
        Value::String(raw) => raw.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    Some((ts, value))
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    async fn range_query(&self, query: &RangeQuery) -> Result<QueryResult, AppError> {
        self.fetch(
            "query_range",
            &[
                ("query", query.expr.clone()),
                ("start", query.start.timestamp().to_string()),
                ("end", query.end.timestamp().to_string()),
                ("step", query.step_seconds.to_string()),
            ],
        )
        .await
    }

    async fn instant_query(&self, expr: &str) -> Result<QueryResult, AppError> {
        self.fetch("query", &[("query", expr.to_string())]).await
    }

    async fn probe(&self) -> Result<Option<u16>, AppError> {
        let url = Self::endpoint(&self.base_url, "status/buildinfo")?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Some(status.as_u16()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AppError::Config(
                "Metrics backend rejected credentials (unauthorized).".into(),
            ));
        }

        Err(AppError::UpstreamUnavailable(format!(
            "metrics backend probe failed with HTTP status {status}"
        )))
    }
}
