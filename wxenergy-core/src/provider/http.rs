use anyhow::Context;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;

use crate::error::SourceError;

/// Shared HTTP client with a per-request timeout.
pub fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("wxenergy/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Send `request` and return the body of a successful response.
pub async fn get_text(request: RequestBuilder) -> Result<String, SourceError> {
    let res = request.send().await?;
    let status = res.status();
    let body = res.text().await?;

    if !status.is_success() {
        return Err(SourceError::from_status(status.as_u16(), &body));
    }

    Ok(body)
}

/// Parse the leading `YYYY-MM-DD` of a date or datetime string.
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%m/%d/%Y"))
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y%m%d"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_day_accepts_common_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 7, 1);
        assert_eq!(parse_day("2024-07-01"), expected);
        assert_eq!(parse_day("2024-07-01T00:00:00"), expected);
        assert_eq!(parse_day("07/01/2024"), expected);
        assert_eq!(parse_day("20240701"), expected);
        assert_eq!(parse_day("yesterday"), None);
    }
}
