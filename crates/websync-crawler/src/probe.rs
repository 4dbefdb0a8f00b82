use std::time::SystemTime;

use anyhow::Result;
use reqwest::header::{HeaderMap, LAST_MODIFIED, USER_AGENT};
use url::Url;

/// `HEAD` the url and report its `Last-Modified` timestamp.
///
/// `None` means the server didn't expose a usable timestamp; callers treat
/// that as always-download.
pub async fn last_modified(
    client: &reqwest::Client,
    user_agent: &str,
    url: &Url,
) -> Result<Option<SystemTime>> {
    let resp = client
        .head(url.clone())
        .header(USER_AGENT, user_agent)
        .send()
        .await?
        .error_for_status()?;
    Ok(header_mtime(resp.headers()))
}

pub(crate) fn header_mtime(headers: &HeaderMap) -> Option<SystemTime> {
    headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn header_mtime_parses_http_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LAST_MODIFIED,
            HeaderValue::from_static("Mon, 02 Jan 2023 00:00:00 GMT"),
        );
        let expected = UNIX_EPOCH + Duration::from_secs(1672617600);
        assert_eq!(header_mtime(&headers), Some(expected));
    }

    #[test]
    fn missing_or_garbled_header_is_unknown() {
        assert_eq!(header_mtime(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(LAST_MODIFIED, HeaderValue::from_static("not a date"));
        assert_eq!(header_mtime(&headers), None);
    }
}
