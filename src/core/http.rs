use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING};
use reqwest::Client;

use crate::core::config::DownloadConfig;

/// Client shared by every worker of a `Downloader`.
///
/// `Accept-Encoding: identity` keeps transferred byte counts equal to on-disk sizes,
/// which the size check and progress totals rely on.
pub fn build_http_client(config: &DownloadConfig) -> Result<Client, reqwest::Error> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    Client::builder()
        .user_agent(config.user_agent.as_str())
        .default_headers(default_headers)
        .connect_timeout(config.connect_timeout)
        .timeout(config.attempt_timeout)
        .build()
}
