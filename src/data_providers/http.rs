use std::error::Error;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use cache_control::CacheControl;
use reqwest::header::{HeaderName, HeaderValue, CACHE_CONTROL};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use crate::data_providers::data_provider::{DataLoadResult, DataProvider};
use crate::error::{ErrorKind, ProviderError};

/// Turns an HTTP response into cacheable data
pub trait HttpDataExtractor<Data>: Send + Sync + 'static {
    fn extract(&self, response: reqwest::Response) -> impl Future<Output = Result<DataLoadResult<Data>, ProviderError>> + Send;
}

/// Loads `{base_url}/{key}` with GET.
///
/// With the `json` feature it also writes values back with a JSON `PUT` to the same URL.
pub struct HttpDataProvider<Data, Extractor: HttpDataExtractor<Data>> {
    extractor: Extractor,
    client: reqwest::Client,
    base_url: Url,
    _data: PhantomData<fn() -> Data>,
}

impl<Data, Extractor: HttpDataExtractor<Data>> HttpDataProvider<Data, Extractor> {
    pub fn new(client: reqwest::Client, base_url: Url, extractor: Extractor) -> Self {
        HttpDataProvider {
            extractor,
            client,
            base_url,
            _data: PhantomData,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of the resource behind `key`; the key is appended as one escaped path segment
    pub fn url_for<K: Display>(&self, key: &K) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::permanent(format!("base url '{}' cannot have path segments", self.base_url)))?
            .pop_if_empty()
            .push(&key.to_string());
        Ok(url)
    }
}

impl<K, Data, Extractor> DataProvider<K, Data> for HttpDataProvider<Data, Extractor>
where
    K: Display + Send + Sync,
    Data: Send + 'static,
    Extractor: HttpDataExtractor<Data>,
{
    async fn load_data(&self, key: &K) -> Result<DataLoadResult<Data>, ProviderError> {
        let url = self.url_for(key)?;
        let response = self.client.get(url).send().await.map_err(classify_reqwest)?;
        let response = check_status(response)?;
        self.extractor.extract(response).await
    }
}

#[cfg(feature = "json")]
impl<K, Data, Extractor> crate::data_providers::data_provider::DataWriter<K, Data> for HttpDataProvider<Data, Extractor>
where
    K: Display + Send + Sync,
    Data: serde::Serialize + Send + Sync + 'static,
    Extractor: HttpDataExtractor<Data>,
{
    async fn write_data(&self, key: &K, value: &Data) -> Result<(), ProviderError> {
        let url = self.url_for(key)?;
        let body = serde_json::to_vec(value)
            .map_err(|e| ProviderError::permanent("failed to encode request body").with_source(e))?;
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        check_status(response).map(|_| ())
    }
}

/// Classify an HTTP status that is not a success
pub fn classify_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Auth,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ErrorKind::Transient,
        s if s.is_server_error() => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

/// Classify a transport-level reqwest failure
pub fn classify_reqwest(err: reqwest::Error) -> ProviderError {
    let kind = if let Some(status) = err.status() {
        classify_status(status)
    } else if err.is_builder() || err.is_decode() || err.is_redirect() {
        ErrorKind::Permanent
    } else {
        // connect, timeout, broken body: all worth another attempt
        ErrorKind::Transient
    };
    ProviderError::new(kind, err.to_string()).with_source(err)
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(ProviderError::new(
        classify_status(status),
        format!("{} responded with {status}", response.url()),
    ))
}

#[derive(Debug, Error)]
pub enum DataExtractionError {
    #[error("header '{0}' is not present in response, but is required to correctly extract data")]
    HeaderNotFound(HeaderName),
    #[error("header {0}: {1} could not be parsed")]
    HeaderParseError(HeaderName, String),
    /// Optional feature name can be provided
    #[error("unsupported content type: {0}{hint}", hint = feature_hint(.1))]
    UnsupportedContentType(String, Option<&'static str>),
    #[error("failed to parse response body with Content-Type: {0}")]
    ContentParseError(String, #[source] Box<dyn Error + Send + Sync>),
}

fn feature_hint(feature: &Option<&'static str>) -> String {
    match feature {
        Some(feature) => format!(" (supported only with feature '{feature}', which is disabled)"),
        None => String::new(),
    }
}

impl From<DataExtractionError> for ProviderError {
    fn from(value: DataExtractionError) -> Self {
        ProviderError::permanent(value.to_string()).with_source(value)
    }
}

pub fn parse_cache_control(h: &HeaderValue) -> Result<CacheControl, DataExtractionError> {
    let s = h
        .to_str()
        .map_err(|_| DataExtractionError::HeaderParseError(CACHE_CONTROL, "<NON_ASCII_DATA>".to_string()))?;
    CacheControl::from_value(s).ok_or_else(|| DataExtractionError::HeaderParseError(CACHE_CONTROL, s.to_string()))
}

#[cfg(feature = "serde")]
pub mod serde_extractor {
    use std::marker::PhantomData;
    use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
    use reqwest::Response;
    use serde::de::DeserializeOwned;
    use crate::data_providers::data_provider::DataLoadResult;
    use crate::data_providers::http::{classify_reqwest, parse_cache_control, HttpDataExtractor};
    use crate::data_providers::http::DataExtractionError::{self, HeaderNotFound, HeaderParseError};
    use crate::error::ProviderError;

    /// Decodes the body according to `Content-Type` and takes freshness from `Cache-Control`.
    ///
    /// A missing `Cache-Control` header leaves freshness to the cache's `stale_time`.
    pub struct SerdeDataExtractor<Data: DeserializeOwned> {
        _data: PhantomData<fn() -> Data>,
    }

    impl<Data: DeserializeOwned> Default for SerdeDataExtractor<Data> {
        fn default() -> Self {
            SerdeDataExtractor { _data: PhantomData }
        }
    }

    impl<Data: DeserializeOwned + Send + 'static> HttpDataExtractor<Data> for SerdeDataExtractor<Data> {
        async fn extract(&self, response: Response) -> Result<DataLoadResult<Data>, ProviderError> {
            let (max_age, must_revalidate) = match response.headers().get(CACHE_CONTROL) {
                Some(header) => {
                    let cache_control = parse_cache_control(header)?;
                    (cache_control.max_age, cache_control.must_revalidate)
                }
                None => (None, false),
            };
            let mime = response
                .headers()
                .get(CONTENT_TYPE)
                .ok_or(HeaderNotFound(CONTENT_TYPE))?
                .to_str()
                .map_err(|_| HeaderParseError(CONTENT_TYPE, "<NON_ASCII_DATA>".to_string()))?
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();

            let body = response.bytes().await.map_err(classify_reqwest)?;
            let data = decode::<Data>(&mime, &body)?;
            Ok(DataLoadResult {
                data,
                must_revalidate,
                max_age,
            })
        }
    }

    #[allow(unused_variables)]
    fn decode<Data: DeserializeOwned>(mime: &str, body: &[u8]) -> Result<Data, DataExtractionError> {
        let parse_error = |e: Box<dyn std::error::Error + Send + Sync>| DataExtractionError::ContentParseError(mime.to_owned(), e);
        match mime {
            "application/json" => {
                #[cfg(not(feature = "json"))]
                return Err(DataExtractionError::UnsupportedContentType(mime.to_owned(), Some("json")));

                #[cfg(feature = "json")]
                return serde_json::from_slice::<Data>(body).map_err(|e| parse_error(Box::new(e)));
            }
            // NOTE: as of 21.06.2024 no MIME type for TOML is registered officially
            "application/toml" => {
                #[cfg(not(feature = "toml"))]
                return Err(DataExtractionError::UnsupportedContentType(mime.to_owned(), Some("toml")));

                #[cfg(feature = "toml")]
                {
                    let txt = std::str::from_utf8(body).map_err(|e| parse_error(Box::new(e)))?;
                    return toml::from_str::<Data>(txt).map_err(|e| parse_error(Box::new(e)));
                }
            }
            "application/yaml" | "application/x-yaml" => {
                #[cfg(not(feature = "yaml"))]
                return Err(DataExtractionError::UnsupportedContentType(mime.to_owned(), Some("yaml")));

                #[cfg(feature = "yaml")]
                return serde_yaml::from_slice::<Data>(body).map_err(|e| parse_error(Box::new(e)));
            }
            "application/xml" | "text/xml" => {
                #[cfg(not(feature = "xml"))]
                return Err(DataExtractionError::UnsupportedContentType(mime.to_owned(), Some("xml")));

                #[cfg(feature = "xml")]
                return serde_xml_rs::from_reader(body).map_err(|e| parse_error(Box::new(e)));
            }
            other => Err(DataExtractionError::UnsupportedContentType(other.to_owned(), None)),
        }
    }

}
