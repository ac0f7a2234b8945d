use std::time::Duration;

/// Blocking HTTP access used by the source fetcher.
pub trait HttpClientPort: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpGetResult, String>;
}

#[derive(Clone, Debug)]
pub struct HttpGetResult {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl HttpGetResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
