use reqwest::Proxy;

use crate::DownloadError;

/// Kind of proxy server to route requests through
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// URL handed to reqwest. SOCKS5 proxies get a scheme when none was given.
    fn normalized_url(&self) -> String {
        match self.proxy_type {
            ProxyType::Socks5
                if !self.url.starts_with("socks5://") && !self.url.starts_with("socks5h://") =>
            {
                format!("socks5://{}", self.url)
            }
            _ => self.url.clone(),
        }
    }
}

pub fn build_proxy(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let url = config.normalized_url();
    let proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(&url),
        ProxyType::Https => Proxy::https(&url),
        ProxyType::Socks5 => Proxy::all(&url),
    }
    .map_err(|e| DownloadError::proxy_configuration(format!("invalid proxy URL {url}: {e}")))?;

    Ok(match &config.auth {
        Some(auth) => proxy.basic_auth(&auth.username, &auth.password),
        None => proxy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_scheme_is_added() {
        let config = ProxyConfig {
            url: "127.0.0.1:1080".to_string(),
            proxy_type: ProxyType::Socks5,
            auth: None,
        };
        assert_eq!(config.normalized_url(), "socks5://127.0.0.1:1080");

        let explicit = ProxyConfig {
            url: "socks5h://127.0.0.1:1080".to_string(),
            ..config
        };
        assert_eq!(explicit.normalized_url(), "socks5h://127.0.0.1:1080");
    }

    #[test]
    fn http_proxy_builds() {
        let config = ProxyConfig {
            url: "http://proxy.example.com:8080".to_string(),
            proxy_type: ProxyType::Http,
            auth: Some(ProxyAuth {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
        };
        assert!(build_proxy(&config).is_ok());
    }
}
