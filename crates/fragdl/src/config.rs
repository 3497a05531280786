use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::fragment::retry::RetryPolicy;
use crate::paths::PathSanitizer;
use crate::proxy::ProxyConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Segments whose declared length is at or under this size are buffered in memory.
pub const DEFAULT_SEGMENT_MEMORY_LIMIT: u64 = 2 * 1024 * 1024;

/// Maximum chunk copied per read when streaming between backends.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// HTTP client options
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for the entire HTTP request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Custom query parameters for requests
    pub params: Vec<(String, String)>,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            params: Vec::new(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }
}

/// Policy for the fragment orchestrator.
#[derive(Debug, Clone)]
pub struct FragmentConfig {
    /// Number of fragments fetched concurrently. Appends are always serial.
    pub concurrent_fragment_downloads: usize,

    /// Retry behavior for a single fragment request.
    pub fragment_retry: RetryPolicy,

    /// Retry behavior for decryption key requests.
    pub key_retry: RetryPolicy,

    /// Timeout for one fragment request.
    pub fragment_timeout: Duration,

    /// Timeout for one key request.
    pub key_timeout: Duration,

    /// When false, every fragment failure aborts the download.
    pub skip_unavailable_fragments: bool,

    /// Keep per-fragment temp files after they were appended.
    pub keep_fragments: bool,

    /// Resume from the bookkeeping file and partial output when present.
    pub continue_download: bool,

    /// Never read or write the bookkeeping file.
    pub disable_bookkeeping: bool,

    /// Sleep before each fragment request.
    pub fragment_interval: Duration,

    /// Minimum delay between two `downloading` progress events.
    pub progress_interval: Duration,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            concurrent_fragment_downloads: 1,
            fragment_retry: RetryPolicy {
                max_retries: 10,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                jitter: true,
            },
            key_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                jitter: true,
            },
            fragment_timeout: Duration::from_secs(60),
            key_timeout: Duration::from_secs(15),
            skip_unavailable_fragments: true,
            keep_fragments: false,
            continue_download: true,
            disable_bookkeeping: false,
            fragment_interval: Duration::ZERO,
            progress_interval: Duration::from_millis(100),
        }
    }
}

/// Policy for the segment assembly engine.
#[derive(Clone)]
pub struct AssemblyConfig {
    /// Resume from an existing state file and sequence files.
    pub resume: bool,

    /// Segments at or under this declared size are buffered in memory.
    pub segment_memory_limit: u64,

    /// Maximum number of segments merged into one sequence file (None = unlimited).
    pub max_segments_per_sequence: Option<u64>,

    /// Chunk size used when copying between backends.
    pub copy_buffer_size: usize,

    /// Minimum delay between two `downloading` progress events.
    pub progress_interval: Duration,

    /// Hook applied to every on-disk path before it is opened.
    pub sanitizer: PathSanitizer,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            resume: true,
            segment_memory_limit: DEFAULT_SEGMENT_MEMORY_LIMIT,
            max_segments_per_sequence: None,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            progress_interval: Duration::from_millis(100),
            sanitizer: PathSanitizer::default(),
        }
    }
}

impl std::fmt::Debug for AssemblyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyConfig")
            .field("resume", &self.resume)
            .field("segment_memory_limit", &self.segment_memory_limit)
            .field("max_segments_per_sequence", &self.max_segments_per_sequence)
            .field("copy_buffer_size", &self.copy_buffer_size)
            .field("progress_interval", &self.progress_interval)
            .finish_non_exhaustive()
    }
}
