// Centralized constants for the CTA engine to avoid magic numbers

/// Default chunk size for chunked blob uploads (4 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default buffer size for streaming digests and copies (64 KiB)
pub const DEFAULT_IO_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of parallel blob copies per artifact
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default maximum number of attempts for caller-level retries
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default initial backoff for requests in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff limit in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// Repository prefix under which component versions are stored
pub const COMPONENT_DESCRIPTOR_REPOSITORY: &str = "component-descriptors";

/// File name of the descriptor inside a component archive and the descriptor layer
pub const COMPONENT_DESCRIPTOR_FILE: &str = "component-descriptor.yaml";

/// Index file of a component transport archive
pub const ARTIFACT_INDEX_FILE: &str = "artifact-index.json";

/// Blob directory of component and transport archives
pub const BLOBS_DIR: &str = "blobs";

/// Default config file name looked up in `$HOME`
pub const DEFAULT_CONFIG_FILE: &str = ".ctaconfig";

/// Default PATH in generated image configs
pub const DEFAULT_IMAGE_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
