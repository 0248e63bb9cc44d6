use crate::{UploadError, UploadResult};

/// Prefix of the environment variables read by [`UploadConfig::from_env`].
pub const ENV_PREFIX: &str = "DOG_UPLOAD__";

/// Configuration for staging and uploading a batch
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Prepended to every save name when listing and writing keys
    pub key_prefix: Option<String>,

    /// Resolver attempt ceiling applied to the batch; the batch keeps its own
    /// ceiling when `None`
    pub max_name_attempts: Option<u32>,

    /// Writes in flight for `upload_concurrent` when the caller passes 0
    pub max_in_flight: usize,

    /// Chunk size used when turning a source stream into a byte stream
    pub read_chunk_size: usize,

    /// Quality of re-encoded JPEG output (1-100)
    pub jpeg_quality: u8,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            key_prefix: None,
            max_name_attempts: None,
            max_in_flight: 4,
            read_chunk_size: 64 * 1024, // 64KB
            jpeg_quality: 90,
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key prefix
    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the resolver attempt ceiling
    pub fn with_max_name_attempts(mut self, attempts: u32) -> Self {
        self.max_name_attempts = Some(attempts);
        self
    }

    /// Set the default number of writes in flight
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Set the stream read chunk size
    pub fn with_read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes;
        self
    }

    /// Set the JPEG quality used by image normalization
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Full store key for a save name
    pub fn key_for(&self, save_name: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}{}", prefix, save_name),
            None => save_name.to_string(),
        }
    }

    /// Load overrides from `DOG_UPLOAD__*` environment variables.
    ///
    /// ```bash
    /// export DOG_UPLOAD__KEY_PREFIX=uploads/
    /// export DOG_UPLOAD__MAX_NAME_ATTEMPTS=500
    /// ```
    pub fn from_env() -> UploadResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through an arbitrary key lookup. Keys are the full
    /// variable names, e.g. `DOG_UPLOAD__MAX_IN_FLIGHT`.
    pub fn from_lookup<F>(lookup: F) -> UploadResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(prefix) = get("KEY_PREFIX") {
            config.key_prefix = Some(prefix);
        }
        if let Some(value) = get("MAX_NAME_ATTEMPTS") {
            config.max_name_attempts = Some(parse_number("MAX_NAME_ATTEMPTS", &value)?);
        }
        if let Some(value) = get("MAX_IN_FLIGHT") {
            config.max_in_flight = parse_number("MAX_IN_FLIGHT", &value)?;
        }
        if let Some(value) = get("READ_CHUNK_SIZE") {
            config.read_chunk_size = parse_number("READ_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = get("JPEG_QUALITY") {
            config.jpeg_quality = parse_number("JPEG_QUALITY", &value)?;
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> UploadResult<T> {
    value.trim().parse().map_err(|_| {
        UploadError::invalid(format!("{}{} must be a number, got {:?}", ENV_PREFIX, name, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.max_name_attempts, None);
        assert_eq!(config.max_in_flight, 4);
        assert!(config.key_prefix.is_none());
        assert_eq!(config.key_for("a.txt"), "a.txt");
    }

    #[test]
    fn test_lookup_overrides() {
        let config = UploadConfig::from_lookup(lookup_from(&[
            ("DOG_UPLOAD__KEY_PREFIX", "uploads/"),
            ("DOG_UPLOAD__MAX_NAME_ATTEMPTS", "25"),
            ("DOG_UPLOAD__JPEG_QUALITY", " 70 "),
        ]))
        .unwrap();

        assert_eq!(config.key_for("a.txt"), "uploads/a.txt");
        assert_eq!(config.max_name_attempts, Some(25));
        assert_eq!(config.jpeg_quality, 70);
        assert_eq!(config.read_chunk_size, 64 * 1024);
    }

    #[test]
    fn test_lookup_rejects_garbage() {
        let err = UploadConfig::from_lookup(lookup_from(&[("DOG_UPLOAD__MAX_IN_FLIGHT", "many")]))
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput { .. }));
    }
}
