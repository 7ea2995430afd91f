//! Stack-size configuration.

use std::sync::OnceLock;

use crate::stack::page_size;

/// Default usable stack size: 256 Ki machine words.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024 * std::mem::size_of::<usize>();

/// Smallest stack handed to a greenlet.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Environment variable overriding [`DEFAULT_STACK_SIZE`].
///
/// Accepts plain bytes or a `k`/`m` suffix (`512k`, `4m`).
pub const STACK_SIZE_ENV: &str = "GREENSTACK_STACK_SIZE";

/// Runtime knobs shared by every greenlet of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Usable bytes per stack, guard page excluded
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Config {
    /// Reads [`STACK_SIZE_ENV`], falling back to the defaults.
    pub fn from_env() -> Self {
        match std::env::var(STACK_SIZE_ENV) {
            Ok(raw) => match parse_size(&raw) {
                Some(size) => Config::default().with_stack_size(size),
                None => {
                    tracing::warn!(
                        var = STACK_SIZE_ENV,
                        value = %raw,
                        "ignoring unparsable stack size"
                    );
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    /// Sets the stack size, clamped to [`MIN_STACK_SIZE`] and rounded up to
    /// whole pages.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = normalize(size);
        self
    }
}

/// The process-wide configuration, read from the environment once.
pub fn global() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| {
        let config = Config::from_env();
        tracing::debug!(stack_size = config.stack_size, "greenstack configured");
        config
    })
}

pub(crate) fn normalize(size: usize) -> usize {
    let page = page_size();
    let size = size.max(MIN_STACK_SIZE);
    size.checked_next_multiple_of(page).unwrap_or(size)
}

fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, scale) = match raw.char_indices().last()? {
        (i, 'k' | 'K') => (&raw[..i], 1024),
        (i, 'm' | 'M') => (&raw[..i], 1024 * 1024),
        _ => (raw, 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_parse_with_suffixes() {
        assert_eq!(parse_size("65536"), Some(65536));
        assert_eq!(parse_size("512k"), Some(512 * 1024));
        assert_eq!(parse_size(" 4M "), Some(4 * 1024 * 1024));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("k"), None);
    }

    #[test]
    fn small_sizes_are_clamped() {
        let config = Config::default().with_stack_size(1);
        assert!(config.stack_size >= MIN_STACK_SIZE);
        assert_eq!(config.stack_size % page_size(), 0);
    }

    #[test]
    fn default_is_page_aligned() {
        assert_eq!(Config::default().stack_size % page_size(), 0);
    }
}
