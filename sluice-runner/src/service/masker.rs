//! Secret masking
//!
//! Replaces every occurrence of a configured secret with an equal-length run
//! of `*`. Multi-line secrets (private keys, certificates) are split into
//! their non-blank trimmed lines and each line is masked on its own.
//!
//! Masking works on whatever chunk it is handed: a secret split across two
//! writes is not masked, so upstream writers must hand over whole lines.

use super::log_buffer::{LogClosed, LogWriter};

/// Writer that masks secrets before forwarding to `inner`
pub struct Masker<W> {
    inner: W,
    secrets: Vec<Vec<u8>>,
}

impl<W: LogWriter> Masker<W> {
    /// Builds the replacement table from secret variable names
    ///
    /// Each name is resolved through `lookup`; unknown or empty values are
    /// skipped.
    pub fn new<F>(inner: W, names: &[String], lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut secrets: Vec<Vec<u8>> = Vec::new();

        for name in names {
            let Some(value) = lookup(name) else {
                continue;
            };
            for fragment in fragments(&value) {
                let fragment = fragment.as_bytes().to_vec();
                if !secrets.contains(&fragment) {
                    secrets.push(fragment);
                }
            }
        }

        Self { inner, secrets }
    }

    /// Number of distinct fragments being masked
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Returns `data` with every secret occurrence masked
    ///
    /// Each fragment is searched independently, overlapping matches
    /// included, and every covered byte becomes `*`. The result therefore
    /// does not depend on the order secrets were configured in.
    pub fn mask(&self, data: &[u8]) -> Vec<u8> {
        let mut covered = vec![false; data.len()];

        for secret in &self.secrets {
            if secret.len() > data.len() {
                continue;
            }
            for (pos, window) in data.windows(secret.len()).enumerate() {
                if window == secret.as_slice() {
                    covered[pos..pos + secret.len()].fill(true);
                }
            }
        }

        data.iter()
            .zip(covered)
            .map(|(byte, hidden)| if hidden { b'*' } else { *byte })
            .collect()
    }
}

impl<W: LogWriter> LogWriter for Masker<W> {
    fn write(&self, data: &[u8]) -> Result<(), LogClosed> {
        if self.secrets.is_empty() {
            return self.inner.write(data);
        }
        self.inner.write(&self.mask(data))
    }
}

/// Splits a secret value into the fragments to search for
///
/// Surrounding whitespace is not part of a fragment; multi-line values
/// yield one fragment per non-blank line.
fn fragments(value: &str) -> Vec<&str> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}
