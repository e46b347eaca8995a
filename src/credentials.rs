//! Credential Store: provider name -> API key, read once from the environment.

use std::collections::HashMap;

/// Environment variable holding a provider's key, e.g. `deepseek` ->
/// `DEEPSEEK_API_KEY`.
pub fn key_env_var(provider: &str) -> String {
    let stem: String = provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}_API_KEY")
}

#[derive(Clone, Default)]
pub struct CredentialStore {
    keys: HashMap<String, Option<String>>,
}

impl CredentialStore {
    /// Snapshot the key of every provider. Absent or blank values are kept as
    /// "missing" rather than failing startup.
    pub fn from_env<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = providers
            .into_iter()
            .map(|provider| {
                let provider = provider.as_ref();
                let key = std::env::var(key_env_var(provider))
                    .ok()
                    .filter(|v| !v.trim().is_empty());
                (provider.to_string(), key)
            })
            .collect();
        Self { keys }
    }

    pub fn from_pairs<I, P, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (P, Option<K>)>,
        P: Into<String>,
        K: Into<String>,
    {
        let keys = pairs
            .into_iter()
            .map(|(p, k)| (p.into(), k.map(Into::into).filter(|v: &String| !v.is_empty())))
            .collect();
        Self { keys }
    }

    pub fn credential_for(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).and_then(|k| k.as_deref())
    }

    pub fn is_configured(&self, provider: &str) -> bool {
        self.credential_for(provider).is_some()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (provider, key) in &self.keys {
            map.entry(provider, &key.as_deref().map(mask_key));
        }
        map.finish()
    }
}

/// First four characters followed by an ellipsis, for logs.
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}...")
}
