//! Clés du cache et empreintes d'URL

use sha2::{Digest, Sha256};

/// Séparateur entre identifiant logique et variante dans une clé de cache
pub const KEY_SEPARATOR: char = ':';

/// Calcule l'empreinte stable d'une URL source
///
/// SHA256 de l'URL, tronqué aux 16 premiers octets (32 caractères hex).
/// Deux URLs différentes donnent deux empreintes différentes : c'est ce qui
/// permet de détecter qu'une source a tourné sans re-télécharger.
///
/// # Exemple
///
/// ```
/// use pmovideocache::fingerprint_url;
///
/// let fp = fingerprint_url("https://example.com/intro.mp4");
/// assert_eq!(fp.len(), 32);
/// assert_eq!(fp, fingerprint_url("https://example.com/intro.mp4"));
/// ```
pub fn fingerprint_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// Construit la clé interne d'un asset pour une variante de qualité
///
/// Format : `{logical_id}:{variant}`. La variante ne doit pas contenir le
/// séparateur, sinon deux couples différents donneraient la même clé ;
/// [`Catalog::validate`](crate::Catalog::validate) le vérifie au chargement.
pub fn cache_key(logical_id: &str, variant: &str) -> String {
    format!("{logical_id}{KEY_SEPARATOR}{variant}")
}

/// Découpe une clé interne en `(logical_id, variant)`
///
/// La variante est la partie après le dernier séparateur, l'identifiant
/// logique peut donc lui-même contenir des `:`.
pub fn split_cache_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once(KEY_SEPARATOR)
        .filter(|(id, variant)| !id.is_empty() && !variant.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_differs_per_url() {
        let a = fingerprint_url("https://cdn.example.com/v1/intro.mp4");
        let b = fingerprint_url("https://cdn.example.com/v2/intro.mp4");
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cache_key_roundtrip() {
        let key = cache_key("tour:lisbon", "hd");
        assert_eq!(key, "tour:lisbon:hd");
        assert_eq!(split_cache_key(&key), Some(("tour:lisbon", "hd")));
    }

    #[test]
    fn test_split_rejects_malformed() {
        assert_eq!(split_cache_key("no-separator"), None);
        assert_eq!(split_cache_key(":hd"), None);
        assert_eq!(split_cache_key("intro:"), None);
    }
}
