//! Opaque cursor tokens
//!
//! A cursor encodes the last sort key of a page (JSON, then URL-safe base64).
//! The empty string starts a scan and marks its end.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StorageError};

pub fn encode<K: Serialize>(key: &K) -> Result<String> {
    let json = serde_json::to_vec(key)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a cursor; `None` for the empty cursor
pub fn decode<K: DeserializeOwned>(cursor: &str) -> Result<Option<K>> {
    if cursor.is_empty() {
        return Ok(None);
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| StorageError::invalid(format!("malformed cursor {cursor:?}: {e}")))?;
    let key = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::invalid(format!("malformed cursor {cursor:?}: {e}")))?;
    Ok(Some(key))
}

/// Cut a lookahead fetch (`n + 1` rows) down to one page
///
/// The next cursor is empty exactly when no row follows the page.
pub fn finish_page<T, K, F>(mut rows: Vec<T>, n: usize, key_of: F) -> Result<(String, Vec<T>)>
where
    K: Serialize,
    F: Fn(&T) -> K,
{
    if rows.len() <= n {
        return Ok((String::new(), rows));
    }
    rows.truncate(n);
    let next = match rows.last() {
        Some(last) => encode(&key_of(last))?,
        None => String::new(),
    };
    Ok((next, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_round_trip_composite_key() {
        let key = ("like".to_string(), "u/1".to_string(), "i?2".to_string());
        let token = encode(&key).unwrap();
        assert!(!token.contains('/'));
        let back: Option<(String, String, String)> = decode(&token).unwrap();
        assert_eq!(back, Some(key));
    }

    #[test]
    fn test_empty_cursor_starts_scan() {
        let key: Option<String> = decode("").unwrap();
        assert!(key.is_none());
    }

    #[test]
    fn test_malformed_cursor_is_invalid_argument() {
        let result: Result<Option<String>> = decode("%%%");
        assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_finish_page_lookahead() {
        let (next, page) = finish_page(vec![1, 2, 3], 2, |v| *v).unwrap();
        assert_eq!(page, vec![1, 2]);
        assert_eq!(decode::<i32>(&next).unwrap(), Some(2));

        let (next, page) = finish_page(vec![1, 2], 2, |v| *v).unwrap();
        assert_eq!(page, vec![1, 2]);
        assert!(next.is_empty());
    }
}
