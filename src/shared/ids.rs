use chrono::Utc;

const SUFFIX_LEN: usize = 6;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Mints a run id of the shape `YYYYMMDDTHHMMSSZ-<6 lowercase alphanumeric>`.
pub fn mint_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    format!("{timestamp}-{}", random_suffix())
}

fn random_suffix() -> String {
    let mut bytes = [0u8; SUFFIX_LEN];
    if getrandom::getrandom(&mut bytes).is_err() {
        // Fall back to a clock-derived suffix when the entropy source is
        // unavailable; uniqueness still holds within a workspace in practice.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = ((nanos >> (i * 4)) & 0xff) as u8;
        }
    }
    bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect()
}

pub fn is_valid_run_id(raw: &str) -> bool {
    let Some((timestamp, suffix)) = raw.split_once('-') else {
        return false;
    };
    if timestamp.len() != 16 || !timestamp.ends_with('Z') || timestamp.as_bytes()[8] != b'T' {
        return false;
    }
    if !timestamp[..8].bytes().all(|b| b.is_ascii_digit())
        || !timestamp[9..15].bytes().all(|b| b.is_ascii_digit())
    {
        return false;
    }
    suffix.len() == SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_run_ids_match_the_documented_shape() {
        let id = mint_run_id();
        assert!(is_valid_run_id(&id), "unexpected run id shape: {id}");
    }

    #[test]
    fn run_id_validation_rejects_malformed_values() {
        assert!(!is_valid_run_id("20250101T000000Z"));
        assert!(!is_valid_run_id("20250101T000000Z-ABC123"));
        assert!(!is_valid_run_id("2025-01-01-abcdef"));
        assert!(is_valid_run_id("20250101T000000Z-a1b2c3"));
    }
}
