use crate::error::ExportError;

/// Normalize an upstream trace id to 16 OTLP bytes: strip dashes, truncate
/// to the first 32 hex chars, left-pad with zeros when shorter.
pub fn normalize_trace_id(raw: &str) -> Result<[u8; 16], ExportError> {
    let bytes = normalize_hex(raw, 32)?;
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes);
    Ok(id)
}

/// Normalize an upstream span id to 8 OTLP bytes: strip dashes, keep the
/// first 16 hex chars, left-pad with zeros when shorter. Never hashed.
pub fn normalize_span_id(raw: &str) -> Result<[u8; 8], ExportError> {
    let bytes = normalize_hex(raw, 16)?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes);
    Ok(id)
}

fn normalize_hex(raw: &str, width: usize) -> Result<Vec<u8>, ExportError> {
    let stripped: String = raw.chars().filter(|c| *c != '-').collect();
    let padded = if stripped.len() > width {
        stripped[..width].to_string()
    } else {
        format!("{stripped:0>width$}")
    };
    hex::decode(&padded).map_err(|_| ExportError::InvalidId(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashes_are_stripped() {
        let id = normalize_trace_id("1322f09d-baee-4241-a45d-a4ee78dc199f").unwrap();
        assert_eq!(hex::encode(id), "1322f09dbaee4241a45da4ee78dc199f");
    }

    #[test]
    fn long_span_id_is_truncated_not_hashed() {
        let id = normalize_span_id("aaaaaaaaaaaaaaaabbbbbbbb").unwrap();
        assert_eq!(hex::encode(id), "aaaaaaaaaaaaaaaa");
    }

    #[test]
    fn short_span_id_is_left_padded() {
        let id = normalize_span_id("abcd").unwrap();
        assert_eq!(hex::encode(id), "000000000000abcd");
    }

    #[test]
    fn invalid_hex_is_rejected() {
        assert!(matches!(
            normalize_span_id("not-hex-at-all!!"),
            Err(ExportError::InvalidId(_))
        ));
    }

    #[test]
    fn exact_width_ids_pass_through() {
        let trace = normalize_trace_id("1322f09dbaee4241a45da4ee78dc199f").unwrap();
        assert_eq!(hex::encode(trace), "1322f09dbaee4241a45da4ee78dc199f");
        let span = normalize_span_id("aaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(hex::encode(span), "aaaaaaaaaaaaaaaa");
    }
}
