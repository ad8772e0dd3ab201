//! Translation between canonical history IDs (`hist_tool_<suffix>`) and backend IDs.

use llmux_contracts::{CANONICAL_TOOL_ID_PREFIX, mint_canonical_tool_id};

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolIdFormat {
    /// `<prefix><suffix>`, e.g. `call_` or `toolu_`.
    Prefixed(&'static str),
    /// Exactly `len` ASCII alphanumerics with no prefix.
    FixedAlphanumeric { len: usize },
}

impl ToolIdFormat {
    /// For [`ToolIdFormat::FixedAlphanumeric`], a suffix that is not already `len`
    /// alphanumerics is hashed, so the mapping is one-way for such IDs.
    pub fn to_backend_id(&self, canonical: &str) -> String {
        let canonical = canonical.trim();
        let suffix =
            sanitize(canonical.strip_prefix(CANONICAL_TOOL_ID_PREFIX).unwrap_or(canonical));
        match self {
            Self::Prefixed(prefix) => format!("{prefix}{suffix}"),
            Self::FixedAlphanumeric { len } if is_alphanumeric_of_len(&suffix, *len) => suffix,
            Self::FixedAlphanumeric { len } => hashed_alphanumeric(&suffix, *len),
        }
    }

    /// Unrecognized shapes are kept as opaque suffixes under the canonical prefix.
    ///
    /// Not an inverse of [`Self::to_backend_id`] for fixed-length IDs that had to be
    /// hashed: the result is `hist_tool_<hash>`, not the original canonical ID. Callers
    /// that must pair a backend ID with its history entry map it forward and compare.
    pub fn to_canonical_id(&self, backend: &str) -> String {
        let backend = backend.trim();
        if backend.starts_with(CANONICAL_TOOL_ID_PREFIX) {
            return format!(
                "{CANONICAL_TOOL_ID_PREFIX}{}",
                sanitize(&backend[CANONICAL_TOOL_ID_PREFIX.len()..])
            );
        }
        let suffix = match self {
            Self::Prefixed(prefix) => {
                backend.strip_prefix(prefix).filter(|rest| !rest.is_empty()).unwrap_or(backend)
            }
            Self::FixedAlphanumeric { .. } => backend,
        };
        let suffix = sanitize(suffix);
        if suffix.is_empty() {
            return mint_canonical_tool_id();
        }
        format!("{CANONICAL_TOOL_ID_PREFIX}{suffix}")
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn is_alphanumeric_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn hashed_alphanumeric(source: &str, len: usize) -> String {
    let mut out = String::with_capacity(len);
    let mut round = 0u64;
    while out.len() < len {
        let mut hash = fnv1a(source.as_bytes(), round);
        for _ in 0..10 {
            if out.len() == len {
                break;
            }
            out.push(char::from(ALPHABET[(hash % 62) as usize]));
            hash /= 62;
        }
        round += 1;
    }
    out
}

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    let mut hash = FNV_OFFSET ^ seed.wrapping_mul(FNV_PRIME);
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_formats_round_trip_suffix() {
        for format in [ToolIdFormat::Prefixed("call_"), ToolIdFormat::Prefixed("toolu_")] {
            for canonical in ["hist_tool_abc123", "hist_tool_0f9e-xy_z", "hist_tool_A"] {
                let backend = format.to_backend_id(canonical);
                assert_eq!(format.to_canonical_id(&backend), canonical, "{format:?} {canonical}");
            }
        }
        assert_eq!(ToolIdFormat::Prefixed("toolu_").to_backend_id("hist_tool_42"), "toolu_42");
    }

    #[test]
    fn fixed_format_round_trips_when_suffix_already_fits() {
        let format = ToolIdFormat::FixedAlphanumeric { len: 9 };
        let backend = format.to_backend_id("hist_tool_A1b2C3d4E");
        assert_eq!(backend, "A1b2C3d4E");
        assert_eq!(format.to_canonical_id(&backend), "hist_tool_A1b2C3d4E");
    }

    #[test]
    fn fixed_format_hashes_other_suffixes_deterministically() {
        let format = ToolIdFormat::FixedAlphanumeric { len: 9 };
        let first = format.to_backend_id("hist_tool_5f2c7a10-9b1e-4c55");
        let second = format.to_backend_id("hist_tool_5f2c7a10-9b1e-4c55");
        assert_eq!(first, second);
        assert_eq!(first.len(), 9);
        assert!(first.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(first, format.to_backend_id("hist_tool_other"));
        let long = ToolIdFormat::FixedAlphanumeric { len: 24 };
        assert_eq!(long.to_backend_id("hist_tool_x").len(), 24);

        let back = format.to_canonical_id(&first);
        assert_eq!(back, format!("hist_tool_{first}"));
        assert_ne!(back, "hist_tool_5f2c7a10-9b1e-4c55");
        assert_eq!(format.to_backend_id(&back), first);
    }

    #[test]
    fn unrecognized_backend_ids_are_reprefixed_as_opaque() {
        let format = ToolIdFormat::Prefixed("call_");
        assert_eq!(format.to_canonical_id("toolu_01XYZ"), "hist_tool_toolu_01XYZ");
        assert_eq!(format.to_canonical_id("fn:read/file"), "hist_tool_fn_read_file");
        assert_eq!(format.to_canonical_id("hist_tool_keep"), "hist_tool_keep");
        assert!(format.to_canonical_id("  ").starts_with(CANONICAL_TOOL_ID_PREFIX));
    }

    #[test]
    fn non_canonical_history_ids_still_map_to_backend_shape() {
        assert_eq!(ToolIdFormat::Prefixed("call_").to_backend_id("legacy-id"), "call_legacy-id");
    }
}
