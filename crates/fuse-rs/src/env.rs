use std::env;
use std::sync::OnceLock;

pub const DISABLE_FUSION_VAR: &str = "FUSE_RS_DISABLE_FUSION";
pub const DUMP_VAR: &str = "FUSE_RS_DUMP";
pub const CACHE_CAPACITY_VAR: &str = "FUSE_RS_PARTITION_CACHE_CAPACITY";
pub const CACHE_FAILED_COMPILES_VAR: &str = "FUSE_RS_CACHE_FAILED_COMPILES";

static FUSE_RS_DUMP: OnceLock<bool> = OnceLock::new();

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    let value = env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<usize>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(var = name, value = trimmed, "ignoring non-numeric value");
            None
        }
    }
}

pub(crate) fn dump_enabled() -> bool {
    *FUSE_RS_DUMP.get_or_init(|| env_bool(DUMP_VAR).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?} should be truthy");
        }
        for value in ["0", "false", "off", "maybe", ""] {
            assert!(!parse_bool(value), "{value:?} should be falsy");
        }
    }
}
