use std::time::{SystemTime, UNIX_EPOCH};

// 100ns intervals between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

pub fn sector_count_from_size(size: u64, sector_size: u64) -> u64 {
    if size == 0 {
        return 0;
    }

    ((size - 1) / sector_size) + 1
}

/// Returns the last path component of an archived name, accepting
/// both slash kinds as separators.
pub fn plain_name(input: &str) -> &str {
    match input.rfind(|c| c == '\\' || c == '/') {
        Some(index) => &input[index + 1..],
        None => input,
    }
}

/// Archived names use backslashes, but callers may hand in either.
pub fn normalize_name(input: &str) -> String {
    input.replace('/', "\\")
}

pub fn is_internal_name(name: &str) -> bool {
    crate::consts::INTERNAL_FILES
        .iter()
        .any(|internal| internal.eq_ignore_ascii_case(name))
}

/// Current time as a Windows FILETIME.
pub fn filetime_now() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    FILETIME_UNIX_EPOCH + since_epoch.as_secs() * 10_000_000 + u64::from(since_epoch.subsec_nanos()) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_counts() {
        assert_eq!(sector_count_from_size(0, 4096), 0);
        assert_eq!(sector_count_from_size(1, 4096), 1);
        assert_eq!(sector_count_from_size(4096, 4096), 1);
        assert_eq!(sector_count_from_size(16384, 4096), 4);
        assert_eq!(sector_count_from_size(16385, 4096), 5);
    }

    #[test]
    fn plain_names() {
        assert_eq!(plain_name("war3map.j"), "war3map.j");
        assert_eq!(plain_name("Units\\Human\\Footman.mdx"), "Footman.mdx");
        assert_eq!(plain_name("scripts/common.j"), "common.j");
    }

    #[test]
    fn filetime_is_past_2020() {
        // 2020-01-01 as a FILETIME
        assert!(filetime_now() > 132_223_104_000_000_000);
    }
}
