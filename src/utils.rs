//! Formatting helpers for the cycle report.

/// Format a count with K/M suffix for compact display.
///
/// # Examples
/// ```
/// use egressguard::utils::format_count;
/// assert_eq!(format_count(500), "500");
/// assert_eq!(format_count(1500), "1.5K");
/// assert_eq!(format_count(1_500_000), "1.5M");
/// ```
pub fn format_count(count: usize) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

/// Format a number with thousands separators (commas).
///
/// # Examples
/// ```
/// use egressguard::utils::format_count_with_separator;
/// assert_eq!(format_count_with_separator(1000), "1,000");
/// assert_eq!(format_count_with_separator(4294967296), "4,294,967,296");
/// ```
pub fn format_count_with_separator(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Pluralize a noun for report lines: `plural(1, "host")` is "1 host".
pub fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1.0K");
        assert_eq!(format_count(999_999), "1000.0K");
        assert_eq!(format_count(1_000_000), "1.0M");
    }

    #[test]
    fn test_format_count_with_separator() {
        assert_eq!(format_count_with_separator(0), "0");
        assert_eq!(format_count_with_separator(999), "999");
        assert_eq!(format_count_with_separator(1234), "1,234");
        assert_eq!(format_count_with_separator(100000), "100,000");
        assert_eq!(format_count_with_separator(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_plural() {
        assert_eq!(plural(0, "port"), "0 ports");
        assert_eq!(plural(1, "port"), "1 port");
        assert_eq!(plural(3, "domain"), "3 domains");
    }
}
