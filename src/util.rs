use tracing_subscriber::{EnvFilter, fmt};

/// Logs go to stderr; stdout carries nothing but the status line.
pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

/// `1h5m`, `2h`, `45m`; anything under a minute is `0m`.
pub fn format_elapsed(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let hours = total_seconds / 3_600;
    let minutes = (total_seconds % 3_600) / 60;

    if hours > 0 {
        if minutes > 0 {
            format!("{hours}h{minutes}m")
        } else {
            format!("{hours}h")
        }
    } else {
        format!("{minutes}m")
    }
}

/// Compact token count for the context segment; zero reads as `--`.
pub fn format_context_tokens(tokens: u64) -> String {
    if tokens == 0 {
        "--".to_string()
    } else if tokens >= 1_000_000 {
        format!("{}M", tokens / 1_000_000)
    } else if tokens >= 1_000 {
        format!("{}k", tokens / 1_000)
    } else {
        tokens.to_string()
    }
}

pub fn context_percent(tokens: u64, budget: u64) -> u64 {
    if budget == 0 {
        return 0;
    }
    (tokens.saturating_mul(100) / budget).min(100)
}

/// Cuts `input` to at most `max_chars` characters, ending in `...` when
/// something was dropped.
pub fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars <= 3 {
        return input.chars().take(max_chars).collect();
    }
    let kept: String = input.chars().take(max_chars - 3).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(0), "0m");
        assert_eq!(format_elapsed(59), "0m");
        assert_eq!(format_elapsed(2_700), "45m");
        assert_eq!(format_elapsed(7_200), "2h");
        assert_eq!(format_elapsed(3_900), "1h5m");
        assert_eq!(format_elapsed(-30), "0m");
    }

    #[test]
    fn context_token_formatting() {
        assert_eq!(format_context_tokens(0), "--");
        assert_eq!(format_context_tokens(999), "999");
        assert_eq!(format_context_tokens(45_678), "45k");
        assert_eq!(format_context_tokens(2_500_000), "2M");
    }

    #[test]
    fn percent_is_capped() {
        assert_eq!(context_percent(0, 200_000), 0);
        assert_eq!(context_percent(119_999, 200_000), 59);
        assert_eq!(context_percent(160_000, 200_000), 80);
        assert_eq!(context_percent(450_000, 200_000), 100);
        assert_eq!(context_percent(10, 0), 0);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 80), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        assert_eq!(truncate("重構解析器並新增測試", 6), "重構解...");
        assert_eq!(truncate("abcdef", 2), "ab");
    }
}
