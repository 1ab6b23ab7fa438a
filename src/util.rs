//! Utility functions and macros for debugging

/// Debug log line stamped with wall-clock milliseconds and the calling thread's name.
///
/// Pipeline stages run on named threads, so this is the quickest way to see
/// how ingestion, synthesis and playback interleave.
#[macro_export]
macro_rules! tdbg {
    ($($arg:tt)*) => {{
        use std::time::{SystemTime, UNIX_EPOCH};
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        tracing::debug!(
            "[{:>13} ms][{}] {}",
            ms,
            std::thread::current().name().unwrap_or("unnamed"),
            format_args!($($arg)*)
        );
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_tdbg_expands_outside_a_subscriber() {
        crate::tdbg!("sentence {}:{}", 0, 1);
    }
}
