fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Log to this file instead of stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let (filter, throttled) = match std::env::var("TANDEM_LOG_FILTER") {
            Ok(filter) => (filter, false),
            Err(_) => default_filter_for(config.level.to_filter()),
        };
        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);
        if throttled {
            tracing::debug!("webrtc and redis internals capped at warn; set TANDEM_TRACE_DEPS=1 to see them");
        }
        Ok(())
    }

    const OWN_TARGETS: &[&str] = &["tandem", "tandem_core", "signal_mailbox", "cipher_envelope"];

    // The webrtc stack logs every STUN binding and SCTP chunk at debug.
    const NOISY_DEP_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_mdns",
        "webrtc_srtp",
        "turn",
        "stun",
        "redis",
    ];

    /// Directive string for `level`, and whether dependency noise was capped.
    pub(crate) fn default_filter_for(level: LevelFilter) -> (String, bool) {
        if level < LevelFilter::DEBUG {
            return (level.to_string().to_lowercase(), false);
        }
        let level_name = level.to_string().to_lowercase();
        let mut directives = vec!["info".to_string()];
        directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level_name}")));
        let throttle = !allow_dependency_traces();
        if throttle {
            directives.extend(NOISY_DEP_TARGETS.iter().map(|target| format!("{target}=warn")));
        }
        (directives.join(","), throttle)
    }

    fn allow_dependency_traces() -> bool {
        super::env_truthy("TANDEM_TRACE_DEPS").unwrap_or(false)
    }

    /// Offset/hex/ascii rendering of a frame for trace output.
    pub fn hexdump(bytes: &[u8]) -> String {
        const WIDTH: usize = 16;
        let mut out = String::new();
        for (i, chunk) in bytes.chunks(WIDTH).enumerate() {
            use std::fmt::Write as _;
            let _ = write!(out, "{:08x}  ", i * WIDTH);
            for byte in chunk {
                let _ = write!(out, "{byte:02x} ");
            }
            for _ in chunk.len()..WIDTH {
                out.push_str("   ");
            }
            out.push(' ');
            out.extend(chunk.iter().map(|&byte| {
                if (0x20..=0x7e).contains(&byte) {
                    byte as char
                } else {
                    '.'
                }
            }));
            out.push('\n');
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn debug_filter_throttles_webrtc_internals() {
            let (filter, throttled) = default_filter_for(LevelFilter::DEBUG);
            if throttled {
                assert!(filter.contains("webrtc_ice=warn"));
            }
            assert!(filter.contains("tandem_core=debug"));
        }

        #[test]
        fn quiet_levels_are_passed_through() {
            assert_eq!(default_filter_for(LevelFilter::WARN), ("warn".to_string(), false));
        }

        #[test]
        fn hexdump_renders_printable_tail() {
            let dump = hexdump(b"hi\x00");
            assert!(dump.starts_with("00000000  68 69 00 "));
            assert!(dump.trim_end().ends_with("hi."));
        }

        #[test]
        fn trace_level_opens_our_crates_only() {
            let (filter, _) = default_filter_for(LogLevel::Trace.to_filter());
            assert!(filter.starts_with("info,"));
            assert!(filter.contains("signal_mailbox=trace"));
            assert_eq!(LogLevel::default(), LogLevel::Warn);
        }
    }
}
