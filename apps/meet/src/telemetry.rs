pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    /// Crates whose trace output drowns the session logs.
    const NOISY_DEPENDENCIES: &[&str] = &[
        "hyper",
        "hyper_util",
        "reqwest",
        "rustls",
        "tokio_tungstenite",
        "tungstenite",
        "webrtc",
        "webrtc_dtls",
        "webrtc_ice",
        "webrtc_mdns",
        "webrtc_sctp",
        "webrtc_srtp",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Raw `EnvFilter` directives; replaces everything derived from `level`.
        pub filter: Option<String>,
        /// Keeps dependency output at trace when `level` is trace.
        pub trace_dependencies: bool,
    }

    impl LogConfig {
        /// Filter directives for this config, plus whether dependency output
        /// was clamped to info.
        fn directives(&self) -> (String, bool) {
            if let Some(filter) = &self.filter {
                return (filter.clone(), false);
            }
            let ours = |level: &str| format!("info,meet={level},meet_signaling={level}");
            let base = match self.level {
                LogLevel::Error => "error".to_owned(),
                LogLevel::Warn => "warn".to_owned(),
                LogLevel::Info => "info".to_owned(),
                LogLevel::Debug => ours("debug"),
                LogLevel::Trace => ours("trace"),
            };
            if self.level < LogLevel::Trace || self.trace_dependencies {
                return (base, false);
            }
            let clamped = NOISY_DEPENDENCIES
                .iter()
                .fold(base, |directives, target| format!("{directives},{target}=info"));
            (clamped, true)
        }
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
        let (directives, clamped) = config.directives();
        let (writer, guard) = match &config.file {
            Some(path) => open_log_file(path)?,
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        if clamped {
            tracing::info!(
                "dependency trace output clamped to info; pass --trace-deps or --log-filter to override"
            );
        }
        Ok(())
    }

    fn open_log_file(path: &Path) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }

}
