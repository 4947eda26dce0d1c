// Logging setup
//
// env_logger behind the `log` facade. RUST_LOG wins over the configured
// filter. Safe to call more than once; only the first call installs.

use env_logger::{Builder, Target, WriteStyle};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Once;

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter: String,
    /// Send records to `log_file` instead of stderr.
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_to_file: false,
            log_file: "emu_gfx.log".to_string(),
        }
    }
}

impl From<&crate::config::DebugConfig> for LoggingConfig {
    fn from(debug: &crate::config::DebugConfig) -> Self {
        Self {
            filter: debug.log_filter.clone(),
            log_to_file: debug.log_to_file,
            log_file: debug.log_file.clone(),
        }
    }
}

pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or(config.filter.as_str());
        let mut builder = Builder::from_env(env);

        let file_error = if config.log_to_file {
            match open_log_file(Path::new(&config.log_file)) {
                Ok(file) => {
                    write_to_file(&mut builder, file);
                    None
                }
                Err(err) => Some(err),
            }
        } else {
            None
        };

        // try_init: a test harness may already own the logger
        let _ = builder.try_init();

        if let Some(err) = file_error {
            log::warn!("Cannot create log file {}: {}", config.log_file, err);
        }
    });
}

/// Truncates `path` and starts it with a session header.
fn open_log_file(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "=== emu-gfx log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}

fn write_to_file(builder: &mut Builder, file: File) {
    builder
        .target(Target::Pipe(Box::new(file)))
        .write_style(WriteStyle::Never);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig {
            filter: "debug".to_string(),
            ..Default::default()
        };
        init_logging(&config);
        init_logging(&config);
        log::debug!("logging initialized twice without panicking");
    }

    #[test]
    fn file_target_receives_records() {
        use log::{Level, LevelFilter, Log, Record};

        let path = std::env::temp_dir().join(format!("emu_gfx_log_{}.log", std::process::id()));
        let file = open_log_file(&path).unwrap();
        let mut builder = Builder::new();
        builder.filter_level(LevelFilter::Info);
        write_to_file(&mut builder, file);

        let logger = builder.build();
        logger.log(
            &Record::builder()
                .args(format_args!("frame presented"))
                .level(Level::Info)
                .target("emu_gfx")
                .build(),
        );
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(contents.starts_with("=== emu-gfx log ==="));
        assert!(contents.contains("frame presented"));
    }
}
