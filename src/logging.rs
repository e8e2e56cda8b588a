use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

pub const LOG_FILE_NAME: &str = "deal-batcher.log";

/// Writes every log line to the log file and, unless suppressed, to stdout.
#[derive(Clone)]
pub(crate) struct TeeMakeWriter {
    pub file: Option<Arc<Mutex<File>>>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct TeeWriter {
    file: Option<Arc<Mutex<File>>>,
    suppress_stdout: bool,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            // best effort
            let _ = file.write_all(buf);
        }
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let _ = file.flush();
        }
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. Interactive commands pass
/// `suppress_stdout` so log lines do not tear through prompts.
pub(crate) fn init(logs_dir: &Path, debug: bool, suppress_stdout: bool) {
    let file = open_log_file(logs_dir).map(|f| Arc::new(Mutex::new(f)));
    let make_writer = TeeMakeWriter {
        file,
        suppress_stdout,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn open_log_file(logs_dir: &Path) -> Option<File> {
    std::fs::create_dir_all(logs_dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(LOG_FILE_NAME))
        .ok()
}
