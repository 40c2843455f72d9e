use std::fs::{self, File};
use std::io::{self, Read, SeekFrom, Write};

use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncBufReadExt as _, AsyncSeekExt as _, BufReader as AsyncBufReader};

use log::{Level, Log, Metadata, Record};

use crate::constants::{LOG_LEVEL, LOG_PATH};

pub use log::{debug, error, info, trace, warn};

const MAX_TAIL_LINES: usize = 200;

/// Appends every record to the shared log file, optionally echoed to stdout/stderr
pub struct Logger {
    name: &'static str,
    path: &'static str,
    use_stdout_stderr: bool,
}

impl Logger {
    pub const fn new(name: &'static str, use_stdout_stderr: bool) -> Self {
        Self {
            name,
            path: LOG_PATH,
            use_stdout_stderr,
        }
    }

    pub fn init(&'static self) -> Result<(), log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(LOG_LEVEL);

        Ok(())
    }

    /// If tail specified, prints the last x lines too before awaiting the next lines
    pub async fn follow(&self, tail: Option<usize>) -> io::Result<()> {
        println!("Waiting for log content, press CTRL+C or send SIGINT to exit");

        if tail.is_some() {
            self.print(tail)?;
        }

        let file = AsyncFile::open(self.path).await?;
        let mut reader = AsyncBufReader::new(file);

        reader.seek(SeekFrom::End(0)).await?;

        loop {
            let mut line = String::new();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    // Gracefully and implicitly drops file handles
                    return Ok(());
                }
                result = reader.read_line(&mut line) => {
                    match result? {
                        0 => tokio::time::sleep(std::time::Duration::from_millis(200)).await,
                        _ => print!("{line}"),
                    }
                }
            };
        }
    }

    pub fn print(&self, tail: Option<usize>) -> io::Result<()> {
        let mut content = String::new();
        match File::open(self.path) {
            Ok(mut file) => {
                file.read_to_string(&mut content)?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        }

        if let Some(tail) = tail.map(|v| v.min(MAX_TAIL_LINES)) {
            let lines = content.lines().collect::<Vec<_>>();
            let start = lines.len().saturating_sub(tail);
            lines[start..].iter().for_each(|line| println!("{line}"));

            return Ok(());
        }

        print!("{content}");

        Ok(())
    }

    pub fn purge(&self) -> io::Result<()> {
        if !fs::exists(self.path)? {
            return Ok(());
        }

        File::options().write(true).truncate(true).open(self.path)?;

        Ok(())
    }

    fn format(&self, record: &Record) -> String {
        format!(
            "[{}]<{}> {}: {}\n",
            self.name,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let content = format!("{}\n", record.args());
        if self.use_stdout_stderr {
            match record.level() {
                Level::Error | Level::Warn => eprint!("{content}"),
                _ => print!("{content}"),
            }
        }

        let written = File::options()
            .create(true)
            .append(true)
            .open(self.path)
            .and_then(|mut file| file.write_all(self.format(record).as_bytes()));

        if let Err(err) = written {
            if self.use_stdout_stderr {
                eprintln!("Cannot write to log file {}: {err}", self.path);
            }
        }
    }

    fn flush(&self) {}
}
