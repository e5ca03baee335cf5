use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

/// Initialize logging to a daily file under `<home>/logs/`, named
/// `app-YYYY-MM-DD.log`. The file for the day is chosen at startup.
/// `RUST_LOG` controls the filter as usual.
pub fn init(home_dir: &Path) -> io::Result<()> {
    let logs_dir = home_dir.join("logs");
    fs::create_dir_all(&logs_dir)?;

    let file_name = format!("app-{}.log", Local::now().format("%Y-%m-%d"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(file_name))?;

    let _ = env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(file)))
        .try_init();
    Ok(())
}
