use std::path::Path;

pub fn write_pid_file(dir: &Path) -> anyhow::Result<()> {
    persist(&dir.join("PID"), &std::process::id().to_string())
}

pub fn write_version_file(dir: &Path) -> anyhow::Result<()> {
    persist(&dir.join("VERSION"), env!("CARGO_PKG_VERSION"))
}

fn persist(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
