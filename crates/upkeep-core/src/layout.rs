use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn var_dir(&self) -> PathBuf {
        self.root.join("var")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.var_dir().join("locks")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.locks_dir().join("update.lock")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.var_dir().join("cache")
    }

    pub fn state_path(&self) -> PathBuf {
        self.cache_dir().join("update_state.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.var_dir().join("log")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.var_dir().join("backups")
    }

    pub fn backup_path(&self, stamp: &str) -> PathBuf {
        self.backups_dir().join(format!("db_{stamp}.sql"))
    }

    pub fn public_dir(&self) -> PathBuf {
        self.root.join("public")
    }

    pub fn vendor_dir(&self) -> PathBuf {
        self.root.join("vendor")
    }

    pub fn composer_json_path(&self) -> PathBuf {
        self.root.join("composer.json")
    }

    pub fn composer_lock_path(&self) -> PathBuf {
        self.root.join("composer.lock")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("upkeep.toml")
    }

    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.root.join(relative)
        }
    }

    /// Directories the web application must be able to read and write.
    pub fn critical_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.var_dir(),
            self.cache_dir(),
            self.log_dir(),
            self.public_dir(),
            self.vendor_dir(),
        ]
    }
}
